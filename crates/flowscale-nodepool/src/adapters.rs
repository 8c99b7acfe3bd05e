//! Plug the node pool manager into the policy engine's seams.
//!
//! `nodes` policies name their pool in `target_id`. [`NodePoolScaler`]
//! turns their decisions into pool operations and
//! [`CapacityMetricsProvider`] feeds them cluster capacity as metrics.

use std::sync::Arc;

use async_trait::async_trait;
use flowscale_autoscale::{AutoscaleError, AutoscaleResult, MetricsProvider, ScaleRequest, TargetScaler};
use flowscale_state::{MetricsSnapshot, PoolId, ScalingOperation, ScalingPolicy, TenantContext};
use tracing::debug;

use crate::manager::{NodePoolManager, ScaleOptions};

fn pool_of(policy: &ScalingPolicy) -> AutoscaleResult<PoolId> {
    policy.target_id.ok_or_else(|| {
        AutoscaleError::Validation(format!("policy {} has no node pool target", policy.id))
    })
}

/// [`TargetScaler`] for `nodes` policies.
pub struct NodePoolScaler {
    manager: Arc<NodePoolManager>,
}

impl NodePoolScaler {
    pub fn new(manager: Arc<NodePoolManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl TargetScaler for NodePoolScaler {
    async fn scale(&self, ctx: &TenantContext, request: ScaleRequest<'_>) -> AutoscaleResult<ScalingOperation> {
        let pool_id = pool_of(request.policy)?;
        let options = ScaleOptions {
            allow_zero: request.policy.scale_to_zero,
            policy_id: Some(request.policy.id),
        };
        debug!(pool = %pool_id, target = request.target, reason = request.reason, "policy scaling node pool");
        let op = self
            .manager
            .scale_pool_with(ctx, &pool_id, i64::from(request.target), false, options)
            .await?;
        Ok(op)
    }
}

/// Cluster capacity as metrics for `nodes` policies.
///
/// Values: `ready_nodes`, `pending_pods`, `unschedulable_pods`,
/// `cpu_allocation_percent`, `memory_allocation_percent` (tenant-wide over
/// enabled pools) and `pool_nodes` (pending + ready nodes of the target
/// pool).
pub struct CapacityMetricsProvider {
    manager: Arc<NodePoolManager>,
}

impl CapacityMetricsProvider {
    pub fn new(manager: Arc<NodePoolManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl MetricsProvider for CapacityMetricsProvider {
    async fn snapshot(&self, ctx: &TenantContext, policy: &ScalingPolicy) -> AutoscaleResult<MetricsSnapshot> {
        let pool_id = pool_of(policy)?;
        let capacity = self
            .manager
            .get_cluster_capacity(ctx)
            .await
            .map_err(|e| AutoscaleError::Metrics(e.to_string()))?;
        let pool = self
            .manager
            .get_pool_status(ctx, &pool_id)
            .map_err(|e| AutoscaleError::Metrics(e.to_string()))?;

        Ok(MetricsSnapshot::new(policy.target_key(), capacity.observed_at)
            .with("ready_nodes", f64::from(capacity.ready_nodes))
            .with("pending_pods", f64::from(capacity.pending_pods))
            .with("unschedulable_pods", f64::from(capacity.unschedulable_pods))
            .with("cpu_allocation_percent", capacity.cpu_allocation_percent)
            .with("memory_allocation_percent", capacity.memory_allocation_percent)
            .with("pool_nodes", f64::from(pool.serving())))
    }
}
