//! Scaler seams between the policy engine and the things it scales.
//!
//! The engine only knows [`TargetScaler`]: "bring this policy's target from
//! `current` to `target` and hand me the operation that tracks it".
//! Compute targets (cdc-worker, trino, risingwave) plug in a
//! [`ComputeScaler`] through [`ComputeTargetScaler`], which records a
//! `ScalingOperation` for every call so they share the node pools' audit
//! trail and single-active-operation guard.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use flowscale_state::{
    OperationState, ScalingOperation, ScalingPolicy, StateStore, TargetType, TenantContext,
};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AutoscaleError, AutoscaleResult};

/// What the engine asks a scaler to do.
#[derive(Debug, Clone, Copy)]
pub struct ScaleRequest<'a> {
    pub policy: &'a ScalingPolicy,
    pub current: u32,
    pub target: u32,
    pub reason: &'a str,
}

/// Carries out a committed scaling decision.
///
/// Returns the operation tracking the change; it may still be in flight.
/// An `Err` (or a `failed` operation) means nothing was started and the
/// engine must not advance policy state.
#[async_trait]
pub trait TargetScaler: Send + Sync {
    async fn scale(&self, ctx: &TenantContext, request: ScaleRequest<'_>) -> AutoscaleResult<ScalingOperation>;
}

/// Sets the replica count of a compute target.
#[async_trait]
pub trait ComputeScaler: Send + Sync {
    async fn set_replicas(
        &self,
        ctx: &TenantContext,
        target_type: TargetType,
        target_id: Option<Uuid>,
        replicas: u32,
    ) -> anyhow::Result<()>;
}

/// [`TargetScaler`] for compute targets, recording each call as an operation.
pub struct ComputeTargetScaler {
    store: StateStore,
    inner: Arc<dyn ComputeScaler>,
}

impl ComputeTargetScaler {
    pub fn new(store: StateStore, inner: Arc<dyn ComputeScaler>) -> Self {
        Self { store, inner }
    }
}

#[async_trait]
impl TargetScaler for ComputeTargetScaler {
    async fn scale(&self, ctx: &TenantContext, request: ScaleRequest<'_>) -> AutoscaleResult<ScalingOperation> {
        let policy = request.policy;
        let mut op = ScalingOperation::pending(
            ctx.tenant_id,
            policy.target_key(),
            request.current,
            request.target,
            Utc::now(),
        );
        op.policy_id = Some(policy.id);
        self.store.insert_operation_if_idle(ctx, &op)?;

        let transition = |op: &mut ScalingOperation, next| {
            op.transition_to(next, Utc::now())
                .map_err(|e| AutoscaleError::Conflict(e.to_string()))
        };
        transition(&mut op, OperationState::InProgress)?;
        self.store.put_operation(ctx, &op)?;

        match self
            .inner
            .set_replicas(ctx, policy.target_type, policy.target_id, request.target)
            .await
        {
            Ok(()) => {
                transition(&mut op, OperationState::Completed)?;
                self.store.put_operation(ctx, &op)?;
                info!(
                    operation = %op.id,
                    target = %op.target_key,
                    from = request.current,
                    to = request.target,
                    "compute target scaled"
                );
                Ok(op)
            }
            Err(e) => {
                let message = format!("{e:#}");
                op.fail(message.clone(), Utc::now())
                    .map_err(|e| AutoscaleError::Conflict(e.to_string()))?;
                self.store.put_operation(ctx, &op)?;
                warn!(operation = %op.id, target = %op.target_key, error = %message, "compute scaling failed");
                Err(AutoscaleError::Provider(message))
            }
        }
    }
}

/// In-process [`ComputeScaler`] that remembers the last replica count per
/// target. Used by standalone mode and tests.
#[derive(Default)]
pub struct InMemoryComputeScaler {
    replicas: Mutex<HashMap<String, u32>>,
    failing: AtomicBool,
}

impl InMemoryComputeScaler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent calls fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn replicas(&self, target_key: &str) -> Option<u32> {
        self.replicas.lock().await.get(target_key).copied()
    }
}

#[async_trait]
impl ComputeScaler for InMemoryComputeScaler {
    async fn set_replicas(
        &self,
        ctx: &TenantContext,
        target_type: TargetType,
        target_id: Option<Uuid>,
        replicas: u32,
    ) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("compute backend unavailable");
        }
        let key = flowscale_state::target_key(target_type, target_id);
        self.replicas
            .lock()
            .await
            .insert(format!("{}/{key}", ctx.tenant_id), replicas);
        Ok(())
    }
}
