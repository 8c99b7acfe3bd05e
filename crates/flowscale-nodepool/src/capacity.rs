//! Cluster capacity aggregation and per-pool status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use flowscale_state::{
    NodeStatus, OperationId, OperationState, PoolId, ProviderKind, TenantContext,
};
use serde::Serialize;

use crate::error::{NodePoolError, NodePoolResult};
use crate::manager::NodePoolManager;
use crate::provider::PendingPod;

/// Tenant-wide capacity snapshot over the enabled pools.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterCapacity {
    pub enabled_pools: u32,
    pub ready_nodes: u32,
    pub pending_nodes: u32,
    pub draining_nodes: u32,
    /// Allocatable capacity of the ready nodes.
    pub cpu_capacity_millicores: u64,
    pub memory_capacity_mb: u64,
    /// Requested by pods running on the ready nodes.
    pub cpu_allocated_millicores: u64,
    pub memory_allocated_mb: u64,
    pub cpu_allocation_percent: f64,
    pub memory_allocation_percent: f64,
    pub pending_pods: u32,
    pub unschedulable_pods: u32,
    /// Pending pod count by scheduler reason.
    pub pending_reasons: BTreeMap<String, u32>,
    pub observed_at: DateTime<Utc>,
}

/// The target of a pool's active operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveOperationSummary {
    pub id: OperationId,
    pub state: OperationState,
    pub target_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodePoolStatus {
    pub pool_id: PoolId,
    pub name: String,
    pub provider: ProviderKind,
    pub region: String,
    pub enabled: bool,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub pending: u32,
    pub ready: u32,
    pub draining: u32,
    pub terminated: u32,
    pub active_operation: Option<ActiveOperationSummary>,
}

impl NodePoolStatus {
    /// Nodes that are up or on their way (pending + ready).
    pub fn serving(&self) -> u32 {
        self.pending + self.ready
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

impl NodePoolManager {
    pub async fn get_cluster_capacity(&self, ctx: &TenantContext) -> NodePoolResult<ClusterCapacity> {
        let pools: Vec<PoolId> = self
            .store
            .list_pools(ctx)?
            .into_iter()
            .filter(|p| p.enabled)
            .map(|p| p.id)
            .collect();
        let nodes: Vec<_> = self
            .store
            .list_nodes(ctx, None)?
            .into_iter()
            .filter(|n| pools.contains(&n.pool_id))
            .collect();

        let allocations = self
            .observer
            .node_allocations(ctx)
            .await
            .map_err(|e| NodePoolError::Provider(format!("{e:#}")))?;
        let pending_pods = self
            .observer
            .pending_pods(ctx)
            .await
            .map_err(|e| NodePoolError::Provider(format!("{e:#}")))?;

        let by_status = |status: NodeStatus| nodes.iter().filter(move |n| n.status == status);
        let mut capacity = ClusterCapacity {
            enabled_pools: count(pools.len()),
            ready_nodes: count(by_status(NodeStatus::Ready).count()),
            pending_nodes: count(by_status(NodeStatus::Pending).count()),
            draining_nodes: count(by_status(NodeStatus::Draining).count()),
            cpu_capacity_millicores: 0,
            memory_capacity_mb: 0,
            cpu_allocated_millicores: 0,
            memory_allocated_mb: 0,
            cpu_allocation_percent: 0.0,
            memory_allocation_percent: 0.0,
            pending_pods: count(pending_pods.len()),
            unschedulable_pods: count(pending_pods.iter().filter(|p| p.unschedulable).count()),
            pending_reasons: BTreeMap::new(),
            observed_at: Utc::now(),
        };

        for node in by_status(NodeStatus::Ready) {
            capacity.cpu_capacity_millicores += u64::from(node.cpu_millicores);
            capacity.memory_capacity_mb += node.memory_mb;
            if let Some(allocated) = allocations.get(&node.provider_instance_id) {
                capacity.cpu_allocated_millicores += allocated.cpu_millicores;
                capacity.memory_allocated_mb += allocated.memory_mb;
            }
        }
        capacity.cpu_allocation_percent =
            percent(capacity.cpu_allocated_millicores, capacity.cpu_capacity_millicores);
        capacity.memory_allocation_percent =
            percent(capacity.memory_allocated_mb, capacity.memory_capacity_mb);

        for pod in &pending_pods {
            *capacity.pending_reasons.entry(pod.reason.clone()).or_default() += 1;
        }
        Ok(capacity)
    }

    /// Pods waiting for capacity, oldest first.
    pub async fn get_pending_pods(&self, ctx: &TenantContext) -> NodePoolResult<Vec<PendingPod>> {
        let mut pods = self
            .observer
            .pending_pods(ctx)
            .await
            .map_err(|e| NodePoolError::Provider(format!("{e:#}")))?;
        pods.sort_by(|a, b| a.pending_since.cmp(&b.pending_since).then(a.name.cmp(&b.name)));
        Ok(pods)
    }

    pub fn get_pool_status(&self, ctx: &TenantContext, pool_id: &PoolId) -> NodePoolResult<NodePoolStatus> {
        let pool = self.load_pool(ctx, pool_id)?;
        let nodes = self.store.list_nodes(ctx, Some(&pool.id))?;
        let active = self.store.active_operation(ctx, &pool.target_key())?;
        let tally = |status: NodeStatus| count(nodes.iter().filter(|n| n.status == status).count());
        Ok(NodePoolStatus {
            pool_id: pool.id,
            name: pool.name,
            provider: pool.provider,
            region: pool.region,
            enabled: pool.enabled,
            min_nodes: pool.min_nodes,
            max_nodes: pool.max_nodes,
            pending: tally(NodeStatus::Pending),
            ready: tally(NodeStatus::Ready),
            draining: tally(NodeStatus::Draining),
            terminated: tally(NodeStatus::Terminated),
            active_operation: active.map(|op| ActiveOperationSummary {
                id: op.id,
                state: op.state,
                target_count: op.target_count,
            }),
        })
    }

    pub fn get_all_pool_statuses(&self, ctx: &TenantContext) -> NodePoolResult<Vec<NodePoolStatus>> {
        self.store
            .list_pools(ctx)?
            .iter()
            .map(|pool| self.get_pool_status(ctx, &pool.id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::{grow, harness, new_pool};
    use crate::provider::NodeAllocation;
    use crate::simulated::SimulatedConfig;

    fn pod(name: &str, reason: &str, unschedulable: bool) -> PendingPod {
        PendingPod {
            namespace: "default".into(),
            name: name.into(),
            reason: reason.into(),
            unschedulable,
            requested_cpu_millicores: 500,
            requested_memory_mb: 512,
            pending_since: Utc::now(),
        }
    }

    #[tokio::test]
    async fn empty_tenant_has_zero_capacity() {
        let h = harness(SimulatedConfig::default());
        let capacity = h.manager.get_cluster_capacity(&h.ctx).await.unwrap();
        assert_eq!(capacity.ready_nodes, 0);
        assert_eq!(capacity.cpu_allocation_percent, 0.0);
        assert_eq!(capacity.pending_pods, 0);
    }

    #[tokio::test]
    async fn sums_ready_nodes_of_enabled_pools() {
        let h = harness(SimulatedConfig {
            polls_to_complete: 0,
            cpu_millicores: 2_000,
            memory_mb: 4_096,
            ..Default::default()
        });
        let workers = h.manager.create_pool(&h.ctx, new_pool("workers", 0, 5)).unwrap();
        let batch = h.manager.create_pool(&h.ctx, new_pool("batch", 0, 5)).unwrap();
        grow(&h, &workers.id, 2).await;
        grow(&h, &batch.id, 1).await;
        h.manager.disable_pool(&h.ctx, &batch.id).unwrap();

        let nodes = h.manager.list_nodes(&h.ctx, Some(&workers.id), false).unwrap();
        h.observer
            .set_allocation(
                nodes[0].provider_instance_id.clone(),
                NodeAllocation {
                    cpu_millicores: 1_000,
                    memory_mb: 1_024,
                },
            )
            .await;
        h.observer
            .set_pending_pods(vec![
                pod("a", "Insufficient cpu", true),
                pod("b", "Insufficient cpu", true),
                pod("c", "ImagePull", false),
            ])
            .await;

        let capacity = h.manager.get_cluster_capacity(&h.ctx).await.unwrap();
        assert_eq!(capacity.enabled_pools, 1);
        assert_eq!(capacity.ready_nodes, 2);
        assert_eq!(capacity.cpu_capacity_millicores, 4_000);
        assert_eq!(capacity.memory_capacity_mb, 8_192);
        assert_eq!(capacity.cpu_allocation_percent, 25.0);
        assert_eq!(capacity.memory_allocation_percent, 12.5);
        assert_eq!(capacity.pending_pods, 3);
        assert_eq!(capacity.unschedulable_pods, 2);
        assert_eq!(capacity.pending_reasons.get("Insufficient cpu"), Some(&2));
    }

    #[tokio::test]
    async fn pool_status_reports_active_operation() {
        let h = harness(SimulatedConfig::default());
        let pool = h.manager.create_pool(&h.ctx, new_pool("workers", 0, 5)).unwrap();
        let op = h.manager.scale_pool(&h.ctx, &pool.id, 3, false).await.unwrap();
        h.manager.reconcile_once().await.unwrap();

        let statuses = h.manager.get_all_pool_statuses(&h.ctx).unwrap();
        assert_eq!(statuses.len(), 1);
        let status = &statuses[0];
        assert_eq!(status.pending, 2);
        assert_eq!(status.ready, 0);
        let active = status.active_operation.as_ref().unwrap();
        assert_eq!(active.id, op.id);
        assert_eq!(active.target_count, 3);
    }

    #[tokio::test]
    async fn pending_pods_oldest_first() {
        let h = harness(SimulatedConfig::default());
        let mut young = pod("young", "Insufficient memory", true);
        let mut old = pod("old", "Insufficient memory", true);
        old.pending_since = Utc::now() - chrono::Duration::minutes(5);
        young.pending_since = Utc::now();
        h.observer.set_pending_pods(vec![young, old]).await;

        let pods = h.manager.get_pending_pods(&h.ctx).await.unwrap();
        assert_eq!(pods[0].name, "old");
    }
}
