//! Reconciliation watcher.
//!
//! Polls the provider for every `in_progress` pool operation across
//! tenants, records nodes as they come up or go away, and moves each
//! operation to `completed` or `failed` once its provider job finishes.
//! Compute operations have no provider job; one left active past the
//! stale threshold is failed so its target can be scaled again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flowscale_state::{
    Node, NodeStatus, OperationState, PoolId, ScalingOperation, StateError, TenantContext,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{NodePoolError, NodePoolResult};
use crate::manager::NodePoolManager;
use crate::provider::{JobPhase, JobStatus, ProviderHandle};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub checked: usize,
    pub completed: usize,
    pub failed: usize,
    /// Operations whose provider could not be reached; retried next pass.
    pub errors: usize,
}

impl NodePoolManager {
    /// Run one reconciliation pass over every tenant.
    pub async fn reconcile_once(&self) -> NodePoolResult<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();
        let active = self.store.list_active_operations_all_tenants()?;

        for op in active {
            summary.checked += 1;
            let ctx = TenantContext::new(op.tenant_id);
            let id = op.id;
            let reconciled = if op.pool_id.is_some() {
                self.reconcile_operation(&ctx, op).await
            } else {
                self.expire_stalled_operation(&ctx, op)
            };
            match reconciled {
                Ok(Some(OperationState::Completed)) => summary.completed += 1,
                Ok(Some(OperationState::Failed)) => summary.failed += 1,
                Ok(_) => {}
                Err(e) => {
                    summary.errors += 1;
                    warn!(operation = %id, error = %e, "reconciling operation failed");
                }
            }
        }
        Ok(summary)
    }

    /// Returns the terminal state reached in this pass, if any.
    async fn reconcile_operation(
        &self,
        ctx: &TenantContext,
        mut op: ScalingOperation,
    ) -> NodePoolResult<Option<OperationState>> {
        let Some(pool_id) = op.pool_id else {
            return Ok(None);
        };
        let now = Utc::now();

        if op.state == OperationState::Pending {
            let age = (now - op.created_at).to_std().unwrap_or_default();
            if age < self.config.stale_pending_after {
                return Ok(None);
            }
            op.transition_to(OperationState::InProgress, now)?;
            op.fail("operation was never dispatched", now)?;
            return self.settle(ctx, &pool_id, op, None);
        }

        let Some(handle) = op.provider_handle.clone().map(ProviderHandle) else {
            op.fail("operation has no provider handle", now)?;
            return self.settle(ctx, &pool_id, op, None);
        };
        let status = self
            .provider
            .poll(&handle)
            .await
            .map_err(|e| NodePoolError::Provider(format!("{e:#}")))?;

        match &status.phase {
            JobPhase::Running => {
                self.record_job_progress(ctx, &pool_id, &op, &status, false)?;
                Ok(None)
            }
            JobPhase::Succeeded => {
                op.transition_to(OperationState::Completed, now)?;
                self.settle(ctx, &pool_id, op, Some(&status))
            }
            JobPhase::Failed(message) => {
                op.fail(message.clone(), now)?;
                self.settle(ctx, &pool_id, op, Some(&status))
            }
        }
    }

    /// Fail a compute operation that has not moved for longer than the
    /// stale threshold. Its scaler call died with the process that made it.
    fn expire_stalled_operation(
        &self,
        ctx: &TenantContext,
        mut op: ScalingOperation,
    ) -> NodePoolResult<Option<OperationState>> {
        let now = Utc::now();
        let idle = (now - op.updated_at).to_std().unwrap_or_default();
        if idle < self.config.stale_pending_after {
            return Ok(None);
        }
        if op.state == OperationState::Pending {
            op.transition_to(OperationState::InProgress, now)?;
        }
        op.fail("operation stalled before completing", now)?;
        match self.store.put_operation(ctx, &op) {
            Ok(()) => {
                warn!(operation = %op.id, target = %op.target_key, idle_secs = idle.as_secs(), "stalled operation failed");
                Ok(Some(op.state))
            }
            Err(StateError::Conflict(msg)) => {
                debug!(operation = %op.id, %msg, "operation settled elsewhere");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a terminal operation, then fold the final job status into the
    /// node records. Loses quietly to a concurrent cancel.
    fn settle(
        &self,
        ctx: &TenantContext,
        pool_id: &PoolId,
        op: ScalingOperation,
        status: Option<&JobStatus>,
    ) -> NodePoolResult<Option<OperationState>> {
        match self.store.put_operation(ctx, &op) {
            Ok(()) => {}
            Err(StateError::Conflict(msg)) => {
                debug!(operation = %op.id, %msg, "operation settled elsewhere");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let empty = JobStatus {
            phase: JobPhase::Succeeded,
            created: Vec::new(),
            removed: Vec::new(),
        };
        self.record_job_progress(ctx, pool_id, &op, status.unwrap_or(&empty), true)?;

        match op.state {
            OperationState::Completed => info!(
                operation = %op.id,
                pool = %pool_id,
                from = op.previous_count,
                to = op.target_count,
                "scaling operation completed"
            ),
            _ => warn!(
                operation = %op.id,
                pool = %pool_id,
                error = op.error.as_deref().unwrap_or_default(),
                "scaling operation failed"
            ),
        }
        Ok(Some(op.state))
    }

    /// Fold a provider job status into the pool's node records.
    ///
    /// While the job runs, created instances are `pending` until the
    /// provider reports them ready. Once `op` is terminal (`settled`), every
    /// created instance counts as `ready`, and victims the job did not
    /// remove are terminated (completed) or returned to `ready` (otherwise).
    pub(crate) fn record_job_progress(
        &self,
        ctx: &TenantContext,
        pool_id: &PoolId,
        op: &ScalingOperation,
        status: &JobStatus,
        settled: bool,
    ) -> NodePoolResult<()> {
        let now = Utc::now();
        let existing = self.store.list_nodes(ctx, Some(pool_id))?;
        let by_instance: HashMap<&str, &Node> = existing
            .iter()
            .map(|n| (n.provider_instance_id.as_str(), n))
            .collect();
        let mut updates = Vec::new();

        for instance in &status.created {
            let observed = if settled || instance.ready {
                NodeStatus::Ready
            } else {
                NodeStatus::Pending
            };
            match by_instance.get(instance.instance_id.as_str()) {
                Some(node) if node.status == NodeStatus::Pending && observed == NodeStatus::Ready => {
                    let mut node = (*node).clone();
                    node.status = NodeStatus::Ready;
                    node.updated_at = now;
                    updates.push(node);
                }
                Some(_) => {}
                None => updates.push(Node {
                    id: Uuid::new_v4(),
                    tenant_id: ctx.tenant_id,
                    pool_id: *pool_id,
                    provider_instance_id: instance.instance_id.clone(),
                    status: observed,
                    cpu_millicores: instance.cpu_millicores,
                    memory_mb: instance.memory_mb,
                    operation_id: Some(op.id),
                    created_at: now,
                    updated_at: now,
                }),
            }
        }

        for instance_id in &status.removed {
            if let Some(node) = by_instance.get(instance_id.as_str())
                && node.is_live()
            {
                let mut node = (*node).clone();
                node.status = NodeStatus::Terminated;
                node.updated_at = now;
                updates.push(node);
            }
        }

        if settled {
            let next = if op.state == OperationState::Completed {
                NodeStatus::Terminated
            } else {
                NodeStatus::Ready
            };
            for node in existing.iter().filter(|n| {
                n.status == NodeStatus::Draining
                    && op.victims.contains(&n.id)
                    && !status.removed.contains(&n.provider_instance_id)
            }) {
                let mut node = node.clone();
                node.status = next;
                node.updated_at = now;
                updates.push(node);
            }
        }

        if !updates.is_empty() {
            debug!(operation = %op.id, pool = %pool_id, changed = updates.len(), "node records updated");
        }
        self.store.put_nodes(ctx, &updates)?;
        Ok(())
    }

    /// Reconcile every `interval` until `shutdown` flips.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "node pool reconciler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.reconcile_once().await {
                        Ok(summary) if summary.checked > 0 => debug!(
                            checked = summary.checked,
                            completed = summary.completed,
                            failed = summary.failed,
                            errors = summary.errors,
                            "reconcile pass finished"
                        ),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "reconcile pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("node pool reconciler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::{grow, harness, new_pool};
    use crate::simulated::SimulatedConfig;

    #[tokio::test]
    async fn scale_up_nodes_go_pending_then_ready() {
        let h = harness(SimulatedConfig {
            polls_to_complete: 2,
            ..Default::default()
        });
        let pool = h.manager.create_pool(&h.ctx, new_pool("workers", 0, 5)).unwrap();
        let op = h.manager.scale_pool(&h.ctx, &pool.id, 2, false).await.unwrap();

        let summary = h.manager.reconcile_once().await.unwrap();
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.completed, 0);
        let nodes = h.manager.list_nodes(&h.ctx, Some(&pool.id), false).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].status, NodeStatus::Pending);
        assert_eq!(nodes[0].operation_id, Some(op.id));

        h.manager.reconcile_once().await.unwrap();
        let summary = h.manager.reconcile_once().await.unwrap();
        assert_eq!(summary.completed, 1);
        let nodes = h.manager.list_nodes(&h.ctx, Some(&pool.id), false).unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|n| n.status == NodeStatus::Ready));
        assert_eq!(
            h.manager.get_operation(&h.ctx, &op.id).unwrap().state,
            OperationState::Completed
        );
    }

    #[tokio::test]
    async fn failed_job_fails_operation_and_keeps_arrivals() {
        let h = harness(SimulatedConfig {
            polls_to_complete: 1,
            fail_jobs: true,
            ..Default::default()
        });
        let pool = h.manager.create_pool(&h.ctx, new_pool("workers", 0, 5)).unwrap();
        let op = grow(&h, &pool.id, 2).await;
        assert_eq!(op.state, OperationState::Failed);
        assert!(op.error.as_deref().unwrap().contains("simulated"));

        // Instances that did come up are still accounted for.
        let nodes = h.manager.list_nodes(&h.ctx, Some(&pool.id), false).unwrap();
        assert_eq!(nodes.len(), 2);
        // The pool is free again.
        h.provider.configure(|c| c.fail_jobs = false).await;
        h.manager.scale_pool(&h.ctx, &pool.id, 3, false).await.unwrap();
    }

    #[tokio::test]
    async fn failed_scale_down_returns_victims_to_ready() {
        let h = harness(SimulatedConfig::default());
        let pool = h.manager.create_pool(&h.ctx, new_pool("workers", 0, 5)).unwrap();
        grow(&h, &pool.id, 2).await;

        h.provider.configure(|c| c.fail_jobs = true).await;
        let op = h.manager.scale_pool(&h.ctx, &pool.id, 1, false).await.unwrap();
        h.manager.reconcile_once().await.unwrap();
        let summary = h.manager.reconcile_once().await.unwrap();
        assert_eq!(summary.failed, 1);

        let nodes = h.manager.list_nodes(&h.ctx, Some(&pool.id), false).unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|n| n.status == NodeStatus::Ready));
        assert_eq!(
            h.manager.get_operation(&h.ctx, &op.id).unwrap().state,
            OperationState::Failed
        );
    }

    #[tokio::test]
    async fn stale_pending_operation_is_failed() {
        let h = harness(SimulatedConfig::default());
        let pool = h.manager.create_pool(&h.ctx, new_pool("workers", 0, 5)).unwrap();
        let created = Utc::now() - chrono::Duration::minutes(10);
        let mut op = ScalingOperation::pending(h.ctx.tenant_id, pool.target_key(), 0, 2, created);
        op.pool_id = Some(pool.id);
        h.manager.store().insert_operation_if_idle(&h.ctx, &op).unwrap();

        let summary = h.manager.reconcile_once().await.unwrap();
        assert_eq!(summary.failed, 1);
        let stored = h.manager.get_operation(&h.ctx, &op.id).unwrap();
        assert_eq!(stored.state, OperationState::Failed);
    }

    #[tokio::test]
    async fn stalled_compute_operation_is_failed_and_target_freed() {
        let h = harness(SimulatedConfig::default());
        let store = h.manager.store();
        let long_ago = Utc::now() - chrono::Duration::minutes(30);
        let mut stuck = ScalingOperation::pending(h.ctx.tenant_id, "trino:fleet".into(), 1, 3, long_ago);
        stuck.transition_to(OperationState::InProgress, long_ago).unwrap();
        store.insert_operation_if_idle(&h.ctx, &stuck).unwrap();
        let fresh = ScalingOperation::pending(h.ctx.tenant_id, "spark:fleet".into(), 1, 2, Utc::now());
        store.insert_operation_if_idle(&h.ctx, &fresh).unwrap();

        let summary = h.manager.reconcile_once().await.unwrap();
        assert_eq!(summary.checked, 2);
        assert_eq!(summary.failed, 1);
        let stored = h.manager.get_operation(&h.ctx, &stuck.id).unwrap();
        assert_eq!(stored.state, OperationState::Failed);
        assert!(stored.error.is_some());
        assert!(h.manager.get_operation(&h.ctx, &fresh.id).unwrap().is_active());

        let retry = ScalingOperation::pending(h.ctx.tenant_id, "trino:fleet".into(), 1, 3, Utc::now());
        store.insert_operation_if_idle(&h.ctx, &retry).unwrap();
    }

    #[tokio::test]
    async fn unreachable_provider_is_retried() {
        let h = harness(SimulatedConfig::default());
        let pool = h.manager.create_pool(&h.ctx, new_pool("workers", 0, 5)).unwrap();
        let mut op = ScalingOperation::pending(h.ctx.tenant_id, pool.target_key(), 0, 2, Utc::now());
        op.pool_id = Some(pool.id);
        op.provider_handle = Some("sim-job-404".into());
        op.transition_to(OperationState::InProgress, Utc::now()).unwrap();
        h.manager.store().insert_operation_if_idle(&h.ctx, &op).unwrap();

        let summary = h.manager.reconcile_once().await.unwrap();
        assert_eq!(summary.errors, 1);
        assert!(h.manager.get_operation(&h.ctx, &op.id).unwrap().is_active());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let h = harness(SimulatedConfig::default());
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&h.manager).run(Duration::from_millis(10), rx));
        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
