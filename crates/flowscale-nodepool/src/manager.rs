//! Node pool manager: scaling operations, node drains and cancellation.
//!
//! Every change to a pool's size goes through a [`ScalingOperation`]. The
//! store guarantees at most one non-terminal operation per pool; the
//! manager dispatches the provider call and leaves the operation
//! `in_progress` for the reconciler (see [`crate::reconcile`]) to drive to a
//! terminal state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flowscale_state::{
    Node, NodeId, NodePool, NodeStatus, OperationId, OperationState, PolicyId, PoolId,
    ScalingOperation, StateError, StateStore, TenantContext,
};
use tracing::{debug, info, warn};

use crate::error::{NodePoolError, NodePoolResult};
use crate::provider::{ClusterObserver, CloudProvider, JobPhase, ProviderHandle};

/// Node pool manager configuration.
#[derive(Debug, Clone)]
pub struct NodePoolConfig {
    /// Eviction grace period when the caller gives none.
    pub drain_grace_period: Duration,
    /// Drain bound when the caller gives none.
    pub drain_timeout: Duration,
    pub drain_poll_interval: Duration,
    /// Pending operations older than this were never dispatched and are
    /// failed by the reconciler.
    pub stale_pending_after: Duration,
}

impl Default for NodePoolConfig {
    fn default() -> Self {
        Self {
            drain_grace_period: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(300),
            drain_poll_interval: Duration::from_secs(2),
            stale_pending_after: Duration::from_secs(300),
        }
    }
}

/// Options for [`NodePoolManager::drain_node`].
#[derive(Debug, Clone, Default)]
pub struct DrainOptions {
    /// Terminate the node even if eviction does not finish in time.
    pub force: bool,
    pub grace_period: Option<Duration>,
    pub timeout: Option<Duration>,
}

/// How a scale request entered the manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScaleOptions {
    /// Permit a target below `min_nodes`, down to zero (idle scale-to-zero).
    pub allow_zero: bool,
    /// Policy that requested the change.
    pub policy_id: Option<PolicyId>,
}

/// Result of a finished drain.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainOutcome {
    /// The node, now terminated.
    pub node: Node,
    /// Eviction did not finish and the node was terminated anyway.
    pub forced: bool,
}

/// Owns node pools, their nodes and the operations that resize them.
pub struct NodePoolManager {
    pub(crate) store: StateStore,
    pub(crate) provider: Arc<dyn CloudProvider>,
    pub(crate) observer: Arc<dyn ClusterObserver>,
    pub(crate) config: NodePoolConfig,
}

impl NodePoolManager {
    pub fn new(
        store: StateStore,
        provider: Arc<dyn CloudProvider>,
        observer: Arc<dyn ClusterObserver>,
        config: NodePoolConfig,
    ) -> Self {
        Self {
            store,
            provider,
            observer,
            config,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub(crate) fn load_pool(&self, ctx: &TenantContext, pool_id: &PoolId) -> NodePoolResult<NodePool> {
        self.store
            .get_pool(ctx, pool_id)?
            .ok_or(NodePoolError::PoolNotFound(*pool_id))
    }

    // ── Scaling ────────────────────────────────────────────────────

    /// Bring the pool to `target_count` nodes.
    ///
    /// The target must lie within `[min_nodes, max_nodes]`. A dry run
    /// returns the operation that would be created without storing it or
    /// calling the provider.
    pub async fn scale_pool(
        &self,
        ctx: &TenantContext,
        pool_id: &PoolId,
        target_count: i64,
        dry_run: bool,
    ) -> NodePoolResult<ScalingOperation> {
        self.scale_pool_with(ctx, pool_id, target_count, dry_run, ScaleOptions::default())
            .await
    }

    pub async fn scale_pool_with(
        &self,
        ctx: &TenantContext,
        pool_id: &PoolId,
        target_count: i64,
        dry_run: bool,
        options: ScaleOptions,
    ) -> NodePoolResult<ScalingOperation> {
        let pool = self.load_pool(ctx, pool_id)?;
        let target = u32::try_from(target_count).map_err(|_| {
            NodePoolError::Validation(format!("target count {target_count} must not be negative"))
        })?;
        let lower = if options.allow_zero && target == 0 { 0 } else { pool.min_nodes };
        if target < lower || target > pool.max_nodes {
            return Err(NodePoolError::Validation(format!(
                "target count {target} outside [{lower}, {}] for pool {}",
                pool.max_nodes, pool.name
            )));
        }
        if !pool.enabled {
            return Err(NodePoolError::Conflict(format!("node pool {} is disabled", pool.name)));
        }

        let serving: Vec<Node> = self
            .store
            .list_nodes(ctx, Some(&pool.id))?
            .into_iter()
            .filter(|n| matches!(n.status, NodeStatus::Pending | NodeStatus::Ready))
            .collect();
        let current = u32::try_from(serving.len()).unwrap_or(u32::MAX);

        let mut op = ScalingOperation::pending(ctx.tenant_id, pool.target_key(), current, target, Utc::now());
        op.pool_id = Some(pool.id);
        op.policy_id = options.policy_id;
        op.dry_run = dry_run;
        let victims = select_victims(&serving, current.saturating_sub(target) as usize);
        op.victims = victims.iter().map(|n| n.id).collect();

        if dry_run {
            if let Some(active) = self.store.active_operation(ctx, &op.target_key)? {
                return Err(NodePoolError::OperationInProgress(format!(
                    "operation {} already in progress for pool {}",
                    active.id, pool.name
                )));
            }
            debug!(pool = %pool.id, from = current, to = target, "dry-run scale planned");
            return Ok(op);
        }

        self.store
            .insert_operation_if_idle(ctx, &op)
            .map_err(operation_in_progress)?;
        info!(
            operation = %op.id,
            pool = %pool.id,
            from = current,
            to = target,
            victims = op.victims.len(),
            "scaling operation created"
        );

        if target == current {
            op.transition_to(OperationState::InProgress, Utc::now())?;
            op.transition_to(OperationState::Completed, Utc::now())?;
            self.store.put_operation(ctx, &op)?;
            return Ok(op);
        }
        self.dispatch(ctx, &pool, op, victims).await
    }

    async fn dispatch(
        &self,
        ctx: &TenantContext,
        pool: &NodePool,
        mut op: ScalingOperation,
        victims: Vec<Node>,
    ) -> NodePoolResult<ScalingOperation> {
        let submitted = if op.target_count > op.previous_count {
            self.provider
                .create_nodes(pool, op.target_count - op.previous_count)
                .await
        } else {
            let now = Utc::now();
            let draining: Vec<Node> = victims
                .iter()
                .cloned()
                .map(|mut node| {
                    node.status = NodeStatus::Draining;
                    node.updated_at = now;
                    node
                })
                .collect();
            self.store.put_nodes(ctx, &draining)?;
            let instance_ids: Vec<String> = victims.iter().map(|n| n.provider_instance_id.clone()).collect();
            self.provider.destroy_nodes(pool, &instance_ids).await
        };

        match submitted {
            Ok(handle) => {
                op.provider_handle = Some(handle.0.clone());
                op.transition_to(OperationState::InProgress, Utc::now())?;
                if let Err(e) = self.store.put_operation(ctx, &op) {
                    // Cancelled while the provider call was in flight.
                    if let Err(cancel_err) = self.provider.cancel(&handle).await {
                        warn!(operation = %op.id, error = %cancel_err, "provider cancel failed");
                    }
                    return Err(e.into());
                }
                info!(operation = %op.id, pool = %pool.id, handle = %handle.0, "scaling operation dispatched");
                Ok(op)
            }
            Err(e) => {
                let message = format!("{e:#}");
                self.store.put_nodes(ctx, &victims)?;
                warn!(operation = %op.id, pool = %pool.id, error = %message, "scaling operation dispatch failed");
                // A concurrent cancel may already have settled the operation.
                if let Err(record_err) = self.record_dispatch_failure(ctx, &mut op, &message) {
                    warn!(operation = %op.id, error = %record_err, "dispatch failure not recorded");
                }
                Err(NodePoolError::Provider(message))
            }
        }
    }

    fn record_dispatch_failure(
        &self,
        ctx: &TenantContext,
        op: &mut ScalingOperation,
        message: &str,
    ) -> NodePoolResult<()> {
        let now = Utc::now();
        op.transition_to(OperationState::InProgress, now)?;
        op.fail(message, now)?;
        self.store.put_operation(ctx, op)?;
        Ok(())
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Nodes of a pool (or of every pool), terminated ones only when asked.
    pub fn list_nodes(
        &self,
        ctx: &TenantContext,
        pool_id: Option<&PoolId>,
        include_terminated: bool,
    ) -> NodePoolResult<Vec<Node>> {
        if let Some(pool_id) = pool_id {
            self.load_pool(ctx, pool_id)?;
        }
        let mut nodes = self.store.list_nodes(ctx, pool_id)?;
        if !include_terminated {
            nodes.retain(Node::is_live);
        }
        Ok(nodes)
    }

    pub fn get_node(&self, ctx: &TenantContext, node_id: &NodeId) -> NodePoolResult<Node> {
        self.store
            .get_node(ctx, node_id)?
            .ok_or_else(|| NodePoolError::NotFound(format!("node {node_id}")))
    }

    /// Cordon a node, evict its workloads and remove it.
    ///
    /// If eviction does not finish within the timeout the node is
    /// terminated only when `force` is set. Otherwise the drain fails with
    /// `Timeout` and the node stays `draining`.
    pub async fn drain_node(
        &self,
        ctx: &TenantContext,
        node_id: &NodeId,
        options: DrainOptions,
    ) -> NodePoolResult<DrainOutcome> {
        let mut node = self.get_node(ctx, node_id)?;
        if node.status == NodeStatus::Terminated {
            return Err(NodePoolError::Conflict(format!("node {node_id} is already terminated")));
        }
        let pool = self.load_pool(ctx, &node.pool_id)?;
        if let Some(active) = self.store.active_operation(ctx, &pool.target_key())?
            && active.victims.contains(node_id)
        {
            return Err(NodePoolError::Conflict(format!(
                "node {node_id} is being removed by operation {}",
                active.id
            )));
        }

        let previous = node.status;
        node.status = NodeStatus::Draining;
        node.updated_at = Utc::now();
        self.store.put_node(ctx, &node)?;

        let grace = options.grace_period.unwrap_or(self.config.drain_grace_period);
        let timeout = options.timeout.unwrap_or(self.config.drain_timeout);
        info!(
            node = %node.id,
            instance = %node.provider_instance_id,
            grace_secs = grace.as_secs(),
            timeout_secs = timeout.as_secs(),
            force = options.force,
            "draining node"
        );

        let handle = match self
            .provider
            .cordon_and_evict(&pool, &node.provider_instance_id, grace)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                node.status = previous;
                node.updated_at = Utc::now();
                self.store.put_node(ctx, &node)?;
                return Err(NodePoolError::Provider(format!("{e:#}")));
            }
        };

        let failure = match tokio::time::timeout(timeout, self.wait_for_job(&handle)).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => {
                if let Err(e) = self.provider.cancel(&handle).await {
                    warn!(node = %node.id, error = %e, "cancelling eviction failed");
                }
                Some(NodePoolError::Timeout(format!(
                    "node {} not drained within {}s",
                    node.id,
                    timeout.as_secs()
                )))
            }
        };

        let forced = match failure {
            None => false,
            Some(e) if options.force => {
                warn!(node = %node.id, error = %e, "drain incomplete, forcing termination");
                true
            }
            Some(e) => {
                warn!(node = %node.id, error = %e, "drain failed, node left draining");
                return Err(e);
            }
        };

        if let Err(e) = self
            .provider
            .destroy_nodes(&pool, std::slice::from_ref(&node.provider_instance_id))
            .await
        {
            warn!(node = %node.id, error = %format!("{e:#}"), "destroy after drain failed, node left draining");
            return Err(NodePoolError::Provider(format!("{e:#}")));
        }
        node.status = NodeStatus::Terminated;
        node.updated_at = Utc::now();
        self.store.put_node(ctx, &node)?;
        info!(node = %node.id, forced, "node drained and removed");
        Ok(DrainOutcome { node, forced })
    }

    /// Poll a provider job until it leaves `Running`.
    async fn wait_for_job(&self, handle: &ProviderHandle) -> NodePoolResult<()> {
        loop {
            let status = self
                .provider
                .poll(handle)
                .await
                .map_err(|e| NodePoolError::Provider(format!("{e:#}")))?;
            match status.phase {
                JobPhase::Running => tokio::time::sleep(self.config.drain_poll_interval).await,
                JobPhase::Succeeded => return Ok(()),
                JobPhase::Failed(message) => return Err(NodePoolError::Provider(message)),
            }
        }
    }

    // ── Operations ─────────────────────────────────────────────────

    /// Operations, newest first, optionally for one pool.
    pub fn list_operations(
        &self,
        ctx: &TenantContext,
        pool_id: Option<&PoolId>,
    ) -> NodePoolResult<Vec<ScalingOperation>> {
        if let Some(pool_id) = pool_id {
            self.load_pool(ctx, pool_id)?;
        }
        Ok(self.store.list_operations(ctx, pool_id)?)
    }

    pub fn get_operation(&self, ctx: &TenantContext, operation_id: &OperationId) -> NodePoolResult<ScalingOperation> {
        self.store
            .get_operation(ctx, operation_id)?
            .ok_or_else(|| NodePoolError::NotFound(format!("operation {operation_id}")))
    }

    /// Cancel a `pending` or `in_progress` operation.
    ///
    /// The provider job is cancelled best effort. Nodes the job already
    /// brought up are recorded as `ready`; scale-down victims that were not
    /// removed return to `ready`.
    pub async fn cancel_operation(
        &self,
        ctx: &TenantContext,
        operation_id: &OperationId,
    ) -> NodePoolResult<ScalingOperation> {
        let mut op = self.get_operation(ctx, operation_id)?;
        op.transition_to(OperationState::Cancelled, Utc::now())?;
        self.store.put_operation(ctx, &op)?;
        info!(operation = %op.id, target = %op.target_key, "scaling operation cancelled");

        let (Some(pool_id), Some(handle)) = (op.pool_id, op.provider_handle.clone().map(ProviderHandle)) else {
            if let Some(pool_id) = op.pool_id {
                self.release_victims(ctx, &pool_id, &op)?;
            }
            return Ok(op);
        };

        if let Err(e) = self.provider.cancel(&handle).await {
            warn!(operation = %op.id, error = %format!("{e:#}"), "provider rollback failed");
        }
        match self.provider.poll(&handle).await {
            Ok(status) => self.record_job_progress(ctx, &pool_id, &op, &status, true)?,
            Err(e) => {
                warn!(operation = %op.id, error = %format!("{e:#}"), "could not read cancelled job");
                self.release_victims(ctx, &pool_id, &op)?;
            }
        }
        Ok(op)
    }

    /// Return the still-draining victims of a finished operation to `ready`.
    fn release_victims(&self, ctx: &TenantContext, pool_id: &PoolId, op: &ScalingOperation) -> NodePoolResult<()> {
        let now = Utc::now();
        let released: Vec<Node> = self
            .store
            .list_nodes(ctx, Some(pool_id))?
            .into_iter()
            .filter(|n| n.status == NodeStatus::Draining && op.victims.contains(&n.id))
            .map(|mut n| {
                n.status = NodeStatus::Ready;
                n.updated_at = now;
                n
            })
            .collect();
        self.store.put_nodes(ctx, &released)?;
        Ok(())
    }
}

/// Scale-down victims: pending nodes before ready ones, newest first.
fn select_victims(nodes: &[Node], count: usize) -> Vec<Node> {
    let rank = |n: &Node| match n.status {
        NodeStatus::Pending => 0,
        _ => 1,
    };
    let mut candidates: Vec<&Node> = nodes.iter().collect();
    candidates.sort_by(|a, b| rank(a).cmp(&rank(b)).then(b.created_at.cmp(&a.created_at)));
    candidates.into_iter().take(count).cloned().collect()
}

fn operation_in_progress(err: StateError) -> NodePoolError {
    match err {
        StateError::Conflict(msg) => NodePoolError::OperationInProgress(msg),
        other => other.into(),
    }
}
