//! Node pool CRUD.

use std::collections::HashSet;

use chrono::Utc;
use flowscale_state::{NewPool, NodePool, PoolId, PoolPatch, TargetType, TenantContext};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{NodePoolError, NodePoolResult};
use crate::manager::NodePoolManager;

const MAX_NAME_LEN: usize = 128;

/// Check a whole pool, reporting every problem at once.
pub fn validate_pool(pool: &NodePool) -> NodePoolResult<()> {
    let mut problems = Vec::new();

    let name = pool.name.trim();
    if name.is_empty() {
        problems.push("name must not be empty".to_string());
    } else if name.len() > MAX_NAME_LEN {
        problems.push(format!("name longer than {MAX_NAME_LEN} characters"));
    }
    if pool.max_nodes < 1 {
        problems.push("max_nodes must be at least 1".to_string());
    }
    if pool.min_nodes > pool.max_nodes {
        problems.push(format!(
            "min_nodes ({}) exceeds max_nodes ({})",
            pool.min_nodes, pool.max_nodes
        ));
    }
    for (field, value) in [
        ("region", &pool.region),
        ("instance_type", &pool.instance_type),
        ("image", &pool.image),
    ] {
        if value.trim().is_empty() {
            problems.push(format!("{field} must not be empty"));
        }
    }
    if pool.labels.keys().any(|k| k.trim().is_empty()) {
        problems.push("label keys must not be empty".to_string());
    }

    let mut seen = HashSet::new();
    for (index, taint) in pool.taints.iter().enumerate() {
        if taint.key.trim().is_empty() {
            problems.push(format!("taints[{index}]: key must not be empty"));
        } else if !seen.insert((taint.key.as_str(), taint.effect as u8)) {
            problems.push(format!(
                "taints[{index}]: duplicate taint {} with effect {:?}",
                taint.key, taint.effect
            ));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(NodePoolError::Validation(problems.join("; ")))
    }
}

impl NodePoolManager {
    pub fn create_pool(&self, ctx: &TenantContext, new: NewPool) -> NodePoolResult<NodePool> {
        let now = Utc::now();
        let pool = NodePool {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id,
            name: new.name.trim().to_string(),
            provider: new.provider,
            region: new.region,
            instance_type: new.instance_type,
            image: new.image,
            min_nodes: new.min_nodes,
            max_nodes: new.max_nodes,
            labels: new.labels,
            taints: new.taints,
            enabled: new.enabled,
            created_at: now,
            updated_at: now,
        };
        validate_pool(&pool)?;
        self.store.insert_pool(ctx, &pool)?;
        info!(
            tenant = %ctx.tenant_id,
            pool = %pool.id,
            name = %pool.name,
            provider = ?pool.provider,
            region = %pool.region,
            "node pool created"
        );
        Ok(pool)
    }

    pub fn get_pool(&self, ctx: &TenantContext, pool_id: &PoolId) -> NodePoolResult<NodePool> {
        self.load_pool(ctx, pool_id)
    }

    pub fn list_pools(&self, ctx: &TenantContext) -> NodePoolResult<Vec<NodePool>> {
        Ok(self.store.list_pools(ctx)?)
    }

    /// Apply a patch; the merged pool is validated before anything is written.
    pub fn update_pool(&self, ctx: &TenantContext, pool_id: &PoolId, patch: PoolPatch) -> NodePoolResult<NodePool> {
        let current = self.load_pool(ctx, pool_id)?;
        if patch.is_empty() {
            return Ok(current);
        }
        let mut next = patch.apply_to(&current);
        next.name = next.name.trim().to_string();
        next.updated_at = Utc::now();
        validate_pool(&next)?;
        self.store.update_pool(ctx, &next)?;
        info!(pool = %next.id, name = %next.name, "node pool updated");
        Ok(next)
    }

    pub fn enable_pool(&self, ctx: &TenantContext, pool_id: &PoolId) -> NodePoolResult<NodePool> {
        self.update_pool(
            ctx,
            pool_id,
            PoolPatch {
                enabled: Some(true),
                ..Default::default()
            },
        )
    }

    pub fn disable_pool(&self, ctx: &TenantContext, pool_id: &PoolId) -> NodePoolResult<NodePool> {
        self.update_pool(
            ctx,
            pool_id,
            PoolPatch {
                enabled: Some(false),
                ..Default::default()
            },
        )
    }

    /// Delete a pool and its nodes.
    ///
    /// Rejected while an operation is active on the pool or while a `nodes`
    /// policy targets it. Live nodes are destroyed at the provider best
    /// effort before the records go.
    pub async fn delete_pool(&self, ctx: &TenantContext, pool_id: &PoolId) -> NodePoolResult<()> {
        let pool = self.load_pool(ctx, pool_id)?;
        if let Some(active) = self.store.active_operation(ctx, &pool.target_key())? {
            return Err(NodePoolError::Conflict(format!(
                "node pool {} has active operation {}",
                pool.name, active.id
            )));
        }
        if let Some(policy) = self
            .store
            .list_policies(ctx)?
            .into_iter()
            .find(|p| p.target_type == TargetType::Nodes && p.target_id == Some(pool.id))
        {
            return Err(NodePoolError::Conflict(format!(
                "node pool {} is targeted by policy {}",
                pool.name, policy.name
            )));
        }

        let live: Vec<String> = self
            .store
            .list_nodes(ctx, Some(&pool.id))?
            .into_iter()
            .filter(|n| n.is_live())
            .map(|n| n.provider_instance_id)
            .collect();
        if !live.is_empty()
            && let Err(e) = self.provider.destroy_nodes(&pool, &live).await
        {
            warn!(pool = %pool.id, nodes = live.len(), error = %format!("{e:#}"), "destroying pool nodes failed");
        }

        let removed = self.store.delete_pool(ctx, &pool.id)?;
        info!(pool = %pool.id, name = %pool.name, nodes = removed.len(), "node pool deleted");
        Ok(())
    }
}
