//! Policy management: create, read, update, delete, enable/disable, and
//! read access to evaluation state and history.

use chrono::Utc;
use flowscale_state::{
    IdleState, NewPolicy, PolicyId, PolicyPatch, PolicyState, ScalingHistory, ScalingPolicy,
    TargetType, TenantContext,
};
use tracing::info;
use uuid::Uuid;

use crate::engine::PolicyEngine;
use crate::error::{AutoscaleError, AutoscaleResult};
use crate::validation::validate_policy;

/// Largest page `list_history` returns.
pub const MAX_HISTORY_LIMIT: usize = 1000;

impl PolicyEngine {
    /// Validate and store a new policy with its initial state
    /// (`current_replicas = min_replicas`) and idle tracking row.
    pub async fn create_policy(&self, ctx: &TenantContext, new: NewPolicy) -> AutoscaleResult<ScalingPolicy> {
        let now = Utc::now();
        let policy = ScalingPolicy {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id,
            name: new.name.trim().to_string(),
            target_type: new.target_type,
            target_id: new.target_id,
            min_replicas: new.min_replicas,
            max_replicas: new.max_replicas,
            cooldown_seconds: new.cooldown_seconds,
            scale_to_zero: new.scale_to_zero,
            idle_timeout_seconds: new.idle_timeout_seconds,
            enabled: new.enabled,
            rules: new.rules,
            schedules: new.schedules,
            created_at: now,
            updated_at: now,
        };
        validate_policy(&policy)?;
        self.check_target_exists(ctx, &policy)?;

        self.store().insert_policy(
            ctx,
            &policy,
            &PolicyState::new(policy.id, policy.min_replicas, now),
            &IdleState::new(policy.id, now),
        )?;
        info!(
            tenant = %ctx.tenant_id,
            policy = %policy.id,
            name = %policy.name,
            target = %policy.target_key(),
            "scaling policy created"
        );
        Ok(policy)
    }

    pub fn get_policy(&self, ctx: &TenantContext, policy_id: &PolicyId) -> AutoscaleResult<ScalingPolicy> {
        self.load_policy(ctx, policy_id)
    }

    pub fn list_policies(&self, ctx: &TenantContext) -> AutoscaleResult<Vec<ScalingPolicy>> {
        Ok(self.store().list_policies(ctx)?)
    }

    /// Apply a partial update. The merged policy is validated as a whole
    /// before anything is written; new rules restart every debounce window.
    pub async fn update_policy(
        &self,
        ctx: &TenantContext,
        policy_id: &PolicyId,
        patch: PolicyPatch,
    ) -> AutoscaleResult<ScalingPolicy> {
        let slot = self.slot(*policy_id).await;
        let mut memory = slot.lock().await;

        let current = self.load_policy(ctx, policy_id)?;
        if patch.is_empty() {
            return Ok(current);
        }
        if let Some(name) = &patch.name
            && name.trim() != name
        {
            return Err(AutoscaleError::Validation(
                "name must not have leading or trailing whitespace".to_string(),
            ));
        }

        let mut next = patch.apply_to(&current);
        next.updated_at = Utc::now();
        validate_policy(&next)?;
        if next.target_id != current.target_id {
            self.check_target_exists(ctx, &next)?;
        }
        self.store().update_policy(ctx, &next)?;

        if next.rules != current.rules {
            memory.tracker.reset();
        }
        info!(tenant = %ctx.tenant_id, policy = %next.id, "scaling policy updated");
        Ok(next)
    }

    /// Delete a policy. Rejected with `Conflict` while an operation for it
    /// is still in flight.
    pub async fn delete_policy(&self, ctx: &TenantContext, policy_id: &PolicyId) -> AutoscaleResult<()> {
        let slot = self.slot(*policy_id).await;
        let _memory = slot.lock().await;

        if !self.store().delete_policy(ctx, policy_id)? {
            return Err(AutoscaleError::NotFound(format!("policy {policy_id}")));
        }
        self.forget(policy_id).await;
        info!(tenant = %ctx.tenant_id, policy = %policy_id, "scaling policy deleted");
        Ok(())
    }

    pub async fn enable_policy(&self, ctx: &TenantContext, policy_id: &PolicyId) -> AutoscaleResult<ScalingPolicy> {
        self.set_enabled(ctx, policy_id, true).await
    }

    pub async fn disable_policy(&self, ctx: &TenantContext, policy_id: &PolicyId) -> AutoscaleResult<ScalingPolicy> {
        self.set_enabled(ctx, policy_id, false).await
    }

    async fn set_enabled(&self, ctx: &TenantContext, policy_id: &PolicyId, enabled: bool) -> AutoscaleResult<ScalingPolicy> {
        let patch = PolicyPatch {
            enabled: Some(enabled),
            ..Default::default()
        };
        self.update_policy(ctx, policy_id, patch).await
    }

    pub fn get_policy_state(&self, ctx: &TenantContext, policy_id: &PolicyId) -> AutoscaleResult<PolicyState> {
        self.store()
            .get_policy_state(ctx, policy_id)?
            .ok_or_else(|| AutoscaleError::NotFound(format!("state of policy {policy_id}")))
    }

    /// Scaling history, newest first, at most `limit` rows (capped at
    /// [`MAX_HISTORY_LIMIT`]).
    pub fn list_history(
        &self,
        ctx: &TenantContext,
        policy_id: Option<&PolicyId>,
        limit: usize,
    ) -> AutoscaleResult<Vec<ScalingHistory>> {
        if limit == 0 {
            return Err(AutoscaleError::Validation("limit must be at least 1".to_string()));
        }
        if let Some(id) = policy_id {
            self.load_policy(ctx, id)?;
        }
        Ok(self
            .store()
            .list_history(ctx, policy_id, limit.min(MAX_HISTORY_LIMIT))?)
    }

    /// `nodes` policies must point at an existing pool of the same tenant.
    fn check_target_exists(&self, ctx: &TenantContext, policy: &ScalingPolicy) -> AutoscaleResult<()> {
        if policy.target_type != TargetType::Nodes {
            return Ok(());
        }
        let Some(pool_id) = policy.target_id else {
            return Ok(());
        };
        if self.store().get_pool(ctx, &pool_id)?.is_none() {
            return Err(AutoscaleError::Validation(format!(
                "target node pool {pool_id} does not exist"
            )));
        }
        Ok(())
    }
}
