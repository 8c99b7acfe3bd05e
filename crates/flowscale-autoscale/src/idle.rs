//! Idle/wake tracker: activity recording, explicit wakes, and cost savings
//! of scale-to-zero.
//!
//! Activity never wakes a policy on its own. A policy at zero comes back
//! only through [`IdleTracker::wake_policy`] / [`IdleTracker::wake_all`] or
//! an evaluation that proposes a non-zero target.
//!
//! Savings are computed from persisted idle periods clipped to the
//! requested window and split at UTC midnight, so each idle hour lands in
//! exactly one day.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use flowscale_state::{
    IdleState, OperationId, OperationState, PolicyId, ScalingPolicy, TargetType, TenantContext,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::PolicyEngine;
use crate::error::{AutoscaleError, AutoscaleResult};

/// Hourly cost of running a policy's target.
pub trait CostModel: Send + Sync {
    fn hourly_cost(&self, policy: &ScalingPolicy) -> f64;
}

/// Fixed hourly rate per target type.
#[derive(Debug, Clone, Default)]
pub struct StaticCostModel {
    rates: HashMap<TargetType, f64>,
    default_rate: f64,
}

impl StaticCostModel {
    pub fn new(default_rate: f64) -> Self {
        Self {
            rates: HashMap::new(),
            default_rate,
        }
    }

    pub fn with_rate(mut self, target_type: TargetType, hourly: f64) -> Self {
        self.rates.insert(target_type, hourly);
        self
    }
}

impl CostModel for StaticCostModel {
    fn hourly_cost(&self, policy: &ScalingPolicy) -> f64 {
        self.rates
            .get(&policy.target_type)
            .copied()
            .unwrap_or(self.default_rate)
    }
}

/// Idle tracker configuration.
#[derive(Debug, Clone)]
pub struct IdleConfig {
    /// Default bound on waiting for a woken target to become ready.
    pub wake_timeout: Duration,
    /// How often the wake waits re-check the operation.
    pub wake_poll_interval: Duration,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            wake_timeout: Duration::from_secs(300),
            wake_poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WakeOptions {
    pub wait_for_ready: bool,
    /// Overrides [`IdleConfig::wake_timeout`].
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeStatus {
    /// Scale-up started; the caller did not wait.
    Started,
    /// The operation completed.
    Ready,
    /// The wait bound elapsed with the operation still running.
    StillInProgress,
    /// The operation failed or was cancelled after it started.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct WakeOutcome {
    pub policy_id: PolicyId,
    pub target_replicas: u32,
    pub operation_id: Option<OperationId>,
    pub status: WakeStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailySavings {
    pub date: NaiveDate,
    pub idle_hours: f64,
    pub savings: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicySavings {
    pub policy_id: PolicyId,
    pub name: String,
    pub hourly_cost: f64,
    pub idle_hours: f64,
    pub savings: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostSavings {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub idle_hours: f64,
    pub savings: f64,
    pub per_policy: Vec<PolicySavings>,
    pub daily: Vec<DailySavings>,
}

pub struct IdleTracker {
    engine: Arc<PolicyEngine>,
    costs: Arc<dyn CostModel>,
    config: IdleConfig,
}

impl IdleTracker {
    pub fn new(engine: Arc<PolicyEngine>, costs: Arc<dyn CostModel>, config: IdleConfig) -> Self {
        Self { engine, costs, config }
    }

    /// Record activity on a policy's target.
    pub async fn record_activity(&self, ctx: &TenantContext, policy_id: &PolicyId) -> AutoscaleResult<IdleState> {
        self.record_activity_at(ctx, policy_id, Utc::now()).await
    }

    pub async fn record_activity_at(
        &self,
        ctx: &TenantContext,
        policy_id: &PolicyId,
        now: DateTime<Utc>,
    ) -> AutoscaleResult<IdleState> {
        self.engine.load_policy(ctx, policy_id)?;
        let idle = self.engine.store().update_idle_state(ctx, policy_id, now, |s| {
            s.last_activity_at = Some(now);
            s.idle_since = None;
        })?;
        debug!(policy = %policy_id, scaled_to_zero = idle.is_scaled_to_zero, "activity recorded");
        Ok(idle)
    }

    /// Wake a policy that is at zero replicas.
    ///
    /// Fails with `AlreadyRunning` if it has replicas. With
    /// `wait_for_ready`, waits up to the timeout for the scaling operation
    /// and reports `StillInProgress` rather than waiting longer.
    pub async fn wake_policy(
        &self,
        ctx: &TenantContext,
        policy_id: &PolicyId,
        reason: &str,
        options: WakeOptions,
    ) -> AutoscaleResult<WakeOutcome> {
        let decision = self.engine.wake_at(ctx, policy_id, reason, Utc::now()).await?;
        info!(
            tenant = %ctx.tenant_id,
            policy = %policy_id,
            replicas = decision.target_replicas,
            %reason,
            "policy woken"
        );

        let mut outcome = WakeOutcome {
            policy_id: *policy_id,
            target_replicas: decision.target_replicas,
            operation_id: decision.operation_id,
            status: WakeStatus::Started,
            error: None,
        };
        let (true, Some(operation_id)) = (options.wait_for_ready, decision.operation_id) else {
            return Ok(outcome);
        };

        let timeout = options.timeout.unwrap_or(self.config.wake_timeout);
        match tokio::time::timeout(timeout, self.wait_for_operation(ctx, &operation_id)).await {
            Ok(Ok((OperationState::Completed, _))) => outcome.status = WakeStatus::Ready,
            Ok(Ok((_, error))) => {
                outcome.status = WakeStatus::Failed;
                outcome.error = error;
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!(policy = %policy_id, operation = %operation_id, "wake still in progress at timeout");
                outcome.status = WakeStatus::StillInProgress;
            }
        }
        Ok(outcome)
    }

    async fn wait_for_operation(
        &self,
        ctx: &TenantContext,
        operation_id: &OperationId,
    ) -> AutoscaleResult<(OperationState, Option<String>)> {
        loop {
            let op = self
                .engine
                .store()
                .get_operation(ctx, operation_id)?
                .ok_or_else(|| AutoscaleError::NotFound(format!("operation {operation_id}")))?;
            if op.state.is_terminal() {
                return Ok((op.state, op.error));
            }
            tokio::time::sleep(self.config.wake_poll_interval).await;
        }
    }

    /// Wake every enabled scaled-to-zero policy of the tenant.
    pub async fn wake_all(
        &self,
        ctx: &TenantContext,
        reason: &str,
        options: WakeOptions,
    ) -> AutoscaleResult<Vec<(PolicyId, AutoscaleResult<WakeOutcome>)>> {
        let mut results = Vec::new();
        for idle in self.list_scaled_to_zero(ctx)? {
            let Some(policy) = self.engine.store().get_policy(ctx, &idle.policy_id)? else {
                continue;
            };
            if !policy.enabled {
                continue;
            }
            let outcome = self.wake_policy(ctx, &policy.id, reason, options).await;
            if let Err(e) = &outcome {
                warn!(policy = %policy.id, error = %e, "wake failed");
            }
            results.push((policy.id, outcome));
        }
        Ok(results)
    }

    pub fn get_idle_state(&self, ctx: &TenantContext, policy_id: &PolicyId) -> AutoscaleResult<IdleState> {
        self.engine
            .store()
            .get_idle_state(ctx, policy_id)?
            .ok_or_else(|| AutoscaleError::NotFound(format!("idle state of policy {policy_id}")))
    }

    pub fn list_scaled_to_zero(&self, ctx: &TenantContext) -> AutoscaleResult<Vec<IdleState>> {
        let mut states: Vec<IdleState> = self
            .engine
            .store()
            .list_idle_states(ctx)?
            .into_iter()
            .filter(|s| s.is_scaled_to_zero)
            .collect();
        states.sort_by_key(|s| s.scaled_to_zero_at);
        Ok(states)
    }

    /// Cost saved by scale-to-zero within `[from, to)`, optionally for one
    /// policy. Periods still open count up to now.
    pub fn get_cost_savings(
        &self,
        ctx: &TenantContext,
        policy_id: Option<&PolicyId>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AutoscaleResult<CostSavings> {
        self.get_cost_savings_at(ctx, policy_id, from, to, Utc::now())
    }

    pub fn get_cost_savings_at(
        &self,
        ctx: &TenantContext,
        policy_id: Option<&PolicyId>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AutoscaleResult<CostSavings> {
        if from >= to {
            return Err(AutoscaleError::Validation("`from` must be before `to`".to_string()));
        }
        let store = self.engine.store();
        let policies: Vec<ScalingPolicy> = match policy_id {
            Some(id) => vec![self.engine.load_policy(ctx, id)?],
            None => store.list_policies(ctx)?,
        };

        let mut daily: BTreeMap<NaiveDate, (f64, f64)> = BTreeMap::new();
        let mut per_policy = Vec::new();
        for policy in &policies {
            let rate = self.costs.hourly_cost(policy);
            let mut idle_hours = 0.0;
            for period in store.list_idle_periods(ctx, Some(&policy.id))? {
                let start = period.started_at.max(from);
                let end = period.ended_at.unwrap_or(now).min(to);
                for (date, hours) in split_by_utc_day(start, end) {
                    idle_hours += hours;
                    let entry = daily.entry(date).or_default();
                    entry.0 += hours;
                    entry.1 += hours * rate;
                }
            }
            per_policy.push(PolicySavings {
                policy_id: policy.id,
                name: policy.name.clone(),
                hourly_cost: rate,
                idle_hours,
                savings: idle_hours * rate,
            });
        }

        Ok(CostSavings {
            from,
            to,
            idle_hours: per_policy.iter().map(|p| p.idle_hours).sum(),
            savings: per_policy.iter().map(|p| p.savings).sum(),
            per_policy,
            daily: daily
                .into_iter()
                .map(|(date, (idle_hours, savings))| DailySavings {
                    date,
                    idle_hours,
                    savings,
                })
                .collect(),
        })
    }
}

/// Split `[start, end)` into per-UTC-day hour counts.
fn split_by_utc_day(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<(NaiveDate, f64)> {
    let mut parts = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let date = cursor.date_naive();
        let next_midnight = date
            .succ_opt()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| d.and_utc())
            .unwrap_or(end);
        let segment_end = end.min(next_midnight);
        let hours = (segment_end - cursor).num_milliseconds() as f64 / 3_600_000.0;
        parts.push((date, hours));
        cursor = segment_end;
    }
    parts
}
