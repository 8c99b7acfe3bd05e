//! Policy engine: turns metrics, schedules, cooldown and idle state into
//! one [`Decision`] per evaluation, and commits it.
//!
//! Evaluation and commit of a single policy are serialized by a per-policy
//! async mutex that also guards the policy's in-memory debounce tracker.
//! The store's generation check in `commit_scale` backs this up across
//! processes sharing one database.
//!
//! # Decision algorithm
//!
//! ```text
//! schedule active?        -> clamp(desired, min, max), or 0 when idle justifies it
//! scale-up rule fired?    -> clamp(current + up, min, max)   (wins ties with scale-down)
//! idle past timeout?      -> 0                               (scale_to_zero only)
//! scale-down rule fired?  -> clamp(current + down, floor, max)
//! otherwise               -> clamp(current, floor, max)
//!
//! action != none && in cooldown -> none, cooldown_suppressed = true
//! ```
//!
//! `floor` is 0 for scale-to-zero policies that are idle or already at
//! zero, `min_replicas` otherwise.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flowscale_state::{
    CommitScale, Decision, IdleState, IdleTransition, MetricsSnapshot, OperationState, PolicyId,
    PolicyState, ScaleAction, ScalingHistory, ScalingPolicy, StateStore, TenantContext,
};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{AutoscaleError, AutoscaleResult};
use crate::metrics::MetricsProvider;
use crate::rules::{Direction, DurationTracker, RuleOutcome, evaluate_rules};
use crate::scaler::{ScaleRequest, TargetScaler};
use crate::schedule::{ActiveSchedule, evaluate_schedules};

/// Upper bound on how far back a schedule window may reach.
const MAX_SCHEDULE_WINDOW: chrono::Duration = chrono::Duration::hours(24);

/// Policy engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Window searched for schedule triggers on a policy's first
    /// evaluation after startup.
    pub schedule_lookback: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schedule_lookback: Duration::from_secs(300),
        }
    }
}

/// Outcome counts of one pass over all enabled policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluationSummary {
    pub evaluated: usize,
    pub committed: usize,
    pub failed: usize,
}

/// Metrics source and scaler for `nodes` policies.
struct NodeTargets {
    metrics: Arc<dyn MetricsProvider>,
    scaler: Arc<dyn TargetScaler>,
}

/// In-memory evaluation state of one policy.
#[derive(Default)]
pub(crate) struct PolicyMemory {
    pub(crate) tracker: DurationTracker,
    pub(crate) last_evaluated_at: Option<DateTime<Utc>>,
}

pub struct PolicyEngine {
    store: StateStore,
    config: EngineConfig,
    metrics: Arc<dyn MetricsProvider>,
    compute: Arc<dyn TargetScaler>,
    nodes: Option<NodeTargets>,
    slots: Mutex<HashMap<PolicyId, Arc<Mutex<PolicyMemory>>>>,
}

impl PolicyEngine {
    /// Create an engine that scales compute targets through `compute`.
    pub fn new(
        store: StateStore,
        config: EngineConfig,
        metrics: Arc<dyn MetricsProvider>,
        compute: Arc<dyn TargetScaler>,
    ) -> Self {
        Self {
            store,
            config,
            metrics,
            compute,
            nodes: None,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Enable `nodes` policies, backed by the given capacity metrics and
    /// node pool scaler.
    pub fn with_node_targets(mut self, metrics: Arc<dyn MetricsProvider>, scaler: Arc<dyn TargetScaler>) -> Self {
        self.nodes = Some(NodeTargets { metrics, scaler });
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub(crate) async fn slot(&self, policy_id: PolicyId) -> Arc<Mutex<PolicyMemory>> {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(policy_id).or_default())
    }

    /// Drop the in-memory state of a deleted policy.
    pub(crate) async fn forget(&self, policy_id: &PolicyId) {
        self.slots.lock().await.remove(policy_id);
    }

    fn metrics_for(&self, policy: &ScalingPolicy) -> Option<&Arc<dyn MetricsProvider>> {
        if policy.target_type.is_compute() {
            Some(&self.metrics)
        } else {
            self.nodes.as_ref().map(|n| &n.metrics)
        }
    }

    fn scaler_for(&self, policy: &ScalingPolicy) -> Option<&Arc<dyn TargetScaler>> {
        if policy.target_type.is_compute() {
            Some(&self.compute)
        } else {
            self.nodes.as_ref().map(|n| &n.scaler)
        }
    }

    pub(crate) fn load_policy(&self, ctx: &TenantContext, policy_id: &PolicyId) -> AutoscaleResult<ScalingPolicy> {
        self.store
            .get_policy(ctx, policy_id)?
            .ok_or_else(|| AutoscaleError::NotFound(format!("policy {policy_id}")))
    }

    async fn gather_metrics(&self, ctx: &TenantContext, policy: &ScalingPolicy) -> AutoscaleResult<MetricsSnapshot> {
        let provider = self.metrics_for(policy).ok_or_else(|| {
            AutoscaleError::Metrics(format!("no metrics source for {} targets", policy.target_type))
        })?;
        provider.snapshot(ctx, policy).await
    }

    fn schedule_window_start(&self, last_evaluated_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
        let lookback = chrono::Duration::from_std(self.config.schedule_lookback).unwrap_or(MAX_SCHEDULE_WINDOW);
        let start = last_evaluated_at.unwrap_or(now - lookback.min(MAX_SCHEDULE_WINDOW));
        start.max(now - MAX_SCHEDULE_WINDOW)
    }

    /// Evaluate a policy now. See [`PolicyEngine::evaluate_at`].
    pub async fn evaluate(&self, ctx: &TenantContext, policy_id: &PolicyId, dry_run: bool) -> AutoscaleResult<Decision> {
        self.evaluate_at(ctx, policy_id, dry_run, Utc::now()).await
    }

    /// Evaluate a policy as of `now` and, unless `dry_run`, commit the result.
    ///
    /// A dry run mutates nothing: not the store, not the debounce tracker,
    /// not the schedule window. Metrics failures degrade a dry run to an
    /// empty snapshot instead of failing it.
    pub async fn evaluate_at(
        &self,
        ctx: &TenantContext,
        policy_id: &PolicyId,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> AutoscaleResult<Decision> {
        let slot = self.slot(*policy_id).await;
        let mut memory = slot.lock().await;

        let policy = self.load_policy(ctx, policy_id)?;
        if !policy.enabled {
            return Err(AutoscaleError::PolicyDisabled(policy.id));
        }
        let state = self
            .store
            .get_policy_state(ctx, policy_id)?
            .unwrap_or_else(|| PolicyState::new(policy.id, policy.min_replicas, now));
        let idle = self
            .store
            .get_idle_state(ctx, policy_id)?
            .unwrap_or_else(|| IdleState::new(policy.id, policy.created_at));

        let snapshot = match self.gather_metrics(ctx, &policy).await {
            Ok(snapshot) => snapshot,
            Err(e) if dry_run => {
                debug!(policy = %policy.id, error = %e, "dry run continuing without metrics");
                MetricsSnapshot::new(policy.target_key(), now)
            }
            Err(e) => return Err(e),
        };

        let window_start = self.schedule_window_start(memory.last_evaluated_at, now);
        let (up, down) = {
            let mut scratch;
            let tracker = if dry_run {
                scratch = memory.tracker.clone();
                &mut scratch
            } else {
                &mut memory.tracker
            };
            (
                evaluate_rules(&policy.rules.scale_up, Direction::Up, &snapshot, tracker, now),
                evaluate_rules(&policy.rules.scale_down, Direction::Down, &snapshot, tracker, now),
            )
        };
        let schedule = evaluate_schedules(&policy.schedules, window_start, now);

        let idle_for = now - idle.last_activity_at.unwrap_or(policy.created_at);
        let past_idle_timeout = idle_for >= policy.idle_timeout();
        let idle_justified = policy.scale_to_zero && past_idle_timeout;
        let proposal = plan(&PlanInput {
            policy: &policy,
            current: state.current_replicas,
            idle_justified,
            zero_eligible: policy.scale_to_zero && (idle_justified || idle.is_scaled_to_zero),
            idle_for,
            schedule: schedule.as_ref(),
            up: &up,
            down: &down,
        });

        let mut decision = Decision {
            policy_id: policy.id,
            previous_replicas: state.current_replicas,
            target_replicas: proposal.target,
            action: ScaleAction::between(state.current_replicas, proposal.target),
            reason: proposal.reason,
            cooldown_suppressed: false,
            dry_run,
            operation_id: None,
            error: None,
            evaluated_at: now,
        };
        if decision.action != ScaleAction::None
            && let Some(until) = state.in_cooldown_until.filter(|_| state.in_cooldown(now))
        {
            decision.reason = format!(
                "{} (would scale {} -> {}, suppressed by cooldown until {until})",
                decision.reason, decision.previous_replicas, decision.target_replicas
            );
            decision.target_replicas = decision.previous_replicas;
            decision.action = ScaleAction::None;
            decision.cooldown_suppressed = true;
        }

        if !dry_run {
            if past_idle_timeout && idle.idle_since.is_none() {
                self.store.update_idle_state(ctx, policy_id, now, |s| {
                    s.idle_since.get_or_insert(now);
                })?;
                debug!(policy = %policy.id, idle_secs = idle_for.num_seconds(), "policy crossed idle threshold");
            }
        }

        if dry_run || decision.action == ScaleAction::None {
            if !dry_run && !(schedule.is_some() && decision.cooldown_suppressed) {
                memory.last_evaluated_at = Some(now);
            }
            debug!(
                policy = %policy.id,
                dry_run,
                current = decision.previous_replicas,
                target = decision.target_replicas,
                cooldown_suppressed = decision.cooldown_suppressed,
                reason = %decision.reason,
                "policy evaluated"
            );
            return Ok(decision);
        }

        let idle_transition = if decision.target_replicas == 0 && policy.scale_to_zero {
            IdleTransition::ScaledToZero
        } else if decision.previous_replicas == 0 && idle.is_scaled_to_zero {
            IdleTransition::Woken {
                reason: format!("evaluation: {}", decision.reason),
            }
        } else {
            IdleTransition::Unchanged
        };
        let trigger = proposal.trigger;
        let committed = self
            .commit(ctx, &policy, &state, &mut decision, idle_transition, trigger, now)
            .await;
        // A scheduled target that did not land keeps its trigger inside the next window.
        if schedule.is_none() || (committed.is_ok() && decision.error.is_none()) {
            memory.last_evaluated_at = Some(now);
        }
        committed?;
        Ok(decision)
    }

    /// Scale a policy at zero back up to `max(1, min_replicas)`.
    ///
    /// The caller holds nothing; this takes the policy's slot like any
    /// evaluation. Cooldown does not block a wake, but a wake starts one.
    pub(crate) async fn wake_at(
        &self,
        ctx: &TenantContext,
        policy_id: &PolicyId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> AutoscaleResult<Decision> {
        let slot = self.slot(*policy_id).await;
        let _memory = slot.lock().await;

        let policy = self.load_policy(ctx, policy_id)?;
        if !policy.enabled {
            return Err(AutoscaleError::PolicyDisabled(policy.id));
        }
        let state = self
            .store
            .get_policy_state(ctx, policy_id)?
            .unwrap_or_else(|| PolicyState::new(policy.id, policy.min_replicas, now));
        if state.current_replicas > 0 {
            return Err(AutoscaleError::AlreadyRunning {
                policy_id: policy.id,
                replicas: state.current_replicas,
            });
        }

        let target = policy.min_replicas.max(1).min(policy.max_replicas);
        let mut decision = Decision {
            policy_id: policy.id,
            previous_replicas: 0,
            target_replicas: target,
            action: ScaleAction::ScaleUp,
            reason: format!("wake: {reason}"),
            cooldown_suppressed: false,
            dry_run: false,
            operation_id: None,
            error: None,
            evaluated_at: now,
        };
        let transition = IdleTransition::Woken {
            reason: reason.to_string(),
        };
        self.commit(ctx, &policy, &state, &mut decision, transition, (None, None), now)
            .await?;
        match decision.error.take() {
            Some(e) => Err(AutoscaleError::Provider(e)),
            None => Ok(decision),
        }
    }

    /// Invoke the scaler and, if it started an operation, advance state.
    ///
    /// Scaler failures land on `decision.error` and leave state untouched,
    /// so the next evaluation retries the same generation.
    #[allow(clippy::too_many_arguments)]
    async fn commit(
        &self,
        ctx: &TenantContext,
        policy: &ScalingPolicy,
        state: &PolicyState,
        decision: &mut Decision,
        idle: IdleTransition,
        trigger: (Option<String>, Option<f64>),
        now: DateTime<Utc>,
    ) -> AutoscaleResult<()> {
        let Some(scaler) = self.scaler_for(policy) else {
            decision.error = Some(format!("no scaler configured for {} targets", policy.target_type));
            warn!(policy = %policy.id, target_type = %policy.target_type, "no scaler configured");
            return Ok(());
        };

        let request = ScaleRequest {
            policy,
            current: decision.previous_replicas,
            target: decision.target_replicas,
            reason: &decision.reason,
        };
        let op = match scaler.scale(ctx, request).await {
            Ok(op) if op.state != OperationState::Failed => op,
            Ok(op) => {
                decision.operation_id = Some(op.id);
                decision.error = Some(op.error.unwrap_or_else(|| "scaling operation failed".to_string()));
                warn!(policy = %policy.id, operation = %op.id, "scaling operation failed, state not advanced");
                return Ok(());
            }
            Err(e) => {
                decision.error = Some(e.to_string());
                warn!(policy = %policy.id, error = %e, "scaler call failed, state not advanced");
                return Ok(());
            }
        };

        let next = PolicyState {
            policy_id: policy.id,
            current_replicas: decision.target_replicas,
            last_scale_at: Some(now),
            in_cooldown_until: Some(now.checked_add_signed(policy.cooldown()).unwrap_or(DateTime::<Utc>::MAX_UTC)),
            generation: state.generation + 1,
            updated_at: now,
        };
        let (trigger_metric, trigger_value) = trigger;
        let history = ScalingHistory {
            id: Uuid::new_v4(),
            policy_id: policy.id,
            sequence: next.generation,
            previous_replicas: decision.previous_replicas,
            new_replicas: decision.target_replicas,
            action: decision.action,
            reason: decision.reason.clone(),
            trigger_metric,
            trigger_value,
            operation_id: Some(op.id),
            created_at: now,
        };
        let idle_kind = format!("{idle:?}");
        self.store.commit_scale(
            ctx,
            CommitScale {
                state: &next,
                history: &history,
                idle,
                now,
            },
        )?;
        decision.operation_id = Some(op.id);

        info!(
            policy = %policy.id,
            operation = %op.id,
            from = decision.previous_replicas,
            to = decision.target_replicas,
            generation = next.generation,
            idle = %idle_kind,
            reason = %decision.reason,
            "scaling decision committed"
        );
        Ok(())
    }

    /// Evaluate every enabled policy of every tenant, in parallel.
    pub async fn evaluate_all(self: &Arc<Self>) -> AutoscaleResult<EvaluationSummary> {
        let policies = self.store.list_enabled_policies_all_tenants()?;
        let mut tasks = JoinSet::new();
        for policy in policies {
            let engine = Arc::clone(self);
            tasks.spawn(async move {
                let ctx = TenantContext::new(policy.tenant_id);
                (policy.id, engine.evaluate(&ctx, &policy.id, false).await)
            });
        }

        let mut summary = EvaluationSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(decision))) => {
                    summary.evaluated += 1;
                    if decision.committed() {
                        summary.committed += 1;
                    }
                    if decision.error.is_some() {
                        summary.failed += 1;
                    }
                }
                // Disabled or deleted between listing and evaluation.
                Ok((_, Err(AutoscaleError::PolicyDisabled(_) | AutoscaleError::NotFound(_)))) => {}
                Ok((policy, Err(e))) => {
                    summary.failed += 1;
                    warn!(%policy, error = %e, "policy evaluation failed");
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(error = %e, "policy evaluation task panicked");
                }
            }
        }
        Ok(summary)
    }

    /// Run the evaluation loop until `shutdown` changes.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "policy engine started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.evaluate_all().await {
                        Ok(summary) => debug!(
                            evaluated = summary.evaluated,
                            committed = summary.committed,
                            failed = summary.failed,
                            "evaluation pass finished"
                        ),
                        Err(e) => error!(error = %e, "evaluation pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("policy engine shutting down");
                    break;
                }
            }
        }
    }
}

struct PlanInput<'a> {
    policy: &'a ScalingPolicy,
    current: u32,
    idle_justified: bool,
    zero_eligible: bool,
    idle_for: chrono::Duration,
    schedule: Option<&'a ActiveSchedule<'a>>,
    up: &'a RuleOutcome,
    down: &'a RuleOutcome,
}

struct Proposal {
    target: u32,
    reason: String,
    trigger: (Option<String>, Option<f64>),
}

impl Proposal {
    fn new(target: u32, reason: impl Into<String>) -> Self {
        Self {
            target,
            reason: reason.into(),
            trigger: (None, None),
        }
    }

    fn from_rule(target: u32, reason: String, rule: &RuleOutcome) -> Self {
        Self {
            target,
            reason,
            trigger: (rule.metric.clone(), rule.value),
        }
    }
}

fn shift(current: u32, delta: i32, floor: u32, ceiling: u32) -> u32 {
    let moved = i64::from(current) + i64::from(delta);
    // floor <= ceiling holds for validated policies; the cast is lossless.
    moved.clamp(i64::from(floor), i64::from(ceiling.max(floor))) as u32
}

fn plan(input: &PlanInput<'_>) -> Proposal {
    let policy = input.policy;
    let current = input.current;
    let floor = if input.zero_eligible { 0 } else { policy.min_replicas };
    let idle_reason = || {
        format!(
            "idle for {}s (timeout {}s)",
            input.idle_for.num_seconds(),
            policy.idle_timeout_seconds
        )
    };

    if let Some(active) = input.schedule {
        if input.idle_justified {
            return Proposal::new(0, format!("{} active, but {}", active.label(), idle_reason()));
        }
        let target = active
            .schedule
            .desired_replicas
            .clamp(policy.min_replicas, policy.max_replicas.max(policy.min_replicas));
        return Proposal::new(
            target,
            format!(
                "{} triggered at {} wants {} replicas",
                active.label(),
                active.triggered_at,
                active.schedule.desired_replicas
            ),
        );
    }

    // Scale-up wins ties: availability over cost.
    let winner = match (input.up.fires, input.down.fires) {
        (true, true) if input.up.magnitude() >= input.down.magnitude() => Some(input.up),
        (true, true) | (false, true) => Some(input.down),
        (true, false) => Some(input.up),
        (false, false) => None,
    };

    match winner {
        Some(rule) if rule.delta > 0 => Proposal::from_rule(
            shift(current, rule.delta, policy.min_replicas, policy.max_replicas),
            format!("scale-up rule fired: {}", rule.reason),
            rule,
        ),
        _ if input.idle_justified => Proposal::new(0, idle_reason()),
        Some(rule) => Proposal::from_rule(
            shift(current, rule.delta, floor, policy.max_replicas),
            format!("scale-down rule fired: {}", rule.reason),
            rule,
        ),
        None if current == 0 && input.zero_eligible => Proposal::new(0, "scaled to zero, no rule fired"),
        None => {
            let target = shift(current, 0, floor, policy.max_replicas);
            if target == current {
                Proposal::new(target, "no rule fired")
            } else {
                Proposal::new(
                    target,
                    format!(
                        "{current} replicas outside bounds [{}, {}]",
                        policy.min_replicas, policy.max_replicas
                    ),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scaler::{ComputeTargetScaler, InMemoryComputeScaler};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use flowscale_state::{NewPolicy, Operator, Rule, RuleSet, Schedule, TargetType};
    use std::collections::BTreeMap;

    /// Metrics provider returning whatever the test last set.
    #[derive(Default)]
    struct FixedMetrics {
        values: Mutex<BTreeMap<String, f64>>,
        failing: Mutex<bool>,
    }

    impl FixedMetrics {
        async fn set(&self, metric: &str, value: f64) {
            self.values.lock().await.insert(metric.to_string(), value);
        }
    }

    #[async_trait]
    impl MetricsProvider for FixedMetrics {
        async fn snapshot(&self, _ctx: &TenantContext, policy: &ScalingPolicy) -> AutoscaleResult<MetricsSnapshot> {
            if *self.failing.lock().await {
                return Err(AutoscaleError::Metrics("exporter down".into()));
            }
            Ok(MetricsSnapshot {
                target_key: policy.target_key(),
                observed_at: Utc::now(),
                values: self.values.lock().await.clone(),
            })
        }
    }

    struct Harness {
        engine: Arc<PolicyEngine>,
        metrics: Arc<FixedMetrics>,
        backend: Arc<InMemoryComputeScaler>,
        store: StateStore,
        ctx: TenantContext,
    }

    fn harness() -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        let metrics = Arc::new(FixedMetrics::default());
        let backend = Arc::new(InMemoryComputeScaler::new());
        let engine = PolicyEngine::new(
            store.clone(),
            EngineConfig::default(),
            metrics.clone(),
            Arc::new(ComputeTargetScaler::new(store.clone(), backend.clone())),
        );
        Harness {
            engine: Arc::new(engine),
            metrics,
            backend,
            store,
            ctx: TenantContext::new(Uuid::new_v4()),
        }
    }

    fn queued_policy() -> NewPolicy {
        NewPolicy {
            name: "trino-queue".into(),
            target_type: TargetType::Trino,
            target_id: None,
            min_replicas: 1,
            max_replicas: 10,
            cooldown_seconds: 300,
            scale_to_zero: false,
            idle_timeout_seconds: 900,
            enabled: true,
            rules: RuleSet {
                scale_up: vec![Rule {
                    metric: "queued".into(),
                    operator: Operator::Gt,
                    threshold: 5.0,
                    duration_seconds: 0,
                    scale_by: 2,
                }],
                scale_down: vec![Rule {
                    metric: "queued".into(),
                    operator: Operator::Lt,
                    threshold: 1.0,
                    duration_seconds: 0,
                    scale_by: -1,
                }],
            },
            schedules: Vec::new(),
        }
    }

    #[tokio::test]
    async fn rule_fires_and_commits() {
        let h = harness();
        let policy = h.engine.create_policy(&h.ctx, queued_policy()).await.unwrap();
        h.metrics.set("queued", 6.0).await;

        let decision = h.engine.evaluate(&h.ctx, &policy.id, false).await.unwrap();
        assert_eq!(decision.action, ScaleAction::ScaleUp);
        assert_eq!(decision.target_replicas, 3);
        assert!(decision.committed());

        let state = h.store.get_policy_state(&h.ctx, &policy.id).unwrap().unwrap();
        assert_eq!(state.current_replicas, 3);
        assert_eq!(state.generation, 1);

        let history = h.store.list_history(&h.ctx, Some(&policy.id), 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!((history[0].previous_replicas, history[0].new_replicas), (1, 3));
        assert!(history[0].reason.contains("queued"));
        assert_eq!(history[0].trigger_value, Some(6.0));
        assert_eq!(h.backend.replicas(&format!("{}/trino:fleet", h.ctx.tenant_id)).await, Some(3));
    }

    #[tokio::test]
    async fn cooldown_suppresses_second_action() {
        let h = harness();
        let policy = h.engine.create_policy(&h.ctx, queued_policy()).await.unwrap();
        h.metrics.set("queued", 6.0).await;
        let t0 = Utc::now();

        assert!(h.engine.evaluate_at(&h.ctx, &policy.id, false, t0).await.unwrap().committed());
        let second = h
            .engine
            .evaluate_at(&h.ctx, &policy.id, false, t0 + ChronoDuration::seconds(10))
            .await
            .unwrap();
        assert_eq!(second.action, ScaleAction::None);
        assert!(second.cooldown_suppressed);
        assert_eq!(second.target_replicas, 3);

        // After the cooldown the next action goes through.
        let third = h
            .engine
            .evaluate_at(&h.ctx, &policy.id, false, t0 + ChronoDuration::seconds(301))
            .await
            .unwrap();
        assert_eq!(third.target_replicas, 5);
        assert_eq!(h.store.list_history(&h.ctx, Some(&policy.id), 10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_evaluations_commit_once() {
        let h = harness();
        let policy = h.engine.create_policy(&h.ctx, queued_policy()).await.unwrap();
        h.metrics.set("queued", 6.0).await;

        let (a, b) = tokio::join!(
            h.engine.evaluate(&h.ctx, &policy.id, false),
            h.engine.evaluate(&h.ctx, &policy.id, false)
        );
        let committed = [a.unwrap(), b.unwrap()]
            .iter()
            .filter(|d| d.committed())
            .count();
        assert_eq!(committed, 1);
        assert_eq!(h.store.list_history(&h.ctx, Some(&policy.id), 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dry_run_mutates_nothing() {
        let h = harness();
        let mut new = queued_policy();
        new.rules.scale_up[0].duration_seconds = 60;
        let policy = h.engine.create_policy(&h.ctx, new).await.unwrap();
        h.metrics.set("queued", 6.0).await;
        let t0 = Utc::now();

        // Dry runs never start a debounce window.
        for offset in [0, 30, 61] {
            let d = h
                .engine
                .evaluate_at(&h.ctx, &policy.id, true, t0 + ChronoDuration::seconds(offset))
                .await
                .unwrap();
            assert!(d.dry_run);
            assert!(!d.committed());
        }
        let real = h
            .engine
            .evaluate_at(&h.ctx, &policy.id, false, t0 + ChronoDuration::seconds(62))
            .await
            .unwrap();
        assert_eq!(real.action, ScaleAction::None);

        let state = h.store.get_policy_state(&h.ctx, &policy.id).unwrap().unwrap();
        assert_eq!(state.current_replicas, 1);
        assert!(h.store.list_history(&h.ctx, None, 10).unwrap().is_empty());
        assert!(h.store.list_operations(&h.ctx, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn dry_run_reports_would_be_action_and_tolerates_metrics_failure() {
        let h = harness();
        let policy = h.engine.create_policy(&h.ctx, queued_policy()).await.unwrap();
        h.metrics.set("queued", 6.0).await;

        let d = h.engine.evaluate(&h.ctx, &policy.id, true).await.unwrap();
        assert_eq!(d.action, ScaleAction::ScaleUp);
        assert_eq!(d.target_replicas, 3);

        *h.metrics.failing.lock().await = true;
        let d = h.engine.evaluate(&h.ctx, &policy.id, true).await.unwrap();
        assert!(d.error.is_none());
        let err = h.engine.evaluate(&h.ctx, &policy.id, false).await.unwrap_err();
        assert!(matches!(err, AutoscaleError::Metrics(_)));
    }

    #[tokio::test]
    async fn disabled_policy_is_rejected() {
        let h = harness();
        let mut new = queued_policy();
        new.enabled = false;
        let policy = h.engine.create_policy(&h.ctx, new).await.unwrap();
        let err = h.engine.evaluate(&h.ctx, &policy.id, true).await.unwrap_err();
        assert!(matches!(err, AutoscaleError::PolicyDisabled(id) if id == policy.id));
    }

    #[tokio::test]
    async fn scaler_failure_leaves_state_for_retry() {
        let h = harness();
        let policy = h.engine.create_policy(&h.ctx, queued_policy()).await.unwrap();
        h.metrics.set("queued", 6.0).await;
        h.backend.set_failing(true);

        let failed = h.engine.evaluate(&h.ctx, &policy.id, false).await.unwrap();
        assert!(failed.error.is_some());
        assert!(!failed.committed());
        let state = h.store.get_policy_state(&h.ctx, &policy.id).unwrap().unwrap();
        assert_eq!((state.current_replicas, state.generation), (1, 0));
        assert!(state.in_cooldown_until.is_none());

        h.backend.set_failing(false);
        let retried = h.engine.evaluate(&h.ctx, &policy.id, false).await.unwrap();
        assert!(retried.committed());
        let state = h.store.get_policy_state(&h.ctx, &policy.id).unwrap().unwrap();
        assert_eq!((state.current_replicas, state.generation), (3, 1));
    }

    #[tokio::test]
    async fn scale_up_wins_tie_with_scale_down() {
        let h = harness();
        let mut new = queued_policy();
        new.rules.scale_up[0] = Rule {
            metric: "lag".into(),
            operator: Operator::Gt,
            threshold: 100.0,
            duration_seconds: 0,
            scale_by: 1,
        };
        new.rules.scale_down[0] = Rule {
            metric: "cpu".into(),
            operator: Operator::Lt,
            threshold: 10.0,
            duration_seconds: 0,
            scale_by: -1,
        };
        new.min_replicas = 2;
        let policy = h.engine.create_policy(&h.ctx, new).await.unwrap();
        h.metrics.set("lag", 500.0).await;
        h.metrics.set("cpu", 5.0).await;

        let d = h.engine.evaluate(&h.ctx, &policy.id, true).await.unwrap();
        assert_eq!(d.action, ScaleAction::ScaleUp);
        assert_eq!(d.target_replicas, 3);
    }

    #[tokio::test]
    async fn active_schedule_overrides_rules_and_is_clamped() {
        let h = harness();
        let mut new = queued_policy();
        new.max_replicas = 4;
        new.schedules.push(Schedule {
            name: Some("every-minute".into()),
            cron_expression: "* * * * *".into(),
            desired_replicas: 9,
            timezone: "UTC".into(),
            enabled: true,
        });
        let policy = h.engine.create_policy(&h.ctx, new).await.unwrap();
        h.metrics.set("queued", 0.0).await;

        let d = h.engine.evaluate(&h.ctx, &policy.id, false).await.unwrap();
        assert_eq!(d.target_replicas, 4);
        assert!(d.reason.contains("every-minute"));
    }

    fn morning_schedule(desired: u32) -> Schedule {
        Schedule {
            name: Some("morning".into()),
            cron_expression: "0 9 * * *".into(),
            desired_replicas: desired,
            timezone: "UTC".into(),
            enabled: true,
        }
    }

    fn tomorrow_at_nine() -> DateTime<Utc> {
        (Utc::now() + ChronoDuration::days(1))
            .date_naive()
            .and_hms_opt(9, 0, 0)
            .unwrap()
            .and_utc()
    }

    #[tokio::test]
    async fn failed_scheduled_scale_is_retried_on_next_tick() {
        let h = harness();
        let mut new = queued_policy();
        new.schedules.push(morning_schedule(6));
        let policy = h.engine.create_policy(&h.ctx, new).await.unwrap();
        h.metrics.set("queued", 3.0).await;
        let nine = tomorrow_at_nine();

        h.backend.set_failing(true);
        let failed = h.engine.evaluate_at(&h.ctx, &policy.id, false, nine).await.unwrap();
        assert_eq!(failed.target_replicas, 6);
        assert!(failed.error.is_some());

        h.backend.set_failing(false);
        let retried = h
            .engine
            .evaluate_at(&h.ctx, &policy.id, false, nine + ChronoDuration::seconds(30))
            .await
            .unwrap();
        assert_eq!(retried.target_replicas, 6);
        assert!(retried.reason.contains("morning"));
        assert!(retried.committed());
        assert_eq!(h.store.get_policy_state(&h.ctx, &policy.id).unwrap().unwrap().current_replicas, 6);
    }

    #[tokio::test]
    async fn schedule_suppressed_by_cooldown_applies_once_cooldown_ends() {
        let h = harness();
        let mut new = queued_policy();
        new.schedules.push(morning_schedule(6));
        let policy = h.engine.create_policy(&h.ctx, new).await.unwrap();
        let nine = tomorrow_at_nine();

        h.metrics.set("queued", 6.0).await;
        let early = h
            .engine
            .evaluate_at(&h.ctx, &policy.id, false, nine - ChronoDuration::seconds(60))
            .await
            .unwrap();
        assert_eq!(early.target_replicas, 3);
        assert!(early.committed());

        h.metrics.set("queued", 3.0).await;
        let suppressed = h
            .engine
            .evaluate_at(&h.ctx, &policy.id, false, nine + ChronoDuration::seconds(10))
            .await
            .unwrap();
        assert!(suppressed.cooldown_suppressed);
        assert_eq!(suppressed.target_replicas, 3);

        let applied = h
            .engine
            .evaluate_at(&h.ctx, &policy.id, false, nine + ChronoDuration::seconds(301))
            .await
            .unwrap();
        assert_eq!(applied.target_replicas, 6);
        assert!(applied.reason.contains("morning"));
        assert!(applied.committed());

        // Once applied, the same trigger is not replayed.
        h.metrics.set("queued", 0.0).await;
        let later = h
            .engine
            .evaluate_at(&h.ctx, &policy.id, false, nine + ChronoDuration::seconds(700))
            .await
            .unwrap();
        assert_eq!(later.target_replicas, 5);
        assert!(!later.reason.contains("morning"));
    }

    #[tokio::test]
    async fn idle_policy_scales_to_zero_and_stays_there() {
        let h = harness();
        let mut new = queued_policy();
        new.scale_to_zero = true;
        new.idle_timeout_seconds = 600;
        let policy = h.engine.create_policy(&h.ctx, new).await.unwrap();
        h.metrics.set("queued", 3.0).await;

        let later = Utc::now() + ChronoDuration::hours(1);
        let d = h.engine.evaluate_at(&h.ctx, &policy.id, false, later).await.unwrap();
        assert_eq!(d.target_replicas, 0);
        assert!(d.reason.contains("idle"));

        let idle = h.store.get_idle_state(&h.ctx, &policy.id).unwrap().unwrap();
        assert!(idle.is_scaled_to_zero);
        assert_eq!(idle.idle_since, Some(later));
        assert_eq!(h.store.list_idle_periods(&h.ctx, Some(&policy.id)).unwrap().len(), 1);

        // Activity alone never wakes the policy.
        h.store
            .update_idle_state(&h.ctx, &policy.id, later, |s| {
                s.last_activity_at = Some(later);
                s.idle_since = None;
            })
            .unwrap();
        let d = h
            .engine
            .evaluate_at(&h.ctx, &policy.id, false, later + ChronoDuration::minutes(5))
            .await
            .unwrap();
        assert_eq!(d.target_replicas, 0);
        assert_eq!(d.action, ScaleAction::None);
    }

    #[tokio::test]
    async fn out_of_bounds_state_is_pulled_back() {
        let h = harness();
        let policy = h.engine.create_policy(&h.ctx, queued_policy()).await.unwrap();
        let mut state = h.store.get_policy_state(&h.ctx, &policy.id).unwrap().unwrap();
        state.current_replicas = 12;
        h.store.put_policy_state(&h.ctx, &state).unwrap();
        h.metrics.set("queued", 3.0).await;

        let d = h.engine.evaluate(&h.ctx, &policy.id, false).await.unwrap();
        assert_eq!(d.target_replicas, 10);
        assert!(d.reason.contains("outside bounds"));
    }

    #[tokio::test]
    async fn evaluate_all_covers_every_tenant() {
        let h = harness();
        let other = TenantContext::new(Uuid::new_v4());
        h.engine.create_policy(&h.ctx, queued_policy()).await.unwrap();
        h.engine.create_policy(&other, queued_policy()).await.unwrap();
        h.metrics.set("queued", 6.0).await;

        let summary = h.engine.evaluate_all().await.unwrap();
        assert_eq!(summary.evaluated, 2);
        assert_eq!(summary.committed, 2);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn nodes_policy_without_node_scaler_reports_error() {
        let h = harness();
        let pool_id = Uuid::new_v4();
        let mut new = queued_policy();
        new.target_type = TargetType::Nodes;
        new.target_id = Some(pool_id);
        // Pool existence is checked at creation; bypass it through the store.
        let now = Utc::now();
        let policy = ScalingPolicy {
            id: Uuid::new_v4(),
            tenant_id: h.ctx.tenant_id,
            name: new.name,
            target_type: new.target_type,
            target_id: new.target_id,
            min_replicas: 1,
            max_replicas: 3,
            cooldown_seconds: 0,
            scale_to_zero: false,
            idle_timeout_seconds: 900,
            enabled: true,
            rules: RuleSet::default(),
            schedules: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        h.store
            .insert_policy(
                &h.ctx,
                &policy,
                &PolicyState::new(policy.id, 0, now),
                &IdleState::new(policy.id, now),
            )
            .unwrap();

        let err = h.engine.evaluate(&h.ctx, &policy.id, false).await.unwrap_err();
        assert!(matches!(err, AutoscaleError::Metrics(_)));
        // A dry run still answers: 0 is below min, so it would scale to 1.
        let d = h.engine.evaluate(&h.ctx, &policy.id, true).await.unwrap();
        assert_eq!(d.target_replicas, 1);
    }
}
