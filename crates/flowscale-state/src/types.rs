//! Domain types for the Flowscale state store.
//!
//! These types represent the persisted state of scaling policies, their
//! evaluation state and history, node pools and their nodes, scaling
//! operations, idle tracking, and metrics snapshots. All types are
//! serializable to/from JSON for storage in redb tables.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a tenant.
pub type TenantId = Uuid;

/// Unique identifier for a scaling policy.
pub type PolicyId = Uuid;

/// Unique identifier for a node pool.
pub type PoolId = Uuid;

/// Unique identifier for a node.
pub type NodeId = Uuid;

/// Unique identifier for a scaling operation.
pub type OperationId = Uuid;

// ── Tenant scope ──────────────────────────────────────────────────

/// The tenant boundary. Every core operation takes one explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: TenantId,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }

    /// Build the `{tenant}/{id}` key for an entity owned by this tenant.
    pub fn key(&self, id: &Uuid) -> String {
        format!("{}/{}", self.tenant_id, id)
    }

    /// Prefix matching every key owned by this tenant.
    pub fn prefix(&self) -> String {
        format!("{}/", self.tenant_id)
    }
}

// ── Scaling policy ────────────────────────────────────────────────

/// What a scaling policy scales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetType {
    CdcWorker,
    Trino,
    Risingwave,
    Nodes,
}

impl TargetType {
    /// Compute targets are scaled through the compute scaler; `nodes`
    /// through the node pool manager.
    pub fn is_compute(self) -> bool {
        !matches!(self, TargetType::Nodes)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TargetType::CdcWorker => "cdc-worker",
            TargetType::Trino => "trino",
            TargetType::Risingwave => "risingwave",
            TargetType::Nodes => "nodes",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the target key shared by operations and metrics snapshots:
/// `{target_type}:{target_id}` or `{target_type}:fleet`.
pub fn target_key(target_type: TargetType, target_id: Option<Uuid>) -> String {
    match target_id {
        Some(id) => format!("{target_type}:{id}"),
        None => format!("{target_type}:fleet"),
    }
}

/// Comparison applied between a metric value and a rule threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
}

impl Operator {
    /// Whether `value` is on the triggering side of `threshold`.
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::Gt => value > threshold,
            Operator::Lt => value < threshold,
            Operator::Gte => value >= threshold,
            Operator::Lte => value <= threshold,
            Operator::Eq => (value - threshold).abs() <= f64::EPSILON * threshold.abs().max(1.0),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Gt => "gt",
            Operator::Lt => "lt",
            Operator::Gte => "gte",
            Operator::Lte => "lte",
            Operator::Eq => "eq",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric threshold rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    /// Key into the metrics snapshot.
    pub metric: String,
    pub operator: Operator,
    pub threshold: f64,
    /// How long the condition must hold continuously before the rule fires.
    #[serde(default)]
    pub duration_seconds: u64,
    /// Signed replica delta: positive for scale-up rules, negative for
    /// scale-down rules.
    pub scale_by: i32,
}

/// Scale-up and scale-down rules, kept as two distinct ordered sets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RuleSet {
    #[serde(default)]
    pub scale_up: Vec<Rule>,
    #[serde(default)]
    pub scale_down: Vec<Rule>,
}

impl RuleSet {
    pub fn is_empty(&self) -> bool {
        self.scale_up.is_empty() && self.scale_down.is_empty()
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_true() -> bool {
    true
}

/// A cron-triggered replica target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schedule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub cron_expression: String,
    pub desired_replicas: u32,
    /// IANA timezone name.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_idle_timeout_seconds() -> u64 {
    900
}

/// A scaling policy for one target (or a whole fleet of one target type).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingPolicy {
    pub id: PolicyId,
    pub tenant_id: TenantId,
    pub name: String,
    pub target_type: TargetType,
    /// `None` means fleet-wide.
    pub target_id: Option<Uuid>,
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Minimum time between two consecutive scaling actions.
    pub cooldown_seconds: u64,
    /// Permits the replica count to drop to zero when idle.
    pub scale_to_zero: bool,
    /// Seconds without recorded activity before the policy counts as idle.
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
    pub enabled: bool,
    #[serde(default)]
    pub rules: RuleSet,
    #[serde(default)]
    pub schedules: Vec<Schedule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScalingPolicy {
    pub fn target_key(&self) -> String {
        target_key(self.target_type, self.target_id)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::seconds(i64::try_from(self.cooldown_seconds).unwrap_or(i64::MAX / 1_000))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::seconds(i64::try_from(self.idle_timeout_seconds).unwrap_or(i64::MAX / 1_000))
    }
}

/// Request to create a scaling policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewPolicy {
    pub name: String,
    pub target_type: TargetType,
    #[serde(default)]
    pub target_id: Option<Uuid>,
    pub min_replicas: u32,
    pub max_replicas: u32,
    #[serde(default)]
    pub cooldown_seconds: u64,
    #[serde(default)]
    pub scale_to_zero: bool,
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub rules: RuleSet,
    #[serde(default)]
    pub schedules: Vec<Schedule>,
}

/// Partial update of a scaling policy. `None` leaves a field untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PolicyPatch {
    pub name: Option<String>,
    /// `Some(None)` clears the target (fleet-wide).
    pub target_id: Option<Option<Uuid>>,
    pub min_replicas: Option<u32>,
    pub max_replicas: Option<u32>,
    pub cooldown_seconds: Option<u64>,
    pub scale_to_zero: Option<bool>,
    pub idle_timeout_seconds: Option<u64>,
    pub enabled: Option<bool>,
    pub rules: Option<RuleSet>,
    pub schedules: Option<Vec<Schedule>>,
}

impl PolicyPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the supplied fields to a copy of `policy`.
    pub fn apply_to(&self, policy: &ScalingPolicy) -> ScalingPolicy {
        let mut next = policy.clone();
        if let Some(name) = &self.name {
            next.name = name.clone();
        }
        if let Some(target_id) = self.target_id {
            next.target_id = target_id;
        }
        if let Some(v) = self.min_replicas {
            next.min_replicas = v;
        }
        if let Some(v) = self.max_replicas {
            next.max_replicas = v;
        }
        if let Some(v) = self.cooldown_seconds {
            next.cooldown_seconds = v;
        }
        if let Some(v) = self.scale_to_zero {
            next.scale_to_zero = v;
        }
        if let Some(v) = self.idle_timeout_seconds {
            next.idle_timeout_seconds = v;
        }
        if let Some(v) = self.enabled {
            next.enabled = v;
        }
        if let Some(rules) = &self.rules {
            next.rules = rules.clone();
        }
        if let Some(schedules) = &self.schedules {
            next.schedules = schedules.clone();
        }
        next
    }
}

/// Per-policy mutable evaluation state. Exactly one per policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyState {
    pub policy_id: PolicyId,
    pub current_replicas: u32,
    pub last_scale_at: Option<DateTime<Utc>>,
    pub in_cooldown_until: Option<DateTime<Utc>>,
    /// Incremented on every committed action; orders history rows.
    pub generation: u64,
    pub updated_at: DateTime<Utc>,
}

impl PolicyState {
    pub fn new(policy_id: PolicyId, current_replicas: u32, now: DateTime<Utc>) -> Self {
        Self {
            policy_id,
            current_replicas,
            last_scale_at: None,
            in_cooldown_until: None,
            generation: 0,
            updated_at: now,
        }
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.in_cooldown_until.is_some_and(|until| now < until)
    }
}

/// Direction of a scaling action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleAction {
    ScaleUp,
    ScaleDown,
    None,
}

impl ScaleAction {
    pub fn between(current: u32, target: u32) -> Self {
        match target.cmp(&current) {
            std::cmp::Ordering::Greater => ScaleAction::ScaleUp,
            std::cmp::Ordering::Less => ScaleAction::ScaleDown,
            std::cmp::Ordering::Equal => ScaleAction::None,
        }
    }
}

/// Immutable result of one policy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub policy_id: PolicyId,
    pub previous_replicas: u32,
    pub target_replicas: u32,
    pub action: ScaleAction,
    pub reason: String,
    /// An otherwise-valid action was suppressed by cooldown.
    pub cooldown_suppressed: bool,
    pub dry_run: bool,
    /// Operation started by the commit, if any.
    pub operation_id: Option<OperationId>,
    /// Scaler failure; state was not advanced.
    pub error: Option<String>,
    pub evaluated_at: DateTime<Utc>,
}

impl Decision {
    pub fn committed(&self) -> bool {
        !self.dry_run && self.action != ScaleAction::None && self.error.is_none()
    }
}

/// One committed scaling action of a policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingHistory {
    pub id: Uuid,
    pub policy_id: PolicyId,
    /// The policy state generation this row was committed at.
    pub sequence: u64,
    pub previous_replicas: u32,
    pub new_replicas: u32,
    pub action: ScaleAction,
    pub reason: String,
    pub trigger_metric: Option<String>,
    pub trigger_value: Option<f64>,
    pub operation_id: Option<OperationId>,
    pub created_at: DateTime<Utc>,
}

// ── Node pools ────────────────────────────────────────────────────

/// Cloud provider backing a node pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Hetzner,
    Scaleway,
    Ovh,
    Exoscale,
    Contabo,
}

/// Kubernetes taint effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

/// A taint applied to every node of a pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: TaintEffect,
}

/// A group of identically-configured cloud VMs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodePool {
    pub id: PoolId,
    pub tenant_id: TenantId,
    pub name: String,
    pub provider: ProviderKind,
    pub region: String,
    pub instance_type: String,
    pub image: String,
    pub min_nodes: u32,
    pub max_nodes: u32,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NodePool {
    pub fn target_key(&self) -> String {
        target_key(TargetType::Nodes, Some(self.id))
    }
}

/// Request to create a node pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewPool {
    pub name: String,
    pub provider: ProviderKind,
    pub region: String,
    pub instance_type: String,
    pub image: String,
    pub min_nodes: u32,
    pub max_nodes: u32,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Partial update of a node pool. Provider and region are immutable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PoolPatch {
    pub name: Option<String>,
    pub instance_type: Option<String>,
    pub image: Option<String>,
    pub min_nodes: Option<u32>,
    pub max_nodes: Option<u32>,
    pub labels: Option<BTreeMap<String, String>>,
    pub taints: Option<Vec<Taint>>,
    pub enabled: Option<bool>,
}

impl PoolPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, pool: &NodePool) -> NodePool {
        let mut next = pool.clone();
        if let Some(v) = &self.name {
            next.name = v.clone();
        }
        if let Some(v) = &self.instance_type {
            next.instance_type = v.clone();
        }
        if let Some(v) = &self.image {
            next.image = v.clone();
        }
        if let Some(v) = self.min_nodes {
            next.min_nodes = v;
        }
        if let Some(v) = self.max_nodes {
            next.max_nodes = v;
        }
        if let Some(v) = &self.labels {
            next.labels = v.clone();
        }
        if let Some(v) = &self.taints {
            next.taints = v.clone();
        }
        if let Some(v) = self.enabled {
            next.enabled = v;
        }
        next
    }
}

/// Lifecycle status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Draining,
    Terminated,
}

/// A cloud VM belonging to a pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub tenant_id: TenantId,
    pub pool_id: PoolId,
    pub provider_instance_id: String,
    pub status: NodeStatus,
    pub cpu_millicores: u32,
    pub memory_mb: u64,
    /// Operation that provisioned this node, if known.
    pub operation_id: Option<OperationId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Nodes that still count toward the pool size.
    pub fn is_live(&self) -> bool {
        self.status != NodeStatus::Terminated
    }
}

// ── Scaling operations ────────────────────────────────────────────

/// State of a scaling operation. See [`crate::operation`] for transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// One scaling request against a pool or compute target; the audit trail
/// and unit of idempotency.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingOperation {
    pub id: OperationId,
    pub tenant_id: TenantId,
    /// `{target_type}:{target_id}`; at most one non-terminal operation per key.
    pub target_key: String,
    /// Set for node pool operations.
    pub pool_id: Option<PoolId>,
    /// Policy that triggered the operation, if any.
    pub policy_id: Option<PolicyId>,
    pub previous_count: u32,
    pub target_count: u32,
    pub action: ScaleAction,
    pub state: OperationState,
    pub dry_run: bool,
    /// Opaque provider handle used by the reconciliation watcher.
    pub provider_handle: Option<String>,
    /// Nodes selected for removal by a scale-down.
    #[serde(default)]
    pub victims: Vec<NodeId>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScalingOperation {
    /// A fresh `pending` operation.
    pub fn pending(
        tenant_id: TenantId,
        target_key: String,
        previous_count: u32,
        target_count: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            target_key,
            pool_id: None,
            policy_id: None,
            previous_count,
            target_count,
            action: ScaleAction::between(previous_count, target_count),
            state: OperationState::Pending,
            dry_run: false,
            provider_handle: None,
            victims: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Idle tracking ─────────────────────────────────────────────────

/// Per-policy idle/wake tracking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdleState {
    pub policy_id: PolicyId,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Set when the policy first crosses the idle threshold.
    pub idle_since: Option<DateTime<Utc>>,
    pub is_scaled_to_zero: bool,
    pub scaled_to_zero_at: Option<DateTime<Utc>>,
    pub last_wake_at: Option<DateTime<Utc>>,
    pub last_wake_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl IdleState {
    pub fn new(policy_id: PolicyId, now: DateTime<Utc>) -> Self {
        Self {
            policy_id,
            last_activity_at: Some(now),
            idle_since: None,
            is_scaled_to_zero: false,
            scaled_to_zero_at: None,
            last_wake_at: None,
            last_wake_reason: None,
            updated_at: now,
        }
    }

    /// Apply the idle side effect of a committed scaling action.
    pub fn apply(&mut self, transition: &IdleTransition, now: DateTime<Utc>) {
        match transition {
            IdleTransition::Unchanged => {}
            IdleTransition::ScaledToZero => {
                self.is_scaled_to_zero = true;
                self.scaled_to_zero_at = Some(now);
            }
            IdleTransition::Woken { reason } => {
                self.is_scaled_to_zero = false;
                self.idle_since = None;
                self.last_activity_at = Some(now);
                self.last_wake_at = Some(now);
                self.last_wake_reason = Some(reason.clone());
            }
        }
        self.updated_at = now;
    }
}

/// Idle side effect of a committed scaling action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleTransition {
    Unchanged,
    ScaledToZero,
    Woken { reason: String },
}

/// A stretch of time during which a policy was scaled to zero.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdlePeriod {
    pub id: Uuid,
    pub policy_id: PolicyId,
    pub started_at: DateTime<Utc>,
    /// `None` while the policy is still scaled to zero.
    pub ended_at: Option<DateTime<Utc>>,
}

// ── Metrics ───────────────────────────────────────────────────────

/// Point-in-time named metric values for one target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MetricsSnapshot {
    pub target_key: String,
    pub observed_at: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
}

impl MetricsSnapshot {
    pub fn new(target_key: impl Into<String>, observed_at: DateTime<Utc>) -> Self {
        Self {
            target_key: target_key.into(),
            observed_at,
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, metric: &str, value: f64) -> Self {
        self.values.insert(metric.to_string(), value);
        self
    }

    pub fn get(&self, metric: &str) -> Option<f64> {
        self.values.get(metric).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_type_serializes_kebab_case() {
        let json = serde_json::to_string(&TargetType::CdcWorker).unwrap();
        assert_eq!(json, "\"cdc-worker\"");
        let back: TargetType = serde_json::from_str("\"risingwave\"").unwrap();
        assert_eq!(back, TargetType::Risingwave);
    }

    #[test]
    fn unknown_operator_is_rejected_at_the_boundary() {
        let err = serde_json::from_str::<Operator>("\"between\"");
        assert!(err.is_err());
    }

    #[test]
    fn operator_holds() {
        assert!(Operator::Gt.holds(6.0, 5.0));
        assert!(!Operator::Gt.holds(5.0, 5.0));
        assert!(Operator::Gte.holds(5.0, 5.0));
        assert!(Operator::Lt.holds(1.0, 5.0));
        assert!(Operator::Lte.holds(5.0, 5.0));
        assert!(Operator::Eq.holds(0.1 + 0.2, 0.3));
        assert!(!Operator::Eq.holds(0.31, 0.3));
    }

    #[test]
    fn schedule_defaults_to_utc_and_enabled() {
        let s: Schedule =
            serde_json::from_str(r#"{"cron_expression":"0 9 * * 1-5","desired_replicas":3}"#)
                .unwrap();
        assert_eq!(s.timezone, "UTC");
        assert!(s.enabled);
    }

    #[test]
    fn taint_effect_rejects_unknown_value() {
        let err = serde_json::from_str::<Taint>(r#"{"key":"gpu","effect":"NoWay"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn policy_patch_touches_only_supplied_fields() {
        let now = Utc::now();
        let policy = ScalingPolicy {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "trino".into(),
            target_type: TargetType::Trino,
            target_id: None,
            min_replicas: 1,
            max_replicas: 5,
            cooldown_seconds: 60,
            scale_to_zero: false,
            idle_timeout_seconds: 900,
            enabled: true,
            rules: RuleSet::default(),
            schedules: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let patch = PolicyPatch {
            max_replicas: Some(8),
            target_id: Some(Some(Uuid::nil())),
            ..Default::default()
        };
        let next = patch.apply_to(&policy);
        assert_eq!(next.max_replicas, 8);
        assert_eq!(next.min_replicas, 1);
        assert_eq!(next.target_id, Some(Uuid::nil()));
        assert!(PolicyPatch::default().is_empty());
    }

    #[test]
    fn idle_state_wake_clears_scale_to_zero() {
        let now = Utc::now();
        let mut idle = IdleState::new(Uuid::new_v4(), now);
        idle.idle_since = Some(now);
        idle.apply(&IdleTransition::ScaledToZero, now);
        assert!(idle.is_scaled_to_zero);

        idle.apply(
            &IdleTransition::Woken {
                reason: "manual".into(),
            },
            now,
        );
        assert!(!idle.is_scaled_to_zero);
        assert!(idle.idle_since.is_none());
        assert_eq!(idle.last_wake_reason.as_deref(), Some("manual"));
    }

    #[test]
    fn scale_action_between_counts() {
        assert_eq!(ScaleAction::between(1, 3), ScaleAction::ScaleUp);
        assert_eq!(ScaleAction::between(3, 1), ScaleAction::ScaleDown);
        assert_eq!(ScaleAction::between(2, 2), ScaleAction::None);
    }
}
