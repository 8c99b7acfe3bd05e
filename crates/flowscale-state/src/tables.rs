//! redb table definitions for the Flowscale state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Keys always begin with the tenant id: `{tenant}/{id}` for entities and
//! `{tenant}/{parent_id}/{suffix}` for per-parent sequences.

use redb::TableDefinition;

/// Table definition shape shared by every table.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Scaling policies keyed by `{tenant}/{policy_id}`.
pub const POLICIES: JsonTable = TableDefinition::new("policies");

/// Per-policy evaluation state keyed by `{tenant}/{policy_id}`.
pub const POLICY_STATES: JsonTable = TableDefinition::new("policy_states");

/// Scaling history keyed by `{tenant}/{policy_id}/{sequence:020}`.
pub const HISTORY: JsonTable = TableDefinition::new("history");

/// Node pools keyed by `{tenant}/{pool_id}`.
pub const NODE_POOLS: JsonTable = TableDefinition::new("node_pools");

/// Nodes keyed by `{tenant}/{node_id}`.
pub const NODES: JsonTable = TableDefinition::new("nodes");

/// Scaling operations keyed by `{tenant}/{operation_id}`.
pub const OPERATIONS: JsonTable = TableDefinition::new("operations");

/// Idle tracking state keyed by `{tenant}/{policy_id}`.
pub const IDLE_STATES: JsonTable = TableDefinition::new("idle_states");

/// Idle periods keyed by `{tenant}/{policy_id}/{period_id}`.
pub const IDLE_PERIODS: JsonTable = TableDefinition::new("idle_periods");

/// Metrics snapshots keyed by `{tenant}/{target_key}/{observed_at_ms:020}`.
pub const METRICS: JsonTable = TableDefinition::new("metrics");
