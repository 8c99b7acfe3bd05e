//! StateStore: redb-backed state persistence for Flowscale.
//!
//! Provides typed, tenant-scoped CRUD over policies, policy state, history,
//! node pools, nodes, scaling operations, idle tracking, and metrics. All
//! values are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).
//!
//! redb serializes write transactions, so every check-then-write performed
//! inside one (`insert_operation_if_idle`, `commit_scale`, name uniqueness)
//! is atomic with respect to other writers.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, Table, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTableMut<'txn> = Table<'txn, &'static str, &'static [u8]>;

const ALL_TABLES: [JsonTable; 9] = [
    POLICIES,
    POLICY_STATES,
    HISTORY,
    NODE_POOLS,
    NODES,
    OPERATIONS,
    IDLE_STATES,
    IDLE_PERIODS,
    METRICS,
];

/// Everything a committed scaling action writes, applied atomically.
#[derive(Debug, Clone)]
pub struct CommitScale<'a> {
    /// The new state; its `generation` must be exactly one past the stored one.
    pub state: &'a PolicyState,
    pub history: &'a ScalingHistory,
    pub idle: IdleTransition,
    pub now: DateTime<Utc>,
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in ALL_TABLES {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    /// Run `f` inside a write transaction, committing only if it succeeds.
    fn write<R>(&self, f: impl FnOnce(&WriteTransaction) -> StateResult<R>) -> StateResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = f(&txn)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }

    fn get<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        read_value(&table, key)
    }

    fn scan<T: DeserializeOwned>(&self, def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        scan_values(&table, prefix)
    }

    fn put<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            write_value(&mut table, key, value)
        })
    }

    // ── Policies ───────────────────────────────────────────────────

    /// Insert a new policy together with its state and idle rows.
    ///
    /// Fails with `Conflict` if the tenant already has a policy of that name.
    pub fn insert_policy(
        &self,
        ctx: &TenantContext,
        policy: &ScalingPolicy,
        state: &PolicyState,
        idle: &IdleState,
    ) -> StateResult<()> {
        let key = ctx.key(&policy.id);
        self.write(|txn| {
            let mut policies = txn.open_table(POLICIES).map_err(map_err!(Table))?;
            let existing: Vec<ScalingPolicy> = scan_values(&policies, &ctx.prefix())?;
            if existing.iter().any(|p| p.name == policy.name) {
                return Err(StateError::Conflict(format!(
                    "policy name already in use: {}",
                    policy.name
                )));
            }
            write_value(&mut policies, &key, policy)?;

            let mut states = txn.open_table(POLICY_STATES).map_err(map_err!(Table))?;
            write_value(&mut states, &key, state)?;

            let mut idle_states = txn.open_table(IDLE_STATES).map_err(map_err!(Table))?;
            write_value(&mut idle_states, &key, idle)?;
            Ok(())
        })?;
        debug!(%key, name = %policy.name, "policy stored");
        Ok(())
    }

    /// Replace an existing policy. Fails with `NotFound` or, on a name
    /// clash with another policy, `Conflict`.
    pub fn update_policy(&self, ctx: &TenantContext, policy: &ScalingPolicy) -> StateResult<()> {
        let key = ctx.key(&policy.id);
        self.write(|txn| {
            let mut policies = txn.open_table(POLICIES).map_err(map_err!(Table))?;
            let existing: Vec<ScalingPolicy> = scan_values(&policies, &ctx.prefix())?;
            if !existing.iter().any(|p| p.id == policy.id) {
                return Err(StateError::NotFound(format!("policy {}", policy.id)));
            }
            if existing
                .iter()
                .any(|p| p.id != policy.id && p.name == policy.name)
            {
                return Err(StateError::Conflict(format!(
                    "policy name already in use: {}",
                    policy.name
                )));
            }
            write_value(&mut policies, &key, policy)
        })?;
        debug!(%key, "policy updated");
        Ok(())
    }

    /// Get a policy by ID.
    pub fn get_policy(&self, ctx: &TenantContext, id: &PolicyId) -> StateResult<Option<ScalingPolicy>> {
        self.get(POLICIES, &ctx.key(id))
    }

    /// List all policies of a tenant, oldest first.
    pub fn list_policies(&self, ctx: &TenantContext) -> StateResult<Vec<ScalingPolicy>> {
        let mut policies: Vec<ScalingPolicy> = self.scan(POLICIES, &ctx.prefix())?;
        policies.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(policies)
    }

    /// Every enabled policy across all tenants (for the evaluation loop).
    pub fn list_enabled_policies_all_tenants(&self) -> StateResult<Vec<ScalingPolicy>> {
        let policies: Vec<ScalingPolicy> = self.scan(POLICIES, "")?;
        Ok(policies.into_iter().filter(|p| p.enabled).collect())
    }

    /// Delete a policy with its state, idle state and idle periods.
    ///
    /// Rejected with `Conflict` while a non-terminal operation exists for
    /// the policy or its target. History and operations are kept as the
    /// audit trail. Returns false if the policy did not exist.
    pub fn delete_policy(&self, ctx: &TenantContext, id: &PolicyId) -> StateResult<bool> {
        let key = ctx.key(id);
        let existed = self.write(|txn| {
            let mut policies = txn.open_table(POLICIES).map_err(map_err!(Table))?;
            let Some(policy) = read_value::<ScalingPolicy, _>(&policies, &key)? else {
                return Ok(false);
            };

            let operations = txn.open_table(OPERATIONS).map_err(map_err!(Table))?;
            let ops: Vec<ScalingOperation> = scan_values(&operations, &ctx.prefix())?;
            let target = policy.target_key();
            if let Some(active) = ops.iter().find(|op| {
                op.is_active() && (op.policy_id == Some(*id) || op.target_key == target)
            }) {
                return Err(StateError::Conflict(format!(
                    "policy {id} has active operation {}",
                    active.id
                )));
            }

            policies.remove(key.as_str()).map_err(map_err!(Write))?;
            let mut states = txn.open_table(POLICY_STATES).map_err(map_err!(Table))?;
            states.remove(key.as_str()).map_err(map_err!(Write))?;
            let mut idle_states = txn.open_table(IDLE_STATES).map_err(map_err!(Table))?;
            idle_states.remove(key.as_str()).map_err(map_err!(Write))?;

            let mut periods = txn.open_table(IDLE_PERIODS).map_err(map_err!(Table))?;
            let period_keys = scan_keys(&periods, &format!("{key}/"))?;
            for k in &period_keys {
                periods.remove(k.as_str()).map_err(map_err!(Write))?;
            }
            Ok(true)
        })?;
        debug!(%key, existed, "policy deleted");
        Ok(existed)
    }

    // ── Policy state ───────────────────────────────────────────────

    /// Get the evaluation state of a policy.
    pub fn get_policy_state(&self, ctx: &TenantContext, id: &PolicyId) -> StateResult<Option<PolicyState>> {
        self.get(POLICY_STATES, &ctx.key(id))
    }

    /// Overwrite the evaluation state of a policy.
    pub fn put_policy_state(&self, ctx: &TenantContext, state: &PolicyState) -> StateResult<()> {
        self.put(POLICY_STATES, &ctx.key(&state.policy_id), state)
    }

    /// Atomically advance policy state, append history, and apply the idle
    /// transition of a committed scaling action.
    ///
    /// The stored generation must be `commit.state.generation - 1`; a
    /// mismatch means another writer committed first and yields `Conflict`.
    pub fn commit_scale(&self, ctx: &TenantContext, commit: CommitScale<'_>) -> StateResult<()> {
        let policy_id = commit.state.policy_id;
        let key = ctx.key(&policy_id);
        self.write(|txn| {
            let mut states = txn.open_table(POLICY_STATES).map_err(map_err!(Table))?;
            let stored: Option<PolicyState> = read_value(&states, &key)?;
            let stored_generation = stored.map(|s| s.generation).unwrap_or(0);
            if stored_generation + 1 != commit.state.generation {
                return Err(StateError::Conflict(format!(
                    "policy {policy_id} state moved to generation {stored_generation}"
                )));
            }
            write_value(&mut states, &key, commit.state)?;

            let mut history = txn.open_table(HISTORY).map_err(map_err!(Table))?;
            let history_key = format!("{key}/{:020}", commit.history.sequence);
            write_value(&mut history, &history_key, commit.history)?;

            let mut idle_states = txn.open_table(IDLE_STATES).map_err(map_err!(Table))?;
            let mut idle: IdleState = read_value(&idle_states, &key)?
                .unwrap_or_else(|| IdleState::new(policy_id, commit.now));
            idle.apply(&commit.idle, commit.now);
            write_value(&mut idle_states, &key, &idle)?;

            let mut periods = txn.open_table(IDLE_PERIODS).map_err(map_err!(Table))?;
            match &commit.idle {
                IdleTransition::Unchanged => {}
                IdleTransition::ScaledToZero => {
                    let period = IdlePeriod {
                        id: Uuid::new_v4(),
                        policy_id,
                        started_at: commit.now,
                        ended_at: None,
                    };
                    write_value(&mut periods, &format!("{key}/{}", period.id), &period)?;
                }
                IdleTransition::Woken { .. } => {
                    close_open_periods(&mut periods, &key, commit.now)?;
                }
            }
            Ok(())
        })?;
        debug!(%key, generation = commit.state.generation, "scale committed");
        Ok(())
    }

    // ── History ────────────────────────────────────────────────────

    /// Scaling history, newest first. `None` lists across all policies.
    pub fn list_history(
        &self,
        ctx: &TenantContext,
        policy_id: Option<&PolicyId>,
        limit: usize,
    ) -> StateResult<Vec<ScalingHistory>> {
        let prefix = match policy_id {
            Some(id) => format!("{}/", ctx.key(id)),
            None => ctx.prefix(),
        };
        let mut rows: Vec<ScalingHistory> = self.scan(HISTORY, &prefix)?;
        rows.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.sequence.cmp(&a.sequence))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    // ── Idle tracking ──────────────────────────────────────────────

    /// Get the idle state of a policy.
    pub fn get_idle_state(&self, ctx: &TenantContext, id: &PolicyId) -> StateResult<Option<IdleState>> {
        self.get(IDLE_STATES, &ctx.key(id))
    }

    /// Read-modify-write the idle state of a policy in one transaction.
    pub fn update_idle_state(
        &self,
        ctx: &TenantContext,
        id: &PolicyId,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut IdleState),
    ) -> StateResult<IdleState> {
        let key = ctx.key(id);
        self.write(|txn| {
            let mut table = txn.open_table(IDLE_STATES).map_err(map_err!(Table))?;
            let mut idle: IdleState =
                read_value(&table, &key)?.unwrap_or_else(|| IdleState::new(*id, now));
            f(&mut idle);
            idle.updated_at = now;
            write_value(&mut table, &key, &idle)?;
            Ok(idle)
        })
    }

    /// All idle states of a tenant.
    pub fn list_idle_states(&self, ctx: &TenantContext) -> StateResult<Vec<IdleState>> {
        self.scan(IDLE_STATES, &ctx.prefix())
    }

    /// Idle periods, oldest first. `None` lists across all policies.
    pub fn list_idle_periods(
        &self,
        ctx: &TenantContext,
        policy_id: Option<&PolicyId>,
    ) -> StateResult<Vec<IdlePeriod>> {
        let prefix = match policy_id {
            Some(id) => format!("{}/", ctx.key(id)),
            None => ctx.prefix(),
        };
        let mut periods: Vec<IdlePeriod> = self.scan(IDLE_PERIODS, &prefix)?;
        periods.sort_by_key(|p| p.started_at);
        Ok(periods)
    }

    // ── Node pools ─────────────────────────────────────────────────

    /// Insert a new node pool. Fails with `Conflict` on a duplicate name.
    pub fn insert_pool(&self, ctx: &TenantContext, pool: &NodePool) -> StateResult<()> {
        let key = ctx.key(&pool.id);
        self.write(|txn| {
            let mut pools = txn.open_table(NODE_POOLS).map_err(map_err!(Table))?;
            let existing: Vec<NodePool> = scan_values(&pools, &ctx.prefix())?;
            if existing.iter().any(|p| p.name == pool.name) {
                return Err(StateError::Conflict(format!(
                    "node pool name already in use: {}",
                    pool.name
                )));
            }
            write_value(&mut pools, &key, pool)
        })?;
        debug!(%key, name = %pool.name, "node pool stored");
        Ok(())
    }

    /// Replace an existing node pool.
    pub fn update_pool(&self, ctx: &TenantContext, pool: &NodePool) -> StateResult<()> {
        let key = ctx.key(&pool.id);
        self.write(|txn| {
            let mut pools = txn.open_table(NODE_POOLS).map_err(map_err!(Table))?;
            let existing: Vec<NodePool> = scan_values(&pools, &ctx.prefix())?;
            if !existing.iter().any(|p| p.id == pool.id) {
                return Err(StateError::NotFound(format!("node pool {}", pool.id)));
            }
            if existing.iter().any(|p| p.id != pool.id && p.name == pool.name) {
                return Err(StateError::Conflict(format!(
                    "node pool name already in use: {}",
                    pool.name
                )));
            }
            write_value(&mut pools, &key, pool)
        })
    }

    /// Get a node pool by ID.
    pub fn get_pool(&self, ctx: &TenantContext, id: &PoolId) -> StateResult<Option<NodePool>> {
        self.get(NODE_POOLS, &ctx.key(id))
    }

    /// List all node pools of a tenant, oldest first.
    pub fn list_pools(&self, ctx: &TenantContext) -> StateResult<Vec<NodePool>> {
        let mut pools: Vec<NodePool> = self.scan(NODE_POOLS, &ctx.prefix())?;
        pools.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(pools)
    }

    /// Delete a pool and its node records, returning the removed nodes.
    ///
    /// Rejected with `Conflict` while an operation is active on the pool,
    /// `NotFound` if the pool does not exist.
    pub fn delete_pool(&self, ctx: &TenantContext, id: &PoolId) -> StateResult<Vec<Node>> {
        let key = ctx.key(id);
        let removed = self.write(|txn| {
            let mut pools = txn.open_table(NODE_POOLS).map_err(map_err!(Table))?;
            let Some(pool) = read_value::<NodePool, _>(&pools, &key)? else {
                return Err(StateError::NotFound(format!("node pool {id}")));
            };

            let operations = txn.open_table(OPERATIONS).map_err(map_err!(Table))?;
            if let Some(active) = find_active_operation(&operations, ctx, &pool.target_key())? {
                return Err(StateError::Conflict(format!(
                    "node pool {id} has active operation {}",
                    active.id
                )));
            }

            pools.remove(key.as_str()).map_err(map_err!(Write))?;

            let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            let all: Vec<Node> = scan_values(&nodes, &ctx.prefix())?;
            let removed: Vec<Node> = all.into_iter().filter(|n| n.pool_id == *id).collect();
            for node in &removed {
                nodes.remove(ctx.key(&node.id).as_str()).map_err(map_err!(Write))?;
            }
            Ok(removed)
        })?;
        debug!(%key, nodes_removed = removed.len(), "node pool deleted");
        Ok(removed)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node.
    pub fn put_node(&self, ctx: &TenantContext, node: &Node) -> StateResult<()> {
        self.put(NODES, &ctx.key(&node.id), node)
    }

    /// Insert or update several nodes in one transaction.
    pub fn put_nodes(&self, ctx: &TenantContext, nodes: &[Node]) -> StateResult<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        self.write(|txn| {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            for node in nodes {
                write_value(&mut table, &ctx.key(&node.id), node)?;
            }
            Ok(())
        })
    }

    /// Get a node by ID.
    pub fn get_node(&self, ctx: &TenantContext, id: &NodeId) -> StateResult<Option<Node>> {
        self.get(NODES, &ctx.key(id))
    }

    /// List nodes of a tenant, optionally restricted to one pool, oldest first.
    pub fn list_nodes(&self, ctx: &TenantContext, pool_id: Option<&PoolId>) -> StateResult<Vec<Node>> {
        let mut nodes: Vec<Node> = self.scan(NODES, &ctx.prefix())?;
        if let Some(pool_id) = pool_id {
            nodes.retain(|n| n.pool_id == *pool_id);
        }
        nodes.sort_by_key(|n| n.created_at);
        Ok(nodes)
    }

    // ── Operations ─────────────────────────────────────────────────

    /// Insert `op` unless a non-terminal operation already exists for the
    /// same target, in which case `Conflict` names the active operation.
    pub fn insert_operation_if_idle(&self, ctx: &TenantContext, op: &ScalingOperation) -> StateResult<()> {
        let key = ctx.key(&op.id);
        self.write(|txn| {
            let mut table = txn.open_table(OPERATIONS).map_err(map_err!(Table))?;
            if let Some(active) = find_active_operation(&table, ctx, &op.target_key)? {
                return Err(StateError::Conflict(format!(
                    "operation {} already in progress for {}",
                    active.id, op.target_key
                )));
            }
            write_value(&mut table, &key, op)
        })?;
        debug!(%key, target = %op.target_key, "operation stored");
        Ok(())
    }

    /// Persist a changed operation.
    ///
    /// Terminal operations are immutable: overwriting one with different
    /// content fails with `Conflict`.
    pub fn put_operation(&self, ctx: &TenantContext, op: &ScalingOperation) -> StateResult<()> {
        let key = ctx.key(&op.id);
        self.write(|txn| {
            let mut table = txn.open_table(OPERATIONS).map_err(map_err!(Table))?;
            if let Some(stored) = read_value::<ScalingOperation, _>(&table, &key)?
                && stored.state.is_terminal()
                && stored != *op
            {
                return Err(StateError::Conflict(format!(
                    "operation {} is already {:?}",
                    op.id, stored.state
                )));
            }
            write_value(&mut table, &key, op)
        })
    }

    /// Get an operation by ID.
    pub fn get_operation(&self, ctx: &TenantContext, id: &OperationId) -> StateResult<Option<ScalingOperation>> {
        self.get(OPERATIONS, &ctx.key(id))
    }

    /// List operations, newest first, optionally restricted to one pool.
    pub fn list_operations(
        &self,
        ctx: &TenantContext,
        pool_id: Option<&PoolId>,
    ) -> StateResult<Vec<ScalingOperation>> {
        let mut ops: Vec<ScalingOperation> = self.scan(OPERATIONS, &ctx.prefix())?;
        if let Some(pool_id) = pool_id {
            ops.retain(|op| op.pool_id == Some(*pool_id));
        }
        ops.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(ops)
    }

    /// The non-terminal operation for a target, if any.
    pub fn active_operation(&self, ctx: &TenantContext, target_key: &str) -> StateResult<Option<ScalingOperation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(OPERATIONS).map_err(map_err!(Table))?;
        find_active_operation(&table, ctx, target_key)
    }

    /// Every non-terminal operation across all tenants (for the reconciler).
    pub fn list_active_operations_all_tenants(&self) -> StateResult<Vec<ScalingOperation>> {
        let ops: Vec<ScalingOperation> = self.scan(OPERATIONS, "")?;
        Ok(ops.into_iter().filter(|op| op.is_active()).collect())
    }

    // ── Metrics ────────────────────────────────────────────────────

    /// Record a metrics snapshot. Each target keeps only its newest
    /// snapshot; an older one arriving late is dropped.
    pub fn put_metrics(&self, ctx: &TenantContext, snapshot: &MetricsSnapshot) -> StateResult<()> {
        let key = format!("{}{}", ctx.prefix(), snapshot.target_key);
        self.write(|txn| {
            let mut table = txn.open_table(METRICS).map_err(map_err!(Table))?;
            if let Some(stored) = read_value::<MetricsSnapshot, _>(&table, &key)?
                && stored.observed_at > snapshot.observed_at
            {
                return Ok(());
            }
            write_value(&mut table, &key, snapshot)
        })
    }

    /// Latest metrics snapshot for a target.
    pub fn latest_metrics(&self, ctx: &TenantContext, target_key: &str) -> StateResult<Option<MetricsSnapshot>> {
        self.get(METRICS, &format!("{}{}", ctx.prefix(), target_key))
    }
}

// ── Transaction-level helpers ──────────────────────────────────────

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Encode))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Decode))
}

fn read_value<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn scan_values<T, R>(table: &R, prefix: &str) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            results.push(decode(value.value())?);
        }
    }
    Ok(results)
}

fn scan_keys<R>(table: &R, prefix: &str) -> StateResult<Vec<String>>
where
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut keys = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            keys.push(key.value().to_string());
        }
    }
    Ok(keys)
}

fn write_value<T: Serialize>(table: &mut JsonTableMut<'_>, key: &str, value: &T) -> StateResult<()> {
    let bytes = encode(value)?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

fn find_active_operation<R>(
    table: &R,
    ctx: &TenantContext,
    target_key: &str,
) -> StateResult<Option<ScalingOperation>>
where
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let ops: Vec<ScalingOperation> = scan_values(table, &ctx.prefix())?;
    Ok(ops
        .into_iter()
        .find(|op| op.is_active() && op.target_key == target_key))
}

fn close_open_periods(periods: &mut JsonTableMut<'_>, policy_key: &str, now: DateTime<Utc>) -> StateResult<()> {
    let prefix = format!("{policy_key}/");
    let open: Vec<(String, IdlePeriod)> = {
        let mut open = Vec::new();
        for entry in periods.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let period: IdlePeriod = decode(value.value())?;
                if period.ended_at.is_none() {
                    open.push((key.value().to_string(), period));
                }
            }
        }
        open
    };
    for (key, mut period) in open {
        period.ended_at = Some(now.max(period.started_at));
        write_value(periods, &key, &period)?;
    }
    Ok(())
}
