//! flowscale-state — embedded state store for the Flowscale control plane.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for scaling policies, evaluation state, scaling history,
//! node pools, nodes, scaling operations, idle tracking, and metrics.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Every key starts with the owning tenant (`{tenant}/{id}`, or
//! `{tenant}/{parent}/{child}` for per-policy sequences), so all reads and
//! writes are scoped by the [`TenantContext`] passed into each method.
//!
//! Multi-record invariants are enforced inside a single write transaction:
//! [`StateStore::insert_operation_if_idle`] is the idempotency guard for
//! scaling operations, and [`StateStore::commit_scale`] advances policy state,
//! history and idle tracking atomically.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod operation;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use operation::InvalidTransition;
pub use store::{CommitScale, StateStore};
pub use types::*;
