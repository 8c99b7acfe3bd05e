//! flowscale-autoscale — policy-driven scaling of compute targets and node
//! pools.
//!
//! Turns live metrics, cron schedules, cooldowns and idle tracking into a
//! [`Decision`](flowscale_state::Decision) per policy evaluation, and
//! commits it through a [`TargetScaler`].
//!
//! # Architecture
//!
//! ```text
//! PolicyEngine
//!   ├── StateStore (policies, state, history, idle tracking)
//!   ├── MetricsProvider (compute targets; capacity metrics for nodes)
//!   ├── TargetScaler (ComputeTargetScaler; node pool scaler for nodes)
//!   └── Per-policy slot
//!       ├── async mutex (serializes evaluate + commit)
//!       └── DurationTracker (rule debounce windows)
//!
//! IdleTracker
//!   ├── PolicyEngine (wakes go through the same slot + commit path)
//!   └── CostModel (hourly cost per policy)
//! ```

pub mod engine;
pub mod error;
pub mod idle;
pub mod metrics;
pub mod policies;
pub mod rules;
pub mod scaler;
pub mod schedule;
pub mod validation;

pub use engine::{EngineConfig, EvaluationSummary, PolicyEngine};
pub use error::{AutoscaleError, AutoscaleResult, ErrorKind};
pub use idle::{
    CostModel, CostSavings, DailySavings, IdleConfig, IdleTracker, PolicySavings, StaticCostModel,
    WakeOptions, WakeOutcome, WakeStatus,
};
pub use metrics::{MetricsProvider, StoreMetricsProvider};
pub use scaler::{ComputeScaler, ComputeTargetScaler, InMemoryComputeScaler, ScaleRequest, TargetScaler};
