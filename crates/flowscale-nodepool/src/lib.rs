//! flowscale-nodepool — node pool lifecycle for the Flowscale control plane.
//!
//! Translates desired node counts into provider jobs tracked as
//! `ScalingOperation`s, drains nodes, reconciles in-flight operations and
//! aggregates cluster capacity for `nodes` scaling policies.
//!
//! # Architecture
//!
//! ```text
//! NodePoolManager
//!   ├── StateStore (pools, nodes, operations)
//!   ├── CloudProvider (create / destroy / cordon+evict, polled by handle)
//!   ├── ClusterObserver (pending pods, per-node allocations)
//!   └── reconciler loop (in_progress operations → completed | failed)
//!
//! PolicyEngine seams
//!   ├── NodePoolScaler (TargetScaler for nodes policies)
//!   └── CapacityMetricsProvider (MetricsProvider for nodes policies)
//! ```

pub mod adapters;
pub mod capacity;
pub mod error;
pub mod manager;
pub mod pools;
pub mod provider;
pub mod reconcile;
pub mod simulated;

pub use adapters::{CapacityMetricsProvider, NodePoolScaler};
pub use capacity::{ActiveOperationSummary, ClusterCapacity, NodePoolStatus};
pub use error::{NodePoolError, NodePoolResult};
pub use manager::{DrainOptions, DrainOutcome, NodePoolConfig, NodePoolManager, ScaleOptions};
pub use pools::validate_pool;
pub use provider::{
    ClusterObserver, CloudProvider, JobPhase, JobStatus, NodeAllocation, PendingPod, ProviderHandle,
    ProvisionedInstance,
};
pub use reconcile::ReconcileSummary;
pub use simulated::{SimulatedConfig, SimulatedProvider, StaticClusterObserver};
