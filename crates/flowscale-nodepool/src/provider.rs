//! External collaborators of the node pool manager.
//!
//! [`CloudProvider`] is the provisioning backend: every mutating call
//! returns immediately with a [`ProviderHandle`] that is polled until the
//! job finishes. [`ClusterObserver`] reports what the cluster scheduler
//! sees: pods waiting for capacity and per-node allocations.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowscale_state::{NodePool, TenantContext};
use serde::{Deserialize, Serialize};

/// Opaque reference to an asynchronous provider job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderHandle(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPhase {
    Running,
    Succeeded,
    Failed(String),
}

/// An instance a create job brought up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedInstance {
    pub instance_id: String,
    pub cpu_millicores: u32,
    pub memory_mb: u64,
    /// Joined the cluster and schedulable.
    pub ready: bool,
}

/// Progress of a provider job. `created` and `removed` are cumulative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub phase: JobPhase,
    pub created: Vec<ProvisionedInstance>,
    pub removed: Vec<String>,
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn create_nodes(&self, pool: &NodePool, count: u32) -> anyhow::Result<ProviderHandle>;

    async fn destroy_nodes(&self, pool: &NodePool, instance_ids: &[String]) -> anyhow::Result<ProviderHandle>;

    /// Cordon the instance and evict its workloads within `grace_period`.
    async fn cordon_and_evict(
        &self,
        pool: &NodePool,
        instance_id: &str,
        grace_period: Duration,
    ) -> anyhow::Result<ProviderHandle>;

    async fn poll(&self, handle: &ProviderHandle) -> anyhow::Result<JobStatus>;

    /// Stop a job and roll back what it can. Best effort.
    async fn cancel(&self, handle: &ProviderHandle) -> anyhow::Result<()>;
}

/// A pod the cluster scheduler could not place yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPod {
    pub namespace: String,
    pub name: String,
    pub reason: String,
    /// The scheduler found no node that fits.
    pub unschedulable: bool,
    pub requested_cpu_millicores: u32,
    pub requested_memory_mb: u64,
    pub pending_since: DateTime<Utc>,
}

/// Resources requested by the pods running on one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAllocation {
    pub cpu_millicores: u64,
    pub memory_mb: u64,
}

#[async_trait]
pub trait ClusterObserver: Send + Sync {
    async fn pending_pods(&self, ctx: &TenantContext) -> anyhow::Result<Vec<PendingPod>>;

    /// Allocations keyed by provider instance id.
    async fn node_allocations(&self, ctx: &TenantContext) -> anyhow::Result<HashMap<String, NodeAllocation>>;
}
