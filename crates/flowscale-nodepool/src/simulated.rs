//! In-process provider and cluster observer for standalone mode and tests.
//!
//! Jobs advance one step per `poll`. A create job brings its instances up
//! progressively (not ready) and marks all of them ready when it finishes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use flowscale_state::{NodePool, TenantContext};
use tokio::sync::Mutex;
use tracing::debug;

use crate::provider::{
    ClusterObserver, CloudProvider, JobPhase, JobStatus, NodeAllocation, PendingPod, ProviderHandle,
    ProvisionedInstance,
};

/// Behaviour knobs for [`SimulatedProvider`].
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    /// Polls before a job finishes. `0` finishes on the first poll.
    pub polls_to_complete: u32,
    pub cpu_millicores: u32,
    pub memory_mb: u64,
    /// Reject every mutating call.
    pub fail_dispatch: bool,
    /// Accept calls, but finish jobs as failed.
    pub fail_jobs: bool,
    /// Evictions never finish.
    pub stuck_drains: bool,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            polls_to_complete: 1,
            cpu_millicores: 4_000,
            memory_mb: 8_192,
            fail_dispatch: false,
            fail_jobs: false,
            stuck_drains: false,
        }
    }
}

enum JobKind {
    Create { count: u32 },
    Destroy { instance_ids: Vec<String> },
    Drain,
}

struct Job {
    kind: JobKind,
    polls: u32,
    cancelled: bool,
    created: Vec<ProvisionedInstance>,
}

#[derive(Default)]
struct SimState {
    config: SimulatedConfig,
    jobs: HashMap<String, Job>,
    next_job: u64,
    next_instance: u64,
}

impl SimState {
    fn submit(&mut self, kind: JobKind) -> anyhow::Result<ProviderHandle> {
        if self.config.fail_dispatch {
            anyhow::bail!("simulated provider rejected the request");
        }
        self.next_job += 1;
        let handle = format!("sim-job-{}", self.next_job);
        self.jobs.insert(
            handle.clone(),
            Job {
                kind,
                polls: 0,
                cancelled: false,
                created: Vec::new(),
            },
        );
        Ok(ProviderHandle(handle))
    }
}

#[derive(Default)]
pub struct SimulatedProvider {
    state: Mutex<SimState>,
}

impl SimulatedProvider {
    pub fn new(config: SimulatedConfig) -> Self {
        Self {
            state: Mutex::new(SimState {
                config,
                ..Default::default()
            }),
        }
    }

    /// Change behaviour for subsequent calls and polls.
    pub async fn configure(&self, f: impl FnOnce(&mut SimulatedConfig)) {
        f(&mut self.state.lock().await.config);
    }

    /// Number of jobs that were cancelled.
    pub async fn cancelled_jobs(&self) -> usize {
        self.state.lock().await.jobs.values().filter(|j| j.cancelled).count()
    }
}

#[async_trait]
impl CloudProvider for SimulatedProvider {
    async fn create_nodes(&self, pool: &NodePool, count: u32) -> anyhow::Result<ProviderHandle> {
        let handle = self.state.lock().await.submit(JobKind::Create { count })?;
        debug!(pool = %pool.id, count, handle = %handle.0, "simulated create submitted");
        Ok(handle)
    }

    async fn destroy_nodes(&self, pool: &NodePool, instance_ids: &[String]) -> anyhow::Result<ProviderHandle> {
        let handle = self.state.lock().await.submit(JobKind::Destroy {
            instance_ids: instance_ids.to_vec(),
        })?;
        debug!(pool = %pool.id, count = instance_ids.len(), handle = %handle.0, "simulated destroy submitted");
        Ok(handle)
    }

    async fn cordon_and_evict(
        &self,
        pool: &NodePool,
        instance_id: &str,
        grace_period: Duration,
    ) -> anyhow::Result<ProviderHandle> {
        let handle = self.state.lock().await.submit(JobKind::Drain)?;
        debug!(pool = %pool.id, instance_id, grace_secs = grace_period.as_secs(), "simulated drain submitted");
        Ok(handle)
    }

    async fn poll(&self, handle: &ProviderHandle) -> anyhow::Result<JobStatus> {
        let mut guard = self.state.lock().await;
        let SimState {
            config,
            jobs,
            next_instance,
            ..
        } = &mut *guard;
        let Some(job) = jobs.get_mut(&handle.0) else {
            anyhow::bail!("unknown provider handle {}", handle.0);
        };

        if job.cancelled {
            return Ok(JobStatus {
                phase: JobPhase::Failed("cancelled".into()),
                created: job.created.clone(),
                removed: Vec::new(),
            });
        }

        job.polls += 1;
        let finished = job.polls > config.polls_to_complete;
        let phase = match (finished, config.fail_jobs) {
            (false, _) => JobPhase::Running,
            (true, true) => JobPhase::Failed("simulated job failure".into()),
            (true, false) => JobPhase::Succeeded,
        };

        match &job.kind {
            JobKind::Create { count } => {
                let count = *count as usize;
                let due = if finished || config.polls_to_complete == 0 {
                    count
                } else {
                    // Spread creation over the polls of the job.
                    (count * job.polls as usize).div_ceil(config.polls_to_complete as usize + 1)
                };
                while job.created.len() < due.min(count) {
                    *next_instance += 1;
                    job.created.push(ProvisionedInstance {
                        instance_id: format!("sim-{:06}", *next_instance),
                        cpu_millicores: config.cpu_millicores,
                        memory_mb: config.memory_mb,
                        ready: false,
                    });
                }
                if phase == JobPhase::Succeeded {
                    for instance in &mut job.created {
                        instance.ready = true;
                    }
                }
                Ok(JobStatus {
                    phase,
                    created: job.created.clone(),
                    removed: Vec::new(),
                })
            }
            JobKind::Destroy { instance_ids } => Ok(JobStatus {
                removed: if phase == JobPhase::Succeeded {
                    instance_ids.clone()
                } else {
                    Vec::new()
                },
                phase,
                created: Vec::new(),
            }),
            JobKind::Drain if config.stuck_drains => Ok(JobStatus {
                phase: JobPhase::Running,
                created: Vec::new(),
                removed: Vec::new(),
            }),
            JobKind::Drain => Ok(JobStatus {
                phase,
                created: Vec::new(),
                removed: Vec::new(),
            }),
        }
    }

    async fn cancel(&self, handle: &ProviderHandle) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&handle.0) else {
            anyhow::bail!("unknown provider handle {}", handle.0);
        };
        job.cancelled = true;
        Ok(())
    }
}

/// A [`ClusterObserver`] whose answers are set by hand.
#[derive(Default)]
pub struct StaticClusterObserver {
    pending: Mutex<Vec<PendingPod>>,
    allocations: Mutex<HashMap<String, NodeAllocation>>,
}

impl StaticClusterObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_pending_pods(&self, pods: Vec<PendingPod>) {
        *self.pending.lock().await = pods;
    }

    pub async fn set_allocation(&self, instance_id: impl Into<String>, allocation: NodeAllocation) {
        self.allocations.lock().await.insert(instance_id.into(), allocation);
    }
}

#[async_trait]
impl ClusterObserver for StaticClusterObserver {
    async fn pending_pods(&self, _ctx: &TenantContext) -> anyhow::Result<Vec<PendingPod>> {
        Ok(self.pending.lock().await.clone())
    }

    async fn node_allocations(&self, _ctx: &TenantContext) -> anyhow::Result<HashMap<String, NodeAllocation>> {
        Ok(self.allocations.lock().await.clone())
    }
}
