//! Standalone mode: every subsystem in one process, backed by the
//! simulated provider.

use std::path::Path;
use std::sync::Arc;

use flowscale_autoscale::{
    ComputeTargetScaler, IdleTracker, InMemoryComputeScaler, PolicyEngine, StoreMetricsProvider,
};
use flowscale_nodepool::{
    CapacityMetricsProvider, NodePoolManager, NodePoolScaler, SimulatedProvider, StaticClusterObserver,
};
use flowscale_state::StateStore;
use tokio::sync::watch;
use tracing::info;

use crate::config::FlowscaleConfig;

/// The assembled control plane.
pub struct ControlPlane {
    pub store: StateStore,
    pub engine: Arc<PolicyEngine>,
    pub node_pools: Arc<NodePoolManager>,
    pub idle: IdleTracker,
    pub provider: Arc<SimulatedProvider>,
    pub observer: Arc<StaticClusterObserver>,
    pub compute: Arc<InMemoryComputeScaler>,
}

impl ControlPlane {
    /// Wire the subsystems on top of `store`.
    pub fn assemble(config: &FlowscaleConfig, store: StateStore) -> anyhow::Result<Self> {
        let provider = Arc::new(SimulatedProvider::new(config.simulated_config()));
        let observer = Arc::new(StaticClusterObserver::new());
        let node_pools = Arc::new(NodePoolManager::new(
            store.clone(),
            provider.clone(),
            observer.clone(),
            config.node_pool_config(),
        ));

        let mut metrics = StoreMetricsProvider::new(store.clone());
        if let Some(max_age) = config.metrics_max_age() {
            metrics = metrics.with_max_age(max_age);
        }
        let compute = Arc::new(InMemoryComputeScaler::new());
        let engine = Arc::new(
            PolicyEngine::new(
                store.clone(),
                config.engine_config(),
                Arc::new(metrics),
                Arc::new(ComputeTargetScaler::new(store.clone(), compute.clone())),
            )
            .with_node_targets(
                Arc::new(CapacityMetricsProvider::new(node_pools.clone())),
                Arc::new(NodePoolScaler::new(node_pools.clone())),
            ),
        );
        let idle = IdleTracker::new(engine.clone(), Arc::new(config.cost_model()?), config.idle_config());

        Ok(Self {
            store,
            engine,
            node_pools,
            idle,
            provider,
            observer,
            compute,
        })
    }

    /// Open the state store under `data_dir` and assemble.
    pub fn open(config: &FlowscaleConfig, data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("flowscale.redb");
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");
        Self::assemble(config, store)
    }

    /// Run the evaluation and reconciliation loops until `shutdown` flips.
    pub async fn run(&self, config: &FlowscaleConfig, shutdown: watch::Receiver<bool>) {
        let engine = tokio::spawn(
            self.engine
                .clone()
                .run(config.evaluation_interval(), shutdown.clone()),
        );
        let reconciler = tokio::spawn(
            self.node_pools
                .clone()
                .run(config.reconcile_interval(), shutdown),
        );

        let _ = engine.await;
        let _ = reconciler.await;
    }
}
