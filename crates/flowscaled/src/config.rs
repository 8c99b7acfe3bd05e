//! flowscale.toml configuration parser.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use flowscale_autoscale::{EngineConfig, IdleConfig, StaticCostModel};
use flowscale_nodepool::{NodePoolConfig, SimulatedConfig};
use flowscale_state::TargetType;
use serde::{Deserialize, Serialize};

const TARGET_TYPES: [TargetType; 4] = [
    TargetType::CdcWorker,
    TargetType::Trino,
    TargetType::Risingwave,
    TargetType::Nodes,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowscaleConfig {
    pub data_dir: PathBuf,
    pub evaluation: EvaluationConfig,
    pub reconcile: ReconcileConfig,
    pub drain: DrainConfig,
    pub wake: WakeConfig,
    pub costs: CostsConfig,
    pub simulated: SimulatedProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvaluationConfig {
    pub interval_secs: u64,
    pub schedule_lookback_secs: u64,
    /// Metrics snapshots older than this are ignored. `0` disables the check.
    pub metrics_max_age_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcileConfig {
    pub interval_secs: u64,
    pub stale_pending_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DrainConfig {
    pub grace_period_secs: u64,
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WakeConfig {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
}

/// Hourly cost per target type, used for savings reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CostsConfig {
    pub default_hourly: f64,
    /// Keyed by target type (`cdc-worker`, `trino`, `risingwave`, `nodes`).
    pub hourly: BTreeMap<String, f64>,
}

/// Behaviour of the in-process provider used in standalone mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulatedProviderConfig {
    pub polls_to_complete: u32,
    pub cpu_millicores: u32,
    pub memory_mb: u64,
}

impl Default for FlowscaleConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/flowscale"),
            evaluation: EvaluationConfig::default(),
            reconcile: ReconcileConfig::default(),
            drain: DrainConfig::default(),
            wake: WakeConfig::default(),
            costs: CostsConfig::default(),
            simulated: SimulatedProviderConfig::default(),
        }
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            schedule_lookback_secs: 300,
            metrics_max_age_secs: 300,
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            stale_pending_secs: 300,
        }
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 30,
            timeout_secs: 300,
            poll_interval_secs: 2,
        }
    }
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            poll_interval_ms: 1_000,
        }
    }
}

impl Default for SimulatedProviderConfig {
    fn default() -> Self {
        let defaults = SimulatedConfig::default();
        Self {
            polls_to_complete: defaults.polls_to_complete,
            cpu_millicores: defaults.cpu_millicores,
            memory_mb: defaults.memory_mb,
        }
    }
}

impl FlowscaleConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FlowscaleConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path` if it exists, otherwise fall back to defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.evaluation.interval_secs == 0 {
            bail!("evaluation.interval_secs must be positive");
        }
        if self.reconcile.interval_secs == 0 {
            bail!("reconcile.interval_secs must be positive");
        }
        if self.drain.poll_interval_secs == 0 || self.wake.poll_interval_ms == 0 {
            bail!("poll intervals must be positive");
        }
        self.cost_model()?;
        Ok(())
    }

    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation.interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile.interval_secs)
    }

    /// `None` when snapshots never go stale.
    pub fn metrics_max_age(&self) -> Option<chrono::Duration> {
        match self.evaluation.metrics_max_age_secs {
            0 => None,
            secs => chrono::Duration::try_seconds(i64::try_from(secs).ok()?),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            schedule_lookback: Duration::from_secs(self.evaluation.schedule_lookback_secs),
        }
    }

    pub fn node_pool_config(&self) -> NodePoolConfig {
        NodePoolConfig {
            drain_grace_period: Duration::from_secs(self.drain.grace_period_secs),
            drain_timeout: Duration::from_secs(self.drain.timeout_secs),
            drain_poll_interval: Duration::from_secs(self.drain.poll_interval_secs),
            stale_pending_after: Duration::from_secs(self.reconcile.stale_pending_secs),
        }
    }

    pub fn idle_config(&self) -> IdleConfig {
        IdleConfig {
            wake_timeout: Duration::from_secs(self.wake.timeout_secs),
            wake_poll_interval: Duration::from_millis(self.wake.poll_interval_ms),
        }
    }

    pub fn simulated_config(&self) -> SimulatedConfig {
        SimulatedConfig {
            polls_to_complete: self.simulated.polls_to_complete,
            cpu_millicores: self.simulated.cpu_millicores,
            memory_mb: self.simulated.memory_mb,
            ..Default::default()
        }
    }

    /// Build the cost model, rejecting unknown target types and negative rates.
    pub fn cost_model(&self) -> anyhow::Result<StaticCostModel> {
        if self.costs.default_hourly < 0.0 {
            bail!("costs.default_hourly must not be negative");
        }
        let mut model = StaticCostModel::new(self.costs.default_hourly);
        for (name, rate) in &self.costs.hourly {
            let Some(target_type) = TARGET_TYPES.into_iter().find(|t| t.as_str() == name.as_str()) else {
                bail!("costs.hourly: unknown target type {name:?}");
            };
            if *rate < 0.0 || !rate.is_finite() {
                bail!("costs.hourly.{name}: rate must be a non-negative number");
            }
            model = model.with_rate(target_type, *rate);
        }
        Ok(model)
    }
}
