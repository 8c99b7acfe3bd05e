//! Metrics sources consumed by the policy engine.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use flowscale_state::{MetricsSnapshot, ScalingPolicy, StateStore, TenantContext};
use tracing::debug;

use crate::error::AutoscaleResult;

/// Supplies the current named metric values for a policy's target.
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    async fn snapshot(&self, ctx: &TenantContext, policy: &ScalingPolicy) -> AutoscaleResult<MetricsSnapshot>;
}

/// Reads the latest snapshot pushed into the state store for the target.
///
/// No snapshot, or one older than `max_age`, yields an empty snapshot:
/// every rule then sees its metric as missing and stops holding.
#[derive(Clone)]
pub struct StoreMetricsProvider {
    store: StateStore,
    max_age: Option<Duration>,
}

impl StoreMetricsProvider {
    pub fn new(store: StateStore) -> Self {
        Self { store, max_age: None }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }
}

#[async_trait]
impl MetricsProvider for StoreMetricsProvider {
    async fn snapshot(&self, ctx: &TenantContext, policy: &ScalingPolicy) -> AutoscaleResult<MetricsSnapshot> {
        let target = policy.target_key();
        let now = Utc::now();
        match self.store.latest_metrics(ctx, &target)? {
            Some(snapshot) if self.max_age.is_none_or(|age| now - snapshot.observed_at <= age) => Ok(snapshot),
            Some(stale) => {
                debug!(%target, observed_at = %stale.observed_at, "ignoring stale metrics snapshot");
                Ok(MetricsSnapshot::new(target, now))
            }
            None => Ok(MetricsSnapshot::new(target, now)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowscale_state::{RuleSet, TargetType};
    use uuid::Uuid;

    fn policy(ctx: &TenantContext) -> ScalingPolicy {
        let now = Utc::now();
        ScalingPolicy {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id,
            name: "rw".into(),
            target_type: TargetType::Risingwave,
            target_id: None,
            min_replicas: 1,
            max_replicas: 3,
            cooldown_seconds: 0,
            scale_to_zero: false,
            idle_timeout_seconds: 900,
            enabled: true,
            rules: RuleSet::default(),
            schedules: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn returns_latest_snapshot_for_target() {
        let store = StateStore::open_in_memory().unwrap();
        let ctx = TenantContext::new(Uuid::new_v4());
        let p = policy(&ctx);
        store
            .put_metrics(&ctx, &MetricsSnapshot::new(p.target_key(), Utc::now()).with("barrier_latency", 2.5))
            .unwrap();

        let provider = StoreMetricsProvider::new(store);
        let snap = provider.snapshot(&ctx, &p).await.unwrap();
        assert_eq!(snap.get("barrier_latency"), Some(2.5));
    }

    #[tokio::test]
    async fn stale_or_missing_snapshots_are_empty() {
        let store = StateStore::open_in_memory().unwrap();
        let ctx = TenantContext::new(Uuid::new_v4());
        let p = policy(&ctx);
        let provider = StoreMetricsProvider::new(store.clone()).with_max_age(Duration::minutes(5));
        assert!(provider.snapshot(&ctx, &p).await.unwrap().values.is_empty());

        store
            .put_metrics(
                &ctx,
                &MetricsSnapshot::new(p.target_key(), Utc::now() - Duration::hours(1)).with("barrier_latency", 9.0),
            )
            .unwrap();
        assert!(provider.snapshot(&ctx, &p).await.unwrap().values.is_empty());
    }
}
