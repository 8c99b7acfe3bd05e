//! Rule evaluator: debounced threshold rules over a metrics snapshot.
//!
//! A rule fires only after its condition has held continuously for at
//! least `duration_seconds`. The [`DurationTracker`] remembers, per rule,
//! since when the condition has held; it forgets a rule as soon as the
//! metric crosses back or disappears from the snapshot.
//!
//! When several rules of one set fire together, the largest `|scale_by|`
//! wins; equal magnitudes resolve to the rule declared first.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use flowscale_state::{MetricsSnapshot, Rule};

/// Which rule set a rule belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RuleKey {
    direction: Direction,
    index: usize,
    /// Guards against a rule at the same index being swapped for another.
    fingerprint: String,
}

impl RuleKey {
    fn new(direction: Direction, index: usize, rule: &Rule) -> Self {
        Self {
            direction,
            index,
            fingerprint: format!("{}|{}|{}", rule.metric, rule.operator, rule.threshold),
        }
    }
}

/// Per-policy memory of since when each rule condition has held.
#[derive(Debug, Clone, Default)]
pub struct DurationTracker {
    holding_since: HashMap<RuleKey, DateTime<Utc>>,
}

impl DurationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every rule.
    pub fn reset(&mut self) {
        self.holding_since.clear();
    }

    /// Number of rules currently holding.
    pub fn holding(&self) -> usize {
        self.holding_since.len()
    }

    /// Record one observation and return how long the condition has held.
    fn observe(&mut self, key: RuleKey, holds: bool, now: DateTime<Utc>) -> Option<chrono::Duration> {
        if !holds {
            self.holding_since.remove(&key);
            return None;
        }
        let since = *self.holding_since.entry(key).or_insert(now);
        Some(now - since)
    }
}

/// Result of evaluating one rule set.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    pub fires: bool,
    /// Signed `scale_by` of the winning rule, zero if nothing fired.
    pub delta: i32,
    pub reason: String,
    pub metric: Option<String>,
    pub value: Option<f64>,
}

impl RuleOutcome {
    fn quiet() -> Self {
        Self {
            fires: false,
            delta: 0,
            reason: String::new(),
            metric: None,
            value: None,
        }
    }

    pub fn magnitude(&self) -> u32 {
        self.delta.unsigned_abs()
    }
}

/// Evaluate one rule set against `metrics`, advancing `tracker`.
///
/// Every rule is observed on every call, even after one has fired, so that
/// debounce windows of the other rules stay continuous.
pub fn evaluate_rules(
    rules: &[Rule],
    direction: Direction,
    metrics: &MetricsSnapshot,
    tracker: &mut DurationTracker,
    now: DateTime<Utc>,
) -> RuleOutcome {
    let mut best: Option<(usize, &Rule, f64)> = None;

    for (index, rule) in rules.iter().enumerate() {
        let value = metrics.get(&rule.metric).filter(|v| v.is_finite());
        let holds = value.is_some_and(|v| rule.operator.holds(v, rule.threshold));
        let held_for = tracker.observe(RuleKey::new(direction, index, rule), holds, now);

        let required = i64::try_from(rule.duration_seconds).unwrap_or(i64::MAX);
        let fired = held_for.is_some_and(|held| held.num_seconds() >= required);
        if !fired {
            continue;
        }
        let Some(value) = value else { continue };

        let wins = match best {
            Some((_, current, _)) => rule.scale_by.unsigned_abs() > current.scale_by.unsigned_abs(),
            None => true,
        };
        if wins {
            best = Some((index, rule, value));
        }
    }

    match best {
        Some((_, rule, value)) => RuleOutcome {
            fires: true,
            delta: rule.scale_by,
            reason: format!(
                "{} {} {} (observed {}) for {}s",
                rule.metric, rule.operator, rule.threshold, value, rule.duration_seconds
            ),
            metric: Some(rule.metric.clone()),
            value: Some(value),
        },
        None => RuleOutcome::quiet(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use flowscale_state::Operator;

    fn rule(metric: &str, operator: Operator, threshold: f64, duration: u64, scale_by: i32) -> Rule {
        Rule {
            metric: metric.into(),
            operator,
            threshold,
            duration_seconds: duration,
            scale_by,
        }
    }

    fn snap(values: &[(&str, f64)]) -> MetricsSnapshot {
        values
            .iter()
            .fold(MetricsSnapshot::new("trino:fleet", Utc::now()), |s, (k, v)| s.with(k, *v))
    }

    #[test]
    fn zero_duration_fires_immediately() {
        let rules = [rule("queued", Operator::Gt, 5.0, 0, 2)];
        let mut tracker = DurationTracker::new();
        let out = evaluate_rules(&rules, Direction::Up, &snap(&[("queued", 6.0)]), &mut tracker, Utc::now());
        assert!(out.fires);
        assert_eq!(out.delta, 2);
        assert!(out.reason.contains("queued"));
        assert_eq!(out.value, Some(6.0));
    }

    #[test]
    fn debounce_requires_continuous_violation() {
        let rules = [rule("cpu", Operator::Gte, 80.0, 60, 1)];
        let mut tracker = DurationTracker::new();
        let t0 = Utc::now();

        let hot = snap(&[("cpu", 90.0)]);
        let cool = snap(&[("cpu", 10.0)]);

        assert!(!evaluate_rules(&rules, Direction::Up, &hot, &mut tracker, t0).fires);
        assert!(!evaluate_rules(&rules, Direction::Up, &hot, &mut tracker, t0 + Duration::seconds(30)).fires);
        // Crossing back resets the window.
        assert!(!evaluate_rules(&rules, Direction::Up, &cool, &mut tracker, t0 + Duration::seconds(45)).fires);
        assert!(!evaluate_rules(&rules, Direction::Up, &hot, &mut tracker, t0 + Duration::seconds(60)).fires);
        assert!(!evaluate_rules(&rules, Direction::Up, &hot, &mut tracker, t0 + Duration::seconds(100)).fires);
        assert!(evaluate_rules(&rules, Direction::Up, &hot, &mut tracker, t0 + Duration::seconds(120)).fires);
    }

    #[test]
    fn missing_metric_resets_rule() {
        let rules = [rule("lag", Operator::Gt, 100.0, 30, 1)];
        let mut tracker = DurationTracker::new();
        let t0 = Utc::now();
        evaluate_rules(&rules, Direction::Up, &snap(&[("lag", 500.0)]), &mut tracker, t0);
        assert_eq!(tracker.holding(), 1);

        evaluate_rules(&rules, Direction::Up, &snap(&[]), &mut tracker, t0 + Duration::seconds(10));
        assert_eq!(tracker.holding(), 0);

        let out = evaluate_rules(&rules, Direction::Up, &snap(&[("lag", 500.0)]), &mut tracker, t0 + Duration::seconds(35));
        assert!(!out.fires);
    }

    #[test]
    fn largest_magnitude_wins_with_first_declared_on_tie() {
        let rules = [
            rule("queued", Operator::Gt, 5.0, 0, 2),
            rule("cpu", Operator::Gt, 50.0, 0, 4),
            rule("mem", Operator::Gt, 50.0, 0, 4),
        ];
        let mut tracker = DurationTracker::new();
        let out = evaluate_rules(
            &rules,
            Direction::Up,
            &snap(&[("queued", 10.0), ("cpu", 90.0), ("mem", 90.0)]),
            &mut tracker,
            Utc::now(),
        );
        assert_eq!(out.delta, 4);
        assert_eq!(out.metric.as_deref(), Some("cpu"));
        // Every rule was observed, not only the winner.
        assert_eq!(tracker.holding(), 3);
    }

    #[test]
    fn scale_down_rules_report_negative_delta() {
        let rules = [
            rule("queued", Operator::Lt, 1.0, 0, -1),
            rule("cpu", Operator::Lte, 10.0, 0, -3),
        ];
        let mut tracker = DurationTracker::new();
        let out = evaluate_rules(
            &rules,
            Direction::Down,
            &snap(&[("queued", 0.0), ("cpu", 5.0)]),
            &mut tracker,
            Utc::now(),
        );
        assert_eq!(out.delta, -3);
        assert_eq!(out.magnitude(), 3);
    }

    #[test]
    fn non_finite_values_never_hold() {
        let rules = [rule("queued", Operator::Gt, 5.0, 0, 1)];
        let mut tracker = DurationTracker::new();
        let out = evaluate_rules(&rules, Direction::Up, &snap(&[("queued", f64::NAN)]), &mut tracker, Utc::now());
        assert!(!out.fires);
    }

    #[test]
    fn replaced_rule_starts_a_fresh_window() {
        let t0 = Utc::now();
        let mut tracker = DurationTracker::new();
        let before = [rule("cpu", Operator::Gt, 50.0, 30, 1)];
        evaluate_rules(&before, Direction::Up, &snap(&[("cpu", 90.0), ("mem", 90.0)]), &mut tracker, t0);

        let after = [rule("mem", Operator::Gt, 50.0, 30, 1)];
        let out = evaluate_rules(
            &after,
            Direction::Up,
            &snap(&[("cpu", 90.0), ("mem", 90.0)]),
            &mut tracker,
            t0 + Duration::seconds(31),
        );
        assert!(!out.fires);
    }
}
