//! Boundary validation for scaling policies.
//!
//! Policies are validated as a whole (after a patch has been merged), and
//! every problem found is reported in one `Validation` error.

use flowscale_state::{Rule, ScalingPolicy, TargetType};

use crate::error::{AutoscaleError, AutoscaleResult};
use crate::schedule::validate_schedule;

const MAX_NAME_LEN: usize = 128;
const MAX_COOLDOWN_SECONDS: u64 = 7 * 24 * 3600;
const MAX_IDLE_TIMEOUT_SECONDS: u64 = 30 * 24 * 3600;
const MAX_RULE_DURATION_SECONDS: u64 = 24 * 3600;

pub fn validate_policy(policy: &ScalingPolicy) -> AutoscaleResult<()> {
    let mut problems = Vec::new();

    let name = policy.name.trim();
    if name.is_empty() {
        problems.push("name must not be empty".to_string());
    } else if name.len() > MAX_NAME_LEN {
        problems.push(format!("name longer than {MAX_NAME_LEN} characters"));
    }

    if policy.max_replicas < 1 {
        problems.push("max_replicas must be at least 1".to_string());
    }
    if policy.min_replicas > policy.max_replicas {
        problems.push(format!(
            "min_replicas ({}) exceeds max_replicas ({})",
            policy.min_replicas, policy.max_replicas
        ));
    }
    if policy.cooldown_seconds > MAX_COOLDOWN_SECONDS {
        problems.push(format!("cooldown_seconds exceeds {MAX_COOLDOWN_SECONDS}"));
    }
    if policy.idle_timeout_seconds == 0 || policy.idle_timeout_seconds > MAX_IDLE_TIMEOUT_SECONDS {
        problems.push(format!(
            "idle_timeout_seconds must be between 1 and {MAX_IDLE_TIMEOUT_SECONDS}"
        ));
    }
    if policy.target_type == TargetType::Nodes && policy.target_id.is_none() {
        problems.push("nodes policies require target_id (the node pool id)".to_string());
    }

    for (index, rule) in policy.rules.scale_up.iter().enumerate() {
        check_rule(rule, &format!("scale_up[{index}]"), true, &mut problems);
    }
    for (index, rule) in policy.rules.scale_down.iter().enumerate() {
        check_rule(rule, &format!("scale_down[{index}]"), false, &mut problems);
    }

    for (index, schedule) in policy.schedules.iter().enumerate() {
        if let Err(e) = validate_schedule(schedule) {
            problems.push(format!("schedules[{index}]: {e}"));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(AutoscaleError::Validation(problems.join("; ")))
    }
}

fn check_rule(rule: &Rule, at: &str, scale_up: bool, problems: &mut Vec<String>) {
    if rule.metric.trim().is_empty() {
        problems.push(format!("{at}: metric must not be empty"));
    }
    if !rule.threshold.is_finite() {
        problems.push(format!("{at}: threshold must be a finite number"));
    }
    if rule.duration_seconds > MAX_RULE_DURATION_SECONDS {
        problems.push(format!("{at}: duration_seconds exceeds {MAX_RULE_DURATION_SECONDS}"));
    }
    match (scale_up, rule.scale_by) {
        (_, 0) => problems.push(format!("{at}: scale_by must not be zero")),
        (true, n) if n < 0 => problems.push(format!("{at}: scale-up rules need a positive scale_by")),
        (false, n) if n > 0 => problems.push(format!("{at}: scale-down rules need a negative scale_by")),
        _ => {}
    }
}
