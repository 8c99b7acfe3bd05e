//! Schedule evaluator: cron-triggered replica targets.
//!
//! A schedule is active for an evaluation when it triggered inside the
//! window `(window_start, now]`, where `window_start` is the previous
//! evaluation of the policy. If several schedules triggered, the most
//! recent trigger wins; identical trigger instants resolve to the larger
//! `desired_replicas`, then to declaration order.
//!
//! Cron expressions come in two dialects:
//!
//! - 5 fields (`min hour dom month dow`): classic crontab, day-of-week
//!   `0-7` with Sunday as `0` or `7`.
//! - 6 or 7 fields (`sec min hour dom month dow [year]`): passed through
//!   unchanged, day-of-week `1-7` with Sunday as `1`.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use flowscale_state::Schedule;
use tracing::warn;

/// A schedule that triggered in the evaluation window.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSchedule<'a> {
    pub index: usize,
    pub schedule: &'a Schedule,
    pub triggered_at: DateTime<Utc>,
}

impl ActiveSchedule<'_> {
    pub fn label(&self) -> String {
        match &self.schedule.name {
            Some(name) => name.clone(),
            None => format!("schedule #{}", self.index),
        }
    }
}

/// Parse a cron expression in either supported dialect.
pub fn parse_cron(expression: &str) -> Result<CronSchedule, String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let normalized = match fields.len() {
        5 => {
            let dow = crontab_day_of_week(fields[4])?;
            format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], dow)
        }
        6 | 7 => fields.join(" "),
        n => return Err(format!("cron expression must have 5, 6 or 7 fields, got {n}")),
    };
    CronSchedule::from_str(&normalized).map_err(|e| format!("invalid cron expression {expression:?}: {e}"))
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, String> {
    name.parse::<Tz>()
        .map_err(|_| format!("unknown timezone {name:?}"))
}

/// Check that a schedule's cron expression and timezone both parse.
pub fn validate_schedule(schedule: &Schedule) -> Result<(), String> {
    parse_cron(&schedule.cron_expression)?;
    parse_timezone(&schedule.timezone)?;
    Ok(())
}

/// Latest trigger instant of `schedule` inside `(window_start, now]`.
pub fn latest_trigger(
    schedule: &Schedule,
    window_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, String> {
    let cron = parse_cron(&schedule.cron_expression)?;
    let tz = parse_timezone(&schedule.timezone)?;
    if window_start >= now {
        return Ok(None);
    }
    Ok(cron
        .after(&window_start.with_timezone(&tz))
        .map(|t| t.with_timezone(&Utc))
        .take_while(|t| *t <= now)
        .last())
}

/// Resolve the single active schedule for an evaluation, if any.
pub fn evaluate_schedules(
    schedules: &[Schedule],
    window_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<ActiveSchedule<'_>> {
    let mut best: Option<ActiveSchedule<'_>> = None;

    for (index, schedule) in schedules.iter().enumerate() {
        if !schedule.enabled {
            continue;
        }
        let triggered_at = match latest_trigger(schedule, window_start, now) {
            Ok(Some(t)) => t,
            Ok(None) => continue,
            Err(e) => {
                warn!(index, error = %e, "skipping unparseable schedule");
                continue;
            }
        };

        let replace = match &best {
            None => true,
            Some(current) => {
                triggered_at > current.triggered_at
                    || (triggered_at == current.triggered_at
                        && schedule.desired_replicas > current.schedule.desired_replicas)
            }
        };
        if replace {
            best = Some(ActiveSchedule {
                index,
                schedule,
                triggered_at,
            });
        }
    }

    best
}

/// Translate a crontab day-of-week field (Sunday = 0 or 7) into the
/// Sunday = 1 numbering of the 6/7-field dialect.
fn crontab_day_of_week(field: &str) -> Result<String, String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        // `*`, `*/n` and day names mean the same in both dialects.
        if range == "*" || !range.bytes().all(|b| b.is_ascii_digit() || b == b'-') {
            items.push(item.to_string());
            continue;
        }

        let day = |raw: &str| -> Result<u32, String> {
            let n: u32 = raw
                .parse()
                .map_err(|_| format!("invalid day of week {raw:?}"))?;
            if n > 7 {
                return Err(format!("day of week out of range: {n}"));
            }
            Ok(n)
        };
        let shift = |n: u32| n % 7 + 1;

        match (range.split_once('-'), step) {
            (None, None) => items.push(shift(day(range)?).to_string()),
            (None, Some(step)) => items.push(format!("{}/{step}", shift(day(range)?))),
            // Stepped ranges are spelled out, since Sunday can sit at either end.
            (Some((from, to)), Some(step)) => {
                let (from, to) = (day(from)?, day(to)?);
                let step: usize = match step.parse() {
                    Ok(n) if n > 0 => n,
                    _ => return Err(format!("invalid day of week step {step:?}")),
                };
                if from > to {
                    return Err(format!("day of week range {from}-{to} runs backwards"));
                }
                items.extend((from..=to).step_by(step).map(|n| shift(n).to_string()));
            }
            (Some((from, to)), None) => {
                let (from, to) = (day(from)?, day(to)?);
                if to == 7 {
                    // `5-7` is Friday through Sunday: `6-7` plus Sunday.
                    items.push("1".to_string());
                    if from != 7 {
                        let from = shift(from);
                        items.push(if from == 7 { "7".to_string() } else { format!("{from}-7") });
                    }
                } else {
                    items.push(format!("{}-{}", shift(from), shift(to)));
                }
            }
        }
    }
    Ok(items.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn schedule(cron: &str, desired: u32) -> Schedule {
        Schedule {
            name: None,
            cron_expression: cron.into(),
            desired_replicas: desired,
            timezone: "UTC".into(),
            enabled: true,
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn five_field_weekdays_follow_crontab_numbering() {
        let business = schedule("0 9 * * 1-5", 4);
        // 2026-10-19 is a Monday, 2026-10-18 a Sunday.
        let monday = at(2026, 10, 19, 9, 0);
        let sunday = at(2026, 10, 18, 9, 0);

        let hit = latest_trigger(&business, monday - Duration::minutes(1), monday).unwrap();
        assert_eq!(hit, Some(monday));
        let miss = latest_trigger(&business, sunday - Duration::minutes(1), sunday).unwrap();
        assert_eq!(miss, None);
    }

    #[test]
    fn sunday_as_seven_is_accepted() {
        let weekend = schedule("30 8 * * 6-7", 1);
        let sunday = at(2026, 10, 18, 8, 30);
        let hit = latest_trigger(&weekend, sunday - Duration::minutes(5), sunday).unwrap();
        assert_eq!(hit, Some(sunday));
    }

    #[test]
    fn stepped_day_range_ending_on_sunday() {
        let alternate = schedule("0 9 * * 5-7/2", 2);
        // 2026-10-16 is a Friday.
        for (day, fires) in [(16, true), (17, false), (18, true), (19, false)] {
            let nine = at(2026, 10, day, 9, 0);
            let hit = latest_trigger(&alternate, nine - Duration::minutes(1), nine).unwrap();
            assert_eq!(hit.is_some(), fires, "day {day}");
        }
        assert_eq!(crontab_day_of_week("0-6/3").unwrap(), "1,4,7");
        assert_eq!(crontab_day_of_week("7-7").unwrap(), "1");
        assert!(crontab_day_of_week("5-7/0").is_err());
    }

    #[test]
    fn six_field_expressions_pass_through() {
        let every_30s = schedule("*/30 * * * * *", 2);
        let now = at(2026, 10, 19, 12, 0) + Duration::seconds(45);
        let hit = latest_trigger(&every_30s, now - Duration::seconds(40), now).unwrap();
        assert_eq!(hit, Some(at(2026, 10, 19, 12, 0) + Duration::seconds(30)));
    }

    #[test]
    fn window_excludes_start_and_includes_now() {
        let hourly = schedule("0 * * * *", 3);
        let top = at(2026, 10, 19, 10, 0);
        assert_eq!(latest_trigger(&hourly, top, top + Duration::minutes(5)).unwrap(), None);
        assert_eq!(
            latest_trigger(&hourly, top - Duration::minutes(5), top).unwrap(),
            Some(top)
        );
    }

    #[test]
    fn timezone_shifts_trigger() {
        let mut berlin = schedule("0 9 * * *", 5);
        berlin.timezone = "Europe/Berlin".into();
        // 09:00 CEST on 2026-07-01 is 07:00 UTC.
        let now = at(2026, 7, 1, 7, 0);
        let hit = latest_trigger(&berlin, now - Duration::minutes(1), now).unwrap();
        assert_eq!(hit, Some(now));
    }

    #[test]
    fn most_recent_trigger_wins() {
        let schedules = vec![schedule("0 8 * * *", 2), schedule("30 8 * * *", 6)];
        let now = at(2026, 10, 19, 8, 45);
        let active = evaluate_schedules(&schedules, now - Duration::hours(1), now).unwrap();
        assert_eq!(active.index, 1);
        assert_eq!(active.schedule.desired_replicas, 6);
    }

    #[test]
    fn identical_triggers_prefer_larger_target_then_declaration_order() {
        let now = at(2026, 10, 19, 9, 0);
        let window = now - Duration::minutes(1);

        let schedules = vec![schedule("0 9 * * *", 2), schedule("0 9 * * *", 5)];
        assert_eq!(evaluate_schedules(&schedules, window, now).unwrap().index, 1);

        let schedules = vec![schedule("0 9 * * *", 5), schedule("0 9 * * *", 5)];
        assert_eq!(evaluate_schedules(&schedules, window, now).unwrap().index, 0);
    }

    #[test]
    fn disabled_and_invalid_schedules_are_ignored() {
        let mut off = schedule("0 9 * * *", 5);
        off.enabled = false;
        let schedules = vec![off, schedule("not a cron", 3)];
        let now = at(2026, 10, 19, 9, 0);
        assert!(evaluate_schedules(&schedules, now - Duration::minutes(1), now).is_none());
    }

    #[test]
    fn validation_rejects_bad_input() {
        assert!(validate_schedule(&schedule("0 9 * *", 1)).is_err());
        assert!(validate_schedule(&schedule("0 25 * * *", 1)).is_err());
        let mut tz = schedule("0 9 * * *", 1);
        tz.timezone = "Mars/Olympus".into();
        assert!(validate_schedule(&tz).is_err());
        assert!(validate_schedule(&schedule("0 9 * * Mon-Fri", 1)).is_ok());
    }
}
