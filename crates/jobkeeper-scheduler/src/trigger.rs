//! Trigger state machines: when a job fires next and when it stops.
//!
//! Every variant is a plain value. [`Trigger::advance`] consumes one fire and
//! returns the advanced trigger together with its next fire time, or `None`
//! once the trigger is exhausted. Fire times are anchored to the previous
//! fire time, never to the wall clock, so late dispatches do not drift.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::types::TimeUnit;

/// When and how often a job fires. `classType` is the wire discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "classType")]
pub enum Trigger {
    #[serde(rename = "PointInTimeTrigger")]
    PointInTime(PointInTimeTrigger),
    #[serde(rename = "SimpleTimerTrigger")]
    SimpleTimer(SimpleTimerTrigger),
    #[serde(rename = "IntervalTrigger")]
    Interval(IntervalTrigger),
}

/// Fires exactly once at `fireAt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointInTimeTrigger {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub fire_at: DateTime<Utc>,
    #[serde(default)]
    pub fired: bool,
}

/// Fires at `startTime`, then `repeatCount` more times every `period`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleTimerTrigger {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub period: i64,
    #[serde(default)]
    pub period_unit: TimeUnit,
    /// Repeats after the first fire, so the trigger fires `repeatCount + 1` times.
    #[serde(default)]
    pub repeat_count: i32,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub end_time: Option<DateTime<Utc>>,
    /// Informational only: periods are fixed-length, so arithmetic happens in UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
    /// Absent on submission; `startTime` is the first fire.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub next_fire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub current_repeat_count: i32,
    #[serde(default)]
    pub end_time_reached: bool,
}

/// Fires every `period` milliseconds, at most `repeatLimit` times in total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntervalTrigger {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub end_time: Option<DateTime<Utc>>,
    /// Negative means unlimited.
    #[serde(default = "unlimited")]
    pub repeat_limit: i32,
    /// Fires consumed so far.
    #[serde(default)]
    pub repeat_count: i32,
    /// Milliseconds between fires.
    #[serde(default)]
    pub period: i64,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub next_fire_time: Option<DateTime<Utc>>,
}

fn unlimited() -> i32 {
    -1
}

impl Trigger {
    /// Fire once at `at`.
    pub fn at(at: DateTime<Utc>) -> Self {
        Trigger::PointInTime(PointInTimeTrigger {
            fire_at: at,
            fired: false,
        })
    }

    /// Fire at `start`, then `repeat_count` more times every `period` of `unit`.
    pub fn simple(start: DateTime<Utc>, period: i64, unit: TimeUnit, repeat_count: i32) -> Self {
        Trigger::SimpleTimer(SimpleTimerTrigger {
            start_time: start,
            period,
            period_unit: unit,
            repeat_count,
            end_time: None,
            zone_id: None,
            next_fire_time: None,
            current_repeat_count: 0,
            end_time_reached: false,
        })
    }

    /// Fire every `period_ms` starting at `start`, `repeat_limit` times (negative: forever).
    pub fn interval(start: DateTime<Utc>, period_ms: i64, repeat_limit: i32) -> Self {
        Trigger::Interval(IntervalTrigger {
            start_time: start,
            end_time: None,
            repeat_limit,
            repeat_count: 0,
            period: period_ms,
            next_fire_time: None,
        })
    }

    /// The pending fire time, or `None` when the trigger is exhausted.
    pub fn has_next_fire_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Trigger::PointInTime(t) => (!t.fired).then_some(t.fire_at),
            Trigger::SimpleTimer(t) => {
                if t.end_time_reached || t.current_repeat_count > t.repeat_count {
                    return None;
                }
                let next = t.next_fire_time.unwrap_or(t.start_time);
                not_past(next, t.end_time)
            }
            Trigger::Interval(t) => {
                if t.repeat_limit >= 0 && t.repeat_count >= t.repeat_limit {
                    return None;
                }
                let next = t.next_fire_time.unwrap_or(t.start_time);
                not_past(next, t.end_time)
            }
        }
    }

    /// Consume the pending fire and compute the following one.
    ///
    /// Returns the advanced trigger and its next fire time; `None` means the
    /// trigger is terminal and the job must not be rescheduled. Advancing a
    /// terminal trigger leaves it unchanged.
    pub fn advance(mut self) -> (Self, Option<DateTime<Utc>>) {
        let next = self.advance_in_place();
        (self, next)
    }

    fn advance_in_place(&mut self) -> Option<DateTime<Utc>> {
        let current = self.has_next_fire_time()?;
        match self {
            Trigger::PointInTime(t) => {
                t.fired = true;
                None
            }
            Trigger::SimpleTimer(t) => {
                t.current_repeat_count += 1;
                if t.current_repeat_count > t.repeat_count {
                    return None;
                }
                let Some(next) = t
                    .period_unit
                    .delta(t.period)
                    .and_then(|period| current.checked_add_signed(period))
                else {
                    t.end_time_reached = true;
                    return None;
                };
                t.next_fire_time = Some(next);
                if t.end_time.is_some_and(|end| next > end) {
                    t.end_time_reached = true;
                    return None;
                }
                Some(next)
            }
            Trigger::Interval(t) => {
                t.repeat_count += 1;
                if t.repeat_limit >= 0 && t.repeat_count >= t.repeat_limit {
                    return None;
                }
                let next = TimeDelta::try_milliseconds(t.period)
                    .and_then(|period| current.checked_add_signed(period))?;
                t.next_fire_time = Some(next);
                not_past(next, t.end_time)
            }
        }
    }

    /// Fires left after the one about to be dispatched; `-1` when unbounded.
    ///
    /// Read before the post-dispatch record is persisted, so the current fire
    /// is not yet counted. `SimpleTimer` counts repeats on top of the first
    /// fire while `Interval` limits total fires, hence the different formulas
    /// yielding the same meaning.
    pub fn remaining_repeats(&self) -> i64 {
        match self {
            Trigger::PointInTime(_) => 0,
            Trigger::SimpleTimer(t) => i64::from(t.repeat_count) - i64::from(t.current_repeat_count),
            Trigger::Interval(t) if t.repeat_limit < 0 => -1,
            Trigger::Interval(t) => {
                i64::from(t.repeat_limit) - i64::from(t.repeat_count) - 1
            }
        }
    }

    /// Append every rule this trigger breaks to `errors`.
    pub fn validate(&self, errors: &mut Vec<String>) {
        match self {
            Trigger::PointInTime(_) => {}
            Trigger::SimpleTimer(t) => {
                if t.repeat_count < 0 {
                    errors.push("trigger.repeatCount must not be negative".to_string());
                }
                if t.current_repeat_count < 0 {
                    errors.push("trigger.currentRepeatCount must not be negative".to_string());
                }
                if t.period < 0 {
                    errors.push("trigger.period must not be negative".to_string());
                } else if t.period == 0 && t.repeat_count > 0 {
                    errors.push("trigger.period must be positive when repeating".to_string());
                }
            }
            Trigger::Interval(t) => {
                if t.repeat_count < 0 {
                    errors.push("trigger.repeatCount must not be negative".to_string());
                }
                if t.period < 0 {
                    errors.push("trigger.period must not be negative".to_string());
                } else if t.period == 0 && (t.repeat_limit < 0 || t.repeat_limit > 1) {
                    errors.push("trigger.period must be positive when repeating".to_string());
                }
            }
        }
        if let Some(end) = self.end_time() {
            if end < self.start_time() {
                errors.push("trigger.endTime must not precede the start time".to_string());
            }
        }
    }

    fn start_time(&self) -> DateTime<Utc> {
        match self {
            Trigger::PointInTime(t) => t.fire_at,
            Trigger::SimpleTimer(t) => t.start_time,
            Trigger::Interval(t) => t.start_time,
        }
    }

    fn end_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Trigger::PointInTime(_) => None,
            Trigger::SimpleTimer(t) => t.end_time,
            Trigger::Interval(t) => t.end_time,
        }
    }
}

fn not_past(next: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match end {
        Some(end) if next > end => None,
        _ => Some(next),
    }
}
