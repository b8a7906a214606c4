/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Recurrence engine: a pure, deterministic mapping from a schedule
//! descriptor and a reference instant to the next fire instant.
//!
//! The schedule descriptor is a closed tagged variant — one-time, cron,
//! fixed-delay, or daily — validated at construction and serialized into the
//! task envelope, so the descriptor persisted with a task row is enough to
//! replay recurrence decisions during recovery without any I/O.
//!
//! Cron expressions are the classic five-field form (minute, hour,
//! day-of-month, month, day-of-week) or a six-field form with a leading
//! seconds field. When both day-of-month and day-of-week are restrictive the
//! two are OR-ed: the engine compiles one variant per restricted field and
//! takes the earliest next fire.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

fn default_zone() -> Tz {
    Tz::UTC
}

/// When future fires of a task occur.
///
/// A closed sum; validation lives on the constructors and in
/// [`Schedule::validate`] for descriptors revived from storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Schedule {
    /// Fires once at `fire_at`, then is exhausted.
    OneTime { fire_at: DateTime<Utc> },
    /// Fires at instants matching a cron expression, evaluated in `zone`.
    Cron {
        expression: String,
        #[serde(default = "default_zone")]
        zone: Tz,
    },
    /// Fires `delay_seconds` after each completed fire.
    FixedDelay { delay_seconds: i64 },
    /// Fires once a day at the given wall-clock time in `zone`.
    Daily {
        hour: u32,
        minute: u32,
        #[serde(default = "default_zone")]
        zone: Tz,
    },
}

impl Schedule {
    /// A schedule that fires exactly once.
    pub fn one_time(fire_at: DateTime<Utc>) -> Self {
        Schedule::OneTime { fire_at }
    }

    /// A cron schedule. Fails if the expression does not parse to a valid
    /// five- or six-field form.
    pub fn cron(expression: impl Into<String>, zone: Tz) -> Result<Self, ValidationError> {
        let expression = expression.into();
        compile_cron(&expression)?;
        Ok(Schedule::Cron { expression, zone })
    }

    /// A fixed-delay schedule. Fails unless the delay is positive.
    pub fn fixed_delay(delay_seconds: i64) -> Result<Self, ValidationError> {
        if delay_seconds <= 0 {
            return Err(ValidationError::NonPositiveDelay(delay_seconds));
        }
        Ok(Schedule::FixedDelay { delay_seconds })
    }

    /// A daily schedule. Fails if hour or minute is out of range.
    pub fn daily(hour: u32, minute: u32, zone: Tz) -> Result<Self, ValidationError> {
        if hour > 23 || minute > 59 {
            return Err(ValidationError::InvalidDaily { hour, minute });
        }
        Ok(Schedule::Daily { hour, minute, zone })
    }

    /// Whether the schedule produces more than one fire.
    pub fn is_recurring(&self) -> bool {
        !matches!(self, Schedule::OneTime { .. })
    }

    /// Re-checks the invariants the constructors enforce.
    ///
    /// Descriptors deserialized from a task row bypass the constructors, so
    /// the ingress path and the execution pipeline both call this before
    /// trusting one.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Schedule::OneTime { .. } => Ok(()),
            Schedule::Cron { expression, .. } => compile_cron(expression).map(|_| ()),
            Schedule::FixedDelay { delay_seconds } => {
                if *delay_seconds <= 0 {
                    Err(ValidationError::NonPositiveDelay(*delay_seconds))
                } else {
                    Ok(())
                }
            }
            Schedule::Daily { hour, minute, .. } => {
                if *hour > 23 || *minute > 59 {
                    Err(ValidationError::InvalidDaily {
                        hour: *hour,
                        minute: *minute,
                    })
                } else {
                    Ok(())
                }
            }
        }
    }

    /// The next fire instant strictly after `after`, or `None` when the
    /// schedule is exhausted.
    ///
    /// Pure and deterministic: calling this with the same inputs always
    /// yields the same result, and successive fires are strictly
    /// monotonically increasing.
    pub fn next_after(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ValidationError> {
        match self {
            Schedule::OneTime { fire_at } => {
                if after < *fire_at {
                    Ok(Some(*fire_at))
                } else {
                    Ok(None)
                }
            }
            Schedule::Cron { expression, zone } => {
                let local = after.with_timezone(zone);
                let mut best: Option<DateTime<Utc>> = None;
                for schedule in compile_cron(expression)? {
                    if let Some(next) = schedule.after(&local).next() {
                        let next = next.with_timezone(&Utc);
                        best = Some(match best {
                            Some(current) if current <= next => current,
                            _ => next,
                        });
                    }
                }
                Ok(best)
            }
            Schedule::FixedDelay { delay_seconds } => {
                Ok(Some(after + Duration::seconds(*delay_seconds)))
            }
            Schedule::Daily { hour, minute, zone } => {
                self.validate()?;
                Ok(next_daily(after, *hour, *minute, zone))
            }
        }
    }
}

/// Next instant strictly after `after` whose wall clock in `zone` reads
/// `(hour, minute, 0)`.
///
/// Spring-forward gaps (the wall time does not exist that day) roll to the
/// next day; ambiguous fall-back times resolve to the earlier offset.
fn next_daily(after: DateTime<Utc>, hour: u32, minute: u32, zone: &Tz) -> Option<DateTime<Utc>> {
    let mut date = after.with_timezone(zone).date_naive();
    // The candidate on `date` may already be past; one extra day covers
    // that, and a DST gap can void at most one further day.
    for _ in 0..4 {
        if let Some(candidate) = resolve_wall_clock(zone, date, hour, minute) {
            if candidate > after {
                return Some(candidate);
            }
        }
        date = date.succ_opt()?;
    }
    None
}

fn resolve_wall_clock(zone: &Tz, date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    match zone.with_ymd_and_hms(date.year(), date.month(), date.day(), hour, minute, 0) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earlier, _) => Some(earlier.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

/// Compiles a five- or six-field cron expression, splitting it into two
/// schedules when both day-of-month and day-of-week are restrictive so the
/// earliest match of either field wins.
fn compile_cron(expression: &str) -> Result<Vec<cron::Schedule>, ValidationError> {
    expression_variants(expression)?
        .iter()
        .map(|variant| {
            cron::Schedule::from_str(variant).map_err(|err| ValidationError::InvalidCron {
                expression: expression.to_string(),
                reason: err.to_string(),
            })
        })
        .collect()
}

fn expression_variants(expression: &str) -> Result<Vec<String>, ValidationError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();

    // Normalized field order: seconds, minute, hour, day-of-month, month,
    // day-of-week. Five-field input is minute-first; six-field input is
    // seconds-first.
    let normalized: Vec<String> = match fields.len() {
        5 => std::iter::once("0")
            .chain(fields.iter().copied())
            .map(str::to_string)
            .collect(),
        6 => fields.iter().map(|f| f.to_string()).collect(),
        n => {
            return Err(ValidationError::InvalidCron {
                expression: expression.to_string(),
                reason: format!("expected 5 or 6 fields, got {}", n),
            })
        }
    };

    let restrictive = |field: &str| field != "*" && field != "?";
    let dom_restrictive = restrictive(&normalized[3]);
    let dow_restrictive = restrictive(&normalized[5]);

    if dom_restrictive && dow_restrictive {
        let mut dom_only = normalized.clone();
        dom_only[5] = "*".to_string();
        let mut dow_only = normalized;
        dow_only[3] = "*".to_string();
        Ok(vec![dom_only.join(" "), dow_only.join(" ")])
    } else {
        Ok(vec![normalized.join(" ")])
    }
}
