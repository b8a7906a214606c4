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

//! The wire shape of schedule requests.
//!
//! Both ingress adapters — the HTTP endpoint and the broker subscription —
//! accept the same JSON document and funnel it into
//! [`TaskRegistry::submit`](crate::registry::TaskRegistry::submit):
//!
//! ```json
//! {
//!   "schedule": { "type": "daily", "hour": 9, "minute": 0 },
//!   "targetTopic": "reports",
//!   "payload": { "data": "eyJvayI6dHJ1ZX0=", "attributes": { "k": "v" } },
//!   "taskName": "daily-report"
//! }
//! ```
//!
//! A legacy flat shape carrying a top-level `executionTime` instead of a
//! `schedule` object is still accepted and treated as one-time. Instants on
//! the wire are epoch milliseconds.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use schemars::JsonSchema;
use serde::Deserialize;

use crate::error::ValidationError;
use crate::models::{validate_topic, TaskData};
use crate::schedule::Schedule;

/// A schedule request as received from either ingress adapter.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    /// The schedule descriptor. Absent in the legacy flat shape.
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
    /// Destination topic: simple name or `projects/<p>/topics/<t>`.
    pub target_topic: String,
    /// The message to republish when the schedule fires.
    pub payload: RequestPayload,
    /// Stable name for recurring tasks; enables dedup on resubmission.
    #[serde(default)]
    pub task_name: Option<String>,
    /// Legacy flat shape: one-time fire instant in epoch milliseconds.
    #[serde(default)]
    pub execution_time: Option<i64>,
}

/// The `schedule` object of the canonical request shape.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ScheduleSpec {
    #[serde(rename_all = "camelCase")]
    OneTime { execution_time: i64 },
    #[serde(rename_all = "camelCase")]
    Cron {
        expression: String,
        #[serde(default)]
        zone: Option<String>,
        #[serde(default)]
        initial_execution_time: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    FixedDelay {
        delay_seconds: i64,
        #[serde(default)]
        initial_execution_time: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    Daily {
        hour: u32,
        minute: u32,
        #[serde(default)]
        zone: Option<String>,
        #[serde(default)]
        initial_execution_time: Option<i64>,
    },
}

/// The message payload: base64 bytes plus optional string attributes.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RequestPayload {
    pub data: String,
    #[serde(default)]
    pub attributes: Option<BTreeMap<String, String>>,
}

/// A request that passed validation, ready for the registry.
#[derive(Debug, Clone)]
pub struct ResolvedRequest {
    pub schedule: Schedule,
    /// Caller-requested first fire; `None` means the registry derives it.
    pub initial_execution_time: Option<DateTime<Utc>>,
    pub task_name: Option<String>,
    pub data: TaskData,
}

impl ScheduleRequest {
    /// Validates the request against `now` and resolves it into the domain
    /// types. One-time fire instants must be in the future; recurring
    /// initial instants may be in the past (fire immediately).
    pub fn resolve(self, now: DateTime<Utc>) -> Result<ResolvedRequest, ValidationError> {
        validate_topic(&self.target_topic)?;

        let payload = BASE64
            .decode(self.payload.data.as_bytes())
            .map_err(|e| ValidationError::InvalidPayload(e.to_string()))?;
        if payload.is_empty() {
            return Err(ValidationError::InvalidPayload(
                "decoded payload is empty".to_string(),
            ));
        }

        let spec = match (self.schedule, self.execution_time) {
            (Some(spec), _) => spec,
            (None, Some(execution_time)) => ScheduleSpec::OneTime { execution_time },
            (None, None) => {
                return Err(ValidationError::MalformedRequest(
                    "request carries neither a schedule nor an executionTime".to_string(),
                ))
            }
        };

        let (schedule, initial_execution_time) = match spec {
            ScheduleSpec::OneTime { execution_time } => {
                let fire_at = from_epoch_millis(execution_time)?;
                if fire_at <= now {
                    return Err(ValidationError::PastExecutionTime(fire_at));
                }
                (Schedule::one_time(fire_at), Some(fire_at))
            }
            ScheduleSpec::Cron {
                expression,
                zone,
                initial_execution_time,
            } => (
                Schedule::cron(expression, parse_zone(zone)?)?,
                initial_execution_time.map(from_epoch_millis).transpose()?,
            ),
            ScheduleSpec::FixedDelay {
                delay_seconds,
                initial_execution_time,
            } => (
                Schedule::fixed_delay(delay_seconds)?,
                initial_execution_time.map(from_epoch_millis).transpose()?,
            ),
            ScheduleSpec::Daily {
                hour,
                minute,
                zone,
                initial_execution_time,
            } => (
                Schedule::daily(hour, minute, parse_zone(zone)?)?,
                initial_execution_time.map(from_epoch_millis).transpose()?,
            ),
        };

        let data = TaskData {
            target_topic: self.target_topic,
            payload,
            attributes: self.payload.attributes.unwrap_or_default(),
            schedule: schedule.clone(),
        };

        Ok(ResolvedRequest {
            schedule,
            initial_execution_time,
            task_name: self.task_name,
            data,
        })
    }
}

fn from_epoch_millis(millis: i64) -> Result<DateTime<Utc>, ValidationError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or(ValidationError::InvalidTimestamp(millis))
}

fn parse_zone(zone: Option<String>) -> Result<Tz, ValidationError> {
    match zone {
        None => Ok(Tz::UTC),
        Some(name) => name
            .parse::<Tz>()
            .map_err(|_| ValidationError::UnknownTimezone(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap()
    }

    fn payload_b64() -> String {
        BASE64.encode(b"{\"hello\":\"world\"}")
    }

    #[test]
    fn canonical_one_time_request_resolves() {
        let fire_at = now() + Duration::minutes(5);
        let json = format!(
            r#"{{
                "schedule": {{ "type": "one-time", "executionTime": {} }},
                "targetTopic": "orders",
                "payload": {{ "data": "{}" }}
            }}"#,
            fire_at.timestamp_millis(),
            payload_b64()
        );

        let request: ScheduleRequest = serde_json::from_str(&json).unwrap();
        let resolved = request.resolve(now()).unwrap();

        assert_eq!(resolved.schedule, Schedule::one_time(fire_at));
        assert_eq!(resolved.initial_execution_time, Some(fire_at));
        assert_eq!(resolved.task_name, None);
        assert_eq!(resolved.data.payload, b"{\"hello\":\"world\"}");
    }

    #[test]
    fn legacy_flat_shape_is_one_time() {
        let fire_at = now() + Duration::seconds(30);
        let json = format!(
            r#"{{
                "executionTime": {},
                "targetTopic": "orders",
                "payload": {{ "data": "{}" }}
            }}"#,
            fire_at.timestamp_millis(),
            payload_b64()
        );

        let request: ScheduleRequest = serde_json::from_str(&json).unwrap();
        let resolved = request.resolve(now()).unwrap();

        assert_eq!(resolved.schedule, Schedule::one_time(fire_at));
    }

    #[test]
    fn named_daily_request_resolves() {
        let json = format!(
            r#"{{
                "schedule": {{ "type": "daily", "hour": 9, "minute": 0 }},
                "targetTopic": "reports",
                "payload": {{ "data": "{}", "attributes": {{ "team": "billing" }} }},
                "taskName": "daily-report"
            }}"#,
            payload_b64()
        );

        let request: ScheduleRequest = serde_json::from_str(&json).unwrap();
        let resolved = request.resolve(now()).unwrap();

        assert_eq!(resolved.schedule, Schedule::daily(9, 0, Tz::UTC).unwrap());
        assert_eq!(resolved.task_name.as_deref(), Some("daily-report"));
        assert_eq!(
            resolved.data.attributes.get("team").map(String::as_str),
            Some("billing")
        );
        assert_eq!(resolved.initial_execution_time, None);
    }

    #[test]
    fn cron_request_accepts_zone_and_initial_time() {
        let initial = now() - Duration::hours(1); // past is allowed for recurring
        let json = format!(
            r#"{{
                "schedule": {{
                    "type": "cron",
                    "expression": "0 6 * * *",
                    "zone": "Europe/Berlin",
                    "initialExecutionTime": {}
                }},
                "targetTopic": "projects/acme/topics/digest",
                "payload": {{ "data": "{}" }}
            }}"#,
            initial.timestamp_millis(),
            payload_b64()
        );

        let request: ScheduleRequest = serde_json::from_str(&json).unwrap();
        let resolved = request.resolve(now()).unwrap();

        assert_eq!(
            resolved.schedule,
            Schedule::cron("0 6 * * *", Tz::Europe__Berlin).unwrap()
        );
        assert_eq!(resolved.initial_execution_time, Some(initial));
    }

    #[test]
    fn past_one_time_is_rejected() {
        let fire_at = now() - Duration::seconds(1);
        let json = format!(
            r#"{{
                "schedule": {{ "type": "one-time", "executionTime": {} }},
                "targetTopic": "orders",
                "payload": {{ "data": "{}" }}
            }}"#,
            fire_at.timestamp_millis(),
            payload_b64()
        );

        let request: ScheduleRequest = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            request.resolve(now()),
            Err(ValidationError::PastExecutionTime(_))
        ));
    }

    #[test]
    fn bad_topic_is_rejected() {
        let json = format!(
            r#"{{
                "executionTime": {},
                "targetTopic": "not a topic!",
                "payload": {{ "data": "{}" }}
            }}"#,
            (now() + Duration::minutes(1)).timestamp_millis(),
            payload_b64()
        );

        let request: ScheduleRequest = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            request.resolve(now()),
            Err(ValidationError::InvalidTopic(_))
        ));
    }

    #[test]
    fn empty_and_invalid_payloads_are_rejected() {
        for data in ["", "!!!not-base64!!!"] {
            let json = format!(
                r#"{{
                    "executionTime": {},
                    "targetTopic": "orders",
                    "payload": {{ "data": "{}" }}
                }}"#,
                (now() + Duration::minutes(1)).timestamp_millis(),
                data
            );

            let request: ScheduleRequest = serde_json::from_str(&json).unwrap();
            assert!(matches!(
                request.resolve(now()),
                Err(ValidationError::InvalidPayload(_))
            ));
        }
    }

    #[test]
    fn unknown_zone_is_rejected() {
        let json = format!(
            r#"{{
                "schedule": {{ "type": "daily", "hour": 7, "minute": 30, "zone": "Mars/Olympus" }},
                "targetTopic": "orders",
                "payload": {{ "data": "{}" }}
            }}"#,
            payload_b64()
        );

        let request: ScheduleRequest = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            request.resolve(now()),
            Err(ValidationError::UnknownTimezone(_))
        ));
    }

    #[test]
    fn request_without_schedule_or_time_is_rejected() {
        let json = format!(
            r#"{{ "targetTopic": "orders", "payload": {{ "data": "{}" }} }}"#,
            payload_b64()
        );

        let request: ScheduleRequest = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            request.resolve(now()),
            Err(ValidationError::MalformedRequest(_))
        ));
    }
}
