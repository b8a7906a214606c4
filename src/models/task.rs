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

//! Domain model for scheduled tasks.
//!
//! [`ScheduledTask`] is the domain view of one `scheduled_tasks` row; the
//! backend-specific Diesel models live in the DAL and convert to/from this
//! type at the boundary. [`TaskData`] is the opaque envelope serialized into
//! the row's `data` column: target topic, payload bytes, attributes, and the
//! schedule descriptor. The envelope is written once at insert and never
//! mutated (only the scheduling and leasing fields of a row change).

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::database::UniversalTimestamp;
use crate::error::ValidationError;
use crate::schedule::Schedule;

/// The single built-in task kind: republish a stored payload to its topic.
pub const PUBLISH_PAYLOAD_TASK: &str = "publish-payload";

/// `consecutive_failures` value marking a row as poisoned. Rows at or above
/// this floor are never selected by the due-task scan; they stay visible for
/// operators to inspect and delete.
pub const POISON_FAILURE_FLOOR: i32 = 1_000_000;

/// One row of the `scheduled_tasks` table.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTask {
    pub task_name: String,
    pub task_instance: String,
    pub execution_time: UniversalTimestamp,
    pub data: Vec<u8>,
    pub picked: bool,
    pub picked_by: Option<String>,
    pub last_heartbeat: Option<UniversalTimestamp>,
    pub last_success: Option<UniversalTimestamp>,
    pub last_failure: Option<UniversalTimestamp>,
    pub consecutive_failures: i32,
    pub version: i32,
}

impl ScheduledTask {
    /// Whether the row has been flagged unreclaimable.
    pub fn is_poisoned(&self) -> bool {
        self.consecutive_failures >= POISON_FAILURE_FLOOR
    }
}

/// A task to be inserted: unleased, zero failures, version zero.
#[derive(Debug, Clone)]
pub struct NewScheduledTask {
    pub task_name: String,
    pub task_instance: String,
    pub execution_time: UniversalTimestamp,
    pub data: Vec<u8>,
}

/// The envelope stored in a row's `data` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskData {
    /// Destination topic: a simple name or a fully-qualified
    /// `projects/<p>/topics/<t>` path.
    pub target_topic: String,
    /// Raw message bytes.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// String attributes forwarded verbatim to the broker.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    /// The recurrence descriptor driving finalize-time rescheduling.
    pub schedule: Schedule,
}

impl TaskData {
    /// Serializes the envelope for the `data` column.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserializes a `data` column back into the envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

static SIMPLE_TOPIC: OnceLock<Regex> = OnceLock::new();
static QUALIFIED_TOPIC: OnceLock<Regex> = OnceLock::new();

/// Validates a destination topic name.
///
/// Accepts a simple name (letter first, 3-255 chars of
/// `[A-Za-z0-9._~+%-]`) or the fully-qualified `projects/<p>/topics/<t>`
/// form.
pub fn validate_topic(topic: &str) -> Result<(), ValidationError> {
    let simple = SIMPLE_TOPIC.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9._~+%-]{2,254}$").expect("static regex")
    });
    let qualified = QUALIFIED_TOPIC
        .get_or_init(|| Regex::new(r"^projects/[^/]+/topics/[^/]+$").expect("static regex"));

    if simple.is_match(topic) || qualified.is_match(topic) {
        Ok(())
    } else {
        Err(ValidationError::InvalidTopic(topic.to_string()))
    }
}
