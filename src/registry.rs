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

//! Task registry: turns validated schedule requests into persisted rows.
//!
//! There is a single task kind, `publish-payload`; the schedule descriptor
//! travels inside each row's data envelope, so the registry needs no mutable
//! per-request state. Named recurring requests reuse the caller's name as
//! the task instance, which makes resubmission collide on the primary key —
//! that collision is the dedup contract, surfaced as
//! [`SubmitError::Duplicate`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::dal::DAL;
use crate::error::{SubmitError, ValidationError};
use crate::models::{NewScheduledTask, PUBLISH_PAYLOAD_TASK};
use crate::request::ScheduleRequest;

/// Resolves schedule requests into task rows.
#[derive(Clone)]
pub struct TaskRegistry {
    dal: DAL,
}

/// What the caller gets back from a successful submit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub task_name: String,
    pub task_instance: String,
    pub execution_time: DateTime<Utc>,
}

impl TaskRegistry {
    pub fn new(dal: DAL) -> Self {
        Self { dal }
    }

    /// Validates `request`, computes its first fire, and inserts the task
    /// row.
    ///
    /// The first fire is the caller-provided initial time when present (a
    /// past instant means "fire immediately"); otherwise a one-time task
    /// fires at its requested instant and a recurring task at its next
    /// natural fire from now.
    pub async fn submit(&self, request: ScheduleRequest) -> Result<SubmitReceipt, SubmitError> {
        let now = Utc::now();
        let resolved = request.resolve(now)?;

        let execution_time = match resolved.initial_execution_time {
            Some(instant) => instant,
            None => resolved
                .schedule
                .next_after(now)
                .map_err(SubmitError::Validation)?
                .ok_or_else(|| {
                    SubmitError::Validation(ValidationError::MalformedRequest(
                        "schedule yields no future fire".to_string(),
                    ))
                })?,
        };

        let task_instance = resolved
            .task_name
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let data = resolved.data.encode()?;

        self.dal
            .scheduled_tasks()
            .insert(NewScheduledTask {
                task_name: PUBLISH_PAYLOAD_TASK.to_string(),
                task_instance: task_instance.clone(),
                execution_time: execution_time.into(),
                data,
            })
            .await?;

        info!(
            task_instance = %task_instance,
            execution_time = %execution_time,
            topic = %resolved.data.target_topic,
            "scheduled task accepted"
        );

        Ok(SubmitReceipt {
            task_name: PUBLISH_PAYLOAD_TASK.to_string(),
            task_instance,
            execution_time,
        })
    }
}
