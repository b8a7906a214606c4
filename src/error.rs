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

//! Error types for the scheduler.
//!
//! Each layer has its own error enum: [`ValidationError`] for request and
//! schedule validation at ingress, [`StoreError`] for the task store,
//! [`PublishError`] for the broker publish collaborator, [`SubmitError`] for
//! the registry's submit path, and [`SchedulerError`] for the runner.
//!
//! The store distinguishes three outcomes callers react to differently:
//! `DuplicateInstance` (insert collision, returned to the submitter),
//! `LeaseLost` (the row was reassigned to another worker; the holder aborts
//! silently), and transient database failures (retried with jitter before
//! propagating).

use thiserror::Error;

/// Errors raised while validating schedule requests before persistence.
///
/// These are always rejected at ingress and never reach the task store.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The cron expression did not parse to a valid five- or six-field form.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    /// Daily schedule with an out-of-range hour or minute.
    #[error("invalid daily schedule: hour {hour}, minute {minute} out of range")]
    InvalidDaily { hour: u32, minute: u32 },

    /// Fixed-delay schedule with a non-positive delay.
    #[error("fixed-delay schedule requires a positive delay, got {0}s")]
    NonPositiveDelay(i64),

    /// One-time schedule whose execution time is not in the future.
    #[error("execution time {0} is in the past")]
    PastExecutionTime(chrono::DateTime<chrono::Utc>),

    /// Unknown or malformed timezone name.
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),

    /// Topic name matched neither the simple nor the fully-qualified form.
    #[error("invalid topic name '{0}'")]
    InvalidTopic(String),

    /// Payload decoded to zero bytes, or was not valid base64.
    #[error("payload must be non-empty base64: {0}")]
    InvalidPayload(String),

    /// Timestamp outside the representable epoch-millisecond range.
    #[error("timestamp {0} is outside the representable range")]
    InvalidTimestamp(i64),

    /// Anything else structurally wrong with the request.
    #[error("malformed request: {0}")]
    MalformedRequest(String),
}

/// Errors surfaced by the task store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Insert collided with an existing `(task_name, task_instance)` row.
    /// For named recurring tasks this is the dedup signal.
    #[error("task instance already exists: {task_name}/{task_instance}")]
    DuplicateInstance {
        task_name: String,
        task_instance: String,
    },

    /// A lease-checked mutation found the row owned by someone else (or
    /// gone). The caller must abort without publishing or mutating further.
    #[error("lease no longer held on {task_name}/{task_instance}")]
    LeaseLost {
        task_name: String,
        task_instance: String,
    },

    /// Failure obtaining a connection from the pool.
    #[error("connection pool error: {0}")]
    ConnectionPool(String),

    /// Any other database error.
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    /// A persisted row no longer converts to the domain model.
    #[error("stored row is corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the operation may succeed.
    ///
    /// Pool exhaustion, serialization failures, and broken connections are
    /// transient; everything else is not.
    pub fn is_transient(&self) -> bool {
        use diesel::result::DatabaseErrorKind;
        use diesel::result::Error as DieselError;

        match self {
            StoreError::ConnectionPool(_) => true,
            StoreError::Database(DieselError::DatabaseError(kind, _)) => matches!(
                kind,
                DatabaseErrorKind::SerializationFailure
                    | DatabaseErrorKind::ClosedConnection
                    | DatabaseErrorKind::UnableToSendCommand
            ),
            _ => false,
        }
    }
}

/// Errors from the broker publish collaborator.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Transport-level failure (connection refused, DNS, TLS, ...).
    #[error("publish transport error: {0}")]
    Transport(String),

    /// The broker answered with a non-success status.
    #[error("publish rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The publish did not complete within its timeout.
    #[error("publish timed out")]
    Timeout,

    /// The broker's response could not be interpreted.
    #[error("unexpected publish response: {0}")]
    Malformed(String),
}

/// Errors from [`crate::registry::TaskRegistry::submit`].
///
/// Validation failures and duplicates are recovered at ingress and returned
/// to the caller; store failures propagate.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A named recurring task with this name already exists.
    #[error("duplicate schedule '{task_instance}'")]
    Duplicate { task_instance: String },

    #[error(transparent)]
    Store(StoreError),

    /// The task envelope failed to serialize.
    #[error("failed to encode task data: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<StoreError> for SubmitError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateInstance { task_instance, .. } => {
                SubmitError::Duplicate { task_instance }
            }
            other => SubmitError::Store(other),
        }
    }
}

/// Top-level errors from the scheduler runner and its loops.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Errors reading configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),

    #[error("environment variable {var} has invalid value '{value}': {reason}")]
    InvalidVar {
        var: &'static str,
        value: String,
        reason: String,
    },
}
