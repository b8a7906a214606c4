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

//! The execution pipeline: one claimed row, end to end.
//!
//! A background heartbeat task keeps the lease alive for the duration. If a
//! heartbeat ever reports the lease lost — another worker recovered and
//! reclaimed the row — the pipeline aborts without publishing or mutating;
//! the new holder is authoritative.
//!
//! The publish happens before the finalize, so a crash between the two
//! yields a duplicate publish on recovery. That is the at-least-once
//! contract; consumers are expected to deduplicate.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::WorkerContext;
use crate::error::{PublishError, StoreError};
use crate::models::{ScheduledTask, TaskData};

enum Outcome {
    /// One-shot (or exhausted) schedule delivered; row deleted.
    Completed,
    /// Recurring schedule delivered; row moved to its next fire.
    Rescheduled(DateTime<Utc>),
    /// Publish failed; row released with a backoff execution time.
    Backoff(DateTime<Utc>),
    /// Stored data no longer decodes; row flagged unreclaimable.
    Poisoned,
    /// Lease lost mid-flight; nothing mutated by this worker.
    Aborted,
}

/// Executes one claimed task. Never panics outward; every path finishes the
/// row or deliberately leaves it to lease recovery.
pub(crate) async fn execute(ctx: WorkerContext, task: ScheduledTask) {
    let lease_lost = Arc::new(AtomicBool::new(false));
    let heartbeat = spawn_heartbeat(ctx.clone(), &task, Arc::clone(&lease_lost));

    let result = AssertUnwindSafe(run(&ctx, &task, &lease_lost))
        .catch_unwind()
        .await;
    heartbeat.abort();

    // A panic inside a pipeline must not kill the pool: treat it as an
    // execution failure and release the row with a backoff. If the row was
    // already finalized before the panic, the reschedule loses the lease
    // check and stays silent.
    let result = match result {
        Ok(result) => result,
        Err(_) => {
            error!(
                task_instance = %task.task_instance,
                "pipeline panicked; treating as execution failure"
            );
            let backoff = ctx.config.failure_backoff(task.consecutive_failures + 1);
            let next = Utc::now()
                + chrono::Duration::from_std(backoff)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
            ctx.dal
                .scheduled_tasks()
                .reschedule(&task.task_name, &task.task_instance, &ctx.worker_id, next, false)
                .await
                .map(|_| Outcome::Backoff(next))
        }
    };

    match result {
        Ok(Outcome::Completed) => {
            ctx.counters.record_processed();
            debug!(task_instance = %task.task_instance, "task completed");
        }
        Ok(Outcome::Rescheduled(next)) => {
            ctx.counters.record_processed();
            debug!(task_instance = %task.task_instance, next = %next, "task rescheduled");
        }
        Ok(Outcome::Backoff(next)) => {
            ctx.counters.record_failed();
            warn!(task_instance = %task.task_instance, retry_at = %next, "task failed, backing off");
        }
        Ok(Outcome::Poisoned) => {
            ctx.counters.record_failed();
        }
        Ok(Outcome::Aborted) | Err(StoreError::LeaseLost { .. }) => {
            // Another worker owns the row now; stay silent.
            debug!(task_instance = %task.task_instance, "lease lost, aborting");
        }
        Err(e) => {
            ctx.counters.record_failed();
            error!(task_instance = %task.task_instance, "pipeline store failure: {}", e);
        }
    }
}

async fn run(
    ctx: &WorkerContext,
    task: &ScheduledTask,
    lease_lost: &AtomicBool,
) -> Result<Outcome, StoreError> {
    let store = ctx.dal.scheduled_tasks();

    let data = match decode(task) {
        Ok(data) => data,
        Err(reason) => {
            error!(
                task_instance = %task.task_instance,
                "stored task data is permanently undecodable: {}", reason
            );
            store
                .mark_poisoned(&task.task_name, &task.task_instance, &ctx.worker_id)
                .await?;
            return Ok(Outcome::Poisoned);
        }
    };

    if lease_lost.load(Ordering::SeqCst) {
        return Ok(Outcome::Aborted);
    }

    let publish_result = match tokio::time::timeout(
        ctx.config.publish_timeout(),
        ctx.publisher
            .publish(&data.target_topic, &data.payload, &data.attributes),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(PublishError::Timeout),
    };

    if lease_lost.load(Ordering::SeqCst) {
        return Ok(Outcome::Aborted);
    }

    let now = Utc::now();
    match publish_result {
        Ok(message_id) => {
            debug!(
                task_instance = %task.task_instance,
                topic = %data.target_topic,
                message_id = %message_id,
                "payload published"
            );

            match data.schedule.next_after(now) {
                Ok(Some(next)) => {
                    store
                        .reschedule(&task.task_name, &task.task_instance, &ctx.worker_id, next, true)
                        .await?;
                    Ok(Outcome::Rescheduled(next))
                }
                Ok(None) => {
                    store
                        .complete(&task.task_name, &task.task_instance, &ctx.worker_id)
                        .await?;
                    Ok(Outcome::Completed)
                }
                Err(e) => {
                    error!(
                        task_instance = %task.task_instance,
                        "stored schedule descriptor is invalid: {}", e
                    );
                    store
                        .mark_poisoned(&task.task_name, &task.task_instance, &ctx.worker_id)
                        .await?;
                    Ok(Outcome::Poisoned)
                }
            }
        }
        Err(publish_err) => {
            warn!(
                task_instance = %task.task_instance,
                topic = %data.target_topic,
                "publish failed: {}", publish_err
            );

            // A failed recurring task retries at the backoff time, not at
            // its next natural fire; it catches up after a success.
            let backoff = ctx.config.failure_backoff(task.consecutive_failures + 1);
            let next = now
                + chrono::Duration::from_std(backoff)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
            store
                .reschedule(&task.task_name, &task.task_instance, &ctx.worker_id, next, false)
                .await?;
            Ok(Outcome::Backoff(next))
        }
    }
}

fn decode(task: &ScheduledTask) -> Result<TaskData, String> {
    let data = TaskData::decode(&task.data).map_err(|e| e.to_string())?;
    data.schedule.validate().map_err(|e| e.to_string())?;
    Ok(data)
}

/// Keeps the lease warm until aborted. Sets `lease_lost` and exits as soon
/// as the store reports the row reassigned.
fn spawn_heartbeat(
    ctx: WorkerContext,
    task: &ScheduledTask,
    lease_lost: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let task_name = task.task_name.clone();
    let task_instance = task.task_instance.clone();

    tokio::spawn(async move {
        let cadence = ctx.config.lease_heartbeat_interval();
        let mut interval = tokio::time::interval(cadence);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The claim already stamped a fresh heartbeat; skip the immediate
        // first tick.
        interval.tick().await;

        loop {
            interval.tick().await;

            let attempt = tokio::time::timeout(
                cadence / 2,
                ctx.dal
                    .scheduled_tasks()
                    .heartbeat(&task_name, &task_instance, &ctx.worker_id, Utc::now()),
            )
            .await;

            match attempt {
                Ok(Ok(())) => {}
                Ok(Err(StoreError::LeaseLost { .. })) => {
                    warn!(
                        task_instance = %task_instance,
                        "lease stolen by another worker"
                    );
                    lease_lost.store(true, Ordering::SeqCst);
                    break;
                }
                Ok(Err(e)) => {
                    // Transient; the lease survives until the stale
                    // threshold, so keep trying.
                    warn!(task_instance = %task_instance, "heartbeat failed: {}", e);
                }
                Err(_) => {
                    warn!(task_instance = %task_instance, "heartbeat attempt timed out");
                }
            }
        }
    })
}
