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

//! The per-worker polling loop.
//!
//! Every tick: recover stale leases, check worker-pool capacity, claim up to
//! `min(batch_size, idle)` due rows, and hand each to a pipeline task
//! without blocking the loop. When the pool is saturated the tick claims
//! nothing — unclaimed rows stay `picked = false` and are picked up on a
//! later tick, which is the system's flow control.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{pipeline, WorkerContext};
use crate::error::{SchedulerError, StoreError};

const MAX_STORE_ATTEMPTS: u32 = 3;

/// Runs the polling loop until the stop signal fires.
pub(crate) async fn run(ctx: WorkerContext) {
    let mut interval = tokio::time::interval(ctx.config.polling_interval());
    // Overlap guard: a slow tick must not cause a burst of catch-up ticks.
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(worker_id = %ctx.worker_id, "polling loop started");

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        if let Err(e) = tick(&ctx).await {
            error!("polling tick failed: {}", e);
        }
    }

    info!(worker_id = %ctx.worker_id, "polling loop stopped");
}

async fn tick(ctx: &WorkerContext) -> Result<(), SchedulerError> {
    let now = Utc::now();
    let store = ctx.dal.scheduled_tasks();

    let released = with_retries(|| store.recover_leases(now, ctx.config.lease_timeout())).await?;
    if released > 0 {
        warn!(released, "released stale leases");
    }

    let idle = ctx.semaphore.available_permits();
    if idle == 0 {
        debug!("worker pool saturated, skipping claim");
        return Ok(());
    }

    let batch = ctx.config.batch_size().min(idle);
    let claimed = with_retries(|| store.claim_due(now, &ctx.worker_id, batch)).await?;
    if claimed.is_empty() {
        return Ok(());
    }
    debug!(count = claimed.len(), "claimed due tasks");

    for task in claimed {
        // Cannot block: the batch never exceeds the idle permits observed
        // above, and only pipelines release permits.
        let permit = match ctx.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let task_ctx = ctx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            pipeline::execute(task_ctx, task).await;
        });
    }

    Ok(())
}

/// Retries a transient-failing store operation with jitter, up to three
/// attempts; anything non-transient propagates immediately.
pub(crate) async fn with_retries<T, F, Fut>(mut operation: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < MAX_STORE_ATTEMPTS => {
                let jitter = rand::thread_rng().gen_range(50..250);
                warn!(attempt, "transient store error, retrying: {}", e);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
