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

//! The scheduler runner: a scoped instance owning the connection pool, the
//! broker publish client, the bounded worker pool, and the polling loop.
//!
//! Multiple processes may run a [`Scheduler`] against the same database;
//! they coordinate exclusively through the task store's atomic operations.
//! Each instance identifies itself with a unique worker id used for leases.
//!
//! # Lifecycle
//!
//! ```rust,ignore
//! let scheduler = Scheduler::new(database, publisher, config);
//! scheduler.start();
//! // ... serve ingress, wait for a shutdown signal ...
//! scheduler.shutdown().await;
//! ```
//!
//! Shutdown stops the polling loop from claiming new work, waits a bounded
//! grace period for in-flight pipelines, and leaves anything unfinished to
//! become a stale-lease candidate for the next worker — preserving
//! at-least-once delivery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::Publisher;
use crate::config::SchedulerConfig;
use crate::dal::DAL;
use crate::database::Database;
use crate::registry::TaskRegistry;

mod pipeline;
mod poller;

/// Shared in-memory counters surfaced by the health endpoint.
#[derive(Debug, Default)]
pub struct Counters {
    received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
}

impl Counters {
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Everything a polling tick or a pipeline needs, cheap to clone.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub dal: DAL,
    pub publisher: Arc<dyn Publisher>,
    pub config: SchedulerConfig,
    pub worker_id: String,
    pub counters: Arc<Counters>,
    pub cancel: CancellationToken,
    pub semaphore: Arc<Semaphore>,
}

/// A scheduler instance: one polling loop plus one bounded worker pool.
pub struct Scheduler {
    context: WorkerContext,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Creates a scheduler over an existing database pool and publisher.
    /// Nothing runs until [`Scheduler::start`].
    pub fn new(database: Database, publisher: Arc<dyn Publisher>, config: SchedulerConfig) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
        let worker_id = format!("{}-{}", host, Uuid::new_v4());
        let semaphore = Arc::new(Semaphore::new(config.max_threads()));

        Self {
            context: WorkerContext {
                dal: DAL::new(database),
                publisher,
                config,
                worker_id,
                counters: Arc::new(Counters::default()),
                cancel: CancellationToken::new(),
                semaphore,
            },
            poller: Mutex::new(None),
        }
    }

    /// This instance's lease identity.
    pub fn worker_id(&self) -> &str {
        &self.context.worker_id
    }

    /// The DAL backing this instance.
    pub fn dal(&self) -> DAL {
        self.context.dal.clone()
    }

    /// A registry submitting into this instance's store.
    pub fn registry(&self) -> TaskRegistry {
        TaskRegistry::new(self.context.dal.clone())
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.context.counters)
    }

    /// Stop signal shared with the ingress adapters, so one shutdown stops
    /// everything.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.context.cancel.clone()
    }

    /// Spawns the polling loop. Idempotent.
    pub fn start(&self) {
        let mut guard = self.poller.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return;
        }

        info!(worker_id = %self.context.worker_id, "starting scheduler");
        let context = self.context.clone();
        *guard = Some(tokio::spawn(poller::run(context)));
    }

    /// Graceful shutdown: stop claiming, drain in-flight pipelines within
    /// the configured grace period, then return. Unfinished rows are
    /// reclaimed by other workers once their leases go stale.
    pub async fn shutdown(&self) {
        self.context.cancel.cancel();

        let handle = self
            .poller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let max = self.context.config.max_threads() as u32;
        match tokio::time::timeout(
            self.context.config.shutdown_grace(),
            self.context.semaphore.acquire_many(max),
        )
        .await
        {
            Ok(Ok(_permits)) => info!("all pipelines drained"),
            Ok(Err(_)) => {}
            Err(_) => warn!(
                "shutdown grace expired with pipelines still running; \
                 their leases will expire and another worker will pick them up"
            ),
        }
    }
}
