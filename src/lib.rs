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

//! # Metronome
//!
//! A durable, database-backed message scheduler. Schedule requests arrive
//! over HTTP or a broker subscription; each becomes one row in a single
//! `scheduled_tasks` table; and a fleet of workers — coordinating only
//! through that table — republishes each payload to its target topic at the
//! requested time. Delivery is at-least-once, for one-time and recurring
//! (cron, fixed-delay, daily) schedules, across process crashes.
//!
//! ## Architecture
//!
//! - [`dal`] — the task store: atomic claim / heartbeat / complete /
//!   reschedule / lease-recovery operations over PostgreSQL or SQLite.
//! - [`schedule`] — the recurrence engine: a pure function from a schedule
//!   descriptor and an instant to the next fire.
//! - [`runner`] — the scheduler instance: leased polling loop, bounded
//!   worker pool, and the per-task execution pipeline.
//! - [`registry`] — resolves validated requests into persisted task rows.
//! - [`broker`], [`api`] — the egress publisher and the ingress adapters.
//!
//! Exactly-one-worker-per-row is guaranteed by row-level locking in the
//! store (`FOR UPDATE SKIP LOCKED` on PostgreSQL) plus heartbeat leases;
//! work on a crashed worker is reclaimed once its lease goes stale.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use metronome::broker::LogPublisher;
//! use metronome::config::SchedulerConfig;
//! use metronome::database::Database;
//! use metronome::runner::Scheduler;
//!
//! let database = Database::new("postgres://localhost/metronome", "metronome", 12);
//! let scheduler = Scheduler::new(database, Arc::new(LogPublisher), SchedulerConfig::default());
//! scheduler.start();
//! ```

pub mod api;
pub mod broker;
pub mod cli;
pub mod config;
pub mod dal;
pub mod database;
pub mod error;
pub mod models;
pub mod registry;
pub mod request;
pub mod runner;
pub mod schedule;

pub use config::{SchedulerConfig, ServiceConfig};
pub use database::Database;
pub use error::{PublishError, SchedulerError, StoreError, SubmitError, ValidationError};
pub use registry::TaskRegistry;
pub use request::ScheduleRequest;
pub use runner::Scheduler;
pub use schedule::Schedule;
