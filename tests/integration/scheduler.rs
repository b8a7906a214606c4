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

//! End-to-end scenarios: a real [`Scheduler`] with its polling loop and
//! worker pool against a throwaway database and an in-memory publisher.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use crate::fixtures::{sqlite_database, task_row};
use metronome::broker::MemoryPublisher;
use metronome::config::SchedulerConfig;
use metronome::error::SubmitError;
use metronome::models::PUBLISH_PAYLOAD_TASK;
use metronome::request::ScheduleRequest;
use metronome::runner::Scheduler;

fn fast_config() -> SchedulerConfig {
    SchedulerConfig::builder()
        .polling_interval(Duration::from_millis(100))
        .max_threads(4)
        .lease_timeout(Duration::from_secs(3))
        .shutdown_grace(Duration::from_secs(2))
        .build()
}

fn request(value: serde_json::Value) -> ScheduleRequest {
    serde_json::from_value(value).expect("test request deserializes")
}

/// Polls `condition` until it holds or five seconds pass.
async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if condition().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn one_time_task_publishes_once_and_disappears() {
    let db = sqlite_database().await;
    let publisher = Arc::new(MemoryPublisher::new());
    let scheduler = Scheduler::new(db.database.clone(), publisher.clone(), fast_config());

    let payload = b"{\"order\":42}".to_vec();
    let fire_at = Utc::now() + ChronoDuration::milliseconds(300);
    scheduler
        .registry()
        .submit(request(json!({
            "schedule": { "type": "one-time", "executionTime": fire_at.timestamp_millis() },
            "targetTopic": "orders",
            "payload": {
                "data": BASE64.encode(&payload),
                "attributes": { "origin": "test" }
            }
        })))
        .await
        .unwrap();

    let dal = scheduler.dal();
    assert_eq!(dal.scheduled_tasks().count().await.unwrap(), 1);

    scheduler.start();

    eventually("exactly one publish and an empty table", || {
        let dal = dal.clone();
        let publisher = publisher.clone();
        async move {
            publisher.published().len() == 1 && dal.scheduled_tasks().count().await.unwrap() == 0
        }
    })
    .await;

    let published = publisher.published();
    assert_eq!(published[0].topic, "orders");
    assert_eq!(published[0].payload, payload);
    assert_eq!(
        published[0].attributes.get("origin").map(String::as_str),
        Some("test")
    );

    scheduler.shutdown().await;
    assert_eq!(scheduler.counters().snapshot().processed, 1);
}

#[tokio::test]
async fn duplicate_named_recurring_submission_is_rejected() {
    let db = sqlite_database().await;
    let scheduler = Scheduler::new(
        db.database.clone(),
        Arc::new(MemoryPublisher::new()),
        fast_config(),
    );

    let make_request = || {
        request(json!({
            "schedule": { "type": "daily", "hour": 9, "minute": 0 },
            "targetTopic": "reports",
            "payload": { "data": BASE64.encode(b"report") },
            "taskName": "daily-report"
        }))
    };

    scheduler.registry().submit(make_request()).await.unwrap();

    let err = scheduler.registry().submit(make_request()).await.unwrap_err();
    assert!(matches!(
        err,
        SubmitError::Duplicate { ref task_instance } if task_instance == "daily-report"
    ));

    assert_eq!(scheduler.dal().scheduled_tasks().count().await.unwrap(), 1);
}

#[tokio::test]
async fn failing_publish_backs_off_and_retains_the_row() {
    let db = sqlite_database().await;
    let publisher = Arc::new(MemoryPublisher::new());
    publisher.fail_next(1);

    let scheduler = Scheduler::new(db.database.clone(), publisher.clone(), fast_config());

    let submitted_at = Utc::now();
    let fire_at = submitted_at + ChronoDuration::milliseconds(200);
    scheduler
        .registry()
        .submit(request(json!({
            "schedule": { "type": "one-time", "executionTime": fire_at.timestamp_millis() },
            "targetTopic": "orders",
            "payload": { "data": BASE64.encode(b"doomed") }
        })))
        .await
        .unwrap();

    scheduler.start();

    let dal = scheduler.dal();
    eventually("the failure to be recorded", || {
        let counters = scheduler.counters();
        async move { counters.snapshot().failed == 1 }
    })
    .await;

    scheduler.shutdown().await;

    // Nothing was published and the row survived with a backoff execution
    // time roughly 30 seconds after the failed attempt.
    assert!(publisher.published().is_empty());
    assert_eq!(dal.scheduled_tasks().count().await.unwrap(), 1);

    let claimable_now = dal
        .scheduled_tasks()
        .claim_due(Utc::now(), "probe-2", 1)
        .await
        .unwrap();
    assert!(
        claimable_now.is_empty(),
        "a failed task must not be due again before its backoff"
    );

    let claimable_later = dal
        .scheduled_tasks()
        .claim_due(Utc::now() + ChronoDuration::seconds(35), "probe-3", 1)
        .await
        .unwrap();
    assert_eq!(claimable_later.len(), 1);
    assert_eq!(claimable_later[0].consecutive_failures, 1);
}

#[tokio::test]
async fn recurring_task_moves_to_its_next_fire_after_success() {
    let db = sqlite_database().await;
    let publisher = Arc::new(MemoryPublisher::new());
    let scheduler = Scheduler::new(db.database.clone(), publisher.clone(), fast_config());

    // A past initial execution time means "fire immediately".
    let initial = Utc::now() - ChronoDuration::seconds(5);
    scheduler
        .registry()
        .submit(request(json!({
            "schedule": {
                "type": "fixed-delay",
                "delaySeconds": 3600,
                "initialExecutionTime": initial.timestamp_millis()
            },
            "targetTopic": "heartbeats",
            "payload": { "data": BASE64.encode(b"ping") },
            "taskName": "hourly-ping"
        })))
        .await
        .unwrap();

    scheduler.start();

    eventually("the first fire to publish", || {
        let publisher = publisher.clone();
        async move { publisher.published().len() == 1 }
    })
    .await;

    let dal = scheduler.dal();
    eventually("the row to be released for its next fire", || {
        let dal = dal.clone();
        async move {
            dal.scheduled_tasks()
                .get(PUBLISH_PAYLOAD_TASK, "hourly-ping")
                .await
                .unwrap()
                .map(|row| !row.picked)
                .unwrap_or(false)
        }
    })
    .await;

    scheduler.shutdown().await;

    let row = dal
        .scheduled_tasks()
        .get(PUBLISH_PAYLOAD_TASK, "hourly-ping")
        .await
        .unwrap()
        .unwrap();

    // Exactly one row, pushed roughly one delay into the future, streak
    // clean.
    assert_eq!(dal.scheduled_tasks().count().await.unwrap(), 1);
    assert_eq!(row.consecutive_failures, 0);
    assert!(row.last_success.is_some());
    let next = *row.execution_time.as_datetime();
    assert!(next > Utc::now() + ChronoDuration::minutes(59));
    assert_eq!(publisher.published().len(), 1);
}

#[tokio::test]
async fn undecodable_task_data_is_poisoned_not_retried() {
    let db = sqlite_database().await;
    let publisher = Arc::new(MemoryPublisher::new());
    let scheduler = Scheduler::new(db.database.clone(), publisher.clone(), fast_config());

    let dal = scheduler.dal();
    let mut row = task_row("corrupt", Utc::now() - ChronoDuration::seconds(1));
    row.data = b"definitely not json".to_vec();
    dal.scheduled_tasks().insert(row).await.unwrap();

    scheduler.start();

    eventually("the row to be poisoned", || {
        let dal = dal.clone();
        async move {
            dal.scheduled_tasks()
                .get(PUBLISH_PAYLOAD_TASK, "corrupt")
                .await
                .unwrap()
                .map(|row| row.is_poisoned() && !row.picked)
                .unwrap_or(false)
        }
    })
    .await;

    scheduler.shutdown().await;

    // Never published, never deleted, never claimed again.
    assert!(publisher.published().is_empty());
    assert_eq!(dal.scheduled_tasks().count().await.unwrap(), 1);
    let reclaimed = dal
        .scheduled_tasks()
        .claim_due(Utc::now() + ChronoDuration::hours(1), "probe", 1)
        .await
        .unwrap();
    assert!(reclaimed.is_empty());
}
