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

//! Task store semantics: insert/dedup, claiming, leases, rescheduling, and
//! recovery. All instants are passed explicitly, so nothing here sleeps.

use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use crate::fixtures::{sqlite_database, task_row};
use metronome::dal::DAL;
use metronome::database::UniversalTimestamp;
use metronome::error::StoreError;
use metronome::models::PUBLISH_PAYLOAD_TASK;

const WORKER_A: &str = "worker-a";
const WORKER_B: &str = "worker-b";

#[tokio::test]
async fn insert_is_deduplicated_on_the_primary_key() {
    let db = sqlite_database().await;
    let dal = DAL::new(db.database.clone());
    let store = dal.scheduled_tasks();
    let now = Utc::now();

    store.insert(task_row("daily-report", now)).await.unwrap();

    let err = store.insert(task_row("daily-report", now)).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::DuplicateInstance { ref task_instance, .. } if task_instance == "daily-report"
    ));

    assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn claim_due_takes_earliest_rows_and_leases_them() {
    let db = sqlite_database().await;
    let dal = DAL::new(db.database.clone());
    let store = dal.scheduled_tasks();
    let now = Utc::now();

    store
        .insert(task_row("late", now - Duration::seconds(2)))
        .await
        .unwrap();
    store
        .insert(task_row("early", now - Duration::seconds(10)))
        .await
        .unwrap();
    store
        .insert(task_row("future", now + Duration::hours(1)))
        .await
        .unwrap();

    let claimed = store.claim_due(now, WORKER_A, 2).await.unwrap();

    let instances: Vec<&str> = claimed.iter().map(|t| t.task_instance.as_str()).collect();
    assert_eq!(instances, vec!["early", "late"]);

    for task in &claimed {
        assert!(task.picked);
        assert_eq!(task.picked_by.as_deref(), Some(WORKER_A));
        assert!(task.last_heartbeat.is_some());
        assert_eq!(task.version, 1);
    }

    // Nothing else is due: the remaining row fires in an hour.
    let rest = store.claim_due(now, WORKER_B, 10).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn claimed_rows_are_invisible_to_other_workers() {
    let db = sqlite_database().await;
    let dal = DAL::new(db.database.clone());
    let store = dal.scheduled_tasks();
    let now = Utc::now();

    store
        .insert(task_row("contested", now - Duration::seconds(1)))
        .await
        .unwrap();

    let first = store.claim_due(now, WORKER_A, 10).await.unwrap();
    assert_eq!(first.len(), 1);

    let second = store.claim_due(now, WORKER_B, 10).await.unwrap();
    assert!(second.is_empty());
}

#[tokio::test]
async fn heartbeat_requires_the_lease() {
    let db = sqlite_database().await;
    let dal = DAL::new(db.database.clone());
    let store = dal.scheduled_tasks();
    let now = Utc::now();

    store
        .insert(task_row("beating", now - Duration::seconds(1)))
        .await
        .unwrap();
    store.claim_due(now, WORKER_A, 1).await.unwrap();

    let later = now + Duration::seconds(30);
    store
        .heartbeat(PUBLISH_PAYLOAD_TASK, "beating", WORKER_A, later)
        .await
        .unwrap();

    let row = store.get(PUBLISH_PAYLOAD_TASK, "beating").await.unwrap().unwrap();
    assert_eq!(row.last_heartbeat, Some(UniversalTimestamp::from(later)));
    assert_eq!(row.version, 2);

    let err = store
        .heartbeat(PUBLISH_PAYLOAD_TASK, "beating", WORKER_B, later)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::LeaseLost { .. }));
}

#[tokio::test]
async fn complete_deletes_only_for_the_lease_holder() {
    let db = sqlite_database().await;
    let dal = DAL::new(db.database.clone());
    let store = dal.scheduled_tasks();
    let now = Utc::now();

    store
        .insert(task_row("finishing", now - Duration::seconds(1)))
        .await
        .unwrap();
    store.claim_due(now, WORKER_A, 1).await.unwrap();

    let err = store
        .complete(PUBLISH_PAYLOAD_TASK, "finishing", WORKER_B)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::LeaseLost { .. }));
    assert_eq!(store.count().await.unwrap(), 1);

    store
        .complete(PUBLISH_PAYLOAD_TASK, "finishing", WORKER_A)
        .await
        .unwrap();
    assert_eq!(store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn reschedule_on_success_resets_the_failure_streak() {
    let db = sqlite_database().await;
    let dal = DAL::new(db.database.clone());
    let store = dal.scheduled_tasks();
    let now = Utc::now();

    store
        .insert(task_row("recurring", now - Duration::seconds(1)))
        .await
        .unwrap();

    // Build up a failure streak first.
    for expected_failures in 1..=3 {
        let claimed = store.claim_due(now, WORKER_A, 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].consecutive_failures, expected_failures - 1);

        // Release due immediately so the next claim sees it again.
        store
            .reschedule(
                PUBLISH_PAYLOAD_TASK,
                "recurring",
                WORKER_A,
                now - Duration::seconds(1),
                false,
            )
            .await
            .unwrap();

        let row = store.get(PUBLISH_PAYLOAD_TASK, "recurring").await.unwrap().unwrap();
        assert_eq!(row.consecutive_failures, expected_failures);
        assert!(!row.picked);
        assert!(row.picked_by.is_none());
        assert!(row.last_failure.is_some());
    }

    // A success wipes the streak and stamps last_success.
    store.claim_due(now, WORKER_A, 1).await.unwrap();
    let next = now + Duration::hours(1);
    store
        .reschedule(PUBLISH_PAYLOAD_TASK, "recurring", WORKER_A, next, true)
        .await
        .unwrap();

    let row = store.get(PUBLISH_PAYLOAD_TASK, "recurring").await.unwrap().unwrap();
    assert_eq!(row.consecutive_failures, 0);
    assert_eq!(row.execution_time, UniversalTimestamp::from(next));
    assert!(row.last_success.is_some());
    assert!(!row.picked);
}

#[tokio::test]
async fn recover_leases_releases_only_stale_rows() {
    let db = sqlite_database().await;
    let dal = DAL::new(db.database.clone());
    let store = dal.scheduled_tasks();
    let now = Utc::now();

    store
        .insert(task_row("stale", now - Duration::seconds(5)))
        .await
        .unwrap();
    store
        .insert(task_row("fresh", now - Duration::seconds(5)))
        .await
        .unwrap();

    store.claim_due(now, WORKER_A, 2).await.unwrap();

    // "fresh" heartbeats 90 seconds in; "stale" never does.
    store
        .heartbeat(PUBLISH_PAYLOAD_TASK, "fresh", WORKER_A, now + Duration::seconds(90))
        .await
        .unwrap();

    // Two minutes later, a 60-second lease timeout has expired for "stale"
    // only.
    let released = store
        .recover_leases(now + Duration::seconds(120), StdDuration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(released, 1);

    let stale = store.get(PUBLISH_PAYLOAD_TASK, "stale").await.unwrap().unwrap();
    assert!(!stale.picked);
    assert!(stale.picked_by.is_none());
    assert!(stale.last_heartbeat.is_none());

    let fresh = store.get(PUBLISH_PAYLOAD_TASK, "fresh").await.unwrap().unwrap();
    assert!(fresh.picked);
    assert_eq!(fresh.picked_by.as_deref(), Some(WORKER_A));

    // The released row is claimable again.
    let reclaimed = store
        .claim_due(now + Duration::seconds(120), WORKER_B, 10)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].task_instance, "stale");

    // Idempotent and cheap when nothing is stale.
    let released = store
        .recover_leases(now + Duration::seconds(121), StdDuration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(released, 0);
}

#[tokio::test]
async fn a_stolen_lease_locks_out_the_original_holder() {
    let db = sqlite_database().await;
    let dal = DAL::new(db.database.clone());
    let store = dal.scheduled_tasks();
    let now = Utc::now();

    store
        .insert(task_row("stolen", now - Duration::seconds(1)))
        .await
        .unwrap();

    // Worker A claims, then goes silent for two lease timeouts.
    store.claim_due(now, WORKER_A, 1).await.unwrap();

    let lease_timeout = StdDuration::from_secs(5);
    let later = now + Duration::seconds(10);
    store.recover_leases(later, lease_timeout).await.unwrap();

    // Worker B picks the row up.
    let reclaimed = store.claim_due(later, WORKER_B, 1).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].picked_by.as_deref(), Some(WORKER_B));

    // Worker A wakes up: every mutation it attempts must fail.
    assert!(matches!(
        store
            .heartbeat(PUBLISH_PAYLOAD_TASK, "stolen", WORKER_A, later)
            .await,
        Err(StoreError::LeaseLost { .. })
    ));
    assert!(matches!(
        store.complete(PUBLISH_PAYLOAD_TASK, "stolen", WORKER_A).await,
        Err(StoreError::LeaseLost { .. })
    ));
    assert!(matches!(
        store
            .reschedule(PUBLISH_PAYLOAD_TASK, "stolen", WORKER_A, later, true)
            .await,
        Err(StoreError::LeaseLost { .. })
    ));

    // Worker B is unaffected.
    store
        .heartbeat(PUBLISH_PAYLOAD_TASK, "stolen", WORKER_B, later)
        .await
        .unwrap();
}

#[tokio::test]
async fn poisoned_rows_are_never_reclaimed() {
    let db = sqlite_database().await;
    let dal = DAL::new(db.database.clone());
    let store = dal.scheduled_tasks();
    let now = Utc::now();

    store
        .insert(task_row("poison", now - Duration::seconds(1)))
        .await
        .unwrap();
    store.claim_due(now, WORKER_A, 1).await.unwrap();
    store
        .mark_poisoned(PUBLISH_PAYLOAD_TASK, "poison", WORKER_A)
        .await
        .unwrap();

    let row = store.get(PUBLISH_PAYLOAD_TASK, "poison").await.unwrap().unwrap();
    assert!(row.is_poisoned());
    assert!(!row.picked);

    // Still present for operators, but invisible to the due-task scan.
    assert_eq!(store.count().await.unwrap(), 1);
    let claimed = store
        .claim_due(now + Duration::hours(24), WORKER_B, 10)
        .await
        .unwrap();
    assert!(claimed.is_empty());
}
