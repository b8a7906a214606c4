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

//! Concurrency tests for task claiming.
//!
//! These verify that concurrent workers never claim the same row: the
//! exactly-one-worker-per-row property everything else rests on.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::Barrier;

use crate::fixtures::{sqlite_database, task_row};
use metronome::dal::DAL;

#[tokio::test]
async fn concurrent_claiming_produces_no_duplicates() {
    let db = sqlite_database().await;
    let dal = DAL::new(db.database.clone());
    let store = dal.scheduled_tasks();
    let now = Utc::now();

    const NUM_TASKS: usize = 20;
    for i in 0..NUM_TASKS {
        store
            .insert(task_row(&format!("concurrent-{}", i), now - Duration::seconds(1)))
            .await
            .unwrap();
    }

    const NUM_WORKERS: usize = 8;
    let barrier = Arc::new(Barrier::new(NUM_WORKERS));
    let mut handles = Vec::new();

    for worker in 0..NUM_WORKERS {
        let database = db.database.clone();
        let barrier = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            let dal = DAL::new(database);
            let worker_id = format!("worker-{}", worker);

            // All workers start claiming at the same instant.
            barrier.wait().await;

            let mut claimed = Vec::new();
            for _ in 0..5 {
                let batch = dal
                    .scheduled_tasks()
                    .claim_due(now, &worker_id, 2)
                    .await
                    .expect("claim should not error");
                for task in batch {
                    claimed.push(task.task_instance);
                }
            }
            claimed
        }));
    }

    let mut all_claimed = Vec::new();
    for handle in handles {
        all_claimed.extend(handle.await.expect("worker task panicked"));
    }

    let unique: HashSet<&String> = all_claimed.iter().collect();
    assert_eq!(
        unique.len(),
        all_claimed.len(),
        "a task was claimed by more than one worker: {:?}",
        all_claimed
    );
    assert_eq!(unique.len(), NUM_TASKS, "every due task should be claimed");
}
