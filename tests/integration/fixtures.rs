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

//! Shared test fixtures: a throwaway SQLite database bootstrapped from the
//! shipped migration SQL, plus row factories.

use chrono::{DateTime, Utc};
use diesel::connection::SimpleConnection;
use tempfile::TempDir;

use metronome::database::Database;
use metronome::models::{NewScheduledTask, TaskData, PUBLISH_PAYLOAD_TASK};
use metronome::schedule::Schedule;

/// A pooled database over a temp file; dropping this removes the file.
pub struct TestDatabase {
    pub database: Database,
    _dir: TempDir,
}

/// Creates and bootstraps a fresh SQLite database.
pub async fn sqlite_database() -> TestDatabase {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("metronome.db");
    let database = Database::new(path.to_str().expect("utf8 temp path"), "", 1);

    let conn = database
        .get_sqlite_connection()
        .await
        .expect("failed to get connection");
    conn.interact(|conn| {
        conn.batch_execute(include_str!(
            "../../migrations/sqlite/scheduled_tasks.sql"
        ))
    })
    .await
    .expect("interact failed")
    .expect("bootstrap DDL failed");

    TestDatabase {
        database,
        _dir: dir,
    }
}

/// A one-shot publish-payload row due at `execution_time`.
pub fn task_row(instance: &str, execution_time: DateTime<Utc>) -> NewScheduledTask {
    let data = TaskData {
        target_topic: "orders".to_string(),
        payload: b"{\"fixture\":true}".to_vec(),
        attributes: Default::default(),
        schedule: Schedule::one_time(execution_time),
    };

    NewScheduledTask {
        task_name: PUBLISH_PAYLOAD_TASK.to_string(),
        task_instance: instance.to_string(),
        execution_time: execution_time.into(),
        data: data.encode().expect("fixture envelope encodes"),
    }
}
