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

//! Backend-specific Diesel models for the `scheduled_tasks` table.
//!
//! PostgreSQL models use native types (`NaiveDateTime`, `bool`, `Vec<u8>`);
//! SQLite models store timestamps as fixed-width RFC3339 TEXT and booleans
//! as 0/1 integers. Both convert to/from the domain
//! [`ScheduledTask`](crate::models::ScheduledTask) at the DAL boundary; the
//! SQLite conversion is fallible because it parses stored text.

use chrono::NaiveDateTime;
use diesel::prelude::*;

use crate::database::schema::{postgres, sqlite};
use crate::database::{UniversalBool, UniversalTimestamp};
use crate::error::StoreError;
use crate::models::{NewScheduledTask, ScheduledTask};

// ============================================================================
// PostgreSQL models
// ============================================================================

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = postgres::scheduled_tasks)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct PgScheduledTask {
    pub task_name: String,
    pub task_instance: String,
    pub execution_time: NaiveDateTime,
    pub data: Vec<u8>,
    pub picked: bool,
    pub picked_by: Option<String>,
    pub last_heartbeat: Option<NaiveDateTime>,
    pub last_success: Option<NaiveDateTime>,
    pub last_failure: Option<NaiveDateTime>,
    pub consecutive_failures: i32,
    pub version: i32,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = postgres::scheduled_tasks)]
pub struct NewPgScheduledTask {
    pub task_name: String,
    pub task_instance: String,
    pub execution_time: NaiveDateTime,
    pub data: Vec<u8>,
    pub picked: bool,
    pub consecutive_failures: i32,
    pub version: i32,
}

impl From<PgScheduledTask> for ScheduledTask {
    fn from(row: PgScheduledTask) -> Self {
        ScheduledTask {
            task_name: row.task_name,
            task_instance: row.task_instance,
            execution_time: UniversalTimestamp::from_naive(row.execution_time),
            data: row.data,
            picked: row.picked,
            picked_by: row.picked_by,
            last_heartbeat: row.last_heartbeat.map(UniversalTimestamp::from_naive),
            last_success: row.last_success.map(UniversalTimestamp::from_naive),
            last_failure: row.last_failure.map(UniversalTimestamp::from_naive),
            consecutive_failures: row.consecutive_failures,
            version: row.version,
        }
    }
}

impl From<NewScheduledTask> for NewPgScheduledTask {
    fn from(task: NewScheduledTask) -> Self {
        NewPgScheduledTask {
            task_name: task.task_name,
            task_instance: task.task_instance,
            execution_time: task.execution_time.to_naive(),
            data: task.data,
            picked: false,
            consecutive_failures: 0,
            version: 0,
        }
    }
}

/// Row shape returned by the single-statement claim query.
#[derive(Debug, QueryableByName)]
pub struct PgClaimedRow {
    #[diesel(sql_type = diesel::sql_types::Text)]
    pub task_name: String,
    #[diesel(sql_type = diesel::sql_types::Text)]
    pub task_instance: String,
    #[diesel(sql_type = diesel::sql_types::Timestamp)]
    pub execution_time: NaiveDateTime,
    #[diesel(sql_type = diesel::sql_types::Bytea)]
    pub data: Vec<u8>,
    #[diesel(sql_type = diesel::sql_types::Bool)]
    pub picked: bool,
    #[diesel(sql_type = diesel::sql_types::Nullable<diesel::sql_types::Text>)]
    pub picked_by: Option<String>,
    #[diesel(sql_type = diesel::sql_types::Nullable<diesel::sql_types::Timestamp>)]
    pub last_heartbeat: Option<NaiveDateTime>,
    #[diesel(sql_type = diesel::sql_types::Nullable<diesel::sql_types::Timestamp>)]
    pub last_success: Option<NaiveDateTime>,
    #[diesel(sql_type = diesel::sql_types::Nullable<diesel::sql_types::Timestamp>)]
    pub last_failure: Option<NaiveDateTime>,
    #[diesel(sql_type = diesel::sql_types::Integer)]
    pub consecutive_failures: i32,
    #[diesel(sql_type = diesel::sql_types::Integer)]
    pub version: i32,
}

impl From<PgClaimedRow> for ScheduledTask {
    fn from(row: PgClaimedRow) -> Self {
        ScheduledTask {
            task_name: row.task_name,
            task_instance: row.task_instance,
            execution_time: UniversalTimestamp::from_naive(row.execution_time),
            data: row.data,
            picked: row.picked,
            picked_by: row.picked_by,
            last_heartbeat: row.last_heartbeat.map(UniversalTimestamp::from_naive),
            last_success: row.last_success.map(UniversalTimestamp::from_naive),
            last_failure: row.last_failure.map(UniversalTimestamp::from_naive),
            consecutive_failures: row.consecutive_failures,
            version: row.version,
        }
    }
}

// ============================================================================
// SQLite models
// ============================================================================

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = sqlite::scheduled_tasks)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SqliteScheduledTask {
    pub task_name: String,
    pub task_instance: String,
    pub execution_time: String,
    pub data: Vec<u8>,
    pub picked: i32,
    pub picked_by: Option<String>,
    pub last_heartbeat: Option<String>,
    pub last_success: Option<String>,
    pub last_failure: Option<String>,
    pub consecutive_failures: i32,
    pub version: i32,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = sqlite::scheduled_tasks)]
pub struct NewSqliteScheduledTask {
    pub task_name: String,
    pub task_instance: String,
    pub execution_time: String,
    pub data: Vec<u8>,
    pub picked: i32,
    pub consecutive_failures: i32,
    pub version: i32,
}

impl From<NewScheduledTask> for NewSqliteScheduledTask {
    fn from(task: NewScheduledTask) -> Self {
        NewSqliteScheduledTask {
            task_name: task.task_name,
            task_instance: task.task_instance,
            execution_time: task.execution_time.to_rfc3339(),
            data: task.data,
            picked: 0,
            consecutive_failures: 0,
            version: 0,
        }
    }
}

fn parse_timestamp(column: &str, value: &str) -> Result<UniversalTimestamp, StoreError> {
    UniversalTimestamp::from_rfc3339(value)
        .map_err(|e| StoreError::Corrupt(format!("{} '{}' is not RFC3339: {}", column, value, e)))
}

impl TryFrom<SqliteScheduledTask> for ScheduledTask {
    type Error = StoreError;

    fn try_from(row: SqliteScheduledTask) -> Result<Self, Self::Error> {
        let parse_opt = |column: &str, value: Option<String>| {
            value
                .map(|v| parse_timestamp(column, &v))
                .transpose()
        };

        Ok(ScheduledTask {
            execution_time: parse_timestamp("execution_time", &row.execution_time)?,
            last_heartbeat: parse_opt("last_heartbeat", row.last_heartbeat)?,
            last_success: parse_opt("last_success", row.last_success)?,
            last_failure: parse_opt("last_failure", row.last_failure)?,
            task_name: row.task_name,
            task_instance: row.task_instance,
            data: row.data,
            picked: UniversalBool::from_i32(row.picked).is_true(),
            picked_by: row.picked_by,
            consecutive_failures: row.consecutive_failures,
            version: row.version,
        })
    }
}
