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

//! Scheduled-task store operations with runtime backend selection.
//!
//! This is the coordination point for the whole fleet: claiming, heartbeats,
//! completion, rescheduling, and lease recovery are all single-transaction
//! conditional mutations, so exactly-one-worker-per-row holds without any
//! coordinator beyond the database.
//!
//! Claiming uses `SELECT ... FOR UPDATE SKIP LOCKED` on PostgreSQL, which
//! scales linearly across workers; SQLite serializes claims through an
//! immediate transaction. Every lease-checked mutation is a conditional
//! `UPDATE ... WHERE picked_by = <worker>` whose affected-row count
//! distinguishes success from a lost lease. Ownership rides entirely on
//! that `picked_by` predicate: lease recovery nulls it and a reclaim
//! rewrites it, so a stale holder's mutations match zero rows. The
//! `version` column is a change counter bumped by every mutation for
//! observability; it is not a compare-and-swap predicate, because the
//! heartbeat task bumps it concurrently with the pipeline and a version
//! equality check would make finalize race its own heartbeats.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use diesel::result::Error as DieselError;

use super::models::{
    NewPgScheduledTask, NewSqliteScheduledTask, PgClaimedRow, PgScheduledTask, SqliteScheduledTask,
};
use super::DAL;
use crate::database::schema::{postgres, sqlite};
use crate::database::UniversalTimestamp;
use crate::error::StoreError;
use crate::models::{NewScheduledTask, ScheduledTask, POISON_FAILURE_FLOOR};

/// Data access layer for scheduled-task operations.
#[derive(Clone)]
pub struct ScheduledTaskDAL<'a> {
    dal: &'a DAL,
}

impl<'a> ScheduledTaskDAL<'a> {
    /// Creates a new ScheduledTaskDAL instance.
    pub fn new(dal: &'a DAL) -> Self {
        Self { dal }
    }

    /// Inserts a new task row.
    ///
    /// Returns [`StoreError::DuplicateInstance`] if a row with the same
    /// `(task_name, task_instance)` already exists; named recurring tasks
    /// rely on this as their dedup key.
    pub async fn insert(&self, task: NewScheduledTask) -> Result<(), StoreError> {
        crate::backend_dispatch!(
            self.dal.backend(),
            self.insert_postgres(task).await,
            self.insert_sqlite(task).await
        )
    }

    async fn insert_postgres(&self, task: NewScheduledTask) -> Result<(), StoreError> {
        let conn = self
            .dal
            .database
            .get_postgres_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let task_name = task.task_name.clone();
        let task_instance = task.task_instance.clone();
        let row = NewPgScheduledTask::from(task);

        let result = conn
            .interact(move |conn| {
                diesel::insert_into(postgres::scheduled_tasks::table)
                    .values(&row)
                    .execute(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        map_insert_result(result, task_name, task_instance)
    }

    async fn insert_sqlite(&self, task: NewScheduledTask) -> Result<(), StoreError> {
        let conn = self
            .dal
            .database
            .get_sqlite_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let task_name = task.task_name.clone();
        let task_instance = task.task_instance.clone();
        let row = NewSqliteScheduledTask::from(task);

        let result = conn
            .interact(move |conn| {
                diesel::insert_into(sqlite::scheduled_tasks::table)
                    .values(&row)
                    .execute(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        map_insert_result(result, task_name, task_instance)
    }

    /// Atomically claims up to `batch_size` due tasks for `worker_id`.
    ///
    /// A row is due when `picked = false`, `execution_time <= now`, and it
    /// has not been poisoned. Selection is ordered by `execution_time`
    /// ascending; each claimed row gets `picked = true`,
    /// `picked_by = worker_id`, a fresh heartbeat, and a version bump. No
    /// two workers can claim the same row.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
        batch_size: usize,
    ) -> Result<Vec<ScheduledTask>, StoreError> {
        crate::backend_dispatch!(
            self.dal.backend(),
            self.claim_due_postgres(now, worker_id, batch_size).await,
            self.claim_due_sqlite(now, worker_id, batch_size).await
        )
    }

    async fn claim_due_postgres(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
        batch_size: usize,
    ) -> Result<Vec<ScheduledTask>, StoreError> {
        let conn = self
            .dal
            .database
            .get_postgres_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let now_ts = UniversalTimestamp::from(now).to_naive();
        let worker = worker_id.to_string();
        let limit = batch_size as i64;

        // Single statement, so the row locks and the lease write commit
        // together. SKIP LOCKED keeps concurrent claimers from blocking on
        // each other's candidate rows.
        let rows: Vec<PgClaimedRow> = conn
            .interact(move |conn| {
                diesel::sql_query(
                    r#"
                    WITH due AS (
                        SELECT task_name, task_instance
                        FROM scheduled_tasks
                        WHERE picked = FALSE
                          AND execution_time <= $1
                          AND consecutive_failures < $2
                        ORDER BY execution_time ASC
                        LIMIT $3
                        FOR UPDATE SKIP LOCKED
                    )
                    UPDATE scheduled_tasks t
                    SET picked = TRUE,
                        picked_by = $4,
                        last_heartbeat = $5,
                        version = version + 1
                    FROM due
                    WHERE t.task_name = due.task_name
                      AND t.task_instance = due.task_instance
                    RETURNING t.task_name, t.task_instance, t.execution_time, t.data,
                              t.picked, t.picked_by, t.last_heartbeat, t.last_success,
                              t.last_failure, t.consecutive_failures, t.version
                    "#,
                )
                .bind::<diesel::sql_types::Timestamp, _>(now_ts)
                .bind::<diesel::sql_types::Integer, _>(POISON_FAILURE_FLOOR)
                .bind::<diesel::sql_types::BigInt, _>(limit)
                .bind::<diesel::sql_types::Text, _>(worker)
                .bind::<diesel::sql_types::Timestamp, _>(now_ts)
                .load(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        let mut tasks: Vec<ScheduledTask> = rows.into_iter().map(Into::into).collect();
        tasks.sort_by(|a, b| a.execution_time.cmp(&b.execution_time));
        Ok(tasks)
    }

    async fn claim_due_sqlite(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
        batch_size: usize,
    ) -> Result<Vec<ScheduledTask>, StoreError> {
        use sqlite::scheduled_tasks::dsl;

        let conn = self
            .dal
            .database
            .get_sqlite_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let now_str = UniversalTimestamp::from(now).to_rfc3339();
        let worker = worker_id.to_string();
        let limit = batch_size as i64;

        // SQLite has no SKIP LOCKED; an immediate transaction takes the
        // write lock up front so concurrent claimers serialize instead of
        // racing between the select and the update.
        let rows: Vec<SqliteScheduledTask> = conn
            .interact(move |conn| {
                conn.immediate_transaction::<Vec<SqliteScheduledTask>, DieselError, _>(|conn| {
                    let due: Vec<SqliteScheduledTask> = dsl::scheduled_tasks
                        .filter(dsl::picked.eq(0))
                        .filter(dsl::execution_time.le(now_str.clone()))
                        .filter(dsl::consecutive_failures.lt(POISON_FAILURE_FLOOR))
                        .order(dsl::execution_time.asc())
                        .limit(limit)
                        .load(conn)?;

                    let mut claimed = Vec::with_capacity(due.len());
                    for row in due {
                        diesel::update(
                            dsl::scheduled_tasks
                                .find((row.task_name.clone(), row.task_instance.clone())),
                        )
                        .set((
                            dsl::picked.eq(1),
                            dsl::picked_by.eq(Some(worker.clone())),
                            dsl::last_heartbeat.eq(Some(now_str.clone())),
                            dsl::version.eq(dsl::version + 1),
                        ))
                        .execute(conn)?;

                        claimed.push(
                            dsl::scheduled_tasks
                                .find((row.task_name, row.task_instance))
                                .first(conn)?,
                        );
                    }

                    Ok(claimed)
                })
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Refreshes the lease heartbeat for a claimed row.
    ///
    /// Returns [`StoreError::LeaseLost`] if the row is no longer leased to
    /// `worker_id` — the caller must abort without publishing or mutating.
    pub async fn heartbeat(
        &self,
        task_name: &str,
        task_instance: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        crate::backend_dispatch!(
            self.dal.backend(),
            self.heartbeat_postgres(task_name, task_instance, worker_id, now)
                .await,
            self.heartbeat_sqlite(task_name, task_instance, worker_id, now)
                .await
        )
    }

    async fn heartbeat_postgres(
        &self,
        task_name: &str,
        task_instance: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        use postgres::scheduled_tasks::dsl;

        let conn = self
            .dal
            .database
            .get_postgres_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let name = task_name.to_string();
        let instance = task_instance.to_string();
        let worker = worker_id.to_string();
        let now_ts = UniversalTimestamp::from(now).to_naive();

        let updated = conn
            .interact(move |conn| {
                diesel::update(dsl::scheduled_tasks.find((name, instance)))
                    .filter(dsl::picked_by.eq(worker))
                    .set((
                        dsl::last_heartbeat.eq(Some(now_ts)),
                        dsl::version.eq(dsl::version + 1),
                    ))
                    .execute(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        lease_checked(updated, task_name, task_instance)
    }

    async fn heartbeat_sqlite(
        &self,
        task_name: &str,
        task_instance: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        use sqlite::scheduled_tasks::dsl;

        let conn = self
            .dal
            .database
            .get_sqlite_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let name = task_name.to_string();
        let instance = task_instance.to_string();
        let worker = worker_id.to_string();
        let now_str = UniversalTimestamp::from(now).to_rfc3339();

        let updated = conn
            .interact(move |conn| {
                diesel::update(dsl::scheduled_tasks.find((name, instance)))
                    .filter(dsl::picked_by.eq(worker))
                    .set((
                        dsl::last_heartbeat.eq(Some(now_str)),
                        dsl::version.eq(dsl::version + 1),
                    ))
                    .execute(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        lease_checked(updated, task_name, task_instance)
    }

    /// Deletes a finished row, checking the lease.
    pub async fn complete(
        &self,
        task_name: &str,
        task_instance: &str,
        worker_id: &str,
    ) -> Result<(), StoreError> {
        crate::backend_dispatch!(
            self.dal.backend(),
            self.complete_postgres(task_name, task_instance, worker_id)
                .await,
            self.complete_sqlite(task_name, task_instance, worker_id)
                .await
        )
    }

    async fn complete_postgres(
        &self,
        task_name: &str,
        task_instance: &str,
        worker_id: &str,
    ) -> Result<(), StoreError> {
        use postgres::scheduled_tasks::dsl;

        let conn = self
            .dal
            .database
            .get_postgres_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let name = task_name.to_string();
        let instance = task_instance.to_string();
        let worker = worker_id.to_string();

        let deleted = conn
            .interact(move |conn| {
                diesel::delete(dsl::scheduled_tasks.find((name, instance)))
                    .filter(dsl::picked_by.eq(worker))
                    .execute(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        lease_checked(deleted, task_name, task_instance)
    }

    async fn complete_sqlite(
        &self,
        task_name: &str,
        task_instance: &str,
        worker_id: &str,
    ) -> Result<(), StoreError> {
        use sqlite::scheduled_tasks::dsl;

        let conn = self
            .dal
            .database
            .get_sqlite_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let name = task_name.to_string();
        let instance = task_instance.to_string();
        let worker = worker_id.to_string();

        let deleted = conn
            .interact(move |conn| {
                diesel::delete(dsl::scheduled_tasks.find((name, instance)))
                    .filter(dsl::picked_by.eq(worker))
                    .execute(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        lease_checked(deleted, task_name, task_instance)
    }

    /// Releases the lease and moves the row to its next execution time.
    ///
    /// On success the failure streak resets and `last_success` is stamped;
    /// on failure the streak grows and `last_failure` is stamped. Atomic
    /// with the lease check.
    pub async fn reschedule(
        &self,
        task_name: &str,
        task_instance: &str,
        worker_id: &str,
        next_time: DateTime<Utc>,
        on_success: bool,
    ) -> Result<(), StoreError> {
        crate::backend_dispatch!(
            self.dal.backend(),
            self.reschedule_postgres(task_name, task_instance, worker_id, next_time, on_success)
                .await,
            self.reschedule_sqlite(task_name, task_instance, worker_id, next_time, on_success)
                .await
        )
    }

    async fn reschedule_postgres(
        &self,
        task_name: &str,
        task_instance: &str,
        worker_id: &str,
        next_time: DateTime<Utc>,
        on_success: bool,
    ) -> Result<(), StoreError> {
        use postgres::scheduled_tasks::dsl;

        let conn = self
            .dal
            .database
            .get_postgres_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let name = task_name.to_string();
        let instance = task_instance.to_string();
        let worker = worker_id.to_string();
        let next_ts = UniversalTimestamp::from(next_time).to_naive();
        let now_ts = UniversalTimestamp::now().to_naive();

        let updated = conn
            .interact(move |conn| {
                let target = diesel::update(dsl::scheduled_tasks.find((name, instance)))
                    .filter(dsl::picked_by.eq(worker));

                if on_success {
                    target
                        .set((
                            dsl::execution_time.eq(next_ts),
                            dsl::picked.eq(false),
                            dsl::picked_by.eq(None::<String>),
                            dsl::last_heartbeat.eq(None::<chrono::NaiveDateTime>),
                            dsl::last_success.eq(Some(now_ts)),
                            dsl::consecutive_failures.eq(0),
                            dsl::version.eq(dsl::version + 1),
                        ))
                        .execute(conn)
                } else {
                    target
                        .set((
                            dsl::execution_time.eq(next_ts),
                            dsl::picked.eq(false),
                            dsl::picked_by.eq(None::<String>),
                            dsl::last_heartbeat.eq(None::<chrono::NaiveDateTime>),
                            dsl::last_failure.eq(Some(now_ts)),
                            dsl::consecutive_failures.eq(dsl::consecutive_failures + 1),
                            dsl::version.eq(dsl::version + 1),
                        ))
                        .execute(conn)
                }
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        lease_checked(updated, task_name, task_instance)
    }

    async fn reschedule_sqlite(
        &self,
        task_name: &str,
        task_instance: &str,
        worker_id: &str,
        next_time: DateTime<Utc>,
        on_success: bool,
    ) -> Result<(), StoreError> {
        use sqlite::scheduled_tasks::dsl;

        let conn = self
            .dal
            .database
            .get_sqlite_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let name = task_name.to_string();
        let instance = task_instance.to_string();
        let worker = worker_id.to_string();
        let next_str = UniversalTimestamp::from(next_time).to_rfc3339();
        let now_str = UniversalTimestamp::now().to_rfc3339();

        let updated = conn
            .interact(move |conn| {
                let target = diesel::update(dsl::scheduled_tasks.find((name, instance)))
                    .filter(dsl::picked_by.eq(worker));

                if on_success {
                    target
                        .set((
                            dsl::execution_time.eq(next_str),
                            dsl::picked.eq(0),
                            dsl::picked_by.eq(None::<String>),
                            dsl::last_heartbeat.eq(None::<String>),
                            dsl::last_success.eq(Some(now_str)),
                            dsl::consecutive_failures.eq(0),
                            dsl::version.eq(dsl::version + 1),
                        ))
                        .execute(conn)
                } else {
                    target
                        .set((
                            dsl::execution_time.eq(next_str),
                            dsl::picked.eq(0),
                            dsl::picked_by.eq(None::<String>),
                            dsl::last_heartbeat.eq(None::<String>),
                            dsl::last_failure.eq(Some(now_str)),
                            dsl::consecutive_failures.eq(dsl::consecutive_failures + 1),
                            dsl::version.eq(dsl::version + 1),
                        ))
                        .execute(conn)
                }
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        lease_checked(updated, task_name, task_instance)
    }

    /// Forcibly releases leases whose heartbeat went stale.
    ///
    /// This is the only mechanism that reclaims work from crashed workers.
    /// Returns the number of released rows; costs one indexed scan when
    /// nothing is stale.
    pub async fn recover_leases(
        &self,
        now: DateTime<Utc>,
        stale_after: std::time::Duration,
    ) -> Result<usize, StoreError> {
        crate::backend_dispatch!(
            self.dal.backend(),
            self.recover_leases_postgres(now, stale_after).await,
            self.recover_leases_sqlite(now, stale_after).await
        )
    }

    async fn recover_leases_postgres(
        &self,
        now: DateTime<Utc>,
        stale_after: std::time::Duration,
    ) -> Result<usize, StoreError> {
        use postgres::scheduled_tasks::dsl;

        let conn = self
            .dal
            .database
            .get_postgres_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let cutoff = stale_cutoff(now, stale_after).to_naive();

        let released = conn
            .interact(move |conn| {
                diesel::update(
                    dsl::scheduled_tasks
                        .filter(dsl::picked.eq(true))
                        .filter(dsl::last_heartbeat.lt(cutoff)),
                )
                .set((
                    dsl::picked.eq(false),
                    dsl::picked_by.eq(None::<String>),
                    dsl::last_heartbeat.eq(None::<chrono::NaiveDateTime>),
                    dsl::version.eq(dsl::version + 1),
                ))
                .execute(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        Ok(released)
    }

    async fn recover_leases_sqlite(
        &self,
        now: DateTime<Utc>,
        stale_after: std::time::Duration,
    ) -> Result<usize, StoreError> {
        use sqlite::scheduled_tasks::dsl;

        let conn = self
            .dal
            .database
            .get_sqlite_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let cutoff = stale_cutoff(now, stale_after).to_rfc3339();

        let released = conn
            .interact(move |conn| {
                diesel::update(
                    dsl::scheduled_tasks
                        .filter(dsl::picked.eq(1))
                        .filter(dsl::last_heartbeat.lt(cutoff)),
                )
                .set((
                    dsl::picked.eq(0),
                    dsl::picked_by.eq(None::<String>),
                    dsl::last_heartbeat.eq(None::<String>),
                    dsl::version.eq(dsl::version + 1),
                ))
                .execute(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        Ok(released)
    }

    /// Flags a row whose stored data can no longer be decoded.
    ///
    /// The lease is released and `consecutive_failures` is raised to the
    /// poison floor, taking the row out of the due-task scan permanently
    /// while keeping it visible for operators.
    pub async fn mark_poisoned(
        &self,
        task_name: &str,
        task_instance: &str,
        worker_id: &str,
    ) -> Result<(), StoreError> {
        crate::backend_dispatch!(
            self.dal.backend(),
            self.mark_poisoned_postgres(task_name, task_instance, worker_id)
                .await,
            self.mark_poisoned_sqlite(task_name, task_instance, worker_id)
                .await
        )
    }

    async fn mark_poisoned_postgres(
        &self,
        task_name: &str,
        task_instance: &str,
        worker_id: &str,
    ) -> Result<(), StoreError> {
        use postgres::scheduled_tasks::dsl;

        let conn = self
            .dal
            .database
            .get_postgres_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let name = task_name.to_string();
        let instance = task_instance.to_string();
        let worker = worker_id.to_string();
        let now_ts = UniversalTimestamp::now().to_naive();

        let updated = conn
            .interact(move |conn| {
                diesel::update(dsl::scheduled_tasks.find((name, instance)))
                    .filter(dsl::picked_by.eq(worker))
                    .set((
                        dsl::picked.eq(false),
                        dsl::picked_by.eq(None::<String>),
                        dsl::last_heartbeat.eq(None::<chrono::NaiveDateTime>),
                        dsl::last_failure.eq(Some(now_ts)),
                        dsl::consecutive_failures.eq(POISON_FAILURE_FLOOR),
                        dsl::version.eq(dsl::version + 1),
                    ))
                    .execute(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        lease_checked(updated, task_name, task_instance)
    }

    async fn mark_poisoned_sqlite(
        &self,
        task_name: &str,
        task_instance: &str,
        worker_id: &str,
    ) -> Result<(), StoreError> {
        use sqlite::scheduled_tasks::dsl;

        let conn = self
            .dal
            .database
            .get_sqlite_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let name = task_name.to_string();
        let instance = task_instance.to_string();
        let worker = worker_id.to_string();
        let now_str = UniversalTimestamp::now().to_rfc3339();

        let updated = conn
            .interact(move |conn| {
                diesel::update(dsl::scheduled_tasks.find((name, instance)))
                    .filter(dsl::picked_by.eq(worker))
                    .set((
                        dsl::picked.eq(0),
                        dsl::picked_by.eq(None::<String>),
                        dsl::last_heartbeat.eq(None::<String>),
                        dsl::last_failure.eq(Some(now_str)),
                        dsl::consecutive_failures.eq(POISON_FAILURE_FLOOR),
                        dsl::version.eq(dsl::version + 1),
                    ))
                    .execute(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        lease_checked(updated, task_name, task_instance)
    }

    /// Retrieves a single row by its key.
    pub async fn get(
        &self,
        task_name: &str,
        task_instance: &str,
    ) -> Result<Option<ScheduledTask>, StoreError> {
        crate::backend_dispatch!(
            self.dal.backend(),
            self.get_postgres(task_name, task_instance).await,
            self.get_sqlite(task_name, task_instance).await
        )
    }

    async fn get_postgres(
        &self,
        task_name: &str,
        task_instance: &str,
    ) -> Result<Option<ScheduledTask>, StoreError> {
        use postgres::scheduled_tasks::dsl;

        let conn = self
            .dal
            .database
            .get_postgres_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let name = task_name.to_string();
        let instance = task_instance.to_string();

        let row: Option<PgScheduledTask> = conn
            .interact(move |conn| {
                dsl::scheduled_tasks
                    .find((name, instance))
                    .first(conn)
                    .optional()
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        Ok(row.map(Into::into))
    }

    async fn get_sqlite(
        &self,
        task_name: &str,
        task_instance: &str,
    ) -> Result<Option<ScheduledTask>, StoreError> {
        use sqlite::scheduled_tasks::dsl;

        let conn = self
            .dal
            .database
            .get_sqlite_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let name = task_name.to_string();
        let instance = task_instance.to_string();

        let row: Option<SqliteScheduledTask> = conn
            .interact(move |conn| {
                dsl::scheduled_tasks
                    .find((name, instance))
                    .first(conn)
                    .optional()
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        row.map(TryInto::try_into).transpose()
    }

    /// Counts all rows.
    pub async fn count(&self) -> Result<i64, StoreError> {
        crate::backend_dispatch!(
            self.dal.backend(),
            self.count_postgres().await,
            self.count_sqlite().await
        )
    }

    async fn count_postgres(&self) -> Result<i64, StoreError> {
        use postgres::scheduled_tasks::dsl;

        let conn = self
            .dal
            .database
            .get_postgres_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let count = conn
            .interact(|conn| dsl::scheduled_tasks.count().first(conn))
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        Ok(count)
    }

    async fn count_sqlite(&self) -> Result<i64, StoreError> {
        use sqlite::scheduled_tasks::dsl;

        let conn = self
            .dal
            .database
            .get_sqlite_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let count = conn
            .interact(|conn| dsl::scheduled_tasks.count().first(conn))
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        Ok(count)
    }
}

fn map_insert_result(
    result: Result<usize, DieselError>,
    task_name: String,
    task_instance: String,
) -> Result<(), StoreError> {
    match result {
        Ok(_) => Ok(()),
        Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            Err(StoreError::DuplicateInstance {
                task_name,
                task_instance,
            })
        }
        Err(e) => Err(e.into()),
    }
}

fn lease_checked(affected: usize, task_name: &str, task_instance: &str) -> Result<(), StoreError> {
    if affected == 1 {
        Ok(())
    } else {
        Err(StoreError::LeaseLost {
            task_name: task_name.to_string(),
            task_instance: task_instance.to_string(),
        })
    }
}

fn stale_cutoff(now: DateTime<Utc>, stale_after: std::time::Duration) -> UniversalTimestamp {
    let stale = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::zero());
    UniversalTimestamp::from(now - stale)
}
