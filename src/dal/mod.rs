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

//! Data Access Layer with runtime backend selection
//!
//! This module provides a DAL that works with both PostgreSQL and SQLite
//! backends, selecting the appropriate implementation at runtime based on
//! the database connection type. Every operation is a single transaction;
//! all cross-worker coordination happens through these operations and the
//! row-level guarantees of the underlying database.
//!
//! # Example
//!
//! ```rust,ignore
//! use metronome::dal::DAL;
//! use metronome::database::Database;
//!
//! let db = Database::new("postgres://localhost/metronome", "metronome", 12);
//! let dal = DAL::new(db);
//!
//! let due = dal.scheduled_tasks().claim_due(now, "worker-1", 30).await?;
//! ```

use crate::database::{BackendType, Database};

pub mod models;
pub mod scheduled_tasks;

pub use scheduled_tasks::ScheduledTaskDAL;

/// Helper macro for dispatching operations based on backend type.
#[macro_export]
macro_rules! backend_dispatch {
    ($backend:expr, $pg:expr, $sqlite:expr) => {
        match $backend {
            $crate::database::BackendType::Postgres => $pg,
            $crate::database::BackendType::Sqlite => $sqlite,
        }
    };
}

/// The Data Access Layer handle.
///
/// # Thread Safety
///
/// `DAL` is `Clone` and can be safely shared between tasks. Each clone
/// references the same underlying connection pool.
#[derive(Clone, Debug)]
pub struct DAL {
    /// The database instance with connection pool
    pub database: Database,
}

impl DAL {
    /// Creates a new DAL instance.
    pub fn new(database: Database) -> Self {
        DAL { database }
    }

    /// Returns the backend type for this DAL instance.
    pub fn backend(&self) -> BackendType {
        self.database.backend()
    }

    /// Returns a reference to the underlying database.
    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Returns the scheduled-task DAL.
    pub fn scheduled_tasks(&self) -> ScheduledTaskDAL {
        ScheduledTaskDAL::new(self)
    }
}
