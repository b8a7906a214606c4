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

//! Diesel table definitions for the `scheduled_tasks` table, one per
//! backend. Column types differ: PostgreSQL uses native TIMESTAMP/BOOLEAN/
//! BYTEA, SQLite stores timestamps as fixed-width RFC3339 TEXT, booleans as
//! INTEGER, and payloads as BLOB. The corresponding DDL lives under
//! `migrations/` and is applied out-of-band.

pub mod postgres {
    diesel::table! {
        scheduled_tasks (task_name, task_instance) {
            task_name -> Text,
            task_instance -> Text,
            execution_time -> Timestamp,
            data -> Bytea,
            picked -> Bool,
            picked_by -> Nullable<Text>,
            last_heartbeat -> Nullable<Timestamp>,
            last_success -> Nullable<Timestamp>,
            last_failure -> Nullable<Timestamp>,
            consecutive_failures -> Integer,
            version -> Integer,
        }
    }
}

pub mod sqlite {
    diesel::table! {
        scheduled_tasks (task_name, task_instance) {
            task_name -> Text,
            task_instance -> Text,
            execution_time -> Text,
            data -> Binary,
            picked -> Integer,
            picked_by -> Nullable<Text>,
            last_heartbeat -> Nullable<Text>,
            last_success -> Nullable<Text>,
            last_failure -> Nullable<Text>,
            consecutive_failures -> Integer,
            version -> Integer,
        }
    }
}
