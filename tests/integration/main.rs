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

//! Integration tests.
//!
//! Everything runs against a throwaway SQLite database bootstrapped from
//! the shipped migration SQL, so the suite needs no external services. The
//! store semantics under test are backend-agnostic; the PostgreSQL claim
//! path differs only in using `FOR UPDATE SKIP LOCKED` inside a single
//! statement.

mod claiming;
mod fixtures;
mod scheduler;
mod store;
