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

//! Universal type wrappers for cross-database compatibility
//!
//! This module provides wrapper types that work as domain types, convertible
//! to/from backend-specific database types. These types are used at the API
//! boundary and in business logic, while backend-specific models handle the
//! actual database storage.
//!
//! # Architecture
//!
//! - Domain code uses `UniversalTimestamp` and `UniversalBool`
//! - The PostgreSQL DAL converts to/from `NaiveDateTime` and `bool`
//! - The SQLite DAL converts to/from `String` and `i32`
//!
//! Timestamps are clamped to millisecond precision everywhere: that is the
//! scheduler's contract, and it keeps a value written through the SQLite
//! TEXT representation equal to the value read back. The SQLite encoding is
//! fixed-width RFC3339 (`2024-01-01T00:00:00.000Z`) so lexicographic
//! ordering of the stored strings equals chronological ordering — the
//! due-task scan's `ORDER BY execution_time` relies on this.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Universal timestamp wrapper for cross-database compatibility
///
/// Wraps a `DateTime<Utc>` truncated to millisecond precision. Backend
/// models convert to/from database-native representations.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct UniversalTimestamp(DateTime<Utc>);

impl UniversalTimestamp {
    /// The current instant, at millisecond precision.
    pub fn now() -> Self {
        Self::from(Utc::now())
    }

    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    pub fn into_inner(self) -> DateTime<Utc> {
        self.0
    }

    /// Convert to fixed-width RFC3339 for SQLite TEXT storage.
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Create from an RFC3339 string (SQLite TEXT).
    pub fn from_rfc3339(s: &str) -> Result<Self, chrono::ParseError> {
        DateTime::parse_from_rfc3339(s).map(|dt| Self::from(dt.with_timezone(&Utc)))
    }

    /// Convert to `NaiveDateTime` for PostgreSQL TIMESTAMP storage.
    pub fn to_naive(&self) -> chrono::NaiveDateTime {
        self.0.naive_utc()
    }

    /// Create from a `NaiveDateTime` (PostgreSQL TIMESTAMP).
    pub fn from_naive(naive: chrono::NaiveDateTime) -> Self {
        Self::from(Utc.from_utc_datetime(&naive))
    }
}

impl fmt::Display for UniversalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

impl From<DateTime<Utc>> for UniversalTimestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        let millis = dt.timestamp_millis();
        Self(Utc.timestamp_millis_opt(millis).single().unwrap_or(dt))
    }
}

impl From<UniversalTimestamp> for DateTime<Utc> {
    fn from(wrapper: UniversalTimestamp) -> Self {
        wrapper.0
    }
}

/// Universal boolean wrapper for cross-database compatibility
///
/// PostgreSQL stores booleans natively; SQLite stores 0/1 integers.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct UniversalBool(bool);

impl UniversalBool {
    pub fn is_true(&self) -> bool {
        self.0
    }

    /// Convert to an integer for SQLite storage.
    pub fn to_i32(&self) -> i32 {
        if self.0 {
            1
        } else {
            0
        }
    }

    /// Create from an integer (SQLite).
    pub fn from_i32(value: i32) -> Self {
        Self(value != 0)
    }
}

impl From<bool> for UniversalBool {
    fn from(value: bool) -> Self {
        Self(value)
    }
}

impl From<UniversalBool> for bool {
    fn from(wrapper: UniversalBool) -> Self {
        wrapper.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn timestamps_are_clamped_to_milliseconds() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
            + Duration::microseconds(1_500_723);
        let ts = UniversalTimestamp::from(dt);
        assert_eq!(ts.as_datetime().timestamp_subsec_micros() % 1_000, 0);
    }

    #[test]
    fn rfc3339_round_trip_is_identity() {
        let ts = UniversalTimestamp::now();
        let parsed = UniversalTimestamp::from_rfc3339(&ts.to_rfc3339()).unwrap();
        assert_eq!(ts, parsed);
    }

    #[test]
    fn rfc3339_encoding_is_fixed_width_and_sortable() {
        let earlier = UniversalTimestamp::from(Utc.with_ymd_and_hms(2024, 3, 1, 9, 59, 59).unwrap());
        let later = UniversalTimestamp::from(
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap() + Duration::milliseconds(5),
        );
        let (a, b) = (earlier.to_rfc3339(), later.to_rfc3339());
        assert_eq!(a.len(), b.len());
        assert!(a < b);
    }

    #[test]
    fn naive_round_trip_is_identity() {
        let ts = UniversalTimestamp::now();
        assert_eq!(ts, UniversalTimestamp::from_naive(ts.to_naive()));
    }

    #[test]
    fn bool_integer_mapping() {
        assert_eq!(UniversalBool::from(true).to_i32(), 1);
        assert_eq!(UniversalBool::from(false).to_i32(), 0);
        assert!(UniversalBool::from_i32(1).is_true());
        assert!(!UniversalBool::from_i32(0).is_true());
    }
}
