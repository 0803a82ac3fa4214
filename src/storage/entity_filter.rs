/*
 * Copyright 2025 Vijaykumar Singh
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Row filter combining deletes and collection TTL

use std::collections::HashMap;

use crate::core::{parse_ts, PrimaryKey};

/// Decides per row whether it survives compaction.
///
/// "Now" is captured once by the caller so every segment of a run evaluates
/// TTL against the same instant.
#[derive(Debug)]
pub struct EntityFilter {
    deleted: HashMap<PrimaryKey, u64>,
    ttl_ms: i64,
    now_ms: i64,
    deleted_count: u64,
    expired_count: u64,
}

impl EntityFilter {
    pub fn new(deleted: HashMap<PrimaryKey, u64>, ttl_ms: i64, now_ms: i64) -> Self {
        Self {
            deleted,
            ttl_ms,
            now_ms,
            deleted_count: 0,
            expired_count: 0,
        }
    }

    /// TTL-only filter
    pub fn ttl_only(ttl_ms: i64, now_ms: i64) -> Self {
        Self::new(HashMap::new(), ttl_ms, now_ms)
    }

    /// Returns true when the row must be dropped
    pub fn filtered(&mut self, pk: &PrimaryKey, ts: u64) -> bool {
        if self.is_deleted(pk, ts) {
            self.deleted_count += 1;
            return true;
        }
        if self.is_expired(ts) {
            self.expired_count += 1;
            return true;
        }
        false
    }

    fn is_deleted(&self, pk: &PrimaryKey, ts: u64) -> bool {
        matches!(self.deleted.get(pk), Some(delete_ts) if ts < *delete_ts)
    }

    fn is_expired(&self, ts: u64) -> bool {
        if self.ttl_ms <= 0 {
            return false;
        }
        let (physical_ms, _) = parse_ts(ts);
        physical_ms.saturating_add(self.ttl_ms) < self.now_ms
    }

    pub fn deleted_count(&self) -> u64 {
        self.deleted_count
    }

    pub fn expired_count(&self) -> u64 {
        self.expired_count
    }

    /// Number of delete records loaded from deltalogs
    pub fn deltalog_delete_count(&self) -> u64 {
        self.deleted.len() as u64
    }

    /// Deletes whose primary key never matched a row
    pub fn missing_delete_count(&self) -> u64 {
        self.deltalog_delete_count().saturating_sub(self.deleted_count)
    }
}
