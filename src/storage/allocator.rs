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

//! Unique id allocation for segments and logs

use parking_lot::Mutex;

use crate::core::{CompactionError, Result, UniqueId};

/// Hands out disjoint ids under concurrent use
pub trait IdAllocator: Send + Sync {
    fn alloc_one(&self) -> Result<UniqueId>;

    /// Returns `(start, count)`, covering ids `start..start + count`
    fn alloc(&self, count: u32) -> Result<(UniqueId, u32)>;
}

/// Allocator over the half-open range `[start, end)`
#[derive(Debug)]
pub struct LocalAllocator {
    name: &'static str,
    next: Mutex<UniqueId>,
    end: UniqueId,
}

impl LocalAllocator {
    pub fn new(name: &'static str, start: UniqueId, end: UniqueId) -> Self {
        Self {
            name,
            next: Mutex::new(start),
            end,
        }
    }

    /// Allocator with no practical upper bound
    pub fn unbounded(name: &'static str, start: UniqueId) -> Self {
        Self::new(name, start, UniqueId::MAX)
    }

    pub fn remaining(&self) -> i64 {
        (self.end - *self.next.lock()).max(0)
    }
}

impl IdAllocator for LocalAllocator {
    fn alloc_one(&self) -> Result<UniqueId> {
        let (start, _) = self.alloc(1)?;
        Ok(start)
    }

    fn alloc(&self, count: u32) -> Result<(UniqueId, u32)> {
        let mut next = self.next.lock();
        let start = *next;
        let stop = start.checked_add(count as i64).ok_or_else(|| {
            CompactionError::AllocatorExhausted(format!("{} allocator overflow", self.name))
        })?;
        if stop > self.end {
            return Err(CompactionError::AllocatorExhausted(format!(
                "{} allocator cannot hand out {} ids, {} left in [{}, {})",
                self.name,
                count,
                self.end - start,
                start,
                self.end
            )));
        }
        *next = stop;
        Ok((start, count))
    }
}
