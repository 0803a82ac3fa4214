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

//! Memory watermark controller for cluster buffers
//!
//! * above `high`: ask the flush scheduler to flush the largest buffers,
//!   with at most one such request pending at a time
//! * above `block`: mapping tasks pause until memory drops below `high`
//! * a flush-largest pass stops once memory reaches `low`

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use crate::core::CompactorConfig;

#[derive(Debug)]
pub struct MemoryWatermark {
    low: u64,
    high: u64,
    block: u64,
    poll_interval: Duration,
    pressure_pending: AtomicBool,
    released: Notify,
}

impl MemoryWatermark {
    pub fn new(memory_buffer_size: u64, config: &CompactorConfig) -> Self {
        let scaled = |ratio: f64| (memory_buffer_size as f64 * ratio) as u64;
        Self {
            low: scaled(config.low_watermark_ratio),
            high: scaled(config.high_watermark_ratio),
            block: scaled(config.block_threshold_ratio),
            poll_interval: config.backpressure_poll_interval(),
            pressure_pending: AtomicBool::new(false),
            released: Notify::new(),
        }
    }

    pub fn low(&self) -> u64 {
        self.low
    }

    pub fn high(&self) -> u64 {
        self.high
    }

    pub fn block(&self) -> u64 {
        self.block
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn above_high(&self, total: u64) -> bool {
        total > self.high
    }

    pub fn above_block(&self, total: u64) -> bool {
        total > self.block
    }

    pub fn at_or_below_low(&self, total: u64) -> bool {
        total <= self.low
    }

    /// Claim the single pending pressure signal; false if one is in flight
    pub fn try_claim_pressure(&self) -> bool {
        self.pressure_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Called by the scheduler when it starts handling the pressure signal
    pub fn clear_pressure(&self) {
        self.pressure_pending.store(false, Ordering::Release);
    }

    pub fn pressure_pending(&self) -> bool {
        self.pressure_pending.load(Ordering::Acquire)
    }

    /// Wake every producer blocked on memory
    pub fn notify_released(&self) {
        self.released.notify_waiters();
    }

    /// Wait for a release notification or one poll interval, whichever first
    pub async fn wait_released(&self) {
        let _ = tokio::time::timeout(self.poll_interval, self.released.notified()).await;
    }
}
