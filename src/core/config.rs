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

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::error::{CompactionError, Result};

/// Environment variables with this prefix override file settings,
/// e.g. `CLUSTERING_COMPACTOR_WORKER_POOL_SIZE=4`
pub const ENV_PREFIX: &str = "CLUSTERING_COMPACTOR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactorConfig {
    /// Share of physical memory available to cluster buffers
    pub memory_buffer_ratio: f64,
    /// Absolute buffer budget in bytes; overrides `memory_buffer_ratio`
    pub memory_buffer_size: Option<u64>,
    /// Size of the mapping pool and of the flush pool
    pub worker_pool_size: usize,
    /// Preferred/max rows ratio used when buckets are sized from memory
    pub prefer_segment_size_ratio: f64,
    pub low_watermark_ratio: f64,
    pub high_watermark_ratio: f64,
    pub block_threshold_ratio: f64,
    /// Expected bytes per buffer, derives the memory-bound buffer count
    pub expected_binlog_size: u64,
    /// A writer holding this many bytes is full and gets flushed
    pub binlog_max_size: u64,
    pub backpressure_poll_interval_ms: u64,
    pub flush_queue_capacity: usize,
    /// Mapping re-checks rotation and watermarks every this many rows
    pub memory_check_interval_rows: u64,
    /// Object store prefix for insert/stats/bm25 logs
    pub root_path: String,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            memory_buffer_ratio: 0.1,
            memory_buffer_size: None,
            worker_pool_size: num_cpus::get().max(1),
            prefer_segment_size_ratio: 0.8,
            low_watermark_ratio: 0.3,
            high_watermark_ratio: 0.7,
            block_threshold_ratio: 1.0,
            expected_binlog_size: 16 * 1024 * 1024,
            binlog_max_size: 16 * 1024 * 1024,
            backpressure_poll_interval_ms: 200,
            flush_queue_capacity: 100,
            memory_check_interval_rows: 100,
            root_path: "files".to_string(),
        }
    }
}

impl CompactorConfig {
    /// Load defaults, then an optional TOML file, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;
        let config: CompactorConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.low_watermark_ratio < self.high_watermark_ratio
            && self.high_watermark_ratio <= self.block_threshold_ratio)
        {
            return Err(CompactionError::Config(format!(
                "watermarks must satisfy low < high <= block, got {} / {} / {}",
                self.low_watermark_ratio, self.high_watermark_ratio, self.block_threshold_ratio
            )));
        }
        if self.low_watermark_ratio < 0.0 {
            return Err(CompactionError::Config(
                "low watermark ratio must not be negative".to_string(),
            ));
        }
        if self.memory_buffer_ratio <= 0.0 && self.memory_buffer_size.is_none() {
            return Err(CompactionError::Config(
                "memory buffer ratio must be positive".to_string(),
            ));
        }
        if self.expected_binlog_size == 0
            || self.binlog_max_size == 0
            || self.flush_queue_capacity == 0
            || self.memory_check_interval_rows == 0
        {
            return Err(CompactionError::Config(
                "binlog sizes, flush queue capacity and check interval must be non-zero"
                    .to_string(),
            ));
        }
        if !(self.prefer_segment_size_ratio > 0.0 && self.prefer_segment_size_ratio <= 1.0) {
            return Err(CompactionError::Config(format!(
                "prefer segment size ratio must be in (0, 1], got {}",
                self.prefer_segment_size_ratio
            )));
        }
        Ok(())
    }

    pub fn worker_pool_size(&self) -> usize {
        self.worker_pool_size.max(1)
    }

    pub fn backpressure_poll_interval(&self) -> Duration {
        Duration::from_millis(self.backpressure_poll_interval_ms.max(1))
    }

    /// Byte budget for all cluster buffers of one run
    pub fn memory_buffer_size(&self) -> u64 {
        if let Some(size) = self.memory_buffer_size {
            return size;
        }
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        (system.total_memory() as f64 * self.memory_buffer_ratio) as u64
    }
}
