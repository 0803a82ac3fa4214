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

//! Mapping stage: route every surviving row of a segment into its cluster buffer
//!
//! Each input segment is mapped by one task. Every `memory_check_interval_rows`
//! written rows the task checks whether the buffer it just wrote needs a
//! writer rotation, whether aggregate memory warrants a flush-largest pass,
//! and whether it must pause until memory drops back under the high
//! watermark.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::assignment::ClusterAssignment;
use super::buffer::BufferPool;
use super::context::RunContext;
use super::flush::FlushSignal;
use super::plan::CompactionSegmentBinlogs;
use super::watermark::MemoryWatermark;
use crate::core::{CompactionError, Result, Row, SegmentId};
use crate::storage::{
    compose_delete_from_deltalogs, CentroidIdMappingStats, EntityFilter, Projection,
    SegmentRowStream,
};

/// Counters of one mapped segment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MappingStats {
    pub read_rows: u64,
    pub written_rows: u64,
    pub deleted_rows: u64,
    pub expired_rows: u64,
}

/// Shared by all mapping tasks of a run
pub struct Mapper {
    ctx: Arc<RunContext>,
    pool: Arc<BufferPool>,
    assignment: Arc<ClusterAssignment>,
    offset_mapping_paths: Arc<HashMap<SegmentId, String>>,
    watermark: Arc<MemoryWatermark>,
    flush_tx: mpsc::Sender<FlushSignal>,
    done: CancellationToken,
    /// Child of the external cancellation token
    abort: CancellationToken,
}

impl Mapper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Arc<RunContext>,
        pool: Arc<BufferPool>,
        assignment: Arc<ClusterAssignment>,
        offset_mapping_paths: Arc<HashMap<SegmentId, String>>,
        watermark: Arc<MemoryWatermark>,
        flush_tx: mpsc::Sender<FlushSignal>,
        done: CancellationToken,
        abort: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            pool,
            assignment,
            offset_mapping_paths,
            watermark,
            flush_tx,
            done,
            abort,
        }
    }

    fn stopped(&self) -> bool {
        self.abort.is_cancelled() || self.done.is_cancelled()
    }

    /// Map one input segment.
    ///
    /// Returns early, without error, once the run is stopped; the caller
    /// decides what a stopped run reports.
    #[instrument(name = "mapping", skip_all, fields(plan_id = self.ctx.plan_id, segment_id = segment.segment_id))]
    pub async fn map_segment(&self, segment: &CompactionSegmentBinlogs) -> Result<MappingStats> {
        let deleted = compose_delete_from_deltalogs(self.ctx.store.as_ref(), &segment.deltalogs).await?;
        let mut filter = EntityFilter::new(deleted, self.ctx.ttl_ms, self.ctx.now_ms);

        let centroid_id_mapping = if self.assignment.is_vector() {
            Some(self.load_offset_mapping(segment.segment_id).await?)
        } else {
            None
        };

        let mut stream = SegmentRowStream::new(
            self.ctx.store.clone(),
            self.ctx.schema.clone(),
            &segment.field_binlogs,
            Projection::AllFields,
        )?;

        let check_interval = self.ctx.config.memory_check_interval_rows.max(1);
        let mut stats = MappingStats::default();
        let mut offset = 0usize;
        while let Some(row) = stream.next_row().await? {
            let row_offset = offset;
            offset += 1;
            stats.read_rows += 1;

            if filter.filtered(&row.pk, row.timestamp) {
                continue;
            }

            let buffer_id = match &centroid_id_mapping {
                Some(mapping) => self.assignment.buffer_for_offset(row_offset, mapping)?,
                None => self.scalar_buffer(&row)?,
            };
            self.pool.write(buffer_id, &row)?;
            stats.written_rows += 1;

            if stats.written_rows % check_interval == 0 {
                if let ControlFlow::Break(()) = self.check_memory(buffer_id).await? {
                    debug!(
                        segment_id = segment.segment_id,
                        written = stats.written_rows,
                        "mapping stopped early"
                    );
                    break;
                }
            }
        }

        stats.deleted_rows = filter.deleted_count();
        stats.expired_rows = filter.expired_count();
        info!(
            plan_id = self.ctx.plan_id,
            segment_id = segment.segment_id,
            read = stats.read_rows,
            written = stats.written_rows,
            deleted = stats.deleted_rows,
            expired = stats.expired_rows,
            deltalog_deletes = filter.deltalog_delete_count(),
            missing_deletes = filter.missing_delete_count(),
            "✅ mapped segment"
        );
        Ok(stats)
    }

    fn scalar_buffer(&self, row: &Row) -> Result<usize> {
        let key_field = self.ctx.key_field.field_id;
        let key = row.column_value(key_field).to_scalar().map_err(|data_type| {
            CompactionError::Decode(format!(
                "row {} holds {:?} in scalar clustering key {}",
                row.row_id, data_type, key_field
            ))
        })?;
        self.assignment.buffer_for_key(key.as_ref())
    }

    async fn load_offset_mapping(&self, segment_id: SegmentId) -> Result<Vec<u32>> {
        let path = self.offset_mapping_paths.get(&segment_id).ok_or_else(|| {
            CompactionError::IllegalPlan(format!(
                "segment {} has no offset mapping in the analyze result",
                segment_id
            ))
        })?;
        let blobs = self.ctx.store.download(std::slice::from_ref(path)).await?;
        let data = blobs
            .first()
            .ok_or_else(|| CompactionError::ObjectStore(format!("no data returned for {}", path)))?;
        Ok(CentroidIdMappingStats::deserialize(data)?.centroid_id_mapping)
    }

    /// Rotation, pressure signal and backpressure for the buffer just written
    async fn check_memory(&self, buffer_id: usize) -> Result<ControlFlow<()>> {
        if self.stopped() {
            return Ok(ControlFlow::Break(()));
        }

        if let Some(retired) = self.pool.rotate_if_full(buffer_id)? {
            debug!(
                buffer_id,
                segment_id = retired.writer.segment_id(),
                pack = retired.pack,
                "rotated buffer writer"
            );
            self.send(FlushSignal::Writer(retired)).await?;
        } else if self.watermark.above_high(self.pool.total_memory())
            && self.watermark.try_claim_pressure()
        {
            self.send(FlushSignal::Pressure).await?;
        }

        self.wait_for_memory().await
    }

    /// Pause while memory is above the block threshold, until it drops under high
    async fn wait_for_memory(&self) -> Result<ControlFlow<()>> {
        let total = self.pool.total_memory();
        if !self.watermark.above_block(total) {
            return Ok(ControlFlow::Continue(()));
        }
        debug!(
            memory = total,
            block = self.watermark.block(),
            "⏸️ memory above block threshold, pausing mapping"
        );

        loop {
            if self.stopped() {
                return Ok(ControlFlow::Break(()));
            }
            if !self.watermark.above_high(self.pool.total_memory()) {
                return Ok(ControlFlow::Continue(()));
            }
            if self.watermark.try_claim_pressure() {
                self.send(FlushSignal::Pressure).await?;
            }
            self.watermark.wait_released().await;
        }
    }

    async fn send(&self, signal: FlushSignal) -> Result<()> {
        send_signal(&self.flush_tx, signal, &self.done, &self.abort).await
    }
}

/// Hand a signal to the scheduler unless the run is stopping.
///
/// A scheduler that exited because of `done` or `abort` is not an error.
async fn send_signal(
    tx: &mpsc::Sender<FlushSignal>,
    signal: FlushSignal,
    done: &CancellationToken,
    abort: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        biased;
        _ = abort.cancelled() => Ok(()),
        _ = done.cancelled() => Ok(()),
        sent = tx.send(signal) => match sent {
            Ok(()) => Ok(()),
            Err(_) if done.is_cancelled() || abort.is_cancelled() => Ok(()),
            Err(_) => Err(CompactionError::FlushSchedulerClosed),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_send_after_done_is_not_an_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let done = CancellationToken::new();
        let abort = CancellationToken::new();
        done.cancel();

        send_signal(&tx, FlushSignal::Pressure, &done, &abort)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_scheduler_is_reported() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let done = CancellationToken::new();
        let abort = CancellationToken::new();

        let err = send_signal(&tx, FlushSignal::Pressure, &done, &abort)
            .await
            .unwrap_err();
        assert!(matches!(err, CompactionError::FlushSchedulerClosed));
    }

    #[tokio::test]
    async fn test_full_queue_unblocks_on_done() {
        let (tx, _rx) = mpsc::channel(1);
        tx.send(FlushSignal::Pressure).await.unwrap();
        let done = CancellationToken::new();
        let abort = CancellationToken::new();

        let stopper = {
            let done = done.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                done.cancel();
            })
        };
        tokio::time::timeout(
            Duration::from_secs(5),
            send_signal(&tx, FlushSignal::Pressure, &done, &abort),
        )
        .await
        .unwrap()
        .unwrap();
        stopper.await.unwrap();
    }
}
