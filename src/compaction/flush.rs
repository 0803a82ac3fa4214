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

//! Flushing of retired writers and the background flush scheduler
//!
//! Mapping tasks never upload anything themselves. They hand retired writers
//! and memory-pressure signals to the scheduler over a bounded channel; the
//! scheduler consumes signals in order and runs the uploads on the flush
//! worker pool. A `Drain` signal is acknowledged only after every signal
//! queued before it has been handled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::buffer::{BufferPool, RetiredWriter};
use super::context::RunContext;
use super::packer::SegmentPacker;
use super::pool::{await_all_until, WorkerPool};
use super::watermark::MemoryWatermark;
use crate::core::{CompactionError, Result};
use crate::storage::binlog::merge_field_binlogs;
use crate::storage::BinlogLocation;

/// Messages from mapping tasks to the flush scheduler
#[derive(Debug)]
pub enum FlushSignal {
    /// A rotated writer to flush, packing its segment if requested
    Writer(RetiredWriter),
    /// Aggregate memory crossed the high watermark
    Pressure,
    /// Acknowledge once everything queued earlier is handled, then stop
    Drain(oneshot::Sender<()>),
}

pub struct Flusher {
    ctx: Arc<RunContext>,
    pool: Arc<BufferPool>,
    packer: SegmentPacker,
    watermark: Arc<MemoryWatermark>,
    workers: WorkerPool,
    location: BinlogLocation,
    /// Held by flush-largest and flush-all passes; at most one runs at a time
    flush_guard: tokio::sync::Mutex<()>,
    flush_count: AtomicU64,
    /// Cancelled when the run is abandoned; in-flight flushes are aborted
    abort: CancellationToken,
}

impl Flusher {
    pub fn new(
        ctx: Arc<RunContext>,
        pool: Arc<BufferPool>,
        watermark: Arc<MemoryWatermark>,
        abort: CancellationToken,
    ) -> Self {
        let workers = WorkerPool::new("flush", ctx.config.worker_pool_size());
        Self {
            location: ctx.location(),
            packer: SegmentPacker::new(ctx.clone()),
            ctx,
            pool,
            watermark,
            workers,
            flush_guard: tokio::sync::Mutex::new(()),
            flush_count: AtomicU64::new(0),
            abort,
        }
    }

    /// Number of writers sealed and uploaded so far
    pub fn flush_count(&self) -> u64 {
        self.flush_count.load(Ordering::Relaxed)
    }

    pub fn watermark(&self) -> &Arc<MemoryWatermark> {
        &self.watermark
    }

    /// Run one flush on the flush pool
    pub fn submit(self: &Arc<Self>, retired: RetiredWriter) -> JoinHandle<Result<()>> {
        let flusher = self.clone();
        self.workers
            .submit(async move { flusher.flush_binlog(retired).await })
    }

    /// Seal and upload a retired writer, then record its binlogs.
    ///
    /// The buffer's flushed-state lock is held throughout, so flushes of one
    /// buffer never interleave and a pack always sees complete binlogs.
    pub async fn flush_binlog(&self, retired: RetiredWriter) -> Result<()> {
        let buffer = self.pool.buffer(retired.buffer_id)?;
        let mut state = buffer.flushed.lock().await;
        let segment_id = retired.writer.segment_id();
        let memory = retired.writer.written_memory_size();

        if retired.writer.is_empty() {
            buffer.release_retired(memory);
            if retired.pack {
                self.packer.pack(buffer, &mut state, segment_id).await?;
            }
            return Ok(());
        }

        let (first_log_id, _) = self
            .ctx
            .log_allocator
            .alloc(retired.writer.column_count() as u32)?;
        let sealed = retired.writer.seal(&self.location, first_log_id)?;
        let row_count = sealed.row_count;
        self.ctx.store.upload(sealed.blobs).await?;

        if !sealed.bm25_stats.is_empty() {
            let segment_bm25 = state.bm25_stats.entry(segment_id).or_default();
            for (field_id, stats) in sealed.bm25_stats {
                segment_bm25.entry(field_id).or_default().merge(&stats);
            }
        }
        merge_field_binlogs(
            state.binlogs.entry(segment_id).or_default(),
            sealed.field_binlogs,
        );
        *state.row_num.entry(segment_id).or_insert(0) += row_count;

        buffer.release_retired(memory);
        self.watermark.notify_released();
        self.flush_count.fetch_add(1, Ordering::Relaxed);
        debug!(
            plan_id = self.ctx.plan_id,
            buffer_id = retired.buffer_id,
            segment_id,
            row_count,
            memory,
            pack = retired.pack,
            "flushed binlogs"
        );

        if retired.pack {
            self.packer.pack(buffer, &mut state, segment_id).await?;
        }
        Ok(())
    }

    /// Flush buffers largest first until projected memory reaches the low watermark
    pub async fn flush_largest_buffers(self: &Arc<Self>) -> Result<()> {
        let Ok(_guard) = self.flush_guard.try_lock() else {
            debug!(plan_id = self.ctx.plan_id, "flush pass already running, skip");
            return Ok(());
        };

        let mut current = self.pool.total_memory();
        if self.watermark.at_or_below_low(current) {
            return Ok(());
        }
        let before = current;

        let mut handles = Vec::new();
        for (buffer_id, rows) in self.pool.ids_by_row_count_desc() {
            if rows == 0 || self.watermark.at_or_below_low(current) {
                break;
            }
            if let Some(retired) = self.pool.retire(buffer_id)? {
                current = current.saturating_sub(retired.writer.written_memory_size());
                handles.push(self.submit(retired));
            }
        }

        let flushed = handles.len();
        await_all_until(handles, &self.abort).await?;
        info!(
            plan_id = self.ctx.plan_id,
            flushed_buffers = flushed,
            memory_before = before,
            memory_after = self.pool.total_memory(),
            "🌊 flushed largest buffers"
        );
        Ok(())
    }

    /// Take every writer out and flush it with packing
    pub async fn flush_all(self: &Arc<Self>) -> Result<()> {
        let _guard = self.flush_guard.lock().await;
        if self.abort.is_cancelled() {
            return Err(CompactionError::Cancelled);
        }
        let mut handles = Vec::with_capacity(self.pool.len());
        for buffer in self.pool.buffers() {
            if let Some(retired) = self.pool.take_writer(buffer.id())? {
                handles.push(self.submit(retired));
            }
        }
        await_all_until(handles, &self.abort).await?;
        info!(
            plan_id = self.ctx.plan_id,
            buffers = self.pool.len(),
            "flushed all buffers"
        );
        Ok(())
    }
}

/// Single consumer of [`FlushSignal`]s for one run
pub struct FlushScheduler {
    flusher: Arc<Flusher>,
    rx: mpsc::Receiver<FlushSignal>,
    done: CancellationToken,
    abort: CancellationToken,
}

impl FlushScheduler {
    pub fn new(
        flusher: Arc<Flusher>,
        rx: mpsc::Receiver<FlushSignal>,
        done: CancellationToken,
        abort: CancellationToken,
    ) -> Self {
        Self {
            flusher,
            rx,
            done,
            abort,
        }
    }

    /// Handle signals until drained, cancelled or failed.
    ///
    /// The first failure cancels `abort` so producers stop, and is returned.
    /// Cancelling `abort` also abandons a flush that is still uploading.
    pub async fn run(mut self) -> Result<()> {
        let plan_id = self.flusher.ctx.plan_id;
        debug!(plan_id, "background flush scheduler started");

        let result = loop {
            let signal = tokio::select! {
                biased;
                _ = self.abort.cancelled() => break Ok(()),
                _ = self.done.cancelled() => break Ok(()),
                signal = self.rx.recv() => signal,
            };

            let outcome = match signal {
                None => break Ok(()),
                Some(FlushSignal::Drain(ack)) => {
                    let _ = ack.send(());
                    break Ok(());
                }
                Some(FlushSignal::Pressure) => {
                    self.flusher.watermark.clear_pressure();
                    self.flusher.flush_largest_buffers().await
                }
                Some(FlushSignal::Writer(retired)) => {
                    await_all_until(vec![self.flusher.submit(retired)], &self.abort)
                        .await
                        .map(|_| ())
                }
            };

            if let Err(e) = outcome {
                if e.is_cancelled() && self.abort.is_cancelled() {
                    debug!(plan_id, "in-flight flush abandoned");
                    break Ok(());
                }
                warn!(plan_id, error = %e, "❌ background flush failed");
                self.abort.cancel();
                break Err(e);
            }
        };

        debug!(plan_id, "background flush scheduler exited");
        result
    }
}
