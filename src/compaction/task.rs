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

//! Clustering compaction task
//!
//! Runs one plan through `Init -> Analyze -> Mapping -> DrainFlush ->
//! FlushAll -> Verify -> Done`. The background flush scheduler lives from
//! the start of mapping until the drain is acknowledged; every later flush
//! happens on the orchestrating task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::analyze::{analyze, AnalyzeResult};
use super::buffer::{BufferPool, WriterFactory};
use super::context::RunContext;
use super::flush::{FlushScheduler, FlushSignal, Flusher};
use super::mapping::{Mapper, MappingStats};
use super::plan::{
    CompactionPlan, CompactionPlanResult, CompactionSegment, CompactionTaskState, CompactionType,
};
use super::pool::{await_all_until, WorkerPool};
use super::watermark::MemoryWatermark;
use crate::core::{CollectionId, CompactionError, CompactorConfig, PlanId, Result};
use crate::storage::binlog::{partition_stats_path, partition_stats_root};
use crate::storage::{ObjectStore, PartitionStatsSnapshot};

pub struct ClusteringCompactionTask {
    plan: CompactionPlan,
    store: Arc<dyn ObjectStore>,
    config: CompactorConfig,
    /// External cancellation
    cancel: CancellationToken,
    /// Owner's task-done signal, see [`Self::complete`]
    done: CancellationToken,
}

impl ClusteringCompactionTask {
    pub fn new(plan: CompactionPlan, store: Arc<dyn ObjectStore>, config: CompactorConfig) -> Self {
        Self {
            plan,
            store,
            config,
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        }
    }

    /// Tie the task to a caller-owned cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn plan_id(&self) -> PlanId {
        self.plan.plan_id
    }

    pub fn channel(&self) -> &str {
        &self.plan.channel
    }

    pub fn compaction_type(&self) -> CompactionType {
        self.plan.compaction_type
    }

    pub fn collection_id(&self) -> CollectionId {
        self.plan.collection_id()
    }

    pub fn slot_usage(&self) -> i64 {
        self.plan.slot_usage
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal that the owner is done with this task
    pub fn complete(&self) {
        self.done.cancel();
    }

    /// Cancel the run and wait until the owner calls [`Self::complete`]
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.done.cancelled().await;
    }

    fn stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.done.is_cancelled()
    }

    #[instrument(name = "clustering_compaction", skip_all, fields(plan_id = self.plan.plan_id))]
    pub async fn compact(&self) -> Result<CompactionPlanResult> {
        let started = Instant::now();
        match self.run().await {
            Ok(result) => {
                info!(
                    plan_id = self.plan.plan_id,
                    segments = result.segments.len(),
                    rows = result.total_rows(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "🎉 clustering compaction done"
                );
                Ok(result)
            }
            Err(e) if e.is_cancelled() => {
                warn!(plan_id = self.plan.plan_id, "clustering compaction cancelled");
                Err(e)
            }
            Err(e) => {
                error!(
                    plan_id = self.plan.plan_id,
                    category = e.category(),
                    error = %e,
                    "❌ clustering compaction failed"
                );
                Err(e)
            }
        }
    }

    async fn run(&self) -> Result<CompactionPlanResult> {
        if self.stopped() {
            return Err(CompactionError::Cancelled);
        }
        let started = Instant::now();
        let ctx = Arc::new(RunContext::init(&self.plan, self.store.clone(), &self.config)?);
        let workers = WorkerPool::new("mapping", ctx.config.worker_pool_size());

        let AnalyzeResult {
            assignment,
            key_stats,
            offset_mapping_paths,
        } = analyze(&ctx, &workers).await?;
        info!(
            plan_id = ctx.plan_id,
            buffers = key_stats.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "analyze stage finished"
        );
        if self.stopped() {
            return Err(CompactionError::Cancelled);
        }

        let factory = WriterFactory::new(
            ctx.schema.clone(),
            ctx.bm25_fields.clone(),
            ctx.config.binlog_max_size,
            ctx.max_segment_rows,
            ctx.segment_allocator.clone(),
        );
        let pool = Arc::new(BufferPool::new(factory, key_stats)?);
        let watermark = Arc::new(MemoryWatermark::new(ctx.memory_buffer_size, &ctx.config));
        let abort = self.cancel.child_token();
        let flusher = Arc::new(Flusher::new(
            ctx.clone(),
            pool.clone(),
            watermark.clone(),
            abort.clone(),
        ));

        let (flush_tx, flush_rx) = mpsc::channel(ctx.config.flush_queue_capacity.max(1));
        let scheduler = tokio::spawn(
            FlushScheduler::new(flusher.clone(), flush_rx, self.done.clone(), abort.clone()).run(),
        );

        let mapper = Arc::new(Mapper::new(
            ctx.clone(),
            pool.clone(),
            Arc::new(assignment),
            Arc::new(offset_mapping_paths),
            watermark,
            flush_tx.clone(),
            self.done.clone(),
            abort.clone(),
        ));
        let mapped = self.map_all(&ctx, &workers, &mapper, &abort).await;
        drop(mapper);

        let mapped = match mapped {
            Ok(stats) => stats,
            Err(e) => {
                abort.cancel();
                join_scheduler(scheduler).await?;
                return Err(e);
            }
        };
        if abort.is_cancelled() || self.done.is_cancelled() {
            abort.cancel();
            join_scheduler(scheduler).await?;
            return Err(CompactionError::Cancelled);
        }
        let written: u64 = mapped.iter().map(|s| s.written_rows).sum();
        info!(
            plan_id = ctx.plan_id,
            segments = mapped.len(),
            written_rows = written,
            deleted_rows = mapped.iter().map(|s| s.deleted_rows).sum::<u64>(),
            expired_rows = mapped.iter().map(|s| s.expired_rows).sum::<u64>(),
            "mapping stage finished"
        );

        let (ack_tx, ack_rx) = oneshot::channel();
        let drained =
            flush_tx.send(FlushSignal::Drain(ack_tx)).await.is_ok() && ack_rx.await.is_ok();
        drop(flush_tx);
        join_scheduler(scheduler).await?;
        if !drained {
            return Err(if self.stopped() {
                CompactionError::Cancelled
            } else {
                CompactionError::FlushSchedulerClosed
            });
        }

        flusher.flush_all().await?;

        let (segments, snapshot) = collect_output(&pool, ctx.plan_id).await?;
        let total_rows: i64 = segments.iter().map(|s| s.num_of_rows).sum();
        if total_rows != pool.written_rows() {
            return Err(CompactionError::ConsistencyViolation(format!(
                "wrote {} rows into buffers but packed {}",
                pool.written_rows(),
                total_rows
            )));
        }

        self.upload_partition_stats(&ctx, &snapshot).await?;

        info!(
            plan_id = ctx.plan_id,
            flush_count = flusher.flush_count(),
            written_rows = pool.written_rows(),
            output_segments = segments.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compaction metrics"
        );

        Ok(CompactionPlanResult {
            state: CompactionTaskState::Completed,
            plan_id: ctx.plan_id,
            segments,
            compaction_type: self.plan.compaction_type,
            channel: ctx.channel.clone(),
        })
    }

    async fn map_all(
        &self,
        ctx: &Arc<RunContext>,
        workers: &WorkerPool,
        mapper: &Arc<Mapper>,
        abort: &CancellationToken,
    ) -> Result<Vec<MappingStats>> {
        let handles = ctx
            .segments
            .iter()
            .cloned()
            .map(|segment| {
                let mapper = mapper.clone();
                workers.submit(async move { mapper.map_segment(&segment).await })
            })
            .collect();
        await_all_until(handles, abort).await
    }

    async fn upload_partition_stats(
        &self,
        ctx: &RunContext,
        snapshot: &PartitionStatsSnapshot,
    ) -> Result<()> {
        let root = partition_stats_root(&ctx.analyze_result_path, &ctx.config.root_path);
        let path = partition_stats_path(
            root,
            ctx.collection_id,
            ctx.partition_id,
            &ctx.channel,
            snapshot.version,
        );
        let data = snapshot.serialize()?;
        info!(
            plan_id = ctx.plan_id,
            path = %path,
            segments = snapshot.segment_stats.len(),
            "uploading partition stats"
        );
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CompactionError::Cancelled),
            uploaded = ctx.store.upload(HashMap::from([(path, data)])) => uploaded,
        }
    }
}

/// The scheduler's own failure wins over whatever the caller saw
async fn join_scheduler(handle: JoinHandle<Result<()>>) -> Result<()> {
    handle.await?
}

/// Verify nothing is left unpacked and gather every buffer's output
async fn collect_output(
    pool: &BufferPool,
    plan_id: PlanId,
) -> Result<(Vec<CompactionSegment>, PartitionStatsSnapshot)> {
    let mut segments = Vec::new();
    let mut snapshot = PartitionStatsSnapshot::new(plan_id);

    for buffer in pool.buffers() {
        let mut state = buffer.flushed.lock().await;
        let leaked = state.leaked_segments();
        if !leaked.is_empty() {
            return Err(CompactionError::ConsistencyViolation(format!(
                "buffer {} left segments {:?} flushed but not packed",
                buffer.id(),
                leaked
            )));
        }
        segments.append(&mut state.uploaded_segments);
        snapshot
            .segment_stats
            .extend(state.uploaded_segment_stats.drain());
    }

    segments.sort_by_key(|s| s.segment_id);
    Ok((segments, snapshot))
}
