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

//! Analyze stage: decide the cluster buffers before mapping starts
//!
//! Scalar keys get a parallel histogram over every input segment, bucketed
//! into contiguous key ranges. Vector keys reuse centroids trained by an
//! external analyze job; only the offset-mapping paths are resolved here,
//! the tables themselves are loaded per segment during mapping.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::assignment::{
    split_centroids, switch_policy_for_scalar_plan, vector_buffer_num, ClusterAssignment,
    ScalarPlanParams,
};
use super::context::RunContext;
use super::plan::CompactionSegmentBinlogs;
use super::pool::{await_all, WorkerPool};
use crate::core::{CompactionError, Result, ScalarValue, SegmentId};
use crate::storage::binlog::{centroids_path, offset_mapping_path};
use crate::storage::{ClusteringCentroidsStats, EntityFilter, FieldStats, Projection, SegmentRowStream};

/// Buffer plan produced by the analyze stage
#[derive(Debug)]
pub struct AnalyzeResult {
    pub assignment: ClusterAssignment,
    /// Key stats per buffer, indexed by buffer id
    pub key_stats: Vec<FieldStats>,
    /// Offset-mapping file of every analyzed segment (vector keys only)
    pub offset_mapping_paths: HashMap<SegmentId, String>,
}

impl AnalyzeResult {
    pub fn buffer_num(&self) -> usize {
        self.key_stats.len()
    }
}

/// Occurrence counts of clustering-key values
#[derive(Debug, Default)]
struct KeyHistogram {
    counts: HashMap<ScalarValue, i64>,
    null_count: i64,
}

impl KeyHistogram {
    fn merge(&mut self, other: KeyHistogram) {
        for (key, count) in other.counts {
            *self.counts.entry(key).or_insert(0) += count;
        }
        self.null_count += other.null_count;
    }

    fn key_rows(&self) -> i64 {
        self.counts.values().sum()
    }

    /// Rows counted by the policy switch, null keys included
    fn total_rows(&self) -> i64 {
        self.key_rows() + self.null_count
    }
}

pub async fn analyze(ctx: &Arc<RunContext>, workers: &WorkerPool) -> Result<AnalyzeResult> {
    if ctx.is_vector_key() {
        analyze_vector(ctx).await
    } else {
        analyze_scalar(ctx, workers).await
    }
}

#[instrument(name = "analyze_scalar", skip_all, fields(plan_id = ctx.plan_id))]
async fn analyze_scalar(ctx: &Arc<RunContext>, workers: &WorkerPool) -> Result<AnalyzeResult> {
    let merged = Arc::new(Mutex::new(KeyHistogram::default()));

    let handles = ctx
        .segments
        .iter()
        .map(|segment| {
            let ctx = ctx.clone();
            let segment = segment.clone();
            let merged = merged.clone();
            workers.submit(async move {
                let partial = segment_histogram(&ctx, &segment).await?;
                merged.lock().merge(partial);
                Ok(())
            })
        })
        .collect();
    await_all(handles).await?;

    let histogram = std::mem::take(&mut *merged.lock());
    let mut keys: Vec<ScalarValue> = histogram.counts.keys().cloned().collect();
    keys.sort();

    let params = ScalarPlanParams {
        max_segment_rows: ctx.max_segment_rows,
        prefer_segment_rows: ctx.prefer_segment_rows,
        memory_buffer_size: ctx.memory_buffer_size,
        expected_binlog_size: ctx.config.expected_binlog_size,
        prefer_segment_size_ratio: ctx.config.prefer_segment_size_ratio,
    };
    let buckets =
        switch_policy_for_scalar_plan(histogram.total_rows(), &keys, &histogram.counts, &params);

    let field = &ctx.key_field;
    let mut key_to_buffer = HashMap::with_capacity(keys.len());
    let mut key_stats = Vec::with_capacity(buckets.len() + 1);
    for (buffer_id, bucket) in buckets.iter().enumerate() {
        for key in bucket {
            key_to_buffer.insert(key.clone(), buffer_id);
        }
        key_stats.push(FieldStats::from_scalar_keys(field.field_id, field.data_type, bucket));
    }

    let null_buffer = (histogram.null_count > 0).then(|| {
        key_stats.push(FieldStats::new(field.field_id, field.data_type));
        key_stats.len() - 1
    });

    info!(
        plan_id = ctx.plan_id,
        distinct_keys = keys.len(),
        key_rows = histogram.key_rows(),
        null_rows = histogram.null_count,
        buffers = key_stats.len(),
        "📊 scalar analyze done"
    );

    Ok(AnalyzeResult {
        assignment: ClusterAssignment::Scalar {
            key_to_buffer,
            null_buffer,
        },
        key_stats,
        offset_mapping_paths: HashMap::new(),
    })
}

/// Histogram of one segment; expired rows are skipped, deletes are not applied
async fn segment_histogram(
    ctx: &RunContext,
    segment: &CompactionSegmentBinlogs,
) -> Result<KeyHistogram> {
    let key_field = ctx.key_field.field_id;
    let mut filter = EntityFilter::ttl_only(ctx.ttl_ms, ctx.now_ms);
    let mut stream = SegmentRowStream::new(
        ctx.store.clone(),
        ctx.schema.clone(),
        &segment.field_binlogs,
        Projection::AllFields,
    )?;

    let mut histogram = KeyHistogram::default();
    while let Some(row) = stream.next_row().await? {
        if filter.filtered(&row.pk, row.timestamp) {
            continue;
        }
        match row.column_value(key_field).to_scalar() {
            Ok(Some(key)) => *histogram.counts.entry(key).or_insert(0) += 1,
            Ok(None) => histogram.null_count += 1,
            Err(data_type) => {
                return Err(CompactionError::Decode(format!(
                    "segment {} holds {:?} in scalar clustering key {}",
                    segment.segment_id, data_type, key_field
                )))
            }
        }
    }

    debug!(
        plan_id = ctx.plan_id,
        segment_id = segment.segment_id,
        distinct_keys = histogram.counts.len(),
        expired = filter.expired_count(),
        "segment histogram collected"
    );
    Ok(histogram)
}

#[instrument(name = "analyze_vector", skip_all, fields(plan_id = ctx.plan_id))]
async fn analyze_vector(ctx: &Arc<RunContext>) -> Result<AnalyzeResult> {
    let field = &ctx.key_field;
    let path = centroids_path(
        &ctx.analyze_result_path,
        ctx.collection_id,
        ctx.partition_id,
        field.field_id,
    );
    let blobs = ctx.store.download(std::slice::from_ref(&path)).await?;
    let data = blobs
        .first()
        .ok_or_else(|| CompactionError::ObjectStore(format!("no data returned for {}", path)))?;
    let centroids = ClusteringCentroidsStats::deserialize(data)?.centroids;

    let num = vector_buffer_num(
        centroids.len(),
        ctx.memory_buffer_size,
        ctx.config.expected_binlog_size,
    );
    let (groups, group_index) = split_centroids(centroids.len(), num).ok_or_else(|| {
        CompactionError::IllegalPlan(format!("analyze result {} holds no centroids", path))
    })?;

    let key_stats = groups
        .iter()
        .map(|group| {
            let vectors = group.iter().map(|&idx| centroids[idx].clone()).collect();
            FieldStats::from_centroids(field.field_id, field.data_type, vectors)
        })
        .collect::<Vec<_>>();

    let offset_mapping_paths = ctx
        .analyze_segment_ids
        .iter()
        .map(|&segment_id| {
            let path = offset_mapping_path(
                &ctx.analyze_result_path,
                ctx.collection_id,
                ctx.partition_id,
                field.field_id,
                segment_id,
            );
            (segment_id, path)
        })
        .collect();

    info!(
        plan_id = ctx.plan_id,
        centroids = centroids.len(),
        buffers = key_stats.len(),
        "📊 vector analyze done"
    );

    Ok(AnalyzeResult {
        assignment: ClusterAssignment::Vector { group_index },
        key_stats,
        offset_mapping_paths,
    })
}
