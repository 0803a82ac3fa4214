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

//! Segment packer: turns a segment's flushed binlogs into an output segment
//!
//! Packing re-reads the primary key, row id and timestamp binlogs of the
//! segment to build its primary-key stats log, uploads BM25 stats when the
//! schema has BM25 functions, records the buffer's clustering-key stats for
//! the segment, and finally clears the segment's flushed state.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use super::buffer::{ClusterBuffer, FlushedState};
use super::context::RunContext;
use super::plan::CompactionSegment;
use crate::core::{CompactionError, FieldId, Result, SegmentId, ROW_ID_FIELD, TIMESTAMP_FIELD};
use crate::storage::binlog::{bm25_log_path, stats_log_path};
use crate::storage::{
    Binlog, BinlogRowReader, Bm25Stats, FieldBinlog, PrimaryKeyStats, Projection, RowReader,
    SegmentStats,
};

pub struct SegmentPacker {
    ctx: Arc<RunContext>,
}

impl SegmentPacker {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        Self { ctx }
    }

    /// Pack `segment_id` of `buffer`; a no-op when nothing was flushed for it
    pub async fn pack(
        &self,
        buffer: &ClusterBuffer,
        state: &mut FlushedState,
        segment_id: SegmentId,
    ) -> Result<()> {
        let Some(binlogs) = state.binlogs.get(&segment_id).filter(|b| !b.is_empty()) else {
            return Ok(());
        };

        let num_rows = state.row_num.get(&segment_id).copied().unwrap_or(0);
        let insert_logs: Vec<FieldBinlog> = binlogs.values().cloned().collect();
        let pk_chunks = self.pk_chunk_paths(binlogs, segment_id)?;

        let stats_log = self.generate_pk_stats(segment_id, num_rows, &pk_chunks).await?;

        let bm25_logs = if self.ctx.bm25_fields.is_empty() {
            Vec::new()
        } else {
            let stats = state.bm25_stats.remove(&segment_id).unwrap_or_default();
            self.generate_bm25_stats(segment_id, stats).await?
        };

        let segment = CompactionSegment {
            plan_id: self.ctx.plan_id,
            segment_id,
            num_of_rows: num_rows,
            insert_logs,
            field2_statslog_paths: vec![stats_log],
            deltalogs: Vec::new(),
            channel: self.ctx.channel.clone(),
            bm25_logs,
        };
        debug!(
            plan_id = self.ctx.plan_id,
            buffer_id = buffer.id(),
            segment_id,
            num_rows,
            binlog_fields = segment.insert_logs.len(),
            "📦 packed segment"
        );

        state.uploaded_segments.push(segment);
        state.uploaded_segment_stats.insert(
            segment_id,
            SegmentStats {
                field_stats: vec![buffer.key_stats().clone()],
                num_rows,
            },
        );

        state.binlogs.remove(&segment_id);
        state.row_num.remove(&segment_id);
        Ok(())
    }

    /// Per chunk: the pk, row id and timestamp binlog paths
    fn pk_chunk_paths(
        &self,
        binlogs: &BTreeMap<FieldId, FieldBinlog>,
        segment_id: SegmentId,
    ) -> Result<Vec<Vec<String>>> {
        let fields = [self.ctx.pk_field.field_id, ROW_ID_FIELD, TIMESTAMP_FIELD];
        let columns = fields
            .iter()
            .map(|field_id| {
                binlogs.get(field_id).ok_or_else(|| {
                    CompactionError::ConsistencyViolation(format!(
                        "segment {} flushed without binlogs of field {}",
                        segment_id, field_id
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let binlog_num = columns[0].binlogs.len();
        if columns.iter().any(|c| c.binlogs.len() != binlog_num) {
            return Err(CompactionError::ConsistencyViolation(format!(
                "segment {} has misaligned system binlogs",
                segment_id
            )));
        }

        Ok((0..binlog_num)
            .map(|idx| {
                columns
                    .iter()
                    .map(|c| c.binlogs[idx].log_path.clone())
                    .collect()
            })
            .collect())
    }

    async fn generate_pk_stats(
        &self,
        segment_id: SegmentId,
        num_rows: i64,
        chunks: &[Vec<String>],
    ) -> Result<FieldBinlog> {
        let pk_field = &self.ctx.pk_field;
        let mut stats =
            PrimaryKeyStats::new(pk_field.field_id, pk_field.data_type, num_rows.max(0) as usize);

        for paths in chunks {
            let blobs = self.ctx.store.download(paths).await?;
            let mut reader =
                BinlogRowReader::new(&self.ctx.schema, &blobs, Projection::PrimaryKey)?;
            while let Some(row) = reader.next_row()? {
                stats.update(&row.pk);
            }
        }

        let data = stats.serialize()?;
        let log_id = self.ctx.log_allocator.alloc_one()?;
        let path = stats_log_path(
            &self.ctx.config.root_path,
            self.ctx.collection_id,
            self.ctx.partition_id,
            segment_id,
            pk_field.field_id,
            log_id,
        );
        let binlog = Binlog {
            entries_num: num_rows,
            timestamp_from: 0,
            timestamp_to: 0,
            log_path: path.clone(),
            log_size: data.len() as i64,
            log_id,
            memory_size: data.len() as i64,
        };
        self.ctx.store.upload(HashMap::from([(path, data)])).await?;

        Ok(FieldBinlog {
            field_id: pk_field.field_id,
            binlogs: vec![binlog],
        })
    }

    async fn generate_bm25_stats(
        &self,
        segment_id: SegmentId,
        stats: HashMap<FieldId, Bm25Stats>,
    ) -> Result<Vec<FieldBinlog>> {
        if stats.is_empty() {
            return Ok(Vec::new());
        }
        let (mut log_id, _) = self.ctx.log_allocator.alloc(stats.len() as u32)?;

        let ordered: BTreeMap<FieldId, Bm25Stats> = stats.into_iter().collect();
        let mut blobs = HashMap::with_capacity(ordered.len());
        let mut binlogs = Vec::with_capacity(ordered.len());
        for (field_id, field_stats) in ordered {
            let path = bm25_log_path(
                &self.ctx.config.root_path,
                self.ctx.collection_id,
                self.ctx.partition_id,
                segment_id,
                field_id,
                log_id,
            );
            let data = field_stats.serialize()?;
            binlogs.push(FieldBinlog {
                field_id,
                binlogs: vec![Binlog {
                    entries_num: field_stats.num_rows,
                    timestamp_from: 0,
                    timestamp_to: 0,
                    log_path: path.clone(),
                    log_size: data.len() as i64,
                    log_id,
                    memory_size: data.len() as i64,
                }],
            });
            blobs.insert(path, data);
            log_id += 1;
        }

        self.ctx.store.upload(blobs).await?;
        Ok(binlogs)
    }
}
