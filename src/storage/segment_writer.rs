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

//! Columnar row buffer for one output segment
//!
//! A writer accumulates rows column by column until it is flushed. Sealing a
//! writer turns its columns into one binlog per field, all sharing the same
//! row range, plus the BM25 stats gathered while writing.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::binlog::{encode_column, insert_log_path, Binlog, FieldBinlog};
use super::stats::Bm25Stats;
use crate::core::{
    CollectionId, CollectionSchema, CompactionError, DataType, FieldId, FieldValue, PartitionId,
    Result, Row, SegmentId, UniqueId, ROW_ID_FIELD, TIMESTAMP_FIELD,
};

/// Where sealed binlogs of a collection partition are written
#[derive(Debug, Clone)]
pub struct BinlogLocation {
    pub root: String,
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
}

/// Output of [`SegmentWriter::seal`]
#[derive(Debug)]
pub struct SealedBinlogs {
    pub segment_id: SegmentId,
    pub blobs: HashMap<String, Vec<u8>>,
    pub field_binlogs: Vec<FieldBinlog>,
    pub bm25_stats: HashMap<FieldId, Bm25Stats>,
    pub row_count: i64,
    pub memory_size: u64,
}

#[derive(Debug)]
pub struct SegmentWriter {
    segment_id: SegmentId,
    columns: BTreeMap<FieldId, (DataType, Vec<FieldValue>)>,
    bm25_stats: HashMap<FieldId, Bm25Stats>,
    row_count: i64,
    memory_size: u64,
    binlog_max_size: u64,
    timestamp_from: u64,
    timestamp_to: u64,
}

impl SegmentWriter {
    pub fn new(
        segment_id: SegmentId,
        schema: &Arc<CollectionSchema>,
        bm25_fields: &[FieldId],
        binlog_max_size: u64,
    ) -> Self {
        let columns = schema
            .column_ids()
            .into_iter()
            .map(|field_id| {
                let data_type = match field_id {
                    ROW_ID_FIELD | TIMESTAMP_FIELD => DataType::Int64,
                    _ => schema
                        .field(field_id)
                        .map(|f| f.data_type)
                        .unwrap_or(DataType::Int64),
                };
                (field_id, (data_type, Vec::new()))
            })
            .collect();

        Self {
            segment_id,
            columns,
            bm25_stats: bm25_fields
                .iter()
                .map(|id| (*id, Bm25Stats::default()))
                .collect(),
            row_count: 0,
            memory_size: 0,
            binlog_max_size,
            timestamp_from: u64::MAX,
            timestamp_to: 0,
        }
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    pub fn row_count(&self) -> i64 {
        self.row_count
    }

    /// Bytes buffered and not yet flushed
    pub fn written_memory_size(&self) -> u64 {
        self.memory_size
    }

    /// Buffered bytes reached the binlog size limit
    pub fn is_full(&self) -> bool {
        self.memory_size >= self.binlog_max_size
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    pub fn write(&mut self, row: &Row) -> Result<()> {
        for (field_id, (_, values)) in self.columns.iter_mut() {
            values.push(row.column_value(*field_id));
        }
        for (field_id, stats) in self.bm25_stats.iter_mut() {
            match row.get(*field_id) {
                Some(FieldValue::SparseFloatVector(sparse)) => stats.append(sparse),
                Some(FieldValue::Null) | None => {}
                Some(other) => {
                    return Err(CompactionError::Decode(format!(
                        "bm25 field {} holds a non-sparse value {:?}",
                        field_id, other
                    )))
                }
            }
        }

        self.row_count += 1;
        self.memory_size += row.memory_size() as u64;
        self.timestamp_from = self.timestamp_from.min(row.timestamp);
        self.timestamp_to = self.timestamp_to.max(row.timestamp);
        Ok(())
    }

    /// Serialize every column into one binlog each.
    ///
    /// `first_log_id` must start a block of at least [`Self::column_count`] ids.
    pub fn seal(self, location: &BinlogLocation, first_log_id: UniqueId) -> Result<SealedBinlogs> {
        let column_count = self.columns.len();
        let mut blobs = HashMap::with_capacity(column_count);
        let mut field_binlogs = Vec::with_capacity(column_count);
        let per_column_memory = self.memory_size / column_count.max(1) as u64;

        for (idx, (field_id, (data_type, values))) in self.columns.into_iter().enumerate() {
            let log_id = first_log_id + idx as UniqueId;
            let log_path = insert_log_path(
                &location.root,
                location.collection_id,
                location.partition_id,
                self.segment_id,
                field_id,
                log_id,
            );
            let data = encode_column(field_id, data_type, values)?;
            field_binlogs.push(FieldBinlog {
                field_id,
                binlogs: vec![Binlog {
                    entries_num: self.row_count,
                    timestamp_from: self.timestamp_from,
                    timestamp_to: self.timestamp_to,
                    log_path: log_path.clone(),
                    log_size: data.len() as i64,
                    log_id,
                    memory_size: per_column_memory as i64,
                }],
            });
            blobs.insert(log_path, data);
        }

        Ok(SealedBinlogs {
            segment_id: self.segment_id,
            blobs,
            field_binlogs,
            bm25_stats: self.bm25_stats,
            row_count: self.row_count,
            memory_size: self.memory_size,
        })
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}
