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

//! Binlog descriptors, object-store layout and the column blob codec
//!
//! Every column of a segment is stored as a sequence of binlogs; binlog *i*
//! of every field of a segment holds the same rows. A column blob is a
//! bincode-encoded [`ColumnBlob`] wrapped in a crc32-checked envelope.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::{
    CollectionId, CompactionError, DataType, FieldId, FieldValue, PartitionId, Result, SegmentId,
    UniqueId,
};

pub const INSERT_LOG_PREFIX: &str = "insert_log";
pub const DELTA_LOG_PREFIX: &str = "delta_log";
pub const STATS_LOG_PREFIX: &str = "stats_log";
pub const BM25_LOG_PREFIX: &str = "bm25_stats";
pub const PARTITION_STATS_PREFIX: &str = "part_stats";
pub const ANALYZE_STATS_PREFIX: &str = "analyze_stats";

const CENTROIDS_FILE: &str = "centroids";
const OFFSET_MAPPING_FILE: &str = "offset_mapping";

/// Descriptor of one persisted log file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binlog {
    pub entries_num: i64,
    #[serde(default)]
    pub timestamp_from: u64,
    #[serde(default)]
    pub timestamp_to: u64,
    pub log_path: String,
    #[serde(default)]
    pub log_size: i64,
    #[serde(default)]
    pub log_id: UniqueId,
    #[serde(default)]
    pub memory_size: i64,
}

/// All binlogs of one field of one segment, in row order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldBinlog {
    pub field_id: FieldId,
    pub binlogs: Vec<Binlog>,
}

impl FieldBinlog {
    pub fn new(field_id: FieldId) -> Self {
        Self {
            field_id,
            binlogs: Vec::new(),
        }
    }

    pub fn entries_num(&self) -> i64 {
        self.binlogs.iter().map(|b| b.entries_num).sum()
    }
}

/// Append `incoming` per-field binlogs onto `target`, keeping field order stable
pub fn merge_field_binlogs(target: &mut BTreeMap<FieldId, FieldBinlog>, incoming: Vec<FieldBinlog>) {
    for field in incoming {
        target
            .entry(field.field_id)
            .or_insert_with(|| FieldBinlog::new(field.field_id))
            .binlogs
            .extend(field.binlogs);
    }
}

pub fn insert_log_path(
    root: &str,
    collection_id: CollectionId,
    partition_id: PartitionId,
    segment_id: SegmentId,
    field_id: FieldId,
    log_id: UniqueId,
) -> String {
    format!(
        "{}/{}/{}/{}/{}/{}/{}",
        root, INSERT_LOG_PREFIX, collection_id, partition_id, segment_id, field_id, log_id
    )
}

pub fn delta_log_path(
    root: &str,
    collection_id: CollectionId,
    partition_id: PartitionId,
    segment_id: SegmentId,
    log_id: UniqueId,
) -> String {
    format!(
        "{}/{}/{}/{}/{}/{}",
        root, DELTA_LOG_PREFIX, collection_id, partition_id, segment_id, log_id
    )
}

pub fn stats_log_path(
    root: &str,
    collection_id: CollectionId,
    partition_id: PartitionId,
    segment_id: SegmentId,
    field_id: FieldId,
    log_id: UniqueId,
) -> String {
    format!(
        "{}/{}/{}/{}/{}/{}/{}",
        root, STATS_LOG_PREFIX, collection_id, partition_id, segment_id, field_id, log_id
    )
}

pub fn bm25_log_path(
    root: &str,
    collection_id: CollectionId,
    partition_id: PartitionId,
    segment_id: SegmentId,
    field_id: FieldId,
    log_id: UniqueId,
) -> String {
    format!(
        "{}/{}/{}/{}/{}/{}/{}",
        root, BM25_LOG_PREFIX, collection_id, partition_id, segment_id, field_id, log_id
    )
}

pub fn centroids_path(
    analyze_result_path: &str,
    collection_id: CollectionId,
    partition_id: PartitionId,
    field_id: FieldId,
) -> String {
    format!(
        "{}/{}/{}/{}/{}",
        analyze_result_path, collection_id, partition_id, field_id, CENTROIDS_FILE
    )
}

pub fn offset_mapping_path(
    analyze_result_path: &str,
    collection_id: CollectionId,
    partition_id: PartitionId,
    field_id: FieldId,
    segment_id: SegmentId,
) -> String {
    format!(
        "{}/{}/{}/{}/{}/{}",
        analyze_result_path, collection_id, partition_id, field_id, segment_id, OFFSET_MAPPING_FILE
    )
}

/// Root for partition stats: the analyze path up to `analyze_stats`, else `root`
pub fn partition_stats_root<'a>(analyze_result_path: &'a str, root: &'a str) -> &'a str {
    if analyze_result_path.is_empty() {
        return root;
    }
    match analyze_result_path.find(ANALYZE_STATS_PREFIX) {
        Some(idx) => analyze_result_path[..idx].trim_end_matches('/'),
        None => root,
    }
}

pub fn partition_stats_path(
    root: &str,
    collection_id: CollectionId,
    partition_id: PartitionId,
    channel: &str,
    version: i64,
) -> String {
    format!(
        "{}/{}/{}/{}/{}/{}",
        root, PARTITION_STATS_PREFIX, collection_id, partition_id, channel, version
    )
}

/// Decoded content of one column binlog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnBlob {
    pub field_id: FieldId,
    pub data_type: DataType,
    pub values: Vec<FieldValue>,
}

#[derive(Serialize, Deserialize)]
struct BlobEnvelope {
    checksum: u32,
    payload: Vec<u8>,
}

/// Wrap a serialized payload in a checksummed envelope
pub fn seal(payload: Vec<u8>) -> Result<Vec<u8>> {
    let envelope = BlobEnvelope {
        checksum: crc32fast::hash(&payload),
        payload,
    };
    Ok(bincode::serialize(&envelope)?)
}

/// Verify and unwrap an envelope produced by [`seal`]
pub fn unseal(data: &[u8]) -> Result<Vec<u8>> {
    let envelope: BlobEnvelope = bincode::deserialize(data)
        .map_err(|e| CompactionError::Decode(format!("malformed blob envelope: {}", e)))?;
    let actual = crc32fast::hash(&envelope.payload);
    if actual != envelope.checksum {
        return Err(CompactionError::Decode(format!(
            "checksum mismatch: expected {:08x}, got {:08x}",
            envelope.checksum, actual
        )));
    }
    Ok(envelope.payload)
}

pub fn encode_column(field_id: FieldId, data_type: DataType, values: Vec<FieldValue>) -> Result<Vec<u8>> {
    let blob = ColumnBlob {
        field_id,
        data_type,
        values,
    };
    seal(bincode::serialize(&blob)?)
}

pub fn decode_column(data: &[u8]) -> Result<ColumnBlob> {
    let payload = unseal(data)?;
    bincode::deserialize(&payload)
        .map_err(|e| CompactionError::Decode(format!("malformed column blob: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_stats_root() {
        assert_eq!(
            partition_stats_root("files/analyze_stats/1/2", "files"),
            "files"
        );
        assert_eq!(partition_stats_root("", "root"), "root");
        assert_eq!(partition_stats_root("elsewhere", "root"), "root");
        assert_eq!(
            partition_stats_path("files", 1, 2, "ch-0", 9),
            "files/part_stats/1/2/ch-0/9"
        );
    }

    #[test]
    fn test_corrupted_column_is_decode_error() {
        let mut blob = encode_column(
            100,
            DataType::Int64,
            vec![FieldValue::Int64(1), FieldValue::Int64(2)],
        )
        .unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(matches!(decode_column(&blob), Err(CompactionError::Decode(_))));
        assert!(matches!(decode_column(b"xx"), Err(CompactionError::Decode(_))));
    }

    #[test]
    fn test_merge_field_binlogs_appends() {
        let log = |id: i64| Binlog {
            entries_num: 10,
            timestamp_from: 0,
            timestamp_to: 0,
            log_path: format!("p/{}", id),
            log_size: 1,
            log_id: id,
            memory_size: 1,
        };
        let mut target = BTreeMap::new();
        merge_field_binlogs(
            &mut target,
            vec![FieldBinlog {
                field_id: 100,
                binlogs: vec![log(1)],
            }],
        );
        merge_field_binlogs(
            &mut target,
            vec![FieldBinlog {
                field_id: 100,
                binlogs: vec![log(2)],
            }],
        );
        assert_eq!(target[&100].binlogs.len(), 2);
        assert_eq!(target[&100].entries_num(), 20);
    }
}
