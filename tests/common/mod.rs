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

//! Shared fixtures: schemas, rows, and input segments written to an object store

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};

use clustering_compactor::compaction::{
    CompactionPlan, CompactionSegmentBinlogs, CompactionType, IdRange,
};
use clustering_compactor::core::{
    compose_ts, CollectionSchema, CompactorConfig, DataType, FieldId, FieldSchema, FieldValue,
    FunctionSchema, FunctionType, PrimaryKey, Row, SegmentId,
};
use clustering_compactor::storage::binlog::{delta_log_path, encode_column, insert_log_path};
use clustering_compactor::storage::delta::encode_delete_log;
use clustering_compactor::storage::{Binlog, DeleteRecord, FieldBinlog, ObjectStore};

pub const COLLECTION_ID: i64 = 1;
pub const PARTITION_ID: i64 = 2;
pub const PLAN_ID: i64 = 77;
pub const CHANNEL: &str = "by-dev-rootcoord-dml_0";
pub const INPUT_ROOT: &str = "input";

pub const PK_FIELD: FieldId = 100;
pub const KEY_FIELD: FieldId = 101;
pub const VECTOR_FIELD: FieldId = 102;
pub const TEXT_FIELD: FieldId = 103;
pub const SPARSE_FIELD: FieldId = 104;

pub const FIRST_OUTPUT_SEGMENT: SegmentId = 1000;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Timestamp one second in the past
pub fn fresh_ts() -> u64 {
    compose_ts(now_ms() - 1000, 0)
}

pub fn scalar_schema() -> CollectionSchema {
    CollectionSchema {
        name: "clustered".into(),
        fields: vec![
            FieldSchema::new(PK_FIELD, "pk", DataType::Int64).primary_key(),
            FieldSchema::new(KEY_FIELD, "category", DataType::Int64).nullable(),
            FieldSchema::new(VECTOR_FIELD, "embedding", DataType::FloatVector).with_dim(4),
        ],
        functions: vec![],
    }
}

pub fn bm25_schema() -> CollectionSchema {
    let mut schema = scalar_schema();
    schema
        .fields
        .push(FieldSchema::new(TEXT_FIELD, "text", DataType::VarChar));
    schema.fields.push(FieldSchema::new(
        SPARSE_FIELD,
        "text_sparse",
        DataType::SparseFloatVector,
    ));
    schema.functions.push(FunctionSchema {
        name: "text_bm25".into(),
        function_type: FunctionType::Bm25,
        input_field_ids: vec![TEXT_FIELD],
        output_field_ids: vec![SPARSE_FIELD],
    });
    schema
}

pub fn row(pk: i64, key: Option<i64>, ts: u64) -> Row {
    let mut fields = BTreeMap::new();
    fields.insert(PK_FIELD, FieldValue::Int64(pk));
    fields.insert(
        KEY_FIELD,
        key.map(FieldValue::Int64).unwrap_or(FieldValue::Null),
    );
    fields.insert(
        VECTOR_FIELD,
        FieldValue::FloatVector(vec![pk as f32, 0.5, 1.0, 2.0]),
    );
    Row {
        row_id: pk,
        timestamp: ts,
        pk: PrimaryKey::Int64(pk),
        fields,
    }
}

pub fn text_row(pk: i64, key: i64, tokens: &[u32], ts: u64) -> Row {
    let mut row = row(pk, Some(key), ts);
    row.fields
        .insert(TEXT_FIELD, FieldValue::VarChar(format!("doc {}", pk)));
    row.fields.insert(
        SPARSE_FIELD,
        FieldValue::SparseFloatVector(tokens.iter().map(|t| (*t, 1.0)).collect()),
    );
    row
}

/// `(pk, key)` rows starting at `first_pk`, `count` rows per key
pub fn rows_by_key(first_pk: i64, keys: &[(i64, usize)], ts: u64) -> Vec<Row> {
    let mut pk = first_pk;
    let mut rows = Vec::new();
    for (key, count) in keys {
        for _ in 0..*count {
            rows.push(row(pk, Some(*key), ts));
            pk += 1;
        }
    }
    rows
}

/// Write `rows` as a segment of aligned chunks of at most `chunk_rows` rows
pub async fn write_segment(
    store: &dyn ObjectStore,
    schema: &CollectionSchema,
    segment_id: SegmentId,
    rows: &[Row],
    chunk_rows: usize,
) -> CompactionSegmentBinlogs {
    let mut field_binlogs: BTreeMap<FieldId, FieldBinlog> = BTreeMap::new();
    let mut blobs = HashMap::new();

    for (chunk_idx, chunk) in rows.chunks(chunk_rows.max(1)).enumerate() {
        for field_id in schema.column_ids() {
            let data_type = schema
                .field(field_id)
                .map(|f| f.data_type)
                .unwrap_or(DataType::Int64);
            let values = chunk.iter().map(|r| r.column_value(field_id)).collect();
            let path = insert_log_path(
                INPUT_ROOT,
                COLLECTION_ID,
                PARTITION_ID,
                segment_id,
                field_id,
                chunk_idx as i64,
            );
            let data = encode_column(field_id, data_type, values).unwrap();
            field_binlogs
                .entry(field_id)
                .or_insert_with(|| FieldBinlog::new(field_id))
                .binlogs
                .push(Binlog {
                    entries_num: chunk.len() as i64,
                    timestamp_from: 0,
                    timestamp_to: 0,
                    log_path: path.clone(),
                    log_size: data.len() as i64,
                    log_id: chunk_idx as i64,
                    memory_size: data.len() as i64,
                });
            blobs.insert(path, data);
        }
    }
    store.upload(blobs).await.unwrap();

    CompactionSegmentBinlogs {
        segment_id,
        collection_id: COLLECTION_ID,
        partition_id: PARTITION_ID,
        insert_channel: CHANNEL.to_string(),
        field_binlogs: field_binlogs.into_values().collect(),
        deltalogs: vec![],
        statslogs: vec![],
    }
}

/// Attach a deltalog deleting `pks` at `ts` to `segment`
pub async fn write_deltalog(
    store: &dyn ObjectStore,
    segment: &mut CompactionSegmentBinlogs,
    pks: impl IntoIterator<Item = i64>,
    ts: u64,
) {
    let records: Vec<DeleteRecord> = pks
        .into_iter()
        .map(|pk| DeleteRecord {
            pk: PrimaryKey::Int64(pk),
            ts,
        })
        .collect();
    let log_id = segment.deltalogs.len() as i64;
    let path = delta_log_path(
        INPUT_ROOT,
        COLLECTION_ID,
        PARTITION_ID,
        segment.segment_id,
        log_id,
    );
    let data = encode_delete_log(&records).unwrap();
    store
        .upload(HashMap::from([(path.clone(), data)]))
        .await
        .unwrap();

    segment.deltalogs.push(FieldBinlog {
        field_id: PK_FIELD,
        binlogs: vec![Binlog {
            entries_num: records.len() as i64,
            timestamp_from: ts,
            timestamp_to: ts,
            log_path: path,
            log_size: 0,
            log_id,
            memory_size: 0,
        }],
    });
}

pub fn plan(
    schema: CollectionSchema,
    clustering_key_field: FieldId,
    segments: Vec<CompactionSegmentBinlogs>,
    max_segment_rows: i64,
    prefer_segment_rows: i64,
) -> CompactionPlan {
    CompactionPlan {
        plan_id: PLAN_ID,
        compaction_type: CompactionType::Clustering,
        channel: CHANNEL.to_string(),
        segment_binlogs: segments,
        schema: Some(schema),
        clustering_key_field,
        max_segment_rows,
        prefer_segment_rows,
        collection_ttl_ms: 0,
        pre_allocated_segment_ids: IdRange {
            begin: FIRST_OUTPUT_SEGMENT,
            end: FIRST_OUTPUT_SEGMENT + 1000,
        },
        begin_log_id: 50_000,
        analyze_result_path: String::new(),
        analyze_segment_ids: vec![],
        slot_usage: 8,
    }
}

/// Generous memory so watermarks stay out of the way
pub fn test_config() -> CompactorConfig {
    CompactorConfig {
        memory_buffer_size: Some(64 << 20),
        worker_pool_size: 4,
        backpressure_poll_interval_ms: 10,
        ..Default::default()
    }
}

pub fn partition_stats_location(root: &str) -> String {
    format!(
        "{}/part_stats/{}/{}/{}/{}",
        root, COLLECTION_ID, PARTITION_ID, CHANNEL, PLAN_ID
    )
}
