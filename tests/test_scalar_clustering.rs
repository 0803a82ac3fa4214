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

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use clustering_compactor::compaction::CompactionTaskState;
use clustering_compactor::core::{compose_ts, CompactorConfig, FieldValue, ScalarValue};
use clustering_compactor::storage::{
    BinlogRowReader, Bm25Stats, MemoryObjectStore, PartitionStatsSnapshot, PrimaryKeyStats,
    Projection, RowReader,
};
use clustering_compactor::{ClusteringCompactionTask, CompactionPlanResult, CompactionType};
use common::*;

async fn run(
    store: &Arc<MemoryObjectStore>,
    plan: clustering_compactor::CompactionPlan,
    config: CompactorConfig,
) -> CompactionPlanResult {
    let task = ClusteringCompactionTask::new(plan, store.clone(), config);
    let result = task.compact().await.unwrap();
    task.complete();
    result
}

/// Every row of every output segment, read back through its insert logs
fn read_output(store: &MemoryObjectStore, result: &CompactionPlanResult) -> Vec<(i64, FieldValue)> {
    let schema = scalar_schema();
    let mut rows = Vec::new();
    for segment in &result.segments {
        let chunk_num = segment.insert_logs[0].binlogs.len();
        for idx in 0..chunk_num {
            let blobs: Vec<Vec<u8>> = segment
                .insert_logs
                .iter()
                .map(|field| store.get(&field.binlogs[idx].log_path).unwrap())
                .collect();
            let mut reader = BinlogRowReader::new(&schema, &blobs, Projection::AllFields).unwrap();
            while let Some(row) = reader.next_row().unwrap() {
                rows.push((row.row_id, row.column_value(KEY_FIELD)));
            }
        }
    }
    rows
}

fn snapshot(store: &MemoryObjectStore) -> PartitionStatsSnapshot {
    let data = store.get(&partition_stats_location("files")).unwrap();
    PartitionStatsSnapshot::deserialize(&data).unwrap()
}

#[tokio::test]
async fn test_hot_key_gets_its_own_cluster() {
    let store = Arc::new(MemoryObjectStore::new());
    let schema = scalar_schema();
    let ts = fresh_ts();

    // keys 1, 2, 3 with 10, 10 and 80 rows spread over two segments
    let first = rows_by_key(0, &[(1, 10), (3, 40)], ts);
    let second = rows_by_key(1000, &[(2, 10), (3, 40)], ts);
    let segments = vec![
        write_segment(store.as_ref(), &schema, 1, &first, 16).await,
        write_segment(store.as_ref(), &schema, 2, &second, 16).await,
    ];

    let result = run(&store, plan(schema, KEY_FIELD, segments, 50, 40), test_config()).await;

    assert_eq!(result.state, CompactionTaskState::Completed);
    assert_eq!(result.plan_id, PLAN_ID);
    assert_eq!(result.compaction_type, CompactionType::Clustering);
    assert_eq!(result.channel, CHANNEL);
    assert_eq!(result.segments.len(), 2);
    assert_eq!(result.segments[0].segment_id, FIRST_OUTPUT_SEGMENT);
    assert_eq!(result.segments[0].num_of_rows, 20);
    assert_eq!(result.segments[1].segment_id, FIRST_OUTPUT_SEGMENT + 1);
    assert_eq!(result.segments[1].num_of_rows, 80);

    let snapshot = snapshot(&store);
    assert_eq!(snapshot.version, PLAN_ID);
    let small = &snapshot.segment_stats[&FIRST_OUTPUT_SEGMENT];
    assert_eq!(small.num_rows, 20);
    assert_eq!(small.field_stats[0].min, Some(ScalarValue::Int64(1)));
    assert_eq!(small.field_stats[0].max, Some(ScalarValue::Int64(2)));
    let hot = &snapshot.segment_stats[&(FIRST_OUTPUT_SEGMENT + 1)];
    assert_eq!(hot.field_stats[0].min, Some(ScalarValue::Int64(3)));
    assert_eq!(hot.field_stats[0].max, Some(ScalarValue::Int64(3)));
}

#[tokio::test]
async fn test_rows_are_conserved_and_clustered() {
    let store = Arc::new(MemoryObjectStore::new());
    let schema = scalar_schema();
    let ts = fresh_ts();

    let mut segments = Vec::new();
    let mut expected = HashSet::new();
    for segment_id in 1..=4 {
        let keys: Vec<(i64, usize)> = (0..8).map(|k| (k * 10 + segment_id, 5)).collect();
        let rows = rows_by_key(segment_id * 10_000, &keys, ts);
        expected.extend(rows.iter().map(|r| r.row_id));
        segments.push(write_segment(store.as_ref(), &schema, segment_id, &rows, 7).await);
    }

    let result = run(&store, plan(schema, KEY_FIELD, segments, 40, 30), test_config()).await;

    let output = read_output(&store, &result);
    assert_eq!(result.total_rows(), expected.len() as i64);
    assert_eq!(output.len(), expected.len());
    let seen: HashSet<i64> = output.iter().map(|(row_id, _)| *row_id).collect();
    assert_eq!(seen, expected);

    // output key ranges never overlap
    let snapshot = snapshot(&store);
    let mut ranges: Vec<(ScalarValue, ScalarValue)> = snapshot
        .segment_stats
        .values()
        .map(|s| {
            (
                s.field_stats[0].min.clone().unwrap(),
                s.field_stats[0].max.clone().unwrap(),
            )
        })
        .collect();
    ranges.sort();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 < pair[1].0, "overlapping ranges {:?}", pair);
    }
}

#[tokio::test]
async fn test_deleted_and_expired_rows_are_dropped() {
    let store = Arc::new(MemoryObjectStore::new());
    let schema = scalar_schema();
    let now = now_ms();
    let fresh = compose_ts(now - 1_000, 0);
    let stale = compose_ts(now - 10 * 24 * 3600 * 1000, 0);

    let mut rows = rows_by_key(0, &[(1, 20), (2, 20)], fresh);
    rows.extend(rows_by_key(100, &[(1, 5)], stale));
    let mut segment = write_segment(store.as_ref(), &schema, 1, &rows, 50).await;
    // pks 0..10 deleted after they were written; pk 10 deleted before, so it survives
    write_deltalog(store.as_ref(), &mut segment, 0..10, compose_ts(now, 0)).await;
    write_deltalog(store.as_ref(), &mut segment, [10], compose_ts(now - 5_000, 0)).await;

    let mut plan = plan(schema, KEY_FIELD, vec![segment], 100, 80);
    plan.collection_ttl_ms = 24 * 3600 * 1000;
    let result = run(&store, plan, test_config()).await;

    assert_eq!(result.total_rows(), 30);
    let survivors: HashSet<i64> = read_output(&store, &result)
        .into_iter()
        .map(|(row_id, _)| row_id)
        .collect();
    assert!(survivors.contains(&10));
    assert!((0..10).all(|pk| !survivors.contains(&pk)));
    assert!((100..105).all(|pk| !survivors.contains(&pk)));
}

#[tokio::test]
async fn test_fully_deleted_input_produces_no_segments() {
    let store = Arc::new(MemoryObjectStore::new());
    let schema = scalar_schema();
    let ts = fresh_ts();

    let rows = rows_by_key(0, &[(1, 10), (2, 10)], ts);
    let mut segment = write_segment(store.as_ref(), &schema, 1, &rows, 8).await;
    write_deltalog(store.as_ref(), &mut segment, 0..20, compose_ts(now_ms(), 0)).await;

    let result = run(&store, plan(schema, KEY_FIELD, vec![segment], 100, 80), test_config()).await;

    assert!(result.segments.is_empty());
    assert_eq!(result.state, CompactionTaskState::Completed);
    assert!(store.list("files/insert_log/").is_empty());
    assert!(snapshot(&store).segment_stats.is_empty());
}

#[tokio::test]
async fn test_null_keys_get_a_dedicated_buffer() {
    let store = Arc::new(MemoryObjectStore::new());
    let schema = scalar_schema();
    let ts = fresh_ts();

    let mut rows = rows_by_key(0, &[(5, 10)], ts);
    rows.extend((100..104).map(|pk| row(pk, None, ts)));
    let segment = write_segment(store.as_ref(), &schema, 1, &rows, 100).await;

    let result = run(&store, plan(schema, KEY_FIELD, vec![segment], 100, 80), test_config()).await;

    assert_eq!(result.segments.len(), 2);
    let output = read_output(&store, &result);
    assert_eq!(output.iter().filter(|(_, key)| key.is_null()).count(), 4);

    let snapshot = snapshot(&store);
    let null_stats = snapshot
        .segment_stats
        .values()
        .find(|s| s.num_rows == 4)
        .unwrap();
    assert_eq!(null_stats.field_stats[0].min, None);
    assert_eq!(null_stats.field_stats[0].max, None);
}

#[tokio::test]
async fn test_output_segments_carry_pk_stats() {
    let store = Arc::new(MemoryObjectStore::new());
    let schema = scalar_schema();
    let rows = rows_by_key(40, &[(1, 25)], fresh_ts());
    let segment = write_segment(store.as_ref(), &schema, 1, &rows, 10).await;

    let result = run(&store, plan(schema, KEY_FIELD, vec![segment], 100, 80), test_config()).await;

    let segment = &result.segments[0];
    assert_eq!(segment.field2_statslog_paths.len(), 1);
    let stats_log = &segment.field2_statslog_paths[0];
    assert_eq!(stats_log.field_id, PK_FIELD);
    assert_eq!(stats_log.binlogs[0].entries_num, 25);
    assert!(stats_log.binlogs[0].log_path.starts_with("files/stats_log/1/2/"));

    let stats =
        PrimaryKeyStats::deserialize(&store.get(&stats_log.binlogs[0].log_path).unwrap()).unwrap();
    assert_eq!(stats.min_pk, Some(clustering_compactor::core::PrimaryKey::Int64(40)));
    assert_eq!(stats.max_pk, Some(clustering_compactor::core::PrimaryKey::Int64(64)));
    assert!(stats
        .bloom_filter
        .might_contain(&clustering_compactor::core::PrimaryKey::Int64(50)));

    // log ids come from the plan's range and never collide
    let log_ids: HashSet<i64> = segment
        .insert_logs
        .iter()
        .chain(segment.field2_statslog_paths.iter())
        .flat_map(|f| f.binlogs.iter().map(|b| b.log_id))
        .collect();
    assert_eq!(log_ids.len(), segment.insert_logs.len() + 1);
    assert!(log_ids.iter().all(|id| *id >= 50_000));
}

#[tokio::test]
async fn test_bm25_stats_are_packed() {
    let store = Arc::new(MemoryObjectStore::new());
    let schema = bm25_schema();
    let ts = fresh_ts();
    let rows: Vec<_> = (0..12)
        .map(|pk| text_row(pk, pk % 2, &[1, 2 + (pk as u32 % 3)], ts))
        .collect();
    let segment = write_segment(store.as_ref(), &schema, 1, &rows, 5).await;

    let result = run(&store, plan(schema, KEY_FIELD, vec![segment], 100, 80), test_config()).await;

    assert_eq!(result.total_rows(), 12);
    let mut total_bm25_rows = 0;
    for segment in &result.segments {
        assert_eq!(segment.bm25_logs.len(), 1);
        let log = &segment.bm25_logs[0];
        assert_eq!(log.field_id, SPARSE_FIELD);
        assert_eq!(log.binlogs[0].entries_num, segment.num_of_rows);
        let stats = Bm25Stats::deserialize(&store.get(&log.binlogs[0].log_path).unwrap()).unwrap();
        assert_eq!(stats.num_rows, segment.num_of_rows);
        assert_eq!(stats.token_doc_freq[&1], segment.num_of_rows);
        total_bm25_rows += stats.num_rows;
    }
    assert_eq!(total_bm25_rows, 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rotation_and_pressure_flushes_under_tight_memory() {
    let store = Arc::new(MemoryObjectStore::new());
    let schema = scalar_schema();
    let ts = fresh_ts();

    let mut segments = Vec::new();
    let mut expected = 0usize;
    for segment_id in 1..=3 {
        let keys: Vec<(i64, usize)> = (0..10).map(|k| (k, 10)).collect();
        let rows = rows_by_key(segment_id * 10_000, &keys, ts);
        expected += rows.len();
        segments.push(write_segment(store.as_ref(), &schema, segment_id, &rows, 33).await);
    }

    let config = CompactorConfig {
        memory_buffer_size: Some(4096),
        expected_binlog_size: 1024,
        binlog_max_size: 512,
        memory_check_interval_rows: 1,
        flush_queue_capacity: 4,
        ..test_config()
    };
    let max_rows = 30;
    let result = run(&store, plan(schema, KEY_FIELD, segments, max_rows, 25), config).await;

    assert_eq!(result.total_rows(), expected as i64);
    assert_eq!(read_output(&store, &result).len(), expected);
    for segment in &result.segments {
        assert!(segment.num_of_rows > 0);
        assert!(segment.num_of_rows <= max_rows + 3, "segment too large: {}", segment.num_of_rows);
    }
    // byte-limit flushes append several binlogs to one segment
    assert!(result
        .segments
        .iter()
        .any(|s| s.insert_logs.iter().all(|f| f.binlogs.len() > 1)));

    let ids: HashSet<i64> = result.segments.iter().map(|s| s.segment_id).collect();
    assert_eq!(ids.len(), result.segments.len());
    assert_eq!(snapshot(&store).segment_stats.len(), result.segments.len());
}

#[tokio::test]
async fn test_null_rows_count_toward_the_memory_policy() {
    let store = Arc::new(MemoryObjectStore::new());
    let schema = scalar_schema();
    let ts = fresh_ts();

    let keys: Vec<(i64, usize)> = (0..10).map(|k| (k, 10)).collect();
    let mut rows = rows_by_key(0, &keys, ts);
    rows.extend((1000..1900).map(|pk| row(pk, None, ts)));
    let segment = write_segment(store.as_ref(), &schema, 1, &rows, 250).await;

    // room for five buffers; 1000 rows over 100-row segments needs ten
    let config = CompactorConfig {
        memory_buffer_size: Some(5 << 20),
        expected_binlog_size: 1 << 20,
        ..test_config()
    };
    let result = run(&store, plan(schema, KEY_FIELD, vec![segment], 100, 80), config).await;
    assert_eq!(result.total_rows(), 1000);

    // memory policy: 200-row budget keeps all ten keys in a single bucket
    let snapshot = snapshot(&store);
    let keyed: Vec<i64> = snapshot
        .segment_stats
        .values()
        .filter(|s| s.field_stats[0].min.is_some())
        .map(|s| s.num_rows)
        .collect();
    assert_eq!(keyed, vec![100]);
    let bucket = snapshot
        .segment_stats
        .values()
        .find(|s| s.field_stats[0].min.is_some())
        .unwrap();
    assert_eq!(bucket.field_stats[0].min, Some(ScalarValue::Int64(0)));
    assert_eq!(bucket.field_stats[0].max, Some(ScalarValue::Int64(9)));
}
