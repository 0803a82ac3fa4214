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

//! Compaction plan (input) and compaction result (output)

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::{
    CollectionId, CollectionSchema, CompactionError, FieldId, PartitionId, PlanId, Result,
    SegmentId, UniqueId,
};
use crate::storage::FieldBinlog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompactionType {
    Mix,
    Level0Delete,
    Clustering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompactionTaskState {
    Executing,
    Completed,
    Failed,
}

/// Input segment with its insert binlogs and deltalogs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionSegmentBinlogs {
    pub segment_id: SegmentId,
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    #[serde(default)]
    pub insert_channel: String,
    pub field_binlogs: Vec<FieldBinlog>,
    #[serde(default)]
    pub deltalogs: Vec<FieldBinlog>,
    #[serde(default)]
    pub statslogs: Vec<FieldBinlog>,
}

/// Half-open id range `[begin, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub begin: UniqueId,
    pub end: UniqueId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionPlan {
    pub plan_id: PlanId,
    pub compaction_type: CompactionType,
    pub channel: String,
    pub segment_binlogs: Vec<CompactionSegmentBinlogs>,
    pub schema: Option<CollectionSchema>,
    pub clustering_key_field: FieldId,
    pub max_segment_rows: i64,
    pub prefer_segment_rows: i64,
    /// Rows older than now minus this many milliseconds are dropped; 0 disables TTL
    #[serde(default)]
    pub collection_ttl_ms: i64,
    pub pre_allocated_segment_ids: IdRange,
    pub begin_log_id: UniqueId,
    #[serde(default)]
    pub analyze_result_path: String,
    #[serde(default)]
    pub analyze_segment_ids: Vec<SegmentId>,
    #[serde(default)]
    pub slot_usage: i64,
}

impl CompactionPlan {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| CompactionError::IllegalPlan(format!("unparseable plan: {}", e)))
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path).await?;
        Self::from_json(&data)
    }

    /// Collection of the first input segment, 0 when there is none
    pub fn collection_id(&self) -> CollectionId {
        self.segment_binlogs
            .first()
            .map(|s| s.collection_id)
            .unwrap_or_default()
    }

    pub fn partition_id(&self) -> PartitionId {
        self.segment_binlogs
            .first()
            .map(|s| s.partition_id)
            .unwrap_or_default()
    }
}

/// One finalized output segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionSegment {
    pub plan_id: PlanId,
    pub segment_id: SegmentId,
    pub num_of_rows: i64,
    pub insert_logs: Vec<FieldBinlog>,
    pub field2_statslog_paths: Vec<FieldBinlog>,
    #[serde(default)]
    pub deltalogs: Vec<FieldBinlog>,
    pub channel: String,
    #[serde(default)]
    pub bm25_logs: Vec<FieldBinlog>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionPlanResult {
    pub state: CompactionTaskState,
    pub plan_id: PlanId,
    pub segments: Vec<CompactionSegment>,
    pub compaction_type: CompactionType,
    pub channel: String,
}

impl CompactionPlanResult {
    pub fn total_rows(&self) -> i64 {
        self.segments.iter().map(|s| s.num_of_rows).sum()
    }
}
