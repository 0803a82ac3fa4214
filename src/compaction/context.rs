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

//! Immutable per-run state, built by validating a plan

use std::sync::Arc;
use tracing::info;

use super::plan::{CompactionPlan, CompactionSegmentBinlogs, CompactionType};
use crate::core::{
    CollectionId, CollectionSchema, CompactionError, CompactorConfig, FieldId, FieldSchema,
    PartitionId, PlanId, Result, SegmentId,
};
use crate::storage::{BinlogLocation, IdAllocator, LocalAllocator, ObjectStore};

pub struct RunContext {
    pub plan_id: PlanId,
    pub channel: String,
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub schema: Arc<CollectionSchema>,
    pub pk_field: FieldSchema,
    pub key_field: FieldSchema,
    pub bm25_fields: Vec<FieldId>,
    pub ttl_ms: i64,
    /// Wall clock captured once for the whole run
    pub now_ms: i64,
    pub max_segment_rows: i64,
    pub prefer_segment_rows: i64,
    pub memory_buffer_size: u64,
    pub analyze_result_path: String,
    pub analyze_segment_ids: Vec<SegmentId>,
    pub segments: Vec<CompactionSegmentBinlogs>,
    pub config: CompactorConfig,
    pub store: Arc<dyn ObjectStore>,
    pub log_allocator: Arc<dyn IdAllocator>,
    pub segment_allocator: Arc<dyn IdAllocator>,
}

impl RunContext {
    /// Validate the plan; nothing is read or written before this succeeds
    pub fn init(
        plan: &CompactionPlan,
        store: Arc<dyn ObjectStore>,
        config: &CompactorConfig,
    ) -> Result<Self> {
        config.validate()?;
        if plan.compaction_type != CompactionType::Clustering {
            return Err(CompactionError::IllegalPlan(format!(
                "illegal compaction type {:?}",
                plan.compaction_type
            )));
        }
        if plan.segment_binlogs.is_empty() {
            return Err(CompactionError::IllegalPlan("empty segment binlogs".to_string()));
        }
        let schema = plan
            .schema
            .clone()
            .ok_or_else(|| CompactionError::IllegalPlan("empty schema in compaction plan".to_string()))?;

        let pk_field = schema.primary_field().cloned().ok_or_else(|| {
            CompactionError::IllegalPlan("schema has no usable primary key field".to_string())
        })?;
        let key_field = schema
            .field(plan.clustering_key_field)
            .cloned()
            .ok_or_else(|| {
                CompactionError::IllegalPlan(format!(
                    "clustering key field {} not in schema",
                    plan.clustering_key_field
                ))
            })?;
        if plan.max_segment_rows <= 0 {
            return Err(CompactionError::IllegalPlan(format!(
                "max segment rows must be positive, got {}",
                plan.max_segment_rows
            )));
        }
        if key_field.data_type.is_vector() && plan.analyze_result_path.is_empty() {
            return Err(CompactionError::IllegalPlan(
                "vector clustering key requires an analyze result path".to_string(),
            ));
        }
        let range = plan.pre_allocated_segment_ids;
        if range.end <= range.begin {
            return Err(CompactionError::IllegalPlan(format!(
                "empty pre-allocated segment id range [{}, {})",
                range.begin, range.end
            )));
        }

        let bm25_fields = schema.bm25_output_fields();
        let memory_buffer_size = config.memory_buffer_size();
        info!(
            plan_id = plan.plan_id,
            segment_id_begin = range.begin,
            segment_id_end = range.end,
            memory_buffer_size,
            worker_pool_size = config.worker_pool_size(),
            "clustering compaction task initialized"
        );

        Ok(Self {
            plan_id: plan.plan_id,
            channel: plan.channel.clone(),
            collection_id: plan.collection_id(),
            partition_id: plan.partition_id(),
            schema: Arc::new(schema),
            pk_field,
            key_field,
            bm25_fields,
            ttl_ms: plan.collection_ttl_ms,
            now_ms: chrono::Utc::now().timestamp_millis(),
            max_segment_rows: plan.max_segment_rows,
            prefer_segment_rows: plan.prefer_segment_rows,
            memory_buffer_size,
            analyze_result_path: plan.analyze_result_path.clone(),
            analyze_segment_ids: plan.analyze_segment_ids.clone(),
            segments: plan.segment_binlogs.clone(),
            config: config.clone(),
            store,
            log_allocator: Arc::new(LocalAllocator::unbounded("log", plan.begin_log_id)),
            segment_allocator: Arc::new(LocalAllocator::new("segment", range.begin, range.end)),
        })
    }

    pub fn is_vector_key(&self) -> bool {
        self.key_field.data_type.is_vector()
    }

    pub fn location(&self) -> BinlogLocation {
        BinlogLocation {
            root: self.config.root_path.clone(),
            collection_id: self.collection_id,
            partition_id: self.partition_id,
        }
    }
}
