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

//! Clustering assignment: which cluster buffer receives a row
//!
//! Scalar keys are range-bucketed over their sorted distinct values so that
//! bucket boundaries follow the key order. Vector keys are assigned through
//! precomputed centroids, grouped round-robin into buffers.

use std::collections::HashMap;

use crate::core::{CompactionError, Result, ScalarValue};

/// Inputs of the scalar bucketing policy
#[derive(Debug, Clone, Copy)]
pub struct ScalarPlanParams {
    pub max_segment_rows: i64,
    pub prefer_segment_rows: i64,
    pub memory_buffer_size: u64,
    pub expected_binlog_size: u64,
    pub prefer_segment_size_ratio: f64,
}

/// Buffers that fit in memory, never less than one
pub fn buffer_num_by_memory(memory_buffer_size: u64, expected_binlog_size: u64) -> i64 {
    (memory_buffer_size / expected_binlog_size.max(1)).max(1) as i64
}

/// Pick the row budget from segment limits or from memory, then bucket `keys`
pub fn switch_policy_for_scalar_plan(
    total_rows: i64,
    keys: &[ScalarValue],
    counts: &HashMap<ScalarValue, i64>,
    params: &ScalarPlanParams,
) -> Vec<Vec<ScalarValue>> {
    let buffer_num_by_segment_max_rows = total_rows / params.max_segment_rows.max(1);
    let buffer_num_by_memory =
        buffer_num_by_memory(params.memory_buffer_size, params.expected_binlog_size);

    if buffer_num_by_memory > buffer_num_by_segment_max_rows {
        return generate_scalar_plan(
            params.max_segment_rows,
            params.prefer_segment_rows,
            keys,
            counts,
        );
    }

    let max_rows = total_rows / buffer_num_by_memory;
    let prefer_rows = (max_rows as f64 * params.prefer_segment_size_ratio) as i64;
    generate_scalar_plan(max_rows, prefer_rows, keys, counts)
}

/// Sequential bucketing over sorted keys.
///
/// A key whose count alone exceeds `prefer_rows` becomes a singleton bucket.
/// The trailing bucket is always emitted, even when empty.
pub fn generate_scalar_plan(
    max_rows: i64,
    prefer_rows: i64,
    keys: &[ScalarValue],
    counts: &HashMap<ScalarValue, i64>,
) -> Vec<Vec<ScalarValue>> {
    let mut buckets = Vec::new();
    let mut current: Vec<ScalarValue> = Vec::new();
    let mut current_rows = 0i64;

    for key in keys {
        let rows = counts.get(key).copied().unwrap_or(0);
        if rows > prefer_rows {
            if !current.is_empty() {
                buckets.push(std::mem::take(&mut current));
                current_rows = 0;
            }
            buckets.push(vec![key.clone()]);
        } else if current_rows + rows > max_rows {
            buckets.push(std::mem::replace(&mut current, vec![key.clone()]));
            current_rows = rows;
        } else if current_rows + rows > prefer_rows {
            current.push(key.clone());
            buckets.push(std::mem::take(&mut current));
            current_rows = 0;
        } else {
            current.push(key.clone());
            current_rows += rows;
        }
    }
    buckets.push(current);
    buckets
}

/// Number of vector buffers: one per centroid, capped by memory
pub fn vector_buffer_num(centroid_num: usize, memory_buffer_size: u64, expected_binlog_size: u64) -> usize {
    centroid_num.min(buffer_num_by_memory(memory_buffer_size, expected_binlog_size) as usize)
}

/// Round-robin centroid indices into `num` groups.
///
/// Returns the groups and, per centroid index, its group. `None` when `num`
/// is zero.
pub fn split_centroids(centroid_num: usize, num: usize) -> Option<(Vec<Vec<usize>>, Vec<usize>)> {
    if num == 0 {
        return None;
    }
    let mut groups = vec![Vec::new(); num];
    let mut group_index = Vec::with_capacity(centroid_num);
    for centroid in 0..centroid_num {
        let group = centroid % num;
        groups[group].push(centroid);
        group_index.push(group);
    }
    Some((groups, group_index))
}

/// Lookup from a row's clustering key (or offset) to a buffer id
#[derive(Debug, Clone)]
pub enum ClusterAssignment {
    Scalar {
        key_to_buffer: HashMap<ScalarValue, usize>,
        null_buffer: Option<usize>,
    },
    Vector {
        /// centroid index -> buffer id
        group_index: Vec<usize>,
    },
}

impl ClusterAssignment {
    pub fn is_vector(&self) -> bool {
        matches!(self, ClusterAssignment::Vector { .. })
    }

    pub fn buffer_for_key(&self, key: Option<&ScalarValue>) -> Result<usize> {
        match self {
            ClusterAssignment::Scalar {
                key_to_buffer,
                null_buffer,
            } => match key {
                None => null_buffer.ok_or_else(|| {
                    CompactionError::ConsistencyViolation(
                        "null clustering key but no null buffer was planned".to_string(),
                    )
                }),
                Some(key) => key_to_buffer.get(key).copied().ok_or_else(|| {
                    CompactionError::ConsistencyViolation(format!(
                        "clustering key {:?} was not seen during analyze",
                        key
                    ))
                }),
            },
            ClusterAssignment::Vector { .. } => Err(CompactionError::Internal(
                "scalar lookup on a vector assignment".to_string(),
            )),
        }
    }

    /// Resolve a row through its segment's offset -> centroid table
    pub fn buffer_for_offset(&self, offset: usize, centroid_id_mapping: &[u32]) -> Result<usize> {
        let ClusterAssignment::Vector { group_index } = self else {
            return Err(CompactionError::Internal(
                "offset lookup on a scalar assignment".to_string(),
            ));
        };
        let centroid = *centroid_id_mapping.get(offset).ok_or_else(|| {
            CompactionError::Decode(format!(
                "row offset {} outside offset mapping of {} rows",
                offset,
                centroid_id_mapping.len()
            ))
        })? as usize;
        group_index.get(centroid).copied().ok_or_else(|| {
            CompactionError::Decode(format!(
                "centroid index {} outside {} centroids",
                centroid,
                group_index.len()
            ))
        })
    }
}
