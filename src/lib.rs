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

//! # Clustering Compactor
//!
//! Background reorganization of a partition's immutable segments by a
//! clustering key.
//!
//! A run reads every input segment of one partition, drops deleted and
//! expired rows, routes the survivors into cluster buffers (key ranges for
//! scalar keys, centroid groups for vector keys) and rewrites them as a new
//! set of segments, one cluster per segment family.
//!
//! ## Pipeline
//!
//! - **Analyze**: histogram the scalar key, or load precomputed centroids
//! - **Mapping**: stream, filter and assign rows in parallel per segment
//! - **Flush**: persist retired writers asynchronously under memory watermarks
//! - **Pack**: finalize output segments with primary-key and BM25 stats
//!
//! The run finishes by uploading a partition stats snapshot versioned by
//! the plan id.

pub mod compaction;
pub mod core;
pub mod storage;

pub use crate::compaction::{
    ClusteringCompactionTask, CompactionPlan, CompactionPlanResult, CompactionSegment,
    CompactionType,
};
pub use crate::core::{CompactionError, CompactorConfig, Result};
pub use crate::storage::{LocalObjectStore, MemoryObjectStore, ObjectStore};
