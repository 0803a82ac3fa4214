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

//! Segment and partition statistics
//!
//! Stats logs and the partition snapshot are JSON; centroid and
//! offset-mapping files written by the analyze job are sealed bincode.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::binlog::{seal, unseal};
use super::bloom_filter::BloomFilter;
use crate::core::{CompactionError, DataType, FieldId, PrimaryKey, Result, ScalarValue, SegmentId};

/// Clustering-key descriptor of a buffer: key range or centroid set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    pub field_id: FieldId,
    pub data_type: DataType,
    #[serde(default)]
    pub min: Option<ScalarValue>,
    #[serde(default)]
    pub max: Option<ScalarValue>,
    #[serde(default)]
    pub centroids: Vec<Vec<f32>>,
}

impl FieldStats {
    pub fn new(field_id: FieldId, data_type: DataType) -> Self {
        Self {
            field_id,
            data_type,
            min: None,
            max: None,
            centroids: Vec::new(),
        }
    }

    /// Range over `keys`; empty input leaves min and max unset
    pub fn from_scalar_keys(field_id: FieldId, data_type: DataType, keys: &[ScalarValue]) -> Self {
        let mut stats = Self::new(field_id, data_type);
        for key in keys {
            stats.update_scalar(key);
        }
        stats
    }

    pub fn from_centroids(field_id: FieldId, data_type: DataType, centroids: Vec<Vec<f32>>) -> Self {
        Self {
            centroids,
            ..Self::new(field_id, data_type)
        }
    }

    pub fn update_scalar(&mut self, key: &ScalarValue) {
        if self.min.as_ref().map_or(true, |min| key < min) {
            self.min = Some(key.clone());
        }
        if self.max.as_ref().map_or(true, |max| key > max) {
            self.max = Some(key.clone());
        }
    }
}

/// Primary-key range and membership filter of one segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryKeyStats {
    pub field_id: FieldId,
    pub pk_type: DataType,
    pub min_pk: Option<PrimaryKey>,
    pub max_pk: Option<PrimaryKey>,
    pub bloom_filter: BloomFilter,
}

impl PrimaryKeyStats {
    pub fn new(field_id: FieldId, pk_type: DataType, row_count: usize) -> Self {
        Self {
            field_id,
            pk_type,
            min_pk: None,
            max_pk: None,
            bloom_filter: BloomFilter::for_primary_keys(row_count),
        }
    }

    pub fn update(&mut self, pk: &PrimaryKey) {
        if self.min_pk.as_ref().map_or(true, |min| pk < min) {
            self.min_pk = Some(pk.clone());
        }
        if self.max_pk.as_ref().map_or(true, |max| pk > max) {
            self.max_pk = Some(pk.clone());
        }
        self.bloom_filter.insert(pk);
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| CompactionError::Decode(format!("malformed pk stats: {}", e)))
    }
}

/// Text-relevance statistics of a sparse BM25 output field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bm25Stats {
    pub num_rows: i64,
    pub num_tokens: i64,
    /// token id -> number of rows containing it
    pub token_doc_freq: BTreeMap<u32, i64>,
}

impl Bm25Stats {
    pub fn append(&mut self, sparse: &[(u32, f32)]) {
        self.num_rows += 1;
        let mut row_tokens = 0f64;
        for (token, weight) in sparse {
            *self.token_doc_freq.entry(*token).or_insert(0) += 1;
            row_tokens += *weight as f64;
        }
        self.num_tokens += row_tokens as i64;
    }

    pub fn merge(&mut self, other: &Bm25Stats) {
        self.num_rows += other.num_rows;
        self.num_tokens += other.num_tokens;
        for (token, freq) in &other.token_doc_freq {
            *self.token_doc_freq.entry(*token).or_insert(0) += freq;
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| CompactionError::Decode(format!("malformed bm25 stats: {}", e)))
    }
}

/// Row count and clustering-key stats of one output segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentStats {
    pub field_stats: Vec<FieldStats>,
    pub num_rows: i64,
}

/// Versioned clustering layout of a partition, written once per run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionStatsSnapshot {
    pub version: i64,
    pub segment_stats: BTreeMap<SegmentId, SegmentStats>,
}

impl PartitionStatsSnapshot {
    pub fn new(version: i64) -> Self {
        Self {
            version,
            segment_stats: BTreeMap::new(),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| CompactionError::Decode(format!("malformed partition stats: {}", e)))
    }
}

/// Centroids trained by the analyze job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteringCentroidsStats {
    pub centroids: Vec<Vec<f32>>,
}

impl ClusteringCentroidsStats {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        seal(bincode::serialize(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        bincode::deserialize(&unseal(data)?)
            .map_err(|e| CompactionError::Decode(format!("malformed centroids file: {}", e)))
    }
}

/// Row offset -> centroid index for one analyzed segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentroidIdMappingStats {
    pub centroid_id_mapping: Vec<u32>,
}

impl CentroidIdMappingStats {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        seal(bincode::serialize(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        bincode::deserialize(&unseal(data)?)
            .map_err(|e| CompactionError::Decode(format!("malformed offset mapping: {}", e)))
    }
}
