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

//! Core types shared by the storage collaborators and the compaction engine
//!
//! Rows flowing through compaction are schema-driven: every user field is a
//! [`FieldValue`], and the clustering key of a scalar field is projected into a
//! [`ScalarValue`] which carries a total, field-type-aware ordering.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

pub type UniqueId = i64;
pub type CollectionId = UniqueId;
pub type PartitionId = UniqueId;
pub type SegmentId = UniqueId;
pub type FieldId = UniqueId;
pub type PlanId = UniqueId;

/// System field holding the row id of every entity
pub const ROW_ID_FIELD: FieldId = 0;
/// System field holding the hybrid timestamp of every entity
pub const TIMESTAMP_FIELD: FieldId = 1;
/// User-defined fields start at this id
pub const START_OF_USER_FIELD_ID: FieldId = 100;

/// Number of logical bits in a hybrid timestamp
pub const LOGICAL_BITS: u32 = 18;
const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// Compose a hybrid timestamp from physical milliseconds and a logical counter
pub fn compose_ts(physical_ms: i64, logical: i64) -> u64 {
    ((physical_ms as u64) << LOGICAL_BITS) | (logical as u64 & LOGICAL_MASK)
}

/// Split a hybrid timestamp into (physical milliseconds, logical counter)
pub fn parse_ts(ts: u64) -> (i64, i64) {
    ((ts >> LOGICAL_BITS) as i64, (ts & LOGICAL_MASK) as i64)
}

/// Field data types supported by segment binlogs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
    VarChar,
    FloatVector,
    SparseFloatVector,
}

impl DataType {
    pub fn is_vector(&self) -> bool {
        matches!(self, DataType::FloatVector | DataType::SparseFloatVector)
    }

    /// Types allowed for a primary key
    pub fn is_primary_key_type(&self) -> bool {
        matches!(self, DataType::Int64 | DataType::VarChar)
    }
}

/// Schema of a single field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub field_id: FieldId,
    pub name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub dim: Option<usize>,
}

impl FieldSchema {
    pub fn new(field_id: FieldId, name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            field_id,
            name: name.into(),
            data_type,
            is_primary_key: false,
            nullable: false,
            dim: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_dim(mut self, dim: usize) -> Self {
        self.dim = Some(dim);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionType {
    /// Text relevance: a VarChar input is tokenized into a sparse vector output
    Bm25,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSchema {
    pub name: String,
    pub function_type: FunctionType,
    pub input_field_ids: Vec<FieldId>,
    pub output_field_ids: Vec<FieldId>,
}

/// Collection schema carried by a compaction plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    pub fields: Vec<FieldSchema>,
    #[serde(default)]
    pub functions: Vec<FunctionSchema>,
}

impl CollectionSchema {
    pub fn field(&self, field_id: FieldId) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.field_id == field_id)
    }

    /// The primary key must be a user field of a primary-key capable type
    pub fn primary_field(&self) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| {
            f.is_primary_key
                && f.field_id >= START_OF_USER_FIELD_ID
                && f.data_type.is_primary_key_type()
        })
    }

    /// Output fields of BM25 functions; their writers accumulate relevance stats
    pub fn bm25_output_fields(&self) -> Vec<FieldId> {
        self.functions
            .iter()
            .filter(|f| f.function_type == FunctionType::Bm25)
            .filter_map(|f| f.output_field_ids.first().copied())
            .collect()
    }

    /// Every column persisted for a segment: system fields first, then user fields
    pub fn column_ids(&self) -> Vec<FieldId> {
        let mut ids = vec![ROW_ID_FIELD, TIMESTAMP_FIELD];
        ids.extend(
            self.fields
                .iter()
                .map(|f| f.field_id)
                .filter(|id| *id != ROW_ID_FIELD && *id != TIMESTAMP_FIELD),
        );
        ids
    }
}

/// Primary key value of an entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrimaryKey {
    Int64(i64),
    VarChar(String),
}

impl PrimaryKey {
    pub fn from_field_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Int64(v) => Some(PrimaryKey::Int64(*v)),
            FieldValue::VarChar(v) => Some(PrimaryKey::VarChar(v.clone())),
            _ => None,
        }
    }
}

/// A single cell of a row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    VarChar(String),
    FloatVector(Vec<f32>),
    /// (token/dimension index, weight) pairs
    SparseFloatVector(Vec<(u32, f32)>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Approximate in-memory footprint, used for buffer accounting
    pub fn memory_size(&self) -> usize {
        match self {
            FieldValue::Null => 1,
            FieldValue::Bool(_) | FieldValue::Int8(_) => 1,
            FieldValue::Int16(_) => 2,
            FieldValue::Int32(_) | FieldValue::Float(_) => 4,
            FieldValue::Int64(_) | FieldValue::Double(_) => 8,
            FieldValue::VarChar(s) => s.len() + 16,
            FieldValue::FloatVector(v) => v.len() * 4 + 16,
            FieldValue::SparseFloatVector(v) => v.len() * 8 + 16,
        }
    }

    /// Project onto the scalar clustering key domain.
    ///
    /// `Ok(None)` is a null key; vectors are not scalar keys.
    pub fn to_scalar(&self) -> Result<Option<ScalarValue>, DataType> {
        Ok(Some(match self {
            FieldValue::Null => return Ok(None),
            FieldValue::Bool(v) => ScalarValue::Bool(*v),
            FieldValue::Int8(v) => ScalarValue::Int8(*v),
            FieldValue::Int16(v) => ScalarValue::Int16(*v),
            FieldValue::Int32(v) => ScalarValue::Int32(*v),
            FieldValue::Int64(v) => ScalarValue::Int64(*v),
            FieldValue::Float(v) => ScalarValue::Float(*v),
            FieldValue::Double(v) => ScalarValue::Double(*v),
            FieldValue::VarChar(v) => ScalarValue::VarChar(v.clone()),
            FieldValue::FloatVector(_) => return Err(DataType::FloatVector),
            FieldValue::SparseFloatVector(_) => return Err(DataType::SparseFloatVector),
        }))
    }
}

/// Scalar clustering key.
///
/// Ordering is total within a type (floats use IEEE total order), so keys can
/// be sorted and hashed without runtime type assertions. Values of different
/// types never meet inside one clustering field; they order by type rank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScalarValue {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    VarChar(String),
}

impl ScalarValue {
    fn rank(&self) -> u8 {
        match self {
            ScalarValue::Bool(_) => 0,
            ScalarValue::Int8(_) => 1,
            ScalarValue::Int16(_) => 2,
            ScalarValue::Int32(_) => 3,
            ScalarValue::Int64(_) => 4,
            ScalarValue::Float(_) => 5,
            ScalarValue::Double(_) => 6,
            ScalarValue::VarChar(_) => 7,
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            ScalarValue::Bool(_) => DataType::Bool,
            ScalarValue::Int8(_) => DataType::Int8,
            ScalarValue::Int16(_) => DataType::Int16,
            ScalarValue::Int32(_) => DataType::Int32,
            ScalarValue::Int64(_) => DataType::Int64,
            ScalarValue::Float(_) => DataType::Float,
            ScalarValue::Double(_) => DataType::Double,
            ScalarValue::VarChar(_) => DataType::VarChar,
        }
    }
}

impl Ord for ScalarValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use ScalarValue::*;
        match (self, other) {
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int8(a), Int8(b)) => a.cmp(b),
            (Int16(a), Int16(b)) => a.cmp(b),
            (Int32(a), Int32(b)) => a.cmp(b),
            (Int64(a), Int64(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Double(a), Double(b)) => a.total_cmp(b),
            (VarChar(a), VarChar(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for ScalarValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScalarValue {}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            ScalarValue::Bool(v) => v.hash(state),
            ScalarValue::Int8(v) => v.hash(state),
            ScalarValue::Int16(v) => v.hash(state),
            ScalarValue::Int32(v) => v.hash(state),
            ScalarValue::Int64(v) => v.hash(state),
            // total_cmp equality is bit equality
            ScalarValue::Float(v) => v.to_bits().hash(state),
            ScalarValue::Double(v) => v.to_bits().hash(state),
            ScalarValue::VarChar(v) => v.hash(state),
        }
    }
}

impl From<ScalarValue> for FieldValue {
    fn from(value: ScalarValue) -> Self {
        match value {
            ScalarValue::Bool(v) => FieldValue::Bool(v),
            ScalarValue::Int8(v) => FieldValue::Int8(v),
            ScalarValue::Int16(v) => FieldValue::Int16(v),
            ScalarValue::Int32(v) => FieldValue::Int32(v),
            ScalarValue::Int64(v) => FieldValue::Int64(v),
            ScalarValue::Float(v) => FieldValue::Float(v),
            ScalarValue::Double(v) => FieldValue::Double(v),
            ScalarValue::VarChar(v) => FieldValue::VarChar(v),
        }
    }
}

/// A decoded entity: system columns plus user fields keyed by field id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub row_id: i64,
    pub timestamp: u64,
    pub pk: PrimaryKey,
    pub fields: BTreeMap<FieldId, FieldValue>,
}

impl Row {
    pub fn get(&self, field_id: FieldId) -> Option<&FieldValue> {
        self.fields.get(&field_id)
    }

    /// Value of a column including the system fields
    pub fn column_value(&self, field_id: FieldId) -> FieldValue {
        match field_id {
            ROW_ID_FIELD => FieldValue::Int64(self.row_id),
            TIMESTAMP_FIELD => FieldValue::Int64(self.timestamp as i64),
            _ => self.fields.get(&field_id).cloned().unwrap_or(FieldValue::Null),
        }
    }

    pub fn memory_size(&self) -> usize {
        16 + self.fields.values().map(FieldValue::memory_size).sum::<usize>()
    }
}
