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

//! Row source: decodes the column binlogs of a segment into rows

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::binlog::{decode_column, FieldBinlog};
use super::object_store::ObjectStore;
use crate::core::{
    CollectionSchema, CompactionError, FieldId, FieldValue, PrimaryKey, Result, Row,
    ROW_ID_FIELD, TIMESTAMP_FIELD,
};

/// Forward-only row iterator; `Ok(None)` is end of stream
pub trait RowReader: Send {
    fn next_row(&mut self) -> Result<Option<Row>>;
}

/// Which columns a reader must find in its blobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// Every schema field; nullable fields may be absent
    AllFields,
    /// Row id, timestamp and primary key only
    PrimaryKey,
}

/// Reads one chunk: binlog *i* of every field of a segment
pub struct BinlogRowReader {
    pk_field: FieldId,
    columns: BTreeMap<FieldId, std::vec::IntoIter<FieldValue>>,
    /// Decoded columns other than row id and timestamp, in field id order
    user_fields: Vec<FieldId>,
    absent_nullable: Vec<FieldId>,
    remaining: usize,
}

impl BinlogRowReader {
    pub fn new(schema: &CollectionSchema, blobs: &[Vec<u8>], projection: Projection) -> Result<Self> {
        let pk_field = schema
            .primary_field()
            .map(|f| f.field_id)
            .ok_or_else(|| CompactionError::IllegalPlan("schema has no primary key".to_string()))?;

        let mut decoded: HashMap<FieldId, Vec<FieldValue>> = HashMap::with_capacity(blobs.len());
        for blob in blobs {
            let column = decode_column(blob)?;
            decoded.insert(column.field_id, column.values);
        }

        let mut required = vec![ROW_ID_FIELD, TIMESTAMP_FIELD, pk_field];
        let mut absent_nullable = Vec::new();
        if projection == Projection::AllFields {
            for field in &schema.fields {
                if required.contains(&field.field_id) {
                    continue;
                }
                if decoded.contains_key(&field.field_id) {
                    required.push(field.field_id);
                } else if field.nullable {
                    absent_nullable.push(field.field_id);
                } else {
                    return Err(CompactionError::Decode(format!(
                        "column {} missing from segment chunk",
                        field.field_id
                    )));
                }
            }
        }

        let mut columns = BTreeMap::new();
        let mut remaining: Option<usize> = None;
        for field_id in required {
            let values = decoded.remove(&field_id).ok_or_else(|| {
                CompactionError::Decode(format!("column {} missing from segment chunk", field_id))
            })?;
            match remaining {
                None => remaining = Some(values.len()),
                Some(n) if n != values.len() => {
                    return Err(CompactionError::Decode(format!(
                        "column {} holds {} rows, expected {}",
                        field_id,
                        values.len(),
                        n
                    )))
                }
                _ => {}
            }
            columns.insert(field_id, values.into_iter());
        }

        let user_fields = columns
            .keys()
            .copied()
            .filter(|id| *id != ROW_ID_FIELD && *id != TIMESTAMP_FIELD)
            .collect();

        Ok(Self {
            pk_field,
            columns,
            user_fields,
            absent_nullable,
            remaining: remaining.unwrap_or(0),
        })
    }

    fn take(&mut self, field_id: FieldId) -> Result<FieldValue> {
        next_value(&mut self.columns, field_id)
    }
}

impl RowReader for BinlogRowReader {
    fn next_row(&mut self) -> Result<Option<Row>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;

        let row_id = match self.take(ROW_ID_FIELD)? {
            FieldValue::Int64(v) => v,
            other => {
                return Err(CompactionError::Decode(format!(
                    "row id must be Int64, got {:?}",
                    other
                )))
            }
        };
        let timestamp = match self.take(TIMESTAMP_FIELD)? {
            FieldValue::Int64(v) => v as u64,
            other => {
                return Err(CompactionError::Decode(format!(
                    "timestamp must be Int64, got {:?}",
                    other
                )))
            }
        };

        let mut fields = BTreeMap::new();
        for field_id in &self.user_fields {
            fields.insert(*field_id, next_value(&mut self.columns, *field_id)?);
        }
        for field_id in &self.absent_nullable {
            fields.insert(*field_id, FieldValue::Null);
        }

        let pk = fields
            .get(&self.pk_field)
            .and_then(PrimaryKey::from_field_value)
            .ok_or_else(|| {
                CompactionError::Decode(format!("row {} has no usable primary key", row_id))
            })?;

        Ok(Some(Row {
            row_id,
            timestamp,
            pk,
            fields,
        }))
    }
}

fn next_value(
    columns: &mut BTreeMap<FieldId, std::vec::IntoIter<FieldValue>>,
    field_id: FieldId,
) -> Result<FieldValue> {
    columns
        .get_mut(&field_id)
        .and_then(|it| it.next())
        .ok_or_else(|| CompactionError::Decode(format!("column {} ended early", field_id)))
}

/// Paths of every chunk of a segment; chunk *i* is binlog *i* of every field
pub fn segment_chunks(field_binlogs: &[FieldBinlog]) -> Result<Vec<Vec<String>>> {
    let binlog_num = field_binlogs
        .iter()
        .map(|f| f.binlogs.len())
        .find(|n| *n > 0)
        .unwrap_or(0);
    if binlog_num == 0 {
        return Err(CompactionError::IllegalPlan(
            "segment has no decodable field binlogs".to_string(),
        ));
    }

    let mut chunks = Vec::with_capacity(binlog_num);
    for idx in 0..binlog_num {
        let mut paths = Vec::with_capacity(field_binlogs.len());
        for field in field_binlogs {
            let binlog = field.binlogs.get(idx).ok_or_else(|| {
                CompactionError::IllegalPlan(format!(
                    "field {} has {} binlogs, expected {}",
                    field.field_id,
                    field.binlogs.len(),
                    binlog_num
                ))
            })?;
            paths.push(binlog.log_path.clone());
        }
        chunks.push(paths);
    }
    Ok(chunks)
}

/// Streams every row of a segment, downloading one chunk at a time
pub struct SegmentRowStream {
    store: Arc<dyn ObjectStore>,
    schema: Arc<CollectionSchema>,
    projection: Projection,
    chunks: std::vec::IntoIter<Vec<String>>,
    current: Option<BinlogRowReader>,
}

impl SegmentRowStream {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        schema: Arc<CollectionSchema>,
        field_binlogs: &[FieldBinlog],
        projection: Projection,
    ) -> Result<Self> {
        let chunks = segment_chunks(field_binlogs)?;
        Ok(Self {
            store,
            schema,
            projection,
            chunks: chunks.into_iter(),
            current: None,
        })
    }

    pub async fn next_row(&mut self) -> Result<Option<Row>> {
        loop {
            if let Some(reader) = self.current.as_mut() {
                if let Some(row) = reader.next_row()? {
                    return Ok(Some(row));
                }
                self.current = None;
            }
            let Some(paths) = self.chunks.next() else {
                return Ok(None);
            };
            let blobs = self.store.download(&paths).await?;
            self.current = Some(BinlogRowReader::new(&self.schema, &blobs, self.projection)?);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataType, FieldSchema};
    use crate::storage::binlog::{encode_column, Binlog};

    fn schema() -> CollectionSchema {
        CollectionSchema {
            name: "c".into(),
            fields: vec![
                FieldSchema::new(100, "pk", DataType::Int64).primary_key(),
                FieldSchema::new(101, "tag", DataType::VarChar).nullable(),
            ],
            functions: vec![],
        }
    }

    fn ints(field_id: FieldId, values: &[i64]) -> Vec<u8> {
        encode_column(
            field_id,
            DataType::Int64,
            values.iter().map(|v| FieldValue::Int64(*v)).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_reads_rows_and_fills_absent_nullable() {
        let blobs = vec![ints(0, &[1, 2]), ints(1, &[10, 20]), ints(100, &[7, 8])];
        let mut reader = BinlogRowReader::new(&schema(), &blobs, Projection::AllFields).unwrap();

        let first = reader.next_row().unwrap().unwrap();
        assert_eq!(first.row_id, 1);
        assert_eq!(first.timestamp, 10);
        assert_eq!(first.pk, PrimaryKey::Int64(7));
        assert_eq!(first.get(101), Some(&FieldValue::Null));
        assert!(reader.next_row().unwrap().is_some());
        assert!(reader.next_row().unwrap().is_none());
    }

    #[test]
    fn test_every_row_carries_the_same_user_fields() {
        let tags = encode_column(
            101,
            DataType::VarChar,
            (0..4).map(|i| FieldValue::VarChar(format!("t{}", i))).collect(),
        )
        .unwrap();
        let blobs = vec![
            ints(0, &[1, 2, 3, 4]),
            ints(1, &[10, 20, 30, 40]),
            ints(100, &[7, 8, 9, 10]),
            tags,
        ];
        let mut reader = BinlogRowReader::new(&schema(), &blobs, Projection::AllFields).unwrap();

        let mut seen = 0;
        while let Some(row) = reader.next_row().unwrap() {
            assert_eq!(row.fields.keys().copied().collect::<Vec<_>>(), vec![100, 101]);
            assert_eq!(row.get(101), Some(&FieldValue::VarChar(format!("t{}", seen))));
            seen += 1;
        }
        assert_eq!(seen, 4);

        let mut pk_only = BinlogRowReader::new(&schema(), &blobs, Projection::PrimaryKey).unwrap();
        let row = pk_only.next_row().unwrap().unwrap();
        assert_eq!(row.fields.keys().copied().collect::<Vec<_>>(), vec![100]);
    }

    #[test]
    fn test_ragged_columns_rejected() {
        let blobs = vec![ints(0, &[1, 2]), ints(1, &[10]), ints(100, &[7, 8])];
        let result = BinlogRowReader::new(&schema(), &blobs, Projection::PrimaryKey);
        assert!(matches!(result, Err(CompactionError::Decode(_))));
    }

    #[test]
    fn test_segment_without_binlogs_is_illegal() {
        let empty = vec![FieldBinlog::new(100)];
        assert!(matches!(
            segment_chunks(&empty),
            Err(CompactionError::IllegalPlan(_))
        ));

        let log = |p: &str| Binlog {
            entries_num: 1,
            timestamp_from: 0,
            timestamp_to: 0,
            log_path: p.to_string(),
            log_size: 0,
            log_id: 0,
            memory_size: 0,
        };
        let fields = vec![
            FieldBinlog {
                field_id: 0,
                binlogs: vec![log("a0"), log("a1")],
            },
            FieldBinlog {
                field_id: 1,
                binlogs: vec![log("b0"), log("b1")],
            },
        ];
        let chunks = segment_chunks(&fields).unwrap();
        assert_eq!(chunks, vec![vec!["a0", "b0"], vec!["a1", "b1"]]);
    }
}
