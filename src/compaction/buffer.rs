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

//! Cluster buffers: one accumulating segment writer per cluster
//!
//! Each buffer owns a single-writer slot guarded by its own lock. Rotation
//! swaps a fresh writer into the slot and hands the retired one out for
//! flushing, so producers keep writing while the old data is persisted.
//!
//! Memory is tracked per buffer with two atomics: bytes held by the active
//! writer, and bytes of retired writers whose flush has not finished yet.
//! Their sum over all buffers is the aggregate the watermarks act on.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use super::plan::CompactionSegment;
use crate::core::{CollectionSchema, CompactionError, FieldId, Result, Row, SegmentId};
use crate::storage::{Bm25Stats, FieldBinlog, FieldStats, IdAllocator, SegmentStats, SegmentWriter};

/// Builds writers for every buffer of a run
pub struct WriterFactory {
    schema: Arc<CollectionSchema>,
    bm25_fields: Vec<FieldId>,
    binlog_max_size: u64,
    max_segment_rows: i64,
    segment_allocator: Arc<dyn IdAllocator>,
}

impl WriterFactory {
    pub fn new(
        schema: Arc<CollectionSchema>,
        bm25_fields: Vec<FieldId>,
        binlog_max_size: u64,
        max_segment_rows: i64,
        segment_allocator: Arc<dyn IdAllocator>,
    ) -> Self {
        Self {
            schema,
            bm25_fields,
            binlog_max_size,
            max_segment_rows,
            segment_allocator,
        }
    }

    pub fn max_segment_rows(&self) -> i64 {
        self.max_segment_rows
    }

    fn writer(&self, segment_id: SegmentId) -> SegmentWriter {
        SegmentWriter::new(segment_id, &self.schema, &self.bm25_fields, self.binlog_max_size)
    }
}

/// A writer taken out of its slot, waiting to be flushed
#[derive(Debug)]
pub struct RetiredWriter {
    pub buffer_id: usize,
    pub writer: SegmentWriter,
    /// Flush must finalize the writer's segment afterwards
    pub pack: bool,
}

#[derive(Debug, Default)]
struct WriterSlot {
    writer: Option<SegmentWriter>,
    current_segment_rows: i64,
}

/// Durable-but-unpacked data of a buffer and its packed output
#[derive(Debug, Default)]
pub struct FlushedState {
    pub binlogs: HashMap<SegmentId, BTreeMap<FieldId, FieldBinlog>>,
    pub row_num: HashMap<SegmentId, i64>,
    pub bm25_stats: HashMap<SegmentId, HashMap<FieldId, Bm25Stats>>,
    pub uploaded_segments: Vec<CompactionSegment>,
    pub uploaded_segment_stats: HashMap<SegmentId, SegmentStats>,
}

impl FlushedState {
    /// Segments flushed but never packed
    pub fn leaked_segments(&self) -> Vec<SegmentId> {
        let mut leaked: Vec<SegmentId> = self
            .binlogs
            .iter()
            .filter(|(_, fields)| !fields.is_empty())
            .map(|(segment_id, _)| *segment_id)
            .collect();
        leaked.sort_unstable();
        leaked
    }
}

pub struct ClusterBuffer {
    id: usize,
    slot: Mutex<WriterSlot>,
    active_memory: AtomicU64,
    retired_memory: AtomicI64,
    /// Held for the whole of a flush; serializes flushes of this buffer
    pub(crate) flushed: tokio::sync::Mutex<FlushedState>,
    key_stats: FieldStats,
}

impl ClusterBuffer {
    fn new(id: usize, key_stats: FieldStats, factory: &WriterFactory) -> Result<Self> {
        let buffer = Self {
            id,
            slot: Mutex::new(WriterSlot::default()),
            active_memory: AtomicU64::new(0),
            retired_memory: AtomicI64::new(0),
            flushed: tokio::sync::Mutex::new(FlushedState::default()),
            key_stats,
        };
        // First writer always opens a new segment
        {
            let mut slot = buffer.slot.lock();
            buffer.refresh_writer(&mut slot, factory, true)?;
        }
        Ok(buffer)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Clustering-key stats of everything routed here
    pub fn key_stats(&self) -> &FieldStats {
        &self.key_stats
    }

    /// Active writer bytes plus retired-but-unflushed bytes
    pub fn memory_size(&self) -> u64 {
        let retired = self.retired_memory.load(Ordering::Acquire).max(0) as u64;
        self.active_memory.load(Ordering::Acquire) + retired
    }

    pub fn row_count(&self) -> i64 {
        self.slot
            .lock()
            .writer
            .as_ref()
            .map(SegmentWriter::row_count)
            .unwrap_or(0)
    }

    pub fn current_segment_rows(&self) -> i64 {
        self.slot.lock().current_segment_rows
    }

    pub fn current_segment_id(&self) -> Option<SegmentId> {
        self.slot.lock().writer.as_ref().map(SegmentWriter::segment_id)
    }

    fn write(&self, row: &Row) -> Result<()> {
        let mut slot = self.slot.lock();
        let writer = slot.writer.as_mut().ok_or_else(|| {
            CompactionError::Internal(format!("buffer {} has no active writer", self.id))
        })?;
        writer.write(row)?;
        self.active_memory
            .store(writer.written_memory_size(), Ordering::Release);
        slot.current_segment_rows += 1;
        Ok(())
    }

    fn needs_rotation(slot: &WriterSlot, max_segment_rows: i64) -> bool {
        slot.current_segment_rows > max_segment_rows
            || slot.writer.as_ref().map_or(false, SegmentWriter::is_full)
    }

    /// Swap in a new writer and return the old one.
    ///
    /// A new segment id is allocated when the slot is empty, when forced, or
    /// when the current segment passed the row limit; the returned flag says so.
    fn refresh_writer(
        &self,
        slot: &mut WriterSlot,
        factory: &WriterFactory,
        force_new_segment: bool,
    ) -> Result<(Option<SegmentWriter>, bool)> {
        let pack = force_new_segment
            || slot.writer.is_none()
            || slot.current_segment_rows > factory.max_segment_rows;

        let segment_id = match (&slot.writer, pack) {
            (Some(writer), false) => writer.segment_id(),
            _ => factory.segment_allocator.alloc_one()?,
        };

        let old = slot.writer.replace(factory.writer(segment_id));
        if let Some(writer) = &old {
            self.retired_memory
                .fetch_add(writer.written_memory_size() as i64, Ordering::AcqRel);
        }
        self.active_memory.store(0, Ordering::Release);
        if pack {
            slot.current_segment_rows = 0;
        }
        Ok((old, pack))
    }

    /// Bytes of a retired writer are durable now
    pub(crate) fn release_retired(&self, bytes: u64) {
        self.retired_memory
            .fetch_sub(bytes as i64, Ordering::AcqRel);
    }
}

/// All cluster buffers of one run
pub struct BufferPool {
    buffers: Vec<ClusterBuffer>,
    factory: WriterFactory,
    written_rows: AtomicI64,
}

impl BufferPool {
    /// One buffer per stats entry, ids assigned by position
    pub fn new(factory: WriterFactory, key_stats: Vec<FieldStats>) -> Result<Self> {
        let buffers = key_stats
            .into_iter()
            .enumerate()
            .map(|(id, stats)| ClusterBuffer::new(id, stats, &factory))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            buffers,
            factory,
            written_rows: AtomicI64::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffers(&self) -> &[ClusterBuffer] {
        &self.buffers
    }

    pub fn buffer(&self, id: usize) -> Result<&ClusterBuffer> {
        self.buffers
            .get(id)
            .ok_or_else(|| CompactionError::Internal(format!("unknown cluster buffer {}", id)))
    }

    pub fn max_segment_rows(&self) -> i64 {
        self.factory.max_segment_rows
    }

    /// Aggregate buffered memory, read without taking buffer locks
    pub fn total_memory(&self) -> u64 {
        self.buffers.iter().map(ClusterBuffer::memory_size).sum()
    }

    pub fn written_rows(&self) -> i64 {
        self.written_rows.load(Ordering::Relaxed)
    }

    pub fn write(&self, buffer_id: usize, row: &Row) -> Result<()> {
        self.buffer(buffer_id)?.write(row)?;
        self.written_rows.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Cheap check before [`Self::rotate_if_full`], which re-checks under the lock
    pub fn needs_rotation(&self, buffer_id: usize) -> Result<bool> {
        let buffer = self.buffer(buffer_id)?;
        let slot = buffer.slot.lock();
        Ok(ClusterBuffer::needs_rotation(&slot, self.factory.max_segment_rows))
    }

    /// Rotate the buffer's writer if it reached its row or byte limit
    pub fn rotate_if_full(&self, buffer_id: usize) -> Result<Option<RetiredWriter>> {
        let buffer = self.buffer(buffer_id)?;
        let mut slot = buffer.slot.lock();
        if !ClusterBuffer::needs_rotation(&slot, self.factory.max_segment_rows) {
            return Ok(None);
        }
        let (old, pack) = buffer.refresh_writer(&mut slot, &self.factory, false)?;
        Ok(old.map(|writer| RetiredWriter {
            buffer_id,
            writer,
            pack,
        }))
    }

    /// Retire the writer into the same segment, for memory-pressure flushes
    pub fn retire(&self, buffer_id: usize) -> Result<Option<RetiredWriter>> {
        let buffer = self.buffer(buffer_id)?;
        let mut slot = buffer.slot.lock();
        let Some(segment_id) = slot.writer.as_ref().map(SegmentWriter::segment_id) else {
            return Ok(None);
        };
        let old = slot
            .writer
            .replace(self.factory.writer(segment_id))
            .map(|writer| {
                buffer
                    .retired_memory
                    .fetch_add(writer.written_memory_size() as i64, Ordering::AcqRel);
                writer
            });
        buffer.active_memory.store(0, Ordering::Release);
        Ok(old.map(|writer| RetiredWriter {
            buffer_id,
            writer,
            pack: false,
        }))
    }

    /// Take the writer out without replacement, for the final flush
    pub fn take_writer(&self, buffer_id: usize) -> Result<Option<RetiredWriter>> {
        let buffer = self.buffer(buffer_id)?;
        let mut slot = buffer.slot.lock();
        let old = slot.writer.take();
        if let Some(writer) = &old {
            buffer
                .retired_memory
                .fetch_add(writer.written_memory_size() as i64, Ordering::AcqRel);
        }
        buffer.active_memory.store(0, Ordering::Release);
        Ok(old.map(|writer| RetiredWriter {
            buffer_id,
            writer,
            pack: true,
        }))
    }

    /// (buffer id, active writer rows), largest first
    pub fn ids_by_row_count_desc(&self) -> Vec<(usize, i64)> {
        let mut counts: Vec<(usize, i64)> = self
            .buffers
            .iter()
            .map(|b| (b.id, b.row_count()))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1));
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataType, FieldSchema, FieldValue, PrimaryKey};
    use crate::storage::LocalAllocator;

    fn schema() -> Arc<CollectionSchema> {
        Arc::new(CollectionSchema {
            name: "c".into(),
            fields: vec![
                FieldSchema::new(100, "pk", DataType::Int64).primary_key(),
                FieldSchema::new(101, "age", DataType::Int64),
            ],
            functions: vec![],
        })
    }

    fn row(pk: i64) -> Row {
        let mut fields = BTreeMap::new();
        fields.insert(100, FieldValue::Int64(pk));
        fields.insert(101, FieldValue::Int64(pk % 7));
        Row {
            row_id: pk,
            timestamp: 1,
            pk: PrimaryKey::Int64(pk),
            fields,
        }
    }

    fn pool(buffers: usize, max_rows: i64, binlog_max_size: u64) -> BufferPool {
        let factory = WriterFactory::new(
            schema(),
            vec![],
            binlog_max_size,
            max_rows,
            Arc::new(LocalAllocator::new("segment", 1000, 2000)),
        );
        let stats = (0..buffers)
            .map(|_| FieldStats::new(101, DataType::Int64))
            .collect();
        BufferPool::new(factory, stats).unwrap()
    }

    #[test]
    fn test_each_buffer_opens_its_own_segment() {
        let pool = pool(3, 10, 1 << 20);
        let ids: Vec<_> = pool
            .buffers()
            .iter()
            .map(|b| b.current_segment_id().unwrap())
            .collect();
        assert_eq!(ids, vec![1000, 1001, 1002]);
    }

    #[test]
    fn test_rotation_past_row_limit_packs_into_new_segment() {
        let pool = pool(1, 2, 1 << 20);
        for pk in 0..3 {
            pool.write(0, &row(pk)).unwrap();
        }
        assert!(pool.needs_rotation(0).unwrap());
        let memory_before = pool.total_memory();

        let retired = pool.rotate_if_full(0).unwrap().unwrap();
        assert!(retired.pack);
        assert_eq!(retired.writer.segment_id(), 1000);
        assert_eq!(retired.writer.row_count(), 3);
        assert_eq!(pool.buffer(0).unwrap().current_segment_id(), Some(1001));
        assert_eq!(pool.buffer(0).unwrap().current_segment_rows(), 0);
        // retired bytes still count until the flush releases them
        assert_eq!(pool.total_memory(), memory_before);

        pool.buffer(0)
            .unwrap()
            .release_retired(retired.writer.written_memory_size());
        assert_eq!(pool.total_memory(), 0);
        assert_eq!(pool.written_rows(), 3);
    }

    #[test]
    fn test_byte_limit_flushes_into_same_segment() {
        let pool = pool(1, 100, 32);
        pool.write(0, &row(1)).unwrap();
        let retired = pool.rotate_if_full(0).unwrap().unwrap();
        assert!(!retired.pack);
        assert_eq!(pool.buffer(0).unwrap().current_segment_id(), Some(1000));
        // row counter for the segment survives a same-segment rotation
        assert_eq!(pool.buffer(0).unwrap().current_segment_rows(), 1);
    }

    #[test]
    fn test_no_rotation_below_limits() {
        let pool = pool(1, 100, 1 << 20);
        pool.write(0, &row(1)).unwrap();
        assert!(pool.rotate_if_full(0).unwrap().is_none());
    }

    #[test]
    fn test_largest_first_and_take_writer() {
        let pool = pool(2, 100, 1 << 20);
        pool.write(1, &row(1)).unwrap();
        pool.write(1, &row(2)).unwrap();
        pool.write(0, &row(3)).unwrap();
        assert_eq!(pool.ids_by_row_count_desc(), vec![(1, 2), (0, 1)]);

        let retired = pool.retire(1).unwrap().unwrap();
        assert!(!retired.pack);
        assert_eq!(pool.buffer(1).unwrap().current_segment_id(), Some(1001));

        let taken = pool.take_writer(0).unwrap().unwrap();
        assert!(taken.pack);
        assert!(pool.buffer(0).unwrap().current_segment_id().is_none());
        assert!(pool.write(0, &row(4)).is_err());
    }

    #[test]
    fn test_allocator_exhaustion_surfaces() {
        let factory = WriterFactory::new(
            schema(),
            vec![],
            1 << 20,
            10,
            Arc::new(LocalAllocator::new("segment", 0, 1)),
        );
        let stats = vec![
            FieldStats::new(101, DataType::Int64),
            FieldStats::new(101, DataType::Int64),
        ];
        assert!(matches!(
            BufferPool::new(factory, stats),
            Err(CompactionError::AllocatorExhausted(_))
        ));
    }
}
