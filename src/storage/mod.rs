pub mod allocator;
pub mod binlog;
pub mod bloom_filter;
pub mod delta;
pub mod entity_filter;
pub mod object_store;
pub mod row_reader;
pub mod segment_writer;
pub mod stats;

pub use allocator::{IdAllocator, LocalAllocator};
pub use binlog::{Binlog, FieldBinlog};
pub use delta::{compose_delete_from_deltalogs, DeleteRecord};
pub use entity_filter::EntityFilter;
pub use object_store::{LocalObjectStore, MemoryObjectStore, ObjectStore};
pub use row_reader::{BinlogRowReader, Projection, RowReader, SegmentRowStream};
pub use segment_writer::{BinlogLocation, SealedBinlogs, SegmentWriter};
pub use stats::{
    Bm25Stats, CentroidIdMappingStats, ClusteringCentroidsStats, FieldStats,
    PartitionStatsSnapshot, PrimaryKeyStats, SegmentStats,
};
