pub mod analyze;
pub mod assignment;
pub mod buffer;
pub mod context;
pub mod flush;
pub mod mapping;
pub mod packer;
pub mod plan;
pub mod pool;
pub mod task;
pub mod watermark;

pub use analyze::AnalyzeResult;
pub use assignment::{ClusterAssignment, ScalarPlanParams};
pub use buffer::{BufferPool, ClusterBuffer, RetiredWriter};
pub use flush::{FlushScheduler, FlushSignal, Flusher};
pub use mapping::MappingStats;
pub use plan::{
    CompactionPlan, CompactionPlanResult, CompactionSegment, CompactionSegmentBinlogs,
    CompactionTaskState, CompactionType, IdRange,
};
pub use task::ClusteringCompactionTask;
pub use watermark::MemoryWatermark;
