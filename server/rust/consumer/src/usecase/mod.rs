pub mod consume_batches;
pub mod process_batch;

pub use consume_batches::ConsumeBatchesUseCase;
pub use process_batch::{BatchReport, PartitionState, ProcessBatchUseCase};
