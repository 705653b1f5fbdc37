pub mod engine;
pub mod zchunk;

pub use engine::{RangeRequest, RangeState, TransferEngine, RANGE_BATCH_SIZES};
