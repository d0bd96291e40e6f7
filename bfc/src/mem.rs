mod alloc_utils;
mod allocator;
mod bin;
mod chunk;
mod dump;
mod region;
mod retry;
mod stats;

pub use alloc_utils::MIN_ALLOCATION_SIZE;
pub use allocator::{AllocationAttributes, BfcAllocator, RegionVisitor};
pub use stats::AllocatorStats;
