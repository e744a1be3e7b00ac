pub mod allocation;
pub mod aperture;
pub mod buffer_object;
pub mod context;
pub mod handle;
pub mod manager;
pub mod retry;

/// Tiles (sub-devices) a single root device can expose.
pub const MAX_TILES: usize = 4;

/// Execution-context slots in every bind table.
pub const MAX_OS_CONTEXTS: usize = 64;

pub use allocation::{AllocationType, DrmAllocation, MemoryPool, ResidencyState, StorageInfo};
pub use buffer_object::{BufferObject, CachePolicy};
pub use context::{DeviceBitfield, Engine, OsContext, TaskCountEngine, WaitStatus};
pub use handle::BoHandleWrapper;
pub use manager::{AllocationProperties, DrmMemoryManager};
pub use retry::{EvictUnused, RetryStage, submit_with_eviction_retry};
