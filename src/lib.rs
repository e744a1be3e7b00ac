//! GPU memory residency for DRM render nodes.
//!
//! Tracks which allocations are resident in which execution context, binds
//! and evicts them through the kernel, and reclaims unused memory when a
//! submission runs out of space.

pub mod config;
pub mod drm;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod memory;
pub mod residency;

pub use config::{ResidencyConfig, VmBindMode};
pub use drm::device::DrmDevice;
pub use drm::{DrmInterface, ExecBufferParams};
pub use error::{DrmError, DrmResult, MemoryOperationsStatus};
pub use ipc::{ImportFlags, IpcDescriptor, IpcExchange, IpcMemoryType};
pub use memory::{
    AllocationProperties, AllocationType, DeviceBitfield, DrmAllocation, DrmMemoryManager,
    MemoryPool, OsContext, ResidencyState, TaskCountEngine,
};
pub use residency::{MemoryOperationsHandler, SubmissionKind};
