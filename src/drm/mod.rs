//! Kernel-facing layer: typed ioctl arguments, the render-node device, and the
//! [`DrmInterface`] seam the residency core talks through.

pub mod device;
pub mod ioctl;

#[cfg(test)]
pub(crate) mod mock;

use crate::drm::ioctl::{GemExecObject2, VmBindArgs};
use std::fmt;
use std::io;
use std::os::fd::RawFd;

/// Per-submission parameters that are not part of the object list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecBufferParams {
    /// Bytes of the batch buffer actually used.
    pub batch_len: u32,
    pub batch_start_offset: u32,
    /// Engine selection and `I915_EXEC_*` flags.
    pub flags: u64,
    pub drm_context_id: u32,
}

/// Operations the residency core needs from the kernel driver.
///
/// Every method reports the raw `io::Error` so callers can classify the errno
/// with [`crate::error::DrmError::from_errno`].
pub trait DrmInterface: Send + Sync + fmt::Debug {
    /// Create a GEM object of `size` bytes and return its handle.
    fn gem_create(&self, size: u64) -> io::Result<u32>;

    /// Wrap existing host memory in a GEM object.
    fn gem_userptr(&self, address: u64, size: u64) -> io::Result<u32>;

    fn gem_close(&self, handle: u32) -> io::Result<()>;

    fn gem_set_tiling(&self, handle: u32, tiling_mode: u32, stride: u32) -> io::Result<()>;

    /// Block until the GPU is done with `handle` or `timeout_ns` elapses (`-1` waits forever).
    fn gem_wait(&self, handle: u32, timeout_ns: i64) -> io::Result<()>;

    /// Submit a batch. The last entry of `objects` is the batch buffer.
    fn exec(&self, objects: &mut [GemExecObject2], params: &ExecBufferParams) -> io::Result<()>;

    fn vm_bind(&self, args: &VmBindArgs) -> io::Result<()>;

    fn vm_unbind(&self, args: &VmBindArgs) -> io::Result<()>;

    /// Convert a GEM handle into a file descriptor that can cross process boundaries.
    fn handle_to_prime_fd(&self, handle: u32) -> io::Result<RawFd>;

    /// Resolve a PRIME descriptor into a GEM handle in this process' namespace.
    fn prime_fd_to_handle(&self, fd: RawFd) -> io::Result<u32>;

    fn close_prime_fd(&self, fd: RawFd) -> io::Result<()>;

    /// Whether every bind is an explicit page-table operation.
    fn is_vm_bind_available(&self) -> bool;
}
