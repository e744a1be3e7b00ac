use crate::drm::ioctl::{
    EXEC_OBJECT_ASYNC, EXEC_OBJECT_CAPTURE, EXEC_OBJECT_PINNED, EXEC_OBJECT_SUPPORTS_48B_ADDRESS,
    GemExecObject2, I915_GEM_VM_BIND_CAPTURE, I915_GEM_VM_BIND_IMMEDIATE, I915_TILING_NONE,
    VmBindArgs,
};
use crate::drm::{DrmInterface, ExecBufferParams};
use crate::error::{DrmError, DrmResult};
use crate::memory::aperture::decanonize;
use crate::memory::context::{DeviceBitfield, OsContext};
use crate::memory::handle::BoHandleWrapper;
use crate::memory::retry::{EvictUnused, submit_with_eviction_retry};
use crate::memory::{MAX_OS_CONTEXTS, MAX_TILES};
use parking_lot::Mutex;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::{debug, error, trace};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CachePolicy {
    #[default]
    WriteBack,
    WriteCombined,
    Uncached,
}

impl CachePolicy {
    /// Page attribute table index used when binding.
    #[must_use]
    pub const fn pat_index(self) -> u16 {
        match self {
            Self::WriteBack => 0,
            Self::WriteCombined => 1,
            Self::Uncached => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CacheAttributes {
    policy: CachePolicy,
    region: u16,
}

/// One independently bindable chunk of GPU memory backed by a single kernel handle.
///
/// Bind state is a fixed table: one row per context slot, one bit per tile.
/// Callers serialize binds through the residency handler's lock, so two
/// threads never issue the kernel bind for the same cell.
pub struct BufferObject {
    drm: Arc<dyn DrmInterface>,
    handle: BoHandleWrapper,
    size: u64,
    gpu_address: AtomicU64,
    tiling_mode: AtomicU32,
    cache: Mutex<CacheAttributes>,
    capture: AtomicBool,
    async_exec: AtomicBool,
    bind_info: [AtomicU32; MAX_OS_CONTEXTS],
    closed: AtomicBool,
}

impl fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferObject")
            .field("handle", &self.handle.handle())
            .field("ownership", &self.handle.ownership())
            .field("size", &self.size)
            .field("gpu_address", &format_args!("{:#x}", self.gpu_address()))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BufferObject {
    /// Take sole ownership of a freshly created kernel handle.
    #[must_use]
    pub fn new(drm: Arc<dyn DrmInterface>, handle: u32, size: u64) -> Self {
        Self::with_handle(drm, BoHandleWrapper::new(handle), size)
    }

    /// Build a buffer object around an existing ownership wrapper (shared or weak).
    #[must_use]
    pub fn with_handle(drm: Arc<dyn DrmInterface>, handle: BoHandleWrapper, size: u64) -> Self {
        Self {
            drm,
            handle,
            size,
            gpu_address: AtomicU64::new(0),
            tiling_mode: AtomicU32::new(I915_TILING_NONE),
            cache: Mutex::new(CacheAttributes::default()),
            capture: AtomicBool::new(false),
            async_exec: AtomicBool::new(false),
            bind_info: std::array::from_fn(|_| AtomicU32::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn handle(&self) -> u32 {
        self.handle.handle()
    }

    #[must_use]
    pub const fn handle_wrapper(&self) -> &BoHandleWrapper {
        &self.handle
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn gpu_address(&self) -> u64 {
        self.gpu_address.load(Ordering::Acquire)
    }

    pub fn set_gpu_address(&self, address: u64) {
        self.gpu_address.store(address, Ordering::Release);
    }

    #[must_use]
    pub fn tiling_mode(&self) -> u32 {
        self.tiling_mode.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn cache_policy(&self) -> CachePolicy {
        self.cache.lock().policy
    }

    #[must_use]
    pub fn cache_region(&self) -> u16 {
        self.cache.lock().region
    }

    pub fn set_cache_policy(&self, policy: CachePolicy, region: u16) {
        *self.cache.lock() = CacheAttributes { policy, region };
    }

    pub fn set_capture(&self, capture: bool) {
        self.capture.store(capture, Ordering::Relaxed);
    }

    pub fn set_async(&self, async_exec: bool) {
        self.async_exec.store(async_exec, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ===========================================================================================
    // Binding
    // ===========================================================================================

    #[must_use]
    pub fn is_bound(&self, ctx: &OsContext, tile: u32) -> bool {
        tile < MAX_TILES as u32 && self.bind_info[ctx.slot()].load(Ordering::Acquire) & (1 << tile) != 0
    }

    /// Tiles on which this object is bound into `ctx`.
    #[must_use]
    pub fn bound_tiles(&self, ctx: &OsContext) -> DeviceBitfield {
        DeviceBitfield::new(self.bind_info[ctx.slot()].load(Ordering::Acquire))
    }

    fn vm_bind_args(&self, ctx: &OsContext, tile: u32) -> VmBindArgs {
        let mut flags = I915_GEM_VM_BIND_IMMEDIATE;
        if self.capture.load(Ordering::Relaxed) {
            flags |= I915_GEM_VM_BIND_CAPTURE;
        }
        VmBindArgs {
            vm_id: ctx.vm_id(tile),
            handle: self.handle(),
            start: decanonize(self.gpu_address()),
            offset: 0,
            length: self.size,
            flags,
            pat_index: self.cache_policy().pat_index(),
            ..Default::default()
        }
    }

    fn check_tile(tile: u32) -> DrmResult<u32> {
        if tile as usize >= MAX_TILES {
            return Err(DrmError::InvalidArgument(format!(
                "tile {tile} outside {MAX_TILES} tiles"
            )));
        }
        Ok(1 << tile)
    }

    /// Bind into `ctx`'s address space on `tile`.
    ///
    /// Returns `true` if a bind was performed, `false` if the cell was already set.
    /// Without VM bind support the kernel binds implicitly at submission, so
    /// only the table is updated.
    ///
    /// # Errors
    /// The classified kernel error; the cell stays clear.
    pub fn bind(&self, ctx: &OsContext, tile: u32) -> DrmResult<bool> {
        let bit = Self::check_tile(tile)?;
        let cell = &self.bind_info[ctx.slot()];
        if cell.load(Ordering::Acquire) & bit != 0 {
            return Ok(false);
        }

        if self.drm.is_vm_bind_available() {
            let args = self.vm_bind_args(ctx, tile);
            self.drm
                .vm_bind(&args)
                .map_err(|e| DrmError::from_errno("vm_bind", e))?;
            ctx.set_new_resource_bound();
            debug!(
                handle = self.handle(),
                context = ctx.context_id(),
                tile,
                vm_id = args.vm_id,
                start = format_args!("{:#x}", args.start),
                "bound buffer object"
            );
        }

        cell.fetch_or(bit, Ordering::AcqRel);
        Ok(true)
    }

    /// Inverse of [`bind`](Self::bind). Returns `false` if the cell was not set.
    ///
    /// # Errors
    /// The classified kernel error; the cell stays set.
    pub fn unbind(&self, ctx: &OsContext, tile: u32) -> DrmResult<bool> {
        let bit = Self::check_tile(tile)?;
        let cell = &self.bind_info[ctx.slot()];
        if cell.load(Ordering::Acquire) & bit == 0 {
            return Ok(false);
        }

        if self.drm.is_vm_bind_available() {
            let args = self.vm_bind_args(ctx, tile);
            self.drm
                .vm_unbind(&args)
                .map_err(|e| DrmError::from_errno("vm_unbind", e))?;
            debug!(handle = self.handle(), context = ctx.context_id(), tile, "unbound buffer object");
        }

        cell.fetch_and(!bit, Ordering::AcqRel);
        Ok(true)
    }

    // ===========================================================================================
    // Submission
    // ===========================================================================================

    /// Exec descriptor for this object at its pinned address.
    #[must_use]
    pub fn exec_object(&self) -> GemExecObject2 {
        let mut flags = EXEC_OBJECT_PINNED | EXEC_OBJECT_SUPPORTS_48B_ADDRESS;
        if self.capture.load(Ordering::Relaxed) {
            flags |= EXEC_OBJECT_CAPTURE;
        }
        if self.async_exec.load(Ordering::Relaxed) {
            flags |= EXEC_OBJECT_ASYNC;
        }
        GemExecObject2 {
            handle: self.handle(),
            offset: self.gpu_address(),
            flags,
            ..Default::default()
        }
    }

    /// Submit this object as the batch buffer, keeping `residency` mapped for
    /// the duration of the submission.
    ///
    /// `exec_objects` is scratch storage reused across submissions. A
    /// rejected submission goes through the eviction retry ladder.
    ///
    /// # Errors
    /// See [`submit_with_eviction_retry`].
    pub fn exec(
        &self,
        params: &ExecBufferParams,
        residency: &[&Self],
        exec_objects: &mut Vec<GemExecObject2>,
        evictor: &dyn EvictUnused,
    ) -> DrmResult<()> {
        exec_objects.clear();
        exec_objects.reserve(residency.len() + 1);
        exec_objects.extend(residency.iter().map(|bo| bo.exec_object()));
        exec_objects.push(self.exec_object());

        trace!(
            batch = self.handle(),
            objects = exec_objects.len(),
            context = params.drm_context_id,
            "built exec list"
        );

        submit_with_eviction_retry(evictor, |_| {
            self.drm
                .exec(&mut exec_objects[..], params)
                .map_err(|e| DrmError::from_errno("execbuffer2", e))
        })
    }

    // ===========================================================================================
    // Attributes & lifetime
    // ===========================================================================================

    /// # Errors
    /// The classified kernel error; local tiling state is left unchanged.
    pub fn set_tiling(&self, mode: u32, stride: u32) -> DrmResult<()> {
        if self.tiling_mode() == mode {
            return Ok(());
        }
        self.drm
            .gem_set_tiling(self.handle(), mode, stride)
            .map_err(|e| DrmError::from_errno("set_tiling", e))?;
        self.tiling_mode.store(mode, Ordering::Release);
        Ok(())
    }

    /// Block until prior GPU use completes. A no-op under VM bind.
    ///
    /// # Errors
    /// `WaitTimeout`, `GpuHang`, or another classified kernel error.
    pub fn wait(&self, timeout_ns: i64) -> DrmResult<()> {
        if self.drm.is_vm_bind_available() {
            return Ok(());
        }
        self.drm
            .gem_wait(self.handle(), timeout_ns)
            .map_err(|e| DrmError::from_errno("gem_wait", e))
    }

    /// Convert the handle into a PRIME file descriptor.
    ///
    /// # Errors
    /// The classified kernel error.
    pub fn export_prime_fd(&self) -> DrmResult<RawFd> {
        self.drm
            .handle_to_prime_fd(self.handle())
            .map_err(|e| DrmError::from_errno("prime_handle_to_fd", e))
    }

    /// Close the kernel handle if this object is its last strong owner.
    ///
    /// A weakly held handle is never closed. A handle with another strong
    /// owner is left open and the object stays unclosed, so dropping it after
    /// the peer is gone still closes the handle.
    ///
    /// # Errors
    /// The classified kernel error; the object stays open and may be closed again.
    pub fn close(&self) -> DrmResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        if self.handle.is_weak() {
            self.closed.store(true, Ordering::Release);
            return Ok(());
        }
        if !self.handle.can_close() {
            debug!(handle = self.handle(), "handle still shared, skipping close");
            return Ok(());
        }

        self.drm
            .gem_close(self.handle())
            .map_err(|e| DrmError::from_errno("gem_close", e))?;
        self.closed.store(true, Ordering::Release);
        debug!(handle = self.handle(), "closed buffer object");
        Ok(())
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(handle = self.handle(), "failed to close buffer object: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::mock::MockDrm;
    use crate::memory::context::TaskCountEngine;

    fn ctx(id: u32) -> OsContext {
        OsContext::new(id, DeviceBitfield::all(2), Arc::new(TaskCountEngine::new())).unwrap()
    }

    #[test]
    fn bind_is_idempotent() {
        let drm = Arc::new(MockDrm::new(true));
        let bo = BufferObject::new(drm.clone(), 1, 0x1000);
        bo.set_gpu_address(0x20_0000);
        let ctx = ctx(0);

        assert!(bo.bind(&ctx, 1).unwrap());
        assert!(!bo.bind(&ctx, 1).unwrap());
        assert_eq!(drm.bind_count(), 1);
        assert!(bo.is_bound(&ctx, 1));
        assert!(!bo.is_bound(&ctx, 0));
        assert!(ctx.take_tlb_flush_required());

        let args = drm.state.lock().binds[0];
        assert_eq!(args.vm_id, ctx.vm_id(1));
        assert_eq!(args.start, 0x20_0000);
        assert_eq!(args.length, 0x1000);
    }

    #[test]
    fn failed_bind_leaves_cell_clear() {
        let drm = Arc::new(MockDrm::new(true));
        drm.state.lock().fail_bind_errno = Some(libc::ENOSPC);
        let bo = BufferObject::new(drm.clone(), 1, 0x1000);
        let ctx = ctx(3);

        assert!(matches!(bo.bind(&ctx, 0), Err(DrmError::OutOfMemory)));
        assert!(!bo.is_bound(&ctx, 0));
        assert!(!ctx.is_tlb_flush_required());
    }

    #[test]
    fn unbind_clears_cell() {
        let drm = Arc::new(MockDrm::new(true));
        let bo = BufferObject::new(drm.clone(), 1, 0x1000);
        let ctx = ctx(0);
        bo.bind(&ctx, 0).unwrap();
        assert!(bo.unbind(&ctx, 0).unwrap());
        assert!(!bo.unbind(&ctx, 0).unwrap());
        assert_eq!(drm.unbind_count(), 1);
        assert!(bo.bound_tiles(&ctx).is_empty());
    }

    #[test]
    fn software_bind_skips_kernel() {
        let drm = Arc::new(MockDrm::new(false));
        let bo = BufferObject::new(drm.clone(), 1, 0x1000);
        let ctx = ctx(0);
        assert!(bo.bind(&ctx, 0).unwrap());
        assert_eq!(drm.bind_count(), 0);
        assert!(bo.is_bound(&ctx, 0));
    }

    #[test]
    fn close_skips_shared_handle() {
        let drm = Arc::new(MockDrm::new(false));
        let owner = BufferObject::new(drm.clone(), 9, 0x1000);
        let peer = BufferObject::with_handle(
            drm.clone(),
            owner.handle_wrapper().acquire_shared_ownership(),
            0x1000,
        );

        owner.close().unwrap();
        assert!(drm.closed_handles().is_empty());
        drop(owner);

        peer.close().unwrap();
        assert_eq!(drm.closed_handles(), vec![9]);
        drop(peer);
        assert_eq!(drm.closed_handles(), vec![9]);
    }

    #[test]
    fn last_owner_dropped_after_skipped_close_closes_handle() {
        let drm = Arc::new(MockDrm::new(false));
        let owner = BufferObject::new(drm.clone(), 7, 0x1000);
        let peer = BufferObject::with_handle(
            drm.clone(),
            owner.handle_wrapper().acquire_shared_ownership(),
            0x1000,
        );

        owner.close().unwrap();
        assert!(!owner.is_closed());
        drop(peer);
        assert!(drm.closed_handles().is_empty());

        drop(owner);
        assert_eq!(drm.closed_handles(), vec![7]);
    }

    #[test]
    fn weak_holder_never_closes() {
        let drm = Arc::new(MockDrm::new(false));
        let owner = BufferObject::new(drm.clone(), 4, 0x1000);
        let observer = BufferObject::with_handle(
            drm.clone(),
            owner.handle_wrapper().acquire_weak_ownership(),
            0x1000,
        );

        owner.close().unwrap();
        drop(owner);
        assert!(observer.handle_wrapper().can_close());
        drop(observer);
        assert_eq!(drm.closed_handles(), vec![4]);
    }

    #[test]
    fn close_failure_is_reported() {
        let drm = Arc::new(MockDrm::new(false));
        let bo = BufferObject::new(drm.clone(), 2, 0x1000);
        drm.state.lock().fail_close_errno = Some(libc::EBADF);
        assert!(bo.close().is_err());
        assert!(!bo.is_closed());
        drm.state.lock().fail_close_errno = None;
        bo.close().unwrap();
        assert!(bo.is_closed());
    }

    #[test]
    fn set_tiling_only_on_change() {
        let drm = Arc::new(MockDrm::new(false));
        let bo = BufferObject::new(drm.clone(), 1, 0x1000);
        bo.set_tiling(I915_TILING_NONE, 0).unwrap();
        assert_eq!(drm.state.lock().tiling_calls, 0);
        bo.set_tiling(crate::drm::ioctl::I915_TILING_Y, 512).unwrap();
        bo.set_tiling(crate::drm::ioctl::I915_TILING_Y, 512).unwrap();
        assert_eq!(drm.state.lock().tiling_calls, 1);
        assert_eq!(bo.tiling_mode(), crate::drm::ioctl::I915_TILING_Y);
    }

    #[test]
    fn wait_is_noop_under_vm_bind() {
        let bound = Arc::new(MockDrm::new(true));
        BufferObject::new(bound.clone(), 1, 0x1000).wait(-1).unwrap();
        assert_eq!(bound.state.lock().waits, 0);

        let legacy = Arc::new(MockDrm::new(false));
        BufferObject::new(legacy.clone(), 1, 0x1000).wait(-1).unwrap();
        assert_eq!(legacy.state.lock().waits, 1);
    }

    struct NoEviction;

    impl EvictUnused for NoEviction {
        fn evict_unused_allocations(&self, _wait_for_completion: bool) -> DrmResult<()> {
            Ok(())
        }
    }

    #[test]
    fn exec_lists_residency_then_batch() {
        let drm = Arc::new(MockDrm::new(false));
        let batch = BufferObject::new(drm.clone(), 10, 0x1000);
        let a = BufferObject::new(drm.clone(), 11, 0x1000);
        let b = BufferObject::new(drm.clone(), 12, 0x1000);
        b.set_capture(true);

        let mut scratch = Vec::new();
        batch
            .exec(&ExecBufferParams::default(), &[&a, &b], &mut scratch, &NoEviction)
            .unwrap();

        let execs = drm.state.lock().execs.clone();
        assert_eq!(execs.len(), 1);
        let handles: Vec<u32> = execs[0].iter().map(|o| o.handle).collect();
        assert_eq!(handles, vec![11, 12, 10]);
        assert_ne!(execs[0][1].flags & EXEC_OBJECT_CAPTURE, 0);
        assert_ne!(execs[0][2].flags & EXEC_OBJECT_PINNED, 0);
    }

    #[test]
    fn exec_unsupported_is_not_retried() {
        let drm = Arc::new(MockDrm::new(false));
        drm.state.lock().exec_results.push_back(libc::EOPNOTSUPP);
        let batch = BufferObject::new(drm.clone(), 10, 0x1000);
        let result = batch.exec(&ExecBufferParams::default(), &[], &mut Vec::new(), &NoEviction);
        assert!(matches!(result, Err(DrmError::Unsupported)));
        assert_eq!(drm.state.lock().execs.len(), 1);
    }
}
