use crate::error::{DrmError, DrmResult};
use crate::memory::{MAX_OS_CONTEXTS, MAX_TILES};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

// ===============================================================================================
// Device Bitfield
// ===============================================================================================

/// Set of tiles (sub-devices) an execution context or allocation spans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DeviceBitfield(u32);

impl DeviceBitfield {
    #[must_use]
    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    /// Just `tile`; empty when `tile` is past the mask width.
    #[must_use]
    pub const fn single(tile: u32) -> Self {
        match 1u32.checked_shl(tile) {
            Some(bit) => Self(bit),
            None => Self(0),
        }
    }

    /// All tiles `0..count`.
    #[must_use]
    pub const fn all(count: u32) -> Self {
        if count >= 32 {
            Self(u32::MAX)
        } else {
            Self((1 << count) - 1)
        }
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn test(self, tile: u32) -> bool {
        tile < 32 && self.0 & (1 << tile) != 0
    }

    #[must_use]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Indices of the set tiles, lowest first.
    pub fn tiles(self) -> impl Iterator<Item = u32> {
        (0..32).filter(move |&tile| self.test(tile))
    }
}

// ===============================================================================================
// Engine (completion tracking)
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Ready,
    NotReady,
    GpuHang,
}

/// Completion tracking supplied by the command-submission front end.
pub trait Engine: Send + Sync + fmt::Debug {
    /// Highest task count the GPU has retired on this engine.
    fn last_completed_task_count(&self) -> u64;

    /// Task count that the next submission on this engine will carry.
    fn task_count(&self) -> u64;

    /// Block until `task_count` has retired or the engine is found hung.
    fn wait_for_task_count(&self, task_count: u64) -> WaitStatus;
}

#[derive(Debug, Default)]
struct TaskCounts {
    submitted: u64,
    completed: u64,
    hung: bool,
}

/// An [`Engine`] driven by explicit submit/complete notifications.
///
/// Front ends that learn about completion from a fence or interrupt thread
/// feed it here; waiters block on a condition variable.
#[derive(Debug, Default)]
pub struct TaskCountEngine {
    counts: Mutex<TaskCounts>,
    retired: Condvar,
}

impl TaskCountEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a submission and return its task count.
    pub fn submit(&self) -> u64 {
        let mut counts = self.counts.lock();
        counts.submitted += 1;
        counts.submitted
    }

    /// Record that everything up to `task_count` has retired.
    pub fn complete(&self, task_count: u64) {
        let mut counts = self.counts.lock();
        counts.completed = counts.completed.max(task_count);
        drop(counts);
        self.retired.notify_all();
    }

    /// Mark the engine hung; wakes every waiter.
    pub fn mark_hung(&self) {
        self.counts.lock().hung = true;
        self.retired.notify_all();
    }
}

impl Engine for TaskCountEngine {
    fn last_completed_task_count(&self) -> u64 {
        self.counts.lock().completed
    }

    fn task_count(&self) -> u64 {
        self.counts.lock().submitted + 1
    }

    fn wait_for_task_count(&self, task_count: u64) -> WaitStatus {
        let mut counts = self.counts.lock();
        loop {
            if counts.hung {
                return WaitStatus::GpuHang;
            }
            if counts.completed >= task_count || counts.submitted < task_count {
                // Nothing outstanding up to `task_count` can still complete.
                return WaitStatus::Ready;
            }
            self.retired.wait(&mut counts);
        }
    }
}

// ===============================================================================================
// OS Context
// ===============================================================================================

/// One engine instance as seen by the residency core: its slot in the
/// per-buffer-object bind tables, the tiles it spans, and the VM it binds into
/// on each tile.
#[derive(Debug)]
pub struct OsContext {
    context_id: u32,
    device_bitfield: DeviceBitfield,
    vm_ids: [u32; MAX_TILES],
    drm_context_ids: [u32; MAX_TILES],
    engine: Arc<dyn Engine>,
    tlb_flush_required: AtomicBool,
}

impl OsContext {
    /// # Errors
    /// `InvalidArgument` if `context_id` does not fit the bind tables or the
    /// bitfield names a tile beyond [`MAX_TILES`].
    pub fn new(
        context_id: u32,
        device_bitfield: DeviceBitfield,
        engine: Arc<dyn Engine>,
    ) -> DrmResult<Self> {
        if context_id as usize >= MAX_OS_CONTEXTS {
            return Err(DrmError::InvalidArgument(format!(
                "context id {context_id} exceeds {MAX_OS_CONTEXTS} slots"
            )));
        }
        if device_bitfield.is_empty() || device_bitfield.bits() >> MAX_TILES != 0 {
            return Err(DrmError::InvalidArgument(format!(
                "device bitfield {:#b} outside {MAX_TILES} tiles",
                device_bitfield.bits()
            )));
        }

        // Default layout: one VM per tile, numbered from 1.
        let mut vm_ids = [0; MAX_TILES];
        for (tile, vm_id) in (1..).zip(vm_ids.iter_mut()) {
            *vm_id = tile;
        }

        Ok(Self {
            context_id,
            device_bitfield,
            vm_ids,
            drm_context_ids: [0; MAX_TILES],
            engine,
            tlb_flush_required: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn with_vm_ids(mut self, vm_ids: [u32; MAX_TILES]) -> Self {
        self.vm_ids = vm_ids;
        self
    }

    #[must_use]
    pub const fn with_drm_context_ids(mut self, ids: [u32; MAX_TILES]) -> Self {
        self.drm_context_ids = ids;
        self
    }

    #[must_use]
    pub const fn context_id(&self) -> u32 {
        self.context_id
    }

    pub(crate) const fn slot(&self) -> usize {
        self.context_id as usize
    }

    #[must_use]
    pub const fn device_bitfield(&self) -> DeviceBitfield {
        self.device_bitfield
    }

    #[must_use]
    pub fn vm_id(&self, tile: u32) -> u32 {
        self.vm_ids.get(tile as usize).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn drm_context_id(&self, tile: u32) -> u32 {
        self.drm_context_ids.get(tile as usize).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    /// Set whenever a new resource is bound into this context's VM.
    pub fn set_new_resource_bound(&self) {
        self.tlb_flush_required.store(true, Ordering::Release);
    }

    /// Consume the TLB-flush marker.
    pub fn take_tlb_flush_required(&self) -> bool {
        self.tlb_flush_required.swap(false, Ordering::AcqRel)
    }

    #[must_use]
    pub fn is_tlb_flush_required(&self) -> bool {
        self.tlb_flush_required.load(Ordering::Acquire)
    }
}
