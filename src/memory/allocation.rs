use crate::error::{DrmError, DrmResult};
use crate::memory::buffer_object::BufferObject;
use crate::memory::context::{DeviceBitfield, OsContext};
use crate::memory::{MAX_OS_CONTEXTS, MAX_TILES};
use parking_lot::Mutex;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const NOT_RESIDENT: u64 = u64::MAX;
const ALWAYS_RESIDENT: u64 = u64::MAX - 1;

/// What the allocation is used for. Placement policy lives elsewhere; the
/// residency core only carries the value through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AllocationType {
    #[default]
    Buffer,
    BufferHostMemory,
    SharedBuffer,
    Image,
    CommandBuffer,
    KernelIsa,
    InternalHeap,
    Unknown,
}

/// Physical placement reported alongside the created buffer objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MemoryPool {
    System4KBPages,
    System64KBPages,
    #[default]
    LocalMemory,
    SystemCpuInaccessible,
}

impl MemoryPool {
    #[must_use]
    pub const fn is_system(self) -> bool {
        !matches!(self, Self::LocalMemory)
    }
}

/// Where an allocation lives across tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageInfo {
    pub tile_mask: DeviceBitfield,
    /// One physical buffer striped across every tile in `tile_mask`.
    pub chunked: bool,
}

impl Default for StorageInfo {
    fn default() -> Self {
        Self {
            tile_mask: DeviceBitfield::single(0),
            chunked: false,
        }
    }
}

/// Per-context residency marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidencyState {
    NotResident,
    /// Pinned until an explicit evict; never an eviction candidate.
    AlwaysResident,
    /// Last submission on the context that used the allocation.
    LastUsed(u64),
}

impl ResidencyState {
    const fn from_raw(raw: u64) -> Self {
        match raw {
            NOT_RESIDENT => Self::NotResident,
            ALWAYS_RESIDENT => Self::AlwaysResident,
            count => Self::LastUsed(count),
        }
    }

    const fn to_raw(self) -> u64 {
        match self {
            Self::NotResident => NOT_RESIDENT,
            Self::AlwaysResident => ALWAYS_RESIDENT,
            // Real counts never reach the sentinels.
            Self::LastUsed(count) if count >= ALWAYS_RESIDENT => ALWAYS_RESIDENT - 1,
            Self::LastUsed(count) => count,
        }
    }

    /// Whether the engine's completed count has passed this marker.
    #[must_use]
    pub const fn is_retired_by(self, completed: u64) -> bool {
        match self {
            Self::NotResident => true,
            Self::AlwaysResident => false,
            Self::LastUsed(count) => count <= completed,
        }
    }
}

/// Creation-time description of an allocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocationInfo {
    pub id: u64,
    pub root_device_index: u32,
    pub allocation_type: AllocationType,
    pub memory_pool: MemoryPool,
    pub gpu_address: u64,
    pub size: u64,
    pub storage: StorageInfo,
}

/// A driver-level allocation: one buffer object per tile, or a single one
/// shared by every tile.
pub struct DrmAllocation {
    info: AllocationInfo,
    bos: [Option<BufferObject>; MAX_TILES],
    num_handles: usize,
    residency: [AtomicU64; MAX_OS_CONTEXTS],
    locked: AtomicBool,
    import_tag: Option<u64>,
    exported_fds: Mutex<Vec<RawFd>>,
}

impl fmt::Debug for DrmAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmAllocation")
            .field("id", &self.info.id)
            .field("type", &self.info.allocation_type)
            .field("pool", &self.info.memory_pool)
            .field("gpu_address", &format_args!("{:#x}", self.info.gpu_address))
            .field("size", &self.info.size)
            .field("handles", &self.kernel_handles())
            .finish_non_exhaustive()
    }
}

impl DrmAllocation {
    /// Assemble an allocation from its buffer objects.
    ///
    /// Buffer objects are given in tile order of `info.storage.tile_mask`. A
    /// chunked or single-tile allocation takes exactly one.
    ///
    /// # Errors
    /// `InvalidArgument` if the object count does not match the tile count.
    pub fn new(info: AllocationInfo, bos: Vec<BufferObject>) -> DrmResult<Self> {
        let tiles = info.storage.tile_mask;
        let expected = if info.storage.chunked || tiles.count() <= 1 {
            1
        } else {
            tiles.count() as usize
        };
        if bos.len() != expected || tiles.bits() >> MAX_TILES != 0 {
            return Err(DrmError::InvalidArgument(format!(
                "{} buffer objects for tile mask {:#b} (expected {expected})",
                bos.len(),
                tiles.bits()
            )));
        }

        let num_handles = bos.len();
        let mut slots: [Option<BufferObject>; MAX_TILES] = std::array::from_fn(|_| None);
        if num_handles == 1 {
            slots[0] = bos.into_iter().next();
        } else {
            for (tile, bo) in tiles.tiles().zip(bos) {
                slots[tile as usize] = Some(bo);
            }
        }

        Ok(Self {
            info,
            bos: slots,
            num_handles,
            residency: std::array::from_fn(|_| AtomicU64::new(NOT_RESIDENT)),
            locked: AtomicBool::new(false),
            import_tag: None,
            exported_fds: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub const fn with_import_tag(mut self, tag: u64) -> Self {
        self.import_tag = Some(tag);
        self
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.info.id
    }

    #[must_use]
    pub const fn info(&self) -> &AllocationInfo {
        &self.info
    }

    #[must_use]
    pub const fn root_device_index(&self) -> u32 {
        self.info.root_device_index
    }

    #[must_use]
    pub const fn allocation_type(&self) -> AllocationType {
        self.info.allocation_type
    }

    #[must_use]
    pub const fn memory_pool(&self) -> MemoryPool {
        self.info.memory_pool
    }

    /// Canonical GPU virtual address, identical on every tile.
    #[must_use]
    pub const fn gpu_address(&self) -> u64 {
        self.info.gpu_address
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.info.size
    }

    #[must_use]
    pub const fn storage(&self) -> StorageInfo {
        self.info.storage
    }

    #[must_use]
    pub const fn num_handles(&self) -> usize {
        self.num_handles
    }

    /// Identity assigned when the allocation was reconstructed from IPC descriptors.
    #[must_use]
    pub const fn import_tag(&self) -> Option<u64> {
        self.import_tag
    }

    /// Buffer objects in tile order.
    pub fn buffer_objects(&self) -> impl Iterator<Item = &BufferObject> {
        self.bos.iter().flatten()
    }

    /// The buffer object backing `tile`. Chunked and single-handle
    /// allocations always resolve to the one object.
    #[must_use]
    pub fn bo_for_tile(&self, tile: u32) -> Option<&BufferObject> {
        if self.info.storage.chunked || self.num_handles == 1 {
            return self.bos[0].as_ref();
        }
        self.bos.get(tile as usize).and_then(Option::as_ref)
    }

    #[must_use]
    pub fn kernel_handles(&self) -> Vec<u32> {
        self.buffer_objects().map(BufferObject::handle).collect()
    }

    // ===========================================================================================
    // Residency
    // ===========================================================================================

    #[must_use]
    pub fn residency_state(&self, ctx: &OsContext) -> ResidencyState {
        ResidencyState::from_raw(self.residency[ctx.slot()].load(Ordering::Acquire))
    }

    /// Overwrite the marker for `ctx`. An always-resident mark is only
    /// cleared by eviction.
    pub fn update_residency(&self, ctx: &OsContext, state: ResidencyState) {
        let slot = &self.residency[ctx.slot()];
        match state {
            ResidencyState::LastUsed(_) => {
                // Lose the race to a concurrent pin rather than overwrite it.
                let _ = slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                    (raw != ALWAYS_RESIDENT).then_some(state.to_raw())
                });
            }
            _ => slot.store(state.to_raw(), Ordering::Release),
        }
    }

    #[must_use]
    pub fn is_always_resident(&self, ctx: &OsContext) -> bool {
        self.residency_state(ctx) == ResidencyState::AlwaysResident
    }

    /// Whether any tile of `ctx` has this allocation's buffer object bound.
    #[must_use]
    pub fn is_bound_in(&self, ctx: &OsContext) -> bool {
        ctx.device_bitfield()
            .tiles()
            .any(|tile| self.bo_for_tile(tile).is_some_and(|bo| bo.is_bound(ctx, tile)))
    }

    #[must_use]
    pub fn is_bound_on_tile(&self, ctx: &OsContext, tile: u32) -> bool {
        ctx.device_bitfield().test(tile) && self.bo_for_tile(tile).is_some_and(|bo| bo.is_bound(ctx, tile))
    }

    /// Bind the buffer object of every tile `ctx` spans and record the use.
    ///
    /// Returns `true` if any kernel-level bind happened.
    ///
    /// # Errors
    /// The first bind failure; tiles bound before it stay bound.
    pub fn make_resident_across_context_tiles(
        &self,
        ctx: &OsContext,
        task_count: u64,
        always_resident: bool,
    ) -> DrmResult<bool> {
        let mut newly_bound = false;
        for tile in ctx.device_bitfield().tiles() {
            if let Some(bo) = self.bo_for_tile(tile) {
                newly_bound |= bo.bind(ctx, tile)?;
            }
        }

        let state = if always_resident {
            ResidencyState::AlwaysResident
        } else {
            ResidencyState::LastUsed(task_count)
        };
        self.update_residency(ctx, state);
        Ok(newly_bound)
    }

    /// Unbind the masked tiles of `ctx`. The marker drops to not-resident
    /// once no tile of `ctx` remains bound.
    ///
    /// # Errors
    /// The first unbind failure.
    pub fn evict_from_context_tiles(&self, ctx: &OsContext, mask: DeviceBitfield) -> DrmResult<()> {
        for tile in ctx.device_bitfield().intersection(mask).tiles() {
            if let Some(bo) = self.bo_for_tile(tile) {
                bo.unbind(ctx, tile)?;
            }
        }
        if !self.is_bound_in(ctx) {
            self.update_residency(ctx, ResidencyState::NotResident);
        }
        Ok(())
    }

    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::Release);
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    // ===========================================================================================
    // Sharing & teardown
    // ===========================================================================================

    pub fn record_exported_fds(&self, fds: &[RawFd]) {
        self.exported_fds.lock().extend_from_slice(fds);
    }

    /// Hand over every PRIME descriptor exported from this allocation.
    pub fn take_exported_fds(&self) -> Vec<RawFd> {
        std::mem::take(&mut *self.exported_fds.lock())
    }

    /// Close every buffer object, attempting all of them even after a failure.
    ///
    /// # Errors
    /// The first close failure.
    pub fn close_buffer_objects(&self) -> DrmResult<()> {
        let mut first_err = None;
        for bo in self.buffer_objects() {
            if let Err(e) = bo.close() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::mock::MockDrm;
    use crate::drm::DrmInterface;
    use crate::memory::context::TaskCountEngine;
    use std::sync::Arc;

    fn two_tile(drm: &Arc<MockDrm>, chunked: bool) -> DrmAllocation {
        let drm_dyn: Arc<dyn DrmInterface> = drm.clone();
        let count = if chunked { 1 } else { 2 };
        let bos = (0..count)
            .map(|i| {
                let bo = BufferObject::new(drm_dyn.clone(), 20 + i, 0x1000);
                bo.set_gpu_address(0x40_0000);
                bo
            })
            .collect();
        DrmAllocation::new(
            AllocationInfo {
                id: 1,
                gpu_address: 0x40_0000,
                size: 0x1000,
                storage: StorageInfo {
                    tile_mask: DeviceBitfield::all(2),
                    chunked,
                },
                ..Default::default()
            },
            bos,
        )
        .unwrap()
    }

    fn ctx(id: u32, tiles: DeviceBitfield) -> OsContext {
        OsContext::new(id, tiles, Arc::new(TaskCountEngine::new())).unwrap()
    }

    #[test]
    fn sentinel_ordering() {
        assert!(ResidencyState::NotResident.is_retired_by(0));
        assert!(!ResidencyState::AlwaysResident.is_retired_by(u64::MAX));
        assert!(ResidencyState::LastUsed(5).is_retired_by(5));
        assert!(!ResidencyState::LastUsed(6).is_retired_by(5));
    }

    #[test]
    fn tile_count_must_match() {
        let drm: Arc<dyn DrmInterface> = Arc::new(MockDrm::new(false));
        let info = AllocationInfo {
            storage: StorageInfo {
                tile_mask: DeviceBitfield::all(2),
                chunked: false,
            },
            ..Default::default()
        };
        let one = vec![BufferObject::new(drm, 1, 0x1000)];
        assert!(matches!(
            DrmAllocation::new(info, one),
            Err(DrmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn per_tile_lookup() {
        let drm = Arc::new(MockDrm::new(true));
        let split = two_tile(&drm, false);
        assert_eq!(split.bo_for_tile(0).map(BufferObject::handle), Some(20));
        assert_eq!(split.bo_for_tile(1).map(BufferObject::handle), Some(21));
        assert_eq!(split.kernel_handles(), vec![20, 21]);

        let chunked = two_tile(&drm, true);
        assert_eq!(chunked.bo_for_tile(1).map(BufferObject::handle), Some(20));
    }

    #[test]
    fn resident_across_tiles_binds_each_tile_once() {
        let drm = Arc::new(MockDrm::new(true));
        let alloc = two_tile(&drm, false);
        let ctx = ctx(1, DeviceBitfield::all(2));

        assert!(alloc.make_resident_across_context_tiles(&ctx, 7, false).unwrap());
        assert!(!alloc.make_resident_across_context_tiles(&ctx, 8, false).unwrap());
        assert_eq!(drm.bind_count(), 2);
        assert_eq!(alloc.residency_state(&ctx), ResidencyState::LastUsed(8));
    }

    #[test]
    fn always_resident_survives_task_count_updates() {
        let drm = Arc::new(MockDrm::new(false));
        let alloc = two_tile(&drm, false);
        let ctx = ctx(0, DeviceBitfield::single(0));

        alloc.make_resident_across_context_tiles(&ctx, 1, true).unwrap();
        alloc.make_resident_across_context_tiles(&ctx, 2, false).unwrap();
        assert!(alloc.is_always_resident(&ctx));

        alloc.evict_from_context_tiles(&ctx, DeviceBitfield::all(4)).unwrap();
        assert_eq!(alloc.residency_state(&ctx), ResidencyState::NotResident);
    }

    #[test]
    fn partial_eviction_keeps_marker() {
        let drm = Arc::new(MockDrm::new(true));
        let alloc = two_tile(&drm, false);
        let ctx = ctx(2, DeviceBitfield::all(2));
        alloc.make_resident_across_context_tiles(&ctx, 3, false).unwrap();

        alloc.evict_from_context_tiles(&ctx, DeviceBitfield::single(0)).unwrap();
        assert!(!alloc.is_bound_on_tile(&ctx, 0));
        assert!(alloc.is_bound_on_tile(&ctx, 1));
        assert_eq!(alloc.residency_state(&ctx), ResidencyState::LastUsed(3));

        alloc.evict_from_context_tiles(&ctx, DeviceBitfield::single(1)).unwrap();
        assert_eq!(alloc.residency_state(&ctx), ResidencyState::NotResident);
        assert_eq!(drm.unbind_count(), 2);
    }

    #[test]
    fn close_attempts_every_object() {
        let drm = Arc::new(MockDrm::new(false));
        let alloc = two_tile(&drm, false);
        alloc.close_buffer_objects().unwrap();
        assert_eq!(drm.closed_handles(), vec![20, 21]);
    }
}
