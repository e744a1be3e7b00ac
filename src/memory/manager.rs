use crate::config::ResidencyConfig;
use crate::drm::DrmInterface;
use crate::error::{DrmError, DrmResult};
use crate::memory::allocation::{AllocationInfo, AllocationType, DrmAllocation, MemoryPool, StorageInfo};
use crate::memory::aperture::{GpuVaHeap, PAGE_SIZE, align_up};
use crate::memory::buffer_object::{BufferObject, CachePolicy};
use crate::memory::context::{DeviceBitfield, OsContext};
use crate::memory::handle::BoHandleWrapper;
use crate::memory::MAX_TILES;
use crate::residency::{MemoryOperationsHandler, create_handler};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

// Default GPU VA window: above the first 4GB, below the 48-bit limit.
const GPU_VA_BASE: u64 = 0x1_0000_0000;
const GPU_VA_LIMIT: u64 = 1 << 47;
const GPU_VA_GUARD_PAGES: u64 = 1;
const LOCAL_MEMORY_ALIGN: u64 = 64 * 1024;

/// What the allocation-policy layer asks for.
#[derive(Debug, Clone, Copy)]
pub struct AllocationProperties {
    pub root_device_index: u32,
    pub size: u64,
    pub allocation_type: AllocationType,
    pub tile_mask: DeviceBitfield,
    /// Wrap this page-aligned host memory instead of creating device memory.
    pub host_ptr: Option<u64>,
    pub memory_pool: MemoryPool,
    pub chunked: bool,
    pub cache_policy: CachePolicy,
}

impl AllocationProperties {
    #[must_use]
    pub fn new(root_device_index: u32, size: u64, allocation_type: AllocationType) -> Self {
        Self {
            root_device_index,
            size,
            allocation_type,
            tile_mask: DeviceBitfield::single(0),
            host_ptr: None,
            memory_pool: MemoryPool::LocalMemory,
            chunked: false,
            cache_policy: CachePolicy::WriteBack,
        }
    }

    #[must_use]
    pub const fn tile_mask(mut self, tiles: DeviceBitfield) -> Self {
        self.tile_mask = tiles;
        self
    }

    #[must_use]
    pub const fn host_ptr(mut self, address: u64) -> Self {
        self.host_ptr = Some(address);
        self.memory_pool = MemoryPool::System4KBPages;
        self
    }

    #[must_use]
    pub const fn memory_pool(mut self, pool: MemoryPool) -> Self {
        self.memory_pool = pool;
        self
    }

    /// One buffer striped across every tile in the mask.
    #[must_use]
    pub const fn chunked(mut self) -> Self {
        self.chunked = true;
        self
    }

    #[must_use]
    pub const fn uncached(mut self) -> Self {
        self.cache_policy = CachePolicy::Uncached;
        self
    }
}

/// Buffer objects for an allocation that is being reconstructed from
/// existing kernel handles rather than created.
#[derive(Debug)]
pub struct ImportedHandles {
    pub handles: Vec<BoHandleWrapper>,
    pub size: u64,
    pub allocation_type: AllocationType,
    pub memory_pool: MemoryPool,
    pub tiling_mode: u32,
    pub cache_policy: CachePolicy,
    pub import_tag: u64,
}

/// Allocation front door for one root device: creates and frees
/// allocations, owns their GPU VA, and routes residency requests to the
/// configured handler.
#[derive(Debug)]
pub struct DrmMemoryManager {
    drm: Arc<dyn DrmInterface>,
    handler: Arc<dyn MemoryOperationsHandler>,
    config: ResidencyConfig,
    va_heap: Mutex<GpuVaHeap>,
    next_id: AtomicU64,
}

impl DrmMemoryManager {
    #[must_use]
    pub fn new(drm: Arc<dyn DrmInterface>, config: ResidencyConfig) -> Self {
        let handler = create_handler(drm.as_ref(), &config);
        Self::with_handler(drm, handler, config)
    }

    #[must_use]
    pub fn with_handler(
        drm: Arc<dyn DrmInterface>,
        handler: Arc<dyn MemoryOperationsHandler>,
        config: ResidencyConfig,
    ) -> Self {
        Self {
            drm,
            handler,
            config,
            va_heap: Mutex::new(GpuVaHeap::new(GPU_VA_BASE, GPU_VA_LIMIT, PAGE_SIZE, GPU_VA_GUARD_PAGES)),
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn drm(&self) -> &Arc<dyn DrmInterface> {
        &self.drm
    }

    #[must_use]
    pub fn handler(&self) -> &Arc<dyn MemoryOperationsHandler> {
        &self.handler
    }

    #[must_use]
    pub const fn config(&self) -> &ResidencyConfig {
        &self.config
    }

    /// Register an execution context with the residency handler.
    ///
    /// # Errors
    /// A bind failure while making the device-wide set resident.
    pub fn register_engine(&self, ctx: Arc<OsContext>) -> DrmResult<()> {
        self.handler.register_engine(ctx)
    }

    fn acquire_gpu_range(&self, size: u64, align: u64) -> DrmResult<u64> {
        self.va_heap
            .lock()
            .allocate(size, align)
            .ok_or(DrmError::OutOfMemory)
    }

    fn release_gpu_range(&self, address: u64) {
        self.va_heap.lock().free(address);
    }

    /// Page-rounded size, or `OutOfMemory` when it cannot fit the GPU VA window.
    fn page_aligned_size(requested: u64) -> DrmResult<u64> {
        align_up(requested.max(PAGE_SIZE), PAGE_SIZE)
            .filter(|&size| size <= GPU_VA_LIMIT - GPU_VA_BASE)
            .ok_or(DrmError::OutOfMemory)
    }

    /// Drop imported handle references, closing the ones nobody else owns.
    pub(crate) fn release_handles(&self, handles: Vec<BoHandleWrapper>) {
        for wrapper in handles {
            if wrapper.can_close() {
                self.close_handles(&[wrapper.handle()]);
            }
        }
    }

    fn close_handles(&self, handles: &[u32]) {
        for &handle in handles {
            if let Err(e) = self.drm.gem_close(handle) {
                warn!(handle, "failed to close handle during cleanup: {e}");
            }
        }
    }

    /// Create GPU memory (or wrap host memory) and give it a GPU address.
    ///
    /// A zero size is rounded up to one page. Multi-tile placements get one
    /// buffer object per tile, all at the same GPU address.
    ///
    /// # Errors
    /// `InvalidArgument` for an unaligned host pointer or a tile mask
    /// beyond the device; `OutOfMemory` when GPU VA or kernel memory runs out.
    pub fn allocate(&self, props: &AllocationProperties) -> DrmResult<Arc<DrmAllocation>> {
        let size = Self::page_aligned_size(props.size)?;
        let tile_mask = if props.tile_mask.is_empty() {
            DeviceBitfield::single(0)
        } else {
            props.tile_mask
        };
        if tile_mask.bits() >> MAX_TILES != 0 {
            return Err(DrmError::InvalidArgument(format!(
                "tile mask {:#b} outside {MAX_TILES} tiles",
                tile_mask.bits()
            )));
        }

        let (handles, memory_pool, storage) = match props.host_ptr {
            Some(address) => {
                if address % PAGE_SIZE != 0 {
                    return Err(DrmError::InvalidArgument(format!(
                        "host pointer {address:#x} is not page aligned"
                    )));
                }
                let handle = self
                    .drm
                    .gem_userptr(address, size)
                    .map_err(|e| DrmError::from_errno("gem_userptr", e))?;
                (vec![handle], MemoryPool::System4KBPages, StorageInfo::default())
            }
            None => {
                let count = if props.chunked { 1 } else { tile_mask.count() as usize };
                let mut handles = Vec::with_capacity(count);
                for _ in 0..count {
                    match self.drm.gem_create(size) {
                        Ok(handle) => handles.push(handle),
                        Err(e) => {
                            self.close_handles(&handles);
                            return Err(DrmError::from_errno("gem_create", e));
                        }
                    }
                }
                let storage = StorageInfo {
                    tile_mask,
                    chunked: props.chunked,
                };
                (handles, props.memory_pool, storage)
            }
        };

        let align = if memory_pool.is_system() { PAGE_SIZE } else { LOCAL_MEMORY_ALIGN };
        let gpu_address = match self.acquire_gpu_range(size, align) {
            Ok(address) => address,
            Err(e) => {
                self.close_handles(&handles);
                return Err(e);
            }
        };

        let bos = handles
            .into_iter()
            .map(|handle| {
                let bo = BufferObject::new(Arc::clone(&self.drm), handle, size);
                bo.set_gpu_address(gpu_address);
                bo.set_cache_policy(props.cache_policy, 0);
                bo
            })
            .collect();

        let info = AllocationInfo {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            root_device_index: props.root_device_index,
            allocation_type: props.allocation_type,
            memory_pool,
            gpu_address,
            size,
            storage,
        };
        let alloc = match DrmAllocation::new(info, bos) {
            Ok(alloc) => Arc::new(alloc),
            Err(e) => {
                // Dropping the buffer objects closed their handles.
                self.release_gpu_range(gpu_address);
                return Err(e);
            }
        };

        if let Err(e) = self.register(&alloc) {
            self.release_gpu_range(gpu_address);
            return Err(e);
        }
        debug!(
            id = alloc.id(),
            size,
            gpu_address = format_args!("{gpu_address:#x}"),
            handles = ?alloc.kernel_handles(),
            "allocated"
        );
        Ok(alloc)
    }

    /// Assemble an allocation around kernel handles this process already holds.
    ///
    /// # Errors
    /// `OutOfMemory` when GPU VA runs out; `InvalidArgument` for more
    /// handles than tiles. On error every handle this call held as sole
    /// owner is closed.
    pub fn create_allocation_from_handles(
        &self,
        imported: ImportedHandles,
    ) -> DrmResult<Arc<DrmAllocation>> {
        let count = imported.handles.len();
        if count == 0 || count > MAX_TILES {
            self.release_handles(imported.handles);
            return Err(DrmError::InvalidArgument(format!("{count} imported handles")));
        }
        let gpu_range = Self::page_aligned_size(imported.size).and_then(|size| {
            self.acquire_gpu_range(size, LOCAL_MEMORY_ALIGN)
                .map(|address| (size, address))
        });
        let (size, gpu_address) = match gpu_range {
            Ok(range) => range,
            Err(e) => {
                self.release_handles(imported.handles);
                return Err(e);
            }
        };

        let mut bos = Vec::with_capacity(count);
        for wrapper in imported.handles {
            let bo = BufferObject::with_handle(Arc::clone(&self.drm), wrapper, size);
            bo.set_gpu_address(gpu_address);
            bo.set_cache_policy(imported.cache_policy, 0);
            if let Err(e) = bo.set_tiling(imported.tiling_mode, 0) {
                warn!(handle = bo.handle(), "could not apply imported tiling: {e}");
            }
            bos.push(bo);
        }

        #[allow(clippy::cast_possible_truncation)]
        let info = AllocationInfo {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            root_device_index: 0,
            allocation_type: imported.allocation_type,
            memory_pool: imported.memory_pool,
            gpu_address,
            size,
            storage: StorageInfo {
                tile_mask: DeviceBitfield::all(count as u32),
                chunked: false,
            },
        };
        let alloc = match DrmAllocation::new(info, bos) {
            Ok(alloc) => Arc::new(alloc.with_import_tag(imported.import_tag)),
            Err(e) => {
                self.release_gpu_range(gpu_address);
                return Err(e);
            }
        };

        if let Err(e) = self.register(&alloc) {
            self.release_gpu_range(gpu_address);
            return Err(e);
        }
        Ok(alloc)
    }

    fn register(&self, alloc: &Arc<DrmAllocation>) -> DrmResult<()> {
        self.handler.register_allocation(alloc);
        if self.config.make_each_allocation_resident {
            if let Err(e) = self.handler.make_resident(std::slice::from_ref(alloc)) {
                warn!(id = alloc.id(), "could not make new allocation resident: {e}");
                self.handler.unregister_allocation(alloc);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Release an allocation: evict it from every context, stop tracking
    /// it, close its buffer objects and give back its GPU range.
    ///
    /// # Errors
    /// The first eviction or close failure. The GPU range is released regardless.
    pub fn free(&self, alloc: Arc<DrmAllocation>) -> DrmResult<()> {
        let evicted = self.handler.evict(&alloc);
        if let Err(e) = &evicted {
            warn!(id = alloc.id(), "eviction before free failed: {e}");
        }
        self.handler.unregister_allocation(&alloc);

        for fd in alloc.take_exported_fds() {
            if let Err(e) = self.drm.close_prime_fd(fd) {
                warn!(fd, "failed to close exported descriptor: {e}");
            }
        }
        let closed = alloc.close_buffer_objects();
        self.release_gpu_range(alloc.gpu_address());
        debug!(id = alloc.id(), "freed");

        evicted.and(closed)
    }

    /// Pin `alloc` in every context and exclude it from eviction sweeps.
    ///
    /// # Errors
    /// A bind failure.
    pub fn lock(&self, alloc: &Arc<DrmAllocation>) -> DrmResult<()> {
        self.handler.make_resident(std::slice::from_ref(alloc))?;
        alloc.set_locked(true);
        Ok(())
    }

    pub fn unlock(&self, alloc: &DrmAllocation) {
        alloc.set_locked(false);
    }

    /// # Errors
    /// The first unbind failure.
    pub fn evict(&self, alloc: &DrmAllocation) -> DrmResult<()> {
        self.handler.evict(alloc)
    }

    #[must_use]
    pub fn is_resident(&self, alloc: &DrmAllocation) -> bool {
        self.handler.is_resident(alloc)
    }

    /// Block until the GPU is done with every buffer object of `alloc`.
    ///
    /// # Errors
    /// `WaitTimeout` or `GpuHang` from the kernel wait.
    pub fn handle_fence_completion(&self, alloc: &DrmAllocation) -> DrmResult<()> {
        for bo in alloc.buffer_objects() {
            bo.wait(self.config.wait_timeout_ns)?;
        }
        Ok(())
    }

    /// # Errors
    /// See [`MemoryOperationsHandler::ensure_resident_set`].
    pub fn ensure_resident_set(&self, ctx: &OsContext) -> DrmResult<Vec<Arc<DrmAllocation>>> {
        self.handler.ensure_resident_set(ctx)
    }
}
