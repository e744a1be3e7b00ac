//! Cross-process sharing of allocations through PRIME descriptors.
//!
//! An exported allocation becomes one [`IpcDescriptor`] per buffer object.
//! The descriptor's byte layout is fixed; both sides of an exchange must run
//! the same layout version.

use crate::error::{DrmError, DrmResult};
use crate::memory::allocation::{AllocationType, DrmAllocation, MemoryPool};
use crate::memory::buffer_object::CachePolicy;
use crate::memory::context::OsContext;
use crate::memory::handle::BoHandleWrapper;
use crate::memory::manager::{DrmMemoryManager, ImportedHandles};
use crate::memory::MAX_TILES;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::mem;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

// ===============================================================================================
// Wire Format
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IpcMemoryType {
    Device = 0,
    Host = 1,
    Shared = 2,
}

impl TryFrom<u8> for IpcMemoryType {
    type Error = DrmError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Device),
            1 => Ok(Self::Host),
            2 => Ok(Self::Shared),
            other => Err(DrmError::InvalidArgument(format!("unknown IPC memory type {other}"))),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcHandleHeader {
    pub memory_type: u8,
    pub tile_count: u8,
    pub tile_index: u8,
    pub tiling_mode: u8,
    pub reserved: u32,
}

/// One exported buffer object.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcDescriptor {
    /// PRIME file descriptor, widened.
    pub handle: u64,
    pub size: u64,
    pub header: IpcHandleHeader,
}

const _: () = assert!(mem::size_of::<IpcHandleHeader>() == 8);
const _: () = assert!(mem::size_of::<IpcDescriptor>() == 24);

pub const IPC_DESCRIPTOR_SIZE: usize = mem::size_of::<IpcDescriptor>();

impl IpcDescriptor {
    /// Little-endian encoding, field by field.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; IPC_DESCRIPTOR_SIZE] {
        let mut out = [0u8; IPC_DESCRIPTOR_SIZE];
        out[0..8].copy_from_slice(&self.handle.to_le_bytes());
        out[8..16].copy_from_slice(&self.size.to_le_bytes());
        out[16] = self.header.memory_type;
        out[17] = self.header.tile_count;
        out[18] = self.header.tile_index;
        out[19] = self.header.tiling_mode;
        out[20..24].copy_from_slice(&self.header.reserved.to_le_bytes());
        out
    }

    /// # Errors
    /// `InvalidArgument` for a short buffer or an unknown memory type.
    pub fn from_bytes(bytes: &[u8]) -> DrmResult<Self> {
        let bytes: &[u8; IPC_DESCRIPTOR_SIZE] = bytes
            .get(..IPC_DESCRIPTOR_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| DrmError::InvalidArgument(format!("IPC descriptor needs {IPC_DESCRIPTOR_SIZE} bytes")))?;

        let word = |range: std::ops::Range<usize>| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[range]);
            u64::from_le_bytes(buf)
        };
        let descriptor = Self {
            handle: word(0..8),
            size: word(8..16),
            header: IpcHandleHeader {
                memory_type: bytes[16],
                tile_count: bytes[17],
                tile_index: bytes[18],
                tiling_mode: bytes[19],
                reserved: u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]),
            },
        };
        descriptor.memory_type()?;
        Ok(descriptor)
    }

    /// # Errors
    /// `InvalidArgument` for an unknown memory type byte.
    pub fn memory_type(&self) -> DrmResult<IpcMemoryType> {
        IpcMemoryType::try_from(self.header.memory_type)
    }

    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub const fn fd(&self) -> RawFd {
        self.handle as RawFd
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportFlags {
    /// Map the imported memory uncached.
    pub uncached: bool,
}

// ===============================================================================================
// Exchange
// ===============================================================================================

/// Export and import of allocations for one root device.
///
/// Keeps a registry of kernel handles known to this process so that
/// importing a descriptor for memory that is still alive here joins the
/// existing owners instead of creating a second exclusive one.
#[derive(Debug)]
pub struct IpcExchange {
    manager: Arc<DrmMemoryManager>,
    shared: Mutex<HashMap<u32, BoHandleWrapper>>,
    imports: AtomicU64,
}

impl IpcExchange {
    #[must_use]
    pub fn new(manager: Arc<DrmMemoryManager>) -> Self {
        Self {
            manager,
            shared: Mutex::new(HashMap::new()),
            imports: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn manager(&self) -> &Arc<DrmMemoryManager> {
        &self.manager
    }

    /// Number of imports performed so far.
    #[must_use]
    pub fn import_count(&self) -> u64 {
        self.imports.load(Ordering::Relaxed)
    }

    fn prune_shared(&self) {
        self.shared.lock().retain(|_, weak| weak.strong_count() > 0);
    }

    fn register_shared(&self, wrapper: &BoHandleWrapper) {
        let mut shared = self.shared.lock();
        shared.retain(|_, weak| weak.strong_count() > 0);
        shared
            .entry(wrapper.handle())
            .or_insert_with(|| wrapper.acquire_weak_ownership());
    }

    /// Join the live owners of `handle`, or become its first owner here.
    fn reference_shared(&self, handle: u32) -> BoHandleWrapper {
        let mut shared = self.shared.lock();
        if let Some(owner) = shared.get(&handle).and_then(BoHandleWrapper::upgrade) {
            debug!(handle, "import joins existing owner");
            return owner;
        }
        let fresh = BoHandleWrapper::new(handle);
        shared.insert(handle, fresh.acquire_weak_ownership());
        fresh
    }

    fn close_fds(&self, fds: &[RawFd]) {
        for &fd in fds {
            if let Err(e) = self.manager.drm().close_prime_fd(fd) {
                warn!(fd, "failed to close PRIME descriptor: {e}");
            }
        }
    }

    /// One descriptor per buffer object of `alloc`, in tile order.
    ///
    /// # Errors
    /// `OutOfHostMemory` if any conversion fails; no descriptor is returned
    /// and the ones already created are closed.
    pub fn get_ipc_handles(
        &self,
        alloc: &DrmAllocation,
        memory_type: IpcMemoryType,
    ) -> DrmResult<Vec<IpcDescriptor>> {
        let tile_count = alloc.num_handles();
        let mut fds = Vec::with_capacity(tile_count);
        for bo in alloc.buffer_objects() {
            match bo.export_prime_fd() {
                Ok(fd) => fds.push(fd),
                Err(e) => {
                    warn!(id = alloc.id(), handle = bo.handle(), "IPC export failed: {e}");
                    self.close_fds(&fds);
                    return Err(DrmError::OutOfHostMemory);
                }
            }
        }

        for bo in alloc.buffer_objects() {
            self.register_shared(bo.handle_wrapper());
        }
        alloc.record_exported_fds(&fds);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let descriptors = alloc
            .buffer_objects()
            .zip(&fds)
            .enumerate()
            .map(|(index, (bo, &fd))| IpcDescriptor {
                handle: fd as u64,
                size: bo.size(),
                header: IpcHandleHeader {
                    memory_type: memory_type as u8,
                    tile_count: tile_count as u8,
                    tile_index: index as u8,
                    tiling_mode: bo.tiling_mode() as u8,
                    reserved: 0,
                },
            })
            .collect();
        debug!(id = alloc.id(), tile_count, "exported IPC handles");
        Ok(descriptors)
    }

    /// Single-descriptor export for allocations backed by one buffer object.
    ///
    /// # Errors
    /// `InvalidArgument` for multi-handle allocations, otherwise as
    /// [`get_ipc_handles`](Self::get_ipc_handles).
    pub fn get_ipc_handle(
        &self,
        alloc: &DrmAllocation,
        memory_type: IpcMemoryType,
    ) -> DrmResult<IpcDescriptor> {
        if alloc.num_handles() != 1 {
            return Err(DrmError::InvalidArgument(format!(
                "allocation {} has {} handles",
                alloc.id(),
                alloc.num_handles()
            )));
        }
        let mut descriptors = self.get_ipc_handles(alloc, memory_type)?;
        descriptors
            .pop()
            .ok_or_else(|| DrmError::Failed("no descriptor exported".into()))
    }

    fn validate(descriptors: &[IpcDescriptor], expected: IpcMemoryType) -> DrmResult<()> {
        let Some(first) = descriptors.first() else {
            return Err(DrmError::InvalidArgument("no IPC descriptors".into()));
        };
        let declared = first.memory_type()?;
        if declared != expected {
            return Err(DrmError::InvalidArgument(format!(
                "descriptor declares {declared:?} memory, caller expects {expected:?}"
            )));
        }
        if expected == IpcMemoryType::Host && descriptors.len() != 1 {
            return Err(DrmError::InvalidArgument(
                "host allocations are exported as a single handle".into(),
            ));
        }
        if descriptors.len() > MAX_TILES || usize::from(first.header.tile_count) != descriptors.len() {
            return Err(DrmError::InvalidArgument(format!(
                "{} descriptors for a {}-tile allocation",
                descriptors.len(),
                first.header.tile_count
            )));
        }
        for (index, descriptor) in descriptors.iter().enumerate() {
            if descriptor.header.memory_type != first.header.memory_type
                || descriptor.header.tile_count != first.header.tile_count
                || usize::from(descriptor.header.tile_index) != index
            {
                return Err(DrmError::InvalidArgument(format!(
                    "descriptor {index} does not belong to the same allocation"
                )));
            }
        }
        Ok(())
    }

    /// Reconstruct an allocation from `descriptors` and make it resident in `ctx`.
    ///
    /// Each import bumps a process-wide counter whose value becomes the new
    /// allocation's import tag.
    ///
    /// # Errors
    /// `InvalidArgument` for a descriptor set that does not match `expected`
    /// or its own tile count; kernel errors from the PRIME conversion or the bind.
    /// A failed import closes the handles it was the only owner of.
    pub fn open_ipc_handles(
        &self,
        descriptors: &[IpcDescriptor],
        expected: IpcMemoryType,
        flags: ImportFlags,
        ctx: &OsContext,
    ) -> DrmResult<Arc<DrmAllocation>> {
        Self::validate(descriptors, expected)?;

        let drm = self.manager.drm();
        let mut handles = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            match drm.prime_fd_to_handle(descriptor.fd()) {
                Ok(handle) => handles.push(self.reference_shared(handle)),
                Err(e) => {
                    self.manager.release_handles(handles);
                    self.prune_shared();
                    return Err(DrmError::from_errno("prime_fd_to_handle", e));
                }
            }
        }

        let (allocation_type, memory_pool) = match expected {
            IpcMemoryType::Host => (AllocationType::BufferHostMemory, MemoryPool::System4KBPages),
            IpcMemoryType::Device | IpcMemoryType::Shared => (AllocationType::SharedBuffer, MemoryPool::LocalMemory),
        };
        let import_tag = self.imports.fetch_add(1, Ordering::AcqRel) + 1;
        let created = self.manager.create_allocation_from_handles(ImportedHandles {
            handles,
            size: descriptors.iter().map(|d| d.size).max().unwrap_or(0),
            allocation_type,
            memory_pool,
            tiling_mode: u32::from(descriptors[0].header.tiling_mode),
            cache_policy: if flags.uncached { CachePolicy::Uncached } else { CachePolicy::WriteBack },
            import_tag,
        });
        let alloc = match created {
            Ok(alloc) => alloc,
            Err(e) => {
                self.prune_shared();
                return Err(e);
            }
        };

        if let Err(e) = self
            .manager
            .handler()
            .make_resident_within_os_context(ctx, std::slice::from_ref(&alloc), true)
        {
            warn!(import_tag, "imported allocation could not be made resident: {e}");
            if let Err(free_err) = self.manager.free(alloc) {
                warn!(import_tag, "cleanup of failed import: {free_err}");
            }
            self.prune_shared();
            return Err(e);
        }

        debug!(import_tag, tiles = descriptors.len(), context = ctx.context_id(), "opened IPC handles");
        Ok(alloc)
    }

    /// Single-descriptor import.
    ///
    /// # Errors
    /// As [`open_ipc_handles`](Self::open_ipc_handles).
    pub fn open_ipc_handle(
        &self,
        descriptor: &IpcDescriptor,
        expected: IpcMemoryType,
        flags: ImportFlags,
        ctx: &OsContext,
    ) -> DrmResult<Arc<DrmAllocation>> {
        self.open_ipc_handles(std::slice::from_ref(descriptor), expected, flags, ctx)
    }

    /// Free an allocation created by an import. The exporter's allocation is
    /// unaffected; the kernel handle closes only if this was its last owner.
    ///
    /// # Errors
    /// `InvalidArgument` if `alloc` was not imported; otherwise as
    /// [`DrmMemoryManager::free`].
    pub fn close_ipc_handle(&self, alloc: Arc<DrmAllocation>) -> DrmResult<()> {
        if alloc.import_tag().is_none() {
            return Err(DrmError::InvalidArgument(format!(
                "allocation {} was not imported",
                alloc.id()
            )));
        }
        let result = self.manager.free(alloc);
        self.prune_shared();
        result
    }
}
