//! Residency tracking for one root device.
//!
//! Two handlers implement [`MemoryOperationsHandler`]:
//!
//! - [`DefaultResidencyHandler`] keeps a software list of resident allocations
//!   per context and hands it to every submission; the kernel binds implicitly
//!   at exec time.
//! - [`BindResidencyHandler`] issues explicit VM binds and treats the buffer
//!   objects' bind tables as the source of truth.
//!
//! Each handler serializes every bind, unbind and sweep behind one mutex.

pub mod bind;
pub mod default;

pub use bind::BindResidencyHandler;
pub use default::DefaultResidencyHandler;

use crate::config::ResidencyConfig;
use crate::drm::DrmInterface;
use crate::error::{DrmError, DrmResult};
use crate::memory::context::{DeviceBitfield, OsContext, WaitStatus};
use crate::memory::retry::EvictUnused;
use crate::memory::{DrmAllocation, MAX_TILES, ResidencyState};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubmissionKind {
    /// Regular submission: the full residency set is merged.
    #[default]
    Standard,
    /// Light-weight submission without explicit sync; the residency set is
    /// only re-merged when new resources were bound since the last one.
    Light,
}

pub trait MemoryOperationsHandler: EvictUnused + Send + Sync + fmt::Debug {
    /// Add an execution context. Allocations already made resident
    /// device-wide become resident in it too.
    ///
    /// # Errors
    /// A bind failure while applying the device-wide set.
    fn register_engine(&self, ctx: Arc<OsContext>) -> DrmResult<()>;

    /// Track `alloc` for eviction sweeps.
    fn register_allocation(&self, alloc: &Arc<DrmAllocation>);

    /// Stop tracking `alloc` everywhere.
    fn unregister_allocation(&self, alloc: &DrmAllocation);

    /// Pin `allocs` in every registered context, and in contexts registered later.
    ///
    /// # Errors
    /// `OutOfMemory` when a bind is rejected.
    fn make_resident(&self, allocs: &[Arc<DrmAllocation>]) -> DrmResult<()>;

    /// Evict `alloc` from every registered context and drop its device-wide pin.
    ///
    /// # Errors
    /// The first unbind failure.
    fn evict(&self, alloc: &DrmAllocation) -> DrmResult<()>;

    /// True iff `alloc` is pinned in every registered context.
    fn is_resident(&self, alloc: &DrmAllocation) -> bool;

    /// Make `allocs` resident in `ctx`. Non-evictable allocations are pinned
    /// until explicitly evicted.
    ///
    /// # Errors
    /// `OutOfMemory` when a bind is rejected.
    fn make_resident_within_os_context(
        &self,
        ctx: &OsContext,
        allocs: &[Arc<DrmAllocation>],
        evictable: bool,
    ) -> DrmResult<()>;

    /// # Errors
    /// The first unbind failure.
    fn evict_within_os_context(&self, ctx: &OsContext, alloc: &DrmAllocation) -> DrmResult<()>;

    /// Append the resident set of `ctx` to `container`, skipping entries it
    /// already holds.
    ///
    /// # Errors
    /// A bind failure on the explicit-bind path.
    fn merge_with_residency_container(
        &self,
        ctx: &OsContext,
        container: &mut Vec<Arc<DrmAllocation>>,
        kind: SubmissionKind,
    ) -> DrmResult<()>;

    /// The allocations the command-buffer encoder must list for `ctx`.
    ///
    /// # Errors
    /// See [`merge_with_residency_container`](Self::merge_with_residency_container).
    fn ensure_resident_set(&self, ctx: &OsContext) -> DrmResult<Vec<Arc<DrmAllocation>>> {
        let mut container = Vec::new();
        self.merge_with_residency_container(ctx, &mut container, SubmissionKind::Standard)?;
        Ok(container)
    }
}

/// Build the handler `config` asks for on this kernel.
#[must_use]
pub fn create_handler(
    drm: &dyn DrmInterface,
    config: &ResidencyConfig,
) -> Arc<dyn MemoryOperationsHandler> {
    if config.use_vm_bind(drm.is_vm_bind_available()) {
        info!(sub_devices = config.sub_device_count, "using explicit VM bind residency");
        Arc::new(BindResidencyHandler::new())
    } else {
        info!(sub_devices = config.sub_device_count, "using software residency tracking");
        Arc::new(DefaultResidencyHandler::new())
    }
}

// ===============================================================================================
// Shared bookkeeping
// ===============================================================================================

pub(crate) fn contains(list: &[Arc<DrmAllocation>], alloc: &DrmAllocation) -> bool {
    list.iter().any(|entry| std::ptr::eq(entry.as_ref(), alloc))
}

pub(crate) fn remove(list: &mut Vec<Arc<DrmAllocation>>, alloc: &DrmAllocation) {
    list.retain(|entry| !std::ptr::eq(entry.as_ref(), alloc));
}

/// State common to both handlers; always accessed under the handler's lock.
#[derive(Debug, Default)]
pub(crate) struct Tracker {
    pub engines: Vec<Arc<OsContext>>,
    pub allocations: Vec<Arc<DrmAllocation>>,
    /// Made resident device-wide through `make_resident`.
    pub pinned: Vec<Arc<DrmAllocation>>,
    /// Set when a bind reached the kernel since the last merge. Only
    /// explicit-bind residency consults it.
    pub new_resources: bool,
}

impl Tracker {
    /// Returns `false` if a context with the same id is already registered.
    pub fn register_engine(&mut self, ctx: &Arc<OsContext>) -> bool {
        if self.engines.iter().any(|e| e.context_id() == ctx.context_id()) {
            return false;
        }
        self.engines.push(Arc::clone(ctx));
        true
    }

    pub fn register_allocation(&mut self, alloc: &Arc<DrmAllocation>) {
        if !contains(&self.allocations, alloc) {
            self.allocations.push(Arc::clone(alloc));
        }
    }

    pub fn unregister_allocation(&mut self, alloc: &DrmAllocation) {
        remove(&mut self.allocations, alloc);
        remove(&mut self.pinned, alloc);
    }

    pub fn pin(&mut self, allocs: &[Arc<DrmAllocation>]) {
        for alloc in allocs {
            if !contains(&self.pinned, alloc) {
                self.pinned.push(Arc::clone(alloc));
            }
        }
    }

    pub fn is_resident(&self, alloc: &DrmAllocation) -> bool {
        !self.engines.is_empty() && self.engines.iter().all(|ctx| alloc.is_always_resident(ctx))
    }

    /// Evict unused allocations, one sub-device at a time.
    ///
    /// For each sub-device, an allocation is a candidate iff it is bound there
    /// in at least one context spanning it and, for every such context, it is
    /// neither locked nor pinned and its last use has retired. With
    /// `wait_for_completion` the sweep first blocks until that last use
    /// retires. Candidates are evicted from that sub-device only, then the
    /// scan restarts for the next one, so a shared allocation can stay
    /// resident on a sub-device whose engine still needs it.
    ///
    /// Returns the number of (allocation, sub-device) evictions.
    pub fn sweep<F>(&self, wait_for_completion: bool, mut evict: F) -> DrmResult<usize>
    where
        F: FnMut(&OsContext, &Arc<DrmAllocation>, DeviceBitfield) -> DrmResult<()>,
    {
        let mut evicted = 0;
        let mut candidates: Vec<&Arc<DrmAllocation>> = Vec::new();

        for sub_device in 0..MAX_TILES as u32 {
            let engines: Vec<&OsContext> = self
                .engines
                .iter()
                .map(|ctx| &**ctx)
                .filter(|ctx| ctx.device_bitfield().test(sub_device))
                .collect();
            if engines.is_empty() {
                continue;
            }

            'allocations: for alloc in &self.allocations {
                if alloc.is_locked() {
                    continue;
                }
                let mut bound = false;
                for &ctx in &engines {
                    let state = alloc.residency_state(ctx);
                    if state == ResidencyState::AlwaysResident {
                        continue 'allocations;
                    }
                    if !alloc.is_bound_on_tile(ctx, sub_device) {
                        continue;
                    }
                    bound = true;

                    let engine = ctx.engine();
                    if let (true, ResidencyState::LastUsed(task_count)) = (wait_for_completion, state) {
                        if engine.wait_for_task_count(task_count) == WaitStatus::GpuHang {
                            error!(context = ctx.context_id(), task_count, "GPU hang while waiting to evict");
                            return Err(DrmError::GpuHang);
                        }
                    }
                    if !state.is_retired_by(engine.last_completed_task_count()) {
                        continue 'allocations;
                    }
                }
                if bound {
                    candidates.push(alloc);
                }
            }

            for alloc in candidates.drain(..) {
                for &ctx in &engines {
                    if alloc.is_bound_on_tile(ctx, sub_device) {
                        evict(ctx, alloc, DeviceBitfield::single(sub_device))?;
                    }
                }
                evicted += 1;
            }
        }

        debug!(evicted, wait_for_completion, "eviction sweep finished");
        Ok(evicted)
    }
}
