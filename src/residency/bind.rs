use super::{MemoryOperationsHandler, SubmissionKind, Tracker, contains, remove};
use crate::error::{DrmError, DrmResult};
use crate::memory::context::OsContext;
use crate::memory::retry::EvictUnused;
use crate::memory::{DrmAllocation, ResidencyState};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

fn sweep_locked(tracker: &Tracker, wait_for_completion: bool) -> DrmResult<usize> {
    tracker.sweep(wait_for_completion, |ctx, alloc, tiles| {
        alloc.evict_from_context_tiles(ctx, tiles)
    })
}

fn make_resident_locked(
    tracker: &mut Tracker,
    ctx: &OsContext,
    allocs: &[Arc<DrmAllocation>],
    evictable: bool,
) -> DrmResult<()> {
    let task_count = ctx.engine().task_count();
    for alloc in allocs {
        match alloc.make_resident_across_context_tiles(ctx, task_count, !evictable) {
            Ok(newly_bound) => tracker.new_resources |= newly_bound,
            Err(DrmError::OutOfMemory) => {
                warn!(
                    context = ctx.context_id(),
                    allocation = alloc.id(),
                    "no space left binding allocation, evicting unused allocations"
                );
                if let Err(e) = sweep_locked(tracker, false) {
                    warn!("eviction after failed bind did not complete: {e}");
                }
                return Err(DrmError::OutOfMemory);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Explicit-bind residency: every resident allocation is VM-bound into the
/// context's address space, and the bind tables are the resident set.
#[derive(Debug, Default)]
pub struct BindResidencyHandler {
    state: Mutex<Tracker>,
}

impl BindResidencyHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EvictUnused for BindResidencyHandler {
    fn evict_unused_allocations(&self, wait_for_completion: bool) -> DrmResult<()> {
        sweep_locked(&self.state.lock(), wait_for_completion).map(drop)
    }
}

impl MemoryOperationsHandler for BindResidencyHandler {
    fn register_engine(&self, ctx: Arc<OsContext>) -> DrmResult<()> {
        let mut tracker = self.state.lock();
        if !tracker.register_engine(&ctx) {
            warn!(context = ctx.context_id(), "context already registered");
            return Ok(());
        }
        let pinned = tracker.pinned.clone();
        make_resident_locked(&mut tracker, &ctx, &pinned, false)
    }

    fn register_allocation(&self, alloc: &Arc<DrmAllocation>) {
        self.state.lock().register_allocation(alloc);
    }

    fn unregister_allocation(&self, alloc: &DrmAllocation) {
        self.state.lock().unregister_allocation(alloc);
    }

    fn make_resident(&self, allocs: &[Arc<DrmAllocation>]) -> DrmResult<()> {
        let mut tracker = self.state.lock();
        let engines = tracker.engines.clone();
        for ctx in &engines {
            make_resident_locked(&mut tracker, ctx, allocs, false)?;
        }
        tracker.pin(allocs);
        Ok(())
    }

    fn evict(&self, alloc: &DrmAllocation) -> DrmResult<()> {
        let mut tracker = self.state.lock();
        remove(&mut tracker.pinned, alloc);
        for ctx in &tracker.engines {
            alloc.evict_from_context_tiles(ctx, ctx.device_bitfield())?;
        }
        Ok(())
    }

    fn is_resident(&self, alloc: &DrmAllocation) -> bool {
        self.state.lock().is_resident(alloc)
    }

    fn make_resident_within_os_context(
        &self,
        ctx: &OsContext,
        allocs: &[Arc<DrmAllocation>],
        evictable: bool,
    ) -> DrmResult<()> {
        make_resident_locked(&mut self.state.lock(), ctx, allocs, evictable)
    }

    fn evict_within_os_context(&self, ctx: &OsContext, alloc: &DrmAllocation) -> DrmResult<()> {
        let _serialized = self.state.lock();
        alloc.evict_from_context_tiles(ctx, ctx.device_bitfield())
    }

    fn merge_with_residency_container(
        &self,
        ctx: &OsContext,
        container: &mut Vec<Arc<DrmAllocation>>,
        kind: SubmissionKind,
    ) -> DrmResult<()> {
        let mut tracker = self.state.lock();

        // Whatever the submission already lists must be bound before it runs.
        let listed = container.clone();
        make_resident_locked(&mut tracker, ctx, &listed, true)?;

        if kind == SubmissionKind::Light && !tracker.new_resources {
            return Ok(());
        }

        let before = container.len();
        for alloc in &tracker.allocations {
            if alloc.residency_state(ctx) != ResidencyState::NotResident && !contains(container, alloc) {
                container.push(Arc::clone(alloc));
            }
        }
        tracker.new_resources = false;
        debug!(
            context = ctx.context_id(),
            merged = container.len() - before,
            "merged bound allocations"
        );
        Ok(())
    }
}
