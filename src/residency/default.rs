use super::{MemoryOperationsHandler, SubmissionKind, Tracker, contains, remove};
use crate::error::DrmResult;
use crate::memory::context::OsContext;
use crate::memory::retry::EvictUnused;
use crate::memory::{DrmAllocation, ResidencyState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct DefaultState {
    tracker: Tracker,
    // context id -> allocations resident there
    resident: HashMap<u32, Vec<Arc<DrmAllocation>>>,
}

impl DefaultState {
    fn make_resident_within(
        &mut self,
        ctx: &OsContext,
        allocs: &[Arc<DrmAllocation>],
        evictable: bool,
    ) -> DrmResult<()> {
        let task_count = ctx.engine().task_count();
        let list = self.resident.entry(ctx.context_id()).or_default();
        for alloc in allocs {
            alloc.make_resident_across_context_tiles(ctx, task_count, !evictable)?;
            if !contains(list, alloc) {
                list.push(Arc::clone(alloc));
            }
        }
        Ok(())
    }

    fn evict_within(&mut self, ctx: &OsContext, alloc: &DrmAllocation) -> DrmResult<()> {
        alloc.evict_from_context_tiles(ctx, ctx.device_bitfield())?;
        if let Some(list) = self.resident.get_mut(&ctx.context_id()) {
            remove(list, alloc);
        }
        Ok(())
    }
}

/// Software-tracked residency: no kernel binds, just a per-context list
/// merged into every submission.
#[derive(Debug, Default)]
pub struct DefaultResidencyHandler {
    state: Mutex<DefaultState>,
}

impl DefaultResidencyHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocations currently listed as resident in `ctx`.
    #[must_use]
    pub fn resident_count(&self, ctx: &OsContext) -> usize {
        self.state
            .lock()
            .resident
            .get(&ctx.context_id())
            .map_or(0, Vec::len)
    }
}

impl EvictUnused for DefaultResidencyHandler {
    fn evict_unused_allocations(&self, wait_for_completion: bool) -> DrmResult<()> {
        let mut guard = self.state.lock();
        let DefaultState { tracker, resident } = &mut *guard;
        tracker.sweep(wait_for_completion, |ctx, alloc, tiles| {
            alloc.evict_from_context_tiles(ctx, tiles)?;
            if alloc.residency_state(ctx) == ResidencyState::NotResident {
                if let Some(list) = resident.get_mut(&ctx.context_id()) {
                    remove(list, alloc);
                }
            }
            Ok(())
        })?;
        Ok(())
    }
}

impl MemoryOperationsHandler for DefaultResidencyHandler {
    fn register_engine(&self, ctx: Arc<OsContext>) -> DrmResult<()> {
        let mut state = self.state.lock();
        if !state.tracker.register_engine(&ctx) {
            warn!(context = ctx.context_id(), "context already registered");
            return Ok(());
        }
        let pinned = state.tracker.pinned.clone();
        state.make_resident_within(&ctx, &pinned, false)
    }

    fn register_allocation(&self, alloc: &Arc<DrmAllocation>) {
        self.state.lock().tracker.register_allocation(alloc);
    }

    fn unregister_allocation(&self, alloc: &DrmAllocation) {
        let mut state = self.state.lock();
        state.tracker.unregister_allocation(alloc);
        for list in state.resident.values_mut() {
            remove(list, alloc);
        }
    }

    fn make_resident(&self, allocs: &[Arc<DrmAllocation>]) -> DrmResult<()> {
        let mut state = self.state.lock();
        let engines = state.tracker.engines.clone();
        for ctx in &engines {
            state.make_resident_within(ctx, allocs, false)?;
        }
        state.tracker.pin(allocs);
        Ok(())
    }

    fn evict(&self, alloc: &DrmAllocation) -> DrmResult<()> {
        let mut state = self.state.lock();
        remove(&mut state.tracker.pinned, alloc);
        let engines = state.tracker.engines.clone();
        for ctx in &engines {
            state.evict_within(ctx, alloc)?;
        }
        Ok(())
    }

    fn is_resident(&self, alloc: &DrmAllocation) -> bool {
        self.state.lock().tracker.is_resident(alloc)
    }

    fn make_resident_within_os_context(
        &self,
        ctx: &OsContext,
        allocs: &[Arc<DrmAllocation>],
        evictable: bool,
    ) -> DrmResult<()> {
        self.state.lock().make_resident_within(ctx, allocs, evictable)
    }

    fn evict_within_os_context(&self, ctx: &OsContext, alloc: &DrmAllocation) -> DrmResult<()> {
        self.state.lock().evict_within(ctx, alloc)
    }

    fn merge_with_residency_container(
        &self,
        ctx: &OsContext,
        container: &mut Vec<Arc<DrmAllocation>>,
        _kind: SubmissionKind,
    ) -> DrmResult<()> {
        let state = self.state.lock();
        if let Some(list) = state.resident.get(&ctx.context_id()) {
            let before = container.len();
            for alloc in list {
                if !contains(container, alloc) {
                    container.push(Arc::clone(alloc));
                }
            }
            debug!(
                context = ctx.context_id(),
                merged = container.len() - before,
                "merged residency list"
            );
        }
        Ok(())
    }
}
