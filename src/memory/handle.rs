//! Shared ownership of a kernel GEM handle.
//!
//! Several buffer objects (and, through PRIME import, several importers in the
//! same process) can name the same kernel handle. The handle must be closed
//! exactly once, by the last strong owner. Weak owners only observe it.

use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
struct RefCounts {
    strong: u32,
    weak: u32,
}

#[derive(Debug)]
struct ControlBlock {
    counts: Mutex<RefCounts>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Strong,
    Weak,
}

/// One owner's view of a kernel handle.
///
/// Dropping the wrapper releases its count; it never closes the kernel
/// handle itself. The owning buffer object consults [`can_close`](Self::can_close)
/// before issuing the close.
#[derive(Debug)]
pub struct BoHandleWrapper {
    handle: u32,
    ownership: Ownership,
    control: Arc<ControlBlock>,
}

impl BoHandleWrapper {
    /// Wrap a freshly created handle; the caller becomes its sole strong owner.
    #[must_use]
    pub fn new(handle: u32) -> Self {
        Self {
            handle,
            ownership: Ownership::Strong,
            control: Arc::new(ControlBlock {
                counts: Mutex::new(RefCounts { strong: 1, weak: 0 }),
            }),
        }
    }

    /// Add a strong owner. The handle stays open while it lives.
    #[must_use]
    pub fn acquire_shared_ownership(&self) -> Self {
        self.control.counts.lock().strong += 1;
        Self {
            handle: self.handle,
            ownership: Ownership::Strong,
            control: Arc::clone(&self.control),
        }
    }

    /// Add an observer that never keeps the handle open.
    #[must_use]
    pub fn acquire_weak_ownership(&self) -> Self {
        self.control.counts.lock().weak += 1;
        Self {
            handle: self.handle,
            ownership: Ownership::Weak,
            control: Arc::clone(&self.control),
        }
    }

    /// Turn an observer back into a strong owner, unless the handle is already gone.
    #[must_use]
    pub fn upgrade(&self) -> Option<Self> {
        let mut counts = self.control.counts.lock();
        if counts.strong == 0 {
            return None;
        }
        counts.strong += 1;
        drop(counts);

        Some(Self {
            handle: self.handle,
            ownership: Ownership::Strong,
            control: Arc::clone(&self.control),
        })
    }

    /// True when no other strong owner would be left holding a closed handle.
    #[must_use]
    pub fn can_close(&self) -> bool {
        self.control.counts.lock().strong <= 1
    }

    #[must_use]
    pub const fn handle(&self) -> u32 {
        self.handle
    }

    #[must_use]
    pub const fn ownership(&self) -> Ownership {
        self.ownership
    }

    #[must_use]
    pub fn is_weak(&self) -> bool {
        self.ownership == Ownership::Weak
    }

    #[must_use]
    pub fn strong_count(&self) -> u32 {
        self.control.counts.lock().strong
    }

    #[must_use]
    pub fn weak_count(&self) -> u32 {
        self.control.counts.lock().weak
    }
}

impl Drop for BoHandleWrapper {
    fn drop(&mut self) {
        let mut counts = self.control.counts.lock();
        match self.ownership {
            Ownership::Strong => counts.strong = counts.strong.saturating_sub(1),
            Ownership::Weak => counts.weak = counts.weak.saturating_sub(1),
        }
    }
}
