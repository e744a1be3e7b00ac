//! Submission retry ladder.
//!
//! A rejected submission is retried at most twice. Before the second attempt
//! unused allocations are swept without waiting on the GPU; before the third
//! the sweep first waits for outstanding work, so anything still referenced
//! only by retired submissions can be reclaimed.

use crate::error::{DrmError, DrmResult};
use tracing::{error, warn};

/// Something that can reclaim memory no pending GPU work refers to.
pub trait EvictUnused {
    /// Evict every allocation that no engine still needs.
    ///
    /// # Errors
    /// `GpuHang` if an engine was found hung while waiting for completion.
    fn evict_unused_allocations(&self, wait_for_completion: bool) -> DrmResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStage {
    FirstAttempt,
    AfterEviction,
    AfterEvictionWithWait,
}

impl RetryStage {
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::FirstAttempt => Some(Self::AfterEviction),
            Self::AfterEviction => Some(Self::AfterEvictionWithWait),
            Self::AfterEvictionWithWait => None,
        }
    }

    /// Whether the sweep that precedes this stage blocks on GPU completion.
    #[must_use]
    pub const fn waits_for_completion(self) -> bool {
        matches!(self, Self::AfterEvictionWithWait)
    }

    #[must_use]
    pub const fn attempt(self) -> u32 {
        match self {
            Self::FirstAttempt => 1,
            Self::AfterEviction => 2,
            Self::AfterEvictionWithWait => 3,
        }
    }
}

/// Run `submit`, sweeping unused memory between failed attempts.
///
/// `Unsupported`, `InvalidArgument` and `GpuHang` from the submission end the
/// ladder at once. A hang found by a sweep is returned immediately; other
/// sweep failures are logged and the next attempt still runs.
///
/// # Errors
/// The last submission error once every stage is exhausted, or the first
/// non-retryable one.
pub fn submit_with_eviction_retry<F>(evictor: &dyn EvictUnused, mut submit: F) -> DrmResult<()>
where
    F: FnMut(RetryStage) -> DrmResult<()>,
{
    let mut stage = RetryStage::FirstAttempt;
    loop {
        let err = match submit(stage) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Err(err);
        }
        let Some(next) = stage.next() else {
            warn!(attempts = stage.attempt(), %err, "submission failed after eviction retries");
            return Err(err);
        };

        let wait = next.waits_for_completion();
        warn!(attempt = stage.attempt(), wait, %err, "submission failed, evicting unused allocations");
        match evictor.evict_unused_allocations(wait) {
            Ok(()) => {}
            Err(DrmError::GpuHang) => {
                error!("GPU hang detected while evicting for submission retry");
                return Err(DrmError::GpuHang);
            }
            Err(sweep_err) => warn!(%sweep_err, "eviction sweep failed, retrying anyway"),
        }
        stage = next;
    }
}
