//! Sequence counter encoding for the dual-slot seqlock
//!
//! ```text
//!  31                                   2   1   0
//! ┌───────────────────────────────────────┬───┬───┐
//! │ epoch                                 │ R │ A │
//! └───────────────────────────────────────┴───┴───┘
//!   A = active slot index
//!   R = RT write in progress
//! ```
//!
//! The counter only moves through `fetch_add(2)` (RT begin/end) and the
//! non-RT commit CAS `start -> (start + 4) ^ 1`. All arithmetic wraps.

use seqshm::consts::{SEQ_ACTIVE_BIT, SEQ_COMMIT_STEP, SEQ_RT_BIT, SEQ_RT_STEP};
use std::sync::atomic::{AtomicU32, Ordering, fence};

/// Index of the slot readers see at sequence value `seq`
#[inline]
pub const fn active_slot(seq: u32) -> usize {
    (seq & SEQ_ACTIVE_BIT) as usize
}

/// Index of the slot the next non-RT write targets at sequence value `seq`
#[inline]
pub const fn shadow_slot(seq: u32) -> usize {
    active_slot(seq) ^ 1
}

/// Whether an RT writer is mutating the active slot at `seq`
#[inline]
pub const fn is_rt_in_progress(seq: u32) -> bool {
    seq & SEQ_RT_BIT != 0
}

/// Value a non-RT commit started at `start` installs
#[inline]
pub const fn commit_target(start: u32) -> u32 {
    start.wrapping_add(SEQ_COMMIT_STEP) ^ SEQ_ACTIVE_BIT
}

/// Epoch part of `seq` (bits >= 2)
#[inline]
pub const fn epoch(seq: u32) -> u32 {
    seq >> 2
}

/// Accessor over the counter stored inside a mapped region
#[derive(Clone, Copy)]
pub struct SequenceCounter<'a> {
    counter: &'a AtomicU32,
}

impl<'a> SequenceCounter<'a> {
    /// Wrap an in-region counter
    pub fn new(counter: &'a AtomicU32) -> Self {
        Self { counter }
    }

    /// Current value with acquire ordering
    #[inline]
    pub fn load(&self) -> u32 {
        self.counter.load(Ordering::Acquire)
    }

    /// Re-read after consuming slot data
    ///
    /// The acquire fence orders the preceding slot reads before the load,
    /// pairing with the writers' release on the counter.
    #[inline]
    pub fn load_after_read(&self) -> u32 {
        fence(Ordering::Acquire);
        self.counter.load(Ordering::Relaxed)
    }

    /// Announce an RT write: add 2, setting bit 1
    ///
    /// Returns the new value. Caller must hold the RT lock.
    #[inline]
    pub fn begin_rt(&self) -> u32 {
        let value = self
            .counter
            .fetch_add(SEQ_RT_STEP, Ordering::AcqRel)
            .wrapping_add(SEQ_RT_STEP);
        // slot stores must not become visible before the flag
        fence(Ordering::Release);
        value
    }

    /// Finish an RT write: add 2, clearing bit 1
    #[inline]
    pub fn end_rt(&self) -> u32 {
        self.counter
            .fetch_add(SEQ_RT_STEP, Ordering::Release)
            .wrapping_add(SEQ_RT_STEP)
    }

    /// Non-RT commit: flip the active slot if nothing moved since `start`
    ///
    /// Returns the observed value on failure.
    #[inline]
    pub fn try_commit(&self, start: u32) -> Result<u32, u32> {
        let target = commit_target(start);
        self.counter
            .compare_exchange(start, target, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| target)
    }

    /// Zero the counter; only valid before the region is published
    pub(crate) fn reset(&self) {
        self.counter.store(0, Ordering::Release);
    }
}
