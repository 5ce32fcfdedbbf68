//! The three access procedures of the dual-slot seqlock
//!
//! * RT write: RT lock, `+2`, mutate the active slot in place, `+2`.
//! * Non-RT write: non-RT lock, then repeat { `seq_begin`, write the shadow
//!   slot, carry untouched fields over, CAS `start -> (start + 4) ^ 1` }.
//! * Read: lock-free, `seq_begin` / consume active slot / `seq_doretry`.
//!
//! Mutating slot memory outside these procedures is not supported.

use crate::backoff::Backoff;
use crate::error::{ShmError, ShmResult};
use crate::payload::{Payload, PayloadUpdate, SlotMut, SlotRef};
use crate::region::SharedRegion;
use crate::sequence::{SequenceCounter, active_slot, epoch, is_rt_in_progress, shadow_slot};
use serde::Serialize;
use tracing::{debug, trace, warn};

/// Points inside the procedures where a [`ProtocolProbe`] is invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePoint {
    /// Non-RT writer acquired the non-RT lock
    NonRtLocked,
    /// Non-RT writer is about to release the non-RT lock
    NonRtUnlocking,
    /// Non-RT writer filled the shadow slot and is about to CAS
    BeforeCommit {
        /// 1-based attempt number
        attempt: u32,
        /// Snapshot the attempt started from
        start: u32,
    },
    /// Reader consumed the slot and is about to call `seq_doretry`
    BeforeRetryCheck {
        /// 1-based attempt number
        attempt: u32,
        /// Snapshot the attempt started from
        start: u32,
    },
}

/// Hook for driving deterministic interleavings in tests
pub trait ProtocolProbe {
    /// Called at each [`ProbePoint`]
    fn hit(&mut self, point: ProbePoint);
}

/// Probe that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProbe;

impl ProtocolProbe for NoProbe {
    #[inline]
    fn hit(&mut self, _point: ProbePoint) {}
}

impl<F: FnMut(ProbePoint)> ProtocolProbe for F {
    fn hit(&mut self, point: ProbePoint) {
        self(point)
    }
}

/// Result of a committed non-RT write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonRtCommit {
    /// Counter value installed by the successful CAS
    pub sequence: u32,
    /// Number of body executions, including the successful one
    pub attempts: u32,
}

impl NonRtCommit {
    /// Slot that became active
    pub fn active_slot(&self) -> usize {
        active_slot(self.sequence)
    }
}

/// Consistent copy of the active slot
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Counter value the copy was validated against
    pub sequence: u32,
    /// Slot contents
    pub payload: Payload,
}

impl Snapshot {
    /// Slot the copy was taken from
    pub fn active_slot(&self) -> usize {
        active_slot(self.sequence)
    }
}

/// Consistent scalar view plus counter decomposition, for status lines
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionStatus {
    /// Region name
    pub name: String,
    /// Raw counter value
    pub sequence: u32,
    /// Counter bits >= 2
    pub epoch: u32,
    /// Active slot index
    pub active_slot: usize,
    /// Integer field of the active slot
    pub integer: i32,
    /// Float field of the active slot
    pub float: f32,
}

fn ensure_initialized(region: &SharedRegion) -> ShmResult<()> {
    if region.is_initialized() {
        Ok(())
    } else {
        Err(ShmError::NotInitialized {
            name: region.name().to_string(),
        })
    }
}

/// Wait until no RT write is in progress and return the counter
pub fn seq_begin(region: &SharedRegion, backoff: &mut dyn Backoff) -> u32 {
    let seq = region.sequence();
    loop {
        let value = seq.load();
        if !is_rt_in_progress(value) {
            backoff.reset();
            return value;
        }
        backoff.snooze();
    }
}

/// Whether data read since `start` may be inconsistent
#[inline]
pub fn seq_doretry(region: &SharedRegion, start: u32) -> bool {
    region.sequence().load_after_read() != start
}

/// Ends the RT section even if the mutation closure unwinds
struct RtSection<'a> {
    seq: SequenceCounter<'a>,
}

impl Drop for RtSection<'_> {
    #[inline]
    fn drop(&mut self) {
        self.seq.end_rt();
    }
}

/// Mutate the active slot in place under the RT lock
///
/// Excluded only by other RT writers. Readers and the non-RT writer spin
/// until it finishes, and any in-flight non-RT commit fails its CAS.
pub fn rt_write<R>(
    region: &SharedRegion,
    f: impl FnOnce(&mut SlotMut<'_>) -> R,
) -> ShmResult<R> {
    ensure_initialized(region)?;
    let rt_lock = region.rt_lock();
    let _guard = rt_lock.lock()?;

    let seq = region.sequence();
    let during = seq.begin_rt();
    let section = RtSection { seq };

    // SAFETY: RT lock held and bit 1 set; readers of this slot will retry
    let mut slot = unsafe { region.slot_mut(active_slot(during)) };
    let result = f(&mut slot);

    drop(section);
    Ok(result)
}

/// Publish `update` through the shadow slot, retrying until the CAS wins
pub fn nonrt_write(
    region: &SharedRegion,
    backoff: &mut dyn Backoff,
    update: &PayloadUpdate,
) -> ShmResult<NonRtCommit> {
    nonrt_write_with(region, backoff, update, &mut NoProbe, None)
}

/// [`nonrt_write`] giving up with `RetryExhausted` after `max_attempts`
pub fn try_nonrt_write(
    region: &SharedRegion,
    backoff: &mut dyn Backoff,
    update: &PayloadUpdate,
    max_attempts: u32,
) -> ShmResult<NonRtCommit> {
    nonrt_write_with(region, backoff, update, &mut NoProbe, Some(max_attempts.max(1)))
}

/// Non-RT write with a probe and an optional attempt bound
pub fn nonrt_write_with(
    region: &SharedRegion,
    backoff: &mut dyn Backoff,
    update: &PayloadUpdate,
    probe: &mut dyn ProtocolProbe,
    max_attempts: Option<u32>,
) -> ShmResult<NonRtCommit> {
    ensure_initialized(region)?;
    let nonrt_lock = region.nonrt_lock();
    let _guard = nonrt_lock.lock()?;

    probe.hit(ProbePoint::NonRtLocked);
    let result = commit_shadow(region, backoff, update, probe, max_attempts);
    probe.hit(ProbePoint::NonRtUnlocking);
    result
}

/// Commit loop of [`nonrt_write_with`]; the caller holds the non-RT lock
fn commit_shadow(
    region: &SharedRegion,
    backoff: &mut dyn Backoff,
    update: &PayloadUpdate,
    probe: &mut dyn ProtocolProbe,
    max_attempts: Option<u32>,
) -> ShmResult<NonRtCommit> {
    let seq = region.sequence();

    let mut attempts = 0u32;
    loop {
        attempts = attempts.wrapping_add(1);
        let start = seq_begin(region, backoff);

        let active = region.slot(active_slot(start));
        // SAFETY: non-RT lock held; the shadow slot is not read by anyone
        // whose snapshot would validate after this write
        let mut shadow = unsafe { region.slot_mut(shadow_slot(start)) };
        update.apply(&mut shadow, &active);

        probe.hit(ProbePoint::BeforeCommit { attempt: attempts, start });

        match seq.try_commit(start) {
            Ok(sequence) => {
                backoff.reset();
                if attempts > 1 {
                    debug!("Non-RT write committed after {} attempts", attempts);
                }
                return Ok(NonRtCommit { sequence, attempts });
            }
            Err(observed) => {
                trace!("Non-RT commit lost: start={} observed={}", start, observed);
                if let Some(max) = max_attempts {
                    if attempts >= max {
                        warn!("Non-RT write on '{}' gave up after {} attempts", region.name(), attempts);
                        return Err(ShmError::RetryExhausted {
                            operation: "nonrt_write",
                            attempts,
                        });
                    }
                }
                backoff.snooze();
            }
        }
    }
}

/// Run `f` on the active slot until it observes a consistent state
///
/// `f` may run several times and must not act on its intermediate results.
pub fn read<T>(
    region: &SharedRegion,
    backoff: &mut dyn Backoff,
    f: impl FnMut(&SlotRef<'_>) -> T,
) -> ShmResult<T> {
    read_with(region, backoff, &mut NoProbe, None, f)
}

/// [`read`] giving up with `RetryExhausted` after `max_retries` retries
pub fn try_read<T>(
    region: &SharedRegion,
    backoff: &mut dyn Backoff,
    max_retries: u32,
    f: impl FnMut(&SlotRef<'_>) -> T,
) -> ShmResult<T> {
    read_with(region, backoff, &mut NoProbe, Some(max_retries), f)
}

/// Read with a probe and an optional retry bound
pub fn read_with<T>(
    region: &SharedRegion,
    backoff: &mut dyn Backoff,
    probe: &mut dyn ProtocolProbe,
    max_retries: Option<u32>,
    mut f: impl FnMut(&SlotRef<'_>) -> T,
) -> ShmResult<T> {
    read_validated(region, backoff, probe, max_retries, |slot, _| f(slot))
}

fn read_validated<T>(
    region: &SharedRegion,
    backoff: &mut dyn Backoff,
    probe: &mut dyn ProtocolProbe,
    max_retries: Option<u32>,
    mut f: impl FnMut(&SlotRef<'_>, u32) -> T,
) -> ShmResult<T> {
    ensure_initialized(region)?;

    let mut attempts = 0u32;
    loop {
        attempts = attempts.wrapping_add(1);
        let start = seq_begin(region, backoff);
        let value = f(&region.slot(active_slot(start)), start);

        probe.hit(ProbePoint::BeforeRetryCheck { attempt: attempts, start });

        if !seq_doretry(region, start) {
            if attempts > 1 {
                trace!("Read consistent after {} attempts", attempts);
            }
            return Ok(value);
        }

        if let Some(max) = max_retries {
            if attempts > max {
                warn!("Read on '{}' gave up after {} attempts", region.name(), attempts);
                return Err(ShmError::RetryExhausted {
                    operation: "read",
                    attempts,
                });
            }
        }
        backoff.snooze();
    }
}

/// Consistent copy of the whole active slot
pub fn read_snapshot(region: &SharedRegion, backoff: &mut dyn Backoff) -> ShmResult<Snapshot> {
    read_validated(region, backoff, &mut NoProbe, None, |slot, start| Snapshot {
        sequence: start,
        payload: slot.to_payload(),
    })
}

/// [`read_snapshot`] giving up after `max_retries` retries
pub fn try_read_snapshot(
    region: &SharedRegion,
    backoff: &mut dyn Backoff,
    max_retries: u32,
) -> ShmResult<Snapshot> {
    read_validated(region, backoff, &mut NoProbe, Some(max_retries), |slot, start| Snapshot {
        sequence: start,
        payload: slot.to_payload(),
    })
}

/// Consistent scalar fields plus counter decomposition
pub fn read_status(region: &SharedRegion, backoff: &mut dyn Backoff) -> ShmResult<RegionStatus> {
    read_validated(region, backoff, &mut NoProbe, None, |slot, start| RegionStatus {
        name: region.name().to_string(),
        sequence: start,
        epoch: epoch(start),
        active_slot: active_slot(start),
        integer: slot.integer(),
        float: slot.float(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::{SpinBackoff, YieldBackoff};
    use crate::layout::RegionLayout;
    use seqshm::consts::{SAMPLE_FLOAT, SAMPLE_INTEGER};

    fn region() -> SharedRegion {
        let mut region =
            SharedRegion::anonymous("protocol", RegionLayout::new().required_size()).unwrap();
        region.initialize().unwrap();
        region
    }

    #[test]
    fn test_uninitialized_region_is_rejected() {
        let region =
            SharedRegion::anonymous("raw", RegionLayout::new().required_size()).unwrap();
        let mut backoff = SpinBackoff;
        assert!(matches!(
            read(&region, &mut backoff, |s| s.integer()),
            Err(ShmError::NotInitialized { .. })
        ));
        assert!(matches!(
            rt_write(&region, |_| ()),
            Err(ShmError::NotInitialized { .. })
        ));
    }

    #[test]
    fn test_rt_write_mutates_active_slot_in_place() {
        let region = region();
        rt_write(&region, |slot| slot.set_integer(slot.integer() + 1)).unwrap();

        assert_eq!(region.sequence().load(), 4);
        assert_eq!(region.slot(0).integer(), SAMPLE_INTEGER + 1);
        assert_eq!(region.slot(1).integer(), SAMPLE_INTEGER);
    }

    #[test]
    fn test_rt_section_ends_on_unwind() {
        let region = region();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = rt_write(&region, |_slot: &mut SlotMut<'_>| -> i32 { panic!("writer failed") });
        }));
        assert!(result.is_err());
        let value = region.sequence().load();
        assert!(!is_rt_in_progress(value));
        assert_eq!(value, 4);
        // lock was released by the guard
        assert!(region.rt_lock().try_lock().unwrap().is_some());
    }

    #[test]
    fn test_nonrt_write_flips_and_carries_array() {
        let region = region();
        let before = region.slot(0).to_payload();
        let mut backoff = YieldBackoff;

        let update = PayloadUpdate::new().with_integer(100).with_float(3.14);
        let commit = nonrt_write(&region, &mut backoff, &update).unwrap();

        assert_eq!(commit.sequence, 5);
        assert_eq!(commit.attempts, 1);
        assert_eq!(commit.active_slot(), 1);
        let slot1 = region.slot(1).to_payload();
        assert_eq!(slot1.integer, 100);
        assert_eq!(slot1.float, 3.14);
        assert_eq!(slot1.array, before.array);
    }

    #[test]
    fn test_commit_retries_after_interleaved_rt_write() {
        let region = region();
        let mut backoff = SpinBackoff;
        let update = PayloadUpdate::new().with_float(1.5);

        let mut probe = |point: ProbePoint| {
            if let ProbePoint::BeforeCommit { attempt: 1, .. } = point {
                rt_write(&region, |slot| slot.set_integer(7)).unwrap();
            }
        };
        let commit = nonrt_write_with(&region, &mut backoff, &update, &mut probe, None).unwrap();

        assert_eq!(commit.attempts, 2);
        // retry started at 4 and committed to (4 + 4) ^ 1
        assert_eq!(commit.sequence, 9);
        let active = region.slot(commit.active_slot());
        assert_eq!(active.integer(), 7);
        assert_eq!(active.float(), 1.5);
    }

    #[test]
    fn test_try_nonrt_write_exhausts() {
        let region = region();
        let mut backoff = SpinBackoff;
        let update = PayloadUpdate::new().with_integer(1);

        let mut probe = |_: ProbePoint| {
            rt_write(&region, |_| ()).unwrap();
        };
        let err = nonrt_write_with(&region, &mut backoff, &update, &mut probe, Some(3)).unwrap_err();
        assert!(matches!(
            err,
            ShmError::RetryExhausted {
                operation: "nonrt_write",
                attempts: 3
            }
        ));
        assert_eq!(active_slot(region.sequence().load()), 0);
    }

    #[test]
    fn test_nonrt_section_is_bracketed_on_every_exit() {
        let region = region();
        let mut backoff = SpinBackoff;
        let update = PayloadUpdate::new().with_integer(3);

        let mut points = Vec::new();
        let mut record = |point: ProbePoint| points.push(point);
        nonrt_write_with(&region, &mut backoff, &update, &mut record, None).unwrap();
        assert_eq!(
            points,
            vec![
                ProbePoint::NonRtLocked,
                ProbePoint::BeforeCommit { attempt: 1, start: 0 },
                ProbePoint::NonRtUnlocking,
            ]
        );

        let mut points = Vec::new();
        let mut interfere = |point: ProbePoint| {
            if let ProbePoint::BeforeCommit { .. } = point {
                rt_write(&region, |_| ()).unwrap();
            }
            points.push(point);
        };
        nonrt_write_with(&region, &mut backoff, &update, &mut interfere, Some(2)).unwrap_err();
        assert_eq!(points.first(), Some(&ProbePoint::NonRtLocked));
        assert_eq!(points.last(), Some(&ProbePoint::NonRtUnlocking));
    }

    #[test]
    fn test_read_retries_after_rt_commit() {
        let region = region();
        let mut backoff = SpinBackoff;

        let mut probe = |point: ProbePoint| {
            if let ProbePoint::BeforeRetryCheck { attempt: 1, .. } = point {
                rt_write(&region, |slot| slot.set_integer(43)).unwrap();
            }
        };
        let mut seen = Vec::new();
        let value = read_with(&region, &mut backoff, &mut probe, None, |slot| {
            seen.push(slot.integer());
            slot.integer()
        })
        .unwrap();

        assert_eq!(seen, vec![SAMPLE_INTEGER, 43]);
        assert_eq!(value, 43);
    }

    #[test]
    fn test_try_read_exhausts() {
        let region = region();
        let mut backoff = SpinBackoff;
        let mut probe = |_: ProbePoint| {
            rt_write(&region, |_| ()).unwrap();
        };
        let err = read_with(&region, &mut backoff, &mut probe, Some(2), |s| s.integer()).unwrap_err();
        assert!(matches!(err, ShmError::RetryExhausted { attempts: 3, .. }));
    }

    #[test]
    fn test_snapshot_and_status() {
        let region = region();
        let mut backoff = SpinBackoff;
        let snap = read_snapshot(&region, &mut backoff).unwrap();
        assert_eq!(snap.sequence, 0);
        assert_eq!(snap.payload, Payload::sample());

        let status = read_status(&region, &mut backoff).unwrap();
        assert_eq!(status.active_slot, 0);
        assert_eq!(status.integer, SAMPLE_INTEGER);
        assert_eq!(status.float, SAMPLE_FLOAT);
    }
}
