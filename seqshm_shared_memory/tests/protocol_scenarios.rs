//! Scenario tests for the RT, non-RT and reader procedures

use seqshm_shared_memory::protocol::{self, nonrt_write_with, read_with};
use seqshm_shared_memory::sequence::{active_slot, is_rt_in_progress};
use seqshm_shared_memory::{
    Backoff, Payload, PayloadUpdate, ProbePoint, RegionLayout, SharedRegion, ShmResult,
    SpinBackoff, YieldBackoff, seq_begin, seq_doretry,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

fn initialized_region(name: &str) -> ShmResult<SharedRegion> {
    seqshm_shared_memory::init_tracing();
    let mut region = SharedRegion::anonymous(name, RegionLayout::new().required_size())?;
    region.initialize()?;
    Ok(region)
}

/// Counts snoozes so tests can observe spinning
#[derive(Clone, Default)]
struct CountingBackoff {
    snoozes: Arc<AtomicU32>,
}

impl Backoff for CountingBackoff {
    fn snooze(&mut self) {
        self.snoozes.fetch_add(1, Ordering::Relaxed);
        thread::yield_now();
    }
}

#[test]
fn test_init_then_rt_increment() -> ShmResult<()> {
    let region = initialized_region("scenario_rt")?;
    assert_eq!(region.sequence().load(), 0);
    for index in 0..2 {
        assert_eq!(region.slot(index).to_payload(), Payload::sample());
    }

    protocol::rt_write(&region, |slot| slot.set_integer(slot.integer() + 1))?;

    let seq = region.sequence().load();
    assert_eq!(seq, 4);
    assert!(!is_rt_in_progress(seq));
    assert_eq!(region.slot(0).integer(), 43);
    Ok(())
}

#[test]
fn test_nonrt_write_to_shadow_slot() -> ShmResult<()> {
    let region = initialized_region("scenario_nonrt")?;
    let before = region.slot(0).to_payload();

    let update = PayloadUpdate::new().with_integer(100).with_float(3.14);
    let commit = protocol::nonrt_write(&region, &mut SpinBackoff, &update)?;

    assert_eq!(active_slot(region.sequence().load()), 1);
    assert_eq!(commit.active_slot(), 1);
    let slot1 = region.slot(1).to_payload();
    assert_eq!(slot1.integer, 100);
    assert_eq!(slot1.float, 3.14);
    assert_eq!(slot1.array, before.array);
    Ok(())
}

#[test]
fn test_nonrt_snapshot_waits_for_rt_write() -> ShmResult<()> {
    let region = initialized_region("scenario_spin")?;
    let backoff = CountingBackoff::default();
    let snoozes = Arc::clone(&backoff.snoozes);

    let (in_progress_tx, in_progress_rx) = mpsc::channel();

    let commit = thread::scope(|s| -> ShmResult<_> {
        let rt = s.spawn(|| {
            protocol::rt_write(&region, |slot| {
                in_progress_tx.send(()).ok();
                thread::sleep(Duration::from_millis(100));
                slot.set_integer(43);
            })
        });

        in_progress_rx
            .recv()
            .map_err(|_| std::io::Error::other("RT writer vanished"))?;
        assert!(is_rt_in_progress(region.sequence().load()));

        let mut starts = Vec::new();
        let mut probe = |point: ProbePoint| {
            if let ProbePoint::BeforeCommit { start, .. } = point {
                starts.push(start);
            }
        };
        let mut spinning = backoff.clone();
        let commit = nonrt_write_with(
            &region,
            &mut spinning,
            &PayloadUpdate::new().with_float(1.0),
            &mut probe,
            None,
        )?;

        rt.join().map_err(|_| std::io::Error::other("RT writer panicked"))??;
        assert_eq!(starts, vec![4]);
        Ok(commit)
    })?;

    assert!(snoozes.load(Ordering::Relaxed) > 0);
    assert_eq!(commit.sequence, 9);
    let active = region.slot(commit.active_slot());
    assert_eq!(active.integer(), 43);
    assert_eq!(active.float(), 1.0);
    Ok(())
}

#[test]
fn test_reader_retries_across_rt_write() -> ShmResult<()> {
    let region = initialized_region("scenario_retry")?;
    let mut backoff = SpinBackoff;

    let start = seq_begin(&region, &mut backoff);
    let stale = region.slot(active_slot(start)).integer();
    protocol::rt_write(&region, |slot| slot.set_integer(slot.integer() + 1))?;

    assert_eq!(region.sequence().load(), start + 4);
    assert!(seq_doretry(&region, start));
    assert_eq!(stale, 42);

    let retry = seq_begin(&region, &mut backoff);
    let fresh = region.slot(active_slot(retry)).integer();
    assert!(!seq_doretry(&region, retry));
    assert_eq!(fresh, 43);
    Ok(())
}

#[test]
fn test_commit_visible_only_to_later_snapshots() -> ShmResult<()> {
    let region = initialized_region("scenario_visibility")?;
    let mut backoff = YieldBackoff;

    let early = seq_begin(&region, &mut backoff);
    let commit = protocol::nonrt_write(
        &region,
        &mut backoff,
        &PayloadUpdate::new().with_integer(100),
    )?;

    // A reader that sampled before the CAS still looks at the old slot and
    // is told to retry
    assert_eq!(region.slot(active_slot(early)).integer(), 42);
    assert!(seq_doretry(&region, early));

    let mut starts = Vec::new();
    let mut probe = |point: ProbePoint| {
        if let ProbePoint::BeforeRetryCheck { start, .. } = point {
            starts.push(start);
        }
    };
    let value = read_with(&region, &mut backoff, &mut probe, None, |slot| slot.integer())?;
    assert_eq!(value, 100);
    assert_eq!(starts, vec![commit.sequence]);
    Ok(())
}

#[test]
fn test_retried_read_terminates_when_writers_stop() -> ShmResult<()> {
    let region = initialized_region("scenario_terminate")?;
    let mut backoff = SpinBackoff;
    let writes = AtomicU32::new(0);

    let mut probe = |_: ProbePoint| {
        if writes.fetch_add(1, Ordering::Relaxed) < 10 {
            protocol::rt_write(&region, |slot| slot.set_integer(slot.integer() + 1))
                .expect("rt write");
        }
    };
    let mut attempts = 0;
    let value = read_with(&region, &mut backoff, &mut probe, None, |slot| {
        attempts += 1;
        slot.integer()
    })?;

    assert_eq!(attempts, 11);
    assert_eq!(value, 52);
    Ok(())
}

#[test]
fn test_bounded_variants_report_exhaustion() -> ShmResult<()> {
    let region = initialized_region("scenario_bounded")?;
    let mut backoff = SpinBackoff;

    let mut probe = |_: ProbePoint| {
        protocol::rt_write(&region, |_| ()).expect("rt write");
    };
    let err = read_with(&region, &mut backoff, &mut probe, Some(4), |slot| slot.integer())
        .unwrap_err();
    assert!(matches!(
        err,
        seqshm_shared_memory::ShmError::RetryExhausted { operation: "read", attempts: 5 }
    ));
    assert!(!err.is_fatal());

    // Without interference both bounded forms succeed first time
    let commit = protocol::try_nonrt_write(
        &region,
        &mut backoff,
        &PayloadUpdate::new().with_integer(5),
        1,
    )?;
    assert_eq!(commit.attempts, 1);
    assert_eq!(protocol::try_read(&region, &mut backoff, 0, |s| s.integer())?, 5);
    Ok(())
}
