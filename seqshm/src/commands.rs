//! Subcommand implementations

use crate::measure::LatencyStats;
use seqshm_common::config::DaemonConfig;
use seqshm_shared_memory::{backoff, protocol};
use seqshm_shared_memory::sequence::{epoch, is_rt_in_progress};
use seqshm_shared_memory::{
    HandleBroker, PayloadUpdate, RegionContext, RegionInfo, RegionLayout, RegionStatus,
    SharedRegion, ShmDirBroker, Snapshot,
};
use std::error::Error;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Boxed error returned by every command
pub type CommandResult<T> = Result<T, Box<dyn Error>>;

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

fn connect(config: &DaemonConfig) -> CommandResult<RegionContext> {
    let broker = ShmDirBroker::new();
    let handle = broker.resolve(&config.region.name)?;
    Ok(RegionContext::with_backoff(
        handle,
        backoff::from_config(&config.backoff),
    ))
}

/// Own the region until `running` clears
pub fn serve(config: &DaemonConfig, running: Arc<AtomicBool>) -> CommandResult<()> {
    let broker = ShmDirBroker::new();
    let stale = broker.cleanup_stale()?;
    if stale > 0 {
        info!("Removed {} stale region(s)", stale);
    }

    let size = config
        .region
        .size
        .unwrap_or_else(|| RegionLayout::new().required_size());
    let mut region = SharedRegion::create(&config.region.name, size)?;
    if config.region.pin {
        region.pin_or_warn();
    }
    region.initialize()?;

    let publication = broker.publish(region)?;
    let mut ctx = RegionContext::with_backoff(
        publication.handle(),
        backoff::from_config(&config.backoff),
    );

    let interval = Duration::from_millis(config.region.status_interval_ms);
    info!(
        "Serving region '{}' ({} bytes), status every {:?}",
        config.region.name,
        publication.info().size,
        interval
    );

    while running.load(Ordering::SeqCst) {
        let status = ctx.status()?;
        info!(
            active = status.active_slot,
            sequence = status.sequence,
            integer = status.integer,
            float = status.float,
            "Region status"
        );

        let next = Instant::now() + interval;
        while running.load(Ordering::SeqCst) && Instant::now() < next {
            std::thread::sleep(SHUTDOWN_POLL.min(next.saturating_duration_since(Instant::now())));
        }
    }

    drop(ctx);
    drop(publication);
    info!("Region '{}' released", config.region.name);
    Ok(())
}

/// Consistent read of the active slot
pub fn read(config: &DaemonConfig, max_retries: Option<u32>, array: bool) -> CommandResult<String> {
    let mut ctx = connect(config)?;
    let snapshot = match max_retries {
        Some(max) => ctx.try_snapshot(max)?,
        None => ctx.snapshot()?,
    };
    Ok(format_snapshot(&snapshot, array))
}

/// Apply `count` RT writes of `integer += delta, float *= scale`
pub fn rt_write(config: &DaemonConfig, delta: i32, scale: f32, count: u32) -> CommandResult<String> {
    let ctx = connect(config)?;
    let mut last = None;
    for _ in 0..count.max(1) {
        last = Some(ctx.rt_write(|slot| {
            let integer = slot.integer().wrapping_add(delta);
            let float = slot.float() * scale;
            slot.set_integer(integer);
            slot.set_float(float);
            (integer, float)
        })?);
    }
    let (integer, float) = last.ok_or("no RT write performed")?;
    Ok(format!(
        "rt-write x{}: integer={} float={} sequence={}",
        count.max(1),
        integer,
        float,
        ctx.sequence()?
    ))
}

/// Non-RT write of the given scalars
pub fn write(
    config: &DaemonConfig,
    integer: Option<i32>,
    float: Option<f32>,
    max_attempts: Option<u32>,
) -> CommandResult<String> {
    if integer.is_none() && float.is_none() {
        return Err("nothing to write: pass --int and/or --float".into());
    }
    let mut update = PayloadUpdate::new();
    if let Some(v) = integer {
        update = update.with_integer(v);
    }
    if let Some(v) = float {
        update = update.with_float(v);
    }

    let mut ctx = connect(config)?;
    let commit = match max_attempts {
        Some(max) => ctx.try_nonrt_write(&update, max)?,
        None => ctx.nonrt_write(&update)?,
    };
    debug!("Committed after {} attempt(s)", commit.attempts);
    Ok(format!(
        "write: active slot {} sequence={} attempts={}",
        commit.active_slot(),
        commit.sequence,
        commit.attempts
    ))
}

/// Published metadata plus the current counter decomposition
pub fn status(config: &DaemonConfig) -> CommandResult<String> {
    let broker = ShmDirBroker::new();
    let info = broker.info(&config.region.name)?;
    let mut ctx = connect(config)?;
    let raw = ctx.sequence()?;
    let status = ctx.status()?;
    Ok(format_status(&info, &status, is_rt_in_progress(raw)))
}

/// Time `iterations` RT writes touching every field
///
/// Liveness is checked once up front; the samples cover the RT write alone.
pub fn measure(config: &DaemonConfig, iterations: u32) -> CommandResult<LatencyStats> {
    let ctx = connect(config)?;
    let region = ctx.handle().region()?;
    let mut samples = Vec::with_capacity(iterations as usize);

    for _ in 0..iterations {
        let start = Instant::now();
        protocol::rt_write(region, |slot| {
            slot.set_integer(slot.integer().wrapping_add(1));
            slot.set_float(slot.float() + 1.0);
            slot.update_array(|_, v| v.wrapping_add(1));
        })?;
        samples.push(start.elapsed().as_nanos() as u64);
    }

    Ok(LatencyStats::from_samples(&mut samples).ok_or("no iterations to measure")?)
}

/// Render a snapshot for the terminal
pub fn format_snapshot(snapshot: &Snapshot, with_array: bool) -> String {
    let payload = &snapshot.payload;
    let mut out = format!(
        "slot {} (sequence {}, epoch {}): integer={} float={}",
        snapshot.active_slot(),
        snapshot.sequence,
        epoch(snapshot.sequence),
        payload.integer,
        payload.float
    );
    if with_array {
        for chunk in payload.array.chunks(16) {
            out.push('\n');
            let _ = write!(out, "  {chunk:?}");
        }
    } else {
        let last = payload.array.len() - 1;
        let _ = write!(
            out,
            " array[0]={} array[{}]={}",
            payload.array[0], last, payload.array[last]
        );
    }
    out
}

/// Render metadata and status for the terminal
pub fn format_status(info: &RegionInfo, status: &RegionStatus, rt_in_progress: bool) -> String {
    format!(
        "region '{}': {} bytes, owner pid {}, layout {:#010x}\n\
         sequence {} (epoch {}, active slot {}, rt {})\n\
         integer={} float={}",
        info.name,
        info.size,
        info.owner_pid,
        info.layout_fingerprint,
        status.sequence,
        status.epoch,
        status.active_slot,
        if rt_in_progress { "busy" } else { "idle" },
        status.integer,
        status.float
    )
}
