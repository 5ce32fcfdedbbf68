//! Busy-wait policies used while an RT write is in progress
//!
//! Readers and the non-RT writer never block on a lock; they spin in
//! `seq_begin` until bit 1 of the counter clears. How they spin is a policy
//! choice made per target.

use seqshm::config::{BackoffConfig, BackoffKind};

/// Policy invoked on every unsuccessful attempt
pub trait Backoff: Send {
    /// Wait a little before the next attempt
    fn snooze(&mut self);

    /// Called once a consistent value was obtained
    fn reset(&mut self) {}
}

/// CPU relax hint only (`pause` on x86, `yield`/`isb` on ARM)
#[derive(Debug, Default, Clone, Copy)]
pub struct SpinBackoff;

impl Backoff for SpinBackoff {
    #[inline]
    fn snooze(&mut self) {
        std::hint::spin_loop();
    }
}

/// Hand the CPU back to the scheduler on every attempt
#[derive(Debug, Default, Clone, Copy)]
pub struct YieldBackoff;

impl Backoff for YieldBackoff {
    #[inline]
    fn snooze(&mut self) {
        std::thread::yield_now();
    }
}

/// Spin with doubling hint counts up to `limit`, then yield
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    step: u32,
    limit: u32,
}

impl ExponentialBackoff {
    /// Create with the given relax-hint ceiling
    pub fn new(limit: u32) -> Self {
        Self {
            step: 1,
            limit: limit.max(1),
        }
    }

    /// Relax hints the next snooze issues (0 once yielding)
    pub fn current_spins(&self) -> u32 {
        if self.step > self.limit { 0 } else { self.step }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Backoff for ExponentialBackoff {
    fn snooze(&mut self) {
        if self.step <= self.limit {
            for _ in 0..self.step {
                std::hint::spin_loop();
            }
            self.step = self.step.saturating_mul(2);
        } else {
            std::thread::yield_now();
        }
    }

    fn reset(&mut self) {
        self.step = 1;
    }
}

/// Default policy for the build target: spin then yield on x86/ARM
#[cfg(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64"))]
pub type PlatformBackoff = ExponentialBackoff;

/// Default policy for the build target
#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
pub type PlatformBackoff = YieldBackoff;

/// Build a policy from configuration
pub fn from_config(config: &BackoffConfig) -> Box<dyn Backoff> {
    match config.kind {
        BackoffKind::Platform => Box::<PlatformBackoff>::default(),
        BackoffKind::Spin => Box::new(SpinBackoff),
        BackoffKind::Yield => Box::new(YieldBackoff),
        BackoffKind::Exponential => Box::new(ExponentialBackoff::new(config.spin_limit)),
    }
}
