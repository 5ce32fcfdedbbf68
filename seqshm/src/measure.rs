//! Latency statistics for the `measure` command

use serde::Serialize;
use std::fmt;

/// Summary of a set of latency samples in nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyStats {
    /// Number of samples
    pub samples: usize,
    /// Fastest sample
    pub min_ns: u64,
    /// Mean
    pub avg_ns: f64,
    /// 99th percentile
    pub p99_ns: u64,
    /// Slowest sample
    pub max_ns: u64,
}

impl LatencyStats {
    /// Summarize `samples`, sorting them in place; `None` when empty
    pub fn from_samples(samples: &mut [u64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();
        let len = samples.len();
        let sum: u128 = samples.iter().map(|&s| s as u128).sum();
        let p99_index = ((len as f64 * 0.99) as usize).min(len - 1);

        Some(Self {
            samples: len,
            min_ns: samples[0],
            avg_ns: sum as f64 / len as f64,
            p99_ns: samples[p99_index],
            max_ns: samples[len - 1],
        })
    }
}

impl fmt::Display for LatencyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} RT writes: min {} ns, avg {:.0} ns, p99 {} ns, max {} ns",
            self.samples, self.min_ns, self.avg_ns, self.p99_ns, self.max_ns
        )
    }
}
