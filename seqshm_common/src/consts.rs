//! Region shape and sequence encoding constants.
//!
//! These constants are the single source of truth for the payload shape and
//! the sequence counter bit layout. Every process mapping a region must be
//! built against the same values.

use static_assertions::const_assert;

/// Number of 64-bit elements in the payload array of each slot.
pub const PAYLOAD_ARRAY_LEN: usize = 1024;

/// Number of payload slots per region (active + shadow).
pub const SLOT_COUNT: usize = 2;

/// Sample integer seeded into both slots at initialization.
pub const SAMPLE_INTEGER: i32 = 42;

/// Sample float seeded into both slots at initialization.
pub const SAMPLE_FLOAT: f32 = 23.42;

/// Sample array element at index `j`: `1024 - j`.
#[inline]
pub const fn sample_array_element(j: usize) -> i64 {
    (PAYLOAD_ARRAY_LEN - j) as i64
}

/// Memory page size used for backing-store rounding.
pub const PAGE_SIZE: usize = 4096;

/// Maximum backing-store size in bytes (1GB).
pub const SHM_MAX_SIZE: usize = 1_073_741_824;

/// CPU cache line size in bytes.
pub const CACHE_LINE_SIZE: usize = 64;

/// Directory holding POSIX shared memory files.
pub const SHM_DIR: &str = "/dev/shm";

/// Prefix for every backing file created in [`SHM_DIR`].
pub const SHM_PREFIX: &str = "seqshm_";

/// Suffix of the JSON metadata file published next to a backing file.
pub const META_SUFFIX: &str = ".meta";

/// Logical name the daemon publishes its region under by default.
pub const DEFAULT_REGION_NAME: &str = "vendor.seqshm";

/// Bit 0 of the sequence counter: index of the active slot.
pub const SEQ_ACTIVE_BIT: u32 = 1;

/// Bit 1 of the sequence counter: RT write in progress.
pub const SEQ_RT_BIT: u32 = 2;

/// Amount added to the counter at the start and at the end of an RT write.
pub const SEQ_RT_STEP: u32 = 2;

/// Amount added to the counter by a non-RT commit (before the slot flip).
pub const SEQ_COMMIT_STEP: u32 = 4;

const_assert!(SEQ_RT_STEP == SEQ_RT_BIT);
const_assert!(SEQ_COMMIT_STEP & (SEQ_RT_BIT | SEQ_ACTIVE_BIT) == 0);
const_assert!(SLOT_COUNT == 2);
const_assert!(PAGE_SIZE % CACHE_LINE_SIZE == 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_array_descends_from_len() {
        assert_eq!(sample_array_element(0), 1024);
        assert_eq!(sample_array_element(1023), 1);
    }

    #[test]
    fn test_sequence_bits_are_disjoint() {
        assert_eq!(SEQ_ACTIVE_BIT & SEQ_RT_BIT, 0);
        assert_eq!(SEQ_COMMIT_STEP, 4);
    }

    #[test]
    fn test_size_constraints() {
        assert!(PAGE_SIZE < SHM_MAX_SIZE);
        assert_eq!(SHM_MAX_SIZE, 1024 * 1024 * 1024);
    }
}
