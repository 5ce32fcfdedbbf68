//! Region layout descriptor
//!
//! The region is never reinterpreted as a Rust struct. Instead the offsets of
//! the protection state and both payload slots are computed once from the
//! fixed shape (two process-shared mutexes, one `u32` counter, two slots of
//! `{i32, f32, [i64; 1024]}`) using C struct layout rules, validated against
//! the mapped length, and handed to the typed accessors.
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────┬─────┬──────────┬──────────┬─────────┐
//! │ rt_lock      │ nonrt_lock   │ sequence │ pad │ slot 0   │ slot 1   │ (page   │
//! │ mutex_t      │ mutex_t      │ u32      │     │ payload  │ payload  │  tail)  │
//! └──────────────┴──────────────┴──────────┴─────┴──────────┴──────────┴─────────┘
//! ```

use crate::error::{ShmError, ShmResult};
use seqshm::consts::{CACHE_LINE_SIZE, PAGE_SIZE, PAYLOAD_ARRAY_LEN, SLOT_COUNT};
use serde::{Deserialize, Serialize};

/// Round `value` up to a multiple of `align` (power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Accumulates field offsets following `#[repr(C)]` rules
#[derive(Debug, Clone, Copy)]
pub struct LayoutBuilder {
    /// Current offset in layout
    offset: usize,
    /// Largest alignment seen so far
    max_align: usize,
}

impl LayoutBuilder {
    /// Create new layout builder
    pub const fn new() -> Self {
        Self {
            offset: 0,
            max_align: 1,
        }
    }

    /// Add field with automatic alignment, returning its offset
    pub const fn add_field(&mut self, size: usize, align: usize) -> usize {
        self.offset = align_up(self.offset, align);
        let field_offset = self.offset;
        self.offset += size;
        if align > self.max_align {
            self.max_align = align;
        }
        field_offset
    }

    /// Size of the structure so far, padded to its own alignment
    pub const fn finish(&self) -> usize {
        align_up(self.offset, self.max_align)
    }

    /// Largest field alignment
    pub const fn align(&self) -> usize {
        self.max_align
    }
}

impl Default for LayoutBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Field offsets inside one payload slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadLayout {
    /// Offset of the `i32` field
    pub integer: usize,
    /// Offset of the `f32` field
    pub float: usize,
    /// Offset of the first `i64` array element
    pub array: usize,
    /// Number of array elements
    pub array_len: usize,
    /// Total slot size including trailing padding
    pub size: usize,
    /// Slot alignment
    pub align: usize,
}

impl PayloadLayout {
    /// Layout of the fixed payload shape
    pub const fn new() -> Self {
        let mut b = LayoutBuilder::new();
        let integer = b.add_field(size_of::<i32>(), align_of::<i32>());
        let float = b.add_field(size_of::<f32>(), align_of::<f32>());
        let array = b.add_field(
            size_of::<i64>() * PAYLOAD_ARRAY_LEN,
            align_of::<i64>(),
        );
        Self {
            integer,
            float,
            array,
            array_len: PAYLOAD_ARRAY_LEN,
            size: b.finish(),
            align: b.align(),
        }
    }

    /// Offset of array element `index` relative to the slot start
    #[inline]
    pub const fn array_element(&self, index: usize) -> usize {
        self.array + index * size_of::<i64>()
    }
}

impl Default for PayloadLayout {
    fn default() -> Self {
        Self::new()
    }
}

/// Offsets of every region field, computed for the running target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionLayout {
    /// RT writer mutex
    pub rt_lock: usize,
    /// Non-RT writer mutex
    pub nonrt_lock: usize,
    /// Size of one `pthread_mutex_t`
    pub mutex_size: usize,
    /// Sequence counter (`u32`)
    pub sequence: usize,
    /// Start of each payload slot
    pub slots: [usize; SLOT_COUNT],
    /// Layout of a single slot
    pub payload: PayloadLayout,
    /// End of the last slot (struct size)
    pub end: usize,
}

impl RegionLayout {
    /// Compute the layout for this target's `pthread_mutex_t`
    pub fn new() -> Self {
        let mutex_size = size_of::<libc::pthread_mutex_t>();
        let mutex_align = align_of::<libc::pthread_mutex_t>();
        let payload = PayloadLayout::new();

        let mut b = LayoutBuilder::new();
        let rt_lock = b.add_field(mutex_size, mutex_align);
        let nonrt_lock = b.add_field(mutex_size, mutex_align);
        let sequence = b.add_field(size_of::<u32>(), align_of::<u32>());
        let slot0 = b.add_field(payload.size, payload.align);
        let slot1 = b.add_field(payload.size, payload.align);

        Self {
            rt_lock,
            nonrt_lock,
            mutex_size,
            sequence,
            slots: [slot0, slot1],
            payload,
            end: b.finish(),
        }
    }

    /// Smallest page-rounded backing store the layout fits in
    pub fn required_size(&self) -> usize {
        align_up(self.end, PAGE_SIZE)
    }

    /// Offset of slot `index` (0 or 1)
    #[inline]
    pub fn slot(&self, index: usize) -> usize {
        self.slots[index & 1]
    }

    /// Fingerprint of every offset and size
    ///
    /// Two processes agree on the shape iff their fingerprints match. Does
    /// not detect byte-order differences.
    pub fn fingerprint(&self) -> u32 {
        let fields = [
            self.rt_lock,
            self.nonrt_lock,
            self.mutex_size,
            self.sequence,
            self.slots[0],
            self.slots[1],
            self.payload.integer,
            self.payload.float,
            self.payload.array,
            self.payload.array_len,
            self.payload.size,
            self.end,
        ];
        fields.iter().fold(0x811C_9DC5u32, |hash, &field| {
            (hash ^ field as u32).wrapping_mul(0x9E37_79B9) ^ 0x517C_C1B7
        })
    }

    /// Check that a mapping at `base` of `mapped_len` bytes can hold the layout
    pub fn validate_mapping(&self, base: usize, mapped_len: usize) -> ShmResult<()> {
        if base % CACHE_LINE_SIZE != 0 {
            return Err(ShmError::LayoutMismatch {
                reason: format!("base {base:#x} not aligned to {CACHE_LINE_SIZE}"),
            });
        }
        if mapped_len < self.end {
            return Err(ShmError::LayoutMismatch {
                reason: format!(
                    "mapping of {mapped_len} bytes cannot hold layout of {} bytes",
                    self.end
                ),
            });
        }
        Ok(())
    }
}

impl Default for RegionLayout {
    fn default() -> Self {
        Self::new()
    }
}
