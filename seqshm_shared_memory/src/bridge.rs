//! Addresses handed to adapters for foreign runtimes
//!
//! A foreign runtime wraps the mapping as a raw byte buffer and reads the
//! slot at `active_slot_offset`. Nothing here synchronizes: the adapter
//! compares `sequence` before and after its own reads and re-captures the
//! view when it changed.

use crate::layout::PayloadLayout;
use crate::region::SharedRegion;
use crate::sequence::active_slot;
use serde::Serialize;

/// Snapshot of addresses and offsets at one counter value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ForeignView {
    /// Base address of the mapping in this process
    pub base_addr: usize,
    /// Mapped length in bytes
    pub region_size: usize,
    /// Offset of the active slot from `base_addr`
    pub active_slot_offset: usize,
    /// Offset of the sequence counter from `base_addr`
    pub sequence_offset: usize,
    /// Counter value the offset was computed from
    pub sequence: u32,
    /// Field offsets inside a slot
    pub payload: PayloadLayout,
}

impl ForeignView {
    /// Capture the current active slot of `region`
    pub fn capture(region: &SharedRegion) -> Self {
        let layout = region.layout();
        let sequence = region.sequence().load();
        Self {
            base_addr: region.base_ptr() as usize,
            region_size: region.len(),
            active_slot_offset: layout.slot(active_slot(sequence)),
            sequence_offset: layout.sequence,
            sequence,
            payload: layout.payload,
        }
    }

    /// Whether `region` still has the counter value this view was taken at
    pub fn is_current(&self, region: &SharedRegion) -> bool {
        region.sequence().load() == self.sequence
    }
}
