//! Reader that caches the scalar fields between counter changes

use crate::error::ShmResult;
use crate::payload::PayloadUpdate;
use crate::protocol::NonRtCommit;
use crate::context::RegionContext;
use tracing::trace;

/// Caches the last consistent `(integer, float)` pair
///
/// Accessors re-read the region only when the counter moved since the
/// cached values were taken.
pub struct CachedReader {
    context: RegionContext,
    last_sequence: Option<u32>,
    integer: i32,
    float: f32,
}

impl CachedReader {
    /// Wrap a context; the first access reads the region
    pub fn new(context: RegionContext) -> Self {
        Self {
            context,
            last_sequence: None,
            integer: 0,
            float: 0.0,
        }
    }

    /// Whether the counter differs from the cached one
    pub fn has_changed(&self) -> ShmResult<bool> {
        let current = self.context.sequence()?;
        Ok(self.last_sequence != Some(current))
    }

    /// Re-read if the counter moved; returns whether the cache changed
    pub fn refresh(&mut self) -> ShmResult<bool> {
        if !self.has_changed()? {
            return Ok(false);
        }
        let status = self.context.status()?;
        trace!(
            "Cache refreshed at sequence {} (was {:?})",
            status.sequence, self.last_sequence
        );
        self.last_sequence = Some(status.sequence);
        self.integer = status.integer;
        self.float = status.float;
        Ok(true)
    }

    /// Integer field of the active slot
    pub fn integer(&mut self) -> ShmResult<i32> {
        self.refresh()?;
        Ok(self.integer)
    }

    /// Float field of the active slot
    pub fn float(&mut self) -> ShmResult<f32> {
        self.refresh()?;
        Ok(self.float)
    }

    /// Both scalar fields from the same consistent read
    pub fn values(&mut self) -> ShmResult<(i32, f32)> {
        self.refresh()?;
        Ok((self.integer, self.float))
    }

    /// Non-RT write of both scalars, array carried over, then refresh
    pub fn set_values(&mut self, float: f32, integer: i32) -> ShmResult<NonRtCommit> {
        let update = PayloadUpdate::new().with_float(float).with_integer(integer);
        let commit = self.context.nonrt_write(&update)?;
        self.refresh()?;
        Ok(commit)
    }

    /// Counter value of the cached pair
    pub fn last_sequence(&self) -> Option<u32> {
        self.last_sequence
    }
}
