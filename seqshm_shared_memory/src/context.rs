//! Explicit per-client context around one resolved region

use crate::backoff::{Backoff, PlatformBackoff};
use crate::bridge::ForeignView;
use crate::broker::{HandleBroker, RegionHandle};
use crate::error::ShmResult;
use crate::payload::{PayloadUpdate, SlotMut, SlotRef};
use crate::protocol::{self, NonRtCommit, RegionStatus, Snapshot};

/// Resolved handle plus the backoff policy used while spinning
///
/// Every operation checks that the owner still holds the region and fails
/// with `RegionInvalidated` otherwise.
pub struct RegionContext {
    handle: RegionHandle,
    backoff: Box<dyn Backoff>,
}

impl RegionContext {
    /// Context using the target's default backoff
    pub fn new(handle: RegionHandle) -> Self {
        Self::with_backoff(handle, Box::<PlatformBackoff>::default())
    }

    /// Context with an explicit backoff policy
    pub fn with_backoff(handle: RegionHandle, backoff: Box<dyn Backoff>) -> Self {
        Self { handle, backoff }
    }

    /// Resolve `name` through `broker`
    pub fn resolve(broker: &dyn HandleBroker, name: &str) -> ShmResult<Self> {
        Ok(Self::new(broker.resolve(name)?))
    }

    /// Underlying handle
    pub fn handle(&self) -> &RegionHandle {
        &self.handle
    }

    /// RT write on the active slot
    ///
    /// For a handle resolved from another process the liveness check adds an
    /// `fstat` and a `kill(pid, 0)`; hot loops can check once through
    /// [`RegionHandle::region`] and call [`protocol::rt_write`] directly.
    pub fn rt_write<R>(&self, f: impl FnOnce(&mut SlotMut<'_>) -> R) -> ShmResult<R> {
        protocol::rt_write(self.handle.region()?, f)
    }

    /// Non-RT write through the shadow slot (unbounded retries)
    pub fn nonrt_write(&mut self, update: &PayloadUpdate) -> ShmResult<NonRtCommit> {
        let region = self.handle.region()?;
        protocol::nonrt_write(region, self.backoff.as_mut(), update)
    }

    /// Non-RT write giving up after `max_attempts`
    pub fn try_nonrt_write(
        &mut self,
        update: &PayloadUpdate,
        max_attempts: u32,
    ) -> ShmResult<NonRtCommit> {
        let region = self.handle.region()?;
        protocol::try_nonrt_write(region, self.backoff.as_mut(), update, max_attempts)
    }

    /// Consistent read (unbounded retries)
    pub fn read<T>(&mut self, f: impl FnMut(&SlotRef<'_>) -> T) -> ShmResult<T> {
        let region = self.handle.region()?;
        protocol::read(region, self.backoff.as_mut(), f)
    }

    /// Consistent read giving up after `max_retries` retries
    pub fn try_read<T>(
        &mut self,
        max_retries: u32,
        f: impl FnMut(&SlotRef<'_>) -> T,
    ) -> ShmResult<T> {
        let region = self.handle.region()?;
        protocol::try_read(region, self.backoff.as_mut(), max_retries, f)
    }

    /// Consistent copy of the active slot
    pub fn snapshot(&mut self) -> ShmResult<Snapshot> {
        let region = self.handle.region()?;
        protocol::read_snapshot(region, self.backoff.as_mut())
    }

    /// Copy of the active slot giving up after `max_retries` retries
    pub fn try_snapshot(&mut self, max_retries: u32) -> ShmResult<Snapshot> {
        let region = self.handle.region()?;
        protocol::try_read_snapshot(region, self.backoff.as_mut(), max_retries)
    }

    /// Consistent scalar fields and counter decomposition
    pub fn status(&mut self) -> ShmResult<RegionStatus> {
        let region = self.handle.region()?;
        protocol::read_status(region, self.backoff.as_mut())
    }

    /// Raw counter value
    pub fn sequence(&self) -> ShmResult<u32> {
        Ok(self.handle.region()?.sequence().load())
    }

    /// Addresses for a foreign-runtime adapter
    pub fn bridge(&self) -> ShmResult<ForeignView> {
        Ok(ForeignView::capture(self.handle.region()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InProcessBroker;
    use crate::error::ShmError;
    use crate::layout::RegionLayout;
    use crate::region::SharedRegion;

    fn published(broker: &InProcessBroker, name: &str) -> RegionContext {
        let mut region =
            SharedRegion::anonymous(name, RegionLayout::new().required_size()).unwrap();
        region.initialize().unwrap();
        RegionContext::new(broker.publish(region).unwrap())
    }

    #[test]
    fn test_operations_fail_after_revoke() {
        let broker = InProcessBroker::new();
        let mut ctx = published(&broker, "ctx");

        ctx.rt_write(|slot| slot.set_integer(1)).unwrap();
        assert_eq!(ctx.read(|slot| slot.integer()).unwrap(), 1);

        broker.revoke("ctx");
        assert!(matches!(
            ctx.read(|slot| slot.integer()),
            Err(ShmError::RegionInvalidated { .. })
        ));
        assert!(matches!(
            ctx.rt_write(|_| ()),
            Err(ShmError::RegionInvalidated { .. })
        ));
        assert!(matches!(
            ctx.nonrt_write(&PayloadUpdate::new()),
            Err(ShmError::RegionInvalidated { .. })
        ));
        assert!(ctx.sequence().is_err());
        assert!(ctx.bridge().is_err());
    }

    #[test]
    fn test_resolved_context_sees_owner_writes() {
        let broker = InProcessBroker::new();
        let mut owner = published(&broker, "shared");
        let mut client = RegionContext::resolve(&broker, "shared").unwrap();

        let commit = owner
            .nonrt_write(&PayloadUpdate::new().with_integer(100))
            .unwrap();
        let status = client.status().unwrap();
        assert_eq!(status.sequence, commit.sequence);
        assert_eq!(status.integer, 100);
        assert_eq!(client.snapshot().unwrap().payload.integer, 100);
    }
}
