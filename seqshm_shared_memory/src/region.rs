//! Shared region creation, pinning and initialization

use crate::error::{ShmError, ShmResult};
use crate::layout::RegionLayout;
use crate::mutex::ShmMutex;
use crate::payload::{Payload, SlotMut, SlotRef};
use crate::platform::{
    anonymous_mmap, attach_backing_mmap, backing_path, create_backing_mmap, file_identity,
    is_file_linked, pin_pages, unpin_pages, validate_region_name,
};
use crate::sequence::SequenceCounter;
use memmap2::MmapMut;
use seqshm::consts::{SHM_MAX_SIZE, SLOT_COUNT};
use std::fs::File;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering, fence};
use tracing::{debug, info, warn};

/// Where the region's pages come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    /// File under `/dev/shm`, mappable by other processes
    File(PathBuf),
    /// Anonymous mapping, shared by the threads of this process
    Anonymous,
}

/// A mapped region holding the protection state and two payload slots
///
/// The owning process creates, optionally pins, and initializes the region
/// exactly once before handing out shared references. Initialization takes
/// `&mut self`, so once the region is behind an `Arc` it can no longer be
/// re-initialized.
pub struct SharedRegion {
    name: String,
    mmap: MmapMut,
    base: NonNull<u8>,
    layout: RegionLayout,
    backing: Backing,
    file: Option<File>,
    owner: bool,
    initialized: bool,
    pinned: bool,
}

// SAFETY: the mapping is owned by the region and stays mapped for its
// lifetime; all shared mutation goes through atomics, process-shared mutexes
// and volatile slot accessors.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create a file-backed region of exactly `size` bytes
    ///
    /// Failure is fatal to the owning process.
    pub fn create(name: &str, size: usize) -> ShmResult<Self> {
        validate_region_name(name)?;
        let layout = RegionLayout::new();
        check_size(name, size, &layout)?;

        let path = backing_path(name);
        let (file, mmap) = create_backing_mmap(&path, size, false).map_err(|e| {
            ShmError::AllocationFailed {
                name: name.to_string(),
                reason: format!("{}: {e}", path.display()),
            }
        })?;

        info!("Created region '{}' at {} ({} bytes)", name, path.display(), size);
        Self::from_mmap(name, mmap, layout, Backing::File(path), Some(file), true, false)
    }

    /// Create a file-backed region of the smallest page-rounded size
    pub fn create_default(name: &str) -> ShmResult<Self> {
        Self::create(name, RegionLayout::new().required_size())
    }

    /// Create an anonymous region for in-process sharing
    pub fn anonymous(name: &str, size: usize) -> ShmResult<Self> {
        let layout = RegionLayout::new();
        check_size(name, size, &layout)?;

        let mmap = anonymous_mmap(size).map_err(|e| ShmError::AllocationFailed {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        debug!("Created anonymous region '{}' ({} bytes)", name, size);
        Self::from_mmap(name, mmap, layout, Backing::Anonymous, None, true, false)
    }

    /// Map a region another process created
    ///
    /// Only the broker calls this, after reading the owner's published
    /// metadata; the metadata is written after `initialize`, and the broker
    /// checks the mapped file is the published one.
    pub(crate) fn attach(name: &str) -> ShmResult<Self> {
        validate_region_name(name)?;
        let path = backing_path(name);
        let (file, mmap) = attach_backing_mmap(&path).map_err(|e| ShmError::HandleUnavailable {
            name: name.to_string(),
            reason: format!("{}: {e}", path.display()),
        })?;

        debug!("Attached region '{}' ({} bytes)", name, mmap.len());
        Self::from_mmap(
            name,
            mmap,
            RegionLayout::new(),
            Backing::File(path),
            Some(file),
            false,
            true,
        )
    }

    fn from_mmap(
        name: &str,
        mut mmap: MmapMut,
        layout: RegionLayout,
        backing: Backing,
        file: Option<File>,
        owner: bool,
        initialized: bool,
    ) -> ShmResult<Self> {
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| ShmError::AllocationFailed {
            name: name.to_string(),
            reason: "null mapping".to_string(),
        })?;
        layout.validate_mapping(base.as_ptr() as usize, mmap.len())?;

        Ok(Self {
            name: name.to_string(),
            mmap,
            base,
            layout,
            backing,
            file,
            owner,
            initialized,
            pinned: false,
        })
    }

    /// Lock the mapped pages into physical memory
    ///
    /// A failure leaves the region fully usable with degraded determinism;
    /// callers report it and carry on.
    pub fn pin(&mut self) -> ShmResult<()> {
        pin_pages(self.base, self.mmap.len()).map_err(|source| ShmError::LockFailed {
            len: self.mmap.len(),
            source,
        })?;
        self.pinned = true;
        info!("Pinned region '{}' ({} bytes)", self.name, self.mmap.len());
        Ok(())
    }

    /// [`pin`](Self::pin), logging instead of returning a failure
    pub fn pin_or_warn(&mut self) -> bool {
        match self.pin() {
            Ok(()) => true,
            Err(e) => {
                warn!("Region '{}' not pinned, continuing: {}", self.name, e);
                false
            }
        }
    }

    /// Zero the counter, set up both process-shared mutexes and seed both
    /// slots with identical sample data
    ///
    /// Only the creator may call this, once, before publishing.
    pub fn initialize(&mut self) -> ShmResult<()> {
        if self.initialized || !self.owner {
            return Err(ShmError::AlreadyInitialized {
                name: self.name.clone(),
            });
        }

        self.sequence().reset();

        unsafe {
            self.rt_lock().init()?;
            self.nonrt_lock().init()?;
        }

        let sample = Payload::sample();
        for index in 0..SLOT_COUNT {
            unsafe { self.slot_mut(index) }.write_payload(&sample);
        }

        // Publish slot contents before any handle leaves this process
        fence(Ordering::SeqCst);
        self.initialized = true;

        info!("Initialized region '{}': counter=0, slots seeded", self.name);
        Ok(())
    }

    /// Logical name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mapped length in bytes
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Whether the mapping is empty (never true for a valid region)
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Layout descriptor
    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    /// Backing store
    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    /// Backing file path, if any
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::File(path) => Some(path),
            Backing::Anonymous => None,
        }
    }

    /// Device and inode of the backing file, `None` for anonymous regions
    pub fn backing_identity(&self) -> ShmResult<Option<(u64, u64)>> {
        match &self.file {
            Some(file) => Ok(Some(file_identity(file)?)),
            None => Ok(None),
        }
    }

    /// Whether the backing file this region mapped is still linked
    ///
    /// Always true for anonymous regions. Once the owner unlinks the file,
    /// a region later created under the same name is a different file.
    pub fn is_backing_linked(&self) -> bool {
        self.file.as_ref().is_none_or(is_file_linked)
    }

    /// Remove the backing file if the name still refers to this region
    ///
    /// Returns whether a file was removed. The name may already belong to
    /// a newer region, which is left alone.
    pub(crate) fn unlink_backing(&self) -> std::io::Result<bool> {
        let Backing::File(path) = &self.backing else {
            return Ok(false);
        };
        if !self.owns_path(path) {
            return Ok(false);
        }
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn owns_path(&self, path: &Path) -> bool {
        let Some(file) = &self.file else {
            return false;
        };
        match (std::fs::metadata(path), file_identity(file)) {
            (Ok(meta), Ok(identity)) => (meta.dev(), meta.ino()) == identity,
            _ => false,
        }
    }

    /// Whether this process created the region
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Whether the protection state has been initialized
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Whether the pages are locked in memory
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Base address of the mapping in this process
    pub fn base_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    /// Sequence counter accessor
    pub fn sequence(&self) -> SequenceCounter<'_> {
        // SAFETY: offset validated against the mapping; u32-aligned by layout
        let counter = unsafe {
            AtomicU32::from_ptr(self.base.as_ptr().add(self.layout.sequence) as *mut u32)
        };
        SequenceCounter::new(counter)
    }

    /// RT writer lock
    pub fn rt_lock(&self) -> ShmMutex<'_> {
        unsafe {
            ShmMutex::from_raw(
                self.base.as_ptr().add(self.layout.rt_lock) as *mut libc::pthread_mutex_t
            )
        }
    }

    /// Non-RT writer lock
    pub fn nonrt_lock(&self) -> ShmMutex<'_> {
        unsafe {
            ShmMutex::from_raw(
                self.base.as_ptr().add(self.layout.nonrt_lock) as *mut libc::pthread_mutex_t
            )
        }
    }

    /// Read-only view of slot `index & 1`
    ///
    /// Contents are only meaningful inside a read bracketed by
    /// `seq_begin`/`seq_doretry`.
    pub fn slot(&self, index: usize) -> SlotRef<'_> {
        unsafe {
            SlotRef::new(
                self.base.as_ptr().add(self.layout.slot(index)),
                self.layout.payload,
            )
        }
    }

    /// Mutable view of slot `index & 1`
    ///
    /// # Safety
    /// The caller must hold the protocol right to mutate that slot: the RT
    /// lock with bit 1 set for the active slot, or the non-RT lock for the
    /// shadow slot, or exclusive ownership during initialization.
    pub(crate) unsafe fn slot_mut(&self, index: usize) -> SlotMut<'_> {
        unsafe {
            SlotMut::new(
                self.base.as_ptr().add(self.layout.slot(index)),
                self.layout.payload,
            )
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("len", &self.mmap.len())
            .field("backing", &self.backing)
            .field("owner", &self.owner)
            .field("initialized", &self.initialized)
            .field("pinned", &self.pinned)
            .finish()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if self.pinned {
            if let Err(e) = unpin_pages(self.base, self.mmap.len()) {
                warn!("munlock of region '{}' failed: {}", self.name, e);
            }
        }
        if !self.owner {
            return;
        }
        match &self.backing {
            // Clients in other processes keep their mapping and the lock
            // words; they detect the release through the broker
            Backing::File(path) => match self.unlink_backing() {
                Ok(true) => debug!("Removed backing file {}", path.display()),
                Ok(false) => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            },
            Backing::Anonymous if self.initialized => unsafe {
                self.rt_lock().destroy();
                self.nonrt_lock().destroy();
            },
            Backing::Anonymous => {}
        }
    }
}

fn check_size(name: &str, size: usize, layout: &RegionLayout) -> ShmResult<()> {
    if size < layout.end || size > SHM_MAX_SIZE {
        return Err(ShmError::AllocationFailed {
            name: name.to_string(),
            reason: format!(
                "size {size} outside {}..={SHM_MAX_SIZE} required by layout",
                layout.end
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqshm::consts::{PAYLOAD_ARRAY_LEN, SAMPLE_FLOAT, SAMPLE_INTEGER};

    fn unique(prefix: &str) -> String {
        static CTR: AtomicU32 = AtomicU32::new(0);
        let id = CTR.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}_{}_{id}", std::process::id())
    }

    #[test]
    fn test_create_rejects_undersized_store() {
        let layout = RegionLayout::new();
        let result = SharedRegion::anonymous("small", layout.end - 1);
        assert!(matches!(result, Err(ShmError::AllocationFailed { .. })));
    }

    #[test]
    fn test_initialize_seeds_both_slots() {
        let size = RegionLayout::new().required_size();
        let mut region = SharedRegion::anonymous("init", size).unwrap();
        region.initialize().unwrap();

        assert_eq!(region.sequence().load(), 0);
        for index in 0..SLOT_COUNT {
            let slot = region.slot(index);
            assert_eq!(slot.integer(), SAMPLE_INTEGER);
            assert_eq!(slot.float(), SAMPLE_FLOAT);
            assert_eq!(slot.get(0).unwrap(), PAYLOAD_ARRAY_LEN as i64);
            assert_eq!(slot.get(PAYLOAD_ARRAY_LEN - 1).unwrap(), 1);
        }
    }

    #[test]
    fn test_initialize_twice_is_rejected() {
        let size = RegionLayout::new().required_size();
        let mut region = SharedRegion::anonymous("twice", size).unwrap();
        region.initialize().unwrap();
        assert!(matches!(
            region.initialize(),
            Err(ShmError::AlreadyInitialized { .. })
        ));
    }

    #[test]
    fn test_attached_region_cannot_initialize() {
        let name = unique("attach_init");
        let mut owner = SharedRegion::create_default(&name).unwrap();
        owner.initialize().unwrap();

        let mut client = SharedRegion::attach(&name).unwrap();
        assert!(!client.is_owner());
        assert!(matches!(
            client.initialize(),
            Err(ShmError::AlreadyInitialized { .. })
        ));
        assert_eq!(client.slot(0).integer(), SAMPLE_INTEGER);
    }

    #[test]
    fn test_create_is_exclusive_and_owner_drop_removes_file() {
        let name = unique("exclusive");
        let owner = SharedRegion::create_default(&name).unwrap();
        let path = owner.path().unwrap().to_path_buf();
        assert!(path.exists());

        assert!(matches!(
            SharedRegion::create_default(&name),
            Err(ShmError::AllocationFailed { .. })
        ));

        drop(owner);
        assert!(!path.exists());
        assert!(matches!(
            SharedRegion::attach(&name),
            Err(ShmError::HandleUnavailable { .. })
        ));
    }

    #[test]
    fn test_old_owner_drop_leaves_reused_name_alone() {
        let name = unique("reuse");
        let old = SharedRegion::create_default(&name).unwrap();
        assert!(old.is_backing_linked());
        assert!(old.unlink_backing().unwrap());
        assert!(!old.is_backing_linked());

        let new = SharedRegion::create_default(&name).unwrap();
        assert_ne!(
            old.backing_identity().unwrap(),
            new.backing_identity().unwrap()
        );
        assert!(!old.unlink_backing().unwrap());

        drop(old);
        assert!(new.path().unwrap().exists());
        assert!(new.is_backing_linked());
    }

    #[test]
    fn test_pin_failure_is_not_fatal() {
        let size = RegionLayout::new().required_size();
        let mut region = SharedRegion::anonymous("pin", size).unwrap();
        // RLIMIT_MEMLOCK may forbid this in CI; either outcome leaves the
        // region usable
        let pinned = region.pin_or_warn();
        assert_eq!(pinned, region.is_pinned());
        region.initialize().unwrap();
        assert_eq!(region.slot(1).integer(), SAMPLE_INTEGER);
    }
}
