//! Linux backing store operations

use crate::error::{ShmError, ShmResult};
use memmap2::{MmapMut, MmapOptions};
use nix::unistd::getpid;
use seqshm::consts::{META_SUFFIX, SHM_DIR, SHM_PREFIX};
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Path of the backing file for logical region `name`
pub fn backing_path(name: &str) -> PathBuf {
    Path::new(SHM_DIR).join(format!("{SHM_PREFIX}{name}"))
}

/// Path of the JSON metadata published next to the backing file
pub fn meta_path(name: &str) -> PathBuf {
    Path::new(SHM_DIR).join(format!("{SHM_PREFIX}{name}{META_SUFFIX}"))
}

/// Reject names that would escape `/dev/shm` or collide with metadata files
pub fn validate_region_name(name: &str) -> ShmResult<()> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\0')
        || name.ends_with(META_SUFFIX)
        || name.len() > 200
    {
        return Err(ShmError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Create a new backing file of exactly `size` bytes and map it shared
///
/// Fails if the file already exists.
pub fn create_backing_mmap(
    path: &Path,
    size: usize,
    populate: bool,
) -> std::io::Result<(File, MmapMut)> {
    let file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .mode(0o600) // Owner read/write only
        .open(path)?;

    let mapped = (|| -> std::io::Result<MmapMut> {
        file.set_len(size as u64)?;

        let mut options = MmapOptions::new();
        options.len(size);
        if populate {
            options.populate();
        }
        unsafe { options.map_mut(&file) }
    })();

    match mapped {
        Ok(mmap) => Ok((file, mmap)),
        Err(e) => {
            let _ = std::fs::remove_file(path);
            Err(e)
        }
    }
}

/// Map an existing backing file, keeping it open
pub fn attach_backing_mmap(path: &Path) -> std::io::Result<(File, MmapMut)> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
    Ok((file, mmap))
}

/// Device and inode of an open backing file
pub fn file_identity(file: &File) -> std::io::Result<(u64, u64)> {
    let meta = file.metadata()?;
    Ok((meta.dev(), meta.ino()))
}

/// Whether an open backing file still has a name under `/dev/shm`
///
/// One `fstat`; false once the file was unlinked, even if the name was
/// reused for a new region since.
pub fn is_file_linked(file: &File) -> bool {
    file.metadata().map(|meta| meta.nlink() > 0).unwrap_or(false)
}

/// Anonymous mapping for regions shared between threads of one process
pub fn anonymous_mmap(size: usize) -> std::io::Result<MmapMut> {
    MmapOptions::new().len(size).map_anon()
}

/// Lock `len` bytes at `addr` into physical memory
pub fn pin_pages(addr: NonNull<u8>, len: usize) -> nix::Result<()> {
    unsafe { nix::sys::mman::mlock(addr.cast::<c_void>(), len) }
}

/// Undo [`pin_pages`]
pub fn unpin_pages(addr: NonNull<u8>, len: usize) -> nix::Result<()> {
    unsafe { nix::sys::mman::munlock(addr.cast::<c_void>(), len) }
}

/// Check if process is alive using kill(pid, 0)
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::Error::ESRCH) => false, // No such process
        Err(nix::Error::EPERM) => true,  // Process exists but no permission to signal
        Err(_) => false,
    }
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_use_prefix() {
        assert_eq!(
            backing_path("demo"),
            PathBuf::from("/dev/shm/seqshm_demo")
        );
        assert_eq!(
            meta_path("demo"),
            PathBuf::from("/dev/shm/seqshm_demo.meta")
        );
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_region_name("vendor.seqshm").is_ok());
        assert!(validate_region_name("").is_err());
        assert!(validate_region_name("../etc").is_err());
        assert!(validate_region_name("x.meta").is_err());
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(get_current_pid()));
    }

    #[test]
    fn test_create_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing");
        let (file, map) = create_backing_mmap(&path, 8192, false).unwrap();
        assert_eq!(map.len(), 8192);
        assert!(create_backing_mmap(&path, 8192, false).is_err());
        let (attached, attached_map) = attach_backing_mmap(&path).unwrap();
        assert_eq!(attached_map.len(), 8192);
        assert_eq!(file_identity(&file).unwrap(), file_identity(&attached).unwrap());
    }

    #[test]
    fn test_unlinked_file_is_detected_after_name_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing");
        let (old, _old_map) = create_backing_mmap(&path, 4096, false).unwrap();
        assert!(is_file_linked(&old));

        std::fs::remove_file(&path).unwrap();
        let (new, _new_map) = create_backing_mmap(&path, 4096, false).unwrap();
        assert!(!is_file_linked(&old));
        assert!(is_file_linked(&new));
    }
}
