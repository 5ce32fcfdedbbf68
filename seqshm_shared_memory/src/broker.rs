//! Handle brokers: resolve a logical name to an initialized region
//!
//! The owner publishes a region after `initialize`; clients resolve it by
//! name and receive a [`RegionHandle`] carrying a liveness probe. Once the
//! owner revokes or releases the region, every probe reports it gone.

use crate::error::{ShmError, ShmResult};
use crate::layout::RegionLayout;
use crate::platform::{backing_path, get_current_pid, is_process_alive, meta_path};
use crate::region::{Backing, SharedRegion};
use parking_lot::RwLock;
use seqshm::consts::{META_SUFFIX, SHM_DIR, SHM_PREFIX};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Resolves logical names to initialized regions
pub trait HandleBroker: Send + Sync {
    /// Resolve `name`, or fail with `HandleUnavailable`
    fn resolve(&self, name: &str) -> ShmResult<RegionHandle>;
}

/// How a handle learns that its region has been released
#[derive(Debug, Clone)]
pub enum Liveness {
    /// Held by the publishing owner itself
    Owner,
    /// Cleared by [`InProcessBroker::revoke`]
    Revocable(Arc<AtomicBool>),
    /// Owner process alive and the mapped backing file not yet unlinked
    ///
    /// Costs one `fstat` and one `kill(pid, 0)` per check.
    OwnerProcess {
        /// Owner pid
        pid: u32,
    },
}

impl Liveness {
    /// Whether `region` may still be used
    pub fn check(&self, region: &SharedRegion) -> bool {
        match self {
            Liveness::Owner => true,
            Liveness::Revocable(valid) => valid.load(Ordering::Acquire),
            Liveness::OwnerProcess { pid } => {
                region.is_backing_linked() && is_process_alive(*pid)
            }
        }
    }
}

/// Shared reference to a resolved region
#[derive(Debug, Clone)]
pub struct RegionHandle {
    region: Arc<SharedRegion>,
    liveness: Liveness,
}

impl RegionHandle {
    /// Handle for a region this process owns and keeps alive
    pub fn owned(region: Arc<SharedRegion>) -> Self {
        Self {
            region,
            liveness: Liveness::Owner,
        }
    }

    /// Logical name
    pub fn name(&self) -> &str {
        self.region.name()
    }

    /// Whether the owner still holds the region
    pub fn is_live(&self) -> bool {
        self.liveness.check(&self.region)
    }

    /// The region, or `RegionInvalidated` once released
    pub fn region(&self) -> ShmResult<&SharedRegion> {
        if self.liveness.check(&self.region) {
            Ok(&self.region)
        } else {
            Err(ShmError::RegionInvalidated {
                name: self.region.name().to_string(),
            })
        }
    }

    /// Liveness probe
    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }
}

fn ensure_publishable(region: &SharedRegion) -> ShmResult<()> {
    if !region.is_initialized() {
        return Err(ShmError::NotInitialized {
            name: region.name().to_string(),
        });
    }
    Ok(())
}

struct Entry {
    region: Arc<SharedRegion>,
    valid: Arc<AtomicBool>,
}

/// Broker for threads sharing one process
#[derive(Default)]
pub struct InProcessBroker {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InProcessBroker {
    /// Empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an initialized region resolvable under its name
    pub fn publish(&self, region: SharedRegion) -> ShmResult<RegionHandle> {
        ensure_publishable(&region)?;
        let name = region.name().to_string();

        let mut entries = self.entries.write();
        if entries.contains_key(&name) {
            return Err(ShmError::AlreadyPublished { name });
        }

        let entry = Entry {
            region: Arc::new(region),
            valid: Arc::new(AtomicBool::new(true)),
        };
        let handle = RegionHandle {
            region: Arc::clone(&entry.region),
            liveness: Liveness::Revocable(Arc::clone(&entry.valid)),
        };
        entries.insert(name.clone(), entry);

        debug!("Published in-process region '{}'", name);
        Ok(handle)
    }

    /// Withdraw `name`; every outstanding handle turns invalid
    pub fn revoke(&self, name: &str) -> bool {
        match self.entries.write().remove(name) {
            Some(entry) => {
                entry.valid.store(false, Ordering::Release);
                info!("Revoked region '{}'", name);
                true
            }
            None => false,
        }
    }

    /// Published names
    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

impl HandleBroker for InProcessBroker {
    fn resolve(&self, name: &str) -> ShmResult<RegionHandle> {
        let entries = self.entries.read();
        let entry = entries.get(name).ok_or_else(|| ShmError::HandleUnavailable {
            name: name.to_string(),
            reason: "not published".to_string(),
        })?;
        Ok(RegionHandle {
            region: Arc::clone(&entry.region),
            liveness: Liveness::Revocable(Arc::clone(&entry.valid)),
        })
    }
}

/// Metadata written next to a published backing file
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RegionInfo {
    /// Logical name
    pub name: String,
    /// Backing store size in bytes
    pub size: usize,
    /// Owner process ID
    pub owner_pid: u32,
    /// [`RegionLayout::fingerprint`] of the owner's build
    pub layout_fingerprint: u32,
    /// Creation timestamp
    pub created_at: SystemTime,
    /// Device of the backing file
    pub backing_dev: u64,
    /// Inode of the backing file
    pub backing_ino: u64,
}

/// Broker over `/dev/shm` metadata files, for separate processes
#[derive(Debug, Default, Clone, Copy)]
pub struct ShmDirBroker;

impl ShmDirBroker {
    /// Broker over the system shared memory directory
    pub fn new() -> Self {
        Self
    }

    /// Publish an initialized, file-backed region owned by this process
    ///
    /// The region stays resolvable until the returned [`Publication`] drops.
    pub fn publish(&self, region: SharedRegion) -> ShmResult<Publication> {
        ensure_publishable(&region)?;
        if !region.is_owner() || !matches!(region.backing(), Backing::File(_)) {
            return Err(ShmError::HandleUnavailable {
                name: region.name().to_string(),
                reason: "only owned file-backed regions can be published".to_string(),
            });
        }

        let (backing_dev, backing_ino) =
            region
                .backing_identity()?
                .ok_or_else(|| ShmError::HandleUnavailable {
                    name: region.name().to_string(),
                    reason: "no backing file".to_string(),
                })?;
        let info = RegionInfo {
            name: region.name().to_string(),
            size: region.len(),
            owner_pid: get_current_pid(),
            layout_fingerprint: region.layout().fingerprint(),
            created_at: SystemTime::now(),
            backing_dev,
            backing_ino,
        };

        let meta = meta_path(&info.name);
        if meta.exists() {
            return Err(ShmError::AlreadyPublished { name: info.name });
        }
        // Write then rename so clients never parse a partial file
        let tmp = meta.with_extension("meta.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&info)?)?;
        std::fs::rename(&tmp, &meta)?;

        info!(
            "Published region '{}' (pid {}, {} bytes)",
            info.name, info.owner_pid, info.size
        );
        Ok(Publication {
            handle: RegionHandle::owned(Arc::new(region)),
            meta,
            info,
        })
    }

    /// Read published metadata for `name`
    pub fn info(&self, name: &str) -> ShmResult<RegionInfo> {
        let meta = meta_path(name);
        let content = std::fs::read_to_string(&meta).map_err(|e| ShmError::HandleUnavailable {
            name: name.to_string(),
            reason: format!("{}: {e}", meta.display()),
        })?;
        serde_json::from_str(&content).map_err(|e| ShmError::HandleUnavailable {
            name: name.to_string(),
            reason: format!("corrupt metadata: {e}"),
        })
    }

    /// All published regions, newest first
    pub fn list(&self) -> ShmResult<Vec<RegionInfo>> {
        let mut regions = Vec::new();

        let dir = std::path::Path::new(SHM_DIR);
        if !dir.exists() {
            return Ok(regions);
        }

        for entry in std::fs::read_dir(dir)?.flatten() {
            let Ok(file_name) = entry.file_name().into_string() else {
                continue;
            };
            let Some(name) = file_name
                .strip_prefix(SHM_PREFIX)
                .and_then(|rest| rest.strip_suffix(META_SUFFIX))
            else {
                continue;
            };
            match self.info(name) {
                Ok(info) => regions.push(info),
                Err(e) => debug!("Skipping {}: {}", file_name, e),
            }
        }

        regions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(regions)
    }

    /// Remove metadata and backing files left by owners that died
    pub fn cleanup_stale(&self) -> ShmResult<usize> {
        let mut cleaned = 0;
        for info in self.list()? {
            if is_process_alive(info.owner_pid) {
                continue;
            }
            warn!(
                "Removing stale region '{}' left by pid {}",
                info.name, info.owner_pid
            );
            for path in [meta_path(&info.name), backing_path(&info.name)] {
                match std::fs::remove_file(&path) {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                        warn!("Failed to remove {}: {}", path.display(), e)
                    }
                    _ => {}
                }
            }
            cleaned += 1;
        }
        Ok(cleaned)
    }
}

impl HandleBroker for ShmDirBroker {
    fn resolve(&self, name: &str) -> ShmResult<RegionHandle> {
        let info = self.info(name)?;

        if !is_process_alive(info.owner_pid) {
            return Err(ShmError::HandleUnavailable {
                name: name.to_string(),
                reason: format!("owner pid {} is gone", info.owner_pid),
            });
        }

        let expected = RegionLayout::new().fingerprint();
        if info.layout_fingerprint != expected {
            return Err(ShmError::LayoutMismatch {
                reason: format!(
                    "region '{name}' fingerprint {:#010x}, this build {expected:#010x}",
                    info.layout_fingerprint
                ),
            });
        }

        let region = SharedRegion::attach(name)?;
        if region.backing_identity()? != Some((info.backing_dev, info.backing_ino)) {
            return Err(ShmError::HandleUnavailable {
                name: name.to_string(),
                reason: "backing file does not match published metadata".to_string(),
            });
        }
        if region.len() != info.size {
            return Err(ShmError::LayoutMismatch {
                reason: format!(
                    "region '{name}' mapped {} bytes, published {}",
                    region.len(),
                    info.size
                ),
            });
        }

        debug!("Resolved region '{}' owned by pid {}", name, info.owner_pid);
        Ok(RegionHandle {
            region: Arc::new(region),
            liveness: Liveness::OwnerProcess {
                pid: info.owner_pid,
            },
        })
    }
}

/// Keeps a region published; unpublishes and releases it on drop
pub struct Publication {
    handle: RegionHandle,
    meta: PathBuf,
    info: RegionInfo,
}

impl Publication {
    /// Owner-side handle
    pub fn handle(&self) -> RegionHandle {
        self.handle.clone()
    }

    /// Published metadata
    pub fn info(&self) -> &RegionInfo {
        &self.info
    }
}

impl Drop for Publication {
    fn drop(&mut self) {
        // Metadata goes first so clients stop resolving; unlinking the
        // backing file then invalidates every resolved handle
        if let Err(e) = std::fs::remove_file(&self.meta) {
            warn!("Failed to remove {}: {}", self.meta.display(), e);
        }
        if let Err(e) = self.handle.region.unlink_backing() {
            warn!("Failed to unlink backing of '{}': {}", self.info.name, e);
        }
        info!("Unpublished region '{}'", self.info.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initialized(name: &str) -> SharedRegion {
        let mut region =
            SharedRegion::anonymous(name, RegionLayout::new().required_size()).unwrap();
        region.initialize().unwrap();
        region
    }

    #[test]
    fn test_in_process_publish_resolve_revoke() {
        let broker = InProcessBroker::new();
        let owner = broker.publish(initialized("alpha")).unwrap();

        let client = broker.resolve("alpha").unwrap();
        assert!(client.is_live());
        assert_eq!(client.region().unwrap().name(), "alpha");

        assert!(broker.revoke("alpha"));
        assert!(!client.is_live());
        assert!(!owner.is_live());
        assert!(matches!(
            client.region(),
            Err(ShmError::RegionInvalidated { .. })
        ));
        assert!(matches!(
            broker.resolve("alpha"),
            Err(ShmError::HandleUnavailable { .. })
        ));
    }

    #[test]
    fn test_in_process_rejects_uninitialized_and_duplicates() {
        let broker = InProcessBroker::new();
        let raw = SharedRegion::anonymous("raw", RegionLayout::new().required_size()).unwrap();
        assert!(matches!(
            broker.publish(raw),
            Err(ShmError::NotInitialized { .. })
        ));

        broker.publish(initialized("dup")).unwrap();
        assert!(matches!(
            broker.publish(initialized("dup")),
            Err(ShmError::AlreadyPublished { .. })
        ));
        assert_eq!(broker.names(), vec!["dup".to_string()]);
    }

    #[test]
    fn test_unknown_name_is_unavailable() {
        let broker = ShmDirBroker::new();
        let name = format!("missing_{}", std::process::id());
        assert!(matches!(
            broker.resolve(&name),
            Err(ShmError::HandleUnavailable { .. })
        ));
    }

    #[test]
    fn test_shm_dir_rejects_anonymous_regions() {
        let broker = ShmDirBroker::new();
        assert!(matches!(
            broker.publish(initialized("anon")),
            Err(ShmError::HandleUnavailable { .. })
        ));
    }
}
