//! Error types for shared region operations

use thiserror::Error;

/// Errors that can occur while creating, resolving or accessing a region
#[derive(Error, Debug)]
pub enum ShmError {
    /// Backing store could not be created, sized or mapped
    #[error("Allocation failed for region '{name}': {reason}")]
    AllocationFailed {
        /// Region name
        name: String,
        /// Failure description
        reason: String,
    },

    /// Pages could not be locked into physical memory
    #[error("Page pinning failed ({len} bytes): {source}")]
    LockFailed {
        /// Mapped length that was being pinned
        len: usize,
        /// Underlying errno
        #[source]
        source: nix::Error,
    },

    /// Handle broker could not resolve the region
    #[error("Region handle unavailable: {name} ({reason})")]
    HandleUnavailable {
        /// Logical region name
        name: String,
        /// Why resolution failed
        reason: String,
    },

    /// Cross-process mutex attribute or initialization failed
    #[error("Mutex initialization failed during {stage}: {errno}")]
    MutexInitFailed {
        /// Setup stage that failed
        stage: &'static str,
        /// Returned error number
        errno: nix::errno::Errno,
    },

    /// Acquiring or releasing a region mutex failed
    #[error("Mutex {operation} failed: {errno}")]
    MutexLock {
        /// Operation that failed
        operation: &'static str,
        /// Returned error number
        errno: nix::errno::Errno,
    },

    /// `initialize` called on an already initialized region
    #[error("Region already initialized: {name}")]
    AlreadyInitialized {
        /// Region name
        name: String,
    },

    /// Region used or published before `initialize`
    #[error("Region not initialized: {name}")]
    NotInitialized {
        /// Region name
        name: String,
    },

    /// A region with this name is already published
    #[error("Region already published: {name}")]
    AlreadyPublished {
        /// Region name
        name: String,
    },

    /// Owner released the region; the handle must not be used again
    #[error("Region invalidated by its owner: {name}")]
    RegionInvalidated {
        /// Region name
        name: String,
    },

    /// Mapped size or layout fingerprint does not match this build
    #[error("Layout mismatch: {reason}")]
    LayoutMismatch {
        /// Mismatch description
        reason: String,
    },

    /// Bounded retry variant gave up
    #[error("{operation} gave up after {attempts} attempts")]
    RetryExhausted {
        /// Protocol procedure
        operation: &'static str,
        /// Attempts performed
        attempts: u32,
    },

    /// Invalid logical region name
    #[error("Invalid region name: '{name}'")]
    InvalidName {
        /// Offending name
        name: String,
    },

    /// Payload array or slot index out of range
    #[error("Index {index} out of bounds (len {len})")]
    IndexOutOfBounds {
        /// Requested index
        index: usize,
        /// Valid length
        len: usize,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {source}")]
    Json {
        /// Source JSON error
        #[from]
        source: serde_json::Error,
    },
}

impl ShmError {
    /// Whether the error must stop the process that hit it.
    ///
    /// Pin failures degrade determinism but are not fatal; retry exhaustion
    /// and unresolved handles are returned to the caller to decide.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AllocationFailed { .. }
                | Self::MutexInitFailed { .. }
                | Self::RegionInvalidated { .. }
                | Self::LayoutMismatch { .. }
        )
    }
}

/// Result type for shared region operations
pub type ShmResult<T> = Result<T, ShmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let pin = ShmError::LockFailed {
            len: 4096,
            source: nix::Error::ENOMEM,
        };
        assert!(!pin.is_fatal());

        let alloc = ShmError::AllocationFailed {
            name: "r".to_string(),
            reason: "ftruncate".to_string(),
        };
        assert!(alloc.is_fatal());

        let mutex = ShmError::MutexInitFailed {
            stage: "pthread_mutex_init",
            errno: nix::errno::Errno::EINVAL,
        };
        assert!(mutex.is_fatal());

        let handle = ShmError::HandleUnavailable {
            name: "r".to_string(),
            reason: "not published".to_string(),
        };
        assert!(!handle.is_fatal());
    }
}
