//! Cross-process mutex stored inside the region
//!
//! Wraps a `pthread_mutex_t` initialized with `PTHREAD_PROCESS_SHARED`, so
//! every process mapping the region excludes the others through the same
//! lock word.

use crate::error::{ShmError, ShmResult};
use nix::errno::Errno;
use std::marker::PhantomData;

/// Handle to a process-shared mutex in mapped memory
#[derive(Clone, Copy)]
pub struct ShmMutex<'a> {
    raw: *mut libc::pthread_mutex_t,
    _region: PhantomData<&'a ()>,
}

impl<'a> ShmMutex<'a> {
    /// # Safety
    /// `raw` must point to `size_of::<pthread_mutex_t>()` suitably aligned
    /// bytes of mapped memory that outlive `'a`.
    pub(crate) unsafe fn from_raw(raw: *mut libc::pthread_mutex_t) -> Self {
        Self {
            raw,
            _region: PhantomData,
        }
    }

    /// Initialize the lock word with a process-shared attribute
    ///
    /// # Safety
    /// No process may be using the mutex; re-initializing a locked or
    /// contended mutex is undefined.
    pub(crate) unsafe fn init(&self) -> ShmResult<()> {
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            let ret = libc::pthread_mutexattr_init(&mut attr);
            if ret != 0 {
                return Err(ShmError::MutexInitFailed {
                    stage: "pthread_mutexattr_init",
                    errno: Errno::from_raw(ret),
                });
            }

            let ret = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            if ret != 0 {
                libc::pthread_mutexattr_destroy(&mut attr);
                return Err(ShmError::MutexInitFailed {
                    stage: "pthread_mutexattr_setpshared",
                    errno: Errno::from_raw(ret),
                });
            }

            let ret = libc::pthread_mutex_init(self.raw, &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            if ret != 0 {
                return Err(ShmError::MutexInitFailed {
                    stage: "pthread_mutex_init",
                    errno: Errno::from_raw(ret),
                });
            }
        }
        Ok(())
    }

    /// Block until the lock is held
    pub fn lock(&self) -> ShmResult<ShmMutexGuard<'a>> {
        let ret = unsafe { libc::pthread_mutex_lock(self.raw) };
        if ret != 0 {
            return Err(ShmError::MutexLock {
                operation: "lock",
                errno: Errno::from_raw(ret),
            });
        }
        Ok(ShmMutexGuard { mutex: *self })
    }

    /// Take the lock only if it is free
    pub fn try_lock(&self) -> ShmResult<Option<ShmMutexGuard<'a>>> {
        let ret = unsafe { libc::pthread_mutex_trylock(self.raw) };
        match ret {
            0 => Ok(Some(ShmMutexGuard { mutex: *self })),
            libc::EBUSY => Ok(None),
            _ => Err(ShmError::MutexLock {
                operation: "trylock",
                errno: Errno::from_raw(ret),
            }),
        }
    }

    /// Destroy the lock word. Only the owner calls this, after every user is gone.
    pub(crate) unsafe fn destroy(&self) {
        unsafe { libc::pthread_mutex_destroy(self.raw) };
    }
}

/// Releases the mutex on drop
pub struct ShmMutexGuard<'a> {
    mutex: ShmMutex<'a>,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        let ret = unsafe { libc::pthread_mutex_unlock(self.mutex.raw) };
        if ret != 0 {
            tracing::error!("pthread_mutex_unlock failed: {}", Errno::from_raw(ret));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_lock_trylock() {
        let mut storage: Box<libc::pthread_mutex_t> = Box::new(unsafe { std::mem::zeroed() });
        let mutex = unsafe { ShmMutex::from_raw(&mut *storage) };
        unsafe { mutex.init().unwrap() };

        let guard = mutex.lock().unwrap();
        assert!(mutex.try_lock().unwrap().is_none());
        drop(guard);

        let again = mutex.try_lock().unwrap();
        assert!(again.is_some());
        drop(again);
        unsafe { mutex.destroy() };
    }
}
