//! Identity lock registry.
//!
//! Serializes attribute and region mutations per [`FileIdentity`]. The kernel
//! right backing a lock is requested once per identity and shared by nested
//! lock calls from the owning thread, which only bump a reference count. Other
//! threads wait until the owner's count drops to zero and the entry is erased.
//!
//! The registry is an ordinary value: each session owns one, and tests build
//! as many independent registries as they need. Acquisition and release of the
//! kernel right are passed in as closures so the registry itself never talks
//! to the kernel.

use std::collections::HashMap;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::{ConnectorError, Result};
use crate::handle::FileIdentity;

#[derive(Debug, Clone, Copy)]
struct LockEntry {
    owner: ThreadId,
    /// Zero while the kernel right is still being acquired.
    count: usize,
}

/// Process-wide table of locked identities.
#[derive(Debug, Default)]
pub struct IdentityLockRegistry {
    table: Mutex<HashMap<FileIdentity, LockEntry>>,
    released: Condvar,
}

impl IdentityLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks `fuid` for the calling thread.
    ///
    /// `acquire` is called only when the identity is not yet in the table and
    /// must block until the kernel grants the exclusive right.
    pub fn lock<F>(&self, fuid: FileIdentity, acquire: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let me = thread::current().id();
        let mut table = self.table.lock();

        loop {
            match table.get(&fuid).map(|e| e.owner) {
                Some(owner) if owner == me => {
                    if let Some(entry) = table.get_mut(&fuid) {
                        entry.count += 1;
                        debug!(%fuid, count = entry.count, "lock inc");
                    }
                    return Ok(());
                }
                Some(_) => self.released.wait(&mut table),
                None => break,
            }
        }

        table.insert(fuid, LockEntry { owner: me, count: 0 });
        drop(table);

        let acquired = acquire();

        let mut table = self.table.lock();
        match acquired {
            Ok(()) => {
                if let Some(entry) = table.get_mut(&fuid) {
                    entry.count = 1;
                }
                debug!(%fuid, count = 1, "lock new");
                Ok(())
            }
            Err(e) => {
                table.remove(&fuid);
                self.released.notify_all();
                Err(e)
            }
        }
    }

    /// Drops one reference held by the calling thread.
    ///
    /// `release` is called when the last reference goes away. If it fails the
    /// entry stays in place, since the kernel right is still held.
    pub fn unlock<F>(&self, fuid: FileIdentity, release: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let me = thread::current().id();
        let mut table = self.table.lock();

        let entry = match table.get_mut(&fuid) {
            Some(entry) if entry.owner == me && entry.count > 0 => entry,
            other => {
                error!(%fuid, present = other.is_some(), "unlock of an identity not locked by this thread");
                return Err(ConnectorError::NotLocked { fuid });
            }
        };

        if entry.count > 1 {
            entry.count -= 1;
            debug!(%fuid, count = entry.count, "lock dec");
            return Ok(());
        }

        release()?;
        table.remove(&fuid);
        self.released.notify_all();
        debug!(%fuid, "lock rem");
        Ok(())
    }

    pub fn is_locked(&self, fuid: &FileIdentity) -> bool {
        self.table.lock().contains_key(fuid)
    }

    /// Reference count held on `fuid`, zero when absent.
    pub fn lock_count(&self, fuid: &FileIdentity) -> usize {
        self.table.lock().get(fuid).map(|e| e.count).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dm::DmError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::time::Duration;

    fn fuid(inum: u64) -> FileIdentity {
        FileIdentity::new(0, 9, 1, inum)
    }

    #[test]
    fn test_nested_locks_acquire_and_release_once() {
        let registry = IdentityLockRegistry::new();
        let acquires = AtomicUsize::new(0);
        let releases = AtomicUsize::new(0);

        for _ in 0..5 {
            registry
                .lock(fuid(1), || {
                    acquires.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(registry.lock_count(&fuid(1)), 5);

        for _ in 0..5 {
            registry
                .unlock(fuid(1), || {
                    releases.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }

        assert_eq!(acquires.load(Ordering::SeqCst), 1);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unlock_never_locked_is_error() {
        let registry = IdentityLockRegistry::new();
        let err = registry.unlock(fuid(2), || Ok(())).unwrap_err();
        assert!(matches!(err, ConnectorError::NotLocked { .. }));
    }

    #[test]
    fn test_double_unlock_is_error() {
        let registry = IdentityLockRegistry::new();
        registry.lock(fuid(3), || Ok(())).unwrap();
        registry.unlock(fuid(3), || Ok(())).unwrap();
        assert!(registry.unlock(fuid(3), || Ok(())).is_err());
    }

    #[test]
    fn test_failed_acquire_leaves_no_entry() {
        let registry = IdentityLockRegistry::new();
        let err = registry
            .lock(fuid(4), || Err(ConnectorError::dm("dm_request_right", DmError::BadHandle)))
            .unwrap_err();
        assert!(err.dm_error().is_some());
        assert!(!registry.is_locked(&fuid(4)));
    }

    #[test]
    fn test_failed_release_keeps_entry() {
        let registry = IdentityLockRegistry::new();
        registry.lock(fuid(5), || Ok(())).unwrap();
        let err = registry
            .unlock(fuid(5), || Err(ConnectorError::dm("dm_release_right", DmError::Os(libc::EIO))))
            .unwrap_err();
        assert!(err.dm_error().is_some());
        assert_eq!(registry.lock_count(&fuid(5)), 1);
        registry.unlock(fuid(5), || Ok(())).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_distinct_identities_are_independent() {
        let registry = IdentityLockRegistry::new();
        registry.lock(fuid(6), || Ok(())).unwrap();
        registry.lock(fuid(7), || Ok(())).unwrap();
        assert_eq!(registry.len(), 2);
        registry.unlock(fuid(6), || Ok(())).unwrap();
        assert!(registry.is_locked(&fuid(7)));
        assert!(!registry.is_locked(&fuid(6)));
    }

    #[test]
    fn test_other_thread_waits_for_owner() {
        let registry = Arc::new(IdentityLockRegistry::new());
        let owner_done = Arc::new(AtomicBool::new(false));
        registry.lock(fuid(8), || Ok(())).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let registry = registry.clone();
            let owner_done = owner_done.clone();
            std::thread::spawn(move || {
                tx.send(()).unwrap();
                registry.lock(fuid(8), || Ok(())).unwrap();
                let saw_release = owner_done.load(Ordering::SeqCst);
                registry.unlock(fuid(8), || Ok(())).unwrap();
                saw_release
            })
        };

        rx.recv().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        owner_done.store(true, Ordering::SeqCst);
        registry.unlock(fuid(8), || Ok(())).unwrap();

        assert!(waiter.join().unwrap());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unlock_from_other_thread_is_error() {
        let registry = Arc::new(IdentityLockRegistry::new());
        registry.lock(fuid(9), || Ok(())).unwrap();
        let other = registry.clone();
        let result = std::thread::spawn(move || other.unlock(fuid(9), || Ok(())).is_err())
            .join()
            .unwrap();
        assert!(result);
        registry.unlock(fuid(9), || Ok(())).unwrap();
    }
}
