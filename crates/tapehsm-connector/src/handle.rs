//! File identities and kernel handle ownership.
//!
//! Handles returned by path resolution or reconstruction are owned and
//! released exactly once when dropped. Handles that arrive inside an event
//! payload belong to the event and are only ever borrowed.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dm::DmApi;

/// Stable identity of a filesystem object across handle churn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct FileIdentity {
    pub fsid_high: u64,
    pub fsid_low: u64,
    pub igen: u32,
    pub inum: u64,
}

impl FileIdentity {
    pub fn new(fsid_high: u64, fsid_low: u64, igen: u32, inum: u64) -> Self {
        FileIdentity {
            fsid_high,
            fsid_low,
            igen,
            inum,
        }
    }

    /// Identity reported for an object without a handle.
    pub fn is_zero(&self) -> bool {
        *self == FileIdentity::default()
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}:{:x}/{}.{}",
            self.fsid_high, self.fsid_low, self.inum, self.igen
        )
    }
}

/// A handle this process obtained and must release.
pub struct OwnedHandle {
    bytes: Vec<u8>,
    dm: Arc<dyn DmApi>,
}

impl OwnedHandle {
    pub fn new(dm: Arc<dyn DmApi>, bytes: Vec<u8>) -> Self {
        OwnedHandle { bytes, dm }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        self.dm.handle_free(&self.bytes);
    }
}

impl fmt::Debug for OwnedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedHandle")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Handle held by a file object.
#[derive(Debug)]
pub enum Handle<'a> {
    Owned(OwnedHandle),
    Borrowed(&'a [u8]),
}

impl Handle<'_> {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Handle::Owned(h) => h.as_bytes(),
            Handle::Borrowed(b) => b,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Handle::Owned(_))
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDmApi;

    #[test]
    fn test_zero_identity() {
        assert!(FileIdentity::default().is_zero());
        assert!(!FileIdentity::new(0, 1, 0, 0).is_zero());
    }

    #[test]
    fn test_identity_display() {
        let fuid = FileIdentity::new(0, 0xab, 3, 77);
        assert_eq!(fuid.to_string(), "0:ab/77.3");
    }

    #[test]
    fn test_identity_ordering_is_total() {
        let a = FileIdentity::new(0, 1, 0, 5);
        let b = FileIdentity::new(0, 1, 0, 6);
        assert!(a < b);
    }

    #[test]
    fn test_owned_handle_freed_once_on_drop() {
        let mock = Arc::new(MockDmApi::new());
        let bytes = mock.make_handle(1, 2, 3).unwrap();
        {
            let handle = Handle::Owned(OwnedHandle::new(mock.clone(), bytes.clone()));
            assert!(handle.is_owned());
            assert_eq!(handle.as_bytes(), bytes.as_slice());
        }
        assert_eq!(mock.free_count(&bytes), 1);
    }

    #[test]
    fn test_borrowed_handle_never_freed() {
        let mock = Arc::new(MockDmApi::new());
        let bytes = mock.make_handle(1, 2, 3).unwrap();
        {
            let handle = Handle::Borrowed(&bytes);
            assert!(!handle.is_owned());
        }
        assert_eq!(mock.free_count(&bytes), 0);
    }
}
