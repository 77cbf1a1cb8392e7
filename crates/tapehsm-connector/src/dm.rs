//! Kernel data-management channel.
//!
//! The connector talks to the kernel exclusively through the [`DmApi`] trait,
//! which mirrors the subset of the X/Open DMAPI the engine relies on: sessions,
//! event dispositions, blocking event retrieval, per-token responses, managed
//! regions, data-management attributes, invisible I/O and access rights.
//! Implementations are the libdm backend ([`crate::sys`], feature `xfs-dmapi`)
//! and the in-memory [`crate::mock::MockDmApi`].
//!
//! Calls that fill a caller-sized buffer report [`DmError::TooSmall`] with the
//! size the kernel needs; callers go through [`crate::buffer`] to grow and retry.

use std::fmt;
use std::path::Path;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::handle::FileIdentity;

/// Kernel session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SessionId(pub i32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sid:{}", self.0)
    }
}

/// Event token. Each token must receive exactly one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Token(pub i32);

impl Token {
    /// Token of asynchronous messages, which take no response.
    pub const NONE: Token = Token(0);

    pub fn is_none(&self) -> bool {
        *self == Token::NONE
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tok:{}", self.0)
    }
}

/// DMAPI event types, numbered as the kernel numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum EventType {
    /// Event cancellation.
    Cancel = 0,
    /// A filesystem was mounted.
    Mount = 1,
    /// Unmount is about to start.
    Preunmount = 2,
    /// Unmount completed.
    Unmount = 3,
    /// First access of an object.
    Debut = 4,
    /// Object creation.
    Create = 5,
    /// Last close of an object.
    Close = 6,
    /// Object created.
    Postcreate = 7,
    /// Object removal.
    Remove = 8,
    /// Object removed.
    Postremove = 9,
    /// Rename.
    Rename = 10,
    /// Rename completed.
    Postrename = 11,
    /// Hard link.
    Link = 12,
    /// Hard link completed.
    Postlink = 13,
    /// Symlink.
    Symlink = 14,
    /// Symlink completed.
    Postsymlink = 15,
    /// Read inside a managed region.
    Read = 16,
    /// Write inside a managed region.
    Write = 17,
    /// Truncate inside a managed region.
    Truncate = 18,
    /// Attribute change.
    Attribute = 19,
    /// Object destroyed.
    Destroy = 20,
    /// Filesystem out of space.
    Nospace = 21,
    /// User message or user event.
    User = 22,
}

impl EventType {
    /// One past the highest event number; the kernel's `DM_EVENT_MAX`.
    pub const MAX: u32 = 23;

    /// Decodes a raw kernel event number.
    pub fn from_raw(raw: i32) -> Option<Self> {
        use EventType::*;
        let ev = match raw {
            0 => Cancel,
            1 => Mount,
            2 => Preunmount,
            3 => Unmount,
            4 => Debut,
            5 => Create,
            6 => Close,
            7 => Postcreate,
            8 => Remove,
            9 => Postremove,
            10 => Rename,
            11 => Postrename,
            12 => Link,
            13 => Postlink,
            14 => Symlink,
            15 => Postsymlink,
            16 => Read,
            17 => Write,
            18 => Truncate,
            19 => Attribute,
            20 => Destroy,
            21 => Nospace,
            22 => User,
            _ => return None,
        };
        Some(ev)
    }

    /// Raw kernel event number.
    pub fn raw(self) -> i32 {
        self as i32
    }
}

/// Set of event types, one bit per [`EventType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EventSet(u64);

impl EventSet {
    /// Empty set.
    pub const fn empty() -> Self {
        EventSet(0)
    }

    /// The events trapped on a managed filesystem: read, write and truncate.
    pub fn data_events() -> Self {
        Self::empty()
            .with(EventType::Read)
            .with(EventType::Write)
            .with(EventType::Truncate)
    }

    /// Builder form of [`EventSet::insert`].
    pub fn with(mut self, ev: EventType) -> Self {
        self.insert(ev);
        self
    }

    pub fn insert(&mut self, ev: EventType) {
        self.0 |= 1u64 << ev.raw();
    }

    pub fn contains(&self, ev: EventType) -> bool {
        self.0 & (1u64 << ev.raw()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Raw bit mask as handed to the kernel.
    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Rebuilds a set from a raw kernel mask, dropping bits past [`EventType::MAX`].
    pub fn from_bits_truncate(bits: u64) -> Self {
        EventSet(bits & ((1u64 << EventType::MAX) - 1))
    }
}

bitflags! {
    /// Operations a managed region traps. The empty set is `DM_REGION_NOEVENT`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RegionFlags: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const TRUNCATE = 0x4;
    }
}

/// A managed byte range. A size of zero extends to the end of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    pub offset: i64,
    pub size: u64,
    pub flags: RegionFlags,
}

impl Region {
    /// Region covering the whole file.
    pub fn whole_file(flags: RegionFlags) -> Self {
        Region {
            offset: 0,
            size: 0,
            flags,
        }
    }

    pub fn is_whole_file(&self) -> bool {
        self.offset == 0 && self.size == 0
    }
}

/// Access right requested on an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Right {
    Shared,
    Exclusive,
}

/// Response delivered for an event token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Let the blocked operation proceed.
    Continue,
    /// Fail the blocked operation with the given errno.
    Abort(i32),
}

/// Object a disposition is registered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispTarget<'a> {
    /// All filesystems; only mount events may be registered globally.
    Global,
    /// One filesystem, named by its filesystem handle.
    Filesystem(&'a [u8]),
}

/// A disposition surviving in the kernel for this session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Disposition {
    pub fs_handle: Vec<u8>,
    pub events: EventSet,
}

/// Mount information of a filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MountInfo {
    pub fs_handle: Vec<u8>,
    pub root_handle: Vec<u8>,
    pub mount_point: String,
    pub device: String,
}

/// Payload of a mount event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MountEvent {
    pub fs_handle: Vec<u8>,
    pub root_handle: Vec<u8>,
    pub mount_point: String,
    pub device: String,
}

/// Payload of a read, write or truncate event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataEvent {
    pub handle: Vec<u8>,
    pub offset: i64,
    pub length: u64,
}

/// Decoded payload of a kernel event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    Mount(MountEvent),
    Data(DataEvent),
    User(Vec<u8>),
    Other,
}

/// One event retrieved from the session queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMessage {
    pub event: EventType,
    pub token: Token,
    pub payload: EventPayload,
}

/// Stat data as reported by the kernel interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: i64,
    pub blksize: u32,
    pub blocks: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl DmStat {
    pub fn is_regular(&self) -> bool {
        self.mode & (libc::S_IFMT as u32) == libc::S_IFREG as u32
    }
}

/// Classified failure of a kernel call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DmError {
    /// The supplied buffer is too small; `required` is in buffer units.
    #[error("buffer too small, {required} required")]
    TooSmall { required: usize },

    #[error("no such object or attribute")]
    NotFound,

    /// Interrupted before completion; the call may be repeated.
    #[error("interrupted")]
    Interrupted,

    #[error("invalid or stale handle")]
    BadHandle,

    #[error("permission denied")]
    PermissionDenied,

    #[error("resource busy")]
    Busy,

    #[error("errno {0}")]
    Os(i32),
}

impl DmError {
    /// Classifies a raw errno. `E2BIG` needs the reported size and is handled by the caller.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOENT => DmError::NotFound,
            libc::EINTR | libc::EAGAIN => DmError::Interrupted,
            libc::EBADF | libc::EINVAL => DmError::BadHandle,
            libc::EPERM | libc::EACCES => DmError::PermissionDenied,
            libc::EBUSY => DmError::Busy,
            other => DmError::Os(other),
        }
    }

    pub fn errno(&self) -> i32 {
        match self {
            DmError::TooSmall { .. } => libc::E2BIG,
            DmError::NotFound => libc::ENOENT,
            DmError::Interrupted => libc::EINTR,
            DmError::BadHandle => libc::EINVAL,
            DmError::PermissionDenied => libc::EPERM,
            DmError::Busy => libc::EBUSY,
            DmError::Os(e) => *e,
        }
    }
}

/// Result type alias for kernel calls.
pub type DmResult<T> = std::result::Result<T, DmError>;

/// The kernel data-management interface used by the connector.
///
/// Every call is blocking. `token: None` is `DM_NO_TOKEN`.
pub trait DmApi: Send + Sync {
    /// Initializes the service and returns its version string.
    fn init_service(&self) -> DmResult<String>;

    /// Lists all sessions known to the kernel.
    fn getall_sessions(&self, buf: &mut [SessionId]) -> DmResult<usize>;

    /// Returns the name a session was created with.
    fn query_session(&self, sid: SessionId) -> DmResult<String>;

    /// Lists the outstanding tokens of a session.
    fn getall_tokens(&self, sid: SessionId, buf: &mut [Token]) -> DmResult<usize>;

    /// Creates a session, assuming `old` if given.
    fn create_session(&self, old: Option<SessionId>, name: &str) -> DmResult<SessionId>;

    /// Destroys a session; fails while tokens are outstanding.
    fn destroy_session(&self, sid: SessionId) -> DmResult<()>;

    /// Creates a user event and returns its token.
    fn create_userevent(&self, sid: SessionId, msg: &[u8]) -> DmResult<Token>;

    /// Queues an asynchronous user message on the session.
    fn send_msg(&self, sid: SessionId, msg: &[u8]) -> DmResult<()>;

    /// Responds to an event token.
    fn respond_event(&self, sid: SessionId, token: Token, response: Response) -> DmResult<()>;

    /// Blocks until one event is available and returns it.
    fn get_events(&self, sid: SessionId) -> DmResult<EventMessage>;

    /// Lists the dispositions registered for the session.
    fn getall_disp(&self, sid: SessionId, buf: &mut [Disposition]) -> DmResult<usize>;

    /// Registers event interest on a target.
    fn set_disp(&self, sid: SessionId, target: DispTarget<'_>, events: EventSet) -> DmResult<()>;

    /// Looks up the mount information of a filesystem; `buf_len` is in bytes.
    fn get_mountinfo(&self, sid: SessionId, fs_handle: &[u8], buf_len: usize) -> DmResult<MountInfo>;

    fn path_to_handle(&self, path: &Path) -> DmResult<Vec<u8>>;

    fn make_handle(&self, fsid: u64, ino: u64, igen: u32) -> DmResult<Vec<u8>>;

    fn handle_to_fshandle(&self, handle: &[u8]) -> DmResult<Vec<u8>>;

    fn handle_to_identity(&self, handle: &[u8]) -> DmResult<FileIdentity>;

    /// Releases a handle obtained from this interface.
    fn handle_free(&self, handle: &[u8]);

    fn get_dmattr(
        &self,
        sid: SessionId,
        handle: &[u8],
        token: Option<Token>,
        name: &str,
    ) -> DmResult<Vec<u8>>;

    fn set_dmattr(
        &self,
        sid: SessionId,
        handle: &[u8],
        token: Option<Token>,
        name: &str,
        value: &[u8],
    ) -> DmResult<()>;

    fn remove_dmattr(
        &self,
        sid: SessionId,
        handle: &[u8],
        token: Option<Token>,
        name: &str,
    ) -> DmResult<()>;

    fn get_fileattr(&self, sid: SessionId, handle: &[u8]) -> DmResult<DmStat>;

    /// Reads without generating events or touching timestamps.
    fn read_invis(
        &self,
        sid: SessionId,
        handle: &[u8],
        token: Option<Token>,
        offset: u64,
        buf: &mut [u8],
    ) -> DmResult<usize>;

    /// Synchronous write without generating events or touching timestamps.
    fn write_invis(
        &self,
        sid: SessionId,
        handle: &[u8],
        token: Option<Token>,
        offset: u64,
        data: &[u8],
    ) -> DmResult<usize>;

    /// Replaces the managed regions of a file. Returns whether the kernel
    /// tracks them exactly.
    fn set_region(
        &self,
        sid: SessionId,
        handle: &[u8],
        token: Option<Token>,
        regions: &[Region],
    ) -> DmResult<bool>;

    fn get_region(&self, sid: SessionId, handle: &[u8], buf: &mut [Region]) -> DmResult<usize>;

    /// Discards on-disk data; a length of zero extends to the end of the file.
    fn punch_hole(
        &self,
        sid: SessionId,
        handle: &[u8],
        token: Option<Token>,
        offset: u64,
        len: u64,
    ) -> DmResult<()>;

    /// Waits until the right is granted.
    fn request_right(&self, sid: SessionId, handle: &[u8], token: Token, right: Right) -> DmResult<()>;

    fn release_right(&self, sid: SessionId, handle: &[u8], token: Token) -> DmResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_raw_round_trip() {
        for raw in 0..EventType::MAX as i32 {
            let ev = EventType::from_raw(raw).unwrap();
            assert_eq!(ev.raw(), raw);
        }
        assert_eq!(EventType::from_raw(23), None);
        assert_eq!(EventType::from_raw(-1), None);
    }

    #[test]
    fn test_data_events_set() {
        let set = EventSet::data_events();
        assert!(set.contains(EventType::Read));
        assert!(set.contains(EventType::Write));
        assert!(set.contains(EventType::Truncate));
        assert!(!set.contains(EventType::Mount));
        assert_eq!(set.bits(), (1 << 16) | (1 << 17) | (1 << 18));
    }

    #[test]
    fn test_event_set_truncates_unknown_bits() {
        let set = EventSet::from_bits_truncate(u64::MAX);
        assert!(set.contains(EventType::User));
        assert_eq!(set.bits(), (1u64 << 23) - 1);
    }

    #[test]
    fn test_whole_file_region() {
        let reg = Region::whole_file(RegionFlags::WRITE | RegionFlags::TRUNCATE);
        assert!(reg.is_whole_file());
        assert_eq!(reg.flags.bits(), 0x6);
        assert!(!Region { offset: 4096, ..reg }.is_whole_file());
    }

    #[test]
    fn test_errno_classification() {
        assert_eq!(DmError::from_errno(libc::ENOENT), DmError::NotFound);
        assert_eq!(DmError::from_errno(libc::EAGAIN), DmError::Interrupted);
        assert_eq!(DmError::from_errno(libc::EINVAL), DmError::BadHandle);
        assert_eq!(DmError::from_errno(libc::EPERM), DmError::PermissionDenied);
        assert_eq!(DmError::from_errno(libc::EIO), DmError::Os(libc::EIO));
        assert_eq!(DmError::TooSmall { required: 8 }.errno(), libc::E2BIG);
    }
}
