//! In-memory data-management interface.
//!
//! [`MockDmApi`] keeps sessions, tokens, dispositions, filesystems and files in
//! memory and behaves like the kernel where the connector depends on it:
//! buffer-sized calls report the size they need, every token accepts exactly
//! one response, sessions with outstanding tokens cannot be destroyed, and
//! invisible I/O never generates events. Faults can be injected per call
//! family, and every handle release and right request is counted.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::dm::{
    DataEvent, DispTarget, Disposition, DmApi, DmError, DmResult, DmStat, EventMessage,
    EventPayload, EventSet, EventType, MountEvent, MountInfo, Region, RegionFlags, Response,
    Right, SessionId, Token,
};
use crate::handle::FileIdentity;

const FILE_HANDLE_TAG: u8 = b'F';
const FS_HANDLE_TAG: u8 = b'S';
const S_IFREG: u32 = 0o100_000;
const S_IFDIR: u32 = 0o040_000;

/// Reachability of a filesystem as seen by mount-info lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountAccess {
    Mounted,
    Unmounted,
    Forbidden,
}

#[derive(Debug, Default)]
struct MockSession {
    name: String,
    tokens: BTreeSet<Token>,
    dispositions: Vec<Disposition>,
    global: EventSet,
}

#[derive(Debug)]
struct MockFs {
    mount_point: String,
    device: String,
    root_ino: u64,
    access: MountAccess,
}

#[derive(Debug, Clone)]
struct MockFile {
    igen: u32,
    mode: u32,
    data: Vec<u8>,
    /// Bytes backed by disk blocks, from the start of the file.
    allocated: u64,
    attrs: HashMap<String, Vec<u8>>,
    regions: Vec<Region>,
    atime: i64,
    mtime: i64,
}

#[derive(Debug)]
struct QueuedEvent {
    event: EventType,
    token: Token,
    payload: EventPayload,
}

#[derive(Debug)]
struct MockState {
    next_sid: i32,
    next_token: i32,
    next_ino: u64,
    sessions: BTreeMap<SessionId, MockSession>,
    filesystems: BTreeMap<u64, MockFs>,
    files: HashMap<(u64, u64), MockFile>,
    paths: HashMap<PathBuf, (u64, u64)>,
    queue: VecDeque<QueuedEvent>,
    pending_interrupts: u32,
    responses: Vec<(Token, Response)>,
    held_rights: HashMap<(u64, u64), usize>,
    right_requests: u64,
    right_releases: u64,
    frees: HashMap<Vec<u8>, usize>,
    fail_destroy: HashSet<SessionId>,
    fail_set_dmattr: u32,
    fail_fs_disposition: bool,
    fail_get_events: Option<DmError>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            next_sid: 1,
            next_token: 1,
            next_ino: 100,
            sessions: BTreeMap::new(),
            filesystems: BTreeMap::new(),
            files: HashMap::new(),
            paths: HashMap::new(),
            queue: VecDeque::new(),
            pending_interrupts: 0,
            responses: Vec::new(),
            held_rights: HashMap::new(),
            right_requests: 0,
            right_releases: 0,
            frees: HashMap::new(),
            fail_destroy: HashSet::new(),
            fail_set_dmattr: 0,
            fail_fs_disposition: false,
            fail_get_events: None,
        }
    }
}

impl MockState {
    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn session(&mut self, sid: SessionId) -> DmResult<&mut MockSession> {
        self.sessions.get_mut(&sid).ok_or(DmError::BadHandle)
    }

    fn file(&self, handle: &[u8]) -> DmResult<&MockFile> {
        let (fsid, ino, igen) = decode_file_handle(handle)?;
        match self.files.get(&(fsid, ino)) {
            Some(file) if file.igen == igen => Ok(file),
            _ => Err(DmError::BadHandle),
        }
    }

    fn file_mut(&mut self, handle: &[u8]) -> DmResult<&mut MockFile> {
        let (fsid, ino, igen) = decode_file_handle(handle)?;
        match self.files.get_mut(&(fsid, ino)) {
            Some(file) if file.igen == igen => Ok(file),
            _ => Err(DmError::BadHandle),
        }
    }

    fn check_token(&self, sid: SessionId, token: Option<Token>) -> DmResult<()> {
        let session = self.sessions.get(&sid).ok_or(DmError::BadHandle)?;
        match token {
            Some(token) if !session.tokens.contains(&token) => Err(DmError::BadHandle),
            _ => Ok(()),
        }
    }

    fn file_handle_of(&self, fsid: u64, ino: u64) -> Option<Vec<u8>> {
        self.files
            .get(&(fsid, ino))
            .map(|f| encode_file_handle(fsid, ino, f.igen))
    }
}

fn encode_file_handle(fsid: u64, ino: u64, igen: u32) -> Vec<u8> {
    let mut h = Vec::with_capacity(21);
    h.push(FILE_HANDLE_TAG);
    h.extend_from_slice(&fsid.to_le_bytes());
    h.extend_from_slice(&ino.to_le_bytes());
    h.extend_from_slice(&igen.to_le_bytes());
    h
}

fn encode_fs_handle(fsid: u64) -> Vec<u8> {
    let mut h = Vec::with_capacity(9);
    h.push(FS_HANDLE_TAG);
    h.extend_from_slice(&fsid.to_le_bytes());
    h
}

fn read_u64(bytes: &[u8]) -> DmResult<u64> {
    bytes
        .try_into()
        .map(u64::from_le_bytes)
        .map_err(|_| DmError::BadHandle)
}

fn decode_file_handle(handle: &[u8]) -> DmResult<(u64, u64, u32)> {
    if handle.len() != 21 || handle[0] != FILE_HANDLE_TAG {
        return Err(DmError::BadHandle);
    }
    let fsid = read_u64(&handle[1..9])?;
    let ino = read_u64(&handle[9..17])?;
    let igen = handle[17..21]
        .try_into()
        .map(u32::from_le_bytes)
        .map_err(|_| DmError::BadHandle)?;
    Ok((fsid, ino, igen))
}

fn decode_fsid(handle: &[u8]) -> DmResult<u64> {
    match handle.first() {
        Some(&FS_HANDLE_TAG) if handle.len() == 9 => read_u64(&handle[1..9]),
        Some(&FILE_HANDLE_TAG) => decode_file_handle(handle).map(|(fsid, _, _)| fsid),
        _ => Err(DmError::BadHandle),
    }
}

fn fill<T: Clone>(items: &[T], buf: &mut [T]) -> DmResult<usize> {
    if buf.len() < items.len() {
        return Err(DmError::TooSmall {
            required: items.len(),
        });
    }
    buf[..items.len()].clone_from_slice(items);
    Ok(items.len())
}

/// In-memory kernel used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MockDmApi {
    state: Mutex<MockState>,
    event_ready: Condvar,
}

impl MockDmApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mounted filesystem and returns its filesystem handle.
    pub fn add_filesystem(&self, fsid: u64, mount_point: &str, device: &str) -> Vec<u8> {
        let mut st = self.state.lock();
        let root_ino = st.next_ino;
        st.next_ino += 1;
        st.files.insert(
            (fsid, root_ino),
            MockFile {
                igen: 1,
                mode: S_IFDIR | 0o755,
                data: Vec::new(),
                allocated: 0,
                attrs: HashMap::new(),
                regions: Vec::new(),
                atime: 0,
                mtime: 0,
            },
        );
        st.paths.insert(PathBuf::from(mount_point), (fsid, root_ino));
        st.filesystems.insert(
            fsid,
            MockFs {
                mount_point: mount_point.to_string(),
                device: device.to_string(),
                root_ino,
                access: MountAccess::Mounted,
            },
        );
        encode_fs_handle(fsid)
    }

    /// Creates a regular file on filesystem `fsid`.
    pub fn add_file(&self, fsid: u64, path: impl AsRef<Path>, data: &[u8]) -> FileIdentity {
        let mut st = self.state.lock();
        let ino = st.next_ino;
        st.next_ino += 1;
        let igen = 1;
        st.files.insert(
            (fsid, ino),
            MockFile {
                igen,
                mode: S_IFREG | 0o644,
                data: data.to_vec(),
                allocated: data.len() as u64,
                attrs: HashMap::new(),
                regions: Vec::new(),
                atime: 1_000,
                mtime: 1_000,
            },
        );
        st.paths.insert(path.as_ref().to_path_buf(), (fsid, ino));
        FileIdentity::new(0, fsid, igen, ino)
    }

    pub fn set_mount_access(&self, fsid: u64, access: MountAccess) {
        if let Some(fs) = self.state.lock().filesystems.get_mut(&fsid) {
            fs.access = access;
        }
    }

    /// Creates a session that looks left over from a previous run.
    pub fn seed_session(&self, name: &str, outstanding_tokens: usize) -> SessionId {
        let mut st = self.state.lock();
        let sid = SessionId(st.next_sid);
        st.next_sid += 1;
        let mut session = MockSession {
            name: name.to_string(),
            ..Default::default()
        };
        for _ in 0..outstanding_tokens {
            let token = st.alloc_token();
            session.tokens.insert(token);
        }
        st.sessions.insert(sid, session);
        sid
    }

    /// Registers a disposition on a session as if it survived a restart.
    pub fn seed_disposition(&self, sid: SessionId, fs_handle: &[u8], events: EventSet) {
        let mut st = self.state.lock();
        if let Some(session) = st.sessions.get_mut(&sid) {
            session.dispositions.push(Disposition {
                fs_handle: fs_handle.to_vec(),
                events,
            });
        }
    }

    fn post(&self, event: EventType, token: Token, payload: EventPayload) {
        let mut st = self.state.lock();
        st.queue.push_back(QueuedEvent {
            event,
            token,
            payload,
        });
        self.event_ready.notify_all();
    }

    /// Queues a mount event for filesystem `fsid`.
    pub fn post_mount(&self, fsid: u64) -> Token {
        let (token, payload) = {
            let mut st = self.state.lock();
            let token = st.alloc_token();
            let payload = match st.filesystems.get(&fsid) {
                Some(fs) => EventPayload::Mount(MountEvent {
                    fs_handle: encode_fs_handle(fsid),
                    root_handle: st.file_handle_of(fsid, fs.root_ino).unwrap_or_default(),
                    mount_point: fs.mount_point.clone(),
                    device: fs.device.clone(),
                }),
                None => EventPayload::Mount(MountEvent::default()),
            };
            (token, payload)
        };
        self.post(EventType::Mount, token, payload);
        token
    }

    /// Queues a data event on a file.
    pub fn post_data_event(&self, event: EventType, fuid: FileIdentity, offset: i64, length: u64) -> Token {
        let (token, handle) = {
            let mut st = self.state.lock();
            let token = st.alloc_token();
            let handle = st
                .file_handle_of(fuid.fsid_low, fuid.inum)
                .unwrap_or_default();
            (token, handle)
        };
        self.post(
            event,
            token,
            EventPayload::Data(DataEvent {
                handle,
                offset,
                length,
            }),
        );
        token
    }

    /// Queues an event of any other type.
    pub fn post_other(&self, event: EventType) -> Token {
        let token = self.state.lock().alloc_token();
        self.post(event, token, EventPayload::Other);
        token
    }

    /// Simulates an access: returns the token of the generated event, or
    /// `None` when no managed region traps the operation.
    pub fn access(&self, fuid: FileIdentity, event: EventType) -> Option<Token> {
        let flag = match event {
            EventType::Read => RegionFlags::READ,
            EventType::Write => RegionFlags::WRITE,
            EventType::Truncate => RegionFlags::TRUNCATE,
            _ => return None,
        };
        let trapped = self
            .regions(fuid)
            .iter()
            .any(|r| r.flags.contains(flag));
        trapped.then(|| self.post_data_event(event, fuid, 0, 0))
    }

    /// Makes the next `n` event retrievals fail with an interrupt.
    pub fn interrupt_next(&self, n: u32) {
        self.state.lock().pending_interrupts += n;
        self.event_ready.notify_all();
    }

    pub fn fail_destroy(&self, sid: SessionId) {
        self.state.lock().fail_destroy.insert(sid);
    }

    /// Makes the next `n` attribute writes fail.
    pub fn fail_set_dmattr(&self, n: u32) {
        self.state.lock().fail_set_dmattr = n;
    }

    pub fn fail_fs_disposition(&self, fail: bool) {
        self.state.lock().fail_fs_disposition = fail;
    }

    /// Makes the next event retrieval fail with `err`.
    pub fn fail_get_events(&self, err: DmError) {
        self.state.lock().fail_get_events = Some(err);
        self.event_ready.notify_all();
    }

    pub fn has_session(&self, sid: SessionId) -> bool {
        self.state.lock().sessions.contains_key(&sid)
    }

    pub fn session_name(&self, sid: SessionId) -> Option<String> {
        self.state.lock().sessions.get(&sid).map(|s| s.name.clone())
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn outstanding_tokens(&self, sid: SessionId) -> Vec<Token> {
        self.state
            .lock()
            .sessions
            .get(&sid)
            .map(|s| s.tokens.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn dispositions(&self, sid: SessionId) -> Vec<Disposition> {
        self.state
            .lock()
            .sessions
            .get(&sid)
            .map(|s| s.dispositions.clone())
            .unwrap_or_default()
    }

    pub fn global_disposition(&self, sid: SessionId) -> EventSet {
        self.state
            .lock()
            .sessions
            .get(&sid)
            .map(|s| s.global)
            .unwrap_or_default()
    }

    /// Every response delivered so far, in order.
    pub fn responses(&self) -> Vec<(Token, Response)> {
        self.state.lock().responses.clone()
    }

    pub fn response_for(&self, token: Token) -> Option<Response> {
        self.state
            .lock()
            .responses
            .iter()
            .find(|(t, _)| *t == token)
            .map(|(_, r)| *r)
    }

    pub fn response_count(&self, token: Token) -> usize {
        self.state
            .lock()
            .responses
            .iter()
            .filter(|(t, _)| *t == token)
            .count()
    }

    pub fn right_requests(&self) -> u64 {
        self.state.lock().right_requests
    }

    pub fn right_releases(&self) -> u64 {
        self.state.lock().right_releases
    }

    /// How often `handle` was released.
    pub fn free_count(&self, handle: &[u8]) -> usize {
        self.state.lock().frees.get(handle).copied().unwrap_or(0)
    }

    pub fn total_frees(&self) -> usize {
        self.state.lock().frees.values().sum()
    }

    pub fn file_data(&self, fuid: FileIdentity) -> Vec<u8> {
        self.state
            .lock()
            .files
            .get(&(fuid.fsid_low, fuid.inum))
            .map(|f| f.data.clone())
            .unwrap_or_default()
    }

    pub fn regions(&self, fuid: FileIdentity) -> Vec<Region> {
        self.state
            .lock()
            .files
            .get(&(fuid.fsid_low, fuid.inum))
            .map(|f| f.regions.clone())
            .unwrap_or_default()
    }

    /// Installs regions behind the connector's back.
    pub fn set_regions(&self, fuid: FileIdentity, regions: &[Region]) {
        if let Some(file) = self.state.lock().files.get_mut(&(fuid.fsid_low, fuid.inum)) {
            file.regions = regions.to_vec();
        }
    }

    pub fn attribute(&self, fuid: FileIdentity, name: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .files
            .get(&(fuid.fsid_low, fuid.inum))
            .and_then(|f| f.attrs.get(name).cloned())
    }

    /// Stores raw attribute bytes behind the connector's back.
    pub fn set_attribute(&self, fuid: FileIdentity, name: &str, value: &[u8]) {
        if let Some(file) = self.state.lock().files.get_mut(&(fuid.fsid_low, fuid.inum)) {
            file.attrs.insert(name.to_string(), value.to_vec());
        }
    }

    /// Access and modification times of a file.
    pub fn times(&self, fuid: FileIdentity) -> Option<(i64, i64)> {
        self.state
            .lock()
            .files
            .get(&(fuid.fsid_low, fuid.inum))
            .map(|f| (f.atime, f.mtime))
    }

    pub fn root_identity(&self, fsid: u64) -> Option<FileIdentity> {
        let st = self.state.lock();
        let fs = st.filesystems.get(&fsid)?;
        let file = st.files.get(&(fsid, fs.root_ino))?;
        Some(FileIdentity::new(0, fsid, file.igen, fs.root_ino))
    }
}

impl DmApi for MockDmApi {
    fn init_service(&self) -> DmResult<String> {
        Ok("mock-dmapi 2.3".to_string())
    }

    fn getall_sessions(&self, buf: &mut [SessionId]) -> DmResult<usize> {
        let st = self.state.lock();
        let sids: Vec<SessionId> = st.sessions.keys().copied().collect();
        fill(&sids, buf)
    }

    fn query_session(&self, sid: SessionId) -> DmResult<String> {
        let st = self.state.lock();
        st.sessions
            .get(&sid)
            .map(|s| s.name.clone())
            .ok_or(DmError::BadHandle)
    }

    fn getall_tokens(&self, sid: SessionId, buf: &mut [Token]) -> DmResult<usize> {
        let st = self.state.lock();
        let session = st.sessions.get(&sid).ok_or(DmError::BadHandle)?;
        let tokens: Vec<Token> = session.tokens.iter().copied().collect();
        fill(&tokens, buf)
    }

    fn create_session(&self, old: Option<SessionId>, name: &str) -> DmResult<SessionId> {
        let mut st = self.state.lock();
        if let Some(old) = old {
            let session = st.session(old)?;
            session.name = name.to_string();
            debug!(%old, "mock session assumed");
            return Ok(old);
        }
        let sid = SessionId(st.next_sid);
        st.next_sid += 1;
        st.sessions.insert(
            sid,
            MockSession {
                name: name.to_string(),
                ..Default::default()
            },
        );
        Ok(sid)
    }

    fn destroy_session(&self, sid: SessionId) -> DmResult<()> {
        let mut st = self.state.lock();
        if st.fail_destroy.contains(&sid) {
            return Err(DmError::Os(libc::EIO));
        }
        let session = st.session(sid)?;
        if !session.tokens.is_empty() {
            return Err(DmError::Busy);
        }
        st.sessions.remove(&sid);
        Ok(())
    }

    fn create_userevent(&self, sid: SessionId, _msg: &[u8]) -> DmResult<Token> {
        let mut st = self.state.lock();
        let token = st.alloc_token();
        st.session(sid)?.tokens.insert(token);
        Ok(token)
    }

    fn send_msg(&self, sid: SessionId, msg: &[u8]) -> DmResult<()> {
        if !self.has_session(sid) {
            return Err(DmError::BadHandle);
        }
        self.post(EventType::User, Token::NONE, EventPayload::User(msg.to_vec()));
        Ok(())
    }

    fn respond_event(&self, sid: SessionId, token: Token, response: Response) -> DmResult<()> {
        let mut st = self.state.lock();
        let session = st.session(sid)?;
        if !session.tokens.remove(&token) {
            return Err(DmError::Os(libc::ESRCH));
        }
        st.responses.push((token, response));
        Ok(())
    }

    fn get_events(&self, sid: SessionId) -> DmResult<EventMessage> {
        let mut st = self.state.lock();
        loop {
            if let Some(err) = st.fail_get_events.take() {
                return Err(err);
            }
            if st.pending_interrupts > 0 {
                st.pending_interrupts -= 1;
                return Err(DmError::Interrupted);
            }
            if !st.sessions.contains_key(&sid) {
                return Err(DmError::BadHandle);
            }
            if let Some(queued) = st.queue.pop_front() {
                if queued.token != Token::NONE {
                    st.session(sid)?.tokens.insert(queued.token);
                }
                return Ok(EventMessage {
                    event: queued.event,
                    token: queued.token,
                    payload: queued.payload,
                });
            }
            self.event_ready.wait(&mut st);
        }
    }

    fn getall_disp(&self, sid: SessionId, buf: &mut [Disposition]) -> DmResult<usize> {
        let st = self.state.lock();
        let session = st.sessions.get(&sid).ok_or(DmError::BadHandle)?;
        fill(&session.dispositions, buf)
    }

    fn set_disp(&self, sid: SessionId, target: DispTarget<'_>, events: EventSet) -> DmResult<()> {
        let mut st = self.state.lock();
        match target {
            DispTarget::Global => {
                let only_mount = EventSet::empty().with(EventType::Mount);
                if events.bits() & !only_mount.bits() != 0 {
                    return Err(DmError::BadHandle);
                }
                st.session(sid)?.global = events;
            }
            DispTarget::Filesystem(fs_handle) => {
                let fsid = decode_fsid(fs_handle)?;
                if !st.filesystems.contains_key(&fsid) {
                    return Err(DmError::BadHandle);
                }
                if st.fail_fs_disposition {
                    return Err(DmError::Os(libc::EIO));
                }
                let fs_handle = encode_fs_handle(fsid);
                let session = st.session(sid)?;
                session.dispositions.retain(|d| d.fs_handle != fs_handle);
                if !events.is_empty() {
                    session.dispositions.push(Disposition { fs_handle, events });
                }
            }
        }
        Ok(())
    }

    fn get_mountinfo(&self, sid: SessionId, fs_handle: &[u8], buf_len: usize) -> DmResult<MountInfo> {
        let st = self.state.lock();
        if !st.sessions.contains_key(&sid) {
            return Err(DmError::BadHandle);
        }
        let fsid = decode_fsid(fs_handle)?;
        let fs = st.filesystems.get(&fsid).ok_or(DmError::BadHandle)?;
        match fs.access {
            MountAccess::Mounted => {}
            MountAccess::Unmounted => return Err(DmError::BadHandle),
            MountAccess::Forbidden => return Err(DmError::PermissionDenied),
        }
        let required = 64 + fs.mount_point.len() + fs.device.len();
        if buf_len < required {
            return Err(DmError::TooSmall { required });
        }
        Ok(MountInfo {
            fs_handle: encode_fs_handle(fsid),
            root_handle: st.file_handle_of(fsid, fs.root_ino).unwrap_or_default(),
            mount_point: fs.mount_point.clone(),
            device: fs.device.clone(),
        })
    }

    fn path_to_handle(&self, path: &Path) -> DmResult<Vec<u8>> {
        let st = self.state.lock();
        let (fsid, ino) = st.paths.get(path).copied().ok_or(DmError::NotFound)?;
        st.file_handle_of(fsid, ino).ok_or(DmError::NotFound)
    }

    fn make_handle(&self, fsid: u64, ino: u64, igen: u32) -> DmResult<Vec<u8>> {
        Ok(encode_file_handle(fsid, ino, igen))
    }

    fn handle_to_fshandle(&self, handle: &[u8]) -> DmResult<Vec<u8>> {
        decode_fsid(handle).map(encode_fs_handle)
    }

    fn handle_to_identity(&self, handle: &[u8]) -> DmResult<FileIdentity> {
        let (fsid, ino, igen) = decode_file_handle(handle)?;
        Ok(FileIdentity::new(0, fsid, igen, ino))
    }

    fn handle_free(&self, handle: &[u8]) {
        *self.state.lock().frees.entry(handle.to_vec()).or_insert(0) += 1;
    }

    fn get_dmattr(
        &self,
        sid: SessionId,
        handle: &[u8],
        token: Option<Token>,
        name: &str,
    ) -> DmResult<Vec<u8>> {
        let st = self.state.lock();
        st.check_token(sid, token)?;
        st.file(handle)?
            .attrs
            .get(name)
            .cloned()
            .ok_or(DmError::NotFound)
    }

    fn set_dmattr(
        &self,
        sid: SessionId,
        handle: &[u8],
        token: Option<Token>,
        name: &str,
        value: &[u8],
    ) -> DmResult<()> {
        let mut st = self.state.lock();
        st.check_token(sid, token)?;
        if st.fail_set_dmattr > 0 {
            st.fail_set_dmattr -= 1;
            return Err(DmError::Os(libc::EIO));
        }
        st.file_mut(handle)?
            .attrs
            .insert(name.to_string(), value.to_vec());
        Ok(())
    }

    fn remove_dmattr(
        &self,
        sid: SessionId,
        handle: &[u8],
        token: Option<Token>,
        name: &str,
    ) -> DmResult<()> {
        let mut st = self.state.lock();
        st.check_token(sid, token)?;
        st.file_mut(handle)?
            .attrs
            .remove(name)
            .map(|_| ())
            .ok_or(DmError::NotFound)
    }

    fn get_fileattr(&self, sid: SessionId, handle: &[u8]) -> DmResult<DmStat> {
        let st = self.state.lock();
        st.check_token(sid, None)?;
        let (fsid, ino, _) = decode_file_handle(handle)?;
        let file = st.file(handle)?;
        Ok(DmStat {
            dev: fsid,
            ino,
            mode: file.mode,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: file.data.len() as i64,
            blksize: 4096,
            blocks: file.allocated.div_ceil(512),
            atime: file.atime,
            mtime: file.mtime,
            ctime: file.mtime,
        })
    }

    fn read_invis(
        &self,
        sid: SessionId,
        handle: &[u8],
        token: Option<Token>,
        offset: u64,
        buf: &mut [u8],
    ) -> DmResult<usize> {
        let st = self.state.lock();
        st.check_token(sid, token)?;
        let file = st.file(handle)?;
        let start = (offset as usize).min(file.data.len());
        let end = (start + buf.len()).min(file.data.len());
        buf[..end - start].copy_from_slice(&file.data[start..end]);
        Ok(end - start)
    }

    fn write_invis(
        &self,
        sid: SessionId,
        handle: &[u8],
        token: Option<Token>,
        offset: u64,
        data: &[u8],
    ) -> DmResult<usize> {
        let mut st = self.state.lock();
        st.check_token(sid, token)?;
        let file = st.file_mut(handle)?;
        let start = offset as usize;
        let end = start + data.len();
        if file.data.len() < end {
            file.data.resize(end, 0);
        }
        file.data[start..end].copy_from_slice(data);
        file.allocated = file.allocated.max(end as u64);
        Ok(data.len())
    }

    fn set_region(
        &self,
        sid: SessionId,
        handle: &[u8],
        token: Option<Token>,
        regions: &[Region],
    ) -> DmResult<bool> {
        let mut st = self.state.lock();
        st.check_token(sid, token)?;
        st.file_mut(handle)?.regions = regions.to_vec();
        Ok(true)
    }

    fn get_region(&self, sid: SessionId, handle: &[u8], buf: &mut [Region]) -> DmResult<usize> {
        let st = self.state.lock();
        st.check_token(sid, None)?;
        fill(&st.file(handle)?.regions, buf)
    }

    fn punch_hole(
        &self,
        sid: SessionId,
        handle: &[u8],
        token: Option<Token>,
        offset: u64,
        len: u64,
    ) -> DmResult<()> {
        let mut st = self.state.lock();
        st.check_token(sid, token)?;
        let file = st.file_mut(handle)?;
        let size = file.data.len() as u64;
        let start = offset.min(size);
        let end = if len == 0 { size } else { (offset + len).min(size) };
        file.data[start as usize..end as usize].fill(0);
        if end == size {
            file.allocated = file.allocated.min(start);
        }
        Ok(())
    }

    fn request_right(&self, sid: SessionId, handle: &[u8], token: Token, _right: Right) -> DmResult<()> {
        let mut st = self.state.lock();
        st.check_token(sid, Some(token))?;
        let (fsid, ino, _) = decode_file_handle(handle)?;
        st.file(handle)?;
        *st.held_rights.entry((fsid, ino)).or_insert(0) += 1;
        st.right_requests += 1;
        Ok(())
    }

    fn release_right(&self, sid: SessionId, handle: &[u8], token: Token) -> DmResult<()> {
        let mut st = self.state.lock();
        st.check_token(sid, Some(token))?;
        let (fsid, ino, _) = decode_file_handle(handle)?;
        match st.held_rights.get_mut(&(fsid, ino)) {
            Some(n) if *n > 0 => {
                *n -= 1;
                if *n == 0 {
                    st.held_rights.remove(&(fsid, ino));
                }
            }
            _ => return Err(DmError::Os(libc::EACCES)),
        }
        st.right_releases += 1;
        Ok(())
    }
}
