//! libdm backend for XFS.
//!
//! Thin bindings to the X/Open DMAPI library shipped with xfsprogs-dmapi.
//! Every call is blocking. Variable-length kernel records are decoded into
//! the owned value types of [`crate::dm`]; handles returned by the library
//! are copied and released immediately unless the caller takes ownership via
//! [`DmApi::handle_free`].

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_uint, c_void};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use tracing::{debug, trace};

use crate::dm::{
    DispTarget, Disposition, DmApi, DmError, DmResult, DmStat, EventMessage, EventSet,
    EventType, MountInfo, Region, RegionFlags, Response, Right, SessionId, Token,
};
use crate::handle::FileIdentity;
use crate::layout::{self, DmEventset, DmVardata};

type DmSessid = c_int;
type DmToken = c_int;
type DmSize = u64;
type DmOff = i64;
type DmSsize = i64;

const DM_NO_SESSION: DmSessid = 0;
const DM_NO_TOKEN: DmToken = 0;
const DM_GLOBAL_HLEN: usize = 0;
const DM_SESSION_INFO_LEN: usize = 256;
const DM_ATTR_NAME_SIZE: usize = 8;

const DM_EV_WAIT: c_uint = 0x1;
const DM_RR_WAIT: c_uint = 0x1;
const DM_WRITE_SYNC: c_int = 0x1;
const DM_AT_STAT: c_uint = 0x80;
const DM_MSGTYPE_ASYNC: c_int = 2;

const DM_RESP_CONTINUE: c_int = 1;
const DM_RESP_ABORT: c_int = 2;

const DM_RIGHT_SHARED: c_int = 1;
const DM_RIGHT_EXCL: c_int = 2;

const INITIAL_EVENT_BUFFER: usize = 4096;
/// Bytes reserved per disposition record when sizing `dm_getall_disp` buffers.
/// The kernel may pack records tighter; the decoded count is checked separately.
const DISP_RECORD_BYTES: usize = 64;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct DmRegion {
    rg_offset: DmOff,
    rg_size: DmSize,
    rg_flags: c_uint,
    rg_opaque: c_uint,
}

#[repr(C)]
struct DmStatRaw {
    link: c_int,
    dt_handle: DmVardata,
    dt_compname: DmVardata,
    dt_nevents: c_int,
    dt_emask: DmEventset,
    dt_pers: c_int,
    dt_pmanreg: c_int,
    dt_dtime: libc::time_t,
    dt_change: c_uint,
    dt_dev: libc::dev_t,
    dt_ino: libc::ino_t,
    dt_mode: libc::mode_t,
    dt_nlink: libc::nlink_t,
    dt_uid: libc::uid_t,
    dt_gid: libc::gid_t,
    dt_rdev: libc::dev_t,
    dt_size: DmOff,
    dt_atime: libc::time_t,
    dt_mtime: libc::time_t,
    dt_ctime: libc::time_t,
    dt_blksize: c_uint,
    dt_blocks: DmSize,
    dt_pad: [u64; 4],
}

#[repr(C)]
struct DmAttrname {
    an_chars: [u8; DM_ATTR_NAME_SIZE],
}

#[link(name = "dm")]
extern "C" {
    fn dm_init_service(versionstrpp: *mut *mut c_char) -> c_int;
    fn dm_getall_sessions(nelem: c_uint, sidp: *mut DmSessid, nelemp: *mut c_uint) -> c_int;
    fn dm_query_session(
        sid: DmSessid,
        buflen: usize,
        bufp: *mut c_void,
        rlenp: *mut usize,
    ) -> c_int;
    fn dm_getall_tokens(
        sid: DmSessid,
        nelem: c_uint,
        tokenp: *mut DmToken,
        nelemp: *mut c_uint,
    ) -> c_int;
    fn dm_create_session(oldsid: DmSessid, sessinfop: *mut c_char, newsidp: *mut DmSessid)
        -> c_int;
    fn dm_destroy_session(sid: DmSessid) -> c_int;
    fn dm_create_userevent(
        sid: DmSessid,
        msglen: usize,
        msgdatap: *mut c_void,
        tokenp: *mut DmToken,
    ) -> c_int;
    fn dm_send_msg(targetsid: DmSessid, msgtype: c_int, buflen: usize, bufp: *mut c_void)
        -> c_int;
    fn dm_respond_event(
        sid: DmSessid,
        token: DmToken,
        response: c_int,
        reterror: c_int,
        buflen: usize,
        respbufp: *mut c_void,
    ) -> c_int;
    fn dm_get_events(
        sid: DmSessid,
        maxmsgs: c_uint,
        flags: c_uint,
        buflen: usize,
        bufp: *mut c_void,
        rlenp: *mut usize,
    ) -> c_int;
    fn dm_getall_disp(sid: DmSessid, buflen: usize, bufp: *mut c_void, rlenp: *mut usize)
        -> c_int;
    fn dm_set_disp(
        sid: DmSessid,
        hanp: *mut c_void,
        hlen: usize,
        token: DmToken,
        eventsetp: *mut DmEventset,
        maxevent: c_uint,
    ) -> c_int;
    fn dm_get_mountinfo(
        sid: DmSessid,
        hanp: *mut c_void,
        hlen: usize,
        token: DmToken,
        buflen: usize,
        bufp: *mut c_void,
        rlenp: *mut usize,
    ) -> c_int;
    fn dm_handle_is_valid(hanp: *mut c_void, hlen: usize) -> c_int;
    fn dm_path_to_handle(path: *mut c_char, hanpp: *mut *mut c_void, hlenp: *mut usize)
        -> c_int;
    fn dm_make_handle(
        fsidp: *mut u64,
        inop: *mut u64,
        igenp: *mut u32,
        hanpp: *mut *mut c_void,
        hlenp: *mut usize,
    ) -> c_int;
    fn dm_handle_to_fshandle(
        hanp: *mut c_void,
        hlen: usize,
        fshanpp: *mut *mut c_void,
        fshlenp: *mut usize,
    ) -> c_int;
    fn dm_handle_to_fsid(hanp: *mut c_void, hlen: usize, fsidp: *mut u64) -> c_int;
    fn dm_handle_to_ino(hanp: *mut c_void, hlen: usize, inop: *mut u64) -> c_int;
    fn dm_handle_to_igen(hanp: *mut c_void, hlen: usize, igenp: *mut u32) -> c_int;
    fn dm_handle_free(hanp: *mut c_void, hlen: usize);
    fn dm_get_dmattr(
        sid: DmSessid,
        hanp: *mut c_void,
        hlen: usize,
        token: DmToken,
        attrnamep: *mut DmAttrname,
        buflen: usize,
        bufp: *mut c_void,
        rlenp: *mut usize,
    ) -> c_int;
    fn dm_set_dmattr(
        sid: DmSessid,
        hanp: *mut c_void,
        hlen: usize,
        token: DmToken,
        attrnamep: *mut DmAttrname,
        setdtime: c_int,
        buflen: usize,
        bufp: *mut c_void,
    ) -> c_int;
    fn dm_remove_dmattr(
        sid: DmSessid,
        hanp: *mut c_void,
        hlen: usize,
        token: DmToken,
        setdtime: c_int,
        attrnamep: *mut DmAttrname,
    ) -> c_int;
    fn dm_get_fileattr(
        sid: DmSessid,
        hanp: *mut c_void,
        hlen: usize,
        token: DmToken,
        mask: c_uint,
        statp: *mut DmStatRaw,
    ) -> c_int;
    fn dm_read_invis(
        sid: DmSessid,
        hanp: *mut c_void,
        hlen: usize,
        token: DmToken,
        off: DmOff,
        len: DmSize,
        bufp: *mut c_void,
    ) -> DmSsize;
    fn dm_write_invis(
        sid: DmSessid,
        hanp: *mut c_void,
        hlen: usize,
        token: DmToken,
        flags: c_int,
        off: DmOff,
        len: DmSize,
        bufp: *mut c_void,
    ) -> DmSsize;
    fn dm_set_region(
        sid: DmSessid,
        hanp: *mut c_void,
        hlen: usize,
        token: DmToken,
        nelem: c_uint,
        regbufp: *mut DmRegion,
        exactflagp: *mut c_uint,
    ) -> c_int;
    fn dm_get_region(
        sid: DmSessid,
        hanp: *mut c_void,
        hlen: usize,
        token: DmToken,
        nelem: c_uint,
        regbufp: *mut DmRegion,
        nelemp: *mut c_uint,
    ) -> c_int;
    fn dm_punch_hole(
        sid: DmSessid,
        hanp: *mut c_void,
        hlen: usize,
        token: DmToken,
        off: DmOff,
        len: DmSize,
    ) -> c_int;
    fn dm_request_right(
        sid: DmSessid,
        hanp: *mut c_void,
        hlen: usize,
        token: DmToken,
        flags: c_uint,
        right: c_int,
    ) -> c_int;
    fn dm_release_right(sid: DmSessid, hanp: *mut c_void, hlen: usize, token: DmToken) -> c_int;
}

fn last_errno() -> c_int {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

fn check(rc: c_int) -> DmResult<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(DmError::from_errno(last_errno()))
    }
}

/// Like [`check`], reporting `E2BIG` as [`DmError::TooSmall`] with `required`.
fn check_sized(rc: c_int, required: usize) -> DmResult<()> {
    if rc == 0 {
        return Ok(());
    }
    match last_errno() {
        libc::E2BIG => Err(DmError::TooSmall { required }),
        errno => Err(DmError::from_errno(errno)),
    }
}

fn token_raw(token: Option<Token>) -> DmToken {
    token.map(|t| t.0).unwrap_or(DM_NO_TOKEN)
}

fn hanp(handle: &[u8]) -> *mut c_void {
    handle.as_ptr() as *mut c_void
}

fn attr_name(name: &str) -> DmAttrname {
    let mut an = DmAttrname {
        an_chars: [0; DM_ATTR_NAME_SIZE],
    };
    let bytes = name.as_bytes();
    let n = bytes.len().min(DM_ATTR_NAME_SIZE);
    an.an_chars[..n].copy_from_slice(&bytes[..n]);
    an
}

fn c_string(bytes: &[u8]) -> DmResult<CString> {
    CString::new(bytes).map_err(|_| DmError::Os(libc::EINVAL))
}

/// Takes a copy of a library-allocated handle and frees the original.
///
/// # Safety
/// `ptr`/`len` must come from a successful libdm handle call.
unsafe fn adopt_handle(ptr: *mut c_void, len: usize) -> Vec<u8> {
    let bytes = std::slice::from_raw_parts(ptr as *const u8, len).to_vec();
    dm_handle_free(ptr, len);
    bytes
}

/// The XFS DMAPI through libdm.
#[derive(Debug, Default)]
pub struct LibDm;

impl LibDm {
    pub fn new() -> Self {
        LibDm
    }

    fn decode_event(buf: &[u8]) -> DmResult<EventMessage> {
        layout::event_message(buf)
    }
}

impl DmApi for LibDm {
    fn init_service(&self) -> DmResult<String> {
        let mut version: *mut c_char = ptr::null_mut();
        // SAFETY: libdm stores a pointer to a static version string.
        check(unsafe { dm_init_service(&mut version) })?;
        if version.is_null() {
            return Ok(String::new());
        }
        // SAFETY: non-null pointer to a NUL-terminated static string.
        Ok(unsafe { CStr::from_ptr(version) }.to_string_lossy().into_owned())
    }

    fn getall_sessions(&self, buf: &mut [SessionId]) -> DmResult<usize> {
        let mut raw = vec![0 as DmSessid; buf.len()];
        let mut n: c_uint = 0;
        // SAFETY: raw has room for raw.len() session ids.
        let rc = unsafe { dm_getall_sessions(raw.len() as c_uint, raw.as_mut_ptr(), &mut n) };
        check_sized(rc, n as usize)?;
        let n = (n as usize).min(buf.len());
        for (dst, src) in buf.iter_mut().zip(&raw[..n]) {
            *dst = SessionId(*src);
        }
        Ok(n)
    }

    fn query_session(&self, sid: SessionId) -> DmResult<String> {
        let mut buf = vec![0u8; DM_SESSION_INFO_LEN];
        let mut rlen: usize = 0;
        // SAFETY: buf is valid for buf.len() bytes.
        check(unsafe {
            dm_query_session(sid.0, buf.len(), buf.as_mut_ptr() as *mut c_void, &mut rlen)
        })?;
        buf.truncate(rlen.min(DM_SESSION_INFO_LEN));
        Ok(layout::text(buf))
    }

    fn getall_tokens(&self, sid: SessionId, buf: &mut [Token]) -> DmResult<usize> {
        let mut raw = vec![0 as DmToken; buf.len()];
        let mut n: c_uint = 0;
        // SAFETY: raw has room for raw.len() tokens.
        let rc = unsafe { dm_getall_tokens(sid.0, raw.len() as c_uint, raw.as_mut_ptr(), &mut n) };
        check_sized(rc, n as usize)?;
        let n = (n as usize).min(buf.len());
        for (dst, src) in buf.iter_mut().zip(&raw[..n]) {
            *dst = Token(*src);
        }
        Ok(n)
    }

    fn create_session(&self, old: Option<SessionId>, name: &str) -> DmResult<SessionId> {
        let info = c_string(name.as_bytes())?;
        let mut sid: DmSessid = DM_NO_SESSION;
        let old = old.map(|s| s.0).unwrap_or(DM_NO_SESSION);
        // SAFETY: info is NUL-terminated and outlives the call.
        check(unsafe { dm_create_session(old, info.as_ptr() as *mut c_char, &mut sid) })?;
        debug!(sid, "libdm session created");
        Ok(SessionId(sid))
    }

    fn destroy_session(&self, sid: SessionId) -> DmResult<()> {
        // SAFETY: plain value call.
        check(unsafe { dm_destroy_session(sid.0) })
    }

    fn create_userevent(&self, sid: SessionId, msg: &[u8]) -> DmResult<Token> {
        let mut token: DmToken = DM_NO_TOKEN;
        // SAFETY: msg is valid for msg.len() bytes and only read.
        check(unsafe {
            dm_create_userevent(sid.0, msg.len(), msg.as_ptr() as *mut c_void, &mut token)
        })?;
        Ok(Token(token))
    }

    fn send_msg(&self, sid: SessionId, msg: &[u8]) -> DmResult<()> {
        // SAFETY: msg is valid for msg.len() bytes and only read.
        check(unsafe {
            dm_send_msg(sid.0, DM_MSGTYPE_ASYNC, msg.len(), msg.as_ptr() as *mut c_void)
        })
    }

    fn respond_event(&self, sid: SessionId, token: Token, response: Response) -> DmResult<()> {
        let (resp, reterror) = match response {
            Response::Continue => (DM_RESP_CONTINUE, 0),
            Response::Abort(errno) => (DM_RESP_ABORT, errno),
        };
        // SAFETY: no response buffer is passed.
        check(unsafe { dm_respond_event(sid.0, token.0, resp, reterror, 0, ptr::null_mut()) })
    }

    fn get_events(&self, sid: SessionId) -> DmResult<EventMessage> {
        let mut buf = vec![0u8; INITIAL_EVENT_BUFFER];
        loop {
            let mut rlen: usize = 0;
            // SAFETY: buf is valid for buf.len() bytes.
            let rc = unsafe {
                dm_get_events(
                    sid.0,
                    1,
                    DM_EV_WAIT,
                    buf.len(),
                    buf.as_mut_ptr() as *mut c_void,
                    &mut rlen,
                )
            };
            match check_sized(rc, rlen) {
                Ok(()) => {
                    buf.truncate(rlen.min(buf.len()));
                    trace!(bytes = buf.len(), "event retrieved");
                    return Self::decode_event(&buf);
                }
                Err(DmError::TooSmall { required }) if required > buf.len() => {
                    buf.resize(required, 0);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn getall_disp(&self, sid: SessionId, buf: &mut [Disposition]) -> DmResult<usize> {
        let mut raw = vec![0u8; buf.len().max(1) * DISP_RECORD_BYTES];
        let mut rlen: usize = 0;
        // SAFETY: raw is valid for raw.len() bytes.
        let rc = unsafe {
            dm_getall_disp(sid.0, raw.len(), raw.as_mut_ptr() as *mut c_void, &mut rlen)
        };
        check_sized(rc, rlen.div_ceil(DISP_RECORD_BYTES))?;

        let records = layout::dispositions(&raw[..rlen.min(raw.len())])?;
        if records.len() > buf.len() {
            debug!(records = records.len(), capacity = buf.len(), "more dispositions than slots");
            return Err(DmError::TooSmall {
                required: records.len(),
            });
        }
        let n = records.len();
        for (slot, mut disp) in buf.iter_mut().zip(records) {
            // SAFETY: the handle bytes are owned and only read.
            if unsafe { dm_handle_is_valid(hanp(&disp.fs_handle), disp.fs_handle.len()) } == 0 {
                disp.fs_handle.clear();
            }
            *slot = disp;
        }
        Ok(n)
    }

    fn set_disp(&self, sid: SessionId, target: DispTarget<'_>, events: EventSet) -> DmResult<()> {
        let mut set: DmEventset = events.bits();
        let (hp, hlen) = match target {
            DispTarget::Global => (usize::MAX as *mut c_void, DM_GLOBAL_HLEN),
            DispTarget::Filesystem(handle) => (hanp(handle), handle.len()),
        };
        // SAFETY: hp/hlen name a valid handle or the global sentinel.
        check(unsafe { dm_set_disp(sid.0, hp, hlen, DM_NO_TOKEN, &mut set, EventType::MAX) })
    }

    fn get_mountinfo(&self, sid: SessionId, fs_handle: &[u8], buf_len: usize) -> DmResult<MountInfo> {
        let mut raw = vec![0u8; buf_len.max(std::mem::size_of::<layout::DmMountEvent>())];
        let mut rlen: usize = 0;
        // SAFETY: raw is valid for raw.len() bytes.
        let rc = unsafe {
            dm_get_mountinfo(
                sid.0,
                hanp(fs_handle),
                fs_handle.len(),
                DM_NO_TOKEN,
                raw.len(),
                raw.as_mut_ptr() as *mut c_void,
                &mut rlen,
            )
        };
        check_sized(rc, rlen)?;
        let me = layout::mount_event(&raw[..rlen.min(raw.len())], 0)?;
        Ok(MountInfo {
            fs_handle: me.fs_handle,
            root_handle: me.root_handle,
            mount_point: me.mount_point,
            device: me.device,
        })
    }

    fn path_to_handle(&self, path: &Path) -> DmResult<Vec<u8>> {
        let cpath = c_string(path.as_os_str().as_bytes())?;
        let mut hp: *mut c_void = ptr::null_mut();
        let mut hlen: usize = 0;
        // SAFETY: cpath is NUL-terminated; libdm allocates the handle.
        check(unsafe { dm_path_to_handle(cpath.as_ptr() as *mut c_char, &mut hp, &mut hlen) })?;
        // SAFETY: hp/hlen come from a successful call.
        Ok(unsafe { adopt_handle(hp, hlen) })
    }

    fn make_handle(&self, fsid: u64, ino: u64, igen: u32) -> DmResult<Vec<u8>> {
        let (mut fsid, mut ino, mut igen) = (fsid, ino, igen);
        let mut hp: *mut c_void = ptr::null_mut();
        let mut hlen: usize = 0;
        // SAFETY: all pointers refer to live locals.
        check(unsafe { dm_make_handle(&mut fsid, &mut ino, &mut igen, &mut hp, &mut hlen) })?;
        // SAFETY: hp/hlen come from a successful call.
        Ok(unsafe { adopt_handle(hp, hlen) })
    }

    fn handle_to_fshandle(&self, handle: &[u8]) -> DmResult<Vec<u8>> {
        let mut hp: *mut c_void = ptr::null_mut();
        let mut hlen: usize = 0;
        // SAFETY: handle is only read.
        check(unsafe { dm_handle_to_fshandle(hanp(handle), handle.len(), &mut hp, &mut hlen) })?;
        // SAFETY: hp/hlen come from a successful call.
        Ok(unsafe { adopt_handle(hp, hlen) })
    }

    fn handle_to_identity(&self, handle: &[u8]) -> DmResult<FileIdentity> {
        let (mut fsid, mut ino, mut igen) = (0u64, 0u64, 0u32);
        // SAFETY: handle is only read; outputs are live locals.
        unsafe {
            check(dm_handle_to_fsid(hanp(handle), handle.len(), &mut fsid))?;
            check(dm_handle_to_igen(hanp(handle), handle.len(), &mut igen))?;
            check(dm_handle_to_ino(hanp(handle), handle.len(), &mut ino))?;
        }
        Ok(FileIdentity::new(0, fsid, igen, ino))
    }

    fn handle_free(&self, _handle: &[u8]) {
        // Handles are copied out of libdm and released on receipt.
    }

    fn get_dmattr(
        &self,
        sid: SessionId,
        handle: &[u8],
        token: Option<Token>,
        name: &str,
    ) -> DmResult<Vec<u8>> {
        let mut an = attr_name(name);
        let mut buf = vec![0u8; 64];
        loop {
            let mut rlen: usize = 0;
            // SAFETY: buf is valid for buf.len() bytes.
            let rc = unsafe {
                dm_get_dmattr(
                    sid.0,
                    hanp(handle),
                    handle.len(),
                    token_raw(token),
                    &mut an,
                    buf.len(),
                    buf.as_mut_ptr() as *mut c_void,
                    &mut rlen,
                )
            };
            match check_sized(rc, rlen) {
                Ok(()) => {
                    buf.truncate(rlen);
                    return Ok(buf);
                }
                Err(DmError::TooSmall { required }) if required > buf.len() => {
                    buf.resize(required, 0)
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn set_dmattr(
        &self,
        sid: SessionId,
        handle: &[u8],
        token: Option<Token>,
        name: &str,
        value: &[u8],
    ) -> DmResult<()> {
        let mut an = attr_name(name);
        // SAFETY: value is only read.
        check(unsafe {
            dm_set_dmattr(
                sid.0,
                hanp(handle),
                handle.len(),
                token_raw(token),
                &mut an,
                0,
                value.len(),
                value.as_ptr() as *mut c_void,
            )
        })
    }

    fn remove_dmattr(
        &self,
        sid: SessionId,
        handle: &[u8],
        token: Option<Token>,
        name: &str,
    ) -> DmResult<()> {
        let mut an = attr_name(name);
        // SAFETY: handle is only read.
        check(unsafe {
            dm_remove_dmattr(sid.0, hanp(handle), handle.len(), token_raw(token), 0, &mut an)
        })
    }

    fn get_fileattr(&self, sid: SessionId, handle: &[u8]) -> DmResult<DmStat> {
        // SAFETY: DmStatRaw is plain old data; all-zero is a valid value.
        let mut raw: DmStatRaw = unsafe { std::mem::zeroed() };
        // SAFETY: raw is a live, properly sized output record.
        check(unsafe {
            dm_get_fileattr(
                sid.0,
                hanp(handle),
                handle.len(),
                DM_NO_TOKEN,
                DM_AT_STAT,
                &mut raw,
            )
        })?;
        Ok(DmStat {
            dev: raw.dt_dev as u64,
            ino: raw.dt_ino as u64,
            mode: raw.dt_mode as u32,
            nlink: raw.dt_nlink as u32,
            uid: raw.dt_uid,
            gid: raw.dt_gid,
            rdev: raw.dt_rdev as u64,
            size: raw.dt_size,
            blksize: raw.dt_blksize,
            blocks: raw.dt_blocks,
            atime: raw.dt_atime as i64,
            mtime: raw.dt_mtime as i64,
            ctime: raw.dt_ctime as i64,
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
        // SAFETY: buf is valid for buf.len() bytes.
        let n = unsafe {
            dm_read_invis(
                sid.0,
                hanp(handle),
                handle.len(),
                token_raw(token),
                offset as DmOff,
                buf.len() as DmSize,
                buf.as_mut_ptr() as *mut c_void,
            )
        };
        if n < 0 {
            return Err(DmError::from_errno(last_errno()));
        }
        Ok(n as usize)
    }

    fn write_invis(
        &self,
        sid: SessionId,
        handle: &[u8],
        token: Option<Token>,
        offset: u64,
        data: &[u8],
    ) -> DmResult<usize> {
        // SAFETY: data is only read.
        let n = unsafe {
            dm_write_invis(
                sid.0,
                hanp(handle),
                handle.len(),
                token_raw(token),
                DM_WRITE_SYNC,
                offset as DmOff,
                data.len() as DmSize,
                data.as_ptr() as *mut c_void,
            )
        };
        if n < 0 {
            return Err(DmError::from_errno(last_errno()));
        }
        Ok(n as usize)
    }

    fn set_region(
        &self,
        sid: SessionId,
        handle: &[u8],
        token: Option<Token>,
        regions: &[Region],
    ) -> DmResult<bool> {
        let mut raw: Vec<DmRegion> = regions
            .iter()
            .map(|r| DmRegion {
                rg_offset: r.offset,
                rg_size: r.size,
                rg_flags: r.flags.bits(),
                rg_opaque: 0,
            })
            .collect();
        let regbufp = if raw.is_empty() {
            ptr::null_mut()
        } else {
            raw.as_mut_ptr()
        };
        let mut exact: c_uint = 0;
        // SAFETY: regbufp is null or valid for raw.len() regions.
        check(unsafe {
            dm_set_region(
                sid.0,
                hanp(handle),
                handle.len(),
                token_raw(token),
                raw.len() as c_uint,
                regbufp,
                &mut exact,
            )
        })?;
        Ok(exact != 0)
    }

    fn get_region(&self, sid: SessionId, handle: &[u8], buf: &mut [Region]) -> DmResult<usize> {
        let mut raw = vec![DmRegion::default(); buf.len()];
        let mut n: c_uint = 0;
        // SAFETY: raw is valid for raw.len() regions.
        let rc = unsafe {
            dm_get_region(
                sid.0,
                hanp(handle),
                handle.len(),
                DM_NO_TOKEN,
                raw.len() as c_uint,
                raw.as_mut_ptr(),
                &mut n,
            )
        };
        check_sized(rc, n as usize)?;
        let n = (n as usize).min(buf.len());
        for (dst, src) in buf.iter_mut().zip(&raw[..n]) {
            *dst = Region {
                offset: src.rg_offset,
                size: src.rg_size,
                flags: RegionFlags::from_bits_retain(src.rg_flags),
            };
        }
        Ok(n)
    }

    fn punch_hole(
        &self,
        sid: SessionId,
        handle: &[u8],
        token: Option<Token>,
        offset: u64,
        len: u64,
    ) -> DmResult<()> {
        // SAFETY: handle is only read.
        check(unsafe {
            dm_punch_hole(
                sid.0,
                hanp(handle),
                handle.len(),
                token_raw(token),
                offset as DmOff,
                len,
            )
        })
    }

    fn request_right(&self, sid: SessionId, handle: &[u8], token: Token, right: Right) -> DmResult<()> {
        let right = match right {
            Right::Shared => DM_RIGHT_SHARED,
            Right::Exclusive => DM_RIGHT_EXCL,
        };
        // SAFETY: handle is only read.
        check(unsafe {
            dm_request_right(sid.0, hanp(handle), handle.len(), token.0, DM_RR_WAIT, right)
        })
    }

    fn release_right(&self, sid: SessionId, handle: &[u8], token: Token) -> DmResult<()> {
        // SAFETY: handle is only read.
        check(unsafe { dm_release_right(sid.0, hanp(handle), handle.len(), token.0) })
    }
}
