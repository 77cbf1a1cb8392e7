//! Kernel record layouts returned by libdm.
//!
//! Records arrive as raw bytes. Variable-length fields are `(offset, length)`
//! pairs relative to the record that holds them, and lists of records are
//! chained by a relative `link`, zero on the last record. Everything here is
//! bounds-checked against the buffer; a field pointing outside of it is a
//! protocol error.

use std::mem::size_of;
use std::os::raw::{c_int, c_uint};

use crate::dm::{
    DataEvent, Disposition, DmError, DmResult, EventMessage, EventPayload, EventSet, EventType,
    MountEvent, Token,
};

pub(crate) type DmEventset = u64;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DmVardata {
    pub vd_offset: c_int,
    pub vd_length: c_uint,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DmEventmsg {
    pub link: c_int,
    pub ev_type: c_int,
    pub ev_token: c_int,
    pub ev_sequence: c_int,
    pub ev_data: DmVardata,
}

/// Payload of a mount event. `dm_get_mountinfo` fills the same record.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DmMountEvent {
    pub me_mode: c_uint,
    pub me_handle1: DmVardata,
    pub me_handle2: DmVardata,
    pub me_name1: DmVardata,
    pub me_name2: DmVardata,
    pub me_roothandle: DmVardata,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DmDataEvent {
    pub de_handle: DmVardata,
    pub de_offset: i64,
    pub de_length: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DmDispinfo {
    pub link: c_int,
    pub di_pad1: c_uint,
    pub di_fshandle: DmVardata,
    pub di_eventset: DmEventset,
}

fn malformed() -> DmError {
    DmError::Os(libc::EPROTO)
}

/// Reads the fixed part of a `T` record starting at `offset`.
pub(crate) fn record<T: Copy>(buf: &[u8], offset: usize) -> DmResult<T> {
    let end = offset.checked_add(size_of::<T>()).ok_or_else(malformed)?;
    if end > buf.len() {
        return Err(malformed());
    }
    // SAFETY: offset..end lies inside buf. Callers only use the plain-data
    // repr(C) records of this module, valid for any bit pattern.
    Ok(unsafe { std::ptr::read_unaligned(buf.as_ptr().add(offset) as *const T) })
}

/// Copies the variable-length field `vd` of the record at `base`.
pub(crate) fn vardata(buf: &[u8], base: usize, vd: DmVardata) -> DmResult<Vec<u8>> {
    if vd.vd_length == 0 {
        return Ok(Vec::new());
    }
    let start = usize::try_from(vd.vd_offset)
        .ok()
        .and_then(|off| base.checked_add(off))
        .ok_or_else(malformed)?;
    let end = start
        .checked_add(vd.vd_length as usize)
        .ok_or_else(malformed)?;
    buf.get(start..end).map(<[u8]>::to_vec).ok_or_else(malformed)
}

pub(crate) fn text(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes)
        .trim_end_matches('\0')
        .to_string()
}

/// Decodes the mount record at `base`.
pub(crate) fn mount_event(buf: &[u8], base: usize) -> DmResult<MountEvent> {
    let me: DmMountEvent = record(buf, base)?;
    Ok(MountEvent {
        fs_handle: vardata(buf, base, me.me_handle1)?,
        root_handle: vardata(buf, base, me.me_roothandle)?,
        mount_point: text(vardata(buf, base, me.me_name1)?),
        device: text(vardata(buf, base, me.me_name2)?),
    })
}

/// Decodes the first event message of a `dm_get_events` buffer.
pub(crate) fn event_message(buf: &[u8]) -> DmResult<EventMessage> {
    let msg: DmEventmsg = record(buf, 0)?;
    let event = EventType::from_raw(msg.ev_type).ok_or_else(malformed)?;
    let data = usize::try_from(msg.ev_data.vd_offset).map_err(|_| malformed())?;

    let payload = match event {
        EventType::Mount => EventPayload::Mount(mount_event(buf, data)?),
        EventType::Read | EventType::Write | EventType::Truncate => {
            let de: DmDataEvent = record(buf, data)?;
            EventPayload::Data(DataEvent {
                handle: vardata(buf, data, de.de_handle)?,
                offset: de.de_offset,
                length: de.de_length,
            })
        }
        EventType::User => EventPayload::User(vardata(buf, 0, msg.ev_data)?),
        _ => EventPayload::Other,
    };

    Ok(EventMessage {
        event,
        token: Token(msg.ev_token),
        payload,
    })
}

/// Walks every disposition record in `buf`, following the `link` chain.
pub(crate) fn dispositions(buf: &[u8]) -> DmResult<Vec<Disposition>> {
    let mut out = Vec::new();
    if buf.is_empty() {
        return Ok(out);
    }

    let mut offset = 0usize;
    loop {
        let rec: DmDispinfo = record(buf, offset)?;
        out.push(Disposition {
            fs_handle: vardata(buf, offset, rec.di_fshandle)?,
            events: EventSet::from_bits_truncate(rec.di_eventset),
        });
        if rec.link <= 0 {
            return Ok(out);
        }
        offset = offset
            .checked_add(rec.link as usize)
            .ok_or_else(malformed)?;
    }
}
