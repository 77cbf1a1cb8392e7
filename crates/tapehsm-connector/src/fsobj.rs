//! File objects and the migration state machine.
//!
//! A [`FileObject`] wraps one kernel handle. Handles resolved from a path or
//! rebuilt from a [`FileIdentity`] are owned and released when the object is
//! dropped; handles taken from an event payload are borrowed for the lifetime
//! of the event.
//!
//! The migration state of a regular file is encoded by its migration record
//! and a single whole-file managed region:
//!
//! | state       | record              | region flags            |
//! |-------------|---------------------|-------------------------|
//! | resident    | absent or no copies | none                    |
//! | premigrated | copies              | write, truncate         |
//! | migrated    | copies              | read, write, truncate   |
//!
//! Every attribute and region mutation runs under the session's identity
//! lock. Nested locking from the same thread is free, so callers may hold the
//! lock across a whole transition with [`FileObject::lock`].

use std::fmt;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace};

use crate::attr::{FsAttr, MigrationAttr, FS_ATTR_NAME, MIG_ATTR_NAME};
use crate::buffer::collect_with_growth;
use crate::dm::{DispTarget, DmApi, DmError, DmStat, EventSet, Region, RegionFlags};
use crate::error::{ConnectorError, Result};
use crate::handle::{FileIdentity, Handle, OwnedHandle};
use crate::session::Session;

/// Migration state of a regular file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    Resident,
    Premigrated,
    Migrated,
}

impl MigrationState {
    /// Single-letter code used in client listings.
    pub fn code(&self) -> char {
        match self {
            MigrationState::Resident => 'r',
            MigrationState::Premigrated => 'p',
            MigrationState::Migrated => 'm',
        }
    }

    /// Region flags that encode this state; empty for resident files.
    pub fn region_flags(&self) -> RegionFlags {
        match self {
            MigrationState::Resident => RegionFlags::empty(),
            MigrationState::Premigrated => RegionFlags::WRITE | RegionFlags::TRUNCATE,
            MigrationState::Migrated => {
                RegionFlags::READ | RegionFlags::WRITE | RegionFlags::TRUNCATE
            }
        }
    }

    /// Decodes the installed region table.
    pub fn from_regions(regions: &[Region]) -> std::result::Result<Self, String> {
        match regions {
            [] => Ok(MigrationState::Resident),
            [region] if !region.is_whole_file() => Err(format!(
                "partial region at offset {} size {}",
                region.offset, region.size
            )),
            [region] => [MigrationState::Premigrated, MigrationState::Migrated]
                .into_iter()
                .find(|s| s.region_flags() == region.flags)
                .ok_or_else(|| format!("unexpected region flags {:#x}", region.flags.bits())),
            more => Err(format!("{} regions installed", more.len())),
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationState::Resident => "resident",
            MigrationState::Premigrated => "premigrated",
            MigrationState::Migrated => "migrated",
        };
        f.write_str(name)
    }
}

/// A filesystem object addressed through a kernel handle.
pub struct FileObject<'h> {
    session: Arc<Session>,
    handle: Handle<'h>,
}

impl FileObject<'static> {
    /// Resolves `path` to an owned handle.
    pub fn from_path(session: Arc<Session>, path: &Path) -> Result<Self> {
        let bytes = session
            .dm()
            .path_to_handle(path)
            .map_err(|e| ConnectorError::dm("dm_path_to_handle", e))?;
        let handle = Handle::Owned(OwnedHandle::new(session.dm().clone(), bytes));
        Ok(Self { session, handle })
    }

    /// Rebuilds an owned handle from a file identity.
    ///
    /// Only `fsid_low` goes into the handle; XFS handles have no room for
    /// `fsid_high`, so identities differing only there address the same file.
    pub fn from_identity(session: Arc<Session>, fuid: FileIdentity) -> Result<Self> {
        let bytes = session
            .dm()
            .make_handle(fuid.fsid_low, fuid.inum, fuid.igen)
            .map_err(|e| ConnectorError::dm("dm_make_handle", e))?;
        let handle = Handle::Owned(OwnedHandle::new(session.dm().clone(), bytes));
        Ok(Self { session, handle })
    }
}

impl<'h> FileObject<'h> {
    /// Wraps a handle owned by someone else, typically an event payload.
    pub fn borrowed(session: Arc<Session>, handle: &'h [u8]) -> Self {
        Self {
            session,
            handle: Handle::Borrowed(handle),
        }
    }

    pub fn handle(&self) -> &[u8] {
        self.handle.as_bytes()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn dm(&self) -> &dyn DmApi {
        self.session.dm().as_ref()
    }

    /// Identity of the object; all zeros when there is no handle.
    pub fn identity(&self) -> Result<FileIdentity> {
        if self.handle.is_empty() {
            return Ok(FileIdentity::default());
        }
        self.dm()
            .handle_to_identity(self.handle())
            .map_err(|e| ConnectorError::dm("dm_handle_to_identity", e))
    }

    /// Takes the identity lock until the returned guard is released or dropped.
    pub fn lock(&self) -> Result<FileLock<'_, 'h>> {
        let fuid = self.identity()?;
        self.session.lock_identity(fuid, self.handle())?;
        Ok(FileLock {
            object: self,
            fuid,
            released: false,
            _not_send: PhantomData,
        })
    }

    fn with_lock<T>(&self, op: impl FnOnce(FileIdentity) -> Result<T>) -> Result<T> {
        let guard = self.lock()?;
        let out = op(guard.fuid);
        let released = guard.release();
        match (out, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(r)) => {
                error!("unlock after failed operation also failed: {}", r);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    fn get_attr(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match self.dm().get_dmattr(self.session.sid(), self.handle(), None, name) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(DmError::NotFound) => Ok(None),
            Err(e) => Err(ConnectorError::dm("dm_get_dmattr", e)),
        }
    }

    fn set_attr(&self, name: &str, value: &[u8]) -> Result<()> {
        self.dm()
            .set_dmattr(
                self.session.sid(),
                self.handle(),
                Some(self.session.reserved_token()),
                name,
                value,
            )
            .map_err(|e| ConnectorError::dm("dm_set_dmattr", e))
    }

    fn set_regions(&self, regions: &[Region]) -> Result<()> {
        self.with_lock(|fuid| {
            debug!(%fuid, ?regions, "set region");
            self.dm()
                .set_region(
                    self.session.sid(),
                    self.handle(),
                    Some(self.session.reserved_token()),
                    regions,
                )
                .map(|_| ())
                .map_err(|e| ConnectorError::dm("dm_set_region", e))
        })
    }

    pub fn is_filesystem_managed(&self) -> Result<bool> {
        match self.get_attr(FS_ATTR_NAME)? {
            Some(bytes) => Ok(FsAttr::decode(&bytes)?.managed),
            None => Ok(false),
        }
    }

    fn store_managed(&self, managed: bool) -> Result<()> {
        let value = FsAttr { managed }.encode()?;
        self.with_lock(|_| self.set_attr(FS_ATTR_NAME, &value))
    }

    /// Persists the managed flag on a filesystem root and, with `set_dispo`,
    /// installs the data-event disposition on its filesystem. A failed
    /// disposition rolls the flag back before the error is returned.
    pub fn mark_filesystem_managed(&self, set_dispo: bool) -> Result<()> {
        self.store_managed(true).map_err(|e| ConnectorError::FsAdd {
            reason: format!("setting managed flag: {}", e),
        })?;

        if !set_dispo {
            return Ok(());
        }

        if let Err(e) = self.install_fs_disposition() {
            if let Err(r) = self.store_managed(false) {
                error!("rolling back managed flag failed: {}", r);
                return Err(ConnectorError::FsAdd {
                    reason: format!("{}; rollback failed: {}", e, r),
                });
            }
            return Err(ConnectorError::FsAdd {
                reason: e.to_string(),
            });
        }

        info!(fuid = %self.identity()?, "filesystem managed");
        Ok(())
    }

    /// Clears the managed flag.
    pub fn clear_filesystem_managed(&self) -> Result<()> {
        self.store_managed(false)
    }

    fn install_fs_disposition(&self) -> Result<()> {
        let fs_handle = self
            .dm()
            .handle_to_fshandle(self.handle())
            .map_err(|e| ConnectorError::dm("dm_handle_to_fshandle", e))?;
        let fs_handle = OwnedHandle::new(self.session.dm().clone(), fs_handle);
        self.dm()
            .set_disp(
                self.session.sid(),
                DispTarget::Filesystem(fs_handle.as_bytes()),
                EventSet::data_events(),
            )
            .map_err(|e| ConnectorError::dm("dm_set_disp", e))
    }

    /// Stat data; zeroed for an object without a handle.
    pub fn stat(&self) -> Result<DmStat> {
        if self.handle.is_empty() {
            return Ok(DmStat::default());
        }
        self.dm()
            .get_fileattr(self.session.sid(), self.handle())
            .map_err(|e| ConnectorError::dm("dm_get_fileattr", e))
    }

    /// Reads without generating events or touching access times.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let n = self
            .dm()
            .read_invis(
                self.session.sid(),
                self.handle(),
                Some(self.session.reserved_token()),
                offset,
                buf,
            )
            .map_err(|e| ConnectorError::dm("dm_read_invis", e))?;
        trace!(offset, size = buf.len(), read = n, "invisible read");
        Ok(n)
    }

    /// Writes synchronously without generating events or touching times.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let n = self
            .dm()
            .write_invis(
                self.session.sid(),
                self.handle(),
                Some(self.session.reserved_token()),
                offset,
                data,
            )
            .map_err(|e| ConnectorError::dm("dm_write_invis", e))?;
        trace!(offset, size = data.len(), written = n, "invisible write");
        Ok(n)
    }

    /// The migration record, or the not-migrated record when none is stored.
    pub fn attribute(&self) -> Result<MigrationAttr> {
        match self.get_attr(MIG_ATTR_NAME)? {
            Some(bytes) => {
                let fuid = self.identity()?;
                MigrationAttr::decode(fuid, &bytes).map_err(|e| {
                    error!(%fuid, "unreadable migration record: {}", e);
                    e
                })
            }
            None => Ok(MigrationAttr::not_migrated()),
        }
    }

    /// Appends a tape copy to the migration record and returns the new record.
    pub fn append_tape_copy(&self, tape_id: &str, start_block: u64) -> Result<MigrationAttr> {
        self.with_lock(|fuid| {
            let mut attr = self.attribute()?;
            attr.append_copy(fuid, tape_id, start_block)?;
            self.set_attr(MIG_ATTR_NAME, &attr.encode()?)?;
            info!(%fuid, tape_id, start_block, copies = attr.copy_count(), "tape copy added");
            Ok(attr)
        })
    }

    /// Removes the migration record. Returns false when there was none.
    pub fn remove_attribute(&self) -> Result<bool> {
        self.with_lock(|fuid| {
            match self.dm().remove_dmattr(
                self.session.sid(),
                self.handle(),
                Some(self.session.reserved_token()),
                MIG_ATTR_NAME,
            ) {
                Ok(()) => {
                    debug!(%fuid, "migration record removed");
                    Ok(true)
                }
                Err(DmError::NotFound) => Ok(false),
                Err(e) => Err(ConnectorError::dm("dm_remove_dmattr", e)),
            }
        })
    }

    /// Current migration state.
    pub fn migration_state(&self) -> Result<MigrationState> {
        if self.attribute()?.is_resident() {
            return Ok(MigrationState::Resident);
        }

        let regions = collect_with_growth(self.session.config().region_buffer, |buf| {
            self.dm().get_region(self.session.sid(), self.handle(), buf)
        })
        .map_err(|e| ConnectorError::dm("dm_get_region", e))?;

        for (i, region) in regions.iter().enumerate() {
            trace!(
                region = i,
                offset = region.offset,
                size = region.size,
                flags = region.flags.bits(),
                "installed region"
            );
        }

        MigrationState::from_regions(&regions).map_err(|reason| {
            let fuid = self.identity().unwrap_or_default();
            error!(%fuid, "{}", reason);
            ConnectorError::Consistency { fuid, reason }
        })
    }

    /// Traps writes and truncates before the tape copy starts.
    pub fn prepare_premigration(&self) -> Result<()> {
        self.set_regions(&[Region::whole_file(
            MigrationState::Premigrated.region_flags(),
        )])
    }

    pub fn finish_premigration(&self) -> Result<()> {
        Ok(())
    }

    pub fn prepare_recall(&self) -> Result<()> {
        Ok(())
    }

    /// Ends a recall. A premigrated target keeps writes trapped; any other
    /// target clears the region table.
    pub fn finish_recall(&self, target: MigrationState) -> Result<()> {
        match target {
            MigrationState::Premigrated => self.set_regions(&[Region::whole_file(
                MigrationState::Premigrated.region_flags(),
            )]),
            _ => self.set_regions(&[]),
        }
    }

    /// Traps every access ahead of discarding the online data.
    pub fn prepare_stubbing(&self) -> Result<()> {
        self.set_regions(&[Region::whole_file(MigrationState::Migrated.region_flags())])
    }

    /// Discards the online data extent.
    pub fn stub(&self) -> Result<()> {
        self.with_lock(|fuid| {
            self.dm()
                .punch_hole(
                    self.session.sid(),
                    self.handle(),
                    Some(self.session.reserved_token()),
                    0,
                    0,
                )
                .map_err(|e| ConnectorError::dm("dm_punch_hole", e))?;
            debug!(%fuid, "stubbed");
            Ok(())
        })
    }
}

impl fmt::Debug for FileObject<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileObject")
            .field("sid", &self.session.sid())
            .field("handle", &self.handle)
            .finish()
    }
}

/// Identity lock held on a [`FileObject`]. Bound to the locking thread.
pub struct FileLock<'a, 'h> {
    object: &'a FileObject<'h>,
    fuid: FileIdentity,
    released: bool,
    _not_send: PhantomData<*const ()>,
}

impl FileLock<'_, '_> {
    pub fn identity(&self) -> FileIdentity {
        self.fuid
    }

    /// Releases the lock, reporting failures that a drop would only log.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.object
            .session
            .unlock_identity(self.fuid, self.object.handle())
    }
}

impl Drop for FileLock<'_, '_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self
            .object
            .session
            .unlock_identity(self.fuid, self.object.handle())
        {
            error!(fuid = %self.fuid, "unlock failed: {}", e);
        }
    }
}
