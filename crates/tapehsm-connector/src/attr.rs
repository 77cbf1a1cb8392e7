//! Persisted data-management attribute records.
//!
//! Two attributes are stored on filesystem objects: the filesystem "managed"
//! flag on a filesystem root, and the migration record on regular files. Both
//! are bincode-encoded. The migration record starts with a format tag that is
//! checked before anything else is decoded, so records written by an
//! incompatible build are rejected instead of misread.

use serde::{Deserialize, Serialize};

use crate::error::{ConnectorError, Result};
use crate::handle::FileIdentity;

/// Attribute name of the filesystem "managed" flag.
pub const FS_ATTR_NAME: &str = "THSMFS";
/// Attribute name of the migration record.
pub const MIG_ATTR_NAME: &str = "THSMMIG";
/// Format tag of the migration record: "THSMMI" followed by the format version.
pub const MIG_ATTR_FORMAT: u64 = 0x5448_534d_4d49_0001;
/// Maximum number of tape copies per file.
pub const MAX_COPIES: usize = 3;
/// Maximum length of a tape id (LTO volume serial with media suffix).
pub const TAPE_ID_LEN: usize = 8;

/// Filesystem "managed" flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FsAttr {
    pub managed: bool,
}

impl FsAttr {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ConnectorError::AttrEncoding {
            reason: e.to_string(),
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| ConnectorError::AttrEncoding {
            reason: format!("filesystem attribute: {}", e),
        })
    }
}

/// One copy of a file's data on tape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeCopy {
    pub tape_id: String,
    pub start_block: u64,
}

/// Migration record of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationAttr {
    pub format: u64,
    pub added: bool,
    pub copies: Vec<TapeCopy>,
}

impl Default for MigrationAttr {
    fn default() -> Self {
        Self::not_migrated()
    }
}

impl MigrationAttr {
    /// The value reported for a file whose record was never written.
    pub fn not_migrated() -> Self {
        MigrationAttr {
            format: MIG_ATTR_FORMAT,
            added: false,
            copies: Vec::new(),
        }
    }

    pub fn copy_count(&self) -> usize {
        self.copies.len()
    }

    /// True when the record does not describe any tape copy.
    pub fn is_resident(&self) -> bool {
        !self.added || self.copies.is_empty()
    }

    pub fn tape_ids(&self) -> Vec<&str> {
        self.copies.iter().map(|c| c.tape_id.as_str()).collect()
    }

    /// Appends a tape copy and marks the record as added.
    pub fn append_copy(&mut self, fuid: FileIdentity, tape_id: &str, start_block: u64) -> Result<()> {
        if tape_id.is_empty() || tape_id.len() > TAPE_ID_LEN {
            return Err(ConnectorError::InvalidTapeId {
                tape_id: tape_id.to_string(),
            });
        }
        if self.copies.len() >= MAX_COPIES {
            return Err(ConnectorError::TooManyCopies {
                fuid,
                max: MAX_COPIES,
            });
        }

        self.format = MIG_ATTR_FORMAT;
        self.added = true;
        self.copies.push(TapeCopy {
            tape_id: tape_id.to_string(),
            start_block,
        });
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ConnectorError::AttrEncoding {
            reason: e.to_string(),
        })
    }

    /// Decodes a stored record, rejecting foreign formats.
    pub fn decode(fuid: FileIdentity, bytes: &[u8]) -> Result<Self> {
        let tag: [u8; 8] = bytes
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| ConnectorError::AttrEncoding {
                reason: format!("migration attribute of {} is {} bytes", fuid, bytes.len()),
            })?;

        let found = u64::from_le_bytes(tag);
        if found != MIG_ATTR_FORMAT {
            return Err(ConnectorError::AttrFormat {
                fuid,
                found,
                expected: MIG_ATTR_FORMAT,
            });
        }

        let attr: MigrationAttr =
            bincode::deserialize(bytes).map_err(|e| ConnectorError::AttrEncoding {
                reason: format!("migration attribute of {}: {}", fuid, e),
            })?;

        if attr.copies.len() > MAX_COPIES {
            return Err(ConnectorError::AttrEncoding {
                reason: format!("migration attribute of {} lists {} copies", fuid, attr.copies.len()),
            });
        }

        Ok(attr)
    }
}
