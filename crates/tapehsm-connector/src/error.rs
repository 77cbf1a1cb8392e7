//! Error types for the connector.

use thiserror::Error;

use crate::dm::DmError;
use crate::handle::FileIdentity;

/// Error variants for connector operations.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// A kernel data-management call failed.
    #[error("{op} failed: {source}")]
    Dm {
        /// Name of the kernel operation.
        op: &'static str,
        /// Classified kernel failure.
        #[source]
        source: DmError,
    },

    /// The stored migration record carries an unexpected format tag.
    #[error("migration attribute of {fuid} has format {found:#x}, expected {expected:#x}")]
    AttrFormat {
        /// File the attribute belongs to.
        fuid: FileIdentity,
        /// Tag found in the stored record.
        found: u64,
        /// Tag this build writes.
        expected: u64,
    },

    /// An attribute could not be encoded or decoded.
    #[error("attribute encoding error: {reason}")]
    AttrEncoding {
        /// Description of the failure.
        reason: String,
    },

    /// The kernel-visible state of a file contradicts the migration state machine.
    #[error("consistency violation on {fuid}: {reason}")]
    Consistency {
        /// File the violation was detected on.
        fuid: FileIdentity,
        /// Description of the violation.
        reason: String,
    },

    /// Unlock requested for an identity that holds no lock.
    #[error("identity {fuid} is not locked")]
    NotLocked {
        /// Identity passed to unlock.
        fuid: FileIdentity,
    },

    /// Appending another tape copy would exceed the record's capacity.
    #[error("{fuid} already holds the maximum of {max} tape copies")]
    TooManyCopies {
        /// File the copy was appended to.
        fuid: FileIdentity,
        /// Maximum copy count.
        max: usize,
    },

    /// A tape id is empty or longer than the record allows.
    #[error("invalid tape id {tape_id:?}")]
    InvalidTapeId {
        /// The rejected tape id.
        tape_id: String,
    },

    /// A filesystem could not be put under management.
    #[error("cannot manage filesystem: {reason}")]
    FsAdd {
        /// Description of the failure.
        reason: String,
    },

    /// A bounded retry loop ran out of attempts.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Rendering of the last error seen.
        last: String,
    },

    /// The kernel session could not be established.
    #[error("session startup failed: {reason}")]
    Session {
        /// Description of the failure.
        reason: String,
    },

    /// Invalid or unreadable configuration.
    #[error("configuration error: {reason}")]
    Config {
        /// Description of the failure.
        reason: String,
    },

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for connector operations.
pub type Result<T> = std::result::Result<T, ConnectorError>;

impl ConnectorError {
    /// Wraps a kernel failure with the name of the call that produced it.
    pub fn dm(op: &'static str, source: DmError) -> Self {
        ConnectorError::Dm { op, source }
    }

    /// Returns the kernel classification when this error came from a kernel call.
    pub fn dm_error(&self) -> Option<&DmError> {
        match self {
            ConnectorError::Dm { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Errno reported to a blocked caller when an operation fails on its behalf.
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            ConnectorError::Dm { source, .. } => source.errno(),
            ConnectorError::AttrFormat { .. } => EILSEQ,
            ConnectorError::AttrEncoding { .. } => EILSEQ,
            ConnectorError::Consistency { .. } => EIO,
            ConnectorError::NotLocked { .. } => EINVAL,
            ConnectorError::TooManyCopies { .. } => ENOSPC,
            ConnectorError::InvalidTapeId { .. } => EINVAL,
            ConnectorError::FsAdd { .. } => EIO,
            ConnectorError::RetriesExhausted { .. } => EAGAIN,
            ConnectorError::Session { .. } => EIO,
            ConnectorError::Config { .. } => EINVAL,
            ConnectorError::Io(e) => e.raw_os_error().unwrap_or(EIO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fuid() -> FileIdentity {
        FileIdentity::new(0, 7, 1, 42)
    }

    #[test]
    fn test_dm_error_keeps_kernel_errno() {
        let err = ConnectorError::dm("dm_set_region", DmError::Os(libc::ENOSPC));
        assert_eq!(err.to_errno(), libc::ENOSPC);
        assert!(matches!(err.dm_error(), Some(DmError::Os(libc::ENOSPC))));
    }

    #[test]
    fn test_consistency_maps_to_eio() {
        let err = ConnectorError::Consistency {
            fuid: fuid(),
            reason: "two regions".into(),
        };
        assert_eq!(err.to_errno(), libc::EIO);
        assert!(err.dm_error().is_none());
    }

    #[test]
    fn test_io_error_from_raw_os_error() {
        let err = ConnectorError::from(std::io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(err.to_errno(), libc::EACCES);
    }

    #[test]
    fn test_display_mentions_identity() {
        let err = ConnectorError::NotLocked { fuid: fuid() };
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn test_display_messages_non_empty() {
        let errors = [
            ConnectorError::AttrFormat {
                fuid: fuid(),
                found: 1,
                expected: 2,
            },
            ConnectorError::AttrEncoding {
                reason: "short".into(),
            },
            ConnectorError::TooManyCopies { fuid: fuid(), max: 3 },
            ConnectorError::InvalidTapeId {
                tape_id: String::new(),
            },
            ConnectorError::FsAdd {
                reason: "disp".into(),
            },
            ConnectorError::RetriesExhausted {
                attempts: 4,
                last: "busy".into(),
            },
            ConnectorError::Session {
                reason: "no service".into(),
            },
            ConnectorError::Config {
                reason: "empty name".into(),
            },
        ];
        for err in errors {
            assert!(!err.to_string().is_empty());
        }
    }
}
