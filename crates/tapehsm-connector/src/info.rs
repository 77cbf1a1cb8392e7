//! Information records printed by the client tools.

use std::fmt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::fsobj::{FileObject, MigrationState};
use crate::session::Session;

/// Migration information of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// `None` for non-regular files and objects whose state is unreadable.
    pub state: Option<MigrationState>,
    pub size: i64,
    pub blocks: u64,
    pub tape_ids: Vec<String>,
    pub name: String,
}

impl FileInfo {
    /// Builds the record from the file's kernel attributes.
    pub fn from_object(fso: &FileObject<'_>, name: impl Into<String>) -> Result<Self> {
        let stat = fso.stat()?;
        let attr = fso.attribute()?;
        let tape_ids = attr.tape_ids().into_iter().map(str::to_string).collect();
        let state = if stat.is_regular() {
            Some(fso.migration_state()?)
        } else {
            None
        };

        Ok(Self {
            state,
            size: stat.size,
            blocks: stat.blocks,
            tape_ids,
            name: name.into(),
        })
    }

    /// Builds the record for `path`. When the kernel interface cannot
    /// describe the file, plain stat data is reported without a state.
    /// Returns `None` if the file cannot be stat'ed at all.
    pub fn gather(session: &Arc<Session>, path: &Path) -> Option<Self> {
        let name = path.display().to_string();
        let from_dm = FileObject::from_path(session.clone(), path)
            .and_then(|fso| Self::from_object(&fso, name.clone()));

        match from_dm {
            Ok(info) => Some(info),
            Err(e) => {
                debug!(path = %name, "falling back to plain stat: {}", e);
                let meta = std::fs::metadata(path).ok()?;
                Some(Self {
                    state: None,
                    size: meta.size() as i64,
                    blocks: meta.blocks(),
                    tape_ids: Vec::new(),
                    name,
                })
            }
        }
    }

    pub fn state_code(&self) -> char {
        self.state.map(|s| s.code()).unwrap_or('-')
    }

    /// Comma-separated tape ids, `-` when there is no copy.
    pub fn tape_list(&self) -> String {
        if self.tape_ids.is_empty() {
            "-".to_string()
        } else {
            self.tape_ids.join(",")
        }
    }

    pub fn header() -> String {
        format!(
            "{:<1} {:>12} {:>12} {:<26} {}",
            "", "size", "blocks", "tape id", "file name"
        )
    }
}

impl fmt::Display for FileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<1} {:>12} {:>12} {:<26} {}",
            self.state_code(),
            self.size,
            self.blocks,
            self.tape_list(),
            self.name
        )
    }
}

/// Capacity summary of one tape pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub name: String,
    pub total: u64,
    pub free: u64,
    pub unreferenced: u64,
    pub tapes: u64,
}

impl PoolInfo {
    pub fn header() -> String {
        format!(
            "{:<16} {:>12} {:>12} {:>12} {:>8}",
            "pool name", "total cap.", "free cap.", "unref. cap.", "#tapes"
        )
    }

    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.free)
    }
}

impl fmt::Display for PoolInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<16} {:>12} {:>12} {:>12} {:>8}",
            self.name, self.total, self.free, self.unreferenced, self.tapes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectorConfig;
    use crate::mock::MockDmApi;
    use crate::session::SessionManager;
    use std::io::Write;

    fn setup() -> (Arc<MockDmApi>, Arc<Session>) {
        let mock = Arc::new(MockDmApi::new());
        mock.add_filesystem(1, "/m", "/dev/x");
        let config = ConnectorConfig {
            terminate_on_teardown_failure: false,
            ..ConnectorConfig::default()
        };
        let session = SessionManager::new(mock.clone(), config).open(None).unwrap();
        (mock, session)
    }

    #[test]
    fn test_resident_file_row() {
        let (mock, session) = setup();
        mock.add_file(1, "/m/f", b"hello");
        let info = FileInfo::gather(&session, Path::new("/m/f")).unwrap();
        assert_eq!(info.state, Some(MigrationState::Resident));
        assert_eq!(info.size, 5);
        assert_eq!(info.blocks, 1);
        assert_eq!(info.tape_list(), "-");
        assert!(info.to_string().starts_with("r "));
        assert!(info.to_string().ends_with(" /m/f"));
    }

    #[test]
    fn test_premigrated_file_lists_tapes() {
        let (mock, session) = setup();
        mock.add_file(1, "/m/f", b"hello");
        let fso = FileObject::from_path(session.clone(), Path::new("/m/f")).unwrap();
        fso.append_tape_copy("TAPE01", 10).unwrap();
        fso.append_tape_copy("TAPE02", 20).unwrap();
        fso.prepare_premigration().unwrap();

        let info = FileInfo::from_object(&fso, "/m/f").unwrap();
        assert_eq!(info.state, Some(MigrationState::Premigrated));
        assert_eq!(info.state_code(), 'p');
        assert_eq!(info.tape_list(), "TAPE01,TAPE02");
    }

    #[test]
    fn test_directory_has_no_state() {
        let (_mock, session) = setup();
        let info = FileInfo::gather(&session, Path::new("/m")).unwrap();
        assert_eq!(info.state, None);
        assert_eq!(info.state_code(), '-');
    }

    #[test]
    fn test_unknown_to_kernel_falls_back_to_stat() {
        let (_mock, session) = setup();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();
        file.flush().unwrap();

        let info = FileInfo::gather(&session, file.path()).unwrap();
        assert_eq!(info.state, None);
        assert_eq!(info.size, 10);
        assert_eq!(info.tape_list(), "-");
    }

    #[test]
    fn test_missing_file_is_skipped() {
        let (_mock, session) = setup();
        assert!(FileInfo::gather(&session, Path::new("/nonexistent/tapehsm/x")).is_none());
    }

    #[test]
    fn test_pool_row() {
        let pool = PoolInfo {
            name: "archive".into(),
            total: 1000,
            free: 400,
            unreferenced: 50,
            tapes: 3,
        };
        assert_eq!(pool.used(), 600);
        let row = pool.to_string();
        assert!(row.starts_with("archive "));
        assert!(row.trim_end().ends_with('3'));
        assert_eq!(PoolInfo::header().len(), row.len());
    }

    #[test]
    fn test_file_info_serializes() {
        let info = FileInfo {
            state: Some(MigrationState::Migrated),
            size: 1,
            blocks: 0,
            tape_ids: vec!["T1".into()],
            name: "f".into(),
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"migrated\""));
    }
}
