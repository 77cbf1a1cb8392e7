//! Disposition recovery after a restart.
//!
//! Dispositions registered by a previous incarnation outlive the process.
//! Each surviving record is checked against the filesystem it names: records
//! for filesystems that are gone or inaccessible are skipped, the rest get the
//! data-event disposition installed again. Afterwards global interest in
//! mount events is registered so new filesystems can opt in.

use serde::Serialize;
use tracing::{info, warn};

use crate::buffer::{collect_with_growth, query_with_growth};
use crate::dm::{DispTarget, DmError, EventSet, EventType};
use crate::error::{ConnectorError, Result};
use crate::session::Session;

/// Outcome of a recovery pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Mount points whose disposition was re-installed.
    pub recovered: Vec<String>,
    /// Records skipped because their filesystem is stale.
    pub skipped: usize,
}

fn is_stale(err: &DmError) -> bool {
    matches!(
        err,
        DmError::BadHandle | DmError::PermissionDenied | DmError::NotFound
    )
}

/// Re-installs the data-event disposition for every surviving record.
pub fn recover_dispositions(session: &Session) -> Result<RecoveryReport> {
    let dm = session.dm();
    let sid = session.sid();
    let config = session.config();

    let records = collect_with_growth(config.disposition_buffer, |buf| dm.getall_disp(sid, buf))
        .map_err(|e| ConnectorError::dm("dm_getall_disp", e))?;

    let mut report = RecoveryReport::default();
    for record in records {
        if record.fs_handle.is_empty() {
            break;
        }

        let info = match query_with_growth(config.mountinfo_buffer, |len| {
            dm.get_mountinfo(sid, &record.fs_handle, len)
        }) {
            Ok(info) => info,
            Err(e) if is_stale(&e) => {
                warn!(%sid, "skipping disposition of an unavailable filesystem: {}", e);
                report.skipped += 1;
                continue;
            }
            Err(e) => return Err(ConnectorError::dm("dm_get_mountinfo", e)),
        };

        dm.set_disp(
            sid,
            DispTarget::Filesystem(&info.fs_handle),
            EventSet::data_events(),
        )
        .map_err(|e| ConnectorError::dm("dm_set_disp", e))?;
        info!(mount_point = %info.mount_point, device = %info.device, "disposition recovered");
        report.recovered.push(info.mount_point);
    }

    Ok(report)
}

/// Recovers dispositions, then registers global interest in mount events.
pub fn init_trans_recalls(session: &Session) -> Result<RecoveryReport> {
    let report = recover_dispositions(session)?;

    session
        .dm()
        .set_disp(
            session.sid(),
            DispTarget::Global,
            EventSet::empty().with(EventType::Mount),
        )
        .map_err(|e| ConnectorError::dm("dm_set_disp", e))?;

    info!(
        recovered = report.recovered.len(),
        skipped = report.skipped,
        "transparent recalls enabled"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectorConfig;
    use crate::dm::DmApi;
    use crate::mock::{MockDmApi, MountAccess};
    use crate::session::SessionManager;
    use std::sync::Arc;

    fn open(mock: &Arc<MockDmApi>, takeover: Option<crate::dm::SessionId>) -> Arc<Session> {
        let config = ConnectorConfig {
            disposition_buffer: 1,
            mountinfo_buffer: 8,
            terminate_on_teardown_failure: false,
            ..ConnectorConfig::default()
        };
        SessionManager::new(mock.clone(), config).open(takeover).unwrap()
    }

    #[test]
    fn test_recovers_valid_and_skips_stale() {
        let mock = Arc::new(MockDmApi::new());
        let old = mock.seed_session("tapehsm", 0);
        let good_a = mock.add_filesystem(1, "/a", "/dev/a");
        let gone = mock.add_filesystem(2, "/b", "/dev/b");
        let good_c = mock.add_filesystem(3, "/c", "/dev/c");
        let forbidden = mock.add_filesystem(4, "/d", "/dev/d");
        for fs in [&good_a, &gone, &good_c, &forbidden] {
            mock.seed_disposition(old, fs, EventSet::data_events());
        }
        mock.set_mount_access(2, MountAccess::Unmounted);
        mock.set_mount_access(4, MountAccess::Forbidden);

        let session = open(&mock, Some(old));
        let report = recover_dispositions(&session).unwrap();
        assert_eq!(report.recovered, vec!["/a".to_string(), "/c".to_string()]);
        assert_eq!(report.skipped, 2);
    }

    #[test]
    fn test_no_records_is_empty_report() {
        let mock = Arc::new(MockDmApi::new());
        let session = open(&mock, None);
        assert_eq!(recover_dispositions(&session).unwrap(), RecoveryReport::default());
    }

    #[test]
    fn test_init_registers_global_mount_interest() {
        let mock = Arc::new(MockDmApi::new());
        let session = open(&mock, None);
        init_trans_recalls(&session).unwrap();
        let global = mock.global_disposition(session.sid());
        assert!(global.contains(EventType::Mount));
        assert!(!global.contains(EventType::Read));
    }

    #[test]
    fn test_hard_disposition_failure_propagates() {
        let mock = Arc::new(MockDmApi::new());
        let old = mock.seed_session("tapehsm", 0);
        let fs = mock.add_filesystem(1, "/a", "/dev/a");
        mock.seed_disposition(old, &fs, EventSet::data_events());
        let session = open(&mock, Some(old));
        mock.fail_fs_disposition(true);
        let err = recover_dispositions(&session).unwrap_err();
        assert!(err.dm_error().is_some());
        assert!(mock.get_mountinfo(session.sid(), &fs, 4096).is_ok());
    }
}
