//! End-to-end tests of the migration engine against the in-memory kernel.
//!
//! These drive the connector the way a daemon does: start the session,
//! recover dispositions, run the event loop, migrate a file, and serve the
//! recalls its accesses trigger.

mod common;

use std::time::Duration;

use common::{test_config, Fixture, FSID, MOUNT_POINT, PAYLOAD};
use tapehsm_connector::dm::{EventSet, EventType, Response};
use tapehsm_connector::{Connector, ConnectorConfig, FileInfo, MigrationState, RecallKind};

/// Premigrates and stubs the fixture file.
fn migrate(connector: &Connector) {
    let fso = connector.file(Fixture::file_path()).unwrap();
    let lock = fso.lock().unwrap();

    let attr = fso.append_tape_copy("A00001L8", 4096).unwrap();
    assert_eq!(attr.copy_count(), 1);
    fso.prepare_premigration().unwrap();

    let mut staged = vec![0u8; PAYLOAD.len()];
    assert_eq!(fso.read(0, &mut staged).unwrap(), PAYLOAD.len());
    assert_eq!(staged, PAYLOAD);
    fso.finish_premigration().unwrap();
    assert_eq!(fso.migration_state().unwrap(), MigrationState::Premigrated);

    fso.prepare_stubbing().unwrap();
    fso.stub().unwrap();
    lock.release().unwrap();
}

#[tokio::test]
async fn test_migrate_then_recall_through_event_loop() {
    let fx = Fixture::new();
    let connector = fx.connector();
    let report = connector.init_trans_recalls().unwrap();
    assert!(report.recovered.is_empty());

    let (mut recalls, handle) = connector.start_event_loop();
    let mut stats = handle.subscribe();

    fx.mock.post_mount(FSID);
    stats.wait_for(|s| s.mounts == 1).await.unwrap();
    assert_eq!(handle.stats().failed_mounts, 0);

    migrate(&connector);
    let fso = connector.file(Fixture::file_path()).unwrap();
    assert_eq!(fso.migration_state().unwrap(), MigrationState::Migrated);
    assert_eq!(fso.stat().unwrap().blocks, 0);
    assert!(fx.mock.file_data(fx.fuid).iter().all(|b| *b == 0));

    // A read on the stub blocks until the data is back.
    let read_token = fx.mock.access(fx.fuid, EventType::Read).unwrap();
    let recall = recalls.recv().await.unwrap();
    assert_eq!(recall.kind(), RecallKind::Read);
    assert_eq!(recall.token(), read_token);
    {
        let file = recall.file().unwrap();
        let _lock = file.lock().unwrap();
        file.prepare_recall().unwrap();
        file.write(0, PAYLOAD).unwrap();
        file.finish_recall(recall.kind().target_state()).unwrap();
    }
    connector.respond_recall(recall, true).unwrap();
    assert_eq!(fx.mock.response_for(read_token), Some(Response::Continue));
    assert_eq!(fso.migration_state().unwrap(), MigrationState::Premigrated);
    assert_eq!(fx.mock.file_data(fx.fuid), PAYLOAD);
    assert_eq!(fx.mock.times(fx.fuid), Some((1_000, 1_000)));

    // Reads no longer trap; a write makes the file resident.
    assert!(fx.mock.access(fx.fuid, EventType::Read).is_none());
    let write_token = fx.mock.access(fx.fuid, EventType::Write).unwrap();
    let recall = recalls.recv().await.unwrap();
    assert_eq!(recall.kind(), RecallKind::Write);
    recall
        .file()
        .unwrap()
        .finish_recall(recall.kind().target_state())
        .unwrap();
    connector.respond_recall(recall, true).unwrap();
    assert_eq!(fx.mock.response_for(write_token), Some(Response::Continue));
    assert_eq!(fso.migration_state().unwrap(), MigrationState::Resident);
    assert!(fx.mock.access(fx.fuid, EventType::Write).is_none());

    connector.terminate();
    let final_stats = handle.join().await.unwrap();
    assert_eq!(final_stats.recalls, 2);
    assert_eq!(final_stats.control_messages, 1);
}

#[tokio::test]
async fn test_failed_recall_aborts_access() {
    let fx = Fixture::new();
    let connector = fx.connector();
    migrate(&connector);

    let (mut recalls, handle) = connector.start_event_loop();
    let token = fx.mock.access(fx.fuid, EventType::Read).unwrap();
    let recall = recalls.recv().await.unwrap();
    connector.respond_recall(recall, false).unwrap();
    assert_eq!(fx.mock.response_for(token), Some(Response::Abort(libc::EIO)));

    let fso = connector.file(Fixture::file_path()).unwrap();
    assert_eq!(fso.migration_state().unwrap(), MigrationState::Migrated);

    connector.terminate();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn test_recall_engine_gone_aborts_pending_access() {
    let fx = Fixture::new();
    let connector = fx.connector();
    migrate(&connector);

    let (recalls, handle) = connector.start_event_loop();
    drop(recalls);
    let token = fx.mock.access(fx.fuid, EventType::Truncate).unwrap();

    let stats = handle.join().await.unwrap();
    assert_eq!(stats.recalls, 1);
    assert_eq!(fx.mock.response_for(token), Some(Response::Abort(libc::EIO)));
}

#[test]
fn test_restart_takes_over_undestroyable_session() {
    let fx = Fixture::new();
    let fs_handle = fx.mock.add_filesystem(8, "/archive2", "/dev/sdt2");
    let stale = fx.mock.seed_session("tapehsm", 2);
    fx.mock.seed_disposition(stale, &fs_handle, EventSet::data_events());
    fx.mock.fail_destroy(stale);
    let other = fx.mock.seed_session("someone-else", 1);

    let connector = Connector::new(
        ConnectorConfig {
            cleanup_on_start: true,
            ..test_config()
        },
        fx.mock.clone(),
    )
    .unwrap();

    let report = connector.cleanup_report().unwrap();
    assert_eq!(report.matched, 1);
    assert_eq!(report.tokens_aborted, 2);
    assert_eq!(report.failed, vec![stale]);
    assert_eq!(connector.session().sid(), stale);
    assert!(fx.mock.has_session(other));

    let recovery = connector.init_trans_recalls().unwrap();
    assert_eq!(recovery.recovered, vec!["/archive2".to_string()]);
    assert!(fx
        .mock
        .global_disposition(stale)
        .contains(EventType::Mount));
}

#[test]
fn test_restart_after_clean_destroy_opens_fresh_session() {
    let fx = Fixture::new();
    let stale = fx.mock.seed_session("tapehsm", 0);

    let connector = Connector::new(
        ConnectorConfig {
            cleanup_on_start: true,
            ..test_config()
        },
        fx.mock.clone(),
    )
    .unwrap();

    assert_eq!(connector.cleanup_report().unwrap().destroyed, vec![stale]);
    assert_ne!(connector.session().sid(), stale);
    assert_eq!(fx.mock.session_count(), 1);
}

#[test]
fn test_shutdown_leaves_no_session_behind() {
    let fx = Fixture::new();
    let sid = {
        let connector = fx.connector();
        let fso = connector.file(Fixture::file_path()).unwrap();
        fso.append_tape_copy("B00002L8", 1).unwrap();
        connector.session().sid()
    };
    assert!(!fx.mock.has_session(sid));
    assert_eq!(fx.mock.session_count(), 0);
}

#[tokio::test]
async fn test_mount_of_flaky_filesystem_is_counted() {
    let fx = Fixture::new();
    let connector = fx.connector();
    let (_recalls, handle) = connector.start_event_loop();
    let mut stats = handle.subscribe();

    fx.mock.fail_set_dmattr(4);
    fx.mock.post_mount(FSID);
    stats.wait_for(|s| s.mounts == 1).await.unwrap();
    assert_eq!(handle.stats().failed_mounts, 1);

    // The loop keeps serving after the failed mount.
    fx.mock.post_other(EventType::Close);
    tokio::time::timeout(Duration::from_secs(5), stats.wait_for(|s| s.ignored == 1))
        .await
        .unwrap()
        .unwrap();

    connector.terminate();
    handle.join().await.unwrap();
}

#[test]
fn test_file_info_reflects_migration() {
    let fx = Fixture::new();
    let connector = fx.connector();
    migrate(&connector);

    let info = FileInfo::gather(connector.session(), Fixture::file_path()).unwrap();
    assert_eq!(info.state, Some(MigrationState::Migrated));
    assert_eq!(info.size, PAYLOAD.len() as i64);
    assert_eq!(info.blocks, 0);
    assert_eq!(info.tape_ids, vec!["A00001L8".to_string()]);
    assert!(info.to_string().starts_with('m'));

    let root = FileInfo::gather(connector.session(), std::path::Path::new(MOUNT_POINT)).unwrap();
    assert_eq!(root.state_code(), '-');
}
