//! Kernel session lifecycle.
//!
//! [`SessionManager`] reclaims sessions left behind by a crashed predecessor
//! and opens the engine's own session together with a reserved user event.
//! The reserved event's token is what every exclusive right is requested
//! under, and it is aborted on teardown. [`Session`] is shared as
//! `Arc<Session>` by every component that talks to the kernel; dropping the
//! last reference tears the session down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::buffer::collect_with_growth;
use crate::config::ConnectorConfig;
use crate::dm::{DmApi, Response, Right, SessionId, Token};
use crate::error::{ConnectorError, Result};
use crate::handle::FileIdentity;
use crate::locking::IdentityLockRegistry;

/// Payload of the reserved user event.
const RESERVED_EVENT_MSG: [u8; 8] = [0; 8];

/// Outcome of a stale-session cleanup pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Sessions enumerated.
    pub examined: usize,
    /// Sessions carrying this engine's name.
    pub matched: usize,
    pub tokens_aborted: usize,
    pub destroyed: Vec<SessionId>,
    /// Sessions that could not be destroyed, in the order they were tried.
    pub failed: Vec<SessionId>,
}

impl CleanupReport {
    /// Session to assume when creating the new one.
    pub fn takeover(&self) -> Option<SessionId> {
        self.failed.last().copied()
    }
}

/// The engine's kernel session.
pub struct Session {
    dm: Arc<dyn DmApi>,
    sid: SessionId,
    reserved: Token,
    config: ConnectorConfig,
    locks: IdentityLockRegistry,
    torn_down: AtomicBool,
}

impl Session {
    pub fn sid(&self) -> SessionId {
        self.sid
    }

    /// Token of the reserved user event.
    pub fn reserved_token(&self) -> Token {
        self.reserved
    }

    pub fn dm(&self) -> &Arc<dyn DmApi> {
        &self.dm
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn locks(&self) -> &IdentityLockRegistry {
        &self.locks
    }

    /// Locks `fuid`, requesting the exclusive right on `handle` if this is
    /// the outermost lock.
    pub fn lock_identity(&self, fuid: FileIdentity, handle: &[u8]) -> Result<()> {
        self.locks.lock(fuid, || {
            self.dm
                .request_right(self.sid, handle, self.reserved, Right::Exclusive)
                .map_err(|e| ConnectorError::dm("dm_request_right", e))
        })
    }

    pub fn unlock_identity(&self, fuid: FileIdentity, handle: &[u8]) -> Result<()> {
        self.locks.unlock(fuid, || {
            self.dm
                .release_right(self.sid, handle, self.reserved)
                .map_err(|e| ConnectorError::dm("dm_release_right", e))
        })
    }

    /// Delivers the response for an event token.
    pub fn respond(&self, token: Token, response: Response) -> Result<()> {
        debug!(sid = %self.sid, %token, ?response, "respond");
        self.dm
            .respond_event(self.sid, token, response)
            .map_err(|e| ConnectorError::dm("dm_respond_event", e))
    }

    /// Posts an asynchronous message to this session's own event queue.
    pub fn send_message(&self, msg: &[u8]) -> Result<()> {
        self.dm
            .send_msg(self.sid, msg)
            .map_err(|e| ConnectorError::dm("dm_send_msg", e))
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Aborts the reserved event and destroys the session. Runs at most once.
    ///
    /// When the session cannot be destroyed and
    /// `terminate_on_teardown_failure` is set, the process sends itself SIGTERM.
    pub fn shutdown(&self) -> Result<()> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.respond(self.reserved, Response::Abort(libc::EINTR)) {
            warn!(sid = %self.sid, "aborting the reserved event failed: {}", e);
        }

        match self.dm.destroy_session(self.sid) {
            Ok(()) => {
                info!(sid = %self.sid, "session destroyed");
                Ok(())
            }
            Err(e) => {
                error!(sid = %self.sid, "session teardown failed: {}", e);
                if self.config.terminate_on_teardown_failure {
                    terminate_self();
                }
                Err(ConnectorError::dm("dm_destroy_session", e))
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("sid", &self.sid)
            .field("reserved", &self.reserved)
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}

fn terminate_self() {
    // SAFETY: kill(2) on our own pid has no memory-safety preconditions.
    unsafe {
        libc::kill(libc::getpid(), libc::SIGTERM);
    }
}

/// Creates and reclaims kernel sessions.
pub struct SessionManager {
    dm: Arc<dyn DmApi>,
    config: ConnectorConfig,
}

impl SessionManager {
    pub fn new(dm: Arc<dyn DmApi>, config: ConnectorConfig) -> Self {
        Self { dm, config }
    }

    /// Aborts every outstanding token of sessions named like this engine and
    /// destroys them. A session that cannot be destroyed is recorded in the
    /// report and the pass continues.
    pub fn cleanup_stale_sessions(&self) -> Result<CleanupReport> {
        let sids = collect_with_growth(self.config.session_buffer, |buf| {
            self.dm.getall_sessions(buf)
        })
        .map_err(|e| ConnectorError::dm("dm_getall_sessions", e))?;

        let mut report = CleanupReport::default();
        if !sids.is_empty() {
            info!(count = sids.len(), "found existing kernel sessions");
        }

        for sid in sids {
            report.examined += 1;
            let name = self
                .dm
                .query_session(sid)
                .map_err(|e| ConnectorError::dm("dm_query_session", e))?;
            if name != self.config.session_name {
                continue;
            }
            report.matched += 1;

            let tokens = collect_with_growth(self.config.token_buffer, |buf| {
                self.dm.getall_tokens(sid, buf)
            })
            .map_err(|e| ConnectorError::dm("dm_getall_tokens", e))?;
            debug!(%sid, tokens = tokens.len(), "stale session");

            for token in tokens {
                match self.dm.respond_event(sid, token, Response::Abort(libc::EINTR)) {
                    Ok(()) => report.tokens_aborted += 1,
                    Err(e) => warn!(%sid, %token, "aborting stale token failed: {}", e),
                }
            }

            match self.dm.destroy_session(sid) {
                Ok(()) => {
                    info!(%sid, "stale session destroyed");
                    report.destroyed.push(sid);
                }
                Err(e) => {
                    error!(%sid, "unable to destroy stale session: {}", e);
                    report.failed.push(sid);
                }
            }
        }

        Ok(report)
    }

    /// Creates the engine's session, assuming `takeover` when given, and its
    /// reserved user event. The session is destroyed again if the user event
    /// cannot be created.
    pub fn open(&self, takeover: Option<SessionId>) -> Result<Arc<Session>> {
        let sid = self
            .dm
            .create_session(takeover, &self.config.session_name)
            .map_err(|e| ConnectorError::Session {
                reason: format!("dm_create_session: {}", e),
            })?;

        let reserved = match self.dm.create_userevent(sid, &RESERVED_EVENT_MSG) {
            Ok(token) => token,
            Err(e) => {
                if let Err(d) = self.dm.destroy_session(sid) {
                    warn!(%sid, "destroying half-created session failed: {}", d);
                }
                return Err(ConnectorError::Session {
                    reason: format!("dm_create_userevent: {}", e),
                });
            }
        };

        info!(%sid, %reserved, ?takeover, name = %self.config.session_name, "session created");
        Ok(Arc::new(Session {
            dm: self.dm.clone(),
            sid,
            reserved,
            config: self.config.clone(),
            locks: IdentityLockRegistry::new(),
            torn_down: AtomicBool::new(false),
        }))
    }

    /// Runs the configured cleanup, then opens the session, assuming the
    /// last stale session that could not be destroyed.
    pub fn establish(&self) -> Result<(Arc<Session>, Option<CleanupReport>)> {
        let report = if self.config.cleanup_on_start {
            Some(self.cleanup_stale_sessions()?)
        } else {
            None
        };
        let takeover = report.as_ref().and_then(CleanupReport::takeover);
        let session = self.open(takeover)?;
        Ok((session, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDmApi;

    fn config() -> ConnectorConfig {
        ConnectorConfig {
            session_name: "thsm".into(),
            session_buffer: 1,
            token_buffer: 1,
            terminate_on_teardown_failure: false,
            ..ConnectorConfig::default()
        }
    }

    fn manager(mock: &Arc<MockDmApi>) -> SessionManager {
        SessionManager::new(mock.clone(), config())
    }

    #[test]
    fn test_cleanup_only_touches_matching_sessions() {
        let mock = Arc::new(MockDmApi::new());
        let other = mock.seed_session("someone-else", 2);
        let stale = mock.seed_session("thsm", 3);

        let report = manager(&mock).cleanup_stale_sessions().unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.matched, 1);
        assert_eq!(report.tokens_aborted, 3);
        assert_eq!(report.destroyed, vec![stale]);
        assert!(mock.has_session(other));
        assert!(!mock.has_session(stale));
        assert!(mock
            .responses()
            .iter()
            .all(|(_, r)| *r == Response::Abort(libc::EINTR)));
    }

    #[test]
    fn test_cleanup_continues_past_failed_destroy() {
        let mock = Arc::new(MockDmApi::new());
        let a = mock.seed_session("thsm", 1);
        let b = mock.seed_session("thsm", 1);
        let c = mock.seed_session("thsm", 0);
        mock.fail_destroy(b);

        let report = manager(&mock).cleanup_stale_sessions().unwrap();
        assert_eq!(report.matched, 3);
        assert_eq!(report.destroyed, vec![a, c]);
        assert_eq!(report.failed, vec![b]);
        assert_eq!(report.takeover(), Some(b));
        assert_eq!(report.tokens_aborted, 2);
    }

    #[test]
    fn test_open_creates_reserved_event() {
        let mock = Arc::new(MockDmApi::new());
        let session = manager(&mock).open(None).unwrap();
        assert_eq!(mock.session_name(session.sid()).as_deref(), Some("thsm"));
        assert_eq!(mock.outstanding_tokens(session.sid()), vec![session.reserved_token()]);
    }

    #[test]
    fn test_establish_assumes_undestroyable_session() {
        let mock = Arc::new(MockDmApi::new());
        let stuck = mock.seed_session("thsm", 0);
        mock.fail_destroy(stuck);
        let config = ConnectorConfig {
            cleanup_on_start: true,
            ..config()
        };
        let (session, report) = SessionManager::new(mock.clone(), config).establish().unwrap();
        assert_eq!(report.unwrap().failed, vec![stuck]);
        assert_eq!(session.sid(), stuck);
    }

    #[test]
    fn test_shutdown_aborts_reserved_event_and_destroys() {
        let mock = Arc::new(MockDmApi::new());
        let session = manager(&mock).open(None).unwrap();
        let sid = session.sid();
        let reserved = session.reserved_token();

        session.shutdown().unwrap();
        assert!(session.is_torn_down());
        assert_eq!(mock.response_for(reserved), Some(Response::Abort(libc::EINTR)));
        assert!(!mock.has_session(sid));
        session.shutdown().unwrap();
        assert_eq!(mock.response_count(reserved), 1);
    }

    #[test]
    fn test_drop_tears_down() {
        let mock = Arc::new(MockDmApi::new());
        let sid = manager(&mock).open(None).unwrap().sid();
        assert!(!mock.has_session(sid));
    }

    #[test]
    fn test_failed_teardown_is_reported() {
        let mock = Arc::new(MockDmApi::new());
        let session = manager(&mock).open(None).unwrap();
        mock.fail_destroy(session.sid());
        let err = session.shutdown().unwrap_err();
        assert_eq!(err.dm_error(), Some(&crate::dm::DmError::Os(libc::EIO)));
    }

    #[test]
    fn test_identity_lock_uses_reserved_token() {
        let mock = Arc::new(MockDmApi::new());
        mock.add_filesystem(1, "/m", "/dev/x");
        let fuid = mock.add_file(1, "/m/f", b"x");
        let handle = mock.path_to_handle(std::path::Path::new("/m/f")).unwrap();
        let session = manager(&mock).open(None).unwrap();

        session.lock_identity(fuid, &handle).unwrap();
        session.lock_identity(fuid, &handle).unwrap();
        session.unlock_identity(fuid, &handle).unwrap();
        session.unlock_identity(fuid, &handle).unwrap();
        assert_eq!(mock.right_requests(), 1);
        assert_eq!(mock.right_releases(), 1);
        assert!(session.locks().is_empty());
    }
}
