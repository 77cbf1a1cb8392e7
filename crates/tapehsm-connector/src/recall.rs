//! Recall descriptors and their responder.
//!
//! A [`RecallDescriptor`] carries the token of a blocked access. It can only
//! be answered by moving it into [`RecallResponder::respond`], so a token is
//! answered at most once. A descriptor dropped without an answer aborts the
//! access with `EIO` rather than leaving the caller blocked.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::dm::{EventType, Response, Token};
use crate::error::{ConnectorError, Result};
use crate::fsobj::{FileObject, MigrationState};
use crate::handle::FileIdentity;
use crate::session::Session;

/// What the blocked access needs from the recall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecallKind {
    /// Data must be readable; the tape copy stays valid.
    Read,
    /// Data must become locally writable.
    Write,
}

impl RecallKind {
    pub fn from_event(event: EventType) -> Option<Self> {
        match event {
            EventType::Read => Some(RecallKind::Read),
            EventType::Write | EventType::Truncate => Some(RecallKind::Write),
            _ => None,
        }
    }

    pub fn to_resident(&self) -> bool {
        matches!(self, RecallKind::Write)
    }

    /// State the file is left in once the recall finishes.
    pub fn target_state(&self) -> MigrationState {
        match self {
            RecallKind::Read => MigrationState::Premigrated,
            RecallKind::Write => MigrationState::Resident,
        }
    }
}

/// A blocked access waiting for its file to be recalled.
#[must_use = "an unanswered recall aborts the blocked access"]
pub struct RecallDescriptor {
    session: Arc<Session>,
    token: Token,
    fuid: FileIdentity,
    kind: RecallKind,
    answered: bool,
}

impl RecallDescriptor {
    pub(crate) fn new(session: Arc<Session>, token: Token, fuid: FileIdentity, kind: RecallKind) -> Self {
        Self {
            session,
            token,
            fuid,
            kind,
            answered: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn fuid(&self) -> FileIdentity {
        self.fuid
    }

    pub fn kind(&self) -> RecallKind {
        self.kind
    }

    /// Opens the file to recall.
    pub fn file(&self) -> Result<FileObject<'static>> {
        FileObject::from_identity(self.session.clone(), self.fuid)
    }

    fn answer(&mut self, response: Response) -> Result<()> {
        self.answered = true;
        self.session.respond(self.token, response)
    }
}

impl Drop for RecallDescriptor {
    fn drop(&mut self) {
        if self.answered {
            return;
        }
        error!(token = %self.token, fuid = %self.fuid, "recall dropped unanswered, aborting access");
        if let Err(e) = self.answer(Response::Abort(libc::EIO)) {
            error!(token = %self.token, "abort of dropped recall failed: {}", e);
        }
    }
}

impl fmt::Debug for RecallDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecallDescriptor")
            .field("token", &self.token)
            .field("fuid", &self.fuid)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Resumes accesses blocked on a recall.
#[derive(Debug, Clone)]
pub struct RecallResponder {
    session: Arc<Session>,
}

impl RecallResponder {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Lets the access continue on success, fails it with `EIO` otherwise.
    pub fn respond(&self, mut recall: RecallDescriptor, success: bool) -> Result<()> {
        if recall.session.sid() != self.session.sid() {
            return Err(ConnectorError::Session {
                reason: format!(
                    "recall {} belongs to {}, not {}",
                    recall.token,
                    recall.session.sid(),
                    self.session.sid()
                ),
            });
        }

        let response = if success {
            Response::Continue
        } else {
            Response::Abort(libc::EIO)
        };
        debug!(token = %recall.token, fuid = %recall.fuid, success, "recall answered");
        recall.answer(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectorConfig;
    use crate::dm::DmApi;
    use crate::mock::MockDmApi;
    use crate::session::SessionManager;

    fn setup() -> (Arc<MockDmApi>, Arc<Session>, FileIdentity) {
        let mock = Arc::new(MockDmApi::new());
        mock.add_filesystem(1, "/m", "/dev/x");
        let fuid = mock.add_file(1, "/m/f", b"abc");
        let config = ConnectorConfig {
            terminate_on_teardown_failure: false,
            ..ConnectorConfig::default()
        };
        let session = SessionManager::new(mock.clone(), config).open(None).unwrap();
        (mock, session, fuid)
    }

    fn pending(mock: &MockDmApi, session: &Arc<Session>, fuid: FileIdentity, kind: RecallKind) -> RecallDescriptor {
        let token = mock.post_data_event(EventType::Read, fuid, 0, 3);
        mock.get_events(session.sid()).unwrap();
        RecallDescriptor::new(session.clone(), token, fuid, kind)
    }

    #[test]
    fn test_kind_from_event() {
        assert_eq!(RecallKind::from_event(EventType::Read), Some(RecallKind::Read));
        assert_eq!(RecallKind::from_event(EventType::Write), Some(RecallKind::Write));
        assert_eq!(RecallKind::from_event(EventType::Truncate), Some(RecallKind::Write));
        assert_eq!(RecallKind::from_event(EventType::Mount), None);
        assert!(RecallKind::Write.to_resident());
        assert_eq!(RecallKind::Read.target_state(), MigrationState::Premigrated);
    }

    #[test]
    fn test_success_continues() {
        let (mock, session, fuid) = setup();
        let recall = pending(&mock, &session, fuid, RecallKind::Read);
        let token = recall.token();
        RecallResponder::new(session.clone()).respond(recall, true).unwrap();
        assert_eq!(mock.response_for(token), Some(Response::Continue));
        assert_eq!(mock.response_count(token), 1);
    }

    #[test]
    fn test_failure_aborts_with_eio() {
        let (mock, session, fuid) = setup();
        let recall = pending(&mock, &session, fuid, RecallKind::Write);
        let token = recall.token();
        RecallResponder::new(session.clone()).respond(recall, false).unwrap();
        assert_eq!(mock.response_for(token), Some(Response::Abort(libc::EIO)));
        assert_eq!(mock.response_count(token), 1);
    }

    #[test]
    fn test_dropped_descriptor_aborts_once() {
        let (mock, session, fuid) = setup();
        let recall = pending(&mock, &session, fuid, RecallKind::Read);
        let token = recall.token();
        drop(recall);
        assert_eq!(mock.response_for(token), Some(Response::Abort(libc::EIO)));
        assert_eq!(mock.response_count(token), 1);
    }

    #[test]
    fn test_descriptor_opens_file() {
        let (mock, session, fuid) = setup();
        let recall = pending(&mock, &session, fuid, RecallKind::Read);
        let mut buf = [0u8; 3];
        recall.file().unwrap().read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        RecallResponder::new(session).respond(recall, true).unwrap();
    }
}
