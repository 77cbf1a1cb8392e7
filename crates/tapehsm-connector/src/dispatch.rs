//! Event retrieval and classification.
//!
//! [`EventDispatcher::next_event`] blocks for one kernel event and turns it
//! into a [`DispatchedEvent`]. Mount events are handled in place: the
//! filesystem gets the data-event disposition, the mount is let through, and
//! the managed flag is persisted on the filesystem root under the configured
//! retry policy. Data events become recall descriptors for an external recall
//! engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use crate::dm::{DataEvent, DispTarget, DmError, EventMessage, EventPayload, EventSet, EventType, MountEvent, Response, Token};
use crate::error::{ConnectorError, Result};
use crate::fsobj::FileObject;
use crate::recall::{RecallDescriptor, RecallKind};
use crate::session::Session;

/// One classified kernel event.
#[derive(Debug)]
pub enum DispatchedEvent {
    /// A filesystem was mounted; `managed` tells whether it is now managed.
    Mount {
        mount_point: String,
        device: String,
        managed: bool,
    },
    /// An access is blocked until the file is recalled.
    Recall(RecallDescriptor),
    /// A user message on the engine's own session.
    Control(String),
    Ignored(EventType),
}

/// Serial event retrieval on one session.
pub struct EventDispatcher {
    session: Arc<Session>,
    terminate: Arc<AtomicBool>,
}

impl EventDispatcher {
    pub fn new(session: Arc<Session>, terminate: Arc<AtomicBool>) -> Self {
        Self { session, terminate }
    }

    /// True once termination was requested.
    pub fn is_terminating(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    /// Blocks for the next event and classifies it. Interrupted retrievals
    /// are repeated.
    pub fn next_event(&self) -> Result<DispatchedEvent> {
        let sid = self.session.sid();
        let msg = loop {
            match self.session.dm().get_events(sid) {
                Ok(msg) => break msg,
                Err(DmError::Interrupted) => trace!(%sid, "event retrieval interrupted"),
                Err(e) => return Err(ConnectorError::dm("dm_get_events", e)),
            }
        };
        trace!(event = ?msg.event, token = %msg.token, "event");
        self.classify(msg)
    }

    fn classify(&self, msg: EventMessage) -> Result<DispatchedEvent> {
        let EventMessage {
            event,
            token,
            payload,
        } = msg;

        match (event, payload) {
            (EventType::Mount, EventPayload::Mount(mount)) => Ok(self.handle_mount(token, mount)),
            (EventType::Read | EventType::Write | EventType::Truncate, EventPayload::Data(data)) => {
                Ok(self.handle_data(event, token, data))
            }
            (EventType::User, EventPayload::User(bytes)) => {
                let text = String::from_utf8_lossy(&bytes)
                    .trim_end_matches('\0')
                    .to_string();
                info!(message = %text, "user message");
                if !token.is_none() {
                    self.acknowledge(token);
                }
                Ok(DispatchedEvent::Control(text))
            }
            (other, _) => {
                debug!(event = ?other, "ignoring event");
                if !token.is_none() {
                    self.acknowledge(token);
                }
                Ok(DispatchedEvent::Ignored(other))
            }
        }
    }

    fn acknowledge(&self, token: Token) {
        if let Err(e) = self.session.respond(token, Response::Continue) {
            warn!(%token, "acknowledging event failed: {}", e);
        }
    }

    fn handle_mount(&self, token: Token, mount: MountEvent) -> DispatchedEvent {
        info!(mount_point = %mount.mount_point, device = %mount.device, "mount event");

        let dispo = self
            .session
            .dm()
            .set_disp(
                self.session.sid(),
                DispTarget::Filesystem(&mount.fs_handle),
                EventSet::data_events(),
            )
            .map_err(|e| ConnectorError::dm("dm_set_disp", e));
        self.acknowledge(token);

        if let Err(e) = dispo {
            error!(mount_point = %mount.mount_point, "installing disposition failed: {}", e);
            return DispatchedEvent::Mount {
                mount_point: mount.mount_point,
                device: mount.device,
                managed: false,
            };
        }

        let policy = self.session.config().mount_retry;
        let managed = policy.run(|attempt| {
            if attempt > 0 {
                debug!(attempt, mount_point = %mount.mount_point, "retrying managed flag");
            }
            FileObject::borrowed(self.session.clone(), &mount.root_handle).mark_filesystem_managed(false)
        });

        let managed = match managed {
            Ok(()) => true,
            Err(exhausted) => {
                let err = ConnectorError::RetriesExhausted {
                    attempts: exhausted.attempts,
                    last: exhausted.last.to_string(),
                };
                error!(mount_point = %mount.mount_point, "filesystem left unmanaged: {}", err);
                false
            }
        };

        DispatchedEvent::Mount {
            mount_point: mount.mount_point,
            device: mount.device,
            managed,
        }
    }

    fn handle_data(&self, event: EventType, token: Token, data: DataEvent) -> DispatchedEvent {
        let kind = match RecallKind::from_event(event) {
            Some(kind) => kind,
            None => return DispatchedEvent::Ignored(event),
        };

        let fuid = match self.session.dm().handle_to_identity(&data.handle) {
            Ok(fuid) => fuid,
            Err(e) => {
                error!(?event, %token, "cannot resolve accessed file: {}", e);
                if let Err(r) = self.session.respond(token, Response::Abort(libc::EIO)) {
                    warn!(%token, "aborting unresolvable access failed: {}", r);
                }
                return DispatchedEvent::Ignored(event);
            }
        };

        debug!(%fuid, ?kind, %token, offset = data.offset, length = data.length, "recall requested");
        DispatchedEvent::Recall(RecallDescriptor::new(
            self.session.clone(),
            token,
            fuid,
            kind,
        ))
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("sid", &self.session.sid())
            .field("terminating", &self.is_terminating())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectorConfig;
    use crate::dm::DmApi;
    use crate::mock::MockDmApi;
    use crate::recall::RecallResponder;
    use crate::retry::RetryPolicy;
    use crate::session::SessionManager;

    fn setup() -> (Arc<MockDmApi>, EventDispatcher, Arc<Session>) {
        let mock = Arc::new(MockDmApi::new());
        mock.add_filesystem(5, "/tape", "/dev/sdc1");
        let config = ConnectorConfig {
            mount_retry: RetryPolicy {
                max_attempts: 4,
                delay_ms: 1,
            },
            terminate_on_teardown_failure: false,
            ..ConnectorConfig::default()
        };
        let session = SessionManager::new(mock.clone(), config).open(None).unwrap();
        let dispatcher = EventDispatcher::new(session.clone(), Arc::new(AtomicBool::new(false)));
        (mock, dispatcher, session)
    }

    #[test]
    fn test_mount_claims_and_marks_managed() {
        let (mock, dispatcher, session) = setup();
        let token = mock.post_mount(5);

        match dispatcher.next_event().unwrap() {
            DispatchedEvent::Mount {
                mount_point,
                managed,
                ..
            } => {
                assert_eq!(mount_point, "/tape");
                assert!(managed);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(mock.response_for(token), Some(Response::Continue));
        assert_eq!(mock.dispositions(session.sid())[0].events, EventSet::data_events());
        let root = mock.root_identity(5).unwrap();
        assert!(mock.attribute(root, crate::attr::FS_ATTR_NAME).is_some());
    }

    #[test]
    fn test_mount_retries_exhausted_keeps_running() {
        let (mock, dispatcher, _session) = setup();
        mock.fail_set_dmattr(4);
        let token = mock.post_mount(5);
        match dispatcher.next_event().unwrap() {
            DispatchedEvent::Mount { managed, .. } => assert!(!managed),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(mock.response_for(token), Some(Response::Continue));

        mock.post_other(EventType::Create);
        assert!(matches!(
            dispatcher.next_event().unwrap(),
            DispatchedEvent::Ignored(EventType::Create)
        ));
    }

    #[test]
    fn test_mount_succeeds_on_last_retry() {
        let (mock, dispatcher, _session) = setup();
        mock.fail_set_dmattr(3);
        mock.post_mount(5);
        match dispatcher.next_event().unwrap() {
            DispatchedEvent::Mount { managed, .. } => assert!(managed),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_data_events_become_recalls() {
        let (mock, dispatcher, session) = setup();
        let fuid = mock.add_file(5, "/tape/f", b"zz");
        let responder = RecallResponder::new(session.clone());

        for (event, kind) in [
            (EventType::Read, RecallKind::Read),
            (EventType::Write, RecallKind::Write),
            (EventType::Truncate, RecallKind::Write),
        ] {
            let token = mock.post_data_event(event, fuid, 0, 2);
            match dispatcher.next_event().unwrap() {
                DispatchedEvent::Recall(recall) => {
                    assert_eq!(recall.fuid(), fuid);
                    assert_eq!(recall.kind(), kind);
                    assert_eq!(recall.token(), token);
                    responder.respond(recall, true).unwrap();
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_interrupts_are_retried() {
        let (mock, dispatcher, _session) = setup();
        mock.interrupt_next(3);
        mock.post_other(EventType::Close);
        assert!(matches!(
            dispatcher.next_event().unwrap(),
            DispatchedEvent::Ignored(EventType::Close)
        ));
    }

    #[test]
    fn test_hard_retrieval_error_surfaces() {
        let (mock, dispatcher, _session) = setup();
        mock.fail_get_events(DmError::Os(libc::EFAULT));
        let err = dispatcher.next_event().unwrap_err();
        assert_eq!(err.dm_error(), Some(&DmError::Os(libc::EFAULT)));
    }

    #[test]
    fn test_user_message_is_control() {
        let (mock, dispatcher, session) = setup();
        mock.send_msg(session.sid(), b"terminate\0").unwrap();
        match dispatcher.next_event().unwrap() {
            DispatchedEvent::Control(text) => assert_eq!(text, "terminate"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unresolvable_access_is_aborted() {
        let (mock, dispatcher, _session) = setup();
        let ghost = crate::handle::FileIdentity::new(0, 5, 1, 4242);
        let token = mock.post_data_event(EventType::Read, ghost, 0, 1);
        assert!(matches!(
            dispatcher.next_event().unwrap(),
            DispatchedEvent::Ignored(EventType::Read)
        ));
        assert_eq!(mock.response_for(token), Some(Response::Abort(libc::EIO)));
    }

    #[test]
    fn test_ignored_event_is_acknowledged() {
        let (mock, dispatcher, _session) = setup();
        let token = mock.post_other(EventType::Destroy);
        dispatcher.next_event().unwrap();
        assert_eq!(mock.response_for(token), Some(Response::Continue));
    }
}
