//! The migration engine's entry point.
//!
//! [`Connector`] initializes the data-management service, optionally reclaims
//! stale sessions, and opens the engine's session. [`RecallEventLoop`] runs
//! the blocking dispatcher on a tokio blocking thread and forwards recall
//! descriptors to the recall engine over a bounded channel.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ConnectorConfig;
use crate::dispatch::{DispatchedEvent, EventDispatcher};
use crate::dm::DmApi;
use crate::error::{ConnectorError, Result};
use crate::fsobj::FileObject;
use crate::handle::FileIdentity;
use crate::recall::{RecallDescriptor, RecallResponder};
use crate::recovery::{self, RecoveryReport};
use crate::session::{CleanupReport, Session, SessionManager};

/// Connection of the migration engine to the kernel.
pub struct Connector {
    session: Arc<Session>,
    terminate: Arc<AtomicBool>,
    cleanup: Option<CleanupReport>,
    service_version: String,
}

impl Connector {
    /// Initializes the service and opens the session. With `cleanup_on_start`
    /// stale sessions are reclaimed first.
    pub fn new(config: ConnectorConfig, dm: Arc<dyn DmApi>) -> Result<Self> {
        config.validate()?;

        let service_version = dm.init_service().map_err(|e| ConnectorError::Session {
            reason: format!("dm_init_service: {}", e),
        })?;
        info!(version = %service_version, "data management service initialized");

        let (session, cleanup) = SessionManager::new(dm, config).establish()?;
        if let Some(report) = &cleanup {
            info!(
                destroyed = report.destroyed.len(),
                failed = report.failed.len(),
                "stale session cleanup done"
            );
        }

        Ok(Self {
            session,
            terminate: Arc::new(AtomicBool::new(false)),
            cleanup,
            service_version,
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn service_version(&self) -> &str {
        &self.service_version
    }

    pub fn cleanup_report(&self) -> Option<&CleanupReport> {
        self.cleanup.as_ref()
    }

    /// Recovers dispositions and registers for mount events. Call once before
    /// the event loop starts.
    pub fn init_trans_recalls(&self) -> Result<RecoveryReport> {
        recovery::init_trans_recalls(&self.session)
    }

    pub fn dispatcher(&self) -> EventDispatcher {
        EventDispatcher::new(self.session.clone(), self.terminate.clone())
    }

    pub fn responder(&self) -> RecallResponder {
        RecallResponder::new(self.session.clone())
    }

    pub fn respond_recall(&self, recall: RecallDescriptor, success: bool) -> Result<()> {
        self.responder().respond(recall, success)
    }

    pub fn file(&self, path: &Path) -> Result<FileObject<'static>> {
        FileObject::from_path(self.session.clone(), path)
    }

    pub fn file_by_identity(&self, fuid: FileIdentity) -> Result<FileObject<'static>> {
        FileObject::from_identity(self.session.clone(), fuid)
    }

    /// Raises the terminate flag and wakes the dispatcher with the
    /// termination message. Failure to send the message is only logged.
    pub fn terminate(&self) {
        let msg = self.session.config().termination_message.clone();
        self.terminate.store(true, Ordering::SeqCst);
        if let Err(e) = self.session.send_message(msg.as_bytes()) {
            error!("sending termination message failed: {}", e);
        }
    }

    pub fn is_terminating(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    /// Tears the session down now instead of when the last reference drops.
    pub fn shutdown(&self) -> Result<()> {
        self.session.shutdown()
    }

    /// Starts the event loop; recalls arrive on the returned receiver.
    pub fn start_event_loop(&self) -> (mpsc::Receiver<RecallDescriptor>, EventLoopHandle) {
        RecallEventLoop::start(
            self.dispatcher(),
            self.session.config().recall_channel_capacity,
        )
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("session", &self.session)
            .field("terminating", &self.is_terminating())
            .finish()
    }
}

/// Counters published by the event loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub mounts: u64,
    /// Mounts whose filesystem could not be marked managed.
    pub failed_mounts: u64,
    pub recalls: u64,
    pub control_messages: u64,
    pub ignored: u64,
}

/// Handle to a running event loop.
pub struct EventLoopHandle {
    stats: watch::Receiver<DispatchStats>,
    task: JoinHandle<Result<DispatchStats>>,
}

impl EventLoopHandle {
    /// Snapshot of the current counters.
    pub fn stats(&self) -> DispatchStats {
        self.stats.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DispatchStats> {
        self.stats.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the loop to end and returns its final counters.
    pub async fn join(self) -> Result<DispatchStats> {
        self.task
            .await
            .map_err(|e| ConnectorError::Io(std::io::Error::other(e.to_string())))?
    }
}

/// Drives an [`EventDispatcher`] until termination.
pub struct RecallEventLoop;

impl RecallEventLoop {
    /// Spawns the loop on the blocking pool. It ends at the first control
    /// message seen after termination was requested, when the receiver is
    /// dropped, or on a retrieval error.
    pub fn start(
        dispatcher: EventDispatcher,
        capacity: usize,
    ) -> (mpsc::Receiver<RecallDescriptor>, EventLoopHandle) {
        let (recall_tx, recall_rx) = mpsc::channel(capacity.max(1));
        let (stats_tx, stats_rx) = watch::channel(DispatchStats::default());

        let task = tokio::task::spawn_blocking(move || Self::run(dispatcher, recall_tx, stats_tx));

        (
            recall_rx,
            EventLoopHandle {
                stats: stats_rx,
                task,
            },
        )
    }

    fn run(
        dispatcher: EventDispatcher,
        recalls: mpsc::Sender<RecallDescriptor>,
        stats_tx: watch::Sender<DispatchStats>,
    ) -> Result<DispatchStats> {
        let mut stats = DispatchStats::default();
        info!("event loop started");

        loop {
            let event = match dispatcher.next_event() {
                Ok(event) => event,
                Err(e) => {
                    error!("event retrieval failed, stopping: {}", e);
                    return Err(e);
                }
            };

            let mut receiver_gone = false;
            let mut control = false;
            match event {
                DispatchedEvent::Mount { managed, .. } => {
                    stats.mounts += 1;
                    if !managed {
                        stats.failed_mounts += 1;
                    }
                }
                DispatchedEvent::Recall(recall) => {
                    stats.recalls += 1;
                    if recalls.blocking_send(recall).is_err() {
                        warn!("recall receiver dropped, stopping");
                        receiver_gone = true;
                    }
                }
                DispatchedEvent::Control(_) => {
                    stats.control_messages += 1;
                    control = true;
                }
                DispatchedEvent::Ignored(_) => stats.ignored += 1,
            }
            stats_tx.send_replace(stats.clone());

            if receiver_gone {
                break;
            }
            if control && dispatcher.is_terminating() {
                info!("termination requested, event loop stopping");
                break;
            }
        }

        Ok(stats)
    }
}
