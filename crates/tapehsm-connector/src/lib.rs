//! TapeHSM connector: DMAPI event engine, transparent recall and migration
//! state tracking.

pub mod attr;
pub mod buffer;
pub mod config;
pub mod connector;
pub mod dispatch;
pub mod dm;
pub mod error;
pub mod fsobj;
pub mod handle;
pub mod info;
#[cfg(any(test, feature = "xfs-dmapi"))]
#[cfg_attr(not(feature = "xfs-dmapi"), allow(dead_code))]
mod layout;
pub mod locking;
pub mod mock;
pub mod recall;
pub mod recovery;
pub mod retry;
pub mod session;
#[cfg(feature = "xfs-dmapi")]
pub mod sys;

pub use config::ConnectorConfig;
pub use connector::{Connector, DispatchStats, EventLoopHandle, RecallEventLoop};
pub use dispatch::{DispatchedEvent, EventDispatcher};
pub use dm::{DmApi, DmError};
pub use error::{ConnectorError, Result};
pub use fsobj::{FileLock, FileObject, MigrationState};
pub use handle::FileIdentity;
pub use info::{FileInfo, PoolInfo};
pub use recall::{RecallDescriptor, RecallKind, RecallResponder};
pub use session::{CleanupReport, Session, SessionManager};
