//! Shared fixtures for the engine integration tests.

use std::path::Path;
use std::sync::Arc;

use tapehsm_connector::mock::MockDmApi;
use tapehsm_connector::retry::RetryPolicy;
use tapehsm_connector::{Connector, ConnectorConfig, FileIdentity};

pub const FSID: u64 = 7;
pub const MOUNT_POINT: &str = "/archive";
pub const PAYLOAD: &[u8] = b"tape payload for the recall path";

/// Configuration that never signals the test process and retries fast.
pub fn test_config() -> ConnectorConfig {
    ConnectorConfig {
        mount_retry: RetryPolicy {
            max_attempts: 4,
            delay_ms: 1,
        },
        terminate_on_teardown_failure: false,
        ..ConnectorConfig::default()
    }
}

/// A kernel with one mounted filesystem and one regular file.
pub struct Fixture {
    pub mock: Arc<MockDmApi>,
    pub fuid: FileIdentity,
}

impl Fixture {
    pub fn new() -> Self {
        let mock = Arc::new(MockDmApi::new());
        mock.add_filesystem(FSID, MOUNT_POINT, "/dev/sdt1");
        let fuid = mock.add_file(FSID, Self::file_path(), PAYLOAD);
        Self { mock, fuid }
    }

    pub fn file_path() -> &'static Path {
        Path::new("/archive/data.bin")
    }

    pub fn connector(&self) -> Connector {
        Connector::new(test_config(), self.mock.clone()).unwrap()
    }
}
