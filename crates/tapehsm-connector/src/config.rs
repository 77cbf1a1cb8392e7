use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ConnectorError, Result};
use crate::retry::RetryPolicy;

/// Connector settings. Missing keys in a configuration file take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Well-known kernel session name; stale sessions carrying it are reclaimed.
    pub session_name: String,
    /// Message sent on the engine's own session to stop the dispatcher.
    pub termination_message: String,
    pub cleanup_on_start: bool,
    /// Retry policy for persisting the managed flag after a mount.
    pub mount_retry: RetryPolicy,
    /// Initial capacity of the session id buffer.
    pub session_buffer: usize,
    /// Initial capacity of the token buffer.
    pub token_buffer: usize,
    /// Initial capacity of the disposition buffer.
    pub disposition_buffer: usize,
    /// Initial mount-info buffer length in bytes.
    pub mountinfo_buffer: usize,
    /// Initial capacity of the region buffer.
    pub region_buffer: usize,
    pub recall_channel_capacity: usize,
    /// Send SIGTERM to this process when the session cannot be torn down.
    pub terminate_on_teardown_failure: bool,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            session_name: String::from("tapehsm"),
            termination_message: String::from("terminate"),
            cleanup_on_start: false,
            mount_retry: RetryPolicy::default(),
            session_buffer: 16,
            token_buffer: 1024,
            disposition_buffer: 64,
            mountinfo_buffer: 4096,
            region_buffer: 2,
            recall_channel_capacity: 1024,
            terminate_on_teardown_failure: true,
        }
    }
}

impl ConnectorConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ConnectorConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| ConnectorError::Config {
                reason: format!("{}: {}", path.display(), e),
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| ConnectorError::Config {
                reason: format!("{}: {}", path.display(), e),
            })?,
            _ => {
                return Err(ConnectorError::Config {
                    reason: format!("unsupported config file extension: {}", ext),
                })
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |reason: &str| {
            Err(ConnectorError::Config {
                reason: reason.to_string(),
            })
        };

        if self.session_name.is_empty() {
            return fail("session_name must not be empty");
        }
        if self.termination_message.is_empty() {
            return fail("termination_message must not be empty");
        }
        if self.mount_retry.max_attempts == 0 {
            return fail("mount_retry.max_attempts must be positive");
        }
        let buffers = [
            ("session_buffer", self.session_buffer),
            ("token_buffer", self.token_buffer),
            ("disposition_buffer", self.disposition_buffer),
            ("mountinfo_buffer", self.mountinfo_buffer),
            ("region_buffer", self.region_buffer),
            ("recall_channel_capacity", self.recall_channel_capacity),
        ];
        for (name, size) in buffers {
            if size == 0 {
                return Err(ConnectorError::Config {
                    reason: format!("{} must be positive", name),
                });
            }
        }
        Ok(())
    }
}
