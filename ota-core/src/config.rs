/// Configuration structures that can be tested independently
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{OtaError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OtaConfig {
    // Server identity
    pub server_host: String,
    pub server_port: u16,
    pub root_ca_cert_pem: String,
    pub pinned_peer_cert_pem: String,

    // Resources on the server
    pub metadata_path: String,
    /// Overwritten by the FILE= entry of the metadata
    #[serde(default)]
    pub firmware_path: String,

    // Scheduling
    /// 0 disables periodic checks; overwritten by INTERVAL=
    pub polling_interval_seconds: u32,
    pub auto_reboot: bool,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            server_host: String::new(),
            server_port: 443,
            root_ca_cert_pem: String::new(),
            pinned_peer_cert_pem: String::new(),
            metadata_path: "/ota.txt".to_string(),
            firmware_path: String::new(),
            polling_interval_seconds: 3600,
            auto_reboot: true,
        }
    }
}

impl OtaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.server_host.trim().is_empty() {
            return Err(OtaError::invalid("server host missing"));
        }
        if self.server_port == 0 {
            return Err(OtaError::invalid("server port must be 1-65535"));
        }
        if self.root_ca_cert_pem.trim().is_empty() {
            return Err(OtaError::invalid("root CA certificate missing"));
        }
        if self.pinned_peer_cert_pem.trim().is_empty() {
            return Err(OtaError::invalid("pinned peer certificate missing"));
        }
        if !self.metadata_path.starts_with('/') {
            return Err(OtaError::invalid(format!(
                "metadata path must be absolute: '{}'",
                self.metadata_path
            )));
        }
        Ok(())
    }

    /// Period of the next automatic check, None when polling is disabled
    pub fn polling_period(&self) -> Option<Duration> {
        match self.polling_interval_seconds {
            0 => None,
            s => Some(Duration::from_secs(u64::from(s))),
        }
    }
}

/// Tuning knobs that are not part of the persisted record
#[derive(Debug, Clone, PartialEq)]
pub struct UpdaterOptions {
    /// Wait after the first connectivity before the first cycle
    pub startup_delay: Duration,
    pub reboot_delay: Duration,
    /// Upper bound on a transport operation that keeps asking to be retried
    pub io_timeout: Duration,
    pub metadata_buffer_size: usize,
    pub firmware_buffer_size: usize,
}

impl Default for UpdaterOptions {
    fn default() -> Self {
        Self {
            startup_delay: Duration::from_secs(5),
            reboot_delay: Duration::from_secs(2),
            io_timeout: Duration::from_secs(30),
            metadata_buffer_size: 512,
            firmware_buffer_size: 4096,
        }
    }
}
