use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};

/// The one protocol version this implementation speaks.
pub const PROTOCOL_VERSION: &str = "1";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Directory holding received resources and in-flight partial payloads
    pub data_dir: PathBuf,

    /// Service identifier; only peers using the same id can find each other
    pub service_id: String,

    /// Name announced to peers
    pub device_name: String,

    /// Port to listen on for incoming sessions
    pub listen_port: u16,

    /// Version payload accepted by the receiver
    pub supported_version: String,

    /// How long the receiver waits for the application's consent
    pub accept_timeout_secs: u64,

    /// Reply `tid.deny` when the consent window expires instead of going quiet
    pub deny_on_accept_timeout: bool,

    /// How long the sender browses for a peer before giving up
    pub discovery_timeout_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            data_dir: std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".p2pconnect"),
            service_id: "p2pconnect".to_string(),
            device_name: "".to_string(),
            listen_port: 9876,
            supported_version: PROTOCOL_VERSION.to_string(),
            accept_timeout_secs: 30,
            deny_on_accept_timeout: true,
            discovery_timeout_secs: 5,
        }
    }
}

impl TransferConfig {
    pub fn with_service(mut self, service_id: String, device_name: String) -> Self {
        self.service_id = service_id;
        self.device_name = device_name;
        self
    }

    pub fn with_data_dir(mut self, data_dir: PathBuf) -> Self {
        self.data_dir = data_dir;
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout_secs = timeout.as_secs();
        self
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.accept_timeout_secs)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    /// Final location of received resources.
    pub fn incoming_dir(&self) -> PathBuf {
        self.data_dir.join("incoming")
    }

    /// Where the transport writes payloads that are still arriving.
    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    pub fn ensure_data_dir(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.incoming_dir())?;
        std::fs::create_dir_all(self.staging_dir())?;
        Ok(())
    }
}

/// Check a service id against the rules shared by every supported platform:
/// 1-15 characters of lowercase ASCII letters, digits and hyphens, at least
/// one letter, no hyphen at either end and no two hyphens in a row.
pub fn validate_service_id(service_id: &str) -> Result<(), String> {
    if service_id.is_empty() || service_id.len() > 15 {
        return Err(format!("service id must be 1-15 characters, got {}", service_id.len()));
    }
    if let Some(c) = service_id
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(format!("invalid character {:?} in service id", c));
    }
    if !service_id.chars().any(|c| c.is_ascii_lowercase()) {
        return Err("service id must contain at least one letter".into());
    }
    if service_id.starts_with('-') || service_id.ends_with('-') {
        return Err("service id must not begin or end with a hyphen".into());
    }
    if service_id.contains("--") {
        return Err("service id must not contain adjacent hyphens".into());
    }
    Ok(())
}
