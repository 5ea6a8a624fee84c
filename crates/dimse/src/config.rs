//! Configuration types for the DIMSE connector

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which Query/Retrieve information models and DIMSE services a peer supports.
///
/// These flags mirror what an administrator knows about the remote node. The
/// connector uses them to pick the information model for each operation and
/// refuses operations the peer cannot serve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub patient_root_find: bool,
    #[serde(default)]
    pub patient_root_get: bool,
    #[serde(default)]
    pub patient_root_move: bool,
    #[serde(default)]
    pub study_root_find: bool,
    #[serde(default)]
    pub study_root_get: bool,
    #[serde(default)]
    pub study_root_move: bool,
    #[serde(default)]
    pub store_scp: bool,
}

impl Capabilities {
    /// Full Query/Retrieve and Storage support, useful in tests and for
    /// well-behaved archives like Orthanc.
    pub fn all() -> Self {
        Self {
            patient_root_find: true,
            patient_root_get: true,
            patient_root_move: true,
            study_root_find: true,
            study_root_get: true,
            study_root_move: true,
            store_scp: true,
        }
    }

    pub fn supports_find(&self) -> bool {
        self.patient_root_find || self.study_root_find
    }

    pub fn supports_get(&self) -> bool {
        self.patient_root_get || self.study_root_get
    }

    pub fn supports_move(&self) -> bool {
        self.patient_root_move || self.study_root_move
    }
}

/// A remote DICOM server the connector can associate with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerNode {
    /// Remote Application Entity Title
    pub ae_title: String,

    /// Remote host address
    pub host: String,

    /// Remote port
    pub port: u16,

    /// Supported services of the peer
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl ServerNode {
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            capabilities: Capabilities::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Socket address string used for association establishment
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate the remote node configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.ae_title.is_empty() || self.ae_title.len() > 16 {
            return Err(crate::DimseError::config(
                "Remote AE title must be 1-16 characters",
            ));
        }

        if self.host.is_empty() {
            return Err(crate::DimseError::config("Remote host cannot be empty"));
        }

        if self.port == 0 {
            return Err(crate::DimseError::config(
                "Remote port must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Display for ServerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.ae_title, self.host, self.port)
    }
}

/// Configuration of the connector itself (the calling AE)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Local Application Entity Title
    #[serde(default = "default_calling_aet")]
    pub calling_aet: String,

    /// How often a failed association attempt is retried
    #[serde(default = "default_connection_retries")]
    pub connection_retries: u32,

    /// Fixed pause between association attempts in seconds
    #[serde(default = "default_retry_timeout")]
    pub retry_timeout_secs: u64,

    /// Timeout for establishing the TCP connection in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Timeout for a single DIMSE message exchange in seconds
    #[serde(default = "default_dimse_timeout")]
    pub dimse_timeout_secs: u64,

    /// Maximum PDU size in bytes
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            calling_aet: default_calling_aet(),
            connection_retries: default_connection_retries(),
            retry_timeout_secs: default_retry_timeout(),
            connection_timeout_secs: default_connection_timeout(),
            dimse_timeout_secs: default_dimse_timeout(),
            max_pdu: default_max_pdu(),
        }
    }
}

impl ConnectorConfig {
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_secs(self.retry_timeout_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn dimse_timeout(&self) -> Duration {
        Duration::from_secs(self.dimse_timeout_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.calling_aet.is_empty() || self.calling_aet.len() > 16 {
            return Err(crate::DimseError::config(
                "Calling AE title must be 1-16 characters",
            ));
        }

        if self.max_pdu < 16384 || self.max_pdu > 131072 {
            return Err(crate::DimseError::config(
                "Max PDU size must be between 16384 and 131072 bytes",
            ));
        }

        Ok(())
    }
}

// Default value functions
fn default_calling_aet() -> String {
    "CONVOY".to_string()
}

fn default_connection_retries() -> u32 {
    2
}

fn default_retry_timeout() -> u64 {
    30
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_dimse_timeout() -> u64 {
    60
}

fn default_max_pdu() -> u32 {
    16384
}
