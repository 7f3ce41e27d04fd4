//! Session configuration.
//!
//! Configuration is plain data, serializable with serde so it can live in
//! a JSON file next to the application:
//!
//! ```json
//! {
//!   "max_chunk_size": 244,
//!   "response_timeout_ms": 5000,
//!   "gatt": { "ccid_service": "7f20a000-b6e2-4a1c-9b4f-2c5e8d1f0a01" }
//! }
//! ```
//!
//! Omitted fields take their defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use blescard_core::{
    Error, Result,
    constants::{
        DEFAULT_CCID_PC_TO_RDR, DEFAULT_CCID_RDR_TO_PC, DEFAULT_CCID_SECURED_SERVICE,
        DEFAULT_CCID_SERVICE, DEFAULT_CCID_STATUS, DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MAX_FRAME_SIZE,
        HEADER_SIZE,
    },
};

use crate::state::DEFAULT_HISTORY_SIZE;

/// Vendor GATT identifiers of the CCID service.
///
/// The device information and battery attributes use SIG-assigned
/// identifiers and are not configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GattProfile {
    pub ccid_service: Uuid,
    /// Variant of the service that requires a bonded link.
    pub ccid_secured_service: Uuid,
    /// Slot status bitmap (read + notify).
    pub ccid_status: Uuid,
    /// Host-to-reader characteristic (write).
    pub pc_to_rdr: Uuid,
    /// Reader-to-host characteristic (notify).
    pub rdr_to_pc: Uuid,
}

impl Default for GattProfile {
    fn default() -> Self {
        Self {
            ccid_service: DEFAULT_CCID_SERVICE,
            ccid_secured_service: DEFAULT_CCID_SECURED_SERVICE,
            ccid_status: DEFAULT_CCID_STATUS,
            pc_to_rdr: DEFAULT_CCID_PC_TO_RDR,
            rdr_to_pc: DEFAULT_CCID_RDR_TO_PC,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Largest single transport write.
    pub max_chunk_size: usize,

    /// Deadline for a command response. `None` waits forever.
    pub response_timeout_ms: Option<u64>,

    /// Hard cap on a declared response length.
    pub max_frame_size: usize,

    /// Number of state transitions kept for diagnostics.
    pub history_size: usize,

    pub gatt: GattProfile,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            response_timeout_ms: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            history_size: DEFAULT_HISTORY_SIZE,
            gatt: GattProfile::default(),
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Parse and validate a JSON configuration.
    ///
    /// # Errors
    /// Returns `Error::Config` if the JSON is malformed or a value is invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SessionConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms.map(Duration::from_millis)
    }

    /// # Errors
    /// Returns `Error::Config` for a zero chunk size, a zero timeout, or a
    /// frame cap smaller than a CCID header.
    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_size == 0 {
            return Err(Error::Config("max_chunk_size must be positive".to_string()));
        }
        if self.max_frame_size < HEADER_SIZE {
            return Err(Error::Config(format!(
                "max_frame_size must be at least {HEADER_SIZE}, got {}",
                self.max_frame_size
            )));
        }
        if self.response_timeout_ms == Some(0) {
            return Err(Error::Config(
                "response_timeout_ms must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`SessionConfig`].
///
/// # Examples
///
/// ```
/// use blescard_session::SessionConfig;
/// use std::time::Duration;
///
/// let config = SessionConfig::builder()
///     .with_max_chunk_size(244)
///     .with_response_timeout(Duration::from_secs(5))
///     .build()
///     .unwrap();
///
/// assert_eq!(config.max_chunk_size, 244);
/// assert_eq!(config.response_timeout(), Some(Duration::from_secs(5)));
/// ```
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.config.max_chunk_size = size;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout_ms =
            Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn with_history_size(mut self, size: usize) -> Self {
        self.config.history_size = size;
        self
    }

    pub fn with_gatt_profile(mut self, gatt: GattProfile) -> Self {
        self.config.gatt = gatt;
        self
    }

    /// # Errors
    /// See [`SessionConfig::validate`].
    pub fn build(self) -> Result<SessionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
