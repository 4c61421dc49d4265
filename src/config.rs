//! Configuration Module
//!
//! Centralized configuration for the push-management core: the PKI
//! root directory, per-group certificate-type support, the rejected-list
//! bound, and the Session Janitor's tick interval.

use crate::types::{CertificateTypeId, GroupId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Certificate-store configuration.
    pub store: StoreConfig,

    /// Session Janitor configuration.
    pub janitor: JanitorConfig,

    /// Per-group configuration, keyed by group tag.
    pub groups: Vec<GroupConfig>,

    /// Open Question (a): whether verification against an empty trust
    /// state accepts the candidate (`spec.md` §4.2 point 2, `SPEC_FULL.md` §4).
    pub accept_when_store_empty: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            janitor: JanitorConfig::default(),
            groups: vec![
                GroupConfig::new(GroupId::Application, vec![CertificateTypeId::RsaMin, CertificateTypeId::RsaSha256]),
                GroupConfig::new(GroupId::UserToken, vec![CertificateTypeId::RsaMin, CertificateTypeId::RsaSha256]),
            ],
            accept_when_store_empty: true,
        }
    }
}

/// Certificate-store configuration (`spec.md` §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory; each group's store lives under `<pki_root>/pki/<groupTag>/`.
    pub pki_root: PathBuf,

    /// Bound on the rejected list before FIFO eviction applies (0 = unbounded).
    pub max_rejected_list_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            pki_root: PathBuf::from("./gds-pki"),
            max_rejected_list_size: 256,
        }
    }
}

/// Session Janitor configuration (`spec.md` §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorConfig {
    /// Tick interval in seconds; `spec.md` §4.6 specifies "every ~10 seconds".
    pub tick_interval_secs: u64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
        }
    }
}

/// Per-group configuration: which certificate types a group accepts,
/// feeding the `CertificateTypes` information-model variable (`spec.md` §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub group: GroupId,
    pub supported_types: Vec<CertificateTypeId>,
}

impl GroupConfig {
    /// Construct a group configuration.
    pub fn new(group: GroupId, supported_types: Vec<CertificateTypeId>) -> Self {
        Self {
            group,
            supported_types,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &PathBuf) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.janitor.tick_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "janitor tick interval must be greater than zero".to_string(),
            ));
        }

        if self.groups.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "at least one certificate group must be configured".to_string(),
            ));
        }

        for group in &self.groups {
            if group.supported_types.is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "group {} supports no certificate types",
                    group.group
                )));
            }
        }

        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("serialize error: {0}")]
    SerializeError(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
