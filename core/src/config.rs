//! Card configuration loading
//!
//! Loads configuration from `~/.config/bizcard/bizcard.toml` (or the path in
//! `BIZCARD_CONFIG`). A missing file means defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::ConfigError;

/// Root configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct CardConfig {
    /// Durable store settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Tag emulation settings
    #[serde(default)]
    pub tag: TagConfig,

    /// Remote protocol settings
    #[serde(default)]
    pub service: ServiceConfig,
}

/// Durable store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding one file per stored key
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,
}

fn default_storage_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("bizcard").join("settings"))
        .unwrap_or_else(|| PathBuf::from("bizcard-settings"))
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
        }
    }
}

/// Tag emulation configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TagConfig {
    /// File the host emulator publishes the live payload to
    #[serde(default = "default_payload_path")]
    pub payload_path: PathBuf,
}

fn default_payload_path() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("bizcard").join("tag.ndef"))
        .unwrap_or_else(|| PathBuf::from("bizcard-tag.ndef"))
}

impl Default for TagConfig {
    fn default() -> Self {
        Self {
            payload_path: default_payload_path(),
        }
    }
}

/// Remote protocol configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Socket path; `None` resolves to the runtime directory
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// Reject reads and writes on links that are not encrypted
    #[serde(default = "default_require_encryption")]
    pub require_encryption: bool,

    /// Maximum staged chunks per connection
    #[serde(default = "default_prepare_queue_limit")]
    pub prepare_queue_limit: usize,

    /// Maximum bytes returned by one read
    #[serde(default = "default_max_read_len")]
    pub max_read_len: usize,
}

fn default_require_encryption() -> bool {
    true
}

fn default_prepare_queue_limit() -> usize {
    32
}

fn default_max_read_len() -> usize {
    // Default ATT MTU (23) minus the opcode byte.
    22
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            require_encryption: default_require_encryption(),
            prepare_queue_limit: default_prepare_queue_limit(),
            max_read_len: default_max_read_len(),
        }
    }
}

impl CardConfig {
    /// Environment variable overriding the config path
    pub const ENV_CONFIG_PATH: &'static str = "BIZCARD_CONFIG";

    /// Default config filename
    pub const DEFAULT_CONFIG_FILENAME: &'static str = "bizcard.toml";

    /// Load from the resolved path, falling back to defaults if absent
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::resolve_config_path();

        if !path.exists() {
            tracing::info!(
                path = %path.display(),
                "config not found, using defaults"
            );
            return Ok(Self::default());
        }

        Self::load_from_path(&path)
    }

    /// Load from a specific file
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        Self::parse(&contents)
    }

    /// Parse configuration from TOML string
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let cfg: CardConfig = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn resolve_config_path() -> PathBuf {
        if let Ok(path) = std::env::var(Self::ENV_CONFIG_PATH) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .map(|d| d.join("bizcard").join(Self::DEFAULT_CONFIG_FILENAME))
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_CONFIG_FILENAME))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.service.prepare_queue_limit == 0 {
            return Err(ConfigError::Invalid(
                "service.prepare_queue_limit must be at least 1".to_string(),
            ));
        }
        if self.service.max_read_len == 0 {
            return Err(ConfigError::Invalid(
                "service.max_read_len must be at least 1".to_string(),
            ));
        }
        if !self.service.require_encryption {
            tracing::warn!("encryption not required: fields are readable on open links");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = CardConfig::parse("").unwrap();
        assert!(cfg.service.require_encryption);
        assert_eq!(cfg.service.prepare_queue_limit, 32);
        assert_eq!(cfg.service.max_read_len, 22);
        assert!(cfg.service.socket_path.is_none());
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = CardConfig::parse(
            r#"
[storage]
dir = "/var/lib/bizcard"

[service]
socket_path = "/run/bizcard.sock"
require_encryption = false
max_read_len = 64
"#,
        )
        .unwrap();
        assert_eq!(cfg.storage.dir, PathBuf::from("/var/lib/bizcard"));
        assert_eq!(
            cfg.service.socket_path,
            Some(PathBuf::from("/run/bizcard.sock"))
        );
        assert!(!cfg.service.require_encryption);
        assert_eq!(cfg.service.max_read_len, 64);
        assert_eq!(cfg.service.prepare_queue_limit, 32);
    }

    #[test]
    fn zero_queue_limit_is_rejected() {
        let err = CardConfig::parse("[service]\nprepare_queue_limit = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = CardConfig::parse("[service\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_from_path_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bizcard.toml");
        std::fs::write(&path, "[tag]\npayload_path = \"/tmp/tag.ndef\"\n").unwrap();
        let cfg = CardConfig::load_from_path(&path).unwrap();
        assert_eq!(cfg.tag.payload_path, PathBuf::from("/tmp/tag.ndef"));
    }
}
