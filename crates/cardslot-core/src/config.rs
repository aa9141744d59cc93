//! Module configuration.
//!
//! Policy constants and the description of the virtual readers live here.
//! Defaults apply for every field missing from a TOML file.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::attributes::class;

/// Environment variable naming the TOML configuration file.
pub const CONFIG_ENV: &str = "CARDSLOT_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Authentication policy applied to every token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenPolicy {
    /// Failed user logins before the user PIN locks.
    pub user_retry_limit: u8,
    /// Failed security officer attempts (login or unblock) before the SO
    /// PIN is disabled for the lifetime of the token.
    pub so_retry_limit: u8,
    pub min_pin_len: usize,
    pub max_pin_len: usize,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            user_retry_limit: 3,
            so_retry_limit: 15,
            min_pin_len: 4,
            max_pin_len: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectClassName {
    Data,
    Certificate,
    PublicKey,
    PrivateKey,
    SecretKey,
}

impl ObjectClassName {
    pub fn code(self) -> u64 {
        match self {
            ObjectClassName::Data => class::DATA,
            ObjectClassName::Certificate => class::CERTIFICATE,
            ObjectClassName::PublicKey => class::PUBLIC_KEY,
            ObjectClassName::PrivateKey => class::PRIVATE_KEY,
            ObjectClassName::SecretKey => class::SECRET_KEY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftObjectConfig {
    pub class: ObjectClassName,
    pub label: String,
    #[serde(default)]
    pub private: Option<bool>,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftCardConfig {
    pub label: String,
    #[serde(default = "default_serial")]
    pub serial: String,
    pub user_pin: String,
    pub so_pin: String,
    #[serde(default)]
    pub objects: Vec<SoftObjectConfig>,
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(reason.into())
}

fn default_serial() -> String {
    "0000000000000001".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftReaderConfig {
    pub name: String,
    #[serde(default)]
    pub card: Option<SoftCardConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    pub manufacturer: String,
    pub library_description: String,
    pub max_slots: usize,
    pub max_sessions: usize,
    pub policy: TokenPolicy,
    pub readers: Vec<SoftReaderConfig>,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            manufacturer: "CardSlot".to_string(),
            library_description: "CardSlot PKCS#11 module".to_string(),
            max_slots: 16,
            max_sessions: 256,
            policy: TokenPolicy::default(),
            readers: vec![SoftReaderConfig {
                name: "Virtual Reader 0".to_string(),
                card: Some(SoftCardConfig {
                    label: "CardSlot Soft Token".to_string(),
                    serial: default_serial(),
                    user_pin: "648219".to_string(),
                    so_pin: "3537363231383830".to_string(),
                    objects: Vec::new(),
                }),
            }],
        }
    }
}

impl ModuleConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no token could operate under: an empty retry budget
    /// locks the credential before its first use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let policy = &self.policy;
        if policy.user_retry_limit == 0 {
            return Err(invalid("policy.user_retry_limit must be at least 1"));
        }
        if policy.so_retry_limit == 0 {
            return Err(invalid("policy.so_retry_limit must be at least 1"));
        }
        if policy.min_pin_len == 0 {
            return Err(invalid("policy.min_pin_len must be at least 1"));
        }
        if policy.min_pin_len > policy.max_pin_len {
            return Err(invalid(format!(
                "policy.min_pin_len ({}) exceeds policy.max_pin_len ({})",
                policy.min_pin_len, policy.max_pin_len
            )));
        }
        if self.max_slots == 0 {
            return Err(invalid("max_slots must be at least 1"));
        }
        if self.max_sessions == 0 {
            return Err(invalid("max_sessions must be at least 1"));
        }
        let mut names = BTreeSet::new();
        for reader in &self.readers {
            if !names.insert(reader.name.as_str()) {
                return Err(invalid(format!("reader {} is listed twice", reader.name)));
            }
        }
        Ok(())
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Load from the file named by `CARDSLOT_CONFIG`, or use defaults when
    /// the variable is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(PathBuf::from(path)),
            None => Ok(Self::default()),
        }
    }
}
