use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use thiserror::Error;

use crate::ingestion::{CircuitBreakerConfig, RecoveryConfig, TransactionConfig};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// PostgreSQL connection URL; in-memory stores are used when absent
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub postgres_max_connections: u32,
    #[serde(default)]
    pub ingestion: IngestionConfig,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct IngestionConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub bank_registry: BankRegistryConfig,
    pub recovery: RecoveryConfig,
    pub transaction: TransactionConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct BankRegistryConfig {
    pub base_url: String,
    pub call_timeout_seconds: u64,
}

impl Default for BankRegistryConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081".to_string(),
            call_timeout_seconds: 10,
        }
    }
}

impl BankRegistryConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct StorageConfig {
    pub root_dir: String,
    pub bucket: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: "./data/objects".to_string(),
            bucket: "regtech-data-storage".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: config_path,
            source,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }
}
