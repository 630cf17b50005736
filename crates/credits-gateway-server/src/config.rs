use credits_ledger::{InMemoryStorage, LedgerError, LedgerPolicy, LedgerStorage};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub const DEV_ADMIN_KEY: &str = "dev-admin-key";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
    #[error("Failed to read policy file {path}: {source}")]
    PolicyRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse policy file {path}: {source}")]
    PolicyParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("CREDITS_DATABASE is set but this build lacks the `sqlite` feature")]
    SqliteUnavailable,
    #[error("Storage Error: {0}")]
    Storage(#[from] LedgerError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    InMemory,
    Sqlite(PathBuf),
}

impl StorageBackend {
    pub fn open(&self) -> Result<Arc<dyn LedgerStorage>, ConfigError> {
        match self {
            StorageBackend::InMemory => Ok(Arc::new(InMemoryStorage::new())),
            #[cfg(feature = "sqlite")]
            StorageBackend::Sqlite(path) => {
                Ok(Arc::new(credits_ledger::SqliteStorage::open(path)?))
            }
            #[cfg(not(feature = "sqlite"))]
            StorageBackend::Sqlite(_) => Err(ConfigError::SqliteUnavailable),
        }
    }
}

/// Gateway configuration, read from `CREDITS_*` environment variables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub admin_api_key: String,
    pub policy: LedgerPolicy,
    pub storage: StorageBackend,
    pub reset_scheduler: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            admin_api_key: DEV_ADMIN_KEY.to_string(),
            policy: LedgerPolicy::default(),
            storage: StorageBackend::InMemory,
            reset_scheduler: false,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(host) = get("CREDITS_HOST") {
            config.host = host;
        }
        if let Some(port) = get("CREDITS_PORT") {
            config.port = port.trim().parse().map_err(|_| ConfigError::InvalidValue {
                name: "CREDITS_PORT",
                value: port.clone(),
            })?;
        }
        if let Some(key) = get("CREDITS_ADMIN_KEY") {
            config.admin_api_key = key;
        }
        if let Some(path) = get("CREDITS_POLICY_FILE") {
            config.policy = load_policy(PathBuf::from(path))?;
        }
        if let Some(path) = get("CREDITS_DATABASE") {
            config.storage = StorageBackend::Sqlite(PathBuf::from(path));
        }
        if let Some(flag) = get("CREDITS_RESET_SCHEDULER") {
            config.reset_scheduler = parse_bool(&flag).ok_or_else(|| ConfigError::InvalidValue {
                name: "CREDITS_RESET_SCHEDULER",
                value: flag.clone(),
            })?;
        }

        if config.policy.slow_mode_threshold_percent > 100 {
            return Err(ConfigError::InvalidValue {
                name: "slowModeThresholdPercent",
                value: config.policy.slow_mode_threshold_percent.to_string(),
            });
        }
        Ok(config)
    }

    pub fn uses_dev_key(&self) -> bool {
        self.admin_api_key == DEV_ADMIN_KEY
    }
}

fn load_policy(path: PathBuf) -> Result<LedgerPolicy, ConfigError> {
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(source) => return Err(ConfigError::PolicyRead { path, source }),
    };
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::PolicyParse { path, source })
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
