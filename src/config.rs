// Runtime configuration
//
// A JSON file under the user's config directory, then PARLEY_* environment
// variables on top. Missing file means defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::transfer::{TransferConfig, DEFAULT_CHUNK_SIZE};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Messaging backend, without the trailing user id
    pub endpoint: String,
    /// Holds the database and the key file
    pub data_dir: PathBuf,
    /// Where incoming transfers are accepted
    pub listen_addr: String,
    pub chunk_size: usize,
    /// Pause after each chunk, 0 for none
    pub chunk_interval_ms: u64,
    pub subscriber_buffer: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("parley");
        Self {
            endpoint: "ws://127.0.0.1:8000/ws".to_string(),
            data_dir,
            listen_addr: "0.0.0.0:7878".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_interval_ms: 0,
            subscriber_buffer: crate::session::DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

impl CoreConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("parley").join("config.json"))
    }

    /// Load from `path` (or the default location), then apply the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(Self::default_path);
        let mut config = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(&path)?;
                let config: CoreConfig = serde_json::from_str(&text).map_err(|e| {
                    CoreError::InvalidOperation(format!("invalid config {}: {}", path.display(), e))
                })?;
                info!("Loaded configuration from {}", path.display());
                config
            }
            _ => {
                debug!("No configuration file, using defaults");
                CoreConfig::default()
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override fields from `PARLEY_*` variables returned by `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| CoreError::InvalidOperation(format!("{} must be a number, got '{}'", key, value)))
        }

        if let Some(value) = lookup("PARLEY_ENDPOINT") {
            self.endpoint = value;
        }
        if let Some(value) = lookup("PARLEY_DATA_DIR") {
            self.data_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("PARLEY_LISTEN_ADDR") {
            self.listen_addr = value;
        }
        if let Some(value) = lookup("PARLEY_CHUNK_SIZE") {
            self.chunk_size = number("PARLEY_CHUNK_SIZE", &value)?;
        }
        if let Some(value) = lookup("PARLEY_CHUNK_INTERVAL_MS") {
            self.chunk_interval_ms = number("PARLEY_CHUNK_INTERVAL_MS", &value)?;
        }
        if let Some(value) = lookup("PARLEY_SUBSCRIBER_BUFFER") {
            self.subscriber_buffer = number("PARLEY_SUBSCRIBER_BUFFER", &value)?;
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// SQLite file shared by the checkpoint and permission tables
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("parley.db")
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join("identity.key")
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            chunk_size: self.chunk_size,
            chunk_interval: (self.chunk_interval_ms > 0).then(|| Duration::from_millis(self.chunk_interval_ms)),
            ..TransferConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PARLEY_ENDPOINT", "wss://chat.example.com/ws"),
            ("PARLEY_CHUNK_SIZE", "16384"),
            ("PARLEY_CHUNK_INTERVAL_MS", "5"),
        ]
        .into_iter()
        .collect();

        let mut config = CoreConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.endpoint, "wss://chat.example.com/ws");
        assert_eq!(config.chunk_size, 16384);

        let transfer = config.transfer_config();
        assert_eq!(transfer.chunk_interval, Some(Duration::from_millis(5)));

        let bad = |key: &str| (key == "PARLEY_CHUNK_SIZE").then(|| "lots".to_string());
        assert!(CoreConfig::default().apply_env(bad).is_err());
    }

    #[test]
    fn test_file_roundtrip_with_partial_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"listen_addr":"127.0.0.1:9999"}"#).unwrap();

        let mut config: CoreConfig = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9999");
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);

        config.data_dir = dir.path().to_path_buf();
        config.save(&path).unwrap();
        assert_eq!(config.database_path(), dir.path().join("parley.db"));
        let reloaded: CoreConfig = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reloaded, config);
    }
}
