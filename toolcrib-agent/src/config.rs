//! Agent configuration
//!
//! TOML file under the OS config directory, overridable by `--config`.
//! The server URL can also come from `TOOLCRIB_SERVER_URL` or `--server`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SERVER_URL_ENV: &str = "TOOLCRIB_SERVER_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server_url: String,
    pub api_key: Option<String>,
    pub pull_interval_secs: u64,
    pub push_interval_secs: u64,
    pub request_timeout_secs: u64,
    /// Local key-value store; OS data dir when unset
    pub data_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000".to_string(),
            api_key: None,
            pull_interval_secs: 3,
            push_interval_secs: 10,
            request_timeout_secs: 5,
            data_dir: None,
        }
    }
}

impl AgentConfig {
    /// Load from `path` (or the default location), then apply the environment
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_file_path()?,
        };

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("reading {}", config_path.display()))?;
            toml::from_str(&content).with_context(|| format!("parsing {}", config_path.display()))?
        } else {
            Self::default()
        };

        if let Ok(url) = std::env::var(SERVER_URL_ENV) {
            if !url.trim().is_empty() {
                config.server_url = url;
            }
        }
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, toml::to_string_pretty(self)?).await?;
        Ok(())
    }

    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("toolcrib-agent");
        path.push("config.toml");
        Ok(path)
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let mut path = dirs::data_dir().ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        path.push("toolcrib-agent");
        Ok(path)
    }

    pub fn pull_interval(&self) -> Duration {
        Duration::from_secs(self.pull_interval_secs.max(1))
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(self.push_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.pull_interval(), Duration::from_secs(3));
        assert_eq!(config.push_interval(), Duration::from_secs(10));
        assert_eq!(config.server_url, "http://localhost:8000");
    }

    #[test]
    fn test_config_file_path() {
        let path = AgentConfig::config_file_path().unwrap();
        assert!(path.to_string_lossy().contains("toolcrib-agent"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[tokio::test]
    async fn test_save_then_load_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent").join("config.toml");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, "pull_interval_secs = 7\napi_key = \"k\"\n").await.unwrap();

        let config = AgentConfig::load(Some(&path)).await.unwrap();
        assert_eq!(config.pull_interval_secs, 7);
        assert_eq!(config.push_interval_secs, 10);
        assert_eq!(config.api_key.as_deref(), Some("k"));

        let copy = dir.path().join("copy.toml");
        config.save(&copy).await.unwrap();
        let reloaded = AgentConfig::load(Some(&copy)).await.unwrap();
        assert_eq!(reloaded.pull_interval_secs, 7);
    }
}
