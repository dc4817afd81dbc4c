use std::path::{Path, PathBuf};

use orchestrator::BackendConfig;
use serde::{Deserialize, Serialize};

pub const DRAFTER_DIR: &str = ".drafter";
pub const CONFIG_FILE: &str = "config.toml";
pub const PLAN_DIR: &str = "plan";
pub const DEFAULT_PORT: u16 = 3001;

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_url() -> String {
    format!("http://localhost:{}", DEFAULT_PORT)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// Where `propose` and `abort` send their requests
    #[serde(default = "default_url")]
    pub url: String,
    /// Port `serve` listens on
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DrafterConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

impl DrafterConfig {
    /// Workspace config wins, then the user-level one, then defaults. A file
    /// that cannot be read or parsed is skipped with a warning.
    pub async fn load(workspace: &Path) -> Self {
        let candidates = [Some(config_path(workspace)), global_config_path()];

        for path in candidates.into_iter().flatten() {
            if let Some(config) = Self::read(&path).await {
                return config;
            }
        }

        tracing::debug!("No drafter config found, using defaults");
        Self::default()
    }

    async fn read(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", path.display(), e);
                return None;
            }
        };

        match toml::from_str(&content) {
            Ok(config) => {
                tracing::debug!("Loaded config from {}", path.display());
                Some(config)
            }
            Err(e) => {
                tracing::warn!("Invalid config {}, using defaults: {}", path.display(), e);
                None
            }
        }
    }

    pub async fn save(&self, workspace: &Path) -> anyhow::Result<PathBuf> {
        let dir = workspace.join(DRAFTER_DIR);
        tokio::fs::create_dir_all(&dir).await?;

        let path = config_path(workspace);
        tokio::fs::write(&path, toml::to_string_pretty(self)?).await?;
        Ok(path)
    }
}

pub fn drafter_dir(workspace: &Path) -> PathBuf {
    workspace.join(DRAFTER_DIR)
}

pub fn plan_dir(workspace: &Path) -> PathBuf {
    drafter_dir(workspace).join(PLAN_DIR)
}

fn config_path(workspace: &Path) -> PathBuf {
    drafter_dir(workspace).join(CONFIG_FILE)
}

fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("drafter").join(CONFIG_FILE))
}
