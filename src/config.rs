use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::card::BackendKind;

/// Runtime configuration, persisted as `~/.termq/config.json`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Explicit tmux binary. Discovered on `PATH` when unset.
    pub tmux_path: Option<PathBuf>,
    /// Reattach matched sessions at startup without asking.
    pub auto_reattach: bool,
    /// Backend used for cards reconstructed from orphan sessions.
    pub default_backend: BackendKind,
    pub handshake_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub close_grace_ms: u64,
    pub recovery_timeout_ms: u64,
    pub default_cols: u16,
    pub default_rows: u16,
    /// Capacity of per-session event channels.
    pub output_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tmux_path: None,
            auto_reattach: true,
            default_backend: BackendKind::Direct,
            handshake_timeout_ms: 5000,
            command_timeout_ms: 5000,
            close_grace_ms: 2000,
            recovery_timeout_ms: 5000,
            default_cols: 80,
            default_rows: 24,
            output_buffer: 1024,
        }
    }
}

impl Config {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Default base directory: `~/.termq/`
pub fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".termq")
}

/// Return the config file path: `<base_dir>/config.json`
pub fn config_path(base_dir: &Path) -> PathBuf {
    base_dir.join("config.json")
}

/// Load config from disk. Returns defaults on a missing or corrupt file.
pub async fn load_config(base_dir: &Path) -> Config {
    let path = config_path(base_dir);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt config");
                Config::default()
            }
        },
        Err(_) => Config::default(),
    }
}

/// Save config to disk via write-to-temp-then-rename.
pub async fn save_config(base_dir: &Path, config: &Config) -> Result<()> {
    let path = config_path(base_dir);
    tokio::fs::create_dir_all(base_dir)
        .await
        .with_context(|| format!("Failed to create {}", base_dir.display()))?;
    let json = serde_json::to_string_pretty(config)?;
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let tmp_name = format!(
        "config.{}.{}.tmp",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed),
    );
    let tmp_path = path.with_file_name(tmp_name);
    tokio::fs::write(&tmp_path, json).await?;
    tokio::fs::rename(&tmp_path, &path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path()).await;
        assert_eq!(config, Config::default());
    }

    #[tokio::test]
    async fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            tmux_path: Some(PathBuf::from("/opt/homebrew/bin/tmux")),
            auto_reattach: false,
            default_backend: BackendKind::Control,
            close_grace_ms: 250,
            ..Config::default()
        };
        save_config(dir.path(), &config).await.unwrap();
        assert_eq!(load_config(dir.path()).await, config);
    }

    #[tokio::test]
    async fn corrupt_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(config_path(dir.path()), "{not json")
            .await
            .unwrap();
        assert_eq!(load_config(dir.path()).await, Config::default());
    }

    #[tokio::test]
    async fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            config_path(dir.path()),
            r#"{"auto_reattach": false, "default_backend": "attach"}"#,
        )
        .await
        .unwrap();
        let config = load_config(dir.path()).await;
        assert!(!config.auto_reattach);
        assert_eq!(config.default_backend, BackendKind::Attach);
        assert_eq!(config.handshake_timeout_ms, 5000);
    }

    #[tokio::test]
    async fn save_creates_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        save_config(&nested, &Config::default()).await.unwrap();
        assert!(config_path(&nested).exists());
    }

    #[test]
    fn durations_follow_millis() {
        let config = Config {
            close_grace_ms: 1500,
            ..Config::default()
        };
        assert_eq!(config.close_grace(), Duration::from_millis(1500));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
    }
}
