use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::Context;
use progd_supervisor::{CatalogStore, LogSink, ProcessRunner, RunnerSettings, Supervisor};

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8081";
/// Used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_LOG_FILTER: &str = "info,progd=info";
const DATA_DIR_NAME: &str = ".program-manager";

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Service configuration, read from `PROGD_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub data_root: PathBuf,
    pub data_file: PathBuf,
    pub log_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub runner: RunnerSettings,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen_raw = env_nonempty("PROGD_LISTEN").unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let listen: SocketAddr = listen_raw
            .parse()
            .with_context(|| format!("invalid PROGD_LISTEN: {listen_raw}"))?;

        let data_root = env_nonempty("PROGD_DATA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_root);

        let mut config = Self::rooted(&data_root);
        config.listen = listen;
        if let Some(file) = env_nonempty("PROGD_DATA_FILE") {
            config.data_file = PathBuf::from(file);
        }
        if let Some(dir) = env_nonempty("PROGD_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        config.runner = RunnerSettings::from_env();
        Ok(config)
    }

    /// Default layout under `data_root`.
    pub fn rooted(data_root: &Path) -> Self {
        Self {
            listen: ([0, 0, 0, 0], 8081).into(),
            data_root: data_root.to_path_buf(),
            data_file: data_root.join("programs.json"),
            log_dir: data_root.join("logs"),
            temp_dir: data_root.join("temp"),
            runner: RunnerSettings::default(),
        }
    }

    /// Creates the data root, log and temp directories.
    pub async fn ensure_directories(&self) -> anyhow::Result<()> {
        for dir in [&self.data_root, &self.log_dir, &self.temp_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        if let Some(parent) = self.data_file.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        Ok(())
    }

    pub fn build_supervisor(&self) -> Supervisor {
        Supervisor::new(
            CatalogStore::new(&self.data_file),
            ProcessRunner::new(self.runner),
            LogSink::new(&self.log_dir),
        )
    }
}

fn default_data_root() -> PathBuf {
    match env_nonempty("HOME") {
        Some(home) => PathBuf::from(home).join(DATA_DIR_NAME),
        None => PathBuf::from(".").join(DATA_DIR_NAME),
    }
}
