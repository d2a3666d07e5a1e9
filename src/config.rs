//! Configuration for tterm.
//!
//! Settings are read from `~/.tterm/config.toml`. Every key is optional:
//!
//! ```toml
//! cols = 80
//! rows = 24
//! # Prompt used to detect the end of a command reply until one is learned
//! prompt = "> "
//! # Seconds WaitForPrompt waits without new output
//! wait_timeout = 10
//! log_level = "info"
//!
//! [buffer]
//! capacity = 8388608
//! max_lines = 65536
//!
//! [ssh]
//! known_hosts = "~/.ssh/known_hosts"
//! identity_files = ["~/.ssh/id_ed25519", "~/.ssh/id_rsa"]
//! term_type = "xterm"
//!
//! [telnet]
//! term_type = "vt100"
//!
//! [transfer]
//! chunk_size = 32768
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::term::buffer::{DEFAULT_CAPACITY, DEFAULT_MAX_LINES};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not determine home directory")]
    NoHome,
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cols: u16,
    pub rows: u16,
    /// Prompt assumed before one is learned
    pub prompt: String,
    /// Seconds of silence before a scripted wait gives up
    pub wait_timeout: u64,
    /// Edit a line locally while no host is connected
    pub local_edit: bool,
    /// Tracing filter, e.g. "info" or "tterm=debug"
    pub log_level: String,
    pub buffer: BufferConfig,
    pub ssh: SshConfig,
    pub serial: SerialConfig,
    pub telnet: TelnetConfig,
    pub process: ProcessConfig,
    pub transfer: TransferConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 24,
            prompt: "> ".to_string(),
            wait_timeout: 10,
            local_edit: true,
            log_level: "info".to_string(),
            buffer: BufferConfig::default(),
            ssh: SshConfig::default(),
            serial: SerialConfig::default(),
            telnet: TelnetConfig::default(),
            process: ProcessConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Bytes kept before old scrollback is dropped
    pub capacity: usize,
    pub max_lines: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            max_lines: DEFAULT_MAX_LINES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub known_hosts: String,
    pub identity_files: Vec<String>,
    pub auth_attempts: u32,
    pub term_type: String,
    pub connect_timeout: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            known_hosts: "~/.ssh/known_hosts".to_string(),
            identity_files: vec![
                "~/.ssh/id_ed25519".to_string(),
                "~/.ssh/id_ecdsa".to_string(),
                "~/.ssh/id_rsa".to_string(),
            ],
            auth_attempts: 3,
            term_type: "xterm".to_string(),
            connect_timeout: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self { read_timeout_ms: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelnetConfig {
    pub term_type: String,
    pub connect_timeout: u64,
}

impl Default for TelnetConfig {
    fn default() -> Self {
        Self {
            term_type: "vt100".to_string(),
            connect_timeout: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// How long a child may take to exit after stdin closes
    pub kill_grace_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self { kill_grace_ms: 1000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self { chunk_size: 32768 }
    }
}

impl Config {
    /// Load configuration from the default file, falling back to defaults
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{}; using defaults", e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_path().ok_or(ConfigError::NoHome)?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Directory holding the config file and the log
    pub fn data_dir() -> Option<PathBuf> {
        home_dir().map(|home| home.join(".tterm"))
    }

    fn config_path() -> Option<PathBuf> {
        Self::data_dir().map(|dir| dir.join("config.toml"))
    }

    pub fn wait_timeout_ticks(&self) -> u64 {
        self.wait_timeout * 10
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => home_dir().map_or_else(|| PathBuf::from(path), |home| home.join(rest)),
        None => PathBuf::from(path),
    }
}

// Get home directory
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "rows = 40\n[ssh]\nterm_type = \"vt220\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.rows, 40);
        assert_eq!(config.cols, 80);
        assert_eq!(config.ssh.term_type, "vt220");
        assert_eq!(config.ssh.auth_attempts, 3);
        assert_eq!(config.telnet.term_type, "vt100");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.prompt = "$ ".to_string();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.prompt, "$ ");
        assert_eq!(loaded.buffer.capacity, DEFAULT_CAPACITY);
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "rows = \"many\"").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn test_expand_home_leaves_absolute_paths() {
        assert_eq!(expand_home("/etc/ssh"), PathBuf::from("/etc/ssh"));
    }
}
