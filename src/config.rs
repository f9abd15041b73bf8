//! Optional user configuration.
//!
//! Loaded from `~/.sshim/config.yaml`, overridable with the `SSHIM_CONFIG`
//! environment variable. Every field has a default; a missing file yields
//! the defaults, a malformed file is an error.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory under the home directory holding shim state.
const SSHIM_DIR: &str = ".sshim";

/// Name of the configuration file inside [`SSHIM_DIR`].
const CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShimConfig {
    /// Patience for handshake reads (sockdir negotiation and byte-count
    /// exchange), in seconds. Overridden by `--timeout`.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Consecutive failed transport spawns tolerated before the session
    /// is declared dead.
    #[serde(default = "default_max_spawn_attempts")]
    pub max_spawn_attempts: u32,

    /// Name under which the shim is invoked on the remote host.
    #[serde(default = "default_remote_program")]
    pub remote_program: String,

    /// Debug log destination. `SSHIM_DEBUG_LOG` wins over this.
    #[serde(default)]
    pub debug_log: Option<PathBuf>,
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_max_spawn_attempts() -> u32 {
    5
}

fn default_remote_program() -> String {
    "sshim".to_string()
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout_secs(),
            max_spawn_attempts: default_max_spawn_attempts(),
            remote_program: default_remote_program(),
            debug_log: None,
        }
    }
}

impl ShimConfig {
    /// Loads the configuration from the default location (or
    /// `SSHIM_CONFIG`). A missing file is not an error.
    pub fn load_default() -> Result<Self> {
        match config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.handshake_timeout_secs == 0 {
            anyhow::bail!("handshake_timeout_secs must be at least 1");
        }
        if self.max_spawn_attempts == 0 {
            anyhow::bail!("max_spawn_attempts must be at least 1");
        }
        if self.remote_program.is_empty() {
            anyhow::bail!("remote_program must not be empty");
        }
        Ok(())
    }
}

fn config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("SSHIM_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(SSHIM_DIR).join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ShimConfig::default();
        assert_eq!(config.handshake_timeout_secs, 10);
        assert_eq!(config.max_spawn_attempts, 5);
        assert_eq!(config.remote_program, "sshim");
        assert!(config.debug_log.is_none());
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_spawn_attempts: 8").unwrap();
        let config = ShimConfig::load(file.path()).unwrap();
        assert_eq!(config.max_spawn_attempts, 8);
        assert_eq!(config.handshake_timeout_secs, 10);
        assert_eq!(config.remote_program, "sshim");
    }

    #[test]
    fn test_load_rejects_zero_timeout() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "handshake_timeout_secs: 0").unwrap();
        assert!(ShimConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{not yaml: [").unwrap();
        assert!(ShimConfig::load(file.path()).is_err());
    }

    #[test]
    #[serial_test::serial]
    fn test_env_var_overrides_config_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "remote_program: sshim-unstable").unwrap();
        std::env::set_var("SSHIM_CONFIG", file.path());
        let config = ShimConfig::load_default().unwrap();
        std::env::remove_var("SSHIM_CONFIG");
        assert_eq!(config.remote_program, "sshim-unstable");
    }
}
