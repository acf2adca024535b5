//! Daemon configuration
//!
//! Values come from three layers, highest first: command line (or its `LIVETEXT_*`
//! environment fallback), the optional TOML file, then built-in defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use livetext_protocol::DEFAULT_MAX_FRAME_SIZE;
use livetext_transport::{ServerConfig, WorkspaceConfig};
use serde::Deserialize;

use crate::error::StartupError;

pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 7070;
pub const DEFAULT_SAVE_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Contents of the TOML configuration file. Every key is optional.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub db: Option<PathBuf>,
    pub save_interval_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub max_frame_size: Option<usize>,
    pub log_level: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, StartupError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| StartupError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&text).map_err(|e| StartupError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Overlay `overrides` on top of this file's values
    pub fn merge(self, overrides: FileConfig) -> FileConfig {
        FileConfig {
            bind: overrides.bind.or(self.bind),
            port: overrides.port.or(self.port),
            db: overrides.db.or(self.db),
            save_interval_ms: overrides.save_interval_ms.or(self.save_interval_ms),
            idle_timeout_ms: overrides.idle_timeout_ms.or(self.idle_timeout_ms),
            max_frame_size: overrides.max_frame_size.or(self.max_frame_size),
            log_level: overrides.log_level.or(self.log_level),
        }
    }
}

/// Fully resolved settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub addr: SocketAddr,
    pub db: Option<PathBuf>,
    pub save_interval: Duration,
    pub idle_timeout: Duration,
    pub max_frame_size: usize,
    pub log_level: String,
}

impl Settings {
    pub fn resolve(config: FileConfig) -> Result<Self, StartupError> {
        let bind = config.bind.unwrap_or_else(|| DEFAULT_BIND.to_string());
        let port = config.port.unwrap_or(DEFAULT_PORT);
        let addr: SocketAddr = format!("{}:{}", bind, port)
            .parse()
            .map_err(|e| StartupError::Config(format!("bad bind address {:?}: {}", bind, e)))?;

        let save_interval_ms = config.save_interval_ms.unwrap_or(DEFAULT_SAVE_INTERVAL_MS);
        if save_interval_ms == 0 {
            return Err(StartupError::Config("save_interval_ms must be positive".into()));
        }
        let idle_timeout_ms = config.idle_timeout_ms.unwrap_or(DEFAULT_IDLE_TIMEOUT_MS);
        if idle_timeout_ms == 0 {
            return Err(StartupError::Config("idle_timeout_ms must be positive".into()));
        }
        let max_frame_size = config.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE);
        // A frame always carries the version byte and the tag.
        if max_frame_size < 3 {
            return Err(StartupError::Config("max_frame_size must be at least 3".into()));
        }

        let log_level = config.log_level.unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
        if !matches!(
            log_level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(StartupError::Config(format!("unknown log level {:?}", log_level)));
        }

        Ok(Self {
            addr,
            db: config.db,
            save_interval: Duration::from_millis(save_interval_ms),
            idle_timeout: Duration::from_millis(idle_timeout_ms),
            max_frame_size,
            log_level,
        })
    }

    pub fn workspace_config(&self) -> WorkspaceConfig {
        WorkspaceConfig {
            save_interval: self.save_interval,
            ..WorkspaceConfig::default()
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            idle_timeout: self.idle_timeout,
            max_frame_size: self.max_frame_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::resolve(FileConfig::default()).unwrap();
        assert_eq!(settings.addr, "0.0.0.0:7070".parse().unwrap());
        assert_eq!(settings.db, None);
        assert_eq!(settings.save_interval, Duration::from_secs(5));
        assert_eq!(settings.idle_timeout, Duration::from_secs(10));
        assert_eq!(settings.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn test_command_line_wins_over_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "bind = \"127.0.0.1\"\nport = 9000\nsave_interval_ms = 250\nlog_level = \"debug\""
        )
        .unwrap();

        let from_file = FileConfig::load(file.path()).unwrap();
        let cli = FileConfig {
            port: Some(9100),
            ..FileConfig::default()
        };
        let settings = Settings::resolve(from_file.merge(cli)).unwrap();

        assert_eq!(settings.addr, "127.0.0.1:9100".parse().unwrap());
        assert_eq!(settings.save_interval, Duration::from_millis(250));
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.workspace_config().save_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_rejects_invalid_values() {
        let zero_save = FileConfig {
            save_interval_ms: Some(0),
            ..FileConfig::default()
        };
        assert!(matches!(Settings::resolve(zero_save), Err(StartupError::Config(_))));

        let bad_bind = FileConfig {
            bind: Some("not an address".into()),
            ..FileConfig::default()
        };
        assert!(matches!(Settings::resolve(bad_bind), Err(StartupError::Config(_))));

        let bad_level = FileConfig {
            log_level: Some("loud".into()),
            ..FileConfig::default()
        };
        assert!(matches!(Settings::resolve(bad_level), Err(StartupError::Config(_))));
    }

    #[test]
    fn test_unknown_key_is_an_error() {
        assert!(FileConfig::parse("prot = 1").is_err());
    }

    #[test]
    fn test_missing_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileConfig::load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(StartupError::Config(_))));
    }
}
