use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8765;
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60 * 1000;
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 30_000;
/// Bytes read from the end of a newly discovered log file.
pub const DEFAULT_HYDRATE_MAX_BYTES: u64 = 256 * 1024;
/// Most-recent complete lines kept from that window.
pub const DEFAULT_HYDRATE_MAX_LINES: usize = 500;
pub const DEFAULT_RATE_LIMIT: u32 = 60;
pub const DEFAULT_RATE_WINDOW_MS: u64 = 60_000;
pub const DEFAULT_MAX_WS_CONNECTIONS_PER_IP: usize = 3;
/// How often clients are expected to ping.
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 20_000;

/// Directory holding the token and config files.
const STATE_DIR_NAME: &str = ".codex-blocker";

/// Process configuration, loaded from TOML. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    /// Root of the rollout log tree.
    pub sessions_dir: PathBuf,
    /// Where the trusted client token is persisted.
    pub token_path: PathBuf,
    pub session_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub scan_interval_ms: u64,
    pub sweep_interval_ms: u64,
    pub hydrate_max_bytes: u64,
    pub hydrate_max_lines: usize,
    /// Requests allowed per client IP per window.
    pub rate_limit: u32,
    pub rate_window_ms: u64,
    pub max_ws_connections_per_ip: usize,
    pub keepalive_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            sessions_dir: default_sessions_dir(),
            token_path: state_dir().join("token"),
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            scan_interval_ms: DEFAULT_SCAN_INTERVAL_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            hydrate_max_bytes: DEFAULT_HYDRATE_MAX_BYTES,
            hydrate_max_lines: DEFAULT_HYDRATE_MAX_LINES,
            rate_limit: DEFAULT_RATE_LIMIT,
            rate_window_ms: DEFAULT_RATE_WINDOW_MS,
            max_ws_connections_per_ip: DEFAULT_MAX_WS_CONNECTIONS_PER_IP,
            keepalive_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
        }
    }
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Load from `path`, falling back to defaults when it doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::load(path)?.unwrap_or_default())
    }

    /// Save config to a TOML file path.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("scan_interval_ms", self.scan_interval_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("rate_window_ms", self.rate_window_ms),
            ("session_timeout_ms", self.session_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        if self.max_ws_connections_per_ip == 0 {
            return Err(ConfigError::Invalid(
                "max_ws_connections_per_ip must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }
}

/// `~/.codex-blocker`, or a relative fallback when there is no home directory.
pub fn state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(STATE_DIR_NAME)
}

/// Default config file location.
pub fn default_config_path() -> PathBuf {
    state_dir().join("config.toml")
}

/// `$CODEX_HOME/sessions`, defaulting `CODEX_HOME` to `~/.codex`.
pub fn default_sessions_dir() -> PathBuf {
    let codex_home = std::env::var_os("CODEX_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".codex")
        });
    codex_home.join("sessions")
}

/// Errors that can occur when loading or saving config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {1}", .0.display())]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {}: {1}", .0.display())]
    ParseFailed(PathBuf, #[source] toml::de::Error),
    #[error("failed to write config {}: {1}", .0.display())]
    WriteFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Warn if a file that may hold secrets is world-readable.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            path = %path.display(),
            mode = format_args!("{:o}", mode & 0o7777),
            "file is world-readable; consider restricting permissions to 600",
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Returns true if the given file mode has the world-readable bit set.
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
