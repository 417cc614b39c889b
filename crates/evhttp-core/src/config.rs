//! Server configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls (the binary maps command-line flags onto these)
//! 2. Environment variables
//! 3. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use evhttp_core::config::ServerConfig;
//!
//! let config = ServerConfig::from_env()
//!     .port(9000)
//!     .timeout_ms(30_000);
//! config.validate()?;
//! ```

use std::path::PathBuf;
use std::str::FromStr;

use tracing::level_filters::LevelFilter;

use crate::env::{env_get, env_get_bool, env_get_opt};
use crate::error::ConfigError;

/// Library defaults.
pub mod defaults {
    pub const PORT: u16 = 8088;
    pub const TRIG_MODE: u8 = 3;
    pub const TIMEOUT_MS: u64 = 60_000;
    pub const OPT_LINGER: bool = false;
    pub const THREAD_NUM: usize = 8;
    pub const MAX_CONNS: usize = 65_536;
    pub const SRC_DIR: &str = "./resources";
    pub const LOG_ENABLED: bool = true;
    pub const LOG_LEVEL: &str = "info";
}

/// Edge/level trigger selection for the listen socket and for connections.
///
/// Encoded the classic way as a small integer:
///
/// | mode | listen | connections |
/// |------|--------|-------------|
/// | 0    | LT     | LT          |
/// | 1    | LT     | ET          |
/// | 2    | ET     | LT          |
/// | 3    | ET     | ET          |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrigMode {
    pub listen_et: bool,
    pub conn_et: bool,
}

impl TrigMode {
    pub fn from_mode(mode: u8) -> Self {
        match mode {
            0 => Self { listen_et: false, conn_et: false },
            1 => Self { listen_et: false, conn_et: true },
            2 => Self { listen_et: true, conn_et: false },
            _ => Self { listen_et: true, conn_et: true },
        }
    }

    pub fn mode(&self) -> u8 {
        (self.listen_et as u8) << 1 | self.conn_et as u8
    }
}

impl Default for TrigMode {
    fn default() -> Self {
        Self::from_mode(defaults::TRIG_MODE)
    }
}

/// Configuration for the server, supplied once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen port (0 = let the kernel pick)
    pub port: u16,
    /// Trigger mode for listen and connection sockets
    pub trig_mode: TrigMode,
    /// Idle-connection timeout in milliseconds; 0 disables eviction
    pub timeout_ms: u64,
    /// SO_LINGER {on, 1s} on close
    pub opt_linger: bool,
    /// Worker pool size
    pub thread_num: usize,
    /// Live-connection capacity
    pub max_conns: usize,
    /// Static file root
    pub src_dir: PathBuf,
    /// Install a log subscriber at all
    pub log_enabled: bool,
    /// Maximum log level
    pub log_level: LevelFilter,
    /// Optional `user:password` seed file for the credential store
    pub users_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: defaults::PORT,
            trig_mode: TrigMode::default(),
            timeout_ms: defaults::TIMEOUT_MS,
            opt_linger: defaults::OPT_LINGER,
            thread_num: defaults::THREAD_NUM,
            max_conns: defaults::MAX_CONNS,
            src_dir: PathBuf::from(defaults::SRC_DIR),
            log_enabled: defaults::LOG_ENABLED,
            log_level: LevelFilter::INFO,
            users_file: None,
        }
    }
}

impl ServerConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `EVHTTP_PORT` - Listen port
    /// - `EVHTTP_TRIG_MODE` - Trigger mode 0..=3
    /// - `EVHTTP_TIMEOUT_MS` - Idle timeout (0 disables)
    /// - `EVHTTP_OPT_LINGER` - Graceful linger on close (0/1)
    /// - `EVHTTP_THREADS` - Worker pool size
    /// - `EVHTTP_MAX_CONNS` - Live-connection capacity
    /// - `EVHTTP_ROOT` - Static file root
    /// - `EVHTTP_LOG` - Enable logging (0/1)
    /// - `EVHTTP_LOG_LEVEL` - off|error|warn|info|debug|trace or 0..5
    /// - `EVHTTP_USERS` - Credential seed file
    pub fn from_env() -> Self {
        let log_level = env_get_opt::<String>("EVHTTP_LOG_LEVEL")
            .and_then(|s| LevelFilter::from_str(&s).ok())
            .unwrap_or(LevelFilter::INFO);

        Self {
            port: env_get("EVHTTP_PORT", defaults::PORT),
            trig_mode: TrigMode::from_mode(env_get("EVHTTP_TRIG_MODE", defaults::TRIG_MODE)),
            timeout_ms: env_get("EVHTTP_TIMEOUT_MS", defaults::TIMEOUT_MS),
            opt_linger: env_get_bool("EVHTTP_OPT_LINGER", defaults::OPT_LINGER),
            thread_num: env_get("EVHTTP_THREADS", defaults::THREAD_NUM),
            max_conns: env_get("EVHTTP_MAX_CONNS", defaults::MAX_CONNS),
            src_dir: env_get("EVHTTP_ROOT", PathBuf::from(defaults::SRC_DIR)),
            log_enabled: env_get_bool("EVHTTP_LOG", defaults::LOG_ENABLED),
            log_level,
            users_file: env_get_opt("EVHTTP_USERS"),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn trig_mode(mut self, mode: TrigMode) -> Self {
        self.trig_mode = mode;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn opt_linger(mut self, enable: bool) -> Self {
        self.opt_linger = enable;
        self
    }

    pub fn thread_num(mut self, n: usize) -> Self {
        self.thread_num = n;
        self
    }

    pub fn max_conns(mut self, n: usize) -> Self {
        self.max_conns = n;
        self
    }

    pub fn src_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.src_dir = dir.into();
        self
    }

    pub fn log_enabled(mut self, enable: bool) -> Self {
        self.log_enabled = enable;
        self
    }

    /// Set log level from its textual form (`"debug"`, `"3"`, ...).
    pub fn log_level(mut self, level: &str) -> Result<Self, ConfigError> {
        self.log_level =
            LevelFilter::from_str(level).map_err(|_| ConfigError::LogLevel(level.to_string()))?;
        Ok(self)
    }

    pub fn users_file(mut self, path: Option<PathBuf>) -> Self {
        self.users_file = path;
        self
    }

    /// Idle eviction is enabled only for a non-zero timeout.
    pub fn idle_timeout_enabled(&self) -> bool {
        self.timeout_ms > 0
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port != 0 && self.port < 1024 {
            return Err(ConfigError::PrivilegedPort(self.port));
        }
        if self.thread_num == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.max_conns == 0 {
            return Err(ConfigError::NoConnections);
        }
        Ok(())
    }
}
