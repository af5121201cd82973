//! Relay configuration file parser.
//!
//! Flat `key = value` format; `#` starts a comment line, unknown keys are
//! ignored and unparsable numbers keep their default.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{RelayError, Result};

// Defaults
const LISTEN_PORT:            u16  = 8080;
const WS_PATH:                &str = "/ws/brain-waves";
const GENERATOR_URL:          &str = "http://localhost:8000";
const REAP_INTERVAL:          u64  = 60;
const IDLE_TIMEOUT:           u64  = 300;
const PRESSURE_IDLE_TIMEOUT:  u64  = 45;
const EMERGENCY_IDLE_TIMEOUT: u64  = 30;
const MAX_SESSIONS:           usize = 150;
const PRESSURE_SESSION_RATIO: f64  = 0.8;
const MEMORY_WARNING:         f64  = 0.75;
const MEMORY_CEILING:         f64  = 0.90;

/// Full daemon configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    // ── Transport ─────────────────────────────────────────────────────────────
    /// Address the WebSocket listener binds to.
    pub listen_addr: SocketAddr,
    /// Request path clients must upgrade on.
    pub ws_path: String,
    // ── Generation service ────────────────────────────────────────────────────
    /// Base URL of the ML service (`/predict` is appended).
    pub generator_url: String,
    // ── Session lifecycle (seconds) ───────────────────────────────────────────
    pub reap_interval:         u64,
    pub idle_timeout:          u64,
    pub pressure_idle_timeout: u64,
    /// Idle threshold for cleanup while memory is above `memory_ceiling`.
    pub emergency_idle_timeout: u64,
    // ── Resource limits ───────────────────────────────────────────────────────
    pub max_sessions:           usize,
    pub pressure_session_ratio: f64,
    pub memory_warning:         f64,
    pub memory_ceiling:         f64,
    // ── Process ───────────────────────────────────────────────────────────────
    pub pid_file:   Option<PathBuf>,
    pub log_syslog: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr:            SocketAddr::from(([0, 0, 0, 0], LISTEN_PORT)),
            ws_path:                WS_PATH.to_string(),
            generator_url:          GENERATOR_URL.to_string(),
            reap_interval:          REAP_INTERVAL,
            idle_timeout:           IDLE_TIMEOUT,
            pressure_idle_timeout:  PRESSURE_IDLE_TIMEOUT,
            emergency_idle_timeout: EMERGENCY_IDLE_TIMEOUT,
            max_sessions:           MAX_SESSIONS,
            pressure_session_ratio: PRESSURE_SESSION_RATIO,
            memory_warning:         MEMORY_WARNING,
            memory_ceiling:         MEMORY_CEILING,
            pid_file:               None,
            log_syslog:             false,
        }
    }
}

/// Read and parse the configuration file at `path`.
pub fn load_config(path: &Path) -> Result<RelayConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| RelayError::Config(format!("cannot read {}: {e}", path.display())))?;
    parse_config(&content)
}

/// Parse configuration text on top of the defaults.
pub fn parse_config(content: &str) -> Result<RelayConfig> {
    let mut cfg = RelayConfig::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, val)) = line.split_once('=') else { continue };
        let key = key.trim().to_ascii_lowercase();
        let val = val.trim().to_string();
        if val.is_empty() {
            continue;
        }

        match key.as_str() {
            "listen_addr" => {
                cfg.listen_addr = val
                    .parse()
                    .map_err(|e| RelayError::Config(format!("listen_addr {val}: {e}")))?;
            }
            "ws_path"                => cfg.ws_path                = val,
            "generator_url"          => cfg.generator_url          = val,
            "reap_interval"          => cfg.reap_interval          = val.parse().unwrap_or(REAP_INTERVAL),
            "idle_timeout"           => cfg.idle_timeout           = val.parse().unwrap_or(IDLE_TIMEOUT),
            "pressure_idle_timeout"  => cfg.pressure_idle_timeout  = val.parse().unwrap_or(PRESSURE_IDLE_TIMEOUT),
            "emergency_idle_timeout" => cfg.emergency_idle_timeout = val.parse().unwrap_or(EMERGENCY_IDLE_TIMEOUT),
            "max_sessions"           => cfg.max_sessions           = val.parse().unwrap_or(MAX_SESSIONS),
            "pressure_session_ratio" => cfg.pressure_session_ratio = val.parse().unwrap_or(PRESSURE_SESSION_RATIO),
            "memory_warning"         => cfg.memory_warning         = val.parse().unwrap_or(MEMORY_WARNING),
            "memory_ceiling"         => cfg.memory_ceiling         = val.parse().unwrap_or(MEMORY_CEILING),
            "pid_file"               => cfg.pid_file               = Some(PathBuf::from(&val)),
            "log_syslog"             => cfg.log_syslog             = val == "true" || val == "1" || val == "yes",
            _ => {} // ignore unknown keys
        }
    }

    Ok(cfg)
}

/// Validate cross-field constraints.
pub fn validate_config(cfg: &RelayConfig) -> Result<()> {
    if !cfg.ws_path.starts_with('/') {
        return Err(RelayError::Config(format!("ws_path must start with '/': {}", cfg.ws_path)));
    }
    let url = url::Url::parse(&cfg.generator_url)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(RelayError::Config(format!("generator_url must be http(s): {}", cfg.generator_url)));
    }
    if cfg.reap_interval == 0
        || cfg.idle_timeout == 0
        || cfg.pressure_idle_timeout == 0
        || cfg.emergency_idle_timeout == 0
    {
        return Err(RelayError::Config("reap_interval and idle timeouts must be non-zero".into()));
    }
    if cfg.pressure_idle_timeout >= cfg.idle_timeout {
        return Err(RelayError::Config(format!(
            "pressure_idle_timeout ({}) must be shorter than idle_timeout ({})",
            cfg.pressure_idle_timeout, cfg.idle_timeout
        )));
    }
    if cfg.emergency_idle_timeout > cfg.pressure_idle_timeout {
        return Err(RelayError::Config(format!(
            "emergency_idle_timeout ({}) must not exceed pressure_idle_timeout ({})",
            cfg.emergency_idle_timeout, cfg.pressure_idle_timeout
        )));
    }
    if cfg.max_sessions == 0 {
        return Err(RelayError::Config("max_sessions must be at least 1".into()));
    }
    if !(cfg.pressure_session_ratio > 0.0 && cfg.pressure_session_ratio <= 1.0) {
        return Err(RelayError::Config("pressure_session_ratio must be in (0, 1]".into()));
    }
    if !(cfg.memory_warning > 0.0 && cfg.memory_warning < cfg.memory_ceiling && cfg.memory_ceiling <= 1.0) {
        return Err(RelayError::Config(format!(
            "need 0 < memory_warning ({}) < memory_ceiling ({}) <= 1",
            cfg.memory_warning, cfg.memory_ceiling
        )));
    }
    Ok(())
}
