use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use regex::Regex;
use serde::Deserialize;

pub const DEFAULT_READY_PATTERN: &str = r#"Done \((\d+\.\d+)s\)! For help, type "help""#;
pub const DEFAULT_PLAYER_PATTERN: &str = r"There are (\d+) of a max of (\d+) players online";

const DEFAULT_CONFIG_FILE: &str = "hearth.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {field} pattern {pattern:?}: {source}")]
    Pattern {
        field: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Working directory of the game server.
    pub server_dir: PathBuf,
    pub program: String,
    pub args: Vec<String>,
    /// Live log file, relative to `server_dir` unless absolute.
    pub log_file: PathBuf,
    pub ready_pattern: String,
    pub player_pattern: String,
    pub stop_command: String,
    pub list_command: String,
    pub idle_timeout_minutes: u64,
    pub start_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub graceful_term_grace_secs: u64,
    pub poll_interval_ms: u64,
    pub settle_delay_ms: u64,
    pub restart_delay_ms: u64,
    /// 0 disables the periodic player probe.
    pub activity_probe_secs: u64,
    pub server_port: u16,
    pub console_channel: String,
    pub console_json: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_dir: PathBuf::from("./Server"),
            program: "java".to_string(),
            args: vec![
                "-Xmx1024M".to_string(),
                "-Xms1024M".to_string(),
                "-jar".to_string(),
                "server.jar".to_string(),
                "nogui".to_string(),
            ],
            log_file: PathBuf::from("logs/latest.log"),
            ready_pattern: DEFAULT_READY_PATTERN.to_string(),
            player_pattern: DEFAULT_PLAYER_PATTERN.to_string(),
            stop_command: "stop".to_string(),
            list_command: "list".to_string(),
            idle_timeout_minutes: 50,
            start_timeout_secs: 300,
            stop_timeout_secs: 60,
            graceful_term_grace_secs: 5,
            poll_interval_ms: 1000,
            settle_delay_ms: 1500,
            restart_delay_ms: 3000,
            activity_probe_secs: 300,
            server_port: 25565,
            console_channel: "console".to_string(),
            console_json: false,
        }
    }
}

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

pub(crate) fn env_bool(name: &str) -> Option<bool> {
    env_string(name).map(|v| {
        matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

impl AgentConfig {
    /// Defaults, then the TOML file (if any), then `HEARTH_*` overrides.
    pub fn load() -> anyhow::Result<Self> {
        let explicit = env_string("HEARTH_CONFIG").map(PathBuf::from);
        let path = explicit
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut cfg = if path.is_file() {
            Self::from_file(&path)?
        } else if let Some(p) = explicit {
            anyhow::bail!("config file not found: {}", p.display());
        } else {
            Self::default()
        };

        cfg.apply_env();
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let mut cfg: AgentConfig = toml::from_str(raw)?;
        cfg.normalize();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_string("HEARTH_SERVER_DIR") {
            self.server_dir = PathBuf::from(v);
        }
        if let Some(v) = env_string("HEARTH_PROGRAM") {
            self.program = v;
        }
        if let Some(v) = env_string("HEARTH_ARGS") {
            self.args = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = env_string("HEARTH_LOG_FILE") {
            self.log_file = PathBuf::from(v);
        }
        if let Some(v) = env_string("HEARTH_READY_PATTERN") {
            self.ready_pattern = v;
        }
        if let Some(v) = env_string("HEARTH_PLAYER_PATTERN") {
            self.player_pattern = v;
        }
        if let Some(v) = env_u64("HEARTH_IDLE_TIMEOUT_MINUTES") {
            self.idle_timeout_minutes = v;
        }
        if let Some(v) = env_u64("HEARTH_START_TIMEOUT_SECS") {
            self.start_timeout_secs = v;
        }
        if let Some(v) = env_u64("HEARTH_STOP_TIMEOUT_SECS") {
            self.stop_timeout_secs = v;
        }
        if let Some(v) = env_u64("HEARTH_GRACEFUL_TERM_GRACE_SECS") {
            self.graceful_term_grace_secs = v;
        }
        if let Some(v) = env_u64("HEARTH_POLL_INTERVAL_MS") {
            self.poll_interval_ms = v;
        }
        if let Some(v) = env_u64("HEARTH_SETTLE_DELAY_MS") {
            self.settle_delay_ms = v;
        }
        if let Some(v) = env_u64("HEARTH_RESTART_DELAY_MS") {
            self.restart_delay_ms = v;
        }
        if let Some(v) = env_u64("HEARTH_ACTIVITY_PROBE_SECS") {
            self.activity_probe_secs = v;
        }
        if let Some(v) = env_u64("HEARTH_SERVER_PORT").and_then(|v| u16::try_from(v).ok()) {
            self.server_port = v;
        }
        if let Some(v) = env_string("HEARTH_CONSOLE_CHANNEL") {
            self.console_channel = v;
        }
        if let Some(v) = env_bool("HEARTH_CONSOLE_JSON") {
            self.console_json = v;
        }
    }

    /// Clamp numeric settings into their working ranges, wherever they came
    /// from.
    pub fn normalize(&mut self) {
        self.idle_timeout_minutes = self.idle_timeout_minutes.clamp(1, 24 * 60);
        self.start_timeout_secs = self.start_timeout_secs.clamp(5, 60 * 60);
        self.stop_timeout_secs = self.stop_timeout_secs.clamp(1, 10 * 60);
        self.graceful_term_grace_secs = self
            .graceful_term_grace_secs
            .clamp(1, 60)
            .min(self.stop_timeout_secs);
        self.poll_interval_ms = self.poll_interval_ms.clamp(50, 60_000);
        self.settle_delay_ms = self.settle_delay_ms.min(60_000);
        self.restart_delay_ms = self.restart_delay_ms.min(60_000);
        self.activity_probe_secs = self.activity_probe_secs.min(24 * 60 * 60);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.program.trim().is_empty() {
            return Err(ConfigError::Empty { field: "program" });
        }
        if self.stop_command.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "stop_command",
            });
        }
        self.ready_regex()?;
        self.player_regex()?;
        Ok(())
    }

    pub fn ready_regex(&self) -> Result<Regex, ConfigError> {
        compile("ready_pattern", &self.ready_pattern)
    }

    pub fn player_regex(&self) -> Result<Regex, ConfigError> {
        compile("player_pattern", &self.player_pattern)
    }

    pub fn log_path(&self) -> PathBuf {
        if self.log_file.is_absolute() {
            self.log_file.clone()
        } else {
            self.server_dir.join(&self.log_file)
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_minutes.saturating_mul(60))
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn graceful_term_grace(&self) -> Duration {
        Duration::from_secs(self.graceful_term_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn activity_probe_interval(&self) -> Option<Duration> {
        (self.activity_probe_secs > 0).then(|| Duration::from_secs(self.activity_probe_secs))
    }
}

fn compile(field: &'static str, pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|source| ConfigError::Pattern {
        field,
        pattern: pattern.to_string(),
        source,
    })
}
