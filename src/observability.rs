//! Shared logging configuration, initialization and the per-execution run log.

use std::env;
use std::net::SocketAddr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Ok(level) = env::var("NSFE_LOG_LEVEL") {
        let trimmed = level.trim();
        if !trimmed.is_empty() {
            config.level = trimmed.to_string();
        }
    }

    if let Ok(format) = env::var("NSFE_LOG_FORMAT") {
        if let Some(parsed) = parse_log_format(&format) {
            config.format = parsed;
        }
    }

    if let Ok(include_target) = env::var("NSFE_LOG_TARGET") {
        if let Some(parsed) = parse_bool(&include_target) {
            config.include_target = parsed;
        }
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(component: &'static str, config: &LoggingConfig) {
    info!(
        component,
        event = "app.start",
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target
    );
}

pub fn log_app_bind(bound_addr: SocketAddr) {
    info!(
        component = "tracking_server",
        event = "app.bind",
        bind_addr = %bound_addr,
        route = "/executions"
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// One persisted log line of an execution record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: i64,
    pub msg: String,
    pub level: LogLevel,
}

/// Log accumulator owned by a single execution.
///
/// Info, warning and error lines are kept for the status sink and mirrored to
/// `tracing`; debug lines only go to `tracing`.
#[derive(Debug, Clone)]
pub struct RunLog {
    exec_id: String,
    entries: Vec<LogEntry>,
}

impl RunLog {
    pub fn new(exec_id: impl Into<String>) -> Self {
        Self {
            exec_id: exec_id.into(),
            entries: Vec::new(),
        }
    }

    pub fn exec_id(&self) -> &str {
        &self.exec_id
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn has_errors(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.level == LogLevel::Error)
    }

    pub fn info(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        info!(component = "run_log", exec_id = %self.exec_id, "{msg}");
        self.push(msg, LogLevel::Info);
    }

    pub fn warning(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        warn!(component = "run_log", exec_id = %self.exec_id, "{msg}");
        self.push(msg, LogLevel::Warning);
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        error!(component = "run_log", exec_id = %self.exec_id, "{msg}");
        self.push(msg, LogLevel::Error);
    }

    pub fn debug(&self, msg: impl AsRef<str>) {
        debug!(component = "run_log", exec_id = %self.exec_id, "{}", msg.as_ref());
    }

    fn push(&mut self, msg: String, level: LogLevel) {
        self.entries.push(LogEntry {
            at: Utc::now().timestamp_millis(),
            msg,
            level,
        });
    }
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
