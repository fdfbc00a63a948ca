//! Subscriber setup and span helpers for the renter loops
//!
//! Every background loop and worker runs inside a span built from a
//! [`LogContext`], so events inherit the host key, chunk id or directory
//! they concern without repeating them.

use std::fmt;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::{Result, TelemetryError};

/// Verbosity threshold, ordered from most to least verbose
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

// "warning" is accepted on input only.
const LEVEL_NAMES: [(&str, LogLevel); 6] = [
    ("trace", LogLevel::Trace),
    ("debug", LogLevel::Debug),
    ("info", LogLevel::Info),
    ("warn", LogLevel::Warn),
    ("error", LogLevel::Error),
    ("warning", LogLevel::Warn),
];

impl LogLevel {
    fn name(self) -> &'static str {
        LEVEL_NAMES
            .iter()
            .find(|(_, level)| *level == self)
            .map_or("info", |(name, _)| *name)
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LogLevel {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        LEVEL_NAMES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(wanted))
            .map(|(_, level)| *level)
            .ok_or_else(|| TelemetryError::Logging(format!("Unknown log level {:?}", s)))
    }
}

/// Line layout of emitted events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event, for collectors
    Json,
    /// Multi-line human output
    Pretty,
    /// Single-line human output
    Compact,
}

/// Where events are written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    Stderr,
    /// Appended to; parent directories are created on init
    File(PathBuf),
}

/// `[log]` table of the renter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Extra filter directives such as `renter_core::worker=trace`
    pub directives: Vec<String>,
    /// Print the module path of each event
    pub show_target: bool,
    /// Print file and line of each event
    pub show_source: bool,
    pub thread_ids: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            output: LogOutput::Stderr,
            directives: Vec::new(),
            show_target: true,
            show_source: false,
            thread_ids: false,
        }
    }
}

impl LogConfig {
    /// Filter built from `level` plus `directives`
    ///
    /// `RUST_LOG`, when set, replaces both.
    pub fn filter(&self) -> Result<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        let mut filter = EnvFilter::new(self.level.name());
        for directive in &self.directives {
            let parsed = directive.parse().map_err(|e| {
                TelemetryError::Logging(format!("Bad filter directive {:?}: {}", directive, e))
            })?;
            filter = filter.add_directive(parsed);
        }
        Ok(filter)
    }
}

/// Fields shared by the events of one unit of work
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogContext {
    pub component: &'static str,
    pub host: Option<String>,
    pub chunk: Option<String>,
    pub dir: Option<String>,
}

impl LogContext {
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            ..Self::default()
        }
    }

    pub fn with_host(mut self, host: impl fmt::Display) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn with_chunk(mut self, chunk: impl fmt::Display) -> Self {
        self.chunk = Some(chunk.to_string());
        self
    }

    pub fn with_dir(mut self, dir: impl fmt::Display) -> Self {
        self.dir = Some(dir.to_string());
        self
    }

    /// Info-level span named after the component; unset fields stay empty
    pub fn span(&self) -> tracing::Span {
        let span = tracing::info_span!(
            "renter",
            component = self.component,
            host = tracing::field::Empty,
            chunk = tracing::field::Empty,
            dir = tracing::field::Empty,
        );
        for (field, value) in [("host", &self.host), ("chunk", &self.chunk), ("dir", &self.dir)] {
            if let Some(value) = value {
                span.record(field, value.as_str());
            }
        }
        span
    }
}

/// Install the global subscriber described by `config`
///
/// Fails if a subscriber is already installed or a directive does not parse.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = config.filter()?;
    match &config.output {
        LogOutput::Stdout => install(config, filter, std::io::stdout),
        LogOutput::Stderr => install(config, filter, std::io::stderr),
        LogOutput::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            install(config, filter, Mutex::new(file))
        }
    }
}

fn install<W>(config: &LogConfig, filter: EnvFilter, writer: W) -> Result<()>
where
    W: for<'a> tracing_subscriber::fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(config.show_target)
        .with_file(config.show_source)
        .with_line_number(config.show_source)
        .with_thread_ids(config.thread_ids);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    installed.map_err(|e| TelemetryError::Init(format!("Subscriber already installed: {}", e)))
}
