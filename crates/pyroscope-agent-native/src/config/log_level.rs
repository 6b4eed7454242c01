//! Log level configuration for the profiling agent.
//!
//! This module defines the `LogLevel` enum, its numeric severity ordinal, and parsing
//! from strings (case-insensitive) for caller input and environment variables.
//!
//! # Log Levels
//!
//! The agent supports five log levels. Each maps to an ordinal severity that host
//! bindings pass across the C ABI to `pyroscope_initialize_logging`:
//!
//! | Level   | Ordinal |
//! |---------|---------|
//! | `trace` | 10      |
//! | `debug` | 20      |
//! | `info`  | 30      |
//! | `warn`  | 40      |
//! | `error` | 50      |
//!
//! # Default
//!
//! If no log level is specified or an invalid value is provided, the agent defaults to
//! **ERROR**, the quietest level. Unknown ordinals also resolve to **ERROR**.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::error;

/// Agent log level controlling verbosity of logging output.
///
/// # Parsing
///
/// Log levels can be parsed from strings (case-insensitive):
/// ```
/// use pyroscope_agent_native::config::log_level::LogLevel;
/// use std::str::FromStr;
///
/// assert_eq!(LogLevel::from_str("debug"), Ok(LogLevel::Debug));
/// assert_eq!(LogLevel::from_str("WARN"), Ok(LogLevel::Warn));
/// ```
///
/// # Severity
///
/// ```
/// use pyroscope_agent_native::config::log_level::LogLevel;
///
/// assert_eq!(LogLevel::Trace.severity(), 10);
/// assert_eq!(LogLevel::from_severity(40), LogLevel::Warn);
/// assert_eq!(LogLevel::from_severity(7), LogLevel::Error);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum LogLevel {
    /// Very low priority, extremely verbose information.
    Trace,
    /// Lower priority information useful for debugging.
    Debug,
    /// Useful information about normal operations (agent start/stop, reconfiguration).
    Info,
    /// Hazardous situations that may lead to errors.
    Warn,
    /// Very serious errors. This is the **default** log level.
    #[default]
    Error,
}

/// Provides string representation of log levels in uppercase format.
impl AsRef<str> for LogLevel {
    fn as_ref(&self) -> &str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl LogLevel {
    /// Returns the ordinal severity consumed by the logging collaborator.
    #[must_use]
    pub const fn severity(self) -> u32 {
        match self {
            LogLevel::Trace => 10,
            LogLevel::Debug => 20,
            LogLevel::Info => 30,
            LogLevel::Warn => 40,
            LogLevel::Error => 50,
        }
    }

    /// Maps an ordinal severity back to a level. Unrecognized ordinals resolve to
    /// `Error`.
    #[must_use]
    pub const fn from_severity(severity: u32) -> Self {
        match severity {
            10 => LogLevel::Trace,
            20 => LogLevel::Debug,
            30 => LogLevel::Info,
            40 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }

    /// Converts this `LogLevel` to a `log::LevelFilter` for hosts that log through the
    /// `log` crate.
    ///
    /// ```
    /// use pyroscope_agent_native::config::log_level::LogLevel;
    ///
    /// assert_eq!(LogLevel::Debug.as_level_filter(), log::LevelFilter::Debug);
    /// ```
    #[must_use]
    pub fn as_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }

    /// Lowercase directive accepted by `tracing_subscriber::EnvFilter`.
    #[must_use]
    pub const fn as_filter_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Parses log levels from strings with case-insensitive matching.
///
/// `"warning"` is accepted as an alias for `warn`, since Ruby and Python loggers both
/// spell it that way.
impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!(
                "Invalid log level: '{s}'. Valid levels are: error, warn, info, debug, trace",
            )),
        }
    }
}

impl Serialize for LogLevel {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_filter_directive())
    }
}

/// Deserializes log levels from caller input and environment variables.
///
/// This implementation is lenient: it never fails deserialization. Strings are parsed
/// via `FromStr`, numbers are treated as severity ordinals, and anything else logs an
/// error and falls back to `Error`.
///
/// ```
/// use pyroscope_agent_native::config::log_level::LogLevel;
/// use serde_json::json;
///
/// let level: LogLevel = serde_json::from_value(json!("debug")).unwrap();
/// assert_eq!(level, LogLevel::Debug);
///
/// let level: LogLevel = serde_json::from_value(json!(30)).unwrap();
/// assert_eq!(level, LogLevel::Info);
///
/// let level: LogLevel = serde_json::from_value(json!("loud")).unwrap();
/// assert_eq!(level, LogLevel::Error);
/// ```
impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;

        match value {
            Value::String(s) => match LogLevel::from_str(&s) {
                Ok(level) => Ok(level),
                Err(e) => {
                    error!("{}", e);
                    Ok(LogLevel::Error)
                }
            },
            Value::Number(n) => Ok(n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .map_or(LogLevel::Error, LogLevel::from_severity)),
            other => {
                error!("Expected a string for log level, got {:?}", other);
                Ok(LogLevel::Error)
            }
        }
    }
}
