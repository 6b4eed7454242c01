//! Logging setup and log line formatting.
//!
//! Host bindings turn on agent logging with a numeric severity (the same ordinals
//! [`LogLevel::severity`] produces) through [`initialize_logging`]. Lines are written to
//! stderr, prefixed with `PYROSCOPE` so they stand out from the host's own output.
//!
//! # Format
//!
//! ```text
//! PYROSCOPE | LEVEL | [span_name{span_fields}:] message {event_fields}
//! ```
//!
//! # Examples
//!
//! ```text
//! PYROSCOPE | INFO | Agent started application_name=checkout sample_rate=100
//! PYROSCOPE | DEBUG | fork{pid=4242}: Detected fork generation=1
//! ```
//!
//! # Filtering
//!
//! `RUST_LOG`, when set, takes precedence over the severity passed by the host.
//!
//! Records emitted through the `log` crate (by the host's Rust code or its
//! dependencies) reach the same subscriber. Without `RUST_LOG`, `log`'s own max level
//! is set to the host's severity so filtered records are dropped at the call site.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::log_level::LogLevel;

static INIT_LOGGING: Once = Once::new();
static LOGGING_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Installs the agent's global subscriber at `severity` (10 trace, 20 debug, 30 info,
/// 40 warn, 50 error; anything else is error).
///
/// Only the first call installs anything. Returns false when a global subscriber owned
/// by someone else was already in place, true otherwise.
pub fn initialize_logging(severity: u32) -> bool {
    INIT_LOGGING.call_once(|| {
        let level = LogLevel::from_severity(severity);
        let (filter, from_env) = match EnvFilter::try_from_default_env() {
            Ok(filter) => (filter, true),
            Err(_) => (EnvFilter::new(level.as_filter_directive()), false),
        };

        let result = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .event_format(Formatter)
            .try_init();

        match result {
            Ok(()) => {
                if !from_env {
                    log::set_max_level(level.as_level_filter());
                }
                LOGGING_INSTALLED.store(true, Ordering::SeqCst);
                tracing::debug!("Logging initialized at {}", level);
            }
            Err(e) => eprintln!("pyroscope: logging not initialized: {e}"),
        }
    });
    LOGGING_INSTALLED.load(Ordering::SeqCst)
}

/// Custom log formatter that prefixes messages with `PYROSCOPE`.
///
/// # Format Structure
///
/// 1. **Prefix**: Always `PYROSCOPE`
/// 2. **Level**: Log level (ERROR, WARN, INFO, DEBUG, TRACE)
/// 3. **Span Context**: Active spans with their fields (if any)
/// 4. **Message**: The log message
/// 5. **Event Fields**: Structured fields attached to the event
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(&mut writer, "PYROSCOPE | {} | ", metadata.level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                // Fields are stored in the span's extensions by the `fmt` layer; a span
                // created before this layer was installed has none.
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
