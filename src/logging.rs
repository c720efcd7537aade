//! Structured logging setup.
//!
//! Engine events carry consistent fields:
//!
//! - `operation`: what is happening ("get", "put", "execute", "lock", ...)
//! - `status`: outcome where relevant ("hit", "miss")
//! - `tier`: cache tier emitting the event ("memory", "storage")
//! - `identity`: the execution identity involved
//!
//! The output format comes from `MARMOT_LOG_FORMAT` ("pretty", "compact",
//! "json"); the level from `RUST_LOG` when set, else from the session
//! verbosity.

use serde::{Deserialize, Serialize};
use std::{fmt as std_fmt, io};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{
    fmt::{self, format::Writer},
    prelude::*,
    EnvFilter,
};

/// How chatty the engine is about its own work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    /// Session lifecycle only.
    #[default]
    Info,
    /// Cache decisions per call.
    Debug,
    /// Engine internals for this crate, including lock traffic.
    Verbose,
    /// Everything, dependencies included.
    Internal,
}

impl Verbosity {
    fn directive(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Verbose => "marmot=trace,info",
            Self::Internal => "trace",
        }
    }
}

/// Formatter that labels events with the crate name instead of the full
/// module path.
struct MarmotFormatter {
    with_ansi: bool,
}

impl<S, N> FormatEvent<S, N> for MarmotFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std_fmt::Result {
        let meta = event.metadata();

        write!(
            writer,
            "{} ",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6fZ")
        )?;

        if self.with_ansi {
            let level_style = match *meta.level() {
                tracing::Level::ERROR => "\x1b[31m",
                tracing::Level::WARN => "\x1b[33m",
                tracing::Level::INFO => "\x1b[32m",
                tracing::Level::DEBUG => "\x1b[34m",
                tracing::Level::TRACE => "\x1b[35m",
            };
            write!(writer, "{}{:5}(marmot)\x1b[0m: ", level_style, meta.level())?;
        } else {
            write!(writer, "{:5}(marmot): ", meta.level())?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Log format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, colored.
    Pretty,
    /// Plain single-line output.
    Compact,
    /// JSON lines for log aggregation.
    Json,
}

impl LogFormat {
    /// Parse from `MARMOT_LOG_FORMAT`; in CI the default flips to compact.
    pub fn from_env() -> Self {
        match std::env::var("MARMOT_LOG_FORMAT")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "json" => Self::Json,
            "compact" => Self::Compact,
            "pretty" => Self::Pretty,
            _ => {
                if std::env::var("CI").is_ok() {
                    Self::Compact
                } else {
                    Self::Pretty
                }
            }
        }
    }
}

/// Install the global tracing subscriber. Idempotent: later calls (or a
/// subscriber installed by the embedding application) win and this becomes
/// a no-op.
pub fn init(verbosity: Verbosity) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(verbosity.directive()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match LogFormat::from_env() {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(MarmotFormatter { with_ansi: true })
                    .with_writer(io::stderr),
            )
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(MarmotFormatter { with_ansi: false })
                    .with_writer(io::stderr),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_ansi(false)
                    .with_writer(io::stderr)
                    .json(),
            )
            .try_init(),
    };
    let _ = result;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_ordering() {
        assert!(Verbosity::Info < Verbosity::Debug);
        assert!(Verbosity::Debug < Verbosity::Verbose);
        assert!(Verbosity::Verbose < Verbosity::Internal);
        assert_eq!(Verbosity::default(), Verbosity::Info);
    }

    #[test]
    fn test_init_is_idempotent() {
        init(Verbosity::Info);
        init(Verbosity::Debug);
    }
}
