//! Logging utilities for httptap
//!
//! This module provides logging setup for the capture pipeline.

use chrono::{SecondsFormat, Utc};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Single-line event formatter.
///
/// Log lines use the same ISO-8601 UTC timestamps as emitted message
/// records: `<timestamp> <level> <target>: <fields>`.
pub struct TapFormatter;

impl<S, N> FormatEvent<S, N> for TapFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let level = match *metadata.level() {
            Level::ERROR => "error",
            Level::WARN => "warn",
            Level::INFO => "info",
            Level::DEBUG => "debug",
            Level::TRACE => "trace",
        };
        write!(
            writer,
            "{} {:>5} {}: ",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level,
            metadata.target(),
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Initialize the logging system.
///
/// Logs go to stderr so the stdout message sink stays machine-readable.
pub fn init_logging(log_level: Level) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .event_format(TapFormatter)
        .finish();

    // A second init (e.g. from tests) keeps the first subscriber.
    let _ = tracing::subscriber::set_global_default(subscriber);
}
