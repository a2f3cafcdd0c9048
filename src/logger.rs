//! Logging setup for the demo binary and for applications embedding the estimator.
//!
//! Output format:
//!
//! ```text
//! [INFO 2026-01-01 12:00:00 incremental_calibration::estimator] accepted batch ...
//! [DEBUG 2026-01-01 12:00:00 gauss_newton.rs:412]    0  1.2e+00 ...
//! ```
//!
//! The default level can always be overridden through `RUST_LOG`.

use chrono::Local;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    EnvFilter,
    fmt::{FmtContext, FormatEvent, FormatFields, format::Writer},
    registry::LookupSpan,
};

/// Initialize the global subscriber at INFO.
///
/// ```no_run
/// incremental_calibration::init_logger();
/// tracing::info!("calibration session started");
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize at INFO when `verbose`, otherwise at WARN, matching the estimator's
/// `Options::verbose` switch.
pub fn init_logger_for(verbose: bool) {
    init_logger_with_level(if verbose { Level::INFO } else { Level::WARN })
}

/// Initialize the global subscriber with a custom default level.
///
/// Calling this twice is harmless; the second call leaves the first subscriber in place.
pub fn init_logger_with_level(default_level: Level) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .event_format(BracketFormatter)
        .try_init();
}

/// `[LEVEL timestamp location] message`
struct BracketFormatter;

impl BracketFormatter {
    fn level_tag(level: &Level) -> &'static str {
        match *level {
            Level::ERROR => "\x1b[31mERROR\x1b[0m",
            Level::WARN => "\x1b[33mWARN\x1b[0m",
            Level::INFO => "\x1b[32mINFO\x1b[0m",
            Level::DEBUG => "\x1b[34mDEBUG\x1b[0m",
            Level::TRACE => "\x1b[35mTRACE\x1b[0m",
        }
    }
}

impl<S, N> FormatEvent<S, N> for BracketFormatter
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
        let level = metadata.level();

        write!(
            writer,
            "[{} {} ",
            Self::level_tag(level),
            Local::now().format("%Y-%m-%d %H:%M:%S")
        )?;

        // file:line for DEBUG/TRACE, module path otherwise
        match (metadata.file(), metadata.line()) {
            (Some(file), Some(line)) if *level >= Level::DEBUG => {
                let filename = file.rsplit('/').next().unwrap_or(file);
                write!(writer, "{filename}:{line}")?;
            }
            _ => write!(writer, "{}", metadata.target())?,
        }

        write!(writer, "] ")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
