//! Log formatting for the transport.
//!
//! Lines look like `APM_TRANSPORT | LEVEL | span{fields}: message fields`,
//! which keeps transport output easy to pick out of the host application's
//! logs.

use std::fmt;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::{
    EnvFilter,
    fmt::{
        FmtContext, FormattedFields,
        format::{self, FormatEvent, FormatFields},
    },
    registry::LookupSpan,
};

use crate::config::log_level::LogLevel;

pub const LOG_PREFIX: &str = "APM_TRANSPORT";

// HTTP internals are only noise at the levels the transport logs at.
const QUIET_DEPENDENCIES: &str = "h2=off,hyper=off,hyper_util=off,reqwest=off,rustls=off";

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
        write!(&mut writer, "{LOG_PREFIX} | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>() {
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

#[must_use]
pub fn env_filter(level: LogLevel) -> EnvFilter {
    let directives = format!("{QUIET_DEPENDENCIES},{}", level.as_level_filter());
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(level.as_ref()))
}

/// Installs a global subscriber writing transport logs to stdout.
///
/// Hosts that already configure `tracing` should skip this and only add
/// [`Formatter`] if they want the same line format.
pub fn init(level: LogLevel) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter(level))
        .with_level(true)
        .with_target(false)
        .without_time()
        .event_format(Formatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
}
