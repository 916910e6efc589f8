use std::fmt;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Wraps each field of a log line in brackets
///
/// Format: `[TIMESTAMP] [LEVEL] [SPAN] [TARGET: FILE:LINE]: MESSAGE`. The
/// location block is dropped when `show_location` is off, which keeps
/// terminal output short.
#[derive(Debug, Clone, Copy)]
pub struct BracketedFormatter {
    pub show_location: bool,
}

impl Default for BracketedFormatter {
    fn default() -> Self {
        Self {
            show_location: true,
        }
    }
}

impl BracketedFormatter {
    pub fn compact() -> Self {
        Self {
            show_location: false,
        }
    }
}

fn short_target(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}

impl<S, N> FormatEvent<S, N> for BracketedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();

        let now = chrono::Local::now();
        write!(writer, "[{}] ", now.format("%Y-%m-%dT%H:%M:%S%.3f"))?;
        write!(writer, "[{:5}] ", metadata.level())?;

        // Innermost span, else the last segment of the module path.
        let scope_name = ctx
            .event_scope()
            .and_then(|scope| scope.from_root().last().map(|span| span.name()))
            .unwrap_or_else(|| short_target(metadata.target()));
        write!(writer, "[{}] ", scope_name)?;

        if self.show_location {
            match (metadata.file(), metadata.line()) {
                (Some(file), Some(line)) => {
                    write!(writer, "[{}: {}:{}]: ", metadata.target(), file, line)?
                }
                _ => write!(writer, "[{}]: ", metadata.target())?,
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_target() {
        assert_eq!(short_target("yolo_dataset_tools::core::transform::merge"), "merge");
        assert_eq!(short_target("main"), "main");
    }
}
