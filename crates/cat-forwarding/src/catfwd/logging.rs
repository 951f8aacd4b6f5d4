use std::{io, path::Path};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::catfwd::config::LoggingConfig;

/// Keeps the non-blocking writer flushing until dropped.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured level;
/// `verbose` bumps the configured level to `debug`.
pub fn init(logging: &LoggingConfig, verbose: bool) -> anyhow::Result<LoggingRuntime> {
    let fmt = logging.format.trim().to_ascii_lowercase();
    let directive = if verbose {
        "debug"
    } else {
        level_directive(&logging.level)
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .context("logging: init filter")?;

    let (writer, guard) = make_writer(logging.output.trim())?;
    let to_terminal = matches!(logging.output.trim(), "stderr" | "stdout");

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(to_terminal && fmt != "json")
        .with_target(false)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);

    let layer = match fmt.as_str() {
        "json" => layer.json().boxed(),
        "compact" => layer.compact().boxed(),
        _ => layer.boxed(),
    };

    tracing_subscriber::registry().with(filter).with(layer).init();

    Ok(LoggingRuntime { _guard: guard })
}

fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}

fn make_writer(output: &str) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    match output {
        "stderr" => Ok(tracing_appender::non_blocking(io::stderr())),
        "stdout" => Ok(tracing_appender::non_blocking(io::stdout())),
        "discard" => Ok(tracing_appender::non_blocking(io::sink())),
        other => {
            let p = Path::new(other);
            if let Some(parent) = p.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("logging: mkdir {}", parent.display()))?;
                }
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .with_context(|| format!("logging: open {}", p.display()))?;
            Ok(tracing_appender::non_blocking(file))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_levels_fall_back_to_info() {
        assert_eq!(level_directive(" DEBUG "), "debug");
        assert_eq!(level_directive("warn"), "warn");
        assert_eq!(level_directive("loud"), "info");
        assert_eq!(level_directive(""), "info");
    }
}
