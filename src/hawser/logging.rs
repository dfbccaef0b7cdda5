use std::{io, path::Path};

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::hawser::config::LoggingConfig;

/// Install the global tracing subscriber.
///
/// The returned guard owns the non-blocking writer thread; hold it for the
/// lifetime of the process or buffered log lines are lost on exit.
pub fn init(cfg: &LoggingConfig) -> anyhow::Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            EnvFilter::try_new(match cfg.level.trim().to_ascii_lowercase().as_str() {
                "debug" => "debug",
                "warn" => "warn",
                "error" => "error",
                "trace" => "trace",
                _ => "info",
            })
        })
        .context("logging: init filter")?;

    let (writer, guard) = writer_for(cfg.output.trim())?;

    let format = cfg.format.trim().to_ascii_lowercase();
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(format != "json")
        .with_target(true)
        .with_file(cfg.add_source)
        .with_line_number(cfg.add_source);

    let fmt_layer = if format == "json" {
        fmt_layer.json().boxed()
    } else {
        fmt_layer.boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    Ok(guard)
}

fn writer_for(
    output: &str,
) -> anyhow::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    match output {
        "" | "stderr" => Ok(tracing_appender::non_blocking(io::stderr())),
        "stdout" => Ok(tracing_appender::non_blocking(io::stdout())),
        "discard" => Ok(tracing_appender::non_blocking(io::sink())),
        path => {
            let p = Path::new(path);
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
