use std::{fs::OpenOptions, io, path::PathBuf};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::sluice::config;

/// Overrides `logging.level` with a full filter directive, e.g. `sluice=debug,hyper=warn`.
pub const LOG_ENV: &str = "SLUICE_LOG";

/// Flushes buffered log lines when dropped; hold it for the life of the process.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LogOutput {
    Stderr,
    Stdout,
    Discard,
    File(PathBuf),
}

impl LogOutput {
    fn parse(s: &str) -> Self {
        match s.trim() {
            "" | "stderr" => Self::Stderr,
            "stdout" => Self::Stdout,
            "discard" | "none" => Self::Discard,
            path => Self::File(PathBuf::from(path)),
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Stderr | Self::Stdout)
    }

    fn open(&self) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
        let pair = match self {
            Self::Stderr => tracing_appender::non_blocking(io::stderr()),
            Self::Stdout => tracing_appender::non_blocking(io::stdout()),
            Self::Discard => tracing_appender::non_blocking(io::sink()),
            Self::File(p) => {
                if let Some(dir) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
                    std::fs::create_dir_all(dir)
                        .with_context(|| format!("logging: mkdir {}", dir.display()))?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(p)
                    .with_context(|| format!("logging: open {}", p.display()))?;
                tracing_appender::non_blocking(file)
            }
        };
        Ok(pair)
    }
}

fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

pub fn init(logging: &config::LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let json = logging.format.trim().eq_ignore_ascii_case("json");
    let output = LogOutput::parse(&logging.output);

    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(level_directive(&logging.level)))
        .context("logging: init filter")?;

    let (writer, guard) = output.open()?;

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(!json && output.is_terminal())
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);
    let layer = if json { layer.json().boxed() } else { layer.boxed() };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .context("logging: install subscriber")?;

    Ok(LoggingRuntime { _guard: guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_levels_fall_back_to_info() {
        assert_eq!(level_directive("DEBUG"), "debug");
        assert_eq!(level_directive(" warning "), "warn");
        assert_eq!(level_directive("loud"), "info");
    }

    #[test]
    fn output_targets() {
        assert_eq!(LogOutput::parse(""), LogOutput::Stderr);
        assert_eq!(LogOutput::parse(" stdout "), LogOutput::Stdout);
        assert_eq!(LogOutput::parse("none"), LogOutput::Discard);
        assert_eq!(
            LogOutput::parse("/var/log/sluice.log"),
            LogOutput::File(PathBuf::from("/var/log/sluice.log"))
        );
        assert!(!LogOutput::Discard.is_terminal());
    }

    #[test]
    fn file_output_creates_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("sluice-log-{}", std::process::id()));
        let file = dir.join("nested").join("sluice.log");
        let (_w, _guard) = LogOutput::File(file.clone()).open().unwrap();
        assert!(file.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
