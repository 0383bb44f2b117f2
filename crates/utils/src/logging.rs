//! provides logging helpers

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Build the filter: `RUST_LOG` wins, `default_level` applies otherwise.
pub fn env_filter(default_level: &str) -> filter::EnvFilter {
    let default_directive = default_level
        .parse::<filter::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!("unknown log level {default_level:?}, using info");
            filter::LevelFilter::INFO
        });

    filter::EnvFilter::builder()
        .with_default_directive(default_directive.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
///
/// Logs go to stderr, and additionally to a daily rotated `log_file` when one
/// is given. Keep the returned guard alive to flush the file writer.
pub fn init(default_level: &str, log_file: Option<&Path>) -> Option<WorkerGuard> {
    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter(default_level));

    let (file_layer, guard) = match log_file.and_then(file_appender) {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter(default_level));
            (Some(file_layer), Some(guard))
        }
        None => (None, None),
    };

    registry().with(fmt_layer).with(file_layer).init();
    guard
}

fn file_appender(log_file: &Path) -> Option<RollingFileAppender> {
    let dir = log_file.parent().unwrap_or(Path::new("."));
    let prefix = log_file.file_name()?.to_str()?;

    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(dir)
    {
        Ok(appender) => Some(appender),
        Err(e) => {
            eprintln!("failed to create log file {}: {e}", log_file.display());
            None
        }
    }
}
