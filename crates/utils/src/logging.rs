//! provides logging helpers

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::InitError;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// file name prefix of the rolling log files
const LOG_FILE_PREFIX: &str = "virt-device-plugin.log";

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
///
/// Events always go to stderr. When `log_dir` is given they are additionally
/// written to a daily rotated file in that directory; the returned guard must
/// be kept alive for the non-blocking writer to flush.
pub fn init(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>, InitError> {
    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(LOG_FILE_PREFIX)
                .max_log_files(3)
                .build(dir)?;
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(env_filter());
            (Some(file_layer), Some(guard))
        }
        None => (None, None),
    };

    registry().with(fmt_layer).with(file_layer).init();
    Ok(guard)
}
