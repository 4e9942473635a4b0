//! Tracing initialization
//!
//! The configured level (`debug`, `info`, `error`) becomes the
//! `EnvFilter` threshold. When `log_file` is set, output goes through a
//! non-blocking daily-rolling appender so files carry a date suffix;
//! otherwise logs go to stderr.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::{Error, Result};

/// Initialize the global tracing subscriber.
///
/// Returns the appender worker guard when logging to a file; the caller
/// must keep it alive for the lifetime of the process or buffered log
/// lines are lost on shutdown.
pub fn init_tracing(config: &Config) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(&config.base.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.base.log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file_name = path
                .file_name()
                .ok_or_else(|| Error::Io(std::io::Error::other("log_file must name a file")))?;

            let appender = tracing_appender::rolling::daily(
                dir.unwrap_or_else(|| std::path::Path::new(".")),
                file_name,
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();

            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}
