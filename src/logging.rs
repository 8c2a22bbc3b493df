use std::io;

use tracing::Subscriber;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, Layer,
};

fn file_layer<S>(log_dir: &str, file_name: &str, level: LevelFilter) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_writer(tracing_appender::rolling::daily(log_dir, file_name))
        .with_ansi(false)
        .with_filter(level)
}

/// Initialize file-based logging with daily rotation and level separation
///
/// Log files are created as `{log_dir}/info.log.2024-12-22`,
/// `{log_dir}/error.log.2024-12-22`, etc. Console output is kept alongside.
/// The level threshold comes from `RUST_LOG`, default `info`.
pub fn init(log_dir: &str) -> io::Result<()> {
    std::fs::create_dir_all(log_dir)?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_ansi(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer(log_dir, "info.log", LevelFilter::INFO))
        .with(file_layer(log_dir, "warn.log", LevelFilter::WARN))
        .with(file_layer(log_dir, "error.log", LevelFilter::ERROR))
        .with(file_layer(log_dir, "debug.log", LevelFilter::DEBUG))
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}
