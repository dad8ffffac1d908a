use std::panic;
use tracing::error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_error::ErrorLayer;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*, registry::Registry};

/// Initialize the process-wide subscriber: env-filtered fmt output on
/// stderr, plus an optional daily-rolling file when `RELAY_LOG_DIR` is set.
/// Returns the appender guard, which must stay alive for the file writer
/// to flush.
pub fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    let (file_layer, guard) = match std::env::var("RELAY_LOG_DIR") {
        Ok(dir) if !dir.is_empty() => {
            let appender = rolling::daily(dir, "relay_agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .with_timer(fmt::time::UtcTime::rfc_3339());
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .with(ErrorLayer::default());

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        // Already initialized (tests); keep the existing subscriber.
    }
    guard
}

/// Route panics through the structured logger before unwinding.
pub fn init_panic_handler() {
    panic::set_hook(Box::new(|panic_info| {
        let msg = match panic_info.payload().downcast_ref::<&str>() {
            Some(s) => *s,
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(s) => s.as_str(),
                None => "unknown panic",
            },
        };
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());
        error!(message = %msg, location = %location, "Panic");
    }));
}
