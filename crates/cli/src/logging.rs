//! Logging setup.
//!
//! Dev mode (`APP_ENV=dev`): verbose console output on stderr, including
//! QUIC event tracing via the `quinn` targets; `RUST_LOG` overrides the
//! filter. Normal mode: daily-rolling files under `~/.mpf/log/`, stderr
//! silent. Stdout is never logged to: in agent mode it carries the binary
//! tunnel protocol.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialise tracing. The returned guard must be held for the process
/// lifetime; dropping it flushes the file writer.
pub fn init(agent_mode: bool) -> Option<WorkerGuard> {
    if common::is_dev() {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("debug"))
            .add_directive("quinn=debug".parse().expect("static directive"))
            .add_directive("rustls=debug".parse().expect("static directive"))
            .add_directive("russh=info".parse().expect("static directive"));

        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(true)
                    .with_target(true),
            )
            .init();
        return None;
    }

    let Some(home) = dirs::home_dir() else {
        // No home, no file logging. Stay silent rather than polluting the
        // terminal session.
        return None;
    };
    let log_dir = home.join(".mpf").join("log");
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("warning: could not create log directory {}: {e}", log_dir.display());
        return None;
    }

    let prefix = if agent_mode { "agent" } else { "mpf" };
    let file_name = format!("{prefix}-{}.log", uid());
    let file_appender = tracing_appender::rolling::daily(&log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Cap transport-internal chatter so RUST_LOG=debug stays readable.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("russh=warn".parse().expect("static directive"))
        .add_directive("quinn=warn".parse().expect("static directive"))
        .add_directive("quinn_proto=warn".parse().expect("static directive"))
        .add_directive("quinn_udp=warn".parse().expect("static directive"))
        .add_directive("rustls=warn".parse().expect("static directive"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
        .init();

    Some(guard)
}

#[cfg(unix)]
fn uid() -> u32 {
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
fn uid() -> u32 {
    0
}
