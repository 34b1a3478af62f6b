//! burrow-shim — intermediate process running as the sandbox account.
//!
//! Spawned by the driver through the setuid helper with the setup pipe
//! fd advertised in `BURROW_SHIM`. Receives the serialised outcome,
//! starts the container and supervises it; the container's exit code is
//! forwarded verbatim to the driver.

// Shim is a standalone binary — stderr is the correct error channel.
#![allow(clippy::print_stderr)]

#[cfg(not(unix))]
fn main() {
    eprintln!("[burrow-shim] only supported on Unix");
    std::process::exit(1);
}

#[cfg(unix)]
fn main() {
    use anyhow::Context;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = burrow::shim_main().context("shim setup failed");
    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("[burrow-shim] {e:#}");
            std::process::exit(burrow::EXIT_FAILURE);
        }
    }
}
