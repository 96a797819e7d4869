use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Crate-specific override, checked before `RUST_LOG`.
pub const LOG_ENV: &str = "SCAN_CONSOLE_LOG";

/// Install the global tracing subscriber.
///
/// Diagnostics go to stderr so scan output on stdout stays clean.
pub fn initialize_logging(verbose: bool) -> Result<()> {
    let directive = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_directive(verbose));
    let filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("invalid log filter: {directive}"))?;

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(filter)
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(())
}

fn default_directive(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    format!("{}={level},tower_http={level}", env!("CARGO_CRATE_NAME"))
}
