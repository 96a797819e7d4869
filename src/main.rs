use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use scan_console_rs::config::{ClientConfig, ServerConfig};
use scan_console_rs::controller::SessionController;
use scan_console_rs::dispatcher::ScanDispatcher;
use scan_console_rs::render::Console;
use scan_console_rs::{logging, server};

/// Output still arriving after a task finishes is shown for this long.
const LINGER: Duration = Duration::from_millis(300);

/// Launch scans and follow their output live.
#[derive(Debug, Parser)]
#[command(
    name = "scan-console-rs",
    version,
    about = "Launch network scans and follow their output live.",
    long_about = None
)]
struct Cli {
    /// Enable debug diagnostics on stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scan API (`/scan/start`, `/ws/logs`, `/health`).
    Serve(ServerConfig),
    /// Submit a scan and stream its output until the task finishes.
    Scan {
        /// Hostname, IP address, CIDR block or URL to scan.
        target: String,
        #[command(flatten)]
        client: ClientConfig,
    },
    /// Show which scan tools the API can use.
    Health(ClientConfig),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::initialize_logging(cli.verbose)?;

    match cli.command {
        Command::Serve(config) => server::spawn_server(config).await,
        Command::Scan { target, client } => run_scan_session(&target, client).await,
        Command::Health(client) => print_health(client).await,
    }
}

async fn run_scan_session(target: &str, config: ClientConfig) -> Result<()> {
    let session = SessionController::spawn(config)?;
    let mut console = Console::new(std::io::stdout());
    let mut updates = session.subscribe();

    let accepted = match console.on_submit_scan(&session, target).await {
        Ok(accepted) => accepted,
        Err(e) => {
            console.render(&session.snapshot())?;
            session.shutdown().await?;
            bail!(e);
        }
    };
    info!(task = %accepted.task_id, "following scan output (Ctrl+C to stop)");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = updates.borrow_and_update().clone();
                console.render(&state)?;
                let finished = state
                    .task(&accepted.task_id)
                    .is_some_and(|t| t.status.is_terminal());
                if finished {
                    linger(&mut updates, &mut console).await?;
                    break;
                }
            }
        }
    }

    session.shutdown().await?;
    console.render(&session.snapshot())?;
    Ok(())
}

/// Keep rendering briefly so trailing lines are not cut off.
async fn linger(
    updates: &mut tokio::sync::watch::Receiver<scan_console_rs::types::SessionState>,
    console: &mut Console<std::io::Stdout>,
) -> Result<()> {
    let deadline = tokio::time::sleep(LINGER);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return Ok(()),
            changed = updates.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let state = updates.borrow_and_update().clone();
                console.render(&state)?;
            }
        }
    }
}

async fn print_health(config: ClientConfig) -> Result<()> {
    let dispatcher = ScanDispatcher::new(config)?;
    let report = dispatcher.health().await?;
    println!("status: {}", report.status);
    for (tool, status) in &report.tools {
        println!("  {tool:<8}: {}", serde_json::to_string(status)?.trim_matches('"'));
    }
    Ok(())
}
