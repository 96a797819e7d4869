use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use ::time::{format_description::well_known, OffsetDateTime};
use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::hub::LogHub;

/// How the backend produces scan output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanMode {
    /// Replay canned nmap-style output, one line per `step`.
    Mock { step: Duration },
    /// Run `nmap -sV <target>` and stream its output.
    Nmap { path: PathBuf },
}

/// Run one scan against `target`, publishing every output line to `hub`.
///
/// - The first line announces the target.
/// - Cancellation stops the scan promptly and returns an error.
/// - A non-zero exit of the external tool is an error.
pub async fn run_scan(
    target: &str,
    mode: &ScanMode,
    hub: &LogHub,
    cancel: CancellationToken,
) -> Result<()> {
    hub.publish(format!("Starting scan of target: {target}")).await;
    match mode {
        ScanMode::Mock { step } => run_mock(target, *step, hub, &cancel).await,
        ScanMode::Nmap { path } => run_nmap(path, target, hub, &cancel).await,
    }
}

/// Canned output for mock mode.
pub fn mock_output(target: &str) -> Vec<String> {
    vec![
        format!("Starting Nmap 7.94 ( https://nmap.org ) at {}", now_iso_like()),
        format!("Nmap scan report for {target}"),
        "Host is up (0.0010s latency).".to_string(),
        String::new(),
        "PORT    STATE SERVICE".to_string(),
        "80/tcp  open  http".to_string(),
        "443/tcp open  https".to_string(),
        String::new(),
        "Nmap done: 1 IP address (1 host up) scanned in 0.10 seconds".to_string(),
    ]
}

async fn run_mock(
    target: &str,
    step: Duration,
    hub: &LogHub,
    cancel: &CancellationToken,
) -> Result<()> {
    for line in mock_output(target) {
        tokio::select! {
            _ = cancel.cancelled() => bail!("scan cancelled"),
            _ = time::sleep(step) => {}
        }
        hub.publish(line).await;
    }
    Ok(())
}

async fn run_nmap(
    path: &Path,
    target: &str,
    hub: &LogHub,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut child = Command::new(path)
        .arg("-sV")
        .arg(target)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to launch {}", path.display()))?;

    let stdout = child.stdout.take().context("tool stdout not captured")?;
    let stderr = child.stderr.take().context("tool stderr not captured")?;
    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let (mut out_done, mut err_done) = (false, false);

    while !(out_done && err_done) {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                bail!("scan cancelled");
            }
            line = out_lines.next_line(), if !out_done => match line? {
                Some(l) => hub.publish(l.trim()).await,
                None => out_done = true,
            },
            line = err_lines.next_line(), if !err_done => match line? {
                Some(l) => hub.publish(l.trim()).await,
                None => err_done = true,
            },
        }
    }

    let status = child.wait().await.context("failed to wait for scan tool")?;
    if !status.success() {
        bail!("{} exited with {status}", path.display());
    }
    Ok(())
}

fn now_iso_like() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(hub: &LogHub) -> Vec<String> {
        hub.subscribe().await.0
    }

    #[tokio::test]
    async fn mock_scan_publishes_announcement_then_canned_output() {
        let hub = LogHub::new(100);
        let mode = ScanMode::Mock { step: Duration::ZERO };
        run_scan("example.com", &mode, &hub, CancellationToken::new())
            .await
            .unwrap();

        let lines = drain(&hub).await;
        assert_eq!(lines[0], "Starting scan of target: example.com");
        assert!(lines.contains(&"Nmap scan report for example.com".to_string()));
        assert!(lines.last().unwrap().starts_with("Nmap done"));
        assert_eq!(lines.len(), 1 + mock_output("example.com").len());
    }

    #[tokio::test]
    async fn cancelled_mock_scan_stops_early() {
        let hub = LogHub::new(100);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mode = ScanMode::Mock { step: Duration::from_secs(60) };
        let err = run_scan("10.0.0.1", &mode, &hub, cancel).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert_eq!(drain(&hub).await.len(), 1);
    }

    #[tokio::test]
    async fn missing_tool_is_an_error() {
        let hub = LogHub::new(10);
        let mode = ScanMode::Nmap { path: PathBuf::from("/definitely/not/here/nmap") };
        assert!(run_scan("10.0.0.1", &mode, &hub, CancellationToken::new()).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn external_tool_output_is_streamed_line_by_line() {
        // `echo` stands in for the scanner: it prints its arguments.
        let hub = LogHub::new(10);
        let mode = ScanMode::Nmap { path: PathBuf::from("echo") };
        run_scan("10.0.0.1", &mode, &hub, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            drain(&hub).await,
            vec!["Starting scan of target: 10.0.0.1", "-sV 10.0.0.1"]
        );
    }
}
