use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use reqwest::Url;

use crate::engine::ScanMode;
use crate::types::ToolStatus;

/// Value of `NMAP_PATH` that selects canned output instead of a real binary.
pub const MOCK_TOOL_PATH: &str = "mock";

#[cfg(windows)]
const DEFAULT_NMAP_PATH: &str = MOCK_TOOL_PATH;
#[cfg(not(windows))]
const DEFAULT_NMAP_PATH: &str = "/usr/bin/nmap";

/// Backend settings. Every flag can also come from the environment.
#[derive(Debug, Clone, Args)]
pub struct ServerConfig {
    /// Interface to bind the HTTP/WebSocket API on.
    #[arg(long, env = "API_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the HTTP/WebSocket API on.
    #[arg(long, env = "API_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Origin allowed by CORS (the dashboard's URL).
    #[arg(long = "frontend-url", env = "FRONTEND_URL", default_value = "http://localhost:3000")]
    pub frontend_url: String,

    /// Path to the nmap binary, or `mock` for canned output.
    #[arg(long = "nmap-path", env = "NMAP_PATH", default_value = DEFAULT_NMAP_PATH)]
    pub nmap_path: String,

    /// Delay between lines in mock mode, in milliseconds.
    #[arg(long = "mock-step-ms", env = "MOCK_STEP_MS", default_value_t = 500)]
    pub mock_step_ms: u64,

    /// Lines of the current scan replayed to late log subscribers.
    #[arg(long = "log-history", env = "LOG_HISTORY", default_value_t = 1000)]
    pub log_history: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            frontend_url: "http://localhost:3000".into(),
            nmap_path: DEFAULT_NMAP_PATH.into(),
            mock_step_ms: 500,
            log_history: 1000,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tool_status(&self) -> ToolStatus {
        detect_tool_status(&self.nmap_path)
    }

    pub fn scan_mode(&self) -> ScanMode {
        if self.nmap_path == MOCK_TOOL_PATH {
            ScanMode::Mock {
                step: Duration::from_millis(self.mock_step_ms),
            }
        } else {
            ScanMode::Nmap {
                path: PathBuf::from(&self.nmap_path),
            }
        }
    }
}

/// `mock` is always usable; anything else must exist on disk.
pub fn detect_tool_status(path: &str) -> ToolStatus {
    if path == MOCK_TOOL_PATH {
        ToolStatus::Mock
    } else if Path::new(path).exists() {
        ToolStatus::Available
    } else {
        ToolStatus::Unavailable
    }
}

/// Session controller settings.
#[derive(Debug, Clone, Args)]
pub struct ClientConfig {
    /// Base URL of the scan API.
    #[arg(long = "api-url", env = "SCAN_API_URL", default_value = "http://localhost:8000")]
    pub api_url: Url,

    /// Upper bound for a single API request, in milliseconds.
    #[arg(long = "submit-timeout-ms", env = "SUBMIT_TIMEOUT_MS", default_value_t = 10_000)]
    pub submit_timeout_ms: u64,

    /// Log entries retained in memory; older entries are evicted.
    #[arg(long = "max-log-entries", env = "MAX_LOG_ENTRIES", default_value_t = 10_000)]
    pub max_log_entries: usize,

    /// Task status poll interval in milliseconds (0 disables polling).
    #[arg(long = "status-poll-ms", env = "STATUS_POLL_MS", default_value_t = 1000)]
    pub status_poll_ms: u64,
}

impl ClientConfig {
    pub fn new(api_url: Url) -> Self {
        Self {
            api_url,
            submit_timeout_ms: 10_000,
            max_log_entries: 10_000,
            status_poll_ms: 1000,
        }
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn status_poll_interval(&self) -> Option<Duration> {
        (self.status_poll_ms > 0).then(|| Duration::from_millis(self.status_poll_ms))
    }

    /// Resolve an API path against `api_url`, keeping any base path prefix.
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        let mut base = self.api_url.clone();
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        base.join(path.trim_start_matches('/'))
            .with_context(|| format!("invalid endpoint path: {path}"))
    }

    /// WebSocket URL of the log stream, derived from `api_url`.
    pub fn log_stream_url(&self) -> Result<Url> {
        let mut url = self.endpoint("ws/logs")?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => bail!("unsupported API scheme: {other}"),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot switch {} to {scheme}", self.api_url))?;
        Ok(url)
    }
}
