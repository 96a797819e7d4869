use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use reqwest::{Client, Response};
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::error::SubmissionError;
use crate::types::{
    validate_target, ErrorBody, HealthReport, ScanTask, StartScanRequest, StartScanResponse,
    TaskAccepted, TaskId,
};

/// Submits scan-start requests and queries the scan API.
///
/// Clones share the same in-flight flag, so the single-submission rule holds
/// across every clone.
#[derive(Debug, Clone)]
pub struct ScanDispatcher {
    http: Client,
    config: ClientConfig,
    in_flight: Arc<AtomicBool>,
}

/// Holds the in-flight flag; releasing it on drop covers every exit path.
struct InFlightGuard(Arc<AtomicBool>);

impl InFlightGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ScanDispatcher {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.submit_timeout())
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            config,
            in_flight: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn is_submitting(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Submit one scan request for `target`.
    ///
    /// The target is validated before anything else, and the in-flight flag
    /// is taken before the first await point, so of two concurrent calls
    /// exactly one reaches the network.
    pub async fn submit(&self, target: &str) -> Result<TaskAccepted, SubmissionError> {
        let target = validate_target(target)?;
        let _guard =
            InFlightGuard::acquire(&self.in_flight).ok_or(SubmissionError::AlreadyInProgress)?;

        let url = self
            .config
            .endpoint("scan/start")
            .map_err(|e| SubmissionError::transport(format!("{e:#}")))?;
        debug!(scan_target = %target, %url, "submitting scan");

        let response = self
            .http
            .post(url)
            .json(&StartScanRequest { target })
            .send()
            .await
            .map_err(|e| SubmissionError::transport(describe_reqwest_error(&e)))?;
        let response = ensure_success(response)
            .await
            .map_err(|e| SubmissionError::transport(format!("{e:#}")))?;
        let body: StartScanResponse = response
            .json()
            .await
            .map_err(|e| SubmissionError::transport(format!("invalid response body: {e}")))?;

        info!(task = %body.task_id, "scan accepted");
        Ok(TaskAccepted {
            task_id: body.task_id,
        })
    }

    /// Fetch the backend's view of one task.
    pub async fn task_status(&self, task_id: &TaskId) -> Result<ScanTask> {
        let url = self.config.endpoint(&format!("scan/tasks/{task_id}"))?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!(describe_reqwest_error(&e)))?;
        let task = ensure_success(response)
            .await?
            .json()
            .await
            .context("invalid task body")?;
        Ok(task)
    }

    /// Query `/health` for tool availability.
    pub async fn health(&self) -> Result<HealthReport> {
        let url = self.config.endpoint("health")?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!(describe_reqwest_error(&e)))?;
        let report = ensure_success(response)
            .await?
            .json()
            .await
            .context("invalid health body")?;
        Ok(report)
    }
}

/// Turn a non-2xx response into an error carrying the server's `detail`.
async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let detail = match response.json::<ErrorBody>().await {
        Ok(body) => body.detail,
        Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
    };
    bail!("server responded {status}: {detail}")
}

fn describe_reqwest_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "request timed out".to_string()
    } else if e.is_connect() {
        format!("cannot reach scan API: {e}")
    } else {
        e.to_string()
    }
}
