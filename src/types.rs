use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::SubmissionError;

/// Opaque identifier the backend assigns to an accepted scan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Fresh random identifier (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle of one scan: `Queued -> Running -> {Completed, Failed}`.
///
/// A task may also fail straight out of `Queued` when it dies before the
/// runner reports it as started.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Queued, TaskStatus::Running)
                | (TaskStatus::Queued, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One submitted scan and its lifecycle status.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanTask {
    pub id: TaskId,
    pub target: String,
    pub status: TaskStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

impl ScanTask {
    pub fn queued(id: TaskId, target: impl Into<String>) -> Self {
        Self {
            id,
            target: target.into(),
            status: TaskStatus::Queued,
            started_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Where a log entry came from: the live stream, or a synthetic notice about
/// an infrastructure failure (submission error, stream disconnect).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogOrigin {
    Stream,
    Notice,
}

/// One line of scan output. Immutable once appended.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub sequence: u64,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    pub origin: LogOrigin,
}

/// Identifies one physical log stream connection. A new id is minted for
/// every `open`, so events from a replaced connection can be told apart.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamConnectionState {
    Connecting,
    Open,
    #[default]
    Closed,
    Errored,
}

/// Read-only snapshot of the session, handed to presentation.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub active_target: Option<String>,
    pub is_submitting: bool,
    pub logs: Vec<LogEntry>,
    pub connection_state: StreamConnectionState,
    pub tasks: Vec<ScanTask>,
    /// Entries evicted from the front of `logs` by the retention cap.
    pub dropped_logs: u64,
}

impl SessionState {
    pub fn task(&self, id: &TaskId) -> Option<&ScanTask> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn log_lines(&self) -> Vec<&str> {
        self.logs.iter().map(|e| e.text.as_str()).collect()
    }
}

/// Body of `POST /scan/start`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StartScanRequest {
    pub target: String,
}

/// Success body of `POST /scan/start`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StartScanResponse {
    #[serde(alias = "id")]
    pub task_id: TaskId,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub message: String,
}

/// Error body returned by the backend for rejected requests.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub detail: String,
}

/// Outcome of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAccepted {
    pub task_id: TaskId,
}

/// Availability of an external scan tool on the backend host.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Available,
    Unavailable,
    Mock,
}

impl ToolStatus {
    /// Mock mode counts as usable: it produces canned output.
    pub fn is_usable(self) -> bool {
        matches!(self, ToolStatus::Available | ToolStatus::Mock)
    }
}

/// Body of `GET /health`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub status: String,
    pub tools: BTreeMap<String, ToolStatus>,
}

/// Normalize and validate a scan target.
///
/// Accepts an IP address, a CIDR block, a hostname, or a URL (reduced to its
/// host). Surrounding whitespace is ignored.
pub fn validate_target(raw: &str) -> Result<String, SubmissionError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SubmissionError::InvalidTarget);
    }

    let candidate = if trimmed.contains("://") {
        Url::parse(trimmed)
            .ok()
            .and_then(|url| url.host_str().map(|h| h.trim_matches(['[', ']']).to_string()))
            .ok_or(SubmissionError::InvalidTarget)?
    } else {
        trimmed.to_string()
    };

    if candidate.parse::<IpAddr>().is_ok() || candidate.parse::<IpNet>().is_ok() {
        return Ok(candidate);
    }
    if is_hostname(&candidate) {
        return Ok(candidate);
    }
    Err(SubmissionError::InvalidTarget)
}

fn is_hostname(s: &str) -> bool {
    let s = s.strip_suffix('.').unwrap_or(s);
    if s.is_empty() || s.len() > 253 {
        return false;
    }
    s.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}
