use std::collections::VecDeque;

use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::SubmissionError;
use crate::types::{
    ConnectionId, LogEntry, LogOrigin, ScanTask, SessionState, StreamConnectionState, TaskAccepted,
    TaskId, TaskStatus,
};

/// The single mutator of session state.
///
/// Every change goes through one of the operations below; the controller owns
/// the only instance and applies producer events to it one at a time.
///
/// Log sequence numbers never restart, even across sessions, so a renderer
/// can track "last seen" with a single integer.
#[derive(Debug)]
pub struct SessionStore {
    active_target: Option<String>,
    is_submitting: bool,
    logs: VecDeque<LogEntry>,
    max_log_entries: usize,
    next_sequence: u64,
    dropped_logs: u64,
    connection: Option<ConnectionId>,
    connection_state: StreamConnectionState,
    tasks: Vec<ScanTask>,
}

impl SessionStore {
    pub fn new(max_log_entries: usize) -> Self {
        Self {
            active_target: None,
            is_submitting: false,
            logs: VecDeque::new(),
            max_log_entries: max_log_entries.max(1),
            next_sequence: 1,
            dropped_logs: 0,
            connection: None,
            connection_state: StreamConnectionState::Closed,
            tasks: Vec::new(),
        }
    }

    /// Begin a new session: clear the log feed and mark a submission in flight.
    pub fn start_session(&mut self, target: &str) -> Result<(), SubmissionError> {
        if self.is_submitting {
            return Err(SubmissionError::AlreadyInProgress);
        }
        self.logs.clear();
        self.dropped_logs = 0;
        self.active_target = Some(target.to_string());
        self.is_submitting = true;
        debug!(scan_target = target, "session started");
        Ok(())
    }

    /// Append a line of scan output.
    pub fn append_log(&mut self, text: impl Into<String>) -> u64 {
        self.push(text.into(), LogOrigin::Stream)
    }

    /// Append a synthetic entry describing an infrastructure failure.
    pub fn append_notice(&mut self, text: impl Into<String>) -> u64 {
        self.push(text.into(), LogOrigin::Notice)
    }

    /// Append a line delivered by connection `id`.
    ///
    /// Accepted only from the current connection while it is open; lines from
    /// a replaced or closed connection are dropped.
    pub fn append_stream_line(&mut self, id: ConnectionId, text: impl Into<String>) -> Option<u64> {
        if self.connection != Some(id) || self.connection_state != StreamConnectionState::Open {
            debug!(connection = %id, "dropping line from inactive connection");
            return None;
        }
        Some(self.append_log(text))
    }

    fn push(&mut self, text: String, origin: LogOrigin) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        if self.logs.len() == self.max_log_entries {
            self.logs.pop_front();
            self.dropped_logs += 1;
        }
        self.logs.push_back(LogEntry {
            sequence,
            text,
            received_at: OffsetDateTime::now_utc(),
            origin,
        });
        sequence
    }

    /// Record the outcome of the outstanding submission.
    ///
    /// Success registers a queued task. Failure keeps the active target and
    /// task list as they were; transport failures are reported in the feed.
    pub fn complete_submission(
        &mut self,
        target: &str,
        outcome: &Result<TaskAccepted, SubmissionError>,
    ) -> Option<&ScanTask> {
        self.is_submitting = false;
        match outcome {
            Ok(accepted) => {
                if self.tasks.iter().any(|t| t.id == accepted.task_id) {
                    warn!(task = %accepted.task_id, "task id accepted twice; keeping the first");
                    return None;
                }
                self.tasks
                    .push(ScanTask::queued(accepted.task_id.clone(), target));
                self.tasks.last()
            }
            Err(err) => {
                if err.is_reportable() {
                    self.append_notice(format!("Error: {err}"));
                }
                None
            }
        }
    }

    /// Move one task to `status`. Unknown ids and illegal transitions are
    /// logged and ignored.
    pub fn update_task_status(&mut self, id: &TaskId, status: TaskStatus) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|t| &t.id == id) else {
            warn!(task = %id, %status, "status update for unknown task");
            return false;
        };
        if task.status == status {
            return false;
        }
        if !task.status.can_transition_to(status) {
            warn!(task = %id, from = %task.status, to = %status, "illegal task transition ignored");
            return false;
        }
        debug!(task = %id, from = %task.status, to = %status, "task status changed");
        task.status = status;
        true
    }

    /// Apply an observed status that may have skipped `Running`
    /// (a short scan polled only after it finished).
    pub fn reconcile_task_status(&mut self, id: &TaskId, observed: TaskStatus) -> bool {
        let current = self.task(id).map(|t| t.status);
        if current == Some(TaskStatus::Queued) && observed == TaskStatus::Completed {
            self.update_task_status(id, TaskStatus::Running);
        }
        self.update_task_status(id, observed)
    }

    /// A new connection replaces whatever was current.
    pub fn begin_connection(&mut self, id: ConnectionId) {
        self.connection = Some(id);
        self.connection_state = StreamConnectionState::Connecting;
    }

    pub fn connection_opened(&mut self, id: ConnectionId) -> bool {
        if self.connection != Some(id)
            || self.connection_state != StreamConnectionState::Connecting
        {
            return false;
        }
        self.connection_state = StreamConnectionState::Open;
        true
    }

    /// Deliberate or server-initiated close. Idempotent.
    pub fn connection_closed(&mut self, id: ConnectionId) -> bool {
        if self.connection != Some(id) || self.connection_state == StreamConnectionState::Closed {
            return false;
        }
        self.connection_state = StreamConnectionState::Closed;
        true
    }

    /// Unexpected disconnect: surfaces exactly one notice per connection.
    pub fn connection_errored(&mut self, id: ConnectionId, reason: &str) -> bool {
        if self.connection != Some(id)
            || matches!(
                self.connection_state,
                StreamConnectionState::Closed | StreamConnectionState::Errored
            )
        {
            return false;
        }
        self.connection_state = StreamConnectionState::Errored;
        self.append_notice(format!("Log stream disconnected: {reason}"));
        true
    }

    pub fn is_submitting(&self) -> bool {
        self.is_submitting
    }

    pub fn active_target(&self) -> Option<&str> {
        self.active_target.as_deref()
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    pub fn connection_state(&self) -> StreamConnectionState {
        self.connection_state
    }

    pub fn logs(&self) -> impl Iterator<Item = &LogEntry> {
        self.logs.iter()
    }

    pub fn tasks(&self) -> &[ScanTask] {
        &self.tasks
    }

    pub fn task(&self, id: &TaskId) -> Option<&ScanTask> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn snapshot(&self) -> SessionState {
        SessionState {
            active_target: self.active_target.clone(),
            is_submitting: self.is_submitting,
            logs: self.logs.iter().cloned().collect(),
            connection_state: self.connection_state,
            tasks: self.tasks.clone(),
            dropped_logs: self.dropped_logs,
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(store: &SessionStore) -> Vec<String> {
        store.logs().map(|e| e.text.clone()).collect()
    }

    fn accepted(id: &str) -> Result<TaskAccepted, SubmissionError> {
        Ok(TaskAccepted { task_id: TaskId::from(id) })
    }

    fn open_connection(store: &mut SessionStore, n: u64) -> ConnectionId {
        let id = ConnectionId(n);
        store.begin_connection(id);
        assert!(store.connection_opened(id));
        id
    }

    #[test]
    fn appends_keep_arrival_order_and_sequence() {
        let mut store = SessionStore::default();
        for i in 0..50 {
            store.append_log(format!("line {i}"));
        }
        let logs: Vec<_> = store.logs().collect();
        assert_eq!(logs.len(), 50);
        assert!(logs.windows(2).all(|w| w[1].sequence == w[0].sequence + 1));
        assert_eq!(logs[7].text, "line 7");
    }

    #[test]
    fn start_session_clears_logs_and_sets_target() {
        let mut store = SessionStore::default();
        store.append_log("stale");
        store.start_session("10.0.0.1").unwrap();
        assert_eq!(store.logs().count(), 0);
        assert_eq!(store.active_target(), Some("10.0.0.1"));
        assert!(store.is_submitting());
    }

    #[test]
    fn second_session_while_submitting_is_rejected() {
        let mut store = SessionStore::default();
        store.start_session("a.example").unwrap();
        store.append_log("kept");
        assert_eq!(
            store.start_session("b.example"),
            Err(SubmissionError::AlreadyInProgress)
        );
        assert_eq!(store.active_target(), Some("a.example"));
        assert_eq!(texts(&store), vec!["kept"]);
    }

    #[test]
    fn successful_submission_registers_queued_task() {
        let mut store = SessionStore::default();
        store.start_session("example.com").unwrap();
        let task = store.complete_submission("example.com", &accepted("t1")).unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.target, "example.com");
        assert!(!store.is_submitting());
    }

    #[test]
    fn transport_failure_is_reported_and_leaves_tasks_alone() {
        let mut store = SessionStore::default();
        store.start_session("example.com").unwrap();
        store.complete_submission("example.com", &accepted("t1"));
        store.start_session("10.0.0.9").unwrap();
        let outcome = Err(SubmissionError::transport("connection refused"));
        assert!(store.complete_submission("10.0.0.9", &outcome).is_none());

        assert!(!store.is_submitting());
        assert_eq!(store.active_target(), Some("10.0.0.9"));
        assert_eq!(store.tasks().len(), 1);
        let logs: Vec<_> = store.logs().collect();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].origin, LogOrigin::Notice);
        assert!(logs[0].text.contains("connection refused"));
    }

    #[test]
    fn local_rejection_adds_no_entry() {
        let mut store = SessionStore::default();
        store.start_session("x").unwrap();
        store.complete_submission("x", &Err(SubmissionError::AlreadyInProgress));
        assert_eq!(store.logs().count(), 0);
    }

    #[test]
    fn task_lifecycle_respects_terminal_states() {
        let mut store = SessionStore::default();
        store.start_session("example.com").unwrap();
        store.complete_submission("example.com", &accepted("t1"));
        let id = TaskId::from("t1");

        assert!(store.update_task_status(&id, TaskStatus::Running));
        assert!(store.update_task_status(&id, TaskStatus::Completed));
        assert!(!store.update_task_status(&id, TaskStatus::Running));
        assert!(!store.update_task_status(&id, TaskStatus::Failed));
        assert_eq!(store.task(&id).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn unknown_task_update_is_a_no_op() {
        let mut store = SessionStore::default();
        assert!(!store.update_task_status(&TaskId::from("ghost"), TaskStatus::Running));
        assert!(store.tasks().is_empty());
    }

    #[test]
    fn reconcile_walks_through_running() {
        let mut store = SessionStore::default();
        store.start_session("example.com").unwrap();
        store.complete_submission("example.com", &accepted("t1"));
        let id = TaskId::from("t1");
        assert!(store.reconcile_task_status(&id, TaskStatus::Completed));
        assert_eq!(store.task(&id).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn stream_lines_need_the_current_open_connection() {
        let mut store = SessionStore::default();
        let first = ConnectionId(1);
        store.begin_connection(first);
        assert_eq!(store.append_stream_line(first, "too early"), None);

        store.connection_opened(first);
        assert!(store.append_stream_line(first, "hello").is_some());

        let second = open_connection(&mut store, 2);
        assert_eq!(store.append_stream_line(first, "stale"), None);
        assert!(store.append_stream_line(second, "fresh").is_some());

        store.connection_closed(second);
        assert_eq!(store.append_stream_line(second, "after close"), None);
        assert_eq!(texts(&store), vec!["hello", "fresh"]);
    }

    #[test]
    fn close_is_idempotent() {
        let mut store = SessionStore::default();
        let id = open_connection(&mut store, 1);
        assert!(store.connection_closed(id));
        assert!(!store.connection_closed(id));
        assert_eq!(store.connection_state(), StreamConnectionState::Closed);
    }

    #[test]
    fn disconnect_surfaces_a_single_notice() {
        let mut store = SessionStore::default();
        let id = open_connection(&mut store, 1);
        assert!(store.connection_errored(id, "reset by peer"));
        assert!(!store.connection_errored(id, "reset by peer"));
        assert_eq!(store.connection_state(), StreamConnectionState::Errored);
        let notices: Vec<_> = store
            .logs()
            .filter(|e| e.origin == LogOrigin::Notice)
            .collect();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].text.contains("reset by peer"));
    }

    #[test]
    fn stale_connection_errors_are_ignored() {
        let mut store = SessionStore::default();
        open_connection(&mut store, 1);
        let current = open_connection(&mut store, 2);
        assert!(!store.connection_errored(ConnectionId(1), "old"));
        assert_eq!(store.connection(), Some(current));
        assert_eq!(store.connection_state(), StreamConnectionState::Open);
        assert_eq!(store.logs().count(), 0);
    }

    #[test]
    fn retention_cap_evicts_oldest_and_counts_them() {
        let mut store = SessionStore::new(3);
        for i in 1..=5 {
            store.append_log(format!("{i}"));
        }
        assert_eq!(texts(&store), vec!["3", "4", "5"]);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.dropped_logs, 2);
        assert_eq!(snapshot.logs[0].sequence, 3);
    }
}
