use std::collections::HashMap;
use std::io::{self, Write};

use ::time::format_description::well_known;

use crate::controller::SessionHandle;
use crate::error::SubmissionError;
use crate::types::{
    LogOrigin, ScanTask, SessionState, StreamConnectionState, TaskAccepted, TaskId, TaskStatus,
};

/// Incremental text view of a session: task cards and the log pane.
///
/// Each call to `render` prints only what changed since the previous call:
/// log entries with a higher sequence than the last one printed, and task
/// cards whose status moved.
pub struct Console<W: Write> {
    out: W,
    last_sequence: u64,
    task_status: HashMap<TaskId, TaskStatus>,
    connection: StreamConnectionState,
}

impl<W: Write> Console<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            last_sequence: 0,
            task_status: HashMap::new(),
            connection: StreamConnectionState::Closed,
        }
    }

    /// The one user intent: submit a scan for `target`.
    pub async fn on_submit_scan(
        &self,
        session: &SessionHandle,
        target: &str,
    ) -> Result<TaskAccepted, SubmissionError> {
        session.submit(target).await
    }

    pub fn render(&mut self, state: &SessionState) -> io::Result<()> {
        for task in &state.tasks {
            if self.task_status.get(&task.id) != Some(&task.status) {
                self.task_status.insert(task.id.clone(), task.status);
                writeln!(self.out, "{}", task_card(task))?;
            }
        }

        if state.connection_state != self.connection {
            self.connection = state.connection_state;
            if self.connection == StreamConnectionState::Open {
                writeln!(self.out, "-- live output --")?;
            }
        }

        let last = self.last_sequence;
        for entry in state.logs.iter().filter(|e| e.sequence > last) {
            match entry.origin {
                LogOrigin::Stream => writeln!(self.out, "{}", entry.text)?,
                LogOrigin::Notice => writeln!(self.out, "!! {}", entry.text)?,
            }
            self.last_sequence = entry.sequence;
        }
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

pub fn task_card(task: &ScanTask) -> String {
    let started = task
        .started_at
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("?"));
    format!(
        "[{:<9}] {}  (task {}, started {})",
        task.status, task.target, task.id, started
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionStore;

    fn rendered(console: Console<Vec<u8>>) -> String {
        String::from_utf8(console.into_inner()).unwrap()
    }

    #[test]
    fn prints_each_entry_once_and_status_changes() {
        let mut store = SessionStore::default();
        store.start_session("example.com").unwrap();
        store.complete_submission(
            "example.com",
            &Ok(TaskAccepted { task_id: TaskId::from("t1") }),
        );
        store.append_log("Starting scan...");

        let mut console = Console::new(Vec::new());
        console.render(&store.snapshot()).unwrap();
        console.render(&store.snapshot()).unwrap();

        store.append_log("Found port 80 open");
        store.update_task_status(&TaskId::from("t1"), TaskStatus::Running);
        console.render(&store.snapshot()).unwrap();

        let out = rendered(console);
        assert_eq!(out.matches("Starting scan...").count(), 1);
        assert_eq!(out.matches("Found port 80 open").count(), 1);
        assert!(out.contains("[queued   ] example.com"));
        assert!(out.contains("[running  ] example.com"));
    }

    #[test]
    fn later_renders_resume_after_last_printed_entry() {
        let mut store = SessionStore::default();
        let mut console = Console::new(Vec::new());
        for batch in [&["one", "two"][..], &["three"][..], &[][..]] {
            for line in batch {
                store.append_log(*line);
            }
            console.render(&store.snapshot()).unwrap();
        }
        assert_eq!(rendered(console), "one\ntwo\nthree\n");
    }

    #[test]
    fn notices_are_marked() {
        let mut store = SessionStore::default();
        store.append_notice("Log stream disconnected: reset");
        let mut console = Console::new(Vec::new());
        console.render(&store.snapshot()).unwrap();
        assert_eq!(rendered(console), "!! Log stream disconnected: reset\n");
    }
}
