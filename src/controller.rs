use std::ops::ControlFlow;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::Url;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::dispatcher::ScanDispatcher;
use crate::error::SubmissionError;
use crate::store::SessionStore;
use crate::stream::{LogStreamClient, StreamEvent};
use crate::types::{validate_target, SessionState, TaskAccepted, TaskId, TaskStatus};

const COMMAND_CAPACITY: usize = 32;
const STREAM_CAPACITY: usize = 1024;
/// Stream events applied per snapshot publish when lines arrive in bursts.
const BATCH_MAX: usize = 256;
/// Consecutive failed status polls before a poller gives up.
const MAX_POLL_FAILURES: u32 = 5;

type SubmitReply = oneshot::Sender<Result<TaskAccepted, SubmissionError>>;

#[derive(Debug)]
enum Command {
    Submit { target: String, reply: SubmitReply },
    UpdateTaskStatus { task_id: TaskId, status: TaskStatus },
    CloseStream { reply: oneshot::Sender<()> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Results of work the controller spawned.
#[derive(Debug)]
enum Completion {
    Submission {
        target: String,
        outcome: Result<TaskAccepted, SubmissionError>,
        reply: SubmitReply,
    },
    TaskStatus {
        task_id: TaskId,
        status: TaskStatus,
    },
}

/// Cloneable front door to a running session controller.
///
/// Presentation reads snapshots from `subscribe`/`snapshot` and sends its one
/// intent through `submit`.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub async fn submit(&self, target: impl Into<String>) -> Result<TaskAccepted, SubmissionError> {
        let (reply, rx) = oneshot::channel();
        let stopped = || SubmissionError::transport("session controller stopped");
        self.commands
            .send(Command::Submit {
                target: target.into(),
                reply,
            })
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    /// Feed an externally observed status change for one task.
    pub async fn update_task_status(&self, task_id: TaskId, status: TaskStatus) -> Result<()> {
        self.commands
            .send(Command::UpdateTaskStatus { task_id, status })
            .await
            .map_err(|_| anyhow!("session controller stopped"))
    }

    /// Close the live log stream without ending the session.
    pub async fn close_stream(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::CloseStream { reply })
            .await
            .map_err(|_| anyhow!("session controller stopped"))?;
        rx.await.context("session controller stopped")
    }

    pub fn snapshot(&self) -> SessionState {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.snapshots.clone()
    }

    /// Stop the controller: closes the stream and any status pollers.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }
}

/// Sole owner of the session store.
///
/// Runs as one task; user intents, stream events and results of spawned work
/// all arrive as messages and are applied one at a time, so the producers
/// never race on the store.
pub struct SessionController {
    store: SessionStore,
    dispatcher: ScanDispatcher,
    stream: LogStreamClient,
    stream_url: Url,
    poll_interval: Option<Duration>,
    commands: mpsc::Receiver<Command>,
    stream_rx: mpsc::Receiver<StreamEvent>,
    completions_tx: mpsc::Sender<Completion>,
    completions_rx: mpsc::Receiver<Completion>,
    snapshots: watch::Sender<SessionState>,
    shutdown: CancellationToken,
}

impl SessionController {
    /// Start a controller task on the current runtime.
    pub fn spawn(config: ClientConfig) -> Result<SessionHandle> {
        let stream_url = config.log_stream_url()?;
        let dispatcher = ScanDispatcher::new(config.clone())?;
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (stream_tx, stream_rx) = mpsc::channel(STREAM_CAPACITY);
        let (completions_tx, completions_rx) = mpsc::channel(COMMAND_CAPACITY);
        let store = SessionStore::new(config.max_log_entries);
        let (snapshots, snapshots_rx) = watch::channel(store.snapshot());

        let controller = SessionController {
            store,
            dispatcher,
            stream: LogStreamClient::new(stream_tx),
            stream_url,
            poll_interval: config.status_poll_interval(),
            commands,
            stream_rx,
            completions_tx,
            completions_rx,
            snapshots,
            shutdown: CancellationToken::new(),
        };
        tokio::spawn(controller.run());

        Ok(SessionHandle {
            commands: commands_tx,
            snapshots: snapshots_rx,
        })
    }

    async fn run(mut self) {
        debug!("session controller started");
        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        self.teardown();
                        break;
                    };
                    if self.handle_command(cmd).is_break() {
                        break;
                    }
                }
                Some(event) = self.stream_rx.recv() => {
                    self.handle_stream_event(event);
                    self.drain_stream_backlog();
                }
                Some(done) = self.completions_rx.recv() => self.handle_completion(done),
            }
            self.publish();
        }
        debug!("session controller stopped");
    }

    fn handle_command(&mut self, cmd: Command) -> ControlFlow<()> {
        match cmd {
            Command::Submit { target, reply } => self.begin_submission(target, reply),
            Command::UpdateTaskStatus { task_id, status } => {
                self.store.update_task_status(&task_id, status);
            }
            Command::CloseStream { reply } => {
                self.close_stream();
                self.publish();
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                self.teardown();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn begin_submission(&mut self, target: String, reply: SubmitReply) {
        let target = match validate_target(&target) {
            Ok(t) => t,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        if let Err(e) = self.store.start_session(&target) {
            let _ = reply.send(Err(e));
            return;
        }
        // The previous session's stream must not interleave with the next one.
        self.close_stream();

        let dispatcher = self.dispatcher.clone();
        let done = self.completions_tx.clone();
        tokio::spawn(async move {
            let outcome = dispatcher.submit(&target).await;
            let _ = done
                .send(Completion::Submission {
                    target,
                    outcome,
                    reply,
                })
                .await;
        });
    }

    fn handle_completion(&mut self, done: Completion) {
        match done {
            Completion::Submission {
                target,
                outcome,
                reply,
            } => {
                self.store.complete_submission(&target, &outcome);
                match &outcome {
                    Ok(accepted) => {
                        let id = self.stream.open(&self.stream_url);
                        self.store.begin_connection(id);
                        if let Some(interval) = self.poll_interval {
                            self.spawn_status_poller(accepted.task_id.clone(), interval);
                        }
                    }
                    Err(e) => warn!(scan_target = %target, error = %e, "scan submission failed"),
                }
                // Callers reading a snapshot after the reply must see the outcome.
                self.publish();
                let _ = reply.send(outcome);
            }
            Completion::TaskStatus { task_id, status } => {
                self.store.reconcile_task_status(&task_id, status);
            }
        }
    }

    fn handle_stream_event(&mut self, event: StreamEvent) {
        if self.store.connection() != Some(event.connection()) {
            debug!(connection = %event.connection(), "ignoring event from replaced connection");
            return;
        }
        match event {
            StreamEvent::Opened(id) => {
                if self.store.connection_opened(id) {
                    info!(connection = %id, "log stream open");
                }
            }
            StreamEvent::Line { id, text } => {
                self.store.append_stream_line(id, text);
            }
            StreamEvent::Closed(id) => {
                if self.store.connection_closed(id) {
                    info!(connection = %id, "log stream closed by server");
                }
            }
            StreamEvent::Errored { id, reason } => {
                if self.store.connection_errored(id, &reason) {
                    warn!(connection = %id, %reason, "log stream disconnected");
                }
            }
        }
    }

    /// Apply already-queued stream events before publishing one snapshot.
    fn drain_stream_backlog(&mut self) {
        for _ in 0..BATCH_MAX {
            match self.stream_rx.try_recv() {
                Ok(event) => self.handle_stream_event(event),
                Err(_) => break,
            }
        }
    }

    fn close_stream(&mut self) {
        if let Some(id) = self.stream.close() {
            self.store.connection_closed(id);
        }
    }

    fn spawn_status_poller(&self, task_id: TaskId, interval: Duration) {
        let dispatcher = self.dispatcher.clone();
        let done = self.completions_tx.clone();
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            let mut last = TaskStatus::Queued;
            let mut failures = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match dispatcher.task_status(&task_id).await {
                    Ok(task) => {
                        failures = 0;
                        if task.status == last {
                            continue;
                        }
                        last = task.status;
                        let update = Completion::TaskStatus {
                            task_id: task_id.clone(),
                            status: task.status,
                        };
                        if done.send(update).await.is_err() || last.is_terminal() {
                            break;
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        debug!(task = %task_id, error = %e, failures, "status poll failed");
                        if failures >= MAX_POLL_FAILURES {
                            warn!(task = %task_id, "giving up on task status polling");
                            break;
                        }
                    }
                }
            }
        });
    }

    fn teardown(&mut self) {
        self.close_stream();
        self.shutdown.cancel();
        self.publish();
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.store.snapshot());
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
