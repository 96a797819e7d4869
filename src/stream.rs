use futures::StreamExt;
use reqwest::Url;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::ConnectionId;

/// Lifecycle and payload events of one log stream connection.
///
/// `Connecting` has no event: the owner records it synchronously when `open`
/// returns a new id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Opened(ConnectionId),
    Line { id: ConnectionId, text: String },
    /// The server closed the stream cleanly.
    Closed(ConnectionId),
    /// The connection failed or dropped without a close frame.
    Errored { id: ConnectionId, reason: String },
}

impl StreamEvent {
    pub fn connection(&self) -> ConnectionId {
        match self {
            StreamEvent::Opened(id) | StreamEvent::Closed(id) => *id,
            StreamEvent::Line { id, .. } | StreamEvent::Errored { id, .. } => *id,
        }
    }
}

/// Owns at most one live WebSocket connection to the log endpoint.
///
/// Incoming messages are forwarded, in receipt order, over a bounded channel;
/// a slow consumer therefore slows the socket reader instead of growing an
/// unbounded queue. There is no automatic reconnect.
#[derive(Debug)]
pub struct LogStreamClient {
    events: mpsc::Sender<StreamEvent>,
    active: Option<ActiveStream>,
    next_id: u64,
}

#[derive(Debug)]
struct ActiveStream {
    id: ConnectionId,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
}

impl LogStreamClient {
    pub fn new(events: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            events,
            active: None,
            next_id: 0,
        }
    }

    /// Connect to `endpoint`. A no-op returning the current id while a
    /// connection is still connecting or open; call `close` first to replace it.
    pub fn open(&mut self, endpoint: &Url) -> ConnectionId {
        if let Some(active) = &self.active {
            if !active.reader.is_finished() {
                debug!(connection = %active.id, "log stream already active");
                return active.id;
            }
        }

        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(read_stream(
            endpoint.to_string(),
            id,
            self.events.clone(),
            cancel.clone(),
        ));
        info!(connection = %id, %endpoint, "opening log stream");
        self.active = Some(ActiveStream { id, cancel, reader });
        id
    }

    /// Release the connection. Safe in any state, including mid-handshake;
    /// returns the id that was released, or `None` if nothing was open.
    pub fn close(&mut self) -> Option<ConnectionId> {
        let active = self.active.take()?;
        active.cancel.cancel();
        debug!(connection = %active.id, "log stream closed");
        Some(active.id)
    }

    /// Id of the connection this client currently holds, if any.
    pub fn current(&self) -> Option<ConnectionId> {
        self.active.as_ref().map(|a| a.id)
    }
}

impl Drop for LogStreamClient {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_stream(
    endpoint: String,
    id: ConnectionId,
    events: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        _ = cancel.cancelled() => return,
        res = connect_async(endpoint.as_str()) => res,
    };
    let mut ws = match connected {
        Ok((ws, _response)) => ws,
        Err(e) => {
            warn!(connection = %id, error = %e, "log stream connect failed");
            let _ = events
                .send(StreamEvent::Errored {
                    id,
                    reason: format!("cannot connect to {endpoint}: {e}"),
                })
                .await;
            return;
        }
    };
    if events.send(StreamEvent::Opened(id)).await.is_err() {
        let _ = ws.close(None).await;
        return;
    }

    let last = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws.close(None).await;
                break None;
            }
            frame = ws.next() => frame,
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
            Some(Ok(Message::Close(_))) => break Some(StreamEvent::Closed(id)),
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                break Some(StreamEvent::Errored {
                    id,
                    reason: e.to_string(),
                })
            }
            None => {
                break Some(StreamEvent::Errored {
                    id,
                    reason: "connection dropped without close frame".into(),
                })
            }
        };
        if events.send(StreamEvent::Line { id, text }).await.is_err() {
            let _ = ws.close(None).await;
            break None;
        }
    };

    if let Some(event) = last {
        debug!(connection = %id, ?event, "log stream ended");
        let _ = events.send(event).await;
    }
}
