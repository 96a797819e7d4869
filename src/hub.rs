use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

const CHANNEL_CAPACITY: usize = 1024;

/// Fan-out of scan output lines to every connected log subscriber.
///
/// Besides the live broadcast, the hub keeps a bounded backlog of the current
/// scan so a subscriber that connects after the scan started still sees its
/// first lines. Publishing and subscribing take the same lock, so a new
/// subscriber gets the backlog and then every later line, with no gap or
/// duplicate in between.
#[derive(Clone, Debug)]
pub struct LogHub {
    inner: Arc<Mutex<Backlog>>,
    tx: broadcast::Sender<String>,
}

#[derive(Debug)]
struct Backlog {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogHub {
    pub fn new(history_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Backlog {
                lines: VecDeque::with_capacity(history_capacity.min(CHANNEL_CAPACITY)),
                capacity: history_capacity,
            })),
            tx,
        }
    }

    pub async fn publish(&self, line: impl Into<String>) {
        let line = line.into();
        let mut backlog = self.inner.lock().await;
        if backlog.capacity > 0 {
            if backlog.lines.len() == backlog.capacity {
                backlog.lines.pop_front();
            }
            backlog.lines.push_back(line.clone());
        }
        // Err only means nobody is listening right now.
        let _ = self.tx.send(line);
    }

    /// Returns the backlog so far plus a receiver for everything after it.
    pub async fn subscribe(&self) -> (Vec<String>, broadcast::Receiver<String>) {
        let backlog = self.inner.lock().await;
        (backlog.lines.iter().cloned().collect(), self.tx.subscribe())
    }

    /// Drop the backlog; called when a new scan is accepted.
    pub async fn reset(&self) {
        self.inner.lock().await.lines.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
