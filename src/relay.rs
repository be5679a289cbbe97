// src/relay.rs

use crate::models::{TaskId, TaskState};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Distinguishes failures the user can fix (disk space) from the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Resolution,
    ResourceExhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    BinariesAcquiring,
    BinariesAcquired,
    Progress {
        percent: f64,
        transferred: u64,
        total: Option<u64>,
    },
    Error {
        cause: String,
        failure: FailureKind,
    },
    StateChanged {
        state: TaskState,
    },
}

/// A task-level event tagged with the task it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl TaskEvent {
    /// The terminal state carried by this event, if any.
    pub fn terminal_state(&self) -> Option<TaskState> {
        match self.kind {
            EventKind::StateChanged { state } if state.is_terminal() => Some(state),
            _ => None,
        }
    }
}

/// External observer of task events.
pub trait ProgressSink: Send + 'static {
    fn deliver(&mut self, event: TaskEvent);
}

impl<F> ProgressSink for F
where
    F: FnMut(TaskEvent) + Send + 'static,
{
    fn deliver(&mut self, event: TaskEvent) {
        self(event)
    }
}

/// Sending half shared by every task.
#[derive(Debug, Clone)]
pub struct Relay {
    tx: mpsc::UnboundedSender<TaskEvent>,
}

impl Relay {
    pub fn channel() -> (Relay, RelayStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Relay { tx }, RelayStream { rx })
    }

    pub fn emit(&self, task_id: TaskId, kind: EventKind) {
        // A dropped stream means nobody is watching; tasks keep running.
        let _ = self.tx.send(TaskEvent { task_id, kind });
    }
}

/// Receiving half, handed to the single external sink.
#[derive(Debug)]
pub struct RelayStream {
    rx: mpsc::UnboundedReceiver<TaskEvent>,
}

impl RelayStream {
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TaskEvent> {
        self.rx.try_recv().ok()
    }

    /// Spawns a forwarder that feeds every event to `sink` until all senders are gone.
    pub fn forward<S: ProgressSink>(mut self, mut sink: S) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = self.rx.recv().await {
                sink.deliver(event);
            }
        })
    }
}
