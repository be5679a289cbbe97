#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskdl::prelude::*;
use tokio::sync::Notify;

/// Records the control signals a transfer received.
#[derive(Clone, Default)]
pub struct Calls(Arc<Mutex<Vec<&'static str>>>);

impl Calls {
    pub fn get(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }
}

impl TransferHandle for Calls {
    fn pause(&self) {
        self.0.lock().unwrap().push("pause");
    }
    fn resume(&self) {
        self.0.lock().unwrap().push("resume");
    }
    fn destroy(&self) {
        self.0.lock().unwrap().push("destroy");
    }
}

struct Transfer {
    title: String,
    events: Option<TransferSender>,
    calls: Calls,
}

/// Resolver whose transfers are driven by the test.
#[derive(Clone, Default)]
pub struct ScriptedResolver {
    transfers: Arc<Mutex<Vec<Transfer>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    with_setup: Arc<Mutex<HashSet<String>>>,
    gates: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
    abandoned: Arc<Mutex<Vec<String>>>,
}

/// Records the title if a gated resolve is dropped before its gate opens.
struct Abandoned {
    title: Option<String>,
    log: Arc<Mutex<Vec<String>>>,
}

impl Drop for Abandoned {
    fn drop(&mut self) {
        if let Some(title) = self.title.take() {
            self.log.lock().unwrap().push(title);
        }
    }
}

impl ScriptedResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolving the request with this title fails.
    pub fn fail_on(&self, title: &str) {
        self.failing.lock().unwrap().insert(title.to_string());
    }

    /// Resolving the request with this title provisions tooling first.
    pub fn setup_on(&self, title: &str) {
        self.with_setup.lock().unwrap().insert(title.to_string());
    }

    /// Resolving the request with this title blocks until [`Self::release`].
    pub fn gate_on(&self, title: &str) {
        self.gates
            .lock()
            .unwrap()
            .insert(title.to_string(), Arc::new(Notify::new()));
    }

    pub fn release(&self, title: &str) {
        if let Some(gate) = self.gates.lock().unwrap().get(title) {
            gate.notify_one();
        }
    }

    /// Titles whose gated resolve was dropped while still blocked, sorted.
    pub fn abandoned(&self) -> Vec<String> {
        let mut titles = self.abandoned.lock().unwrap().clone();
        titles.sort();
        titles
    }

    /// Titles in the order they were resolved.
    pub fn started(&self) -> Vec<String> {
        self.transfers.lock().unwrap().iter().map(|t| t.title.clone()).collect()
    }

    pub fn calls(&self, title: &str) -> Vec<&'static str> {
        self.transfers
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.title == title)
            .map(|t| t.calls.get())
            .unwrap_or_default()
    }

    pub fn send(&self, title: &str, event: TransferEvent) {
        let transfers = self.transfers.lock().unwrap();
        let transfer = transfers
            .iter()
            .find(|t| t.title == title)
            .unwrap_or_else(|| panic!("{title} was never resolved"));
        if let Some(events) = &transfer.events {
            let _ = events.send(event);
        }
    }

    pub fn progress(&self, title: &str, percent: f64) {
        self.send(
            title,
            TransferEvent::Progress {
                percent,
                transferred: percent as u64,
                total: Some(100),
            },
        );
    }

    pub fn complete(&self, title: &str) {
        self.send(title, TransferEvent::Complete);
    }

    /// Drops the event sender without a terminal event.
    pub fn hang_up(&self, title: &str) {
        let mut transfers = self.transfers.lock().unwrap();
        if let Some(transfer) = transfers.iter_mut().find(|t| t.title == title) {
            transfer.events = None;
        }
    }
}

#[async_trait]
impl Resolver for ScriptedResolver {
    async fn resolve(
        &self,
        request: &Request,
        events: TransferSender,
    ) -> Result<Box<dyn TransferHandle>, ResolveError> {
        let fails = self.failing.lock().unwrap().contains(&request.title);
        let setup = self.with_setup.lock().unwrap().contains(&request.title);
        let gate = self.gates.lock().unwrap().get(&request.title).cloned();
        if let Some(gate) = gate {
            let mut blocked = Abandoned {
                title: Some(request.title.clone()),
                log: self.abandoned.clone(),
            };
            gate.notified().await;
            blocked.title = None;
        }
        if fails {
            return Err(ResolveError::NotFound(request.source.clone()));
        }
        if setup {
            let _ = events.send(TransferEvent::BinariesAcquiring);
            tokio::task::yield_now().await;
            let _ = events.send(TransferEvent::BinariesAcquired);
        }
        let calls = Calls::default();
        self.transfers.lock().unwrap().push(Transfer {
            title: request.title.clone(),
            events: Some(events),
            calls: calls.clone(),
        });
        Ok(Box::new(calls))
    }
}

pub fn requests(n: usize) -> Vec<Request> {
    (1..=n)
        .map(|i| Request::new(format!("https://example.com/t{i}.mp3"), format!("t{i}")))
        .collect()
}

pub fn manager(resolver: &ScriptedResolver, limit: usize) -> (DownloadManager, RelayStream) {
    DownloadManager::new(Arc::new(resolver.clone()), limit).unwrap()
}

/// Polls `cond` until it holds, failing the test after a few seconds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    let held = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(held.is_ok(), "condition never held");
}

/// Collects events until one matches, failing the test after a few seconds.
pub async fn wait_for(stream: &mut RelayStream, mut pred: impl FnMut(&TaskEvent) -> bool) -> Vec<TaskEvent> {
    let mut seen = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = stream.recv().await {
            let done = pred(&event);
            seen.push(event);
            if done {
                return true;
            }
        }
        false
    })
    .await;
    match result {
        Ok(true) => seen,
        _ => panic!("expected event never arrived; saw {seen:#?}"),
    }
}

pub async fn wait_state(stream: &mut RelayStream, id: TaskId, state: TaskState) -> Vec<TaskEvent> {
    wait_for(stream, |e| {
        e.task_id == id && e.kind == EventKind::StateChanged { state }
    })
    .await
}

/// Waits until every id in `ids` has reached `state`, in any order.
pub async fn wait_states(stream: &mut RelayStream, ids: &[TaskId], state: TaskState) -> Vec<TaskEvent> {
    let mut remaining: HashSet<TaskId> = ids.iter().copied().collect();
    wait_for(stream, |e| {
        if e.kind == (EventKind::StateChanged { state }) {
            remaining.remove(&e.task_id);
        }
        remaining.is_empty()
    })
    .await
}
