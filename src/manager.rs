// src/manager.rs

use crate::models::{Request, TaskId, TaskSnapshot, TaskState};
use crate::preferences::PreferenceStore;
use crate::queue::{QueueError, TaskIds, TaskQueue};
use crate::relay::{Relay, RelayStream};
use crate::resolver::{transfer_channel, ResolveError, Resolver, TransferEvent};
use crate::task::{Task, TaskError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Concurrency limit used when the preference store has none.
pub const DEFAULT_CONCURRENCY: usize = 2;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("task {0} not found")]
    NotFound(TaskId),
    #[error("concurrency limit must be at least 1, got {0}")]
    InvalidLimit(usize),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Everything the dispatch path mutates. Only touched under one lock.
struct SchedulerState {
    tasks: BTreeMap<TaskId, Task>,
    /// Enqueued, not yet submitted.
    accepting: TaskQueue,
    /// Submitted, waiting for a free slot.
    waiting: TaskQueue,
    /// Admitted and not yet terminal.
    active: HashSet<TaskId>,
    /// Stops the event pump of each admitted task.
    workers: HashMap<TaskId, CancellationToken>,
    ids: TaskIds,
    limit: usize,
    relay: Relay,
}

impl SchedulerState {
    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task, ManagerError> {
        self.tasks.get_mut(&id).ok_or(ManagerError::NotFound(id))
    }
}

#[derive(Clone)]
struct Dispatch {
    state: Arc<Mutex<SchedulerState>>,
    resolver: Arc<dyn Resolver>,
    idle: Arc<Notify>,
}

/// Admits queued downloads up to a fixed concurrency limit and routes
/// per-task control and events.
#[derive(Clone)]
pub struct DownloadManager {
    dispatch: Dispatch,
    limit: usize,
}

impl DownloadManager {
    /// Creates a manager and the single stream its events are relayed on.
    pub fn new(resolver: Arc<dyn Resolver>, limit: usize) -> Result<(Self, RelayStream), ManagerError> {
        if limit == 0 {
            return Err(ManagerError::InvalidLimit(limit));
        }
        let (relay, stream) = Relay::channel();
        let state = SchedulerState {
            tasks: BTreeMap::new(),
            accepting: TaskQueue::new(),
            waiting: TaskQueue::new(),
            active: HashSet::new(),
            workers: HashMap::new(),
            ids: TaskIds::default(),
            limit,
            relay,
        };
        let dispatch = Dispatch {
            state: Arc::new(Mutex::new(state)),
            resolver,
            idle: Arc::new(Notify::new()),
        };
        info!(limit, "download manager ready");
        Ok((Self { dispatch, limit }, stream))
    }

    /// Like [`DownloadManager::new`], reading the limit from `preferences`.
    /// Unreadable or non-positive values fall back to [`DEFAULT_CONCURRENCY`].
    pub async fn from_preferences(
        resolver: Arc<dyn Resolver>,
        preferences: &dyn PreferenceStore,
    ) -> Result<(Self, RelayStream), ManagerError> {
        let limit = match preferences.concurrency_limit().await {
            Ok(limit) if limit > 0 => limit,
            Ok(limit) => {
                warn!(limit, "ignoring non-positive concurrency preference");
                DEFAULT_CONCURRENCY
            }
            Err(e) => {
                warn!(error = %e, "could not read concurrency preference");
                DEFAULT_CONCURRENCY
            }
        };
        Self::new(resolver, limit)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Creates one inactive task per request. Nothing starts until the ids are submitted.
    pub async fn enqueue(&self, requests: Vec<Request>) -> Result<Vec<TaskId>, ManagerError> {
        let mut guard = self.dispatch.state.lock().await;
        let state = &mut *guard;
        let tasks = state.accepting.enqueue(requests, &mut state.ids, &state.relay)?;
        let ids: Vec<TaskId> = tasks.iter().map(Task::id).collect();
        for task in tasks {
            state.tasks.insert(task.id(), task);
        }
        debug!(count = ids.len(), "enqueued requests");
        Ok(ids)
    }

    /// Hands enqueued ids to the dispatcher, admitting as many as the limit allows.
    pub async fn submit(&self, ids: &[TaskId]) -> Result<(), ManagerError> {
        let mut state = self.dispatch.state.lock().await;
        for &id in ids {
            let task = state.tasks.get(&id).ok_or(ManagerError::NotFound(id))?;
            if !state.accepting.contains(id) {
                return Err(TaskError::IllegalState {
                    id,
                    state: task.state(),
                    op: "submit",
                }
                .into());
            }
        }
        for &id in ids {
            if state.accepting.remove(id) {
                self.dispatch.submit_one(&mut state, id);
            }
        }
        Ok(())
    }

    /// Submits everything enqueued so far, in enqueue order.
    pub async fn submit_all(&self) -> Vec<TaskId> {
        let mut state = self.dispatch.state.lock().await;
        let ids = state.accepting.drain();
        for &id in &ids {
            self.dispatch.submit_one(&mut state, id);
        }
        ids
    }

    pub async fn pause(&self, id: TaskId) -> Result<(), ManagerError> {
        let mut state = self.dispatch.state.lock().await;
        state.task_mut(id)?.pause()?;
        Ok(())
    }

    pub async fn resume(&self, id: TaskId) -> Result<(), ManagerError> {
        let mut state = self.dispatch.state.lock().await;
        state.task_mut(id)?.resume()?;
        Ok(())
    }

    /// Cancels one task. Its transfer is destroyed before this returns and
    /// its slot goes to the next waiting task.
    pub async fn cancel(&self, id: TaskId) -> Result<(), ManagerError> {
        let mut state = self.dispatch.state.lock().await;
        state.task_mut(id)?.cancel()?;
        state.accepting.remove(id);
        state.waiting.remove(id);
        self.dispatch.finish(&mut state, id);
        Ok(())
    }

    /// Pauses every active task. Returns how many were paused.
    pub async fn pause_all(&self) -> usize {
        let mut state = self.dispatch.state.lock().await;
        let mut count = 0;
        for task in state.tasks.values_mut() {
            if task.state() == TaskState::Active && task.pause().is_ok() {
                count += 1;
            }
        }
        info!(count, "paused all");
        count
    }

    /// Resumes every paused task. Returns how many were resumed.
    pub async fn resume_all(&self) -> usize {
        let mut state = self.dispatch.state.lock().await;
        let mut count = 0;
        for task in state.tasks.values_mut() {
            if task.state() == TaskState::Paused && task.resume().is_ok() {
                count += 1;
            }
        }
        info!(count, "resumed all");
        count
    }

    /// Cancels every task that has not finished, queued ones included.
    pub async fn cancel_all(&self) -> usize {
        let mut state = self.dispatch.state.lock().await;
        state.accepting.clear();
        state.waiting.clear();

        let mut cancelled = Vec::new();
        for task in state.tasks.values_mut() {
            if !task.state().is_terminal() && task.cancel().is_ok() {
                cancelled.push(task.id());
            }
        }
        for &id in &cancelled {
            self.dispatch.finish(&mut state, id);
        }
        info!(count = cancelled.len(), "cancelled all");
        cancelled.len()
    }

    pub async fn snapshot(&self, id: TaskId) -> Result<TaskSnapshot, ManagerError> {
        let state = self.dispatch.state.lock().await;
        state
            .tasks
            .get(&id)
            .map(Task::snapshot)
            .ok_or(ManagerError::NotFound(id))
    }

    /// Snapshots of every tracked task, ordered by id.
    pub async fn snapshots(&self) -> Vec<TaskSnapshot> {
        let state = self.dispatch.state.lock().await;
        state.tasks.values().map(Task::snapshot).collect()
    }

    pub async fn active_count(&self) -> usize {
        self.dispatch.state.lock().await.active.len()
    }

    /// Tasks enqueued or submitted but not yet admitted.
    pub async fn queued_count(&self) -> usize {
        let state = self.dispatch.state.lock().await;
        state.accepting.len() + state.waiting.len()
    }

    /// Drops finished tasks from the registry. Returns how many were removed.
    pub async fn prune_finished(&self) -> usize {
        let mut state = self.dispatch.state.lock().await;
        let before = state.tasks.len();
        state.tasks.retain(|_, task| !task.state().is_terminal());
        let pruned = before - state.tasks.len();
        debug!(pruned, "pruned finished tasks");
        pruned
    }

    /// Resolves once no task is active or waiting for a slot.
    pub async fn idle(&self) {
        loop {
            let notified = self.dispatch.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.dispatch.state.lock().await;
                if state.active.is_empty() && state.waiting.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }
}

impl Dispatch {
    /// Admits now if a slot is free, otherwise parks the task as pending.
    fn submit_one(&self, state: &mut SchedulerState, id: TaskId) {
        if state.active.len() < state.limit && state.waiting.is_empty() {
            self.admit(state, id);
            return;
        }
        if let Some(task) = state.tasks.get_mut(&id) {
            match task.wait() {
                Ok(()) => {
                    state.waiting.push(id);
                }
                Err(e) => warn!(task = %id, error = %e, "task cannot wait for admission"),
            }
        }
    }

    fn admit(&self, state: &mut SchedulerState, id: TaskId) {
        let Some(task) = state.tasks.get_mut(&id) else {
            return;
        };
        let request = match task.start() {
            Ok(request) => request,
            Err(e) => {
                warn!(task = %id, error = %e, "skipping task that cannot start");
                return;
            }
        };
        info!(task = %id, title = %request.title, "admitting download");
        state.active.insert(id);
        assert!(
            state.active.len() <= state.limit,
            "active set {} exceeds concurrency limit {}",
            state.active.len(),
            state.limit
        );

        let token = CancellationToken::new();
        state.workers.insert(id, token.clone());
        let dispatch = self.clone();
        tokio::spawn(async move { dispatch.run_worker(id, request, token).await });
    }

    /// Fills free slots from the waiting queue, earliest first.
    fn admit_waiting(&self, state: &mut SchedulerState) {
        while state.active.len() < state.limit {
            let Some(id) = state.waiting.pop_front() else {
                break;
            };
            self.admit(state, id);
        }
        if state.active.is_empty() && state.waiting.is_empty() {
            self.idle.notify_waiters();
        }
    }

    /// Releases the slot of a task that reached a terminal state and backfills it.
    fn finish(&self, state: &mut SchedulerState, id: TaskId) {
        if let Some(token) = state.workers.remove(&id) {
            token.cancel();
        }
        if state.active.remove(&id) {
            if let Some(task) = state.tasks.get(&id) {
                info!(task = %id, state = %task.state(), "download finished");
            }
        }
        self.admit_waiting(state);
    }

    /// Acquires the transfer for one admitted task, then pumps its events.
    async fn run_worker(self, id: TaskId, request: Request, token: CancellationToken) {
        let (tx, mut rx) = transfer_channel();
        let mut early = Vec::new();

        let outcome = {
            let mut resolve = self.resolver.resolve(&request, tx);
            loop {
                tokio::select! {
                    biased;
                    outcome = &mut resolve => break outcome,
                    _ = token.cancelled() => {
                        debug!(task = %id, "cancelled while acquiring, abandoning resolver");
                        return;
                    }
                    Some(event) = rx.recv() => {
                        if is_setup(&event) {
                            let mut state = self.state.lock().await;
                            if let Some(task) = state.tasks.get_mut(&id) {
                                task.on_transfer_event(event);
                            }
                        } else {
                            early.push(event);
                        }
                    }
                }
            }
        };

        {
            let mut state = self.state.lock().await;
            let Some(task) = state.tasks.get_mut(&id) else {
                // Cancelled and pruned while the resolver ran.
                if let Ok(handle) = outcome {
                    debug!(task = %id, "destroying transfer of a pruned task");
                    handle.destroy();
                }
                return;
            };
            while let Ok(event) = rx.try_recv() {
                if is_setup(&event) {
                    task.on_transfer_event(event);
                } else {
                    early.push(event);
                }
            }
            match outcome {
                Ok(handle) => {
                    task.attach(handle);
                    for event in early {
                        if task.on_transfer_event(event) {
                            break;
                        }
                    }
                }
                Err(e) => task.fail(e),
            }
            if task.state().is_terminal() {
                self.finish(&mut state, id);
                return;
            }
        }

        loop {
            let event = tokio::select! {
                event = rx.recv() => event,
                _ = token.cancelled() => return,
            };
            let mut state = self.state.lock().await;
            let Some(task) = state.tasks.get_mut(&id) else {
                return;
            };
            let done = match event {
                Some(event) => task.on_transfer_event(event),
                None => {
                    task.fail(ResolveError::Other("transfer ended unexpectedly".into()));
                    true
                }
            };
            if done {
                self.finish(&mut state, id);
                return;
            }
        }
    }
}

fn is_setup(event: &TransferEvent) -> bool {
    matches!(event, TransferEvent::BinariesAcquiring | TransferEvent::BinariesAcquired)
}
