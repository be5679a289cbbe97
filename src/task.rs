// src/task.rs

use crate::models::{Progress, Request, TaskId, TaskSnapshot, TaskState};
use crate::relay::{EventKind, FailureKind, Relay};
use crate::resolver::{ResolveError, TransferEvent, TransferHandle};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task {0} is already active")]
    AlreadyActive(TaskId),
    #[error("cannot {op} task {id} while it is {state}")]
    IllegalState {
        id: TaskId,
        state: TaskState,
        op: &'static str,
    },
}

/// A single download unit. Owns its transfer handle exclusively.
pub struct Task {
    id: TaskId,
    request: Request,
    state: TaskState,
    /// Present iff the state is Active or Paused.
    handle: Option<Box<dyn TransferHandle>>,
    /// Admitted, waiting for the resolver to hand back a handle.
    acquiring: bool,
    progress: Progress,
    error: Option<String>,
    relay: Relay,
}

impl Task {
    pub fn new(id: TaskId, request: Request, relay: Relay) -> Self {
        Self {
            id,
            request,
            state: TaskState::Inactive,
            handle: None,
            acquiring: false,
            progress: Progress::default(),
            error: None,
            relay,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquiring
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            request: self.request.clone(),
            state: self.state,
            progress: self.progress,
            error: self.error.clone(),
        }
    }

    /// Defers the task without starting a transfer.
    pub fn wait(&mut self) -> Result<(), TaskError> {
        match self.state {
            TaskState::Inactive => {
                self.set_state(TaskState::Pending);
                Ok(())
            }
            TaskState::Pending => Ok(()),
            state => Err(self.illegal(state, "wait")),
        }
    }

    /// Admits the task. It stays pending until [`Task::attach`] hands it a
    /// transfer; the returned request is what the resolver should fetch.
    pub fn start(&mut self) -> Result<Request, TaskError> {
        match self.state {
            TaskState::Active => Err(TaskError::AlreadyActive(self.id)),
            TaskState::Pending if self.acquiring => Err(TaskError::AlreadyActive(self.id)),
            TaskState::Inactive | TaskState::Pending => {
                self.acquiring = true;
                if self.state == TaskState::Inactive {
                    self.set_state(TaskState::Pending);
                }
                Ok(self.request.clone())
            }
            state => Err(self.illegal(state, "start")),
        }
    }

    /// Installs the transfer produced by the resolver. A task cancelled while
    /// its transfer was being acquired destroys the handle instead.
    pub fn attach(&mut self, handle: Box<dyn TransferHandle>) {
        if self.state != TaskState::Pending || !self.acquiring {
            debug!(task = %self.id, state = %self.state, "discarding late transfer handle");
            handle.destroy();
            return;
        }
        self.acquiring = false;
        self.handle = Some(handle);
        self.set_state(TaskState::Active);
    }

    pub fn pause(&mut self) -> Result<(), TaskError> {
        match self.state {
            TaskState::Active => {
                if let Some(handle) = &self.handle {
                    handle.pause();
                }
                self.set_state(TaskState::Paused);
                Ok(())
            }
            TaskState::Paused => Ok(()),
            state => Err(self.illegal(state, "pause")),
        }
    }

    pub fn resume(&mut self) -> Result<(), TaskError> {
        match self.state {
            TaskState::Paused => {
                if let Some(handle) = &self.handle {
                    handle.resume();
                }
                self.set_state(TaskState::Active);
                Ok(())
            }
            TaskState::Active => Ok(()),
            state => Err(self.illegal(state, "resume")),
        }
    }

    /// Cancels the task, destroying its transfer before returning.
    /// Cancelling an already cancelled task is a no-op.
    pub fn cancel(&mut self) -> Result<(), TaskError> {
        match self.state {
            TaskState::Cancelled => Ok(()),
            state if state.is_terminal() => Err(self.illegal(state, "cancel")),
            _ => {
                if let Some(handle) = self.handle.take() {
                    handle.destroy();
                }
                self.acquiring = false;
                self.set_state(TaskState::Cancelled);
                Ok(())
            }
        }
    }

    /// Marks the task failed. Ignored once the task is terminal.
    pub fn fail(&mut self, cause: ResolveError) {
        if self.state.is_terminal() {
            return;
        }
        warn!(task = %self.id, title = %self.request.title, error = %cause, "download failed");
        if let Some(handle) = self.handle.take() {
            handle.destroy();
        }
        self.acquiring = false;
        let failure = if cause.is_resource_exhausted() {
            FailureKind::ResourceExhausted
        } else {
            FailureKind::Resolution
        };
        let cause = cause.to_string();
        self.error = Some(cause.clone());
        self.relay.emit(self.id, EventKind::Error { cause, failure });
        self.set_state(TaskState::Failed);
    }

    /// Applies one event from the transfer stream. Returns true once the
    /// task is terminal.
    pub fn on_transfer_event(&mut self, event: TransferEvent) -> bool {
        if self.state.is_terminal() {
            return true;
        }
        match event {
            TransferEvent::BinariesAcquiring => {
                self.relay.emit(self.id, EventKind::BinariesAcquiring);
            }
            TransferEvent::BinariesAcquired => {
                self.relay.emit(self.id, EventKind::BinariesAcquired);
            }
            TransferEvent::Progress {
                percent,
                transferred,
                total,
            } => {
                if self.handle.is_some() {
                    self.record_progress(percent, transferred, total);
                }
            }
            TransferEvent::Error(cause) => self.fail(cause),
            TransferEvent::Complete => {
                if self.handle.is_some() {
                    if self.progress.percent < 100.0 {
                        let transferred = self.progress.transferred;
                        let total = self.progress.total;
                        self.record_progress(100.0, transferred, total);
                    }
                    // Dropped, not destroyed: the output is kept.
                    self.handle = None;
                    self.set_state(TaskState::Completed);
                } else {
                    self.fail(ResolveError::Other("transfer completed before it started".into()));
                }
            }
        }
        self.state.is_terminal()
    }

    fn record_progress(&mut self, percent: f64, transferred: u64, total: Option<u64>) {
        let percent = if percent.is_finite() { percent.clamp(0.0, 100.0) } else { 0.0 };
        if percent < self.progress.percent {
            return;
        }
        self.progress = Progress {
            percent,
            transferred: transferred.max(self.progress.transferred),
            total: total.or(self.progress.total),
        };
        self.relay.emit(
            self.id,
            EventKind::Progress {
                percent: self.progress.percent,
                transferred: self.progress.transferred,
                total: self.progress.total,
            },
        );
    }

    fn set_state(&mut self, state: TaskState) {
        debug!(task = %self.id, from = %self.state, to = %state, "task transition");
        self.state = state;
        self.relay.emit(self.id, EventKind::StateChanged { state });
    }

    fn illegal(&self, state: TaskState, op: &'static str) -> TaskError {
        TaskError::IllegalState {
            id: self.id,
            state,
            op,
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("request", &self.request)
            .field("state", &self.state)
            .field("acquiring", &self.acquiring)
            .field("progress", &self.progress)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{RelayStream, TaskEvent};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Calls(Arc<Mutex<Vec<&'static str>>>);

    impl Calls {
        fn take(&self) -> Vec<&'static str> {
            std::mem::take(&mut *self.0.lock().unwrap())
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

    fn new_task() -> (Task, RelayStream) {
        let (relay, stream) = Relay::channel();
        (Task::new(TaskId(1), Request::new("https://host/a", "a"), relay), stream)
    }

    fn running_task() -> (Task, RelayStream, Calls) {
        let (mut task, stream) = new_task();
        let calls = Calls::default();
        task.start().unwrap();
        task.attach(Box::new(calls.clone()));
        (task, stream, calls)
    }

    fn drain(stream: &mut RelayStream) -> Vec<EventKind> {
        let mut out = Vec::new();
        while let Some(TaskEvent { kind, .. }) = stream.try_recv() {
            out.push(kind);
        }
        out
    }

    fn progress(percent: f64) -> TransferEvent {
        TransferEvent::Progress {
            percent,
            transferred: percent as u64,
            total: Some(100),
        }
    }

    #[test]
    fn start_then_attach_becomes_active() {
        let (mut task, mut stream) = new_task();
        let request = task.start().unwrap();
        assert_eq!(request.title, "a");
        assert_eq!(task.state(), TaskState::Pending);
        assert!(!task.has_handle());

        task.attach(Box::new(Calls::default()));
        assert_eq!(task.state(), TaskState::Active);
        assert!(task.has_handle());
        assert_eq!(
            drain(&mut stream),
            vec![
                EventKind::StateChanged { state: TaskState::Pending },
                EventKind::StateChanged { state: TaskState::Active },
            ]
        );
    }

    #[test]
    fn start_twice_is_already_active() {
        let (mut task, _stream) = new_task();
        task.start().unwrap();
        assert_eq!(task.start(), Err(TaskError::AlreadyActive(TaskId(1))));
        task.attach(Box::new(Calls::default()));
        assert_eq!(task.start(), Err(TaskError::AlreadyActive(TaskId(1))));
    }

    #[test]
    fn wait_marks_pending_and_start_still_works() {
        let (mut task, _stream) = new_task();
        task.wait().unwrap();
        assert_eq!(task.state(), TaskState::Pending);
        task.wait().unwrap();
        task.start().unwrap();
        assert!(task.is_acquiring());
    }

    #[test]
    fn pause_and_resume_signal_handle_and_keep_progress() {
        let (mut task, _stream, calls) = running_task();
        task.on_transfer_event(progress(40.0));
        let before = task.progress();

        task.pause().unwrap();
        assert_eq!(task.state(), TaskState::Paused);
        task.resume().unwrap();
        assert_eq!(task.state(), TaskState::Active);
        assert_eq!(task.progress(), before);
        assert_eq!(calls.take(), vec!["pause", "resume"]);
    }

    #[test]
    fn pause_rejected_before_transfer_starts() {
        let (mut task, _stream) = new_task();
        assert!(matches!(task.pause(), Err(TaskError::IllegalState { op: "pause", .. })));
        task.wait().unwrap();
        assert!(matches!(task.resume(), Err(TaskError::IllegalState { op: "resume", .. })));
    }

    #[test]
    fn cancel_destroys_handle_and_is_idempotent() {
        let (mut task, _stream, calls) = running_task();
        task.cancel().unwrap();
        assert!(!task.has_handle());
        assert_eq!(calls.take(), vec!["destroy"]);

        task.cancel().unwrap();
        assert_eq!(task.state(), TaskState::Cancelled);
        assert!(calls.take().is_empty());
        assert!(matches!(task.resume(), Err(TaskError::IllegalState { .. })));
    }

    #[test]
    fn cancel_while_acquiring_destroys_late_handle() {
        let (mut task, _stream) = new_task();
        task.start().unwrap();
        task.cancel().unwrap();

        let calls = Calls::default();
        task.attach(Box::new(calls.clone()));
        assert_eq!(task.state(), TaskState::Cancelled);
        assert!(!task.has_handle());
        assert_eq!(calls.take(), vec!["destroy"]);
    }

    #[test]
    fn progress_is_monotonic_and_precedes_completion() {
        let (mut task, mut stream, _calls) = running_task();
        drain(&mut stream);

        task.on_transfer_event(progress(30.0));
        task.on_transfer_event(progress(20.0));
        task.on_transfer_event(progress(60.0));
        assert!(task.on_transfer_event(TransferEvent::Complete));
        assert!(!task.has_handle());

        let events = drain(&mut stream);
        let percents: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                EventKind::Progress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![30.0, 60.0, 100.0]);
        assert_eq!(
            events.last(),
            Some(&EventKind::StateChanged { state: TaskState::Completed })
        );
    }

    #[test]
    fn stream_error_fails_task_and_reports_cause() {
        let (mut task, mut stream, calls) = running_task();
        drain(&mut stream);

        let done = task.on_transfer_event(TransferEvent::Error(ResolveError::ResourceExhausted(
            "disk full".into(),
        )));
        assert!(done);
        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(task.error(), Some("out of storage: disk full"));
        assert_eq!(calls.take(), vec!["destroy"]);

        let events = drain(&mut stream);
        assert!(matches!(
            &events[0],
            EventKind::Error { failure: FailureKind::ResourceExhausted, .. }
        ));
        assert_eq!(events[1], EventKind::StateChanged { state: TaskState::Failed });

        // Absorbing: later events and operations change nothing.
        task.on_transfer_event(progress(90.0));
        assert!(drain(&mut stream).is_empty());
        assert!(matches!(task.cancel(), Err(TaskError::IllegalState { .. })));
    }

    #[test]
    fn binaries_events_are_forwarded_while_acquiring() {
        let (mut task, mut stream) = new_task();
        task.start().unwrap();
        drain(&mut stream);

        task.on_transfer_event(TransferEvent::BinariesAcquiring);
        task.on_transfer_event(TransferEvent::BinariesAcquired);
        assert_eq!(
            drain(&mut stream),
            vec![EventKind::BinariesAcquiring, EventKind::BinariesAcquired]
        );
    }
}
