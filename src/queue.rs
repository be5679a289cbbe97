// src/queue.rs

use std::collections::VecDeque;
use thiserror::Error;

use crate::models::{Request, TaskId};
use crate::relay::Relay;
use crate::task::Task;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("invalid request at position {index}: {reason}")]
    InvalidRequest { index: usize, reason: String },
}

/// Hands out task ids, dense and increasing from 1. One per manager.
#[derive(Debug)]
pub struct TaskIds {
    next: u64,
}

impl Default for TaskIds {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl TaskIds {
    pub fn next_id(&mut self) -> TaskId {
        let id = TaskId(self.next);
        self.next += 1;
        id
    }
}

/// FIFO of task ids awaiting admission. Insertion order is admission order.
#[derive(Debug, Default)]
pub struct TaskQueue {
    queue: VecDeque<TaskId>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates one inactive task per request, ids drawn from `ids`, and
    /// queues them in order. A single malformed request rejects the whole
    /// batch before any id is drawn.
    pub fn enqueue(
        &mut self,
        requests: Vec<Request>,
        ids: &mut TaskIds,
        relay: &Relay,
    ) -> Result<Vec<Task>, QueueError> {
        for (index, request) in requests.iter().enumerate() {
            request
                .validate()
                .map_err(|reason| QueueError::InvalidRequest { index, reason })?;
        }

        let tasks: Vec<Task> = requests
            .into_iter()
            .map(|request| Task::new(ids.next_id(), request, relay.clone()))
            .collect();
        self.queue.extend(tasks.iter().map(Task::id));
        Ok(tasks)
    }

    /// Appends an id. Returns false if it is already queued.
    pub fn push(&mut self, id: TaskId) -> bool {
        if self.queue.contains(&id) {
            return false;
        }
        self.queue.push_back(id);
        true
    }

    pub fn pop_front(&mut self) -> Option<TaskId> {
        self.queue.pop_front()
    }

    pub fn remove(&mut self, id: TaskId) -> bool {
        match self.queue.iter().position(|queued| *queued == id) {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.queue.contains(&id)
    }

    /// Removes and returns every queued id in FIFO order.
    pub fn drain(&mut self) -> Vec<TaskId> {
        self.queue.drain(..).collect()
    }

    /// Discards queued ids. Admitted tasks are not touched.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.queue.iter().copied()
    }
}
