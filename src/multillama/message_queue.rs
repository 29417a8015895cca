//! Bounded FIFO of user-submitted requests.
//!
//! The queue has a single processing slot: [`begin_next`](MessageQueue::begin_next)
//! marks the head as processing and it stays in the queue (counting against capacity)
//! until [`finish`](MessageQueue::finish) removes it.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use uuid::Uuid;

use crate::participant::ParticipantKey;
use crate::prompt::Attachment;

/// A request waiting for (or undergoing) dispatch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub id: Uuid,
    pub raw_input: String,
    pub attachments: Vec<Attachment>,
    pub targets: Vec<ParticipantKey>,
    /// Start the autonomous dialogue with `raw_input` as seed instead of broadcasting.
    pub autonomous_mode_requested: bool,
}

impl QueuedRequest {
    pub fn new(raw_input: impl Into<String>, attachments: Vec<Attachment>, targets: Vec<ParticipantKey>) -> Self {
        Self {
            id: Uuid::new_v4(),
            raw_input: raw_input.into(),
            attachments,
            targets,
            autonomous_mode_requested: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueError {
    Full { capacity: usize },
    Processing(Uuid),
    NotFound(Uuid),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Full { capacity } => {
                write!(f, "Queue is full ({} requests); wait for one to finish", capacity)
            }
            QueueError::Processing(id) => write!(f, "Request {} is already being processed", id),
            QueueError::NotFound(id) => write!(f, "Request {} is not in the queue", id),
        }
    }
}

impl Error for QueueError {}

#[derive(Clone, Debug)]
pub struct MessageQueue {
    capacity: usize,
    items: VecDeque<QueuedRequest>,
    processing: Option<Uuid>,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::new(),
            processing: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> impl Iterator<Item = &QueuedRequest> {
        self.items.iter()
    }

    /// Id of the request currently being processed.
    pub fn processing(&self) -> Option<Uuid> {
        self.processing
    }

    pub fn is_processing(&self) -> bool {
        self.processing.is_some()
    }

    /// Append a request. Rejected, never overwriting, once `capacity` items are held.
    pub fn enqueue(&mut self, request: QueuedRequest) -> Result<Uuid, QueueError> {
        if self.items.len() >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }
        let id = request.id;
        self.items.push_back(request);
        Ok(id)
    }

    /// Mark the head as processing and return a copy of it. `None` when the queue is
    /// empty or an item is already processing.
    pub fn begin_next(&mut self) -> Option<QueuedRequest> {
        if self.processing.is_some() {
            return None;
        }
        let head = self.items.front()?.clone();
        self.processing = Some(head.id);
        Some(head)
    }

    /// Remove the processing item once its work has settled.
    pub fn finish(&mut self, id: Uuid) -> Option<QueuedRequest> {
        if self.processing == Some(id) {
            self.processing = None;
        }
        let index = self.items.iter().position(|r| r.id == id)?;
        self.items.remove(index)
    }

    /// Remove a waiting item. The processing item cannot be cancelled.
    pub fn remove(&mut self, id: Uuid) -> Result<QueuedRequest, QueueError> {
        if self.processing == Some(id) {
            return Err(QueueError::Processing(id));
        }
        let index = self
            .items
            .iter()
            .position(|r| r.id == id)
            .ok_or(QueueError::NotFound(id))?;
        self.items.remove(index).ok_or(QueueError::NotFound(id))
    }

    /// Strip participants matching `predicate` from every waiting item and discard items
    /// left with no targets. Returns how many items were discarded.
    ///
    /// The processing item is stripped too but never discarded; it leaves the queue
    /// through [`finish`](MessageQueue::finish) once its in-flight calls settle.
    pub fn purge_targets<F>(&mut self, predicate: F) -> usize
    where
        F: Fn(&ParticipantKey) -> bool,
    {
        let processing = self.processing;
        let before = self.items.len();
        self.items.retain_mut(|item| {
            item.targets.retain(|key| !predicate(key));
            Some(item.id) == processing || !item.targets.is_empty()
        });
        before - self.items.len()
    }

    pub fn clear(&mut self) {
        let processing = self.processing;
        self.items.retain(|item| Some(item.id) == processing);
    }
}
