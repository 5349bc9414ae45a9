//! Blocking process receivers
//!
//! [`ProcessReceiver`] is a bounded FIFO channel endpoint shared by exactly
//! two processes: a producer calling [`put`](ProcessReceiver::put) and a
//! consumer calling [`get`](ProcessReceiver::get). A full queue blocks the
//! producer, an empty queue blocks the consumer, and either side registers
//! the blockage with its director so deadlock can be detected globally.
//!
//! Two flags modulate transfer:
//!
//! - `pause_requested` suspends put/get progress until cleared; clearing it
//!   wakes every waiter.
//! - `finish_requested` is idempotent and sticky: any process currently or
//!   subsequently blocked in put/get observes it on the next wait-loop
//!   iteration and returns [`KernelError::FinishRequested`].
//!
//! Unblocking follows the partner discipline of the source design: the
//! operation that makes progress (a put into an empty queue, a get from a
//! full one) deregisters its blocked partner with the director before
//! waking it, so the blocked count never lags behind the data that would
//! resolve it.
//!
//! All flag and queue mutation happens under the receiver's own lock; the
//! director core is only ever acquired *inside* a receiver operation, never
//! the other way around.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::core::DirectorCore;
use crate::error::{KernelError, Result};
use crate::notifier::Wakeable;

/// Outcome of a non-blocking get, used by boundary branches.
#[derive(Debug)]
pub enum TryGet<T> {
    /// A token was removed from the queue.
    Token(T),
    /// The queue is empty (or paused); the caller should treat the
    /// receiver as blocking.
    Empty,
    /// Finish has been requested; no further transfer will succeed.
    Finished,
}

/// Outcome of a non-blocking put, used by boundary branches.
#[derive(Debug)]
pub enum TryPut<T> {
    /// The token was appended to the queue.
    Accepted,
    /// The queue is full (or paused); the token is handed back.
    Full(T),
    /// Finish has been requested; no further transfer will succeed.
    Finished,
}

#[derive(Debug)]
struct ReceiverState<T> {
    queue: VecDeque<T>,
    finish_requested: bool,
    pause_requested: bool,
    read_blocked: bool,
    write_blocked: bool,
}

/// A blocking channel endpoint with pause/finish flags and director
/// registration. Created through a director's receiver factory.
#[derive(Debug)]
pub struct ProcessReceiver<T: Send + 'static> {
    label: String,
    capacity: usize,
    boundary: bool,
    registry: Arc<DirectorCore<T>>,
    state: Mutex<ReceiverState<T>>,
    available: Condvar,
    /// The executive core this receiver was escalated to, if any. Kept in
    /// its own leaf lock so escalation can mark receivers while holding a
    /// director core.
    escalated_to: Mutex<Option<Arc<DirectorCore<T>>>>,
}

impl<T: Send + 'static> ProcessReceiver<T> {
    pub(crate) fn new(
        label: impl Into<String>,
        capacity: usize,
        boundary: bool,
        registry: Arc<DirectorCore<T>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            capacity: capacity.max(1),
            boundary,
            registry,
            state: Mutex::new(ReceiverState {
                queue: VecDeque::new(),
                finish_requested: false,
                pause_requested: false,
                read_blocked: false,
                write_blocked: false,
            }),
            available: Condvar::new(),
            escalated_to: Mutex::new(None),
        })
    }

    /// Label for logging and error context.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// True when this receiver carries data across an opaque boundary on
    /// the inside. Fixed at construction.
    pub fn is_boundary(&self) -> bool {
        self.boundary
    }

    /// Clear pause/finish flags and drain the queue. Callable on
    /// construction and on model restart.
    pub fn initialize(&self) {
        let mut state = self.state.lock();
        state.queue.clear();
        state.finish_requested = false;
        state.pause_requested = false;
        state.read_blocked = false;
        state.write_blocked = false;
        *self.escalated_to.lock() = None;
        drop(state);
        self.available.notify_all();
    }

    /// Suspend or resume put/get progress. Clearing the pause wakes every
    /// waiter so suspended transfers resume promptly.
    pub fn set_pause(&self, paused: bool) {
        let mut state = self.state.lock();
        state.pause_requested = paused;
        drop(state);
        if !paused {
            self.available.notify_all();
        }
    }

    /// Request that every process using this receiver finish at its next
    /// communication point. Idempotent and sticky.
    pub fn request_finish(&self) {
        let mut state = self.state.lock();
        state.finish_requested = true;
        drop(state);
        self.available.notify_all();
    }

    /// Whether finish has been requested.
    pub fn is_finish_requested(&self) -> bool {
        self.state.lock().finish_requested
    }

    /// Number of queued tokens. Intended for assertions and debugging.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// True when no tokens are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the queued tokens in order, oldest first.
    pub fn queued(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.state.lock().queue.iter().cloned().collect()
    }

    /// Append a token, blocking while the queue is full or paused.
    ///
    /// Registers a write-block with the director while waiting. Returns
    /// [`KernelError::FinishRequested`] if finish is (or becomes) set.
    pub fn put(self: &Arc<Self>, token: T) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if state.finish_requested {
                if state.write_blocked {
                    state.write_blocked = false;
                    self.registry.actor_unblocked(self);
                }
                return Err(KernelError::FinishRequested);
            }
            if !state.pause_requested && state.queue.len() < self.capacity {
                state.queue.push_back(token);
                if state.read_blocked {
                    state.read_blocked = false;
                    self.registry.actor_unblocked(self);
                }
                self.note_progress();
                trace!(receiver = %self.label, depth = state.queue.len(), "token put");
                self.available.notify_all();
                return Ok(());
            }
            if !state.pause_requested && !state.write_blocked {
                state.write_blocked = true;
                self.registry.actor_blocked(self);
            }
            self.available.wait(&mut state);
        }
    }

    /// Remove a token, blocking while the queue is empty or paused.
    ///
    /// Registers a read-block with the director while waiting. Returns
    /// [`KernelError::FinishRequested`] if finish is (or becomes) set.
    pub fn get(self: &Arc<Self>) -> Result<T> {
        let mut state = self.state.lock();
        loop {
            if state.finish_requested {
                if state.read_blocked {
                    state.read_blocked = false;
                    self.registry.actor_unblocked(self);
                }
                return Err(KernelError::FinishRequested);
            }
            if !state.pause_requested {
                if let Some(token) = state.queue.pop_front() {
                    if state.write_blocked {
                        state.write_blocked = false;
                        self.registry.actor_unblocked(self);
                    }
                    self.note_progress();
                    trace!(receiver = %self.label, depth = state.queue.len(), "token got");
                    self.available.notify_all();
                    return Ok(token);
                }
                if !state.read_blocked {
                    state.read_blocked = true;
                    self.registry.actor_blocked(self);
                }
            }
            self.available.wait(&mut state);
        }
    }

    /// Non-blocking put used by boundary branches. Never registers a block
    /// with the director; branch blockage is the controller's concern.
    pub fn try_put(self: &Arc<Self>, token: T) -> TryPut<T> {
        let mut state = self.state.lock();
        if state.finish_requested {
            return TryPut::Finished;
        }
        if state.pause_requested || state.queue.len() >= self.capacity {
            return TryPut::Full(token);
        }
        state.queue.push_back(token);
        if state.read_blocked {
            state.read_blocked = false;
            self.registry.actor_unblocked(self);
        }
        self.note_progress();
        drop(state);
        self.available.notify_all();
        TryPut::Accepted
    }

    /// Non-blocking get used by boundary branches.
    pub fn try_get(self: &Arc<Self>) -> TryGet<T> {
        let mut state = self.state.lock();
        if state.finish_requested {
            return TryGet::Finished;
        }
        if state.pause_requested {
            return TryGet::Empty;
        }
        match state.queue.pop_front() {
            Some(token) => {
                if state.write_blocked {
                    state.write_blocked = false;
                    self.registry.actor_unblocked(self);
                }
                self.note_progress();
                drop(state);
                self.available.notify_all();
                TryGet::Token(token)
            }
            None => TryGet::Empty,
        }
    }

    /// Mark this receiver as escalated to an executive core. The next
    /// successful transfer deregisters it there, which is the
    /// acknowledgement the escalating director waits for.
    pub(crate) fn mark_escalated(self: &Arc<Self>, executive: Arc<DirectorCore<T>>) {
        *self.escalated_to.lock() = Some(executive);
    }

    /// Progress on an escalated receiver means the outer level has begun
    /// absorbing the deadlock: release it from the executive's blocked set.
    fn note_progress(self: &Arc<Self>) {
        if let Some(executive) = self.escalated_to.lock().take() {
            trace!(receiver = %self.label, executive = executive.name(), "escalated receiver absorbed");
            executive.actor_unblocked(self);
        }
    }
}

impl<T: Send + 'static> Wakeable for ProcessReceiver<T> {
    fn wake(&self) {
        let _state = self.state.lock();
        self.available.notify_all();
    }
}
