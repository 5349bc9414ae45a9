//! Director monitor state
//!
//! [`DirectorCore`] is the single monitor shared by one level of hierarchy:
//! the active/blocked process counters, the set of receivers currently
//! reported blocked, the branch-controller blocked flags, and the local
//! model time, all guarded by one mutex with one broadcast condition.
//!
//! Every mutation that can unblock a waiter happens under this lock and is
//! followed by a broadcast, so a `fire()` loop waiting for the deadlock
//! predicate can never miss a wakeup.
//!
//! # Lock ordering
//!
//! Receiver locks are acquired before director cores (an inner core before
//! its executive), and a core may be held while poking a branch controller's
//! atomics. The reverse orders never occur: directors wake receivers only
//! through the [`Notifier`](crate::notifier::Notifier), and controllers call
//! into their core only while holding no lock of their own.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::branch::PortDirection;
use crate::notifier::Wakeable;
use crate::receiver::ProcessReceiver;

/// One escalated batch of boundary receivers from a contained composite.
/// The batch raised the blocked count by one at registration; `counted`
/// records whether that one unit is still outstanding, so absorbing several
/// batch members can never decrement the count more than once.
#[derive(Debug)]
struct EscalatedBatch<T: Send + 'static> {
    members: Vec<Arc<ProcessReceiver<T>>>,
    counted: bool,
}

/// Counter and flag state for one director, guarded by the core's mutex.
#[derive(Debug)]
pub struct DirectorState<T: Send + 'static> {
    active: usize,
    blocked: usize,
    continue_running: bool,
    blocked_receivers: Vec<Arc<ProcessReceiver<T>>>,
    escalated_batches: Vec<EscalatedBatch<T>>,
    input_controller_blocked: bool,
    output_controller_blocked: bool,
    current_time: f64,
}

impl<T: Send + 'static> DirectorState<T> {
    fn new() -> Self {
        Self {
            active: 0,
            blocked: 0,
            continue_running: true,
            blocked_receivers: Vec::new(),
            escalated_batches: Vec::new(),
            input_controller_blocked: true,
            output_controller_blocked: true,
            current_time: 0.0,
        }
    }

    /// Number of processes started and not yet exited.
    pub fn active(&self) -> usize {
        self.active
    }

    /// Number of processes currently reported blocked.
    pub fn blocked(&self) -> usize {
        self.blocked
    }

    /// Whether successive iterations are permitted.
    pub fn continue_running(&self) -> bool {
        self.continue_running
    }

    pub(crate) fn set_continue_running(&mut self, value: bool) {
        self.continue_running = value;
    }

    /// Receivers currently reported blocked at this level.
    pub fn blocked_receivers(&self) -> &[Arc<ProcessReceiver<T>>] {
        &self.blocked_receivers
    }

    /// True iff at least one blocked receiver crosses an opaque boundary.
    pub fn externally_blocked(&self) -> bool {
        self.blocked_receivers.iter().any(|r| r.is_boundary())
    }

    /// Blocked flag of the input branch controller, as last reported.
    pub fn input_controller_blocked(&self) -> bool {
        self.input_controller_blocked
    }

    /// Blocked flag of the output branch controller, as last reported.
    pub fn output_controller_blocked(&self) -> bool {
        self.output_controller_blocked
    }

    /// Local model time.
    pub fn current_time(&self) -> f64 {
        self.current_time
    }

    /// How many receivers of `batch` are still tracked as blocked here.
    /// Used by the escalation protocol to observe acknowledgement.
    pub fn batch_overlap(&self, batch: &[Arc<ProcessReceiver<T>>]) -> usize {
        batch
            .iter()
            .filter(|r| self.contains(r))
            .count()
    }

    fn contains(&self, receiver: &Arc<ProcessReceiver<T>>) -> bool {
        self.blocked_receivers
            .iter()
            .any(|r| Arc::ptr_eq(r, receiver))
    }

    fn remove(&mut self, receiver: &Arc<ProcessReceiver<T>>) -> bool {
        let before = self.blocked_receivers.len();
        self.blocked_receivers.retain(|r| !Arc::ptr_eq(r, receiver));
        self.blocked_receivers.len() != before
    }

    /// Drop `receiver` from whichever escalated batch holds it. Returns
    /// `None` for an individually blocked receiver, otherwise whether this
    /// removal consumes the batch's one counted unit.
    fn release_from_batch(&mut self, receiver: &Arc<ProcessReceiver<T>>) -> Option<bool> {
        for i in 0..self.escalated_batches.len() {
            let batch = &mut self.escalated_batches[i];
            if let Some(pos) = batch
                .members
                .iter()
                .position(|r| Arc::ptr_eq(r, receiver))
            {
                batch.members.remove(pos);
                let consumed = batch.counted;
                batch.counted = false;
                if batch.members.is_empty() {
                    self.escalated_batches.remove(i);
                }
                return Some(consumed);
            }
        }
        None
    }
}

/// The shared monitor owned by one director.
///
/// Counters are ordinary instance state, owned exclusively by their
/// director and mutated only through the registration operations below.
#[derive(Debug)]
pub struct DirectorCore<T: Send + 'static> {
    name: String,
    id: String,
    state: Mutex<DirectorState<T>>,
    cond: Condvar,
}

impl<T: Send + 'static> DirectorCore<T> {
    /// Create a fresh core with zeroed counters.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        let id = format!("director-{}", Uuid::new_v4());
        debug!(director = %name, id = %id, "creating director core");
        Arc::new(Self {
            name,
            id,
            state: Mutex::new(DirectorState::new()),
            cond: Condvar::new(),
        })
    }

    /// Director name, for logging and error context.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unique instance id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Acquire the monitor.
    pub fn lock(&self) -> MutexGuard<'_, DirectorState<T>> {
        self.state.lock()
    }

    /// Wait on the monitor condition. The guard must belong to this core.
    pub fn wait(&self, guard: &mut MutexGuard<'_, DirectorState<T>>) {
        self.cond.wait(guard);
    }

    fn broadcast(&self) {
        self.cond.notify_all();
    }

    /// Reset all counters, flags, and the blocked set. Called at
    /// `initialize()`.
    pub(crate) fn reset(&self) {
        let mut state = self.lock();
        state.active = 0;
        state.blocked = 0;
        state.continue_running = true;
        state.blocked_receivers.clear();
        state.escalated_batches.clear();
        state.input_controller_blocked = true;
        state.output_controller_blocked = true;
        state.current_time = 0.0;
        drop(state);
        self.broadcast();
    }

    /// Register one newly started process.
    pub(crate) fn increase_active(&self) {
        let mut state = self.lock();
        state.active += 1;
        trace!(director = %self.name, active = state.active, "active count increased");
        drop(state);
        self.broadcast();
    }

    /// Deregister one exited process.
    pub(crate) fn decrease_active(&self) {
        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);
        trace!(director = %self.name, active = state.active, "active count decreased");
        drop(state);
        self.broadcast();
    }

    /// Register the receiver that instigated a newly blocked process and
    /// increase the blocked count by one.
    pub fn actor_blocked(&self, receiver: &Arc<ProcessReceiver<T>>) {
        let mut state = self.lock();
        if state.contains(receiver) {
            return;
        }
        state.blocked_receivers.push(Arc::clone(receiver));
        state.blocked += 1;
        trace!(
            director = %self.name,
            receiver = receiver.label(),
            blocked = state.blocked,
            active = state.active,
            "process blocked"
        );
        drop(state);
        self.broadcast();
    }

    /// Deregister a previously blocked receiver. An individually blocked
    /// receiver decreases the blocked count by one; a member of an
    /// escalated batch only does so the first time the batch is touched,
    /// since the whole batch was registered as a single blocked unit.
    pub fn actor_unblocked(&self, receiver: &Arc<ProcessReceiver<T>>) {
        let mut state = self.lock();
        if !state.remove(receiver) {
            return;
        }
        let counted = state.release_from_batch(receiver).unwrap_or(true);
        if counted {
            state.blocked = state.blocked.saturating_sub(1);
        }
        trace!(
            director = %self.name,
            receiver = receiver.label(),
            blocked = state.blocked,
            active = state.active,
            "process unblocked"
        );
        drop(state);
        self.broadcast();
    }

    /// Register an escalated batch of blocked receivers from a contained
    /// composite. The whole batch counts as one blocked process: the worker
    /// driving the composite actor is wedged inside its inner director.
    pub fn register_blocked_batch(&self, batch: &[Arc<ProcessReceiver<T>>]) {
        let mut state = self.lock();
        let mut members = Vec::new();
        for receiver in batch {
            if !state.contains(receiver) {
                state.blocked_receivers.push(Arc::clone(receiver));
                members.push(Arc::clone(receiver));
            }
        }
        state.escalated_batches.push(EscalatedBatch {
            members,
            counted: true,
        });
        state.blocked += 1;
        debug!(
            director = %self.name,
            batch = batch.len(),
            blocked = state.blocked,
            active = state.active,
            "registered escalated receiver batch"
        );
        drop(state);
        self.broadcast();
    }

    /// Record a branch controller's blocked flag. Broadcasts only when the
    /// controller becomes blocked; clearing the flag never unblocks a
    /// waiter, so no wakeup is needed.
    pub(crate) fn set_controller_blocked(&self, side: PortDirection, blocked: bool) {
        let mut state = self.lock();
        match side {
            PortDirection::Input => state.input_controller_blocked = blocked,
            PortDirection::Output => state.output_controller_blocked = blocked,
        }
        trace!(
            director = %self.name,
            side = ?side,
            blocked,
            "controller blocked flag updated"
        );
        drop(state);
        if blocked {
            self.broadcast();
        }
    }

    /// Current active count.
    pub fn active_count(&self) -> usize {
        self.lock().active()
    }

    /// Current blocked count.
    pub fn blocked_count(&self) -> usize {
        self.lock().blocked()
    }

    /// Local model time.
    pub fn current_time(&self) -> f64 {
        self.lock().current_time()
    }

    pub(crate) fn set_current_time(&self, time: f64) {
        self.lock().current_time = time;
    }
}

impl<T: Send + 'static> Wakeable for DirectorCore<T> {
    fn wake(&self) {
        let _state = self.lock();
        self.cond.notify_all();
    }
}
