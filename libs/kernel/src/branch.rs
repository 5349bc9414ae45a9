//! Boundary branches and their controllers
//!
//! A composite actor's opaque ports carry data across a model-of-computation
//! boundary. For each (producer, consumer) receiver pair crossing one
//! direction of that boundary, a [`Branch`] relays tokens one at a time; a
//! [`BranchController`] owns every branch for one direction and runs them on
//! a single thread.
//!
//! The controller multiplexes its branches with non-blocking transfer
//! attempts. A branch that cannot progress records the receiver it is stuck
//! on; when every active branch is stuck the controller reports itself
//! blocked to its director (a broadcast the deadlock-resolution logic waits
//! on) and sleeps on its own condition with a configured poll interval.
//! Deactivation wakes the sleep immediately, so the observable halt points
//! do not depend on the poll.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::core::DirectorCore;
use crate::error::{KernelError, Result};
use crate::receiver::{ProcessReceiver, TryGet, TryPut};

/// Which side of the composite boundary a port (and its controller) serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// One (producer, consumer) receiver pair crossing the boundary.
#[derive(Debug, Clone)]
pub struct BoundaryRelay<T: Send + 'static> {
    /// Channel source, written by the far side of the boundary.
    pub producer: Arc<ProcessReceiver<T>>,
    /// Channel destination, read by the near side of the boundary.
    pub consumer: Arc<ProcessReceiver<T>>,
}

/// Description of one boundary port of a composite actor.
#[derive(Debug, Clone)]
pub struct BoundaryPort<T: Send + 'static> {
    pub name: String,
    pub direction: PortDirection,
    /// Only opaque ports separate models of computation; passing a
    /// non-opaque port here is a fatal configuration error.
    pub opaque: bool,
    pub relays: Vec<BoundaryRelay<T>>,
}

/// Outcome of one branch transfer attempt.
enum Transfer<T: Send + 'static> {
    Moved,
    Blocked(Arc<ProcessReceiver<T>>),
    Finished,
}

/// A unidirectional single-token relay between one receiver pair. Holds at
/// most one in-flight token so a full consumer never loses data.
struct Branch<T: Send + 'static> {
    producer: Arc<ProcessReceiver<T>>,
    consumer: Arc<ProcessReceiver<T>>,
    pending: Option<T>,
    active: bool,
}

impl<T: Send + 'static> Branch<T> {
    fn new(relay: &BoundaryRelay<T>) -> Self {
        Self {
            producer: Arc::clone(&relay.producer),
            consumer: Arc::clone(&relay.consumer),
            pending: None,
            active: true,
        }
    }

    fn try_transfer(&mut self) -> Transfer<T> {
        if self.pending.is_none() {
            match self.producer.try_get() {
                TryGet::Token(token) => self.pending = Some(token),
                TryGet::Empty => return Transfer::Blocked(Arc::clone(&self.producer)),
                TryGet::Finished => return Transfer::Finished,
            }
        }
        match self.pending.take() {
            Some(token) => match self.consumer.try_put(token) {
                TryPut::Accepted => Transfer::Moved,
                TryPut::Full(token) => {
                    self.pending = Some(token);
                    Transfer::Blocked(Arc::clone(&self.consumer))
                }
                TryPut::Finished => Transfer::Finished,
            },
            None => Transfer::Blocked(Arc::clone(&self.producer)),
        }
    }
}

/// Manages every boundary branch for one direction of a composite actor.
pub struct BranchController<T: Send + 'static> {
    side: PortDirection,
    core: Arc<DirectorCore<T>>,
    poll: Duration,
    branches: Mutex<Vec<Branch<T>>>,
    branch_count: AtomicUsize,
    deactivated: AtomicBool,
    blocked: AtomicBool,
    /// Snapshot of the receivers responsible for the current blockage;
    /// refreshed each time the blocked status is reported. Leaf lock.
    blocked_receivers: Mutex<Vec<Arc<ProcessReceiver<T>>>>,
    wait_lock: Mutex<()>,
    wakeup: Condvar,
}

impl<T: Send + 'static> BranchController<T> {
    pub(crate) fn new(
        side: PortDirection,
        core: Arc<DirectorCore<T>>,
        poll: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            side,
            core,
            poll,
            branches: Mutex::new(Vec::new()),
            branch_count: AtomicUsize::new(0),
            deactivated: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            blocked_receivers: Mutex::new(Vec::new()),
            wait_lock: Mutex::new(()),
            wakeup: Condvar::new(),
        })
    }

    /// Which boundary direction this controller serves.
    pub fn side(&self) -> PortDirection {
        self.side
    }

    /// Create one branch per relay of an opaque boundary port.
    pub fn add_branches(&self, port: &BoundaryPort<T>) -> Result<()> {
        if !port.opaque {
            return Err(KernelError::configuration(
                "port argument is not an opaque port",
                &port.name,
            ));
        }
        let mut branches = self.branches.lock();
        for relay in &port.relays {
            branches.push(Branch::new(relay));
        }
        self.branch_count.store(branches.len(), Ordering::Release);
        debug!(
            director = %self.core.name(),
            side = ?self.side,
            port = %port.name,
            branches = branches.len(),
            "added boundary branches"
        );
        Ok(())
    }

    /// Drop all branches and clear the stop/blocked state, ready for a
    /// fresh model initialization.
    pub(crate) fn reset(&self) {
        self.branches.lock().clear();
        self.branch_count.store(0, Ordering::Release);
        self.deactivated.store(false, Ordering::Release);
        self.blocked.store(false, Ordering::Release);
        self.blocked_receivers.lock().clear();
    }

    /// False for controllers with nothing to manage; prefire/stop logic
    /// skips these.
    pub fn has_branches(&self) -> bool {
        self.branch_count.load(Ordering::Acquire) > 0
    }

    /// True iff every owned branch currently cannot progress. Vacuously
    /// true for a controller with no branches, and permanently true once
    /// deactivated.
    pub fn is_blocked(&self) -> bool {
        !self.has_branches() || self.blocked.load(Ordering::Acquire)
    }

    /// Non-blocking cooperative stop request to all branches. The
    /// controller thread observes it promptly and reports blocked on its
    /// way out.
    pub fn deactivate_branches(&self) {
        let _guard = self.wait_lock.lock();
        self.deactivated.store(true, Ordering::Release);
        self.wakeup.notify_all();
        trace!(director = %self.core.name(), side = ?self.side, "branches deactivated");
    }

    /// Snapshot of the receivers currently responsible for blockage; the
    /// raw material of the escalation batch.
    pub fn blocked_receivers(&self) -> Vec<Arc<ProcessReceiver<T>>> {
        self.blocked_receivers.lock().clone()
    }

    /// Spawn the controller thread. Called by the composite's prefire on
    /// the first iteration only.
    pub(crate) fn spawn(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        // A live controller starts out unblocked; deadlock resolution must
        // not act on the pre-start flag value.
        self.core.set_controller_blocked(self.side, false);
        let controller = Arc::clone(self);
        let name = format!("branch-controller-{:?}-{}", self.side, self.core.name());
        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || controller.run())
            .map_err(|e| KernelError::Spawn {
                task: name,
                reason: e.to_string(),
            })
    }

    fn run(self: Arc<Self>) {
        debug!(director = %self.core.name(), side = ?self.side, "branch controller started");
        loop {
            if self.deactivated.load(Ordering::Acquire) {
                break;
            }

            let mut progressed = false;
            let mut stuck: Vec<Arc<ProcessReceiver<T>>> = Vec::new();
            let live;
            {
                let mut branches = self.branches.lock();
                for branch in branches.iter_mut().filter(|b| b.active) {
                    match branch.try_transfer() {
                        Transfer::Moved => progressed = true,
                        Transfer::Blocked(receiver) => stuck.push(receiver),
                        Transfer::Finished => branch.active = false,
                    }
                }
                live = branches.iter().filter(|b| b.active).count();
            }

            // Blocked means: nothing moved and every live branch is stuck.
            // A controller whose branches have all finished (live == 0) is
            // vacuously blocked.
            let now_blocked = !progressed && stuck.len() >= live;
            self.report(now_blocked, stuck);

            if !progressed {
                let mut guard = self.wait_lock.lock();
                if !self.deactivated.load(Ordering::Acquire) {
                    self.wakeup.wait_for(&mut guard, self.poll);
                }
            }
        }

        // A deactivated controller counts as blocked: stop-and-wait logic
        // in the director relies on this final report.
        self.report(true, self.blocked_receivers());
        debug!(director = %self.core.name(), side = ?self.side, "branch controller exited");
    }

    fn report(&self, blocked: bool, stuck: Vec<Arc<ProcessReceiver<T>>>) {
        let was_blocked = self.blocked.swap(blocked, Ordering::AcqRel);
        if blocked {
            *self.blocked_receivers.lock() = stuck;
        }
        if was_blocked != blocked {
            self.core.set_controller_blocked(self.side, blocked);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_until(deadline_ms: u64, mut predicate: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        predicate()
    }

    fn setup() -> (
        Arc<DirectorCore<i64>>,
        Arc<ProcessReceiver<i64>>,
        Arc<ProcessReceiver<i64>>,
        Arc<BranchController<i64>>,
    ) {
        let core = DirectorCore::new("composite");
        let producer = ProcessReceiver::new("port.producer", 1, true, Arc::clone(&core));
        let consumer = ProcessReceiver::new("port.consumer", 1, true, Arc::clone(&core));
        let controller =
            BranchController::new(PortDirection::Input, Arc::clone(&core), Duration::from_millis(1));
        let port = BoundaryPort {
            name: "in".into(),
            direction: PortDirection::Input,
            opaque: true,
            relays: vec![BoundaryRelay {
                producer: Arc::clone(&producer),
                consumer: Arc::clone(&consumer),
            }],
        };
        controller.add_branches(&port).expect("add branches");
        (core, producer, consumer, controller)
    }

    #[test]
    fn rejects_non_opaque_port() {
        let core = DirectorCore::<i64>::new("composite");
        let controller =
            BranchController::new(PortDirection::Input, Arc::clone(&core), Duration::from_millis(1));
        let port: BoundaryPort<i64> = BoundaryPort {
            name: "transparent".into(),
            direction: PortDirection::Input,
            opaque: false,
            relays: vec![],
        };
        let err = controller.add_branches(&port).expect_err("must reject");
        assert!(matches!(err, KernelError::Configuration { .. }));
    }

    #[test]
    fn relays_tokens_across_the_boundary() {
        let (_core, producer, consumer, controller) = setup();
        let handle = controller.spawn().expect("spawn");

        producer.put(11).expect("put");
        assert!(wait_until(500, || consumer.len() == 1));
        assert_eq!(consumer.get().expect("get"), 11);

        controller.deactivate_branches();
        handle.join().expect("join");
    }

    #[test]
    fn reports_blocked_when_no_data_flows() {
        let (core, _producer, _consumer, controller) = setup();
        let handle = controller.spawn().expect("spawn");

        assert!(wait_until(500, || controller.is_blocked()));
        assert!(core.lock().input_controller_blocked());

        controller.deactivate_branches();
        handle.join().expect("join");
    }

    #[test]
    fn blocked_snapshot_names_the_stuck_receiver() {
        let (_core, producer, _consumer, controller) = setup();
        let handle = controller.spawn().expect("spawn");

        assert!(wait_until(500, || controller.is_blocked()));
        let stuck = controller.blocked_receivers();
        assert_eq!(stuck.len(), 1);
        assert!(Arc::ptr_eq(&stuck[0], &producer));

        controller.deactivate_branches();
        handle.join().expect("join");
    }

    #[test]
    fn deactivate_unblocks_the_controller_thread() {
        let (_core, _producer, _consumer, controller) = setup();
        let handle = controller.spawn().expect("spawn");
        controller.deactivate_branches();
        handle.join().expect("join");
        assert!(controller.is_blocked());
    }

    #[test]
    fn empty_controller_is_vacuously_blocked() {
        let core = DirectorCore::<i64>::new("composite");
        let controller =
            BranchController::new(PortDirection::Output, Arc::clone(&core), Duration::from_millis(1));
        assert!(!controller.has_branches());
        assert!(controller.is_blocked());
    }
}
