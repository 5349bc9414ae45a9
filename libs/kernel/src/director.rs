//! Process director
//!
//! [`ProcessDirector`] runs a flat set of actors, one thread per actor, and
//! supervises them through the shared [`DirectorCore`] monitor. Its `fire()`
//! does no scheduling at all: it sleeps on the monitor until the deadlock
//! predicate holds, hands the situation to the installed
//! [`DeadlockStrategy`], and records the strategy's verdict for
//! `postfire()`.
//!
//! Deadlock handling is an injected strategy rather than a director
//! subclass; [`CompositeProcessDirector`](crate::composite::CompositeProcessDirector)
//! installs the hierarchical one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::KernelConfig;
use crate::core::{DirectorCore, DirectorState};
use crate::error::{KernelError, Result};
use crate::notifier::{Notifier, Wakeable};
use crate::receiver::ProcessReceiver;
use crate::worker::{Actor, ActorWorker, FailureSlot, WorkerHandle};

/// Deadlock detection and resolution policy for one director.
///
/// Both methods run while the caller holds the director's monitor; `resolve`
/// receives the guard so it can release and reacquire it around waits of its
/// own.
pub trait DeadlockStrategy<T: Send + 'static>: Send + Sync {
    /// Whether the state constitutes a deadlock. The default treats a model
    /// with every active process blocked as deadlocked, including the
    /// vacuous case of zero active processes (a completed model).
    fn is_deadlocked(&self, state: &DirectorState<T>) -> bool {
        state.blocked() >= state.active()
    }

    /// React to a detected deadlock. Returns whether execution can
    /// continue: `Ok(false)` means the deadlock is real and the model is
    /// done, which is the only sensible answer for a flat model.
    fn resolve(
        &self,
        _core: &Arc<DirectorCore<T>>,
        _state: &mut MutexGuard<'_, DirectorState<T>>,
    ) -> Result<bool> {
        Ok(false)
    }
}

/// The flat-model policy: any total blockage ends the model.
pub struct DefaultDeadlockStrategy;

impl<T: Send + 'static> DeadlockStrategy<T> for DefaultDeadlockStrategy {}

/// An actor accepted by `initialize()` and not yet running.
struct PendingWorker<T: Send + 'static> {
    actor: Box<dyn Actor<T>>,
}

/// Directs a set of process actors, one dedicated thread each.
pub struct ProcessDirector<T: Send + 'static> {
    core: Arc<DirectorCore<T>>,
    config: KernelConfig,
    strategy: Box<dyn DeadlockStrategy<T>>,
    pending: Mutex<Vec<PendingWorker<T>>>,
    workers: Mutex<Vec<WorkerHandle>>,
    receivers: Mutex<Vec<Arc<ProcessReceiver<T>>>>,
    failure: FailureSlot,
    terminated: AtomicBool,
}

impl<T: Send + 'static> ProcessDirector<T> {
    pub fn new(name: impl Into<String>, config: KernelConfig) -> Self {
        Self::with_strategy(name, config, Box::new(DefaultDeadlockStrategy))
    }

    pub fn with_strategy(
        name: impl Into<String>,
        config: KernelConfig,
        strategy: Box<dyn DeadlockStrategy<T>>,
    ) -> Self {
        Self::with_parts(DirectorCore::new(name), config, strategy)
    }

    pub(crate) fn with_parts(
        core: Arc<DirectorCore<T>>,
        config: KernelConfig,
        strategy: Box<dyn DeadlockStrategy<T>>,
    ) -> Self {
        Self {
            core,
            config,
            strategy,
            pending: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            receivers: Mutex::new(Vec::new()),
            failure: FailureSlot::default(),
            terminated: AtomicBool::new(false),
        }
    }

    /// The shared monitor, for receiver construction and hierarchy wiring.
    pub fn core(&self) -> &Arc<DirectorCore<T>> {
        &self.core
    }

    /// Queue capacity applied to receivers from this factory.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Create a plain receiver registered with this director.
    pub fn new_receiver(&self, label: impl Into<String>) -> Arc<ProcessReceiver<T>> {
        self.make_receiver(label.into(), false)
    }

    /// Create a receiver that sits on an opaque composite boundary.
    pub fn new_boundary_receiver(&self, label: impl Into<String>) -> Arc<ProcessReceiver<T>> {
        self.make_receiver(label.into(), true)
    }

    fn make_receiver(&self, label: String, boundary: bool) -> Arc<ProcessReceiver<T>> {
        let receiver = ProcessReceiver::new(
            label,
            self.config.queue_capacity,
            boundary,
            Arc::clone(&self.core),
        );
        self.receivers.lock().push(Arc::clone(&receiver));
        receiver
    }

    /// Reset all execution state and accept the model's actors. Each
    /// actor's receivers are reinitialized before its own `initialize()`
    /// runs. Fails once the director has been terminated.
    pub fn initialize(&self, actors: Vec<Box<dyn Actor<T>>>) -> Result<()> {
        self.check_terminated()?;
        info!(director = %self.core.name(), actors = actors.len(), "initializing");
        self.core.reset();
        self.failure.lock().take();

        for receiver in self.receivers.lock().iter() {
            receiver.initialize();
        }

        let mut pending = self.pending.lock();
        pending.clear();
        for mut actor in actors {
            for receiver in actor.input_receivers() {
                receiver.initialize();
            }
            actor
                .initialize()
                .map_err(|e| KernelError::actor(actor.name(), e.to_string()))?;
            pending.push(PendingWorker { actor });
        }
        Ok(())
    }

    /// Start one thread per initialized actor. The active count is raised
    /// before each spawn so a `fire()` racing ahead of slow thread startup
    /// can never observe a vacuously completed model.
    pub fn prefire(&self) -> Result<bool> {
        self.check_terminated()?;
        let mut pending = self.pending.lock();
        let mut workers = self.workers.lock();
        for entry in pending.drain(..) {
            let name = entry.actor.name().to_string();
            let stop = Arc::new(AtomicBool::new(false));
            self.core.increase_active();
            let worker = ActorWorker::new(
                entry.actor,
                Arc::clone(&self.core),
                Arc::clone(&stop),
                Arc::clone(&self.failure),
            );
            let thread = std::thread::Builder::new()
                .name(format!("worker-{name}"))
                .spawn(move || worker.run());
            match thread {
                Ok(join) => workers.push(WorkerHandle {
                    actor: name,
                    stop,
                    join: Some(join),
                }),
                Err(e) => {
                    self.core.decrease_active();
                    return Err(KernelError::Spawn {
                        task: format!("worker-{name}"),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(true)
    }

    /// Block until the deadlock predicate holds, then let the strategy
    /// react. The strategy's verdict becomes the `postfire()` result.
    pub fn fire(&self) -> Result<()> {
        let mut state = self.core.lock();
        loop {
            if self.terminated.load(Ordering::Acquire) {
                return Err(KernelError::Terminated {
                    director: self.core.name().to_string(),
                });
            }
            if self.strategy.is_deadlocked(&state) {
                break;
            }
            self.core.wait(&mut state);
        }
        debug!(
            director = %self.core.name(),
            active = state.active(),
            blocked = state.blocked(),
            "deadlock detected"
        );
        let resolved = self.strategy.resolve(&self.core, &mut state)?;
        state.set_continue_running(resolved);
        Ok(())
    }

    /// Whether another iteration should run.
    pub fn postfire(&self) -> Result<bool> {
        Ok(self.core.lock().continue_running() && !self.terminated.load(Ordering::Acquire))
    }

    /// Request a cooperative stop of every worker at its next cycle
    /// boundary. Non-blocking; workers wedged in a transfer stay wedged
    /// until `wrapup()` finishes their receivers.
    pub fn stop_fire(&self) {
        debug!(director = %self.core.name(), "stop requested");
        for handle in self.workers.lock().iter() {
            handle.request_stop();
        }
    }

    /// Orderly end of execution: finish every receiver, wake all monitors
    /// from a neutral thread, and join the workers. If any actor's
    /// lifecycle failed during the run, the first such failure is returned
    /// here.
    pub fn wrapup(&self) -> Result<()> {
        info!(director = %self.core.name(), "wrapping up");
        let receivers = self.receivers.lock().clone();
        for receiver in &receivers {
            receiver.request_finish();
        }

        let mut targets: Vec<Arc<dyn Wakeable>> = receivers
            .into_iter()
            .map(|r| r as Arc<dyn Wakeable>)
            .collect();
        targets.push(Arc::clone(&self.core) as Arc<dyn Wakeable>);
        Notifier::notify(targets)?;

        self.join_workers();
        match self.failure.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Abrupt, destructive shutdown. The worker list is abandoned before
    /// stop flags and finish requests go out, and nothing is joined; the
    /// director is unusable afterwards.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(director = %self.core.name(), "terminating");
        let abandoned: Vec<WorkerHandle> = self.workers.lock().drain(..).collect();
        for handle in &abandoned {
            handle.request_stop();
        }
        for receiver in self.receivers.lock().iter() {
            receiver.request_finish();
            receiver.wake();
        }
        self.core.wake();
    }

    fn join_workers(&self) {
        let mut workers = self.workers.lock();
        for handle in workers.iter_mut() {
            if let Some(join) = handle.join.take() {
                if join.join().is_err() {
                    warn!(actor = %handle.actor, "worker panicked");
                }
            }
        }
        workers.clear();
    }

    fn check_terminated(&self) -> Result<()> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(KernelError::Terminated {
                director: self.core.name().to_string(),
            });
        }
        Ok(())
    }
}
