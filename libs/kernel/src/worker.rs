//! Actor contract and per-actor workers
//!
//! One [`ActorWorker`] drives one actor through its
//! `prefire → fire → postfire` cycle on a dedicated thread, repeating until
//! the actor declines to continue, a receiver signals finish, or the
//! worker's cooperative stop flag is observed at the cycle boundary.
//!
//! The worker registers with its director's active count when the director
//! starts it and deregisters exactly once on any exit path, normal or
//! abrupt; the deregistration lives in a drop guard so a panicking actor
//! cannot skew the count.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::core::DirectorCore;
use crate::error::{KernelError, Result};
use crate::receiver::ProcessReceiver;

/// First actor failure of a run, shared by every worker of one director.
/// Later failures are logged but not recorded.
pub(crate) type FailureSlot = Arc<Mutex<Option<KernelError>>>;

/// The lifecycle contract consumed by the kernel. Semantics of each phase
/// belong to the actor; the kernel only sequences them.
pub trait Actor<T: Send + 'static>: Send {
    /// Name for logging and error context.
    fn name(&self) -> &str;

    /// One-time setup before any iteration. Receivers have already been
    /// reset when this runs.
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Whether the actor is ready to fire this cycle.
    fn prefire(&mut self) -> Result<bool> {
        Ok(true)
    }

    /// Perform one unit of computation, typically blocking in receiver
    /// put/get calls.
    fn fire(&mut self) -> Result<()>;

    /// Whether the actor wants further cycles. False is a normal,
    /// voluntary exit.
    fn postfire(&mut self) -> Result<bool> {
        Ok(true)
    }

    /// Cleanup after the last cycle.
    fn wrapup(&mut self) -> Result<()> {
        Ok(())
    }

    /// The actor's input receivers, enumerated so the director can reset
    /// them at initialize and finish them at wrapup.
    fn input_receivers(&self) -> Vec<Arc<ProcessReceiver<T>>> {
        Vec::new()
    }
}

/// Decrements the active count exactly once, on every exit path.
struct ActiveGuard<T: Send + 'static> {
    core: Arc<DirectorCore<T>>,
    actor: String,
}

impl<T: Send + 'static> Drop for ActiveGuard<T> {
    fn drop(&mut self) {
        debug!(actor = %self.actor, director = %self.core.name(), "worker exited");
        self.core.decrease_active();
    }
}

/// Drives one actor's execution loop. Constructed by the director at
/// `initialize()`, started at `prefire()`.
pub(crate) struct ActorWorker<T: Send + 'static> {
    actor: Box<dyn Actor<T>>,
    core: Arc<DirectorCore<T>>,
    stop: Arc<AtomicBool>,
    failure: FailureSlot,
}

impl<T: Send + 'static> ActorWorker<T> {
    pub(crate) fn new(
        actor: Box<dyn Actor<T>>,
        core: Arc<DirectorCore<T>>,
        stop: Arc<AtomicBool>,
        failure: FailureSlot,
    ) -> Self {
        Self {
            actor,
            core,
            stop,
            failure,
        }
    }

    /// The worker thread body. The active count was incremented by the
    /// director just before this thread was spawned; the guard below pairs
    /// that with exactly one decrement.
    pub(crate) fn run(mut self) {
        let name = self.actor.name().to_string();
        debug!(actor = %name, director = %self.core.name(), "worker started");
        let _active = ActiveGuard {
            core: Arc::clone(&self.core),
            actor: name.clone(),
        };

        loop {
            if self.stop.load(Ordering::Acquire) {
                debug!(actor = %name, "cooperative stop observed");
                break;
            }
            match self.iterate() {
                Ok(true) => {}
                Ok(false) => {
                    debug!(actor = %name, "actor completed");
                    break;
                }
                Err(e) if e.is_finish() => {
                    debug!(actor = %name, "finish observed during transfer");
                    break;
                }
                Err(e) => {
                    error!(actor = %name, error = %e, "actor iteration failed");
                    let mut slot = self.failure.lock();
                    if slot.is_none() {
                        *slot = Some(KernelError::actor(name.as_str(), e.to_string()));
                    }
                    break;
                }
            }
        }

        if let Err(e) = self.actor.wrapup() {
            warn!(actor = %name, error = %e, "actor wrapup failed");
        }
    }

    /// One `prefire → fire → postfire` cycle. A declining prefire ends the
    /// worker: there is no schedule to re-arm the actor in a process
    /// domain, and spinning on prefire is never acceptable.
    fn iterate(&mut self) -> Result<bool> {
        if !self.actor.prefire()? {
            return Ok(false);
        }
        self.actor.fire()?;
        self.actor.postfire()
    }
}

/// Handle to a started worker: its thread plus its cooperative stop flag.
pub(crate) struct WorkerHandle {
    pub(crate) actor: String,
    pub(crate) stop: Arc<AtomicBool>,
    pub(crate) join: Option<std::thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request a cooperative stop at the next cycle boundary.
    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountdownActor {
        name: String,
        remaining: usize,
        fired: Arc<AtomicUsize>,
    }

    impl Actor<i64> for CountdownActor {
        fn name(&self) -> &str {
            &self.name
        }

        fn fire(&mut self) -> Result<()> {
            self.fired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn postfire(&mut self) -> Result<bool> {
            self.remaining -= 1;
            Ok(self.remaining > 0)
        }
    }

    #[test]
    fn worker_runs_until_postfire_declines() {
        let core = DirectorCore::<i64>::new("test");
        let fired = Arc::new(AtomicUsize::new(0));
        let actor = CountdownActor {
            name: "countdown".into(),
            remaining: 3,
            fired: Arc::clone(&fired),
        };
        core.increase_active();
        let worker = ActorWorker::new(
            Box::new(actor),
            Arc::clone(&core),
            Arc::new(AtomicBool::new(false)),
            FailureSlot::default(),
        );
        worker.run();

        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(core.active_count(), 0);
    }

    #[test]
    fn stop_flag_halts_at_cycle_boundary() {
        let core = DirectorCore::<i64>::new("test");
        let fired = Arc::new(AtomicUsize::new(0));
        let actor = CountdownActor {
            name: "endless".into(),
            remaining: usize::MAX,
            fired: Arc::clone(&fired),
        };
        core.increase_active();
        let stop = Arc::new(AtomicBool::new(true));
        let worker = ActorWorker::new(
            Box::new(actor),
            Arc::clone(&core),
            stop,
            FailureSlot::default(),
        );
        worker.run();

        // Stop was set before the first cycle, so the actor never fired.
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(core.active_count(), 0);
    }

    struct DecliningActor;

    impl Actor<i64> for DecliningActor {
        fn name(&self) -> &str {
            "decliner"
        }

        fn prefire(&mut self) -> Result<bool> {
            Ok(false)
        }

        fn fire(&mut self) -> Result<()> {
            panic!("fire must not run when prefire declines");
        }
    }

    #[test]
    fn declining_prefire_exits_without_firing() {
        let core = DirectorCore::<i64>::new("test");
        core.increase_active();
        let worker = ActorWorker::new(
            Box::new(DecliningActor),
            Arc::clone(&core),
            Arc::new(AtomicBool::new(false)),
            FailureSlot::default(),
        );
        worker.run();
        assert_eq!(core.active_count(), 0);
    }

    struct FaultyActor;

    impl Actor<i64> for FaultyActor {
        fn name(&self) -> &str {
            "faulty"
        }

        fn fire(&mut self) -> Result<()> {
            Err(KernelError::configuration("bad state", "faulty"))
        }
    }

    #[test]
    fn failing_fire_is_recorded_in_the_failure_slot() {
        let core = DirectorCore::<i64>::new("test");
        core.increase_active();
        let failure = FailureSlot::default();
        let worker = ActorWorker::new(
            Box::new(FaultyActor),
            Arc::clone(&core),
            Arc::new(AtomicBool::new(false)),
            Arc::clone(&failure),
        );
        worker.run();

        assert_eq!(core.active_count(), 0);
        let recorded = failure.lock().take().expect("failure recorded");
        assert!(matches!(recorded, KernelError::Actor { .. }));
        assert!(recorded.to_string().contains("faulty"));
    }
}
