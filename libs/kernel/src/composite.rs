//! Composite process director
//!
//! [`CompositeProcessDirector`] runs the inside of an opaque composite
//! actor: the contained actors execute under a plain
//! [`ProcessDirector`](crate::director::ProcessDirector), while one branch
//! controller per boundary direction relays tokens across the composite's
//! opaque ports.
//!
//! Its contribution is deadlock classification. A total blockage is
//! *external* when at least one blocked receiver sits on the opaque
//! boundary, meaning the inside is starved or backed up by the outside, and
//! *internal* otherwise. External deadlocks are never fatal here: they are
//! either escalated to a process-oriented executive director or simply end
//! the iteration when the executive is schedule-oriented. Internal
//! deadlocks end the model unless a domain-specific
//! [`InternalDeadlockResolver`] clears them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::branch::{BoundaryPort, BranchController, PortDirection};
use crate::config::KernelConfig;
use crate::core::{DirectorCore, DirectorState};
use crate::director::{DeadlockStrategy, ProcessDirector};
use crate::error::{KernelError, Result};
use crate::receiver::ProcessReceiver;
use crate::worker::Actor;

/// What kind of director, if any, sits above this composite.
pub enum ExecutiveLink<T: Send + 'static> {
    /// Top level of the hierarchy. External deadlock here is fatal.
    None,
    /// A schedule-oriented executive. External deadlock ends the iteration
    /// and the executive decides what happens next.
    Schedule,
    /// A process-oriented executive; external deadlock escalates to its
    /// monitor.
    Process(Arc<DirectorCore<T>>),
}

impl<T: Send + 'static> Clone for ExecutiveLink<T> {
    fn clone(&self) -> Self {
        match self {
            Self::None => Self::None,
            Self::Schedule => Self::Schedule,
            Self::Process(core) => Self::Process(Arc::clone(core)),
        }
    }
}

/// Domain hook for resolving an internal deadlock.
pub trait InternalDeadlockResolver<T: Send + 'static>: Send + Sync {
    /// Attempt resolution under the director's monitor. Return whether the
    /// deadlock was cleared and iterations may continue.
    fn resolve(
        &self,
        core: &Arc<DirectorCore<T>>,
        state: &mut MutexGuard<'_, DirectorState<T>>,
    ) -> Result<bool>;
}

/// The default hook: internal deadlock is final.
pub struct NoInternalResolution;

impl<T: Send + 'static> InternalDeadlockResolver<T> for NoInternalResolution {
    fn resolve(
        &self,
        _core: &Arc<DirectorCore<T>>,
        _state: &mut MutexGuard<'_, DirectorState<T>>,
    ) -> Result<bool> {
        Ok(false)
    }
}

/// The hierarchical deadlock policy installed into the base director.
struct CompositeDeadlockResolver<T: Send + 'static> {
    input: Arc<BranchController<T>>,
    output: Arc<BranchController<T>>,
    executive: ExecutiveLink<T>,
    internal: Box<dyn InternalDeadlockResolver<T>>,
}

impl<T: Send + 'static> CompositeDeadlockResolver<T> {
    /// Deactivate both controllers and wait until both have reported
    /// blocked. Controllers report through the core, so waiting on the
    /// core's condition cannot miss the transition.
    fn stop_controllers(
        &self,
        core: &Arc<DirectorCore<T>>,
        state: &mut MutexGuard<'_, DirectorState<T>>,
    ) {
        self.input.deactivate_branches();
        self.output.deactivate_branches();
        while !(state.input_controller_blocked() && state.output_controller_blocked()) {
            core.wait(state);
        }
    }

    /// Forward the receivers both controllers are stuck on to the executive
    /// as one blocked unit, then wait until the executive stops tracking at
    /// least one of them. That shrinkage is the acknowledgement that the
    /// outer level has started absorbing the deadlock.
    fn escalate(
        &self,
        core: &Arc<DirectorCore<T>>,
        state: &mut MutexGuard<'_, DirectorState<T>>,
        executive: &Arc<DirectorCore<T>>,
    ) -> Result<bool> {
        let mut batch = self.output.blocked_receivers();
        batch.extend(self.input.blocked_receivers());
        let original = batch.len();
        debug!(
            director = %core.name(),
            executive = %executive.name(),
            batch = original,
            "escalating external deadlock"
        );
        if original == 0 {
            return Ok(true);
        }
        for receiver in &batch {
            receiver.mark_escalated(Arc::clone(executive));
        }
        executive.register_blocked_batch(&batch);

        // Release this director's monitor while waiting on the executive's,
        // as registration at the outer level may immediately unblock a
        // process that needs to reach back in here.
        MutexGuard::unlocked(state, || {
            let mut exec_state = executive.lock();
            while exec_state.batch_overlap(&batch) >= original {
                executive.wait(&mut exec_state);
            }
        });
        Ok(true)
    }

    fn resolve_external(
        &self,
        core: &Arc<DirectorCore<T>>,
        state: &mut MutexGuard<'_, DirectorState<T>>,
    ) -> Result<bool> {
        // An externally blocked inside makes controller blockage
        // inevitable; wait for the laggards before stopping them, so a
        // controller still relaying queued boundary tokens is never cut
        // short.
        while !(state.input_controller_blocked() && state.output_controller_blocked()) {
            core.wait(state);
        }
        self.stop_controllers(core, state);
        match &self.executive {
            ExecutiveLink::None => Err(KernelError::NoExecutiveDirector {
                director: core.name().to_string(),
            }),
            ExecutiveLink::Schedule => Ok(true),
            ExecutiveLink::Process(executive) => self.escalate(core, state, executive),
        }
    }

    fn resolve_internal(
        &self,
        core: &Arc<DirectorCore<T>>,
        state: &mut MutexGuard<'_, DirectorState<T>>,
    ) -> Result<bool> {
        while !state.output_controller_blocked() {
            core.wait(state);
        }
        self.stop_controllers(core, state);
        self.internal.resolve(core, state)
    }
}

impl<T: Send + 'static> DeadlockStrategy<T> for CompositeDeadlockResolver<T> {
    fn resolve(
        &self,
        core: &Arc<DirectorCore<T>>,
        state: &mut MutexGuard<'_, DirectorState<T>>,
    ) -> Result<bool> {
        if state.blocked() < state.active() {
            return Ok(false);
        }
        if state.externally_blocked() {
            debug!(director = %core.name(), "external deadlock");
            self.resolve_external(core, state)
        } else {
            debug!(director = %core.name(), "internal deadlock");
            self.resolve_internal(core, state)
        }
    }
}

/// Directs the actors inside an opaque composite, relaying boundary data
/// and classifying deadlocks as internal or external.
pub struct CompositeProcessDirector<T: Send + 'static> {
    base: ProcessDirector<T>,
    input: Arc<BranchController<T>>,
    output: Arc<BranchController<T>>,
    executive: ExecutiveLink<T>,
    controller_threads: Mutex<Vec<JoinHandle<()>>>,
    first_iteration: AtomicBool,
}

impl<T: Send + 'static> CompositeProcessDirector<T> {
    pub fn new(
        name: impl Into<String>,
        config: KernelConfig,
        executive: ExecutiveLink<T>,
    ) -> Self {
        Self::with_internal_resolver(name, config, executive, Box::new(NoInternalResolution))
    }

    /// Construct with a domain-specific internal deadlock resolver.
    pub fn with_internal_resolver(
        name: impl Into<String>,
        config: KernelConfig,
        executive: ExecutiveLink<T>,
        internal: Box<dyn InternalDeadlockResolver<T>>,
    ) -> Self {
        let core = DirectorCore::new(name);
        let input =
            BranchController::new(PortDirection::Input, Arc::clone(&core), config.controller_poll());
        let output =
            BranchController::new(PortDirection::Output, Arc::clone(&core), config.controller_poll());
        let strategy = CompositeDeadlockResolver {
            input: Arc::clone(&input),
            output: Arc::clone(&output),
            executive: executive.clone(),
            internal,
        };
        let base = ProcessDirector::with_parts(core, config, Box::new(strategy));
        Self {
            base,
            input,
            output,
            executive,
            controller_threads: Mutex::new(Vec::new()),
            first_iteration: AtomicBool::new(true),
        }
    }

    /// The shared monitor, for receiver construction and hierarchy wiring.
    pub fn core(&self) -> &Arc<DirectorCore<T>> {
        self.base.core()
    }

    /// Create a plain receiver registered with this director.
    pub fn new_receiver(&self, label: impl Into<String>) -> Arc<ProcessReceiver<T>> {
        self.base.new_receiver(label)
    }

    /// Create a receiver that sits on this composite's opaque boundary.
    pub fn new_boundary_receiver(&self, label: impl Into<String>) -> Arc<ProcessReceiver<T>> {
        self.base.new_boundary_receiver(label)
    }

    /// Reset execution state, accept the contained actors, and build one
    /// branch per relay of each opaque boundary port. Local time is
    /// synchronized from a process-oriented executive.
    pub fn initialize(
        &self,
        actors: Vec<Box<dyn Actor<T>>>,
        ports: Vec<BoundaryPort<T>>,
    ) -> Result<()> {
        self.base.initialize(actors)?;
        info!(director = %self.core().name(), ports = ports.len(), "wiring boundary");
        self.input.reset();
        self.output.reset();
        for port in &ports {
            match port.direction {
                PortDirection::Input => self.input.add_branches(port)?,
                PortDirection::Output => self.output.add_branches(port)?,
            }
        }
        if let ExecutiveLink::Process(executive) = &self.executive {
            self.core().set_current_time(executive.current_time());
        }
        self.first_iteration.store(true, Ordering::Release);
        Ok(())
    }

    /// Start the contained actors, and on the first iteration only, the
    /// branch controller threads. A controller with no branches never gets
    /// a thread.
    pub fn prefire(&self) -> Result<bool> {
        self.base.prefire()?;
        if self.first_iteration.swap(false, Ordering::AcqRel) {
            let mut threads = self.controller_threads.lock();
            for controller in [&self.input, &self.output] {
                if controller.has_branches() {
                    threads.push(controller.spawn()?);
                }
            }
        }
        Ok(true)
    }

    /// See [`ProcessDirector::fire`]. Deadlock classification happens in
    /// the installed strategy.
    pub fn fire(&self) -> Result<()> {
        self.base.fire()
    }

    /// Whether another iteration should run.
    pub fn postfire(&self) -> Result<bool> {
        self.base.postfire()
    }

    /// Request a cooperative stop of the contained workers.
    pub fn stop_fire(&self) {
        self.base.stop_fire();
    }

    /// Deactivate the input branch controller and wait until it reports
    /// blocked.
    pub fn stop_input_branch_controller(&self) {
        self.input.deactivate_branches();
        let mut state = self.core().lock();
        while !state.input_controller_blocked() {
            self.core().wait(&mut state);
        }
    }

    /// Deactivate the output branch controller and wait until it reports
    /// blocked.
    pub fn stop_output_branch_controller(&self) {
        self.output.deactivate_branches();
        let mut state = self.core().lock();
        while !state.output_controller_blocked() {
            self.core().wait(&mut state);
        }
    }

    /// Stop both boundary controllers, join their threads, then wrap up the
    /// contained actors.
    pub fn wrapup(&self) -> Result<()> {
        self.stop_input_branch_controller();
        self.stop_output_branch_controller();
        for thread in self.controller_threads.lock().drain(..) {
            if thread.join().is_err() {
                debug!(director = %self.core().name(), "controller thread panicked");
            }
        }
        self.base.wrapup()
    }

    /// Abrupt, destructive shutdown of actors and controllers alike.
    /// Controller threads are signalled but not joined.
    pub fn terminate(&self) {
        self.input.deactivate_branches();
        self.output.deactivate_branches();
        self.controller_threads.lock().clear();
        self.base.terminate();
    }
}
