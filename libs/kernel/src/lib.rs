//! Process-oriented actor execution kernel
//!
//! Runs models of communicating processes: every actor gets its own thread
//! and communicates through blocking bounded [`ProcessReceiver`] channels.
//! There is no schedule. A [`ProcessDirector`] merely watches its actors'
//! blocked/active counters and reacts when the whole model wedges; a
//! [`CompositeProcessDirector`] additionally relays tokens across an opaque
//! composite boundary and classifies a wedge as internal (fatal by default)
//! or external (escalated up the director hierarchy).
//!
//! ```no_run
//! use process_kernel::{Actor, KernelConfig, ProcessDirector, ProcessReceiver, Result};
//! use std::sync::Arc;
//!
//! struct Sink {
//!     input: Arc<ProcessReceiver<i64>>,
//! }
//!
//! impl Actor<i64> for Sink {
//!     fn name(&self) -> &str {
//!         "sink"
//!     }
//!     fn fire(&mut self) -> Result<()> {
//!         let token = self.input.get()?;
//!         println!("{token}");
//!         Ok(())
//!     }
//!     fn input_receivers(&self) -> Vec<Arc<ProcessReceiver<i64>>> {
//!         vec![Arc::clone(&self.input)]
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let director = ProcessDirector::<i64>::new("model", KernelConfig::default());
//!     let input = director.new_receiver("sink.in");
//!     director.initialize(vec![Box::new(Sink { input })])?;
//!     director.prefire()?;
//!     director.fire()?;
//!     director.wrapup()
//! }
//! ```

pub mod branch;
pub mod composite;
pub mod config;
pub mod core;
pub mod director;
pub mod error;
pub mod notifier;
pub mod receiver;
pub mod worker;

pub use branch::{BoundaryPort, BoundaryRelay, BranchController, PortDirection};
pub use composite::{
    CompositeProcessDirector, ExecutiveLink, InternalDeadlockResolver, NoInternalResolution,
};
pub use config::{load_config, KernelConfig};
pub use crate::core::{DirectorCore, DirectorState};
pub use director::{DeadlockStrategy, DefaultDeadlockStrategy, ProcessDirector};
pub use error::{KernelError, Result};
pub use notifier::{Notifier, Wakeable};
pub use receiver::{ProcessReceiver, TryGet, TryPut};
pub use worker::Actor;
