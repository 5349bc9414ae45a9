//! Deferred monitor wakeup
//!
//! Broadcasting on N receiver locks while already holding a director lock
//! can deadlock against a process that holds a receiver lock and is waiting
//! for the director. The [`Notifier`] breaks that cycle: it performs the
//! broadcast from a fresh thread that holds no locks at all.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, trace};

use crate::error::{KernelError, Result};

/// A monitor that can be woken from a neutral execution context.
pub trait Wakeable: Send + Sync {
    /// Broadcast-wake every waiter on this monitor.
    fn wake(&self);
}

/// Wakes a set of monitors from a thread holding no other locks.
pub struct Notifier;

impl Notifier {
    /// Spawn a thread that wakes every target, in order, then exits.
    ///
    /// The caller may drop the handle (the wakeups still happen) or join it
    /// when a deterministic completion point is needed.
    pub fn notify(targets: Vec<Arc<dyn Wakeable>>) -> Result<JoinHandle<()>> {
        let count = targets.len();
        trace!(targets = count, "spawning notifier");
        thread::Builder::new()
            .name("notifier".into())
            .spawn(move || {
                for target in targets {
                    target.wake();
                }
                debug!(targets = count, "notifier finished");
            })
            .map_err(|e| KernelError::Spawn {
                task: "notifier".into(),
                reason: e.to_string(),
            })
    }
}
