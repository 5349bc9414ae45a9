//! Error types for the process kernel
//!
//! Configuration mistakes (a non-opaque boundary port, an externally
//! deadlocked composite with no executive director) are fatal and abort the
//! run. A genuinely unresolvable deadlock is *not* an error: it surfaces as
//! `postfire()` returning false, which callers must treat as normal model
//! completion.

use thiserror::Error;

/// Result alias used throughout the kernel.
pub type Result<T, E = KernelError> = std::result::Result<T, E>;

/// Errors raised by the process kernel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// The model is mis-assembled. No retry will succeed.
    #[error("configuration error: {reason} ({item})")]
    Configuration { reason: String, item: String },

    /// A composite actor is externally deadlocked but sits at the top of the
    /// hierarchy, so there is no enclosing director to escalate to.
    #[error("composite '{director}' is externally deadlocked but has no executive director")]
    NoExecutiveDirector { director: String },

    /// The director was destroyed by `terminate()`; no further iteration is
    /// permitted.
    #[error("director '{director}' has been terminated and cannot be used again")]
    Terminated { director: String },

    /// A receiver observed its finish flag while a process was blocked (or
    /// about to block) in put/get. This is the cooperative termination
    /// signal, not a failure: workers unwind to their cycle boundary and
    /// exit normally.
    #[error("finish was requested on a receiver during a blocking transfer")]
    FinishRequested,

    /// An OS thread for a worker, branch controller, or notifier could not
    /// be spawned.
    #[error("failed to spawn thread for {task}: {reason}")]
    Spawn { task: String, reason: String },

    /// An actor's own lifecycle code failed.
    #[error("actor '{actor}' failed: {reason}")]
    Actor { actor: String, reason: String },

    /// A configuration file could not be read.
    #[error("failed to read config file '{path}': {reason}")]
    ConfigIo { path: String, reason: String },

    /// A configuration file could not be parsed.
    #[error("failed to parse config file '{path}': {reason}")]
    ConfigParse { path: String, reason: String },
}

impl KernelError {
    /// Build a configuration error with the offending item named.
    pub fn configuration(reason: impl Into<String>, item: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
            item: item.into(),
        }
    }

    /// Build an actor failure with context.
    pub fn actor(actor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Actor {
            actor: actor.into(),
            reason: reason.into(),
        }
    }

    /// True when this error is the cooperative finish signal rather than a
    /// genuine failure.
    pub fn is_finish(&self) -> bool {
        matches!(self, Self::FinishRequested)
    }
}
