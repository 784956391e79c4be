//! Readiness backends.
//!
//! A backend wraps one native readiness mechanism and reports, per registered
//! handle, which directions are ready. Three flavours share one contract:
//!
//! - [`PollBackend`]: level-triggered, built on `poll(2)`. A ready handle is
//!   reported on every `wait` until the condition clears.
//! - [`EdgeBackend`]: edge-triggered, built on `mio` (epoll / kqueue). A
//!   transition is reported once; the caller re-arms with `modify` after
//!   handling it.
//! - [`CompletionBackend`]: completion-style. Each `add`/`modify` submits one
//!   armed request per direction; a fired direction completes exactly once
//!   and stays disarmed until resubmitted.
//!
//! Shared guarantees:
//! - a reported handle stays valid until it is explicitly removed;
//! - `wait` never reports a handle that was removed before the call;
//! - `add` fails with [`Error::ResourceExhausted`] at capacity;
//! - an unrecoverable `wait` failure is [`Error::Backend`], which is fatal to
//!   the worker that owns the backend. `EINTR` is not a failure.

mod completion;
mod edge;
mod poll;
mod sys;

pub use completion::CompletionBackend;
pub use edge::EdgeBackend;
pub use poll::PollBackend;

use crate::error::Result;
use crate::interest::{Interest, Ready};
use crate::Handle;
use std::fmt;
use std::time::Duration;

/// Registration token handed back with every readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

/// One readiness report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub handle: Handle,
    pub token: Token,
    pub ready: Ready,
}

/// Which native mechanism a socket set is built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendKind {
    /// Level-triggered `poll(2)`
    Poll,
    /// Edge-triggered epoll / kqueue via `mio`
    #[default]
    Edge,
    /// One-shot completion-style submissions
    Completion,
}

impl BackendKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Poll => "poll",
            Self::Edge => "edge",
            Self::Completion => "completion",
        }
    }

    /// Whether handled events must be re-armed with `modify`.
    #[must_use]
    pub const fn needs_rearm(&self) -> bool {
        !matches!(self, Self::Poll)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The contract every readiness mechanism implements.
pub trait Backend: Send {
    fn kind(&self) -> BackendKind;

    /// Register `handle` under `token` watching `interest`.
    fn add(&mut self, handle: Handle, token: Token, interest: Interest) -> Result<()>;

    /// Replace the interest (and token) of a registered handle. For edge and
    /// completion backends this is also how a handled event is re-armed.
    fn modify(&mut self, handle: Handle, token: Token, interest: Interest) -> Result<()>;

    /// Unregister `handle`, discarding anything the backend still holds for it.
    fn remove(&mut self, handle: Handle) -> Result<()>;

    /// Block up to `timeout` (`None` = forever) and append ready handles to
    /// `events`, which is cleared first.
    fn wait(&mut self, events: &mut Vec<ReadyEvent>, timeout: Option<Duration>) -> Result<()>;

    /// Number of registered handles
    fn len(&self) -> usize;

    fn capacity(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build a backend of the given kind holding at most `capacity` handles.
///
/// # Errors
///
/// Returns an error if the OS refuses to create the underlying mechanism.
pub fn new_backend(kind: BackendKind, capacity: usize) -> Result<Box<dyn Backend>> {
    let backend: Box<dyn Backend> = match kind {
        BackendKind::Poll => Box::new(PollBackend::new(capacity)),
        BackendKind::Edge => Box::new(EdgeBackend::new(capacity)?),
        BackendKind::Completion => Box::new(CompletionBackend::new(capacity)),
    };
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_rearm_contract() {
        assert!(!BackendKind::Poll.needs_rearm());
        assert!(BackendKind::Edge.needs_rearm());
        assert!(BackendKind::Completion.needs_rearm());
        assert_eq!(BackendKind::default(), BackendKind::Edge);
    }

    #[test]
    fn test_factory_builds_requested_kind() {
        for kind in [BackendKind::Poll, BackendKind::Edge, BackendKind::Completion] {
            let backend = new_backend(kind, 4).unwrap();
            assert_eq!(backend.kind(), kind);
            assert_eq!(backend.capacity(), 4);
            assert!(backend.is_empty());
        }
    }
}
