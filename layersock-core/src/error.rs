//! Layersock Core Error Types
//!
//! Errors raised by readiness backends, socket sets and the dispatch service.

use crate::Handle;
use std::io;
use thiserror::Error;

/// Main error type for core operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error during socket operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Backend or socket set is at capacity
    #[error("Resource exhausted: capacity of {capacity} reached")]
    ResourceExhausted { capacity: usize },

    /// Unrecoverable readiness backend failure
    #[error("Readiness backend error: {0}")]
    Backend(io::Error),

    /// Handle is not registered with the backend
    #[error("Handle {0} is not registered")]
    NotRegistered(Handle),

    /// Handle is already registered with the backend
    #[error("Handle {0} is already registered")]
    AlreadyRegistered(Handle),

    /// Event or command addressed to a worker that does not exist
    #[error("No such worker: {0}")]
    NoSuchWorker(usize),

    /// Socket is no longer alive on its worker
    #[error("No such socket")]
    NoSuchSocket,

    /// Service has been stopped
    #[error("Service stopped")]
    Stopped,

    /// Service was already started
    #[error("Service already started")]
    AlreadyStarted,
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap an OS failure from the readiness mechanism.
    pub fn backend(err: io::Error) -> Self {
        Self::Backend(err)
    }

    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            Self::ResourceExhausted { .. } => true,
            _ => false,
        }
    }

    /// Check if this error must terminate the owning worker
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}
