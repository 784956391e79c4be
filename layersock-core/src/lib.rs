//! Layersock Core
//!
//! This crate contains the transport-agnostic building blocks:
//! - Readiness backends over poll / epoll-kqueue / one-shot submissions (`backend`)
//! - Interest and readiness masks (`interest`)
//! - Bounded socket sets with generation-checked tokens (`socket_set`)
//! - Delayed, ordered event queues (`queue`)
//! - Posted events and socket addressing (`event`)
//! - Cross-thread wakeups (`waker`)
//! - TCP utilities for non-blocking sockets (`tcp`)
//! - Service options (`options`)
//! - Error types (`error`)

// Only the backend syscall shim touches raw pointers
#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(unix))]
compile_error!("layersock currently ships readiness backends for unix targets only");

pub mod backend;
pub mod error;
pub mod event;
pub mod interest;
pub mod options;
pub mod queue;
pub mod socket_set;
pub mod tcp;
pub mod waker;

/// Raw OS socket descriptor.
pub type Handle = std::os::fd::RawFd;

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::backend::{new_backend, Backend, BackendKind, ReadyEvent, Token};
    pub use crate::error::{Error, Result};
    pub use crate::event::{Event, SocketId};
    pub use crate::interest::{Interest, Ready};
    pub use crate::options::{Assignment, ServiceOptions};
    pub use crate::queue::EventQueue;
    pub use crate::socket_set::SocketSet;
    pub use crate::waker::{WakeReceiver, Waker};
    pub use crate::Handle;
}
