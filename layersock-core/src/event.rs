//! Posted events and socket addressing.

use crate::backend::Token;
use bytes::Bytes;
use std::fmt;
use std::time::{Duration, Instant};

/// Address of a live socket: the worker that owns it plus its registration
/// token on that worker. Stable for the socket's whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId {
    worker: usize,
    token: Token,
}

impl SocketId {
    pub const fn new(worker: usize, token: Token) -> Self {
        Self { worker, token }
    }

    #[inline]
    pub const fn worker(&self) -> usize {
        self.worker
    }

    #[inline]
    pub const fn token(&self) -> Token {
        self.token
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}/{:#x}", self.worker, self.token.0)
    }
}

/// An immutable message for one socket, optionally delayed.
///
/// # Examples
///
/// ```
/// use layersock_core::backend::Token;
/// use layersock_core::event::{Event, SocketId};
/// use std::time::Duration;
///
/// let dst = SocketId::new(0, Token(7));
/// let evt = Event::new(dst, 1, "payload").with_flags(0x2).delayed(Duration::from_millis(5));
/// assert_eq!(evt.id(), 1);
/// assert!(evt.due().is_some());
/// ```
#[derive(Debug, Clone)]
pub struct Event {
    dst: SocketId,
    id: u32,
    payload: Bytes,
    flags: u32,
    due: Option<Instant>,
}

impl Event {
    pub fn new(dst: SocketId, id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            dst,
            id,
            payload: payload.into(),
            flags: 0,
            due: None,
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Make the event due `delay` from now.
    #[must_use]
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.due = Some(Instant::now() + delay);
        self
    }

    #[must_use]
    pub fn due_at(mut self, due: Instant) -> Self {
        self.due = Some(due);
        self
    }

    #[inline]
    pub const fn dst(&self) -> SocketId {
        self.dst
    }

    #[inline]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[inline]
    pub const fn flags(&self) -> u32 {
        self.flags
    }

    #[inline]
    pub const fn due(&self) -> Option<Instant> {
        self.due
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}
