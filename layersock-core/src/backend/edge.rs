use super::{Backend, BackendKind, ReadyEvent, Token};
use crate::error::{Error, Result};
use crate::interest::{Interest, Ready};
use crate::Handle;
use hashbrown::HashMap;
use mio::unix::SourceFd;
use mio::{Events, Poll};
use std::io;
use std::time::Duration;
use tracing::trace;

const MAX_EVENTS_PER_WAIT: usize = 1024;

struct Registration {
    token: Token,
    interest: Interest,
}

/// Edge-triggered backend over `mio` (epoll on Linux, kqueue on BSD/macOS).
///
/// mio cannot register an empty interest, so a handle parked with
/// `Interest::NONE` is tracked here but deregistered from the OS.
pub struct EdgeBackend {
    poll: Poll,
    events: Events,
    registered: HashMap<Handle, Registration>,
    by_token: HashMap<Token, Handle>,
    capacity: usize,
}

impl EdgeBackend {
    /// # Errors
    ///
    /// Fails if the OS selector cannot be created.
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity.clamp(1, MAX_EVENTS_PER_WAIT)),
            registered: HashMap::new(),
            by_token: HashMap::new(),
            capacity,
        })
    }
}

fn to_mio(interest: Interest) -> Option<mio::Interest> {
    match (interest.is_readable(), interest.is_writable()) {
        (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
        (true, false) => Some(mio::Interest::READABLE),
        (false, true) => Some(mio::Interest::WRITABLE),
        (false, false) => None,
    }
}

fn ready_from(event: &mio::event::Event) -> Ready {
    let mut ready = Ready::EMPTY;
    if event.is_readable() {
        ready |= Ready::READ;
    }
    if event.is_writable() {
        ready |= Ready::WRITE;
    }
    if event.is_error() {
        ready |= Ready::ERROR;
    }
    if event.is_read_closed() || event.is_write_closed() {
        ready |= Ready::CLOSE | Ready::READ;
    }
    ready
}

impl Backend for EdgeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Edge
    }

    fn add(&mut self, handle: Handle, token: Token, interest: Interest) -> Result<()> {
        if self.registered.contains_key(&handle) {
            return Err(Error::AlreadyRegistered(handle));
        }
        if self.registered.len() >= self.capacity {
            return Err(Error::ResourceExhausted {
                capacity: self.capacity,
            });
        }
        if let Some(mio_interest) = to_mio(interest) {
            self.poll
                .registry()
                .register(&mut SourceFd(&handle), mio::Token(token.0), mio_interest)?;
        }
        self.registered.insert(handle, Registration { token, interest });
        self.by_token.insert(token, handle);
        Ok(())
    }

    fn modify(&mut self, handle: Handle, token: Token, interest: Interest) -> Result<()> {
        let reg = self
            .registered
            .get_mut(&handle)
            .ok_or(Error::NotRegistered(handle))?;
        let registry = self.poll.registry();
        let mut source = SourceFd(&handle);
        match (to_mio(reg.interest), to_mio(interest)) {
            (Some(_), Some(next)) => registry.reregister(&mut source, mio::Token(token.0), next)?,
            (None, Some(next)) => registry.register(&mut source, mio::Token(token.0), next)?,
            (Some(_), None) => registry.deregister(&mut source)?,
            (None, None) => {}
        }
        if reg.token != token {
            self.by_token.remove(&reg.token);
            self.by_token.insert(token, handle);
        }
        reg.token = token;
        reg.interest = interest;
        Ok(())
    }

    fn remove(&mut self, handle: Handle) -> Result<()> {
        let reg = self
            .registered
            .remove(&handle)
            .ok_or(Error::NotRegistered(handle))?;
        self.by_token.remove(&reg.token);
        if !reg.interest.is_empty() {
            match self.poll.registry().deregister(&mut SourceFd(&handle)) {
                Ok(()) => {}
                // already closed by the owner; the kernel dropped it for us
                Err(e) if e.raw_os_error() == Some(libc::EBADF) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn wait(&mut self, events: &mut Vec<ReadyEvent>, timeout: Option<Duration>) -> Result<()> {
        events.clear();
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(Error::backend(e));
        }
        for event in &self.events {
            let token = Token(event.token().0);
            let Some(&handle) = self.by_token.get(&token) else {
                continue;
            };
            let ready = ready_from(event);
            trace!("[edge] fd {} ready {:?}", handle, ready);
            events.push(ReadyEvent {
                handle,
                token,
                ready,
            });
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.registered.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
