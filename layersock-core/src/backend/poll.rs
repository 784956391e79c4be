use super::{sys, Backend, BackendKind, ReadyEvent, Token};
use crate::error::{Error, Result};
use crate::interest::Interest;
use crate::Handle;
use hashbrown::HashMap;
use std::time::Duration;
use tracing::trace;

/// Level-triggered backend over `poll(2)`.
///
/// Keeps a dense `pollfd` array so `wait` hands the kernel one contiguous
/// slice; removal swaps the last entry into the hole.
pub struct PollBackend {
    fds: Vec<libc::pollfd>,
    tokens: Vec<Token>,
    index: HashMap<Handle, usize>,
    capacity: usize,
}

impl PollBackend {
    pub fn new(capacity: usize) -> Self {
        Self {
            fds: Vec::with_capacity(capacity.min(1024)),
            tokens: Vec::with_capacity(capacity.min(1024)),
            index: HashMap::new(),
            capacity,
        }
    }
}

impl Backend for PollBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Poll
    }

    fn add(&mut self, handle: Handle, token: Token, interest: Interest) -> Result<()> {
        if self.index.contains_key(&handle) {
            return Err(Error::AlreadyRegistered(handle));
        }
        if self.fds.len() >= self.capacity {
            return Err(Error::ResourceExhausted {
                capacity: self.capacity,
            });
        }
        self.index.insert(handle, self.fds.len());
        self.fds.push(sys::pollfd(handle, interest));
        self.tokens.push(token);
        Ok(())
    }

    fn modify(&mut self, handle: Handle, token: Token, interest: Interest) -> Result<()> {
        let idx = *self.index.get(&handle).ok_or(Error::NotRegistered(handle))?;
        self.fds[idx].events = sys::events_for(interest);
        self.tokens[idx] = token;
        Ok(())
    }

    fn remove(&mut self, handle: Handle) -> Result<()> {
        let idx = self.index.remove(&handle).ok_or(Error::NotRegistered(handle))?;
        self.fds.swap_remove(idx);
        self.tokens.swap_remove(idx);
        if let Some(moved) = self.fds.get(idx) {
            self.index.insert(moved.fd, idx);
        }
        Ok(())
    }

    fn wait(&mut self, events: &mut Vec<ReadyEvent>, timeout: Option<Duration>) -> Result<()> {
        events.clear();
        let n = sys::poll(&mut self.fds, timeout).map_err(Error::backend)?;
        if n == 0 {
            return Ok(());
        }
        for (pfd, token) in self.fds.iter_mut().zip(&self.tokens) {
            if pfd.revents == 0 {
                continue;
            }
            let ready = sys::ready_from(pfd.revents);
            pfd.revents = 0;
            trace!("[poll] fd {} ready {:?}", pfd.fd, ready);
            events.push(ReadyEvent {
                handle: pfd.fd,
                token: *token,
                ready,
            });
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.fds.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
