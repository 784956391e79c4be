use super::{sys, Backend, BackendKind, ReadyEvent, Token};
use crate::error::{Error, Result};
use crate::interest::Interest;
use crate::Handle;
use hashbrown::HashMap;
use std::time::Duration;
use tracing::trace;

struct Submission {
    token: Token,
    armed: Interest,
}

/// Completion-style backend.
///
/// `add` and `modify` submit one request per requested direction. When a
/// direction becomes ready its request completes: it is reported once and
/// disarmed. An error or hangup completes every outstanding request of the
/// handle. Nothing is reported for a handle with no outstanding request.
pub struct CompletionBackend {
    submissions: HashMap<Handle, Submission>,
    scratch: Vec<libc::pollfd>,
    capacity: usize,
}

impl CompletionBackend {
    pub fn new(capacity: usize) -> Self {
        Self {
            submissions: HashMap::new(),
            scratch: Vec::new(),
            capacity,
        }
    }

    /// Directions still awaiting completion for `handle`.
    pub fn armed(&self, handle: Handle) -> Option<Interest> {
        self.submissions.get(&handle).map(|s| s.armed)
    }
}

impl Backend for CompletionBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Completion
    }

    fn add(&mut self, handle: Handle, token: Token, interest: Interest) -> Result<()> {
        if self.submissions.contains_key(&handle) {
            return Err(Error::AlreadyRegistered(handle));
        }
        if self.submissions.len() >= self.capacity {
            return Err(Error::ResourceExhausted {
                capacity: self.capacity,
            });
        }
        self.submissions.insert(
            handle,
            Submission {
                token,
                armed: interest,
            },
        );
        Ok(())
    }

    fn modify(&mut self, handle: Handle, token: Token, interest: Interest) -> Result<()> {
        let sub = self
            .submissions
            .get_mut(&handle)
            .ok_or(Error::NotRegistered(handle))?;
        sub.token = token;
        sub.armed = interest;
        Ok(())
    }

    fn remove(&mut self, handle: Handle) -> Result<()> {
        self.submissions
            .remove(&handle)
            .map(|_| ())
            .ok_or(Error::NotRegistered(handle))
    }

    fn wait(&mut self, events: &mut Vec<ReadyEvent>, timeout: Option<Duration>) -> Result<()> {
        events.clear();
        self.scratch.clear();
        self.scratch.extend(
            self.submissions
                .iter()
                .filter(|(_, sub)| !sub.armed.is_empty())
                .map(|(handle, sub)| sys::pollfd(*handle, sub.armed)),
        );

        let n = sys::poll(&mut self.scratch, timeout).map_err(Error::backend)?;
        if n == 0 {
            return Ok(());
        }

        for pfd in &self.scratch {
            if pfd.revents == 0 {
                continue;
            }
            let Some(sub) = self.submissions.get_mut(&pfd.fd) else {
                continue;
            };
            let fired = sys::ready_from(pfd.revents);
            if fired.is_error() || fired.is_closed() {
                sub.armed = Interest::NONE;
            } else {
                sub.armed = sub.armed - fired.directions();
            }
            trace!("[completion] fd {} completed {:?}", pfd.fd, fired);
            events.push(ReadyEvent {
                handle: pfd.fd,
                token: sub.token,
                ready: fired,
            });
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.submissions.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
