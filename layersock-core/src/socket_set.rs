//! Bounded socket set bound to one readiness backend.
//!
//! The set owns its backend and a slab of records. Each record's [`Token`]
//! packs the slab index with a generation counter, so a readiness event that
//! was already collected for a record that has since been removed (and whose
//! slot may have been reused) can never reach the new occupant.
//!
//! Records carry an ownership tag: the thread that inserted them. Every
//! access, shared or mutable, asserts that the caller is that thread.

use crate::backend::{new_backend, Backend, BackendKind, ReadyEvent, Token};
use crate::error::{Error, Result};
use crate::interest::Interest;
use crate::Handle;
use std::collections::VecDeque;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{trace, warn};

const INDEX_BITS: u32 = 24;
const INDEX_MASK: usize = (1 << INDEX_BITS) - 1;

/// Largest capacity a set can be built with.
pub const MAX_CAPACITY: usize = INDEX_MASK - 1;

/// Token for out-of-band handles (the worker's waker). Never a slab slot.
pub const RESERVED_TOKEN: Token = Token(INDEX_MASK);

/// Extra backend slots kept for reserved handles.
const RESERVED_SLOTS: usize = 1;

struct Entry<T> {
    handle: Handle,
    interest: Interest,
    owner: ThreadId,
    value: T,
}

struct Slot<T> {
    generation: usize,
    entry: Option<Entry<T>>,
}

fn encode(index: usize, generation: usize) -> Token {
    let gen_bits = usize::BITS - INDEX_BITS;
    let generation = generation & ((1usize << gen_bits) - 1);
    Token((generation << INDEX_BITS) | index)
}

fn decode(token: Token) -> (usize, usize) {
    (token.0 & INDEX_MASK, token.0 >> INDEX_BITS)
}

pub struct SocketSet<T> {
    backend: Box<dyn Backend>,
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    len: usize,
    capacity: usize,
    ready: VecDeque<ReadyEvent>,
    scratch: Vec<ReadyEvent>,
    reserved: Option<Handle>,
}

impl<T> SocketSet<T> {
    /// Build a set of `capacity` records on a fresh backend of `kind`.
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot be created.
    pub fn new(kind: BackendKind, capacity: usize) -> Result<Self> {
        let capacity = capacity.min(MAX_CAPACITY);
        let backend = new_backend(kind, capacity + RESERVED_SLOTS)?;
        Ok(Self::with_backend(backend, capacity))
    }

    /// Build a set over an existing backend. The backend must have room for
    /// `capacity` records plus any reserved handle.
    pub fn with_backend(backend: Box<dyn Backend>, capacity: usize) -> Self {
        Self {
            backend,
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            capacity: capacity.min(MAX_CAPACITY),
            ready: VecDeque::new(),
            scratch: Vec::new(),
            reserved: None,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    /// Register the out-of-band handle (at most one) under [`RESERVED_TOKEN`].
    ///
    /// # Errors
    ///
    /// Propagates backend registration failures.
    pub fn register_reserved(&mut self, handle: Handle, interest: Interest) -> Result<()> {
        if let Some(existing) = self.reserved {
            return Err(Error::AlreadyRegistered(existing));
        }
        self.backend.add(handle, RESERVED_TOKEN, interest)?;
        self.reserved = Some(handle);
        Ok(())
    }

    /// Re-arm the reserved handle (needed by edge / completion backends).
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn rearm_reserved(&mut self, interest: Interest) -> Result<()> {
        match self.reserved {
            Some(handle) => self.backend.modify(handle, RESERVED_TOKEN, interest),
            None => Ok(()),
        }
    }

    /// Insert a record built from its token and register it with the backend.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceExhausted`] when the set is full, or a backend error.
    pub fn insert_with<F>(&mut self, handle: Handle, interest: Interest, make: F) -> Result<Token>
    where
        F: FnOnce(Token) -> T,
    {
        if self.is_full() {
            return Err(Error::ResourceExhausted {
                capacity: self.capacity,
            });
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                self.slots.len() - 1
            }
        };
        let token = encode(index, self.slots[index].generation);
        if let Err(e) = self.backend.add(handle, token, interest) {
            self.free.push(index);
            return Err(e);
        }
        self.slots[index].entry = Some(Entry {
            handle,
            interest,
            owner: thread::current().id(),
            value: make(token),
        });
        self.len += 1;
        trace!("[set] inserted fd {} as {:?}", handle, token);
        Ok(token)
    }

    fn entry(&self, token: Token) -> Option<&Entry<T>> {
        let (index, generation) = decode(token);
        let slot = self.slots.get(index)?;
        if encode(index, slot.generation) != encode(index, generation) {
            return None;
        }
        let entry = slot.entry.as_ref()?;
        check_owner(entry.owner, token);
        Some(entry)
    }

    fn entry_mut(&mut self, token: Token) -> Option<&mut Entry<T>> {
        let (index, generation) = decode(token);
        let slot = self.slots.get_mut(index)?;
        if encode(index, slot.generation) != encode(index, generation) {
            return None;
        }
        let entry = slot.entry.as_mut()?;
        check_owner(entry.owner, token);
        Some(entry)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.entry(token).is_some()
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut T> {
        self.entry_mut(token).map(|e| &mut e.value)
    }

    pub fn interest(&self, token: Token) -> Option<Interest> {
        self.entry(token).map(|e| e.interest)
    }

    pub fn handle(&self, token: Token) -> Option<Handle> {
        self.entry(token).map(|e| e.handle)
    }

    /// Replace the watched interest. On edge and completion backends this
    /// re-arms the record even when the interest is unchanged.
    ///
    /// # Errors
    ///
    /// [`Error::NoSuchSocket`] for a stale token, or a backend error.
    pub fn set_interest(&mut self, token: Token, interest: Interest) -> Result<()> {
        let entry = self.entry_mut(token).ok_or(Error::NoSuchSocket)?;
        let handle = entry.handle;
        entry.interest = interest;
        self.backend.modify(handle, token, interest)
    }

    /// Remove a record: unregister it, drop any of its readiness still queued
    /// in the set, and retire the token.
    pub fn remove(&mut self, token: Token) -> Option<T> {
        let (index, _) = decode(token);
        let handle = self.entry_mut(token)?.handle;
        let slot = &mut self.slots[index];
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.len -= 1;

        if let Err(e) = self.backend.remove(handle) {
            warn!("[set] failed to unregister fd {}: {}", handle, e);
        }
        self.ready.retain(|ev| ev.token != token);
        trace!("[set] removed fd {} ({:?})", handle, token);
        Some(entry.value)
    }

    /// Wait on the backend and queue the reported readiness. Events whose
    /// token no longer names a live record are dropped here.
    ///
    /// # Errors
    ///
    /// [`Error::Backend`] on unrecoverable backend failure.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<usize> {
        self.backend.wait(&mut self.scratch, timeout)?;
        let before = self.ready.len();
        for ev in self.scratch.drain(..) {
            let live = ev.token == RESERVED_TOKEN || {
                let (index, generation) = decode(ev.token);
                self.slots.get(index).is_some_and(|slot| {
                    slot.entry.is_some()
                        && encode(index, slot.generation) == encode(index, generation)
                })
            };
            if live {
                self.ready.push_back(ev);
            }
        }
        Ok(self.ready.len() - before)
    }

    /// Next queued readiness event, if any.
    pub fn next_ready(&mut self) -> Option<ReadyEvent> {
        self.ready.pop_front()
    }

    /// Tokens of all live records, in slot order.
    pub fn tokens(&self) -> Vec<Token> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.is_some())
            .map(|(index, slot)| encode(index, slot.generation))
            .collect()
    }

    /// Remove every record, returning them in slot order.
    pub fn drain(&mut self) -> Vec<T> {
        self.tokens()
            .into_iter()
            .filter_map(|token| self.remove(token))
            .collect()
    }
}

#[inline]
fn check_owner(owner: ThreadId, token: Token) {
    debug_assert_eq!(
        owner,
        thread::current().id(),
        "socket record {token:?} accessed from a thread that does not own it"
    );
}
