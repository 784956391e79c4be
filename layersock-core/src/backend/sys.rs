//! Thin `poll(2)` wrapper shared by the poll and completion backends.
//!
//! # Safety
//!
//! The only unsafe call hands a live, exclusively borrowed `pollfd` slice to
//! the kernel for the duration of the syscall.

#![allow(unsafe_code)]

use crate::interest::{Interest, Ready};
use crate::Handle;
use std::io;
use std::time::Duration;

pub(crate) fn pollfd(handle: Handle, interest: Interest) -> libc::pollfd {
    libc::pollfd {
        fd: handle,
        events: events_for(interest),
        revents: 0,
    }
}

pub(crate) fn events_for(interest: Interest) -> libc::c_short {
    let mut events = 0;
    if interest.is_readable() {
        events |= libc::POLLIN;
    }
    if interest.is_writable() {
        events |= libc::POLLOUT;
    }
    events
}

pub(crate) fn ready_from(revents: libc::c_short) -> Ready {
    let mut ready = Ready::EMPTY;
    if revents & libc::POLLIN != 0 {
        ready |= Ready::READ;
    }
    if revents & libc::POLLOUT != 0 {
        ready |= Ready::WRITE;
    }
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        ready |= Ready::ERROR;
    }
    if revents & libc::POLLHUP != 0 {
        // hangup is surfaced as readable too so the owner observes EOF
        ready |= Ready::CLOSE | Ready::READ;
    }
    ready
}

/// Wait on `fds`. Returns the number of entries with non-zero `revents`;
/// an interrupted wait reports zero.
pub(crate) fn poll(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<usize> {
    let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms(timeout)) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(n as usize)
}

// Rounds up so a sub-millisecond deadline does not turn into a busy spin.
fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d.as_nanos().div_ceil(1_000_000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}
