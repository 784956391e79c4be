//! Cross-thread wakeup for a blocked `wait`.
//!
//! A non-blocking unix socket pair: any thread writes a byte to the
//! [`Waker`], the worker registers the [`WakeReceiver`] handle with its
//! backend like any other socket and drains it when it fires. Works the same
//! for every backend kind.

use crate::Handle;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

/// Sending half, cheap to clone and share.
#[derive(Clone, Debug)]
pub struct Waker {
    tx: Arc<UnixStream>,
}

/// Receiving half, owned by the worker.
#[derive(Debug)]
pub struct WakeReceiver {
    rx: UnixStream,
}

/// Create a connected waker pair.
///
/// # Errors
///
/// Fails if the socket pair cannot be created or made non-blocking.
pub fn pair() -> io::Result<(Waker, WakeReceiver)> {
    let (tx, rx) = UnixStream::pair()?;
    tx.set_nonblocking(true)?;
    rx.set_nonblocking(true)?;
    Ok((Waker { tx: Arc::new(tx) }, WakeReceiver { rx }))
}

impl Waker {
    /// Interrupt the paired receiver's `wait`. Never blocks: a full buffer
    /// already guarantees a pending wakeup.
    pub fn wake(&self) -> io::Result<()> {
        match (&*self.tx).write(&[1]) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl WakeReceiver {
    pub fn handle(&self) -> Handle {
        self.rx.as_raw_fd()
    }

    /// Consume all pending wakeups. Returns how many bytes were drained.
    pub fn drain(&mut self) -> usize {
        let mut buf = [0u8; 64];
        let mut total = 0;
        loop {
            match self.rx.read(&mut buf) {
                Ok(0) => return total,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return total,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_then_drain() {
        let (waker, mut rx) = pair().unwrap();
        waker.wake().unwrap();
        waker.clone().wake().unwrap();
        assert_eq!(rx.drain(), 2);
        assert_eq!(rx.drain(), 0);
    }
}
