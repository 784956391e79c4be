//! Socket records and the application handler interface.
//!
//! A socket is one record with optional layers: the transport is always
//! there, a TLS session is attached when the role asks for one, and the
//! application layer is a boxed [`Handler`]. Readiness flows through them in
//! order (transport, TLS, application); outbound bytes take the reverse path.
//!
//! Notifications for one socket arrive in a fixed order:
//! `on_handshake_complete` (TLS only, exactly once), `on_connect`, then any
//! number of `on_receive` / `on_send` / `on_event` / `on_idle`, and finally
//! `on_close` exactly once.

use crate::error::Result;
use crate::service::ServiceHandle;
use bytes::{Buf, BytesMut};
use layersock_core::event::{Event, SocketId};
use layersock_core::interest::{Interest, Ready};
use layersock_core::queue::EventQueue;
use layersock_core::tcp;
use layersock_core::Handle;
use layersock_tls::{Handshake, TlsIo, TlsSession};
use smallvec::SmallVec;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// What a socket is for. Assigned once when the socket is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Accepts connections and hands them to workers
    Listener,
    /// Outgoing connection opened by [`Client::connect`](crate::Client::connect)
    Connector,
    /// Connection accepted by a listener
    Worker,
}

/// Why a socket was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the connection (EOF or TLS `close_notify`)
    Graceful,
    /// Closed by the application
    Local,
    /// Transport or TLS failure
    Reset,
    /// Outgoing connect did not complete
    ConnectFailed,
    /// Worker stopped with the socket still open
    Shutdown,
}

/// Application layer of a socket.
///
/// All callbacks for one socket run on the worker thread that owns it.
/// Only `on_receive` is required.
pub trait Handler: Send + 'static {
    /// Transport (and TLS, if any) is ready for application data.
    fn on_connect(&mut self, _ctx: &mut SocketContext<'_>) {}

    /// TLS handshake finished. Fires before `on_connect`.
    fn on_handshake_complete(&mut self, _ctx: &mut SocketContext<'_>) {}

    /// Application data arrived.
    fn on_receive(&mut self, ctx: &mut SocketContext<'_>, data: &[u8]);

    /// Everything queued with [`SocketContext::send`] has been written.
    fn on_send(&mut self, _ctx: &mut SocketContext<'_>) {}

    /// A posted event reached this socket.
    fn on_event(&mut self, _ctx: &mut SocketContext<'_>, _event: Event) {}

    /// The worker had nothing to do for a whole idle timeout.
    fn on_idle(&mut self, _ctx: &mut SocketContext<'_>) {}

    /// The socket is gone. Called exactly once.
    fn on_close(&mut self, _id: SocketId, _reason: CloseReason) {}
}

/// Builds the handler for each accepted connection.
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn Handler> + Send + Sync>;

/// What a handler can do from inside a callback.
pub struct SocketContext<'a> {
    id: SocketId,
    role: Role,
    peer_addr: Option<SocketAddr>,
    outbound: &'a mut BytesMut,
    send_pending: &'a mut bool,
    close_requested: &'a mut bool,
    queue: &'a mut EventQueue<Event>,
    service: &'a ServiceHandle,
    tls: Option<&'a TlsSession>,
}

impl SocketContext<'_> {
    /// Address of this socket, usable from any thread.
    pub const fn id(&self) -> SocketId {
        self.id
    }

    /// Role the socket was created with.
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Remote address, once connected.
    pub const fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Queue bytes for sending. They are written when the callback returns,
    /// or once the transport is ready.
    pub fn send(&mut self, data: &[u8]) {
        self.outbound.extend_from_slice(data);
        *self.send_pending = true;
    }

    /// Bytes queued but not yet written.
    pub fn pending(&self) -> usize {
        self.outbound.len()
    }

    /// Close the socket after this callback returns.
    pub fn close(&mut self) {
        *self.close_requested = true;
    }

    /// True when a TLS session carries this socket.
    pub const fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// TLS session of this socket, if any.
    pub const fn tls(&self) -> Option<&TlsSession> {
        self.tls
    }

    /// Service handle, for addressing other sockets.
    pub const fn service(&self) -> &ServiceHandle {
        self.service
    }

    /// Post an event. Events for sockets of this worker are queued
    /// directly; others go through the owning worker's channel.
    ///
    /// # Errors
    ///
    /// Fails if the destination worker does not exist or has stopped.
    pub fn post(&mut self, event: Event) -> Result<()> {
        if event.dst().worker() == self.id.worker() {
            enqueue(self.queue, event);
            Ok(())
        } else {
            self.service.post(event)
        }
    }

    /// Post an event that becomes due after `delay`.
    ///
    /// # Errors
    ///
    /// Same as [`post`](Self::post).
    pub fn post_delayed(&mut self, event: Event, delay: Duration) -> Result<()> {
        self.post(event.delayed(delay))
    }
}

pub(crate) fn enqueue(queue: &mut EventQueue<Event>, event: Event) {
    match event.due() {
        Some(due) => queue.push_at(event, due),
        None => queue.push(event),
    }
}

/// Per-dispatch view of the worker state a socket may touch.
pub(crate) struct Dispatch<'a> {
    pub(crate) queue: &'a mut EventQueue<Event>,
    pub(crate) service: &'a ServiceHandle,
}

/// Result of driving a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Keep,
    Close(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Outgoing connect in progress
    Connecting,
    /// Transport up, layers not started
    Connected,
    Handshaking,
    Open,
}

/// TLS requirements for accepted connections.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AcceptTls {
    pub(crate) require_client_cert: bool,
}

/// How a listener turns accepted streams into worker sockets.
pub(crate) struct AcceptPolicy {
    pub(crate) factory: HandlerFactory,
    pub(crate) tls: Option<AcceptTls>,
}

/// A record in a worker's socket set.
pub(crate) enum Endpoint {
    Listener(Listener),
    Stream(Connection),
}

impl Endpoint {
    pub(crate) fn handle(&self) -> Handle {
        match self {
            Self::Listener(l) => l.listener.as_raw_fd(),
            Self::Stream(c) => c.stream.as_raw_fd(),
        }
    }

    pub(crate) fn interest(&self) -> Interest {
        match self {
            Self::Listener(_) => Interest::READ,
            Self::Stream(c) => c.interest(),
        }
    }
}

pub(crate) struct Listener {
    listener: TcpListener,
    pub(crate) policy: Arc<AcceptPolicy>,
}

impl Listener {
    pub(crate) fn new(listener: TcpListener, policy: Arc<AcceptPolicy>) -> Self {
        Self { listener, policy }
    }

    /// Accept until the backlog is empty.
    pub(crate) fn accept_all(&self) -> SmallVec<[(TcpStream, SocketAddr); 8]> {
        let mut accepted = SmallVec::new();
        loop {
            match self.listener.accept() {
                Ok(pair) => accepted.push(pair),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("[listener] accept failed: {}", e);
                    break;
                }
            }
        }
        accepted
    }
}

/// A connected (or connecting) stream with its layers.
pub(crate) struct Connection {
    stream: TcpStream,
    role: Role,
    phase: Phase,
    tls: Option<TlsSession>,
    outbound: BytesMut,
    /// Bytes were queued since the last `on_send`
    send_pending: bool,
    /// Events that arrived before `on_connect`
    deferred: Vec<Event>,
    handler: Box<dyn Handler>,
    peer_addr: Option<SocketAddr>,
    close_requested: bool,
}

impl Connection {
    /// Stream accepted by a listener; layers start with [`start`](Self::start).
    pub(crate) fn accepted(
        stream: TcpStream,
        peer: SocketAddr,
        tls: Option<TlsSession>,
        handler: Box<dyn Handler>,
    ) -> Self {
        Self::build(stream, Role::Worker, Phase::Connected, Some(peer), tls, handler)
    }

    /// Stream with a non-blocking connect in flight.
    pub(crate) fn connecting(
        stream: TcpStream,
        tls: Option<TlsSession>,
        handler: Box<dyn Handler>,
    ) -> Self {
        Self::build(stream, Role::Connector, Phase::Connecting, None, tls, handler)
    }

    fn build(
        stream: TcpStream,
        role: Role,
        phase: Phase,
        peer_addr: Option<SocketAddr>,
        tls: Option<TlsSession>,
        handler: Box<dyn Handler>,
    ) -> Self {
        Self {
            stream,
            role,
            phase,
            tls,
            outbound: BytesMut::new(),
            send_pending: false,
            deferred: Vec::new(),
            handler,
            peer_addr,
            close_requested: false,
        }
    }

    pub(crate) const fn close_requested(&self) -> bool {
        self.close_requested
    }

    /// Readiness the socket needs next.
    pub(crate) fn interest(&self) -> Interest {
        match self.phase {
            Phase::Connecting => Interest::WRITE,
            Phase::Connected => Interest::READ,
            Phase::Handshaking => match self.tls.as_ref().map(TlsSession::want) {
                Some(want) if !want.is_empty() => want,
                _ => Interest::READ,
            },
            Phase::Open => {
                let tls_pending = self.tls.as_ref().is_some_and(TlsSession::wants_write);
                if self.outbound.is_empty() && !tls_pending {
                    Interest::READ
                } else {
                    Interest::READ | Interest::WRITE
                }
            }
        }
    }

    /// Start the layers of a socket whose transport is connected.
    pub(crate) fn start(&mut self, id: SocketId, d: &mut Dispatch<'_>, buf: &mut [u8]) -> Step {
        if self.tls.is_some() {
            self.phase = Phase::Handshaking;
            self.handshake(id, d, buf)
        } else {
            self.open(id, d, buf)
        }
    }

    /// Handle readiness reported by the backend.
    pub(crate) fn on_ready(
        &mut self,
        id: SocketId,
        ready: Ready,
        d: &mut Dispatch<'_>,
        buf: &mut [u8],
    ) -> Step {
        match self.phase {
            Phase::Connecting => {
                if let Err(e) = tcp::take_connect_error(&self.stream) {
                    if e.kind() == io::ErrorKind::NotConnected && !ready.is_error() {
                        return Step::Keep;
                    }
                    debug!("[{}] connect failed: {}", id, e);
                    return Step::Close(CloseReason::ConnectFailed);
                }
                self.peer_addr = self.stream.peer_addr().ok();
                trace!("[{}] connected to {:?}", id, self.peer_addr);
                self.start(id, d, buf)
            }
            Phase::Connected => self.start(id, d, buf),
            Phase::Handshaking => self.handshake(id, d, buf),
            Phase::Open => {
                if ready.is_error() {
                    if let Ok(Some(e)) = self.stream.take_error() {
                        debug!("[{}] socket error: {}", id, e);
                        return Step::Close(CloseReason::Reset);
                    }
                }
                if ready.is_readable() || ready.is_closed() {
                    if let Step::Close(reason) = self.read_all(id, d, buf) {
                        return Step::Close(reason);
                    }
                }
                self.flush(id, d)
            }
        }
    }

    fn handshake(&mut self, id: SocketId, d: &mut Dispatch<'_>, buf: &mut [u8]) -> Step {
        let Some(tls) = self.tls.as_mut() else {
            return self.open(id, d, buf);
        };
        match tls.handshake(&mut self.stream) {
            Ok(Handshake::Complete) => {
                self.with_context(id, d, |h, ctx| h.on_handshake_complete(ctx));
                self.open(id, d, buf)
            }
            Ok(Handshake::WouldBlock(want)) => {
                trace!("[{}] handshake waiting for {:?}", id, want);
                Step::Keep
            }
            Err(e) => {
                debug!("[{}] TLS handshake failed: {}", id, e);
                Step::Close(CloseReason::Reset)
            }
        }
    }

    fn open(&mut self, id: SocketId, d: &mut Dispatch<'_>, buf: &mut [u8]) -> Step {
        self.phase = Phase::Open;
        self.with_context(id, d, |h, ctx| h.on_connect(ctx));
        for event in std::mem::take(&mut self.deferred) {
            if self.close_requested {
                break;
            }
            self.with_context(id, d, |h, ctx| h.on_event(ctx, event));
        }
        // bytes may already sit in the kernel or the TLS engine, and an
        // edge-triggered backend will not report them again
        if let Step::Close(reason) = self.read_all(id, d, buf) {
            return Step::Close(reason);
        }
        self.flush(id, d)
    }

    fn read_all(&mut self, id: SocketId, d: &mut Dispatch<'_>, buf: &mut [u8]) -> Step {
        while !self.close_requested {
            let n = match self.tls.as_mut() {
                Some(tls) => match tls.receive(&mut self.stream, buf) {
                    Ok(TlsIo::Ready(n)) => n,
                    Ok(TlsIo::WouldBlock(_)) => return Step::Keep,
                    Ok(TlsIo::Closed) => return Step::Close(CloseReason::Graceful),
                    Err(e) => {
                        debug!("[{}] TLS receive failed: {}", id, e);
                        return Step::Close(CloseReason::Reset);
                    }
                },
                None => match self.stream.read(buf) {
                    Ok(0) => return Step::Close(CloseReason::Graceful),
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Step::Keep,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("[{}] receive failed: {}", id, e);
                        return Step::Close(CloseReason::Reset);
                    }
                },
            };
            if n == 0 {
                return Step::Keep;
            }
            let data = &buf[..n];
            self.with_context(id, d, |h, ctx| h.on_receive(ctx, data));
        }
        Step::Keep
    }

    /// Queue bytes posted from another thread and try to write them.
    pub(crate) fn send(&mut self, id: SocketId, data: &[u8], d: &mut Dispatch<'_>) -> Step {
        self.outbound.extend_from_slice(data);
        self.send_pending = true;
        self.flush(id, d)
    }

    /// Write queued output; fires `on_send` once everything queued since
    /// the last one, TLS records included, reached the transport.
    pub(crate) fn flush(&mut self, id: SocketId, d: &mut Dispatch<'_>) -> Step {
        if self.phase != Phase::Open {
            return Step::Keep;
        }
        loop {
            match self.write_outbound(id) {
                Err(reason) => return Step::Close(reason),
                Ok(true) if self.send_pending => {}
                Ok(_) => return Step::Keep,
            }
            self.send_pending = false;
            self.with_context(id, d, |h, ctx| h.on_send(ctx));
            if !self.send_pending || self.close_requested {
                return Step::Keep;
            }
        }
    }

    /// `Ok(true)` once the queue and any TLS records are fully written.
    fn write_outbound(&mut self, id: SocketId) -> std::result::Result<bool, CloseReason> {
        while !self.outbound.is_empty() {
            let written = match self.tls.as_mut() {
                Some(tls) => match tls.send(&mut self.stream, &self.outbound) {
                    Ok(TlsIo::Ready(n)) => n,
                    Ok(TlsIo::WouldBlock(_)) => return Ok(false),
                    Ok(TlsIo::Closed) => return Err(CloseReason::Graceful),
                    Err(e) => {
                        debug!("[{}] TLS send failed: {}", id, e);
                        return Err(CloseReason::Reset);
                    }
                },
                None => match self.stream.write(&self.outbound) {
                    Ok(0) => return Err(CloseReason::Reset),
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("[{}] send failed: {}", id, e);
                        return Err(CloseReason::Reset);
                    }
                },
            };
            self.outbound.advance(written);
        }
        match self.tls.as_mut() {
            Some(tls) if tls.wants_write() => match tls.flush_pending(&mut self.stream) {
                Ok(TlsIo::Ready(_)) => Ok(true),
                Ok(_) => Ok(false),
                Err(e) => {
                    debug!("[{}] TLS flush failed: {}", id, e);
                    Err(CloseReason::Reset)
                }
            },
            _ => Ok(true),
        }
    }

    /// Deliver a posted event, or hold it until the socket is open.
    pub(crate) fn deliver(&mut self, id: SocketId, event: Event, d: &mut Dispatch<'_>) -> Step {
        if self.phase != Phase::Open {
            trace!("[{}] event {} deferred until open", id, event.id());
            self.deferred.push(event);
            return Step::Keep;
        }
        self.with_context(id, d, |h, ctx| h.on_event(ctx, event));
        self.flush(id, d)
    }

    pub(crate) fn idle(&mut self, id: SocketId, d: &mut Dispatch<'_>) -> Step {
        if self.phase != Phase::Open {
            return Step::Keep;
        }
        self.with_context(id, d, |h, ctx| h.on_idle(ctx));
        self.flush(id, d)
    }

    /// Tear the socket down and notify the handler.
    pub(crate) fn finish(mut self, id: SocketId, reason: CloseReason) {
        if self.phase == Phase::Open && reason != CloseReason::Reset {
            // best effort, the socket is going away either way
            let _ = self.write_outbound(id);
            if let Some(tls) = self.tls.as_mut() {
                tls.close(&mut self.stream);
            }
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        if !self.deferred.is_empty() {
            trace!("[{}] discarded {} deferred events", id, self.deferred.len());
        }
        debug!("[{}] closed ({:?})", id, reason);
        self.handler.on_close(id, reason);
    }

    fn with_context<R>(
        &mut self,
        id: SocketId,
        d: &mut Dispatch<'_>,
        f: impl FnOnce(&mut dyn Handler, &mut SocketContext<'_>) -> R,
    ) -> R {
        let mut ctx = SocketContext {
            id,
            role: self.role,
            peer_addr: self.peer_addr,
            outbound: &mut self.outbound,
            send_pending: &mut self.send_pending,
            close_requested: &mut self.close_requested,
            queue: &mut *d.queue,
            service: d.service,
            tls: self.tls.as_ref(),
        };
        f(self.handler.as_mut(), &mut ctx)
    }
}
