//! Non-blocking TLS session
//!
//! One [`TlsSession`] wraps one rustls connection on top of a non-blocking
//! transport. Every call makes as much progress as the transport allows and
//! then either finishes or reports the single direction it is blocked on,
//! so the caller can re-arm readiness for exactly that direction.
//!
//! State only moves forward; a failure at any point jumps to `Closed`:
//!
//! ```text
//! Uninitialized -> Handshaking -> Established -> Closed
//! ```

use crate::context::TlsContext;
use crate::error::{Error, Result};
use layersock_core::interest::Interest;
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, ServerConnection};
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::{debug, trace};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Uninitialized,
    Handshaking,
    Established,
    Closed,
}

/// Which side of the handshake this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Accept,
    Connect,
}

/// Outcome of a handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Complete,
    /// Blocked; never empty
    WouldBlock(Interest),
}

/// Outcome of a send or receive pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsIo {
    /// Bytes accepted for sending, or plaintext bytes received
    Ready(usize),
    /// Blocked; never empty
    WouldBlock(Interest),
    /// Peer closed the session
    Closed,
}

enum Engine {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl Engine {
    fn read_tls(&mut self, rd: &mut impl Read) -> io::Result<usize> {
        match self {
            Self::Server(conn) => conn.read_tls(rd),
            Self::Client(conn) => conn.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut impl Write) -> io::Result<usize> {
        match self {
            Self::Server(conn) => conn.write_tls(wr),
            Self::Client(conn) => conn.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> std::result::Result<rustls::IoState, rustls::Error> {
        match self {
            Self::Server(conn) => conn.process_new_packets(),
            Self::Client(conn) => conn.process_new_packets(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Self::Server(conn) => conn.wants_write(),
            Self::Client(conn) => conn.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            Self::Server(conn) => conn.is_handshaking(),
            Self::Client(conn) => conn.is_handshaking(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            Self::Server(conn) => conn.reader(),
            Self::Client(conn) => conn.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            Self::Server(conn) => conn.writer(),
            Self::Client(conn) => conn.writer(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            Self::Server(conn) => conn.send_close_notify(),
            Self::Client(conn) => conn.send_close_notify(),
        }
    }

    fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        match self {
            Self::Server(conn) => conn.protocol_version(),
            Self::Client(conn) => conn.protocol_version(),
        }
    }

    fn cipher_suite(&self) -> Option<rustls::SupportedCipherSuite> {
        match self {
            Self::Server(conn) => conn.negotiated_cipher_suite(),
            Self::Client(conn) => conn.negotiated_cipher_suite(),
        }
    }

    fn has_peer_certificate(&self) -> bool {
        match self {
            Self::Server(conn) => conn.peer_certificates().is_some_and(|c| !c.is_empty()),
            Self::Client(conn) => conn.peer_certificates().is_some_and(|c| !c.is_empty()),
        }
    }
}

/// TLS state for one socket.
pub struct TlsSession {
    engine: Engine,
    mode: Mode,
    state: SessionState,
    want: Interest,
    context: Arc<TlsContext>,
}

impl TlsSession {
    /// Server side of a handshake for an accepted socket.
    ///
    /// # Errors
    ///
    /// Fails if the context has no server identity or rustls rejects it.
    pub fn accept(context: Arc<TlsContext>, require_client_cert: bool) -> Result<Self> {
        let config = context
            .server_config(require_client_cert)
            .ok_or(Error::NoServerIdentity)?;
        let conn = ServerConnection::new(config)?;
        Ok(Self::with_engine(Engine::Server(conn), Mode::Accept, context))
    }

    /// Client side of a handshake towards `server_name` (DNS name or IP).
    ///
    /// # Errors
    ///
    /// Fails if `server_name` is not a valid name or rustls rejects it.
    pub fn connect(context: Arc<TlsContext>, server_name: &str) -> Result<Self> {
        let name = ServerName::try_from(server_name)
            .map_err(|_| Error::InvalidServerName(server_name.to_string()))?
            .to_owned();
        let conn = ClientConnection::new(context.client_config(), name)?;
        Ok(Self::with_engine(Engine::Client(conn), Mode::Connect, context))
    }

    fn with_engine(engine: Engine, mode: Mode, context: Arc<TlsContext>) -> Self {
        Self {
            engine,
            mode,
            state: SessionState::Uninitialized,
            want: Interest::NONE,
            context,
        }
    }

    pub const fn state(&self) -> SessionState {
        self.state
    }

    pub const fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Direction the last blocked call was waiting for.
    pub const fn want(&self) -> Interest {
        self.want
    }

    /// Encrypted bytes are waiting to be flushed to the transport.
    pub fn wants_write(&self) -> bool {
        self.engine.wants_write()
    }

    pub fn context(&self) -> &Arc<TlsContext> {
        &self.context
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.engine.protocol_version().map(|v| format!("{v:?}"))
    }

    pub fn cipher_suite(&self) -> Option<String> {
        self.engine.cipher_suite().map(|s| format!("{:?}", s.suite()))
    }

    pub fn has_peer_certificate(&self) -> bool {
        self.engine.has_peer_certificate()
    }

    /// Drive the handshake as far as the transport allows.
    ///
    /// Returns `Complete` once; calling again after that is a no-op that
    /// returns `Complete` as well.
    ///
    /// # Errors
    ///
    /// Any failure closes the session.
    pub fn handshake<S: Read + Write>(&mut self, io: &mut S) -> Result<Handshake> {
        match self.state {
            SessionState::Established => return Ok(Handshake::Complete),
            SessionState::Closed => return Err(Error::Closed),
            SessionState::Uninitialized => {
                trace!("[TLS] {:?} handshake started", self.mode);
                self.state = SessionState::Handshaking;
            }
            SessionState::Handshaking => {}
        }

        loop {
            match self.flush(io) {
                Ok(true) => {}
                Ok(false) => return Ok(self.block_handshake(Interest::WRITE)),
                Err(e) => return Err(self.fail(e)),
            }

            if !self.engine.is_handshaking() {
                self.state = SessionState::Established;
                self.want = Interest::NONE;
                debug!(
                    "[TLS] {:?} handshake complete: {} {}",
                    self.mode,
                    self.protocol_version().unwrap_or_default(),
                    self.cipher_suite().unwrap_or_default()
                );
                return Ok(Handshake::Complete);
            }

            match self.engine.read_tls(io) {
                Ok(0) => return Err(self.fail(Error::Reset)),
                Ok(_) => {
                    if let Err(e) = self.engine.process_new_packets() {
                        // best effort: let the peer see the alert
                        let _ = self.engine.write_tls(io);
                        return Err(self.fail(Error::Connection(e)));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(self.block_handshake(Interest::READ));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.fail(Error::Io(e))),
            }
        }
    }

    /// Encrypt as much of `buf` as the session buffer takes and push it
    /// towards the transport.
    ///
    /// `Ready(n)` may leave ciphertext queued; check [`wants_write`] and
    /// keep write interest armed until it clears.
    ///
    /// [`wants_write`]: TlsSession::wants_write
    ///
    /// # Errors
    ///
    /// `NotEstablished` before the handshake finished; other errors close
    /// the session.
    pub fn send<S: Read + Write>(&mut self, io: &mut S, buf: &[u8]) -> Result<TlsIo> {
        self.check_established()?;
        self.flush_or_fail(io)?;

        let accepted = match self.engine.writer().write(buf) {
            Ok(n) => n,
            Err(e) => return Err(self.fail(Error::Io(e))),
        };
        let drained = self.flush_or_fail(io)?;

        if accepted == 0 && !buf.is_empty() {
            self.want = Interest::WRITE;
            return Ok(TlsIo::WouldBlock(Interest::WRITE));
        }
        if !drained {
            self.want = Interest::WRITE;
        }
        Ok(TlsIo::Ready(accepted))
    }

    /// Flush queued ciphertext without adding plaintext.
    ///
    /// # Errors
    ///
    /// Transport failures close the session.
    pub fn flush_pending<S: Write>(&mut self, io: &mut S) -> Result<TlsIo> {
        if self.state == SessionState::Closed {
            return Err(Error::Closed);
        }
        if self.flush_or_fail(io)? {
            self.want = Interest::NONE;
            Ok(TlsIo::Ready(0))
        } else {
            self.want = Interest::WRITE;
            Ok(TlsIo::WouldBlock(Interest::WRITE))
        }
    }

    /// Decrypt the next chunk of application data into `buf`.
    ///
    /// A transport EOF without a `close_notify` alert is reported as
    /// `Closed`, the same as an orderly shutdown.
    ///
    /// # Errors
    ///
    /// `NotEstablished` before the handshake finished; protocol and
    /// transport failures close the session.
    pub fn receive<S: Read + Write>(&mut self, io: &mut S, buf: &mut [u8]) -> Result<TlsIo> {
        self.check_established()?;
        let mut eof = false;

        loop {
            match self.engine.reader().read(buf) {
                Ok(0) if buf.is_empty() => return Ok(TlsIo::Ready(0)),
                Ok(0) => return Ok(self.peer_closed("close_notify")),
                Ok(n) => return Ok(TlsIo::Ready(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if eof {
                        return Ok(self.peer_closed("eof"));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(self.peer_closed("eof without close_notify"));
                }
                Err(e) => return Err(self.fail(Error::Io(e))),
            }

            match self.engine.read_tls(io) {
                Ok(0) => eof = true,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.want = Interest::READ;
                    return Ok(TlsIo::WouldBlock(Interest::READ));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.fail(Error::Io(e))),
            }

            if let Err(e) = self.engine.process_new_packets() {
                let _ = self.engine.write_tls(io);
                return Err(self.fail(Error::Connection(e)));
            }
            // key updates and similar need an answer
            if self.engine.wants_write() && !self.flush_or_fail(io)? {
                self.want = Interest::WRITE;
            }
        }
    }

    /// Queue a `close_notify` alert, flush what the transport takes and
    /// close the session.
    pub fn close<S: Write>(&mut self, io: &mut S) {
        if self.state == SessionState::Closed {
            return;
        }
        if self.state == SessionState::Established {
            self.engine.send_close_notify();
            let _ = self.flush(io);
        }
        self.state = SessionState::Closed;
        self.want = Interest::NONE;
        trace!("[TLS] {:?} session closed", self.mode);
    }

    fn check_established(&self) -> Result<()> {
        match self.state {
            SessionState::Established => Ok(()),
            SessionState::Closed => Err(Error::Closed),
            _ => Err(Error::NotEstablished),
        }
    }

    /// Write queued ciphertext. `Ok(true)` once nothing is left,
    /// `Ok(false)` when the transport would block.
    fn flush<S: Write>(&mut self, io: &mut S) -> Result<bool> {
        while self.engine.wants_write() {
            match self.engine.write_tls(io) {
                Ok(0) => return Err(Error::Reset),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(true)
    }

    fn flush_or_fail<S: Write>(&mut self, io: &mut S) -> Result<bool> {
        self.flush(io).map_err(|e| self.fail(e))
    }

    fn block_handshake(&mut self, direction: Interest) -> Handshake {
        self.want = direction;
        trace!("[TLS] {:?} handshake blocked on {:?}", self.mode, direction);
        Handshake::WouldBlock(direction)
    }

    fn peer_closed(&mut self, how: &str) -> TlsIo {
        debug!("[TLS] {:?} peer closed ({})", self.mode, how);
        self.state = SessionState::Closed;
        self.want = Interest::NONE;
        TlsIo::Closed
    }

    fn fail(&mut self, err: Error) -> Error {
        debug!("[TLS] {:?} session failed: {}", self.mode, err);
        self.state = SessionState::Closed;
        self.want = Interest::NONE;
        err
    }
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("want", &self.want)
            .field("context", &self.context.id())
            .finish()
    }
}
