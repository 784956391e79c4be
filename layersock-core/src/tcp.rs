//! TCP utilities for non-blocking sockets.
//!
//! Socket creation goes through `socket2` so listeners get `SO_REUSEADDR`
//! and an explicit backlog, and connects can be started without blocking.

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Resolve `host:port` to the first matching address.
///
/// # Errors
///
/// Returns an error if resolution fails or yields nothing.
pub fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address for {host}:{port}"),
        )
    })
}

/// Bind a non-blocking listener with `SO_REUSEADDR` and the given backlog.
///
/// # Errors
///
/// Returns an error if the socket cannot be created, bound or put in
/// listening mode.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

/// Start a non-blocking connect. The returned stream becomes writable once
/// the connect finishes; check [`take_connect_error`] at that point.
///
/// # Errors
///
/// Returns an error if the connect fails immediately.
pub fn connect_nonblocking(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(socket.into())
}

/// Outcome of a connect that the backend reported writable or errored.
///
/// # Errors
///
/// Returns the pending socket error if the connect failed.
pub fn take_connect_error(stream: &TcpStream) -> io::Result<()> {
    match stream.take_error()? {
        Some(err) => Err(err),
        None => {
            // writable without an error can still mean "not connected" on
            // some platforms; peer_addr settles it
            stream.peer_addr().map(|_| ())
        }
    }
}

/// Apply stream options to an accepted or connected socket.
///
/// # Errors
///
/// Returns an error if a socket option cannot be set.
pub fn configure_stream(
    stream: &TcpStream,
    nodelay: bool,
    keepalive: Option<Duration>,
) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    let sock = SockRef::from(stream);
    sock.set_nodelay(nodelay)?;
    if let Some(idle) = keepalive {
        sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
    }
    Ok(())
}
