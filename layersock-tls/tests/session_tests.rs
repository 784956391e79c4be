//! TLS session tests over loopback TCP with non-blocking streams.

use layersock_core::interest::Interest;
use layersock_tls::{
    ClientTlsConfig, Error, Handshake, SessionState, TlsContext, TlsContextConfig, TlsIo,
    TlsManager, TlsSession,
};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const MAX_STEPS: usize = 2000;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn server_context() -> Arc<TlsContext> {
    let config = TlsContextConfig::new(fixture("server.pem"), fixture("server.key"))
        .with_ca_file(fixture("ca.pem"));
    Arc::new(TlsContext::server(&config).unwrap())
}

fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    client.set_nonblocking(true).unwrap();
    server.set_nonblocking(true).unwrap();
    client.set_nodelay(true).unwrap();
    server.set_nodelay(true).unwrap();
    (client, server)
}

struct Pair {
    client: TlsSession,
    client_io: TcpStream,
    server: TlsSession,
    server_io: TcpStream,
}

impl Pair {
    fn new(client: TlsSession, server: TlsSession) -> Self {
        let (client_io, server_io) = tcp_pair();
        Self {
            client,
            client_io,
            server,
            server_io,
        }
    }

    /// Step both sides until each completes or one fails.
    fn handshake(&mut self) -> (Result<(), Error>, Result<(), Error>) {
        let mut client_done: Option<Result<(), Error>> = None;
        let mut server_done: Option<Result<(), Error>> = None;
        for _ in 0..MAX_STEPS {
            if client_done.is_none() {
                match self.client.handshake(&mut self.client_io) {
                    Ok(Handshake::Complete) => client_done = Some(Ok(())),
                    Ok(Handshake::WouldBlock(dir)) => assert!(!dir.is_empty()),
                    Err(e) => client_done = Some(Err(e)),
                }
            }
            if server_done.is_none() {
                match self.server.handshake(&mut self.server_io) {
                    Ok(Handshake::Complete) => server_done = Some(Ok(())),
                    Ok(Handshake::WouldBlock(dir)) => assert!(!dir.is_empty()),
                    Err(e) => server_done = Some(Err(e)),
                }
            }
            let failed = matches!(client_done, Some(Err(_))) || matches!(server_done, Some(Err(_)));
            if (client_done.is_some() && server_done.is_some()) || failed {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        (
            client_done.unwrap_or(Ok(())),
            server_done.unwrap_or(Ok(())),
        )
    }

    fn established(mut self) -> Self {
        let (c, s) = self.handshake();
        c.unwrap();
        s.unwrap();
        assert!(self.client.is_established());
        assert!(self.server.is_established());
        self
    }
}

fn receive_exact(session: &mut TlsSession, io: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    for _ in 0..MAX_STEPS {
        match session.receive(io, &mut buf).unwrap() {
            TlsIo::Ready(n) => out.extend_from_slice(&buf[..n]),
            TlsIo::WouldBlock(dir) => {
                assert!(!dir.is_empty());
                thread::sleep(Duration::from_millis(1));
            }
            TlsIo::Closed => panic!("unexpected close"),
        }
        if out.len() >= len {
            return out;
        }
    }
    panic!("received {} of {} bytes", out.len(), len);
}

fn connect_default(ctx: &Arc<TlsContext>, name: &str) -> TlsSession {
    TlsSession::connect(ctx.clone(), name).unwrap()
}

#[test]
fn test_handshake_and_ping_pong() {
    let ctx = server_context();
    let mut pair = Pair::new(
        connect_default(&ctx, "localhost"),
        TlsSession::accept(ctx.clone(), false).unwrap(),
    )
    .established();

    assert_eq!(
        pair.client.send(&mut pair.client_io, b"ping").unwrap(),
        TlsIo::Ready(4)
    );
    let got = receive_exact(&mut pair.server, &mut pair.server_io, 4);
    assert_eq!(got, b"ping");

    assert_eq!(
        pair.server.send(&mut pair.server_io, b"pong").unwrap(),
        TlsIo::Ready(4)
    );
    let got = receive_exact(&mut pair.client, &mut pair.client_io, 4);
    assert_eq!(got, b"pong");

    assert!(pair.client.protocol_version().is_some());
    assert!(pair.server.cipher_suite().is_some());
}

#[test]
fn test_handshake_states_only_move_forward() {
    let ctx = server_context();
    let mut client = connect_default(&ctx, "127.0.0.1");
    let mut server = TlsSession::accept(ctx, false).unwrap();
    let (mut client_io, mut server_io) = tcp_pair();

    assert_eq!(client.state(), SessionState::Uninitialized);
    let mut seen = vec![client.state()];
    for _ in 0..MAX_STEPS {
        let c = client.handshake(&mut client_io).unwrap();
        seen.push(client.state());
        if let Handshake::WouldBlock(dir) = c {
            assert_eq!(dir, client.want());
        }
        let s = server.handshake(&mut server_io).unwrap();
        if c == Handshake::Complete && s == Handshake::Complete {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
    assert_eq!(seen.last(), Some(&SessionState::Established));

    // stepping an established session is a no-op
    assert_eq!(client.handshake(&mut client_io).unwrap(), Handshake::Complete);
    client.close(&mut client_io);
    assert_eq!(client.state(), SessionState::Closed);
    assert!(matches!(client.handshake(&mut client_io), Err(Error::Closed)));
}

#[test]
fn test_application_data_requires_handshake() {
    let ctx = server_context();
    let mut client = connect_default(&ctx, "localhost");
    let (mut io, _peer) = tcp_pair();
    assert!(matches!(
        client.send(&mut io, b"early"),
        Err(Error::NotEstablished)
    ));
    let mut buf = [0u8; 8];
    assert!(matches!(
        client.receive(&mut io, &mut buf),
        Err(Error::NotEstablished)
    ));
}

#[test]
fn test_receive_would_block_reports_read() {
    let ctx = server_context();
    let mut pair = Pair::new(
        connect_default(&ctx, "localhost"),
        TlsSession::accept(ctx.clone(), false).unwrap(),
    )
    .established();
    // drain session tickets and anything else pending
    let mut buf = [0u8; 64];
    let mut last = None;
    for _ in 0..10 {
        last = Some(pair.client.receive(&mut pair.client_io, &mut buf).unwrap());
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(last, Some(TlsIo::WouldBlock(Interest::READ)));
    assert_eq!(pair.client.want(), Interest::READ);
}

#[test]
fn test_large_transfer_with_partial_writes() {
    let ctx = server_context();
    let mut pair = Pair::new(
        connect_default(&ctx, "localhost"),
        TlsSession::accept(ctx.clone(), false).unwrap(),
    )
    .established();

    let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let mut sent = 0;
    let mut received = Vec::with_capacity(payload.len());
    let mut buf = vec![0u8; 64 * 1024];

    for _ in 0..200_000 {
        if sent < payload.len() {
            match pair.client.send(&mut pair.client_io, &payload[sent..]).unwrap() {
                TlsIo::Ready(n) => sent += n,
                TlsIo::WouldBlock(dir) => {
                    assert_eq!(dir, Interest::WRITE);
                }
                TlsIo::Closed => panic!("send reported close"),
            }
        } else if pair.client.wants_write() {
            pair.client.flush_pending(&mut pair.client_io).unwrap();
        }
        match pair.server.receive(&mut pair.server_io, &mut buf).unwrap() {
            TlsIo::Ready(n) => received.extend_from_slice(&buf[..n]),
            TlsIo::WouldBlock(_) => {}
            TlsIo::Closed => panic!("receive reported close"),
        }
        if received.len() == payload.len() {
            break;
        }
    }
    assert_eq!(received.len(), payload.len());
    assert!(received == payload);
}

#[test]
fn test_close_notify_is_graceful() {
    let ctx = server_context();
    let mut pair = Pair::new(
        connect_default(&ctx, "localhost"),
        TlsSession::accept(ctx.clone(), false).unwrap(),
    )
    .established();

    pair.server.close(&mut pair.server_io);
    let mut buf = [0u8; 16];
    let mut outcome = TlsIo::WouldBlock(Interest::READ);
    for _ in 0..MAX_STEPS {
        outcome = pair.client.receive(&mut pair.client_io, &mut buf).unwrap();
        if outcome == TlsIo::Closed {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(outcome, TlsIo::Closed);
    assert_eq!(pair.client.state(), SessionState::Closed);
}

#[test]
fn test_transport_eof_is_graceful() {
    let ctx = server_context();
    let pair = Pair::new(
        connect_default(&ctx, "localhost"),
        TlsSession::accept(ctx.clone(), false).unwrap(),
    )
    .established();
    let Pair {
        mut client,
        mut client_io,
        server_io,
        ..
    } = pair;
    drop(server_io);

    let mut buf = [0u8; 16];
    let mut outcome = TlsIo::WouldBlock(Interest::READ);
    for _ in 0..MAX_STEPS {
        match client.receive(&mut client_io, &mut buf) {
            Ok(TlsIo::Ready(_)) => {}
            Ok(other) => outcome = other,
            // a reset from the kernel is also acceptable here
            Err(Error::Io(_)) => return,
            Err(e) => panic!("unexpected error: {e}"),
        }
        if outcome == TlsIo::Closed {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(outcome, TlsIo::Closed);
}

#[test]
fn test_peer_close_during_handshake_resets() {
    let ctx = server_context();
    let mut server = TlsSession::accept(ctx, false).unwrap();
    let (client_io, mut server_io) = tcp_pair();
    drop(client_io);

    let mut result = Ok(Handshake::WouldBlock(Interest::READ));
    for _ in 0..MAX_STEPS {
        result = server.handshake(&mut server_io);
        if result.is_err() {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    let err = result.unwrap_err();
    assert!(err.is_connection_error(), "{err}");
    assert_eq!(server.state(), SessionState::Closed);
}

#[test]
fn test_wrong_server_name_rejected() {
    let ctx = server_context();
    let mut pair = Pair::new(
        connect_default(&ctx, "example.com"),
        TlsSession::accept(ctx.clone(), false).unwrap(),
    );
    let (client, _server) = pair.handshake();
    assert!(matches!(client, Err(Error::Connection(_))));
    assert_eq!(pair.client.state(), SessionState::Closed);
}

#[test]
fn test_invalid_server_name() {
    let ctx = server_context();
    assert!(matches!(
        TlsSession::connect(ctx, "not a host name"),
        Err(Error::InvalidServerName(_))
    ));
}

#[test]
fn test_required_client_certificate() {
    let server_ctx = server_context();
    let anonymous = Arc::new(TlsContext::client(&ClientTlsConfig::new(fixture("ca.pem"))).unwrap());

    // without a certificate the server refuses
    let mut pair = Pair::new(
        TlsSession::connect(anonymous.clone(), "localhost").unwrap(),
        TlsSession::accept(server_ctx.clone(), true).unwrap(),
    );
    let (_, server) = pair.handshake();
    assert!(server.is_err());
    assert_eq!(pair.server.state(), SessionState::Closed);

    // optional verification lets it through
    let pair = Pair::new(
        TlsSession::connect(anonymous, "localhost").unwrap(),
        TlsSession::accept(server_ctx.clone(), false).unwrap(),
    )
    .established();
    assert!(!pair.server.has_peer_certificate());

    // a private context with a client certificate satisfies it
    let with_cert = Arc::new(
        TlsContext::client(
            &ClientTlsConfig::new(fixture("ca.pem"))
                .with_client_cert(fixture("client.pem"), fixture("client.key")),
        )
        .unwrap(),
    );
    let pair = Pair::new(
        TlsSession::connect(with_cert, "localhost").unwrap(),
        TlsSession::accept(server_ctx, true).unwrap(),
    )
    .established();
    assert!(pair.server.has_peer_certificate());
}

#[test]
fn test_client_only_context_cannot_accept() {
    let ctx = Arc::new(TlsContext::client(&ClientTlsConfig::new(fixture("ca.pem"))).unwrap());
    assert!(matches!(
        TlsSession::accept(ctx, false),
        Err(Error::NoServerIdentity)
    ));
}

#[test]
fn test_sessions_keep_their_context_across_swap() {
    let manager = TlsManager::new();
    let config = TlsContextConfig::new(fixture("server.pem"), fixture("server.key"))
        .with_ca_file(fixture("ca.pem"));
    let old = manager.configure(&config).unwrap();

    let client = TlsSession::connect(manager.current().unwrap(), "localhost").unwrap();
    let server = TlsSession::accept(manager.current().unwrap(), false).unwrap();

    let new = manager.configure(&config).unwrap();
    assert_ne!(old.id(), new.id());

    let pair = Pair::new(client, server).established();
    assert_eq!(pair.client.context().id(), old.id());
    assert_eq!(pair.server.context().id(), old.id());
}

#[test]
fn test_handshake_after_failed_reconfigure() {
    let manager = TlsManager::new();
    let config = TlsContextConfig::new(fixture("server.pem"), fixture("server.key"))
        .with_ca_file(fixture("ca.pem"));
    manager.configure(&config).unwrap();
    assert!(manager
        .configure(&config.clone().with_ciphers("NULL-MD5"))
        .is_err());

    let ctx = manager.current().unwrap();
    let mut pair = Pair::new(
        TlsSession::connect(ctx.clone(), "localhost").unwrap(),
        TlsSession::accept(ctx, false).unwrap(),
    )
    .established();
    pair.client.send(&mut pair.client_io, b"still works").unwrap();
    assert_eq!(
        receive_exact(&mut pair.server, &mut pair.server_io, 11),
        b"still works"
    );
}
