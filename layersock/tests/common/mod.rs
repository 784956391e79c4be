//! Shared helpers for the facade tests: fixtures, a recording handler and
//! small option presets.

#![allow(dead_code)]

use layersock::prelude::*;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../layersock-tls/tests/fixtures")
        .join(name)
}

pub fn server_tls_config() -> TlsContextConfig {
    TlsContextConfig::new(fixture("server.pem"), fixture("server.key"))
        .with_ca_file(fixture("ca.pem"))
}

pub fn options(workers: usize, name: &str) -> ServiceOptions {
    ServiceOptions::default()
        .with_workers(workers)
        .with_idle_timeout(Duration::from_millis(20))
        .with_thread_name(name)
}

/// What a handler saw, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Note {
    Handshake(SocketId),
    Connect {
        id: SocketId,
        role: Role,
        thread: Option<String>,
        peer_cert: bool,
    },
    Receive {
        id: SocketId,
        data: Vec<u8>,
        thread: Option<String>,
    },
    Sent(SocketId),
    Event {
        id: SocketId,
        event: u32,
        payload: Bytes,
        at: Instant,
    },
    Idle(SocketId),
    Close(SocketId, CloseReason),
}

/// Forwards every notification to a test thread. Optionally echoes what it
/// receives and greets on connect.
pub struct Recorder {
    pub notes: flume::Sender<Note>,
    pub echo: bool,
    pub greeting: Option<Vec<u8>>,
    pub on_connect_posts: Vec<(u32, Option<Duration>)>,
    pub report_idle: bool,
}

impl Recorder {
    pub fn new(notes: flume::Sender<Note>) -> Self {
        Self {
            notes,
            echo: false,
            greeting: None,
            on_connect_posts: Vec::new(),
            report_idle: false,
        }
    }

    pub fn echo(mut self) -> Self {
        self.echo = true;
        self
    }

    pub fn greeting(mut self, data: &[u8]) -> Self {
        self.greeting = Some(data.to_vec());
        self
    }

    fn note(&self, note: Note) {
        let _ = self.notes.send(note);
    }
}

fn thread_name() -> Option<String> {
    thread::current().name().map(str::to_owned)
}

impl Handler for Recorder {
    fn on_handshake_complete(&mut self, ctx: &mut SocketContext<'_>) {
        assert!(ctx.is_secure());
        self.note(Note::Handshake(ctx.id()));
    }

    fn on_connect(&mut self, ctx: &mut SocketContext<'_>) {
        let peer_cert = ctx.tls().is_some_and(|tls| tls.has_peer_certificate());
        self.note(Note::Connect {
            id: ctx.id(),
            role: ctx.role(),
            thread: thread_name(),
            peer_cert,
        });
        if let Some(greeting) = &self.greeting {
            ctx.send(greeting);
        }
        for (event, delay) in self.on_connect_posts.clone() {
            let ev = Event::new(ctx.id(), event, Bytes::new());
            match delay {
                Some(delay) => ctx.post_delayed(ev, delay).unwrap(),
                None => ctx.post(ev).unwrap(),
            }
        }
    }

    fn on_receive(&mut self, ctx: &mut SocketContext<'_>, data: &[u8]) {
        self.note(Note::Receive {
            id: ctx.id(),
            data: data.to_vec(),
            thread: thread_name(),
        });
        if self.echo {
            ctx.send(data);
        }
    }

    fn on_send(&mut self, ctx: &mut SocketContext<'_>) {
        self.note(Note::Sent(ctx.id()));
    }

    fn on_event(&mut self, ctx: &mut SocketContext<'_>, event: Event) {
        self.note(Note::Event {
            id: ctx.id(),
            event: event.id(),
            payload: event.payload().clone(),
            at: Instant::now(),
        });
    }

    fn on_idle(&mut self, ctx: &mut SocketContext<'_>) {
        if self.report_idle {
            self.note(Note::Idle(ctx.id()));
        }
    }

    fn on_close(&mut self, id: SocketId, reason: CloseReason) {
        self.note(Note::Close(id, reason));
    }
}

/// Wait for the first note matching `pred`, skipping the rest.
pub fn wait_for(rx: &flume::Receiver<Note>, pred: impl Fn(&Note) -> bool) -> Note {
    let deadline = Instant::now() + WAIT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left) {
            Ok(note) if pred(&note) => return note,
            Ok(_) => {}
            Err(e) => panic!("no matching note: {e:?}"),
        }
    }
}

/// Collect received bytes until `len` have arrived.
pub fn receive_bytes(rx: &flume::Receiver<Note>, len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while out.len() < len {
        if let Note::Receive { data, .. } = wait_for(rx, |n| matches!(n, Note::Receive { .. })) {
            out.extend_from_slice(&data);
        }
    }
    out
}
