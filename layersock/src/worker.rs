//! Worker threads
//!
//! Each worker owns one socket set (and through it one readiness backend),
//! one delayed event queue and one command channel. Nothing a worker owns is
//! touched by another thread: other threads talk to it through
//! commands and wake it through its waker.
//!
//! One turn of the loop:
//! 1. wait for readiness, at most until the next event is due or the idle
//!    timeout passes
//! 2. dispatch readiness to sockets
//! 3. drain commands
//! 4. deliver due events
//! 5. if nothing happened at all, give every socket an idle callback

use crate::error::{Error, Result};
use crate::service::{ServiceHandle, Shared};
use crate::socket::{
    enqueue, AcceptPolicy, CloseReason, Connection, Dispatch, Endpoint, Handler, Listener, Step,
};
use bytes::Bytes;
use layersock_core::backend::Token;
use layersock_core::event::{Event, SocketId};
use layersock_core::interest::{Interest, Ready};
use layersock_core::queue::EventQueue;
use layersock_core::socket_set::{SocketSet, RESERVED_TOKEN};
use layersock_core::tcp;
use layersock_core::waker::WakeReceiver;
use layersock_tls::TlsSession;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Reply channel for commands that create a socket.
pub(crate) type Reply = flume::Sender<Result<SocketId>>;

/// Requests other threads send to a worker.
pub(crate) enum Command {
    /// Take over a stream accepted by a listener
    Accept {
        stream: TcpStream,
        peer: SocketAddr,
        policy: Arc<AcceptPolicy>,
    },
    /// Take over a stream with a connect in flight
    Connect {
        stream: TcpStream,
        tls: Option<TlsSession>,
        handler: Box<dyn Handler>,
        reply: Reply,
    },
    /// Register a listening socket
    Listen {
        listener: TcpListener,
        policy: Arc<AcceptPolicy>,
        reply: Reply,
    },
    Post(Event),
    Send(Token, Bytes),
    Close(Token),
    Stop,
}

pub(crate) struct Worker {
    index: usize,
    set: SocketSet<Endpoint>,
    queue: EventQueue<Event>,
    commands: flume::Receiver<Command>,
    wake: WakeReceiver,
    service: ServiceHandle,
    read_buf: Vec<u8>,
}

impl Worker {
    /// Build the worker's private state. Runs on the worker thread.
    pub(crate) fn new(
        index: usize,
        shared: Arc<Shared>,
        commands: flume::Receiver<Command>,
        wake: WakeReceiver,
    ) -> Result<Self> {
        let options = shared.options();
        let mut set = SocketSet::new(options.backend, options.capacity)?;
        set.register_reserved(wake.handle(), Interest::READ)?;
        let read_buf = vec![0u8; options.read_buffer_size];
        Ok(Self {
            index,
            set,
            queue: EventQueue::new(),
            commands,
            wake,
            service: ServiceHandle::new(shared),
            read_buf,
        })
    }

    /// Run until stopped or the backend fails, then close every socket.
    pub(crate) fn run(mut self) {
        info!(
            "[W{}] started ({} backend, capacity {})",
            self.index,
            self.set.kind(),
            self.set.capacity()
        );
        let idle_timeout = self.service.shared().options().idle_timeout;

        'run: loop {
            let timeout = wait_timeout(self.queue.time_until_next(Instant::now()), idle_timeout);
            if let Err(e) = self.set.wait(Some(timeout)) {
                error!("[W{}] readiness backend failed: {}", self.index, e);
                break;
            }

            let mut active = false;
            while let Some(ev) = self.set.next_ready() {
                active = true;
                if ev.token == RESERVED_TOKEN {
                    self.wake.drain();
                    if let Err(e) = self.set.rearm_reserved(Interest::READ) {
                        error!("[W{}] failed to re-arm waker: {}", self.index, e);
                        break 'run;
                    }
                    continue;
                }
                self.dispatch(ev.token, ev.ready);
            }

            match self.drain_commands() {
                Drained::Stop => break,
                Drained::Some => active = true,
                Drained::None => {}
            }

            if self.run_due_events() {
                active = true;
            }

            if !active {
                self.idle();
            }
        }

        self.shutdown();
    }

    fn id(&self, token: Token) -> SocketId {
        SocketId::new(self.index, token)
    }

    fn dispatch(&mut self, token: Token, ready: Ready) {
        let id = self.id(token);
        let Some(endpoint) = self.set.get_mut(token) else {
            return;
        };
        trace!("[{}] ready {:?}", id, ready);
        let step = match endpoint {
            Endpoint::Listener(listener) => {
                let accepted = listener.accept_all();
                let policy = listener.policy.clone();
                for (stream, peer) in accepted {
                    self.assign_accepted(stream, peer, policy.clone());
                }
                Step::Keep
            }
            Endpoint::Stream(conn) => {
                let mut d = Dispatch {
                    queue: &mut self.queue,
                    service: &self.service,
                };
                conn.on_ready(id, ready, &mut d, &mut self.read_buf)
            }
        };
        self.settle(token, step);
    }

    /// Close the socket if the step or the handler asked for it, otherwise
    /// re-arm its interest.
    fn settle(&mut self, token: Token, step: Step) {
        let reason = match (step, self.set.get_mut(token)) {
            (_, None) => return,
            (Step::Close(reason), _) => Some(reason),
            (Step::Keep, Some(Endpoint::Stream(conn))) if conn.close_requested() => {
                Some(CloseReason::Local)
            }
            (Step::Keep, Some(_)) => None,
        };
        if let Some(reason) = reason {
            self.close_socket(token, reason);
            return;
        }

        let Some(interest) = self.set.get_mut(token).map(|e| e.interest()) else {
            return;
        };
        let rearm = self.set.kind().needs_rearm() || self.set.interest(token) != Some(interest);
        if rearm {
            if let Err(e) = self.set.set_interest(token, interest) {
                warn!("[{}] failed to update interest: {}", self.id(token), e);
                self.close_socket(token, CloseReason::Reset);
            }
        }
    }

    fn assign_accepted(&mut self, stream: TcpStream, peer: SocketAddr, policy: Arc<AcceptPolicy>) {
        let target = self.service.shared().pick_worker();
        if target == self.index {
            self.adopt_accepted(stream, peer, &policy);
            return;
        }
        let cmd = Command::Accept {
            stream,
            peer,
            policy,
        };
        if let Err(e) = self.service.shared().dispatch(target, cmd) {
            warn!("[W{}] hand-off of {} to W{} failed: {}", self.index, peer, target, e);
        }
    }

    fn adopt_accepted(&mut self, stream: TcpStream, peer: SocketAddr, policy: &AcceptPolicy) {
        let options = self.service.shared().options();
        if let Err(e) = tcp::configure_stream(&stream, options.nodelay, options.keepalive) {
            warn!("[W{}] dropping {}: {}", self.index, peer, e);
            return;
        }
        let tls = match policy.tls {
            None => None,
            Some(accept) => {
                let Some(ctx) = self.service.shared().tls().current() else {
                    warn!("[W{}] dropping {}: no TLS context configured", self.index, peer);
                    return;
                };
                match TlsSession::accept(ctx, accept.require_client_cert) {
                    Ok(session) => Some(session),
                    Err(e) => {
                        warn!("[W{}] dropping {}: {}", self.index, peer, e);
                        return;
                    }
                }
            }
        };
        let conn = Connection::accepted(stream, peer, tls, (policy.factory)());
        match self.insert(Endpoint::Stream(conn)) {
            Ok(token) => {
                debug!("[{}] accepted {}", self.id(token), peer);
                self.start(token);
            }
            Err(e) => warn!("[W{}] dropping {}: {}", self.index, peer, e),
        }
    }

    /// Start the layers of a freshly inserted worker socket.
    fn start(&mut self, token: Token) {
        let id = self.id(token);
        let step = match self.set.get_mut(token) {
            Some(Endpoint::Stream(conn)) => {
                let mut d = Dispatch {
                    queue: &mut self.queue,
                    service: &self.service,
                };
                conn.start(id, &mut d, &mut self.read_buf)
            }
            _ => return,
        };
        self.settle(token, step);
    }

    fn insert(&mut self, endpoint: Endpoint) -> Result<Token> {
        let handle = endpoint.handle();
        let interest = endpoint.interest();
        let token = self.set.insert_with(handle, interest, |_| endpoint)?;
        self.service.shared().worker_load(self.index).fetch_add(1, Ordering::Relaxed);
        Ok(token)
    }

    fn close_socket(&mut self, token: Token, reason: CloseReason) {
        let id = self.id(token);
        let Some(endpoint) = self.set.remove(token) else {
            return;
        };
        self.service.shared().worker_load(self.index).fetch_sub(1, Ordering::Relaxed);
        let dropped = self.queue.retain(|ev| ev.dst().token() != token);
        if dropped > 0 {
            trace!("[{}] discarded {} queued events", id, dropped);
        }
        match endpoint {
            Endpoint::Stream(conn) => conn.finish(id, reason),
            Endpoint::Listener(_) => info!("[{}] listener closed", id),
        }
    }

    fn drain_commands(&mut self) -> Drained {
        let mut drained = Drained::None;
        while let Ok(cmd) = self.commands.try_recv() {
            drained = Drained::Some;
            if self.handle_command(cmd) {
                return Drained::Stop;
            }
        }
        drained
    }

    /// Returns true on `Stop`.
    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Accept {
                stream,
                peer,
                policy,
            } => self.adopt_accepted(stream, peer, &policy),
            Command::Connect {
                stream,
                tls,
                handler,
                reply,
            } => {
                let conn = Connection::connecting(stream, tls, handler);
                let result = self.insert(Endpoint::Stream(conn)).map(|token| self.id(token));
                if let Ok(id) = &result {
                    debug!("[{}] connecting", id);
                }
                let _ = reply.send(result);
            }
            Command::Listen {
                listener,
                policy,
                reply,
            } => {
                let local = listener.local_addr().ok();
                let result = self
                    .insert(Endpoint::Listener(Listener::new(listener, policy)))
                    .map(|token| self.id(token));
                if let Ok(id) = &result {
                    info!("[{}] listening on {:?}", id, local);
                }
                let _ = reply.send(result);
            }
            Command::Post(event) => enqueue(&mut self.queue, event),
            Command::Send(token, data) => {
                let id = self.id(token);
                let step = match self.set.get_mut(token) {
                    Some(Endpoint::Stream(conn)) => {
                        let mut d = Dispatch {
                            queue: &mut self.queue,
                            service: &self.service,
                        };
                        conn.send(id, &data, &mut d)
                    }
                    _ => {
                        trace!("[{}] send to closed socket dropped", id);
                        return false;
                    }
                };
                self.settle(token, step);
            }
            Command::Close(token) => self.close_socket(token, CloseReason::Local),
            Command::Stop => return true,
        }
        false
    }

    /// Deliver every due event. Events for sockets that are gone are
    /// dropped.
    fn run_due_events(&mut self) -> bool {
        let now = Instant::now();
        let mut delivered = false;
        while let Some(event) = self.queue.pop_due(now) {
            delivered = true;
            let token = event.dst().token();
            let id = self.id(token);
            let step = match self.set.get_mut(token) {
                Some(Endpoint::Stream(conn)) => {
                    let mut d = Dispatch {
                        queue: &mut self.queue,
                        service: &self.service,
                    };
                    conn.deliver(id, event, &mut d)
                }
                _ => {
                    trace!("[{}] event {} for dead socket dropped", id, event.id());
                    continue;
                }
            };
            self.settle(token, step);
        }
        delivered
    }

    fn idle(&mut self) {
        for token in self.set.tokens() {
            let id = self.id(token);
            let step = match self.set.get_mut(token) {
                Some(Endpoint::Stream(conn)) => {
                    let mut d = Dispatch {
                        queue: &mut self.queue,
                        service: &self.service,
                    };
                    conn.idle(id, &mut d)
                }
                _ => continue,
            };
            self.settle(token, step);
        }
    }

    fn shutdown(&mut self) {
        self.service.shared().mark_stopped(self.index);
        // sockets handed to us after the loop ended
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                Command::Connect { reply, .. } | Command::Listen { reply, .. } => {
                    let _ = reply.send(Err(Error::Core(layersock_core::Error::Stopped)));
                }
                _ => {}
            }
        }
        let tokens = self.set.tokens();
        let count = tokens.len();
        for token in tokens {
            self.close_socket(token, CloseReason::Shutdown);
        }
        self.queue.clear();
        info!("[W{}] stopped, closed {} sockets", self.index, count);
    }
}

enum Drained {
    None,
    Some,
    Stop,
}

/// How long `wait` may block given the time until the next due event.
fn wait_timeout(next_due: Option<Duration>, idle: Duration) -> Duration {
    next_due.map_or(idle, |due| due.min(idle))
}
