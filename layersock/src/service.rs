//! Worker pool
//!
//! A [`Service`] runs a fixed number of worker threads. Sockets are assigned
//! to a worker once, when they are created, and never move. Every other
//! thread addresses them through a [`ServiceHandle`]: posting events,
//! queueing bytes and closing sockets are all messages to the owning
//! worker, so none of them block.

use crate::client::ConnectOptions;
use crate::error::{Error, Result};
use crate::socket::{AcceptPolicy, AcceptTls, Handler, HandlerFactory};
use crate::worker::{Command, Worker};
use bytes::Bytes;
use layersock_core::event::{Event, SocketId};
use layersock_core::options::{Assignment, ServiceOptions};
use layersock_core::tcp;
use layersock_core::waker::{self, Waker};
use layersock_core::Error as CoreError;
use layersock_tls::{TlsContext, TlsManager, TlsSession};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// How long callers wait for a worker to register a new socket.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

struct WorkerSlot {
    commands: flume::Sender<Command>,
    waker: Waker,
    load: AtomicUsize,
    alive: AtomicBool,
}

/// State shared by the service, its handles and its workers.
pub(crate) struct Shared {
    workers: Vec<WorkerSlot>,
    options: ServiceOptions,
    tls: Arc<TlsManager>,
    cursor: AtomicUsize,
}

impl Shared {
    pub(crate) fn options(&self) -> &ServiceOptions {
        &self.options
    }

    pub(crate) fn tls(&self) -> &TlsManager {
        &self.tls
    }

    pub(crate) fn worker_load(&self, worker: usize) -> &AtomicUsize {
        &self.workers[worker].load
    }

    pub(crate) fn mark_stopped(&self, worker: usize) {
        if let Some(slot) = self.workers.get(worker) {
            slot.alive.store(false, Ordering::Release);
        }
    }

    fn is_alive(&self, worker: usize) -> bool {
        self.workers[worker].alive.load(Ordering::Acquire)
    }

    /// Worker for a new socket. Stopped workers are skipped; when none is
    /// left the pick fails later in [`dispatch`](Self::dispatch). Load
    /// counts are advisory: they may be slightly stale under concurrent
    /// assignment.
    pub(crate) fn pick_worker(&self) -> usize {
        let count = self.workers.len();
        match self.options.assignment {
            Assignment::RoundRobin => {
                let start = self.cursor.fetch_add(1, Ordering::Relaxed);
                (0..count)
                    .map(|step| start.wrapping_add(step) % count)
                    .find(|&worker| self.is_alive(worker))
                    .unwrap_or(start % count)
            }
            Assignment::LeastLoaded => self
                .workers
                .iter()
                .enumerate()
                .filter(|(_, w)| w.alive.load(Ordering::Acquire))
                .min_by_key(|(_, w)| w.load.load(Ordering::Relaxed))
                .map_or(0, |(index, _)| index),
        }
    }

    /// Queue a command for a worker and wake it. Never blocks.
    pub(crate) fn dispatch(&self, worker: usize, cmd: Command) -> Result<()> {
        let slot = self
            .workers
            .get(worker)
            .ok_or(CoreError::NoSuchWorker(worker))?;
        if !slot.alive.load(Ordering::Acquire) {
            return Err(CoreError::Stopped.into());
        }
        slot.commands.send(cmd).map_err(|_| CoreError::Stopped)?;
        slot.waker.wake()?;
        Ok(())
    }
}

/// Cheap, cloneable handle for addressing sockets from any thread.
#[derive(Clone)]
pub struct ServiceHandle {
    shared: Arc<Shared>,
}

impl ServiceHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Post an event to the worker owning its destination socket.
    ///
    /// Events to one worker are delivered in due-time order, ties in the
    /// order they were posted. An event whose socket closes before delivery
    /// is discarded.
    ///
    /// # Errors
    ///
    /// Fails if the destination worker does not exist or has stopped.
    pub fn post(&self, event: Event) -> Result<()> {
        self.shared.dispatch(event.dst().worker(), Command::Post(event))
    }

    /// Post an event that becomes due after `delay`.
    ///
    /// # Errors
    ///
    /// Same as [`post`](Self::post).
    pub fn post_delayed(&self, event: Event, delay: Duration) -> Result<()> {
        self.post(event.delayed(delay))
    }

    /// Queue bytes for a socket. They are written by the owning worker, in
    /// order with anything its handler sends.
    ///
    /// # Errors
    ///
    /// Fails if the owning worker does not exist or has stopped. A socket
    /// that closed in the meantime silently drops the bytes.
    pub fn send(&self, id: SocketId, data: impl Into<Bytes>) -> Result<()> {
        self.shared
            .dispatch(id.worker(), Command::Send(id.token(), data.into()))
    }

    /// Close a socket. Its handler sees `on_close(CloseReason::Local)`.
    ///
    /// # Errors
    ///
    /// Fails if the owning worker does not exist or has stopped.
    pub fn close(&self, id: SocketId) -> Result<()> {
        self.shared.dispatch(id.worker(), Command::Close(id.token()))
    }

    /// Number of open sockets across all workers, listeners included.
    pub fn socket_count(&self) -> usize {
        self.shared
            .workers
            .iter()
            .map(|w| w.load.load(Ordering::Relaxed))
            .sum()
    }

    /// Open sockets owned by one worker.
    pub fn worker_load(&self, worker: usize) -> Option<usize> {
        self.shared
            .workers
            .get(worker)
            .map(|w| w.load.load(Ordering::Relaxed))
    }

    /// Number of workers in the pool.
    pub fn worker_count(&self) -> usize {
        self.shared.workers.len()
    }

    /// True while at least one worker is running.
    pub fn is_running(&self) -> bool {
        self.shared
            .workers
            .iter()
            .any(|w| w.alive.load(Ordering::Acquire))
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("workers", &self.worker_count())
            .field("sockets", &self.socket_count())
            .finish()
    }
}

/// A socket registration in flight.
#[derive(Debug)]
pub struct Connecting {
    addr: SocketAddr,
    reply: flume::Receiver<Result<SocketId>>,
}

impl Connecting {
    /// Address being connected to.
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait until the owning worker has registered the socket.
    ///
    /// The connect itself may still be in progress; the handler's
    /// `on_connect` (or `on_close(ConnectFailed)`) reports the outcome.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] if the worker does not answer in time, or the
    /// registration failure.
    pub fn wait(self, timeout: Duration) -> Result<SocketId> {
        self.reply.recv_timeout(timeout)?
    }
}

/// Fixed pool of worker threads.
pub struct Service {
    handle: ServiceHandle,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Service {
    /// Spawn the workers. Returns once every worker has built its socket
    /// set and is ready to dispatch.
    ///
    /// # Errors
    ///
    /// Fails if a waker, backend or thread cannot be created; workers
    /// already started are stopped again.
    pub fn start(options: ServiceOptions, tls: Arc<TlsManager>) -> Result<Self> {
        let count = options.workers.max(1);
        let mut slots = Vec::with_capacity(count);
        let mut receivers = Vec::with_capacity(count);
        for _ in 0..count {
            let (tx, rx) = flume::unbounded();
            let (waker, wake_rx) = waker::pair()?;
            slots.push(WorkerSlot {
                commands: tx,
                waker,
                load: AtomicUsize::new(0),
                alive: AtomicBool::new(true),
            });
            receivers.push((rx, wake_rx));
        }

        let shared = Arc::new(Shared {
            workers: slots,
            options,
            tls,
            cursor: AtomicUsize::new(0),
        });
        let service = Self {
            handle: ServiceHandle::new(shared.clone()),
            threads: Mutex::new(Vec::with_capacity(count)),
        };

        let (ready_tx, ready_rx) = flume::bounded::<Result<()>>(count);
        for (index, (commands, wake)) in receivers.into_iter().enumerate() {
            let worker_shared = shared.clone();
            let ready = ready_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", shared.options.thread_name, index))
                .spawn(move || match Worker::new(index, worker_shared.clone(), commands, wake) {
                    Ok(worker) => {
                        let _ = ready.send(Ok(()));
                        drop(ready);
                        worker.run();
                    }
                    Err(e) => {
                        worker_shared.mark_stopped(index);
                        let _ = ready.send(Err(e));
                    }
                });
            match spawned {
                Ok(thread) => service.threads.lock().push(thread),
                Err(e) => {
                    error!("[service] failed to spawn worker {}: {}", index, e);
                    shared.mark_stopped(index);
                    service.stop();
                    return Err(e.into());
                }
            }
        }
        drop(ready_tx);

        for _ in 0..count {
            match ready_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    service.stop();
                    return Err(e);
                }
                Err(_) => {
                    service.stop();
                    return Err(CoreError::Stopped.into());
                }
            }
        }
        info!(
            "[service] {} workers running ({} backend, {:?} assignment)",
            count, shared.options.backend, shared.options.assignment
        );
        Ok(service)
    }

    /// Handle for addressing sockets from other threads.
    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    /// See [`ServiceHandle::post`].
    ///
    /// # Errors
    ///
    /// Fails if the destination worker does not exist or has stopped.
    pub fn post(&self, event: Event) -> Result<()> {
        self.handle.post(event)
    }

    /// See [`ServiceHandle::post_delayed`].
    ///
    /// # Errors
    ///
    /// Fails if the destination worker does not exist or has stopped.
    pub fn post_delayed(&self, event: Event, delay: Duration) -> Result<()> {
        self.handle.post_delayed(event, delay)
    }

    /// See [`ServiceHandle::send`].
    ///
    /// # Errors
    ///
    /// Fails if the owning worker does not exist or has stopped.
    pub fn send(&self, id: SocketId, data: impl Into<Bytes>) -> Result<()> {
        self.handle.send(id, data)
    }

    /// See [`ServiceHandle::close`].
    ///
    /// # Errors
    ///
    /// Fails if the owning worker does not exist or has stopped.
    pub fn close(&self, id: SocketId) -> Result<()> {
        self.handle.close(id)
    }

    /// See [`ServiceHandle::socket_count`].
    pub fn socket_count(&self) -> usize {
        self.handle.socket_count()
    }

    /// Manager whose published context accepted and connected sockets use.
    pub fn tls(&self) -> &Arc<TlsManager> {
        &self.handle.shared.tls
    }

    /// Bind a listener and register it on worker 0. Accepted connections
    /// are spread over all workers by the configured assignment policy.
    pub(crate) fn listen(
        &self,
        addr: SocketAddr,
        factory: HandlerFactory,
        tls: Option<AcceptTls>,
    ) -> Result<(SocketId, SocketAddr)> {
        let listener = tcp::bind_listener(addr, self.handle.shared.options.backlog)?;
        let local = listener.local_addr()?;
        let (reply, rx) = flume::bounded(1);
        let policy = Arc::new(AcceptPolicy { factory, tls });
        self.handle.shared.dispatch(
            0,
            Command::Listen {
                listener,
                policy,
                reply,
            },
        )?;
        let id = rx.recv_timeout(DEFAULT_REPLY_TIMEOUT)??;
        Ok((id, local))
    }

    /// Start a non-blocking connect and hand the socket to a worker.
    ///
    /// With TLS enabled the session is created here, against the private
    /// context from `options` or else the published default.
    ///
    /// # Errors
    ///
    /// Fails if TLS is requested without a usable context, the address does
    /// not resolve, or the connect fails immediately.
    pub fn connect<H: Handler>(
        &self,
        host: &str,
        port: u16,
        options: &ConnectOptions,
        handler: H,
    ) -> Result<Connecting> {
        let tls = if options.tls {
            let ctx = match &options.private_tls {
                Some(config) => Arc::new(TlsContext::client(config)?),
                None => self
                    .handle
                    .shared
                    .tls
                    .current()
                    .ok_or(Error::TlsNotConfigured)?,
            };
            let server_name = options.server_name.as_deref().unwrap_or(host);
            Some(TlsSession::connect(ctx, server_name)?)
        } else {
            None
        };

        let addr = tcp::resolve(host, port)?;
        let stream = tcp::connect_nonblocking(addr)?;
        let opts = &self.handle.shared.options;
        tcp::configure_stream(&stream, opts.nodelay, opts.keepalive)?;

        let worker = self.handle.shared.pick_worker();
        let (reply, rx) = flume::bounded(1);
        self.handle.shared.dispatch(
            worker,
            Command::Connect {
                stream,
                tls,
                handler: Box::new(handler),
                reply,
            },
        )?;
        debug!("[service] connect to {} assigned to W{}", addr, worker);
        Ok(Connecting { addr, reply: rx })
    }

    /// Stop every worker and wait for them to exit. Open sockets are closed
    /// with `CloseReason::Shutdown`. Calling it again does nothing.
    pub fn stop(&self) {
        let threads = std::mem::take(&mut *self.threads.lock());
        if threads.is_empty() {
            return;
        }
        for worker in 0..self.handle.worker_count() {
            let _ = self.handle.shared.dispatch(worker, Command::Stop);
        }
        let current = thread::current().id();
        for thread in threads {
            // a handler stopping its own service cannot join itself
            if thread.thread().id() == current {
                continue;
            }
            if thread.join().is_err() {
                error!("[service] worker panicked");
            }
        }
        info!("[service] stopped");
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service").field("handle", &self.handle).finish()
    }
}
