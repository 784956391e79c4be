//! Service configuration options
//!
//! Options controlling the worker pool, the readiness backend each worker
//! uses and how accepted sockets are spread across workers.

use crate::backend::BackendKind;
use std::time::Duration;

/// Default number of sockets one worker can own
pub const DEFAULT_SET_CAPACITY: usize = 1024;

/// Default dispatch timeout after which idle callbacks run
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(100);

/// Default read buffer size (8KB)
pub const DEFAULT_READ_BUF_SIZE: usize = 8192;

/// Default listen backlog
pub const DEFAULT_BACKLOG: i32 = 1024;

/// How new sockets are assigned to workers. Assignment happens once, when
/// the socket is created; sockets never migrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Assignment {
    /// Cycle through workers in order
    #[default]
    RoundRobin,
    /// Pick the worker currently owning the fewest sockets
    LeastLoaded,
}

/// Worker pool options.
///
/// # Examples
///
/// ```
/// use layersock_core::backend::BackendKind;
/// use layersock_core::options::{Assignment, ServiceOptions};
/// use std::time::Duration;
///
/// let opts = ServiceOptions::default()
///     .with_workers(4)
///     .with_backend(BackendKind::Poll)
///     .with_assignment(Assignment::LeastLoaded)
///     .with_idle_timeout(Duration::from_millis(20));
/// assert_eq!(opts.workers, 4);
/// ```
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Number of worker threads (default: number of CPUs)
    pub workers: usize,

    /// Maximum sockets per worker
    pub capacity: usize,

    /// Longest a worker blocks in `wait` before running idle callbacks
    pub idle_timeout: Duration,

    /// Readiness mechanism every worker uses
    pub backend: BackendKind,

    /// Worker selection policy for new sockets
    pub assignment: Assignment,

    /// Size of the per-worker receive buffer
    pub read_buffer_size: usize,

    /// Disable Nagle's algorithm on accepted and connected streams
    pub nodelay: bool,

    /// TCP keepalive idle time (`None` leaves the OS default)
    pub keepalive: Option<Duration>,

    /// Listen backlog for servers
    pub backlog: i32,

    /// Name prefix for worker threads
    pub thread_name: String,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            capacity: DEFAULT_SET_CAPACITY,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            backend: BackendKind::default(),
            assignment: Assignment::default(),
            read_buffer_size: DEFAULT_READ_BUF_SIZE,
            nodelay: true,
            keepalive: None,
            backlog: DEFAULT_BACKLOG,
            thread_name: "layersock-worker".to_string(),
        }
    }
}

impl ServiceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers (at least one).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_assignment(mut self, assignment: Assignment) -> Self {
        self.assignment = assignment;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}
