//! Error type of the public API.
//!
//! Wraps the errors of the lower layers so callers only match on one enum.

use std::io;
use thiserror::Error;

/// Errors returned by services, servers and clients.
#[derive(Error, Debug)]
pub enum Error {
    /// Worker pool, backend or socket set failure
    #[error(transparent)]
    Core(#[from] layersock_core::Error),

    /// TLS session could not be created
    #[error(transparent)]
    Tls(#[from] layersock_tls::Error),

    /// TLS context could not be built
    #[error(transparent)]
    Config(#[from] layersock_tls::ConfigError),

    /// Socket creation, bind or connect failure
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// TLS requested but no context has been published
    #[error("TLS requested but no TLS context is configured")]
    TlsNotConfigured,

    /// A worker did not answer in time
    #[error("Timed out waiting for worker")]
    Timeout,
}

/// Result type alias for the public API
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The service (or the worker addressed) is no longer running.
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        matches!(self, Self::Core(layersock_core::Error::Stopped))
    }
}

impl From<flume::RecvTimeoutError> for Error {
    fn from(err: flume::RecvTimeoutError) -> Self {
        match err {
            flume::RecvTimeoutError::Timeout => Self::Timeout,
            flume::RecvTimeoutError::Disconnected => Self::Core(layersock_core::Error::Stopped),
        }
    }
}
