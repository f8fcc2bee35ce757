//! Declare an error type for strand-circmgr.

use retry_error::RetryError;
use thiserror::Error;

/// An error returned while acquiring, building, rotating, or using a
/// circuit.
///
/// Errors are kept `Clone` so that a single build failure can be
/// delivered identically to every request that was waiting on the same
/// in-flight build.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The pluggable transport could not reach the bridge.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A circuit build failed.
    #[error("circuit build failed: {0}")]
    CircuitBuildFailed(String),

    /// A circuit took too long to become ready.
    #[error("circuit took too long to build")]
    CircuitTimeout,

    /// The transport handshake took too long.
    #[error("connection took too long to establish")]
    ConnectionTimeout,

    /// A request spent too long waiting for its round trip to complete.
    #[error("request timed out")]
    RequestTimeout,

    /// The operation was cancelled by `abort()` or `close()`.
    #[error("operation cancelled")]
    Cancelled,

    /// The supplied configuration was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A protocol error surfaced from the circuit collaborator.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// We were waiting on a pending circuit, but it didn't succeed.
    #[error("pending circuit failed to launch")]
    PendingFailed,

    /// Unable to build or rotate a circuit, despite retrying.
    #[error("{0}")]
    RequestFailed(RetryError<Box<Error>>),

    /// An internal error that should never occur.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<futures::channel::oneshot::Canceled> for Error {
    fn from(_: futures::channel::oneshot::Canceled) -> Error {
        Error::PendingFailed
    }
}

impl From<strand_rtcompat::TimeoutError> for Error {
    fn from(_: strand_rtcompat::TimeoutError) -> Error {
        Error::CircuitTimeout
    }
}

impl From<futures::task::SpawnError> for Error {
    fn from(_: futures::task::SpawnError) -> Error {
        Error::Internal("unable to spawn task in executor".into())
    }
}

/// A Result type used by this crate.
pub type Result<T> = std::result::Result<T, Error>;
