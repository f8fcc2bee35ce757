//! Declare client-specific errors.

use thiserror::Error;

/// An error originating from the strand-client crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// An error from the circuit lifecycle layer (builds, timeouts,
    /// cancellation, rotation).
    #[error("{0}")]
    Circuit(#[from] strand_circmgr::Error),

    /// The caller handed us a request we couldn't encode.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// We got an EOF before we were done with the headers.
    #[error("truncated HTTP headers")]
    TruncatedHeaders,

    /// Received a response that was longer than we expected.
    #[error("response too long; gave up after {0} bytes")]
    ResponseTooLong(usize),

    /// Data received was not UTF-8 encoded.
    #[error("couldn't decode data as UTF-8")]
    Utf8Encoding(#[from] std::string::FromUtf8Error),

    /// Io error while reading on a circuit stream.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error when parsing http.
    #[error("couldn't parse HTTP response")]
    Httparse(#[from] httparse::Error),

    /// Error while creating an http request.
    #[error("couldn't create HTTP request")]
    Http(#[from] http::Error),
}

impl Error {
    /// Return true if this error is the cancellation error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Circuit(strand_circmgr::Error::Cancelled))
    }
}

/// A Result type used by this crate.
pub type Result<T> = std::result::Result<T, Error>;
