use std::io;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::large_object::Oid;

/// Errors raised while constructing or resolving a [`Range`](crate::Range).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("Range is out of boundaries")]
    OutOfRange,
    #[error("Range is not satisfiable")]
    NotSatisfiable,
    #[error("Range specification {0:?} is not valid")]
    Malformed(String),
    #[error("Ranges are neither overlapping nor consecutive")]
    Disjoint,
    #[error("Range is relative to an unknown size")]
    Relative,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Range(#[from] RangeError),

    #[error("HTTP body is a producer function")]
    BodyIsProducer,

    #[error("HTTP body stream was already consumed")]
    BodyConsumed,

    #[error("multipart type {0:?} is not valid")]
    InvalidMultipartType(String),

    #[error("multipart boundary is not valid")]
    InvalidBoundary,

    #[error("invalid multipart data: {0}")]
    MalformedMultipart(&'static str),

    #[error("file mode {0:?} is not valid")]
    InvalidFileMode(String),

    #[error("large object {0} not found")]
    LargeObjectNotFound(Oid),

    #[error("large object size is not valid")]
    LargeObjectIntegrity,

    #[error("large object store: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Recovers a crate error that crossed a byte stream as an `io::Error`.
    pub fn from_io(err: io::Error) -> Self {
        err.downcast::<Error>().unwrap_or_else(Error::Io)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            err => io::Error::other(err),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Io(e) if e.kind() == io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
            Error::LargeObjectNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::warn!(error = %self, "delivery failed");
        }

        status.into_response()
    }
}
