//! Error types of the transport.
//!
//! Everything that goes wrong for one particular request reaches the caller as
//! [`Error::Rpc`], carrying either the `ErrorResponse` sent by the server or one
//! synthesized by the client (I/O failures, timeouts, garbage frames).

use crate::proto::{ErrorResponse, ErrorType, PosixErrno};
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Local I/O failure outside of a request, e.g. binding a listener.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS configuration failure.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// A protobuf message could not be decoded.
    #[error("cannot decode message: {0}")]
    Decode(#[from] prost::DecodeError),

    /// A received header lacks a field the protocol requires.
    #[error("missing required field {0}")]
    MissingField(&'static str),

    /// Invalid client or SSL options.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Terminal error of a request.
    #[error("{}", describe(.0))]
    Rpc(ErrorResponse),
}

fn describe(err: &ErrorResponse) -> String {
    format!(
        "{} ({:?}, {:?})",
        err.error_message(),
        err.error_type(),
        err.posix_errno()
    )
}

impl Error {
    /// The error response, if this is a request error.
    pub fn error_response(&self) -> Option<&ErrorResponse> {
        match self {
            Error::Rpc(err) => Some(err),
            _ => None,
        }
    }

    /// Error class as reported on the wire. Local failures map to `IO_ERROR`.
    pub fn error_type(&self) -> ErrorType {
        match self {
            Error::Rpc(err) => err.error_type(),
            Error::Decode(_) | Error::MissingField(_) => ErrorType::GarbageArgs,
            _ => ErrorType::IoError,
        }
    }

    /// POSIX errno as reported on the wire.
    pub fn posix_errno(&self) -> PosixErrno {
        match self {
            Error::Rpc(err) => err.posix_errno(),
            Error::Config(_) => PosixErrno::PosixErrorEinval,
            _ => PosixErrno::PosixErrorEio,
        }
    }
}

impl From<ErrorResponse> for Error {
    fn from(err: ErrorResponse) -> Self {
        Error::Rpc(err)
    }
}
