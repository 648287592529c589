//! RPC header data types and constants.
//!
//! The header travels in front of every request and response message. The
//! payload messages themselves are opaque to the transport: any
//! [`prost::Message`] can be sent and received.
//!
//! # Protocol
//! Protocol-buffer RPC, version 1

use {
    crate::{error::Error, utils::Result},
    bytes::Bytes,
    prost::Message,
};

/// Default port of the directory service
pub const DIR_PORT: u16 = 32638;

/// Default port of the metadata and replica catalog
pub const MRC_PORT: u16 = 32636;

/// Default port of an object storage device
pub const OSD_PORT: u16 = 32640;

/// Kind of an RPC frame
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    RpcRequest = 0,
    RpcResponseSuccess = 1,
    RpcResponseError = 2,
}

/// Authentication scheme carried in [`Auth`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum AuthType {
    AuthNone = 0,
    AuthPassword = 1,
}

/// Error class of an [`ErrorResponse`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ErrorType {
    InvalidInterfaceId = 1,
    InvalidProcId = 2,
    /// The request or response message could not be parsed
    GarbageArgs = 3,
    AuthFailed = 4,
    InternalServerError = 5,
    /// The operation failed with the errno in `posix_errno`
    Errno = 6,
    /// The server is not responsible, see `redirect_to_server_uuid`
    Redirect = 7,
    InvalidView = 8,
    /// Communication failed, produced locally by the client
    IoError = 100,
}

/// POSIX error numbers understood by all services
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PosixErrno {
    PosixErrorNone = 9999,
    PosixErrorEperm = 1,
    PosixErrorEnoent = 2,
    PosixErrorEintr = 4,
    PosixErrorEio = 5,
    PosixErrorEagain = 11,
    PosixErrorEacces = 13,
    PosixErrorEexist = 17,
    PosixErrorExdev = 18,
    PosixErrorEnodev = 19,
    PosixErrorEnotdir = 20,
    PosixErrorEisdir = 21,
    PosixErrorEinval = 22,
    PosixErrorEnotempty = 39,
    PosixErrorEnodata = 61,
}

/// Identity of the user on whose behalf a request is executed
#[derive(Clone, PartialEq, prost::Message)]
pub struct UserCredentials {
    #[prost(string, required, tag = "1")]
    pub username: String,
    #[prost(string, repeated, tag = "2")]
    pub groups: Vec<String>,
}

impl UserCredentials {
    pub fn new(username: impl Into<String>, groups: Vec<String>) -> Self {
        UserCredentials {
            username: username.into(),
            groups,
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthPassword {
    #[prost(string, required, tag = "1")]
    pub password: String,
}

/// Authentication data of a request
#[derive(Clone, PartialEq, prost::Message)]
pub struct Auth {
    #[prost(enumeration = "AuthType", required, tag = "1")]
    pub auth_type: i32,
    #[prost(message, optional, tag = "3")]
    pub auth_passwd: Option<AuthPassword>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub auth_data: Option<Vec<u8>>,
}

impl Auth {
    /// No authentication
    pub fn none() -> Self {
        Auth {
            auth_type: AuthType::AuthNone as i32,
            auth_passwd: None,
            auth_data: None,
        }
    }

    /// Password authentication
    pub fn password(password: impl Into<String>) -> Self {
        Auth {
            auth_type: AuthType::AuthPassword as i32,
            auth_passwd: Some(AuthPassword {
                password: password.into(),
            }),
            auth_data: None,
        }
    }
}

/// Header of every RPC frame
#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcHeader {
    /// Correlates a response with its request
    #[prost(fixed32, required, tag = "1")]
    pub call_id: u32,
    #[prost(enumeration = "MessageType", required, tag = "2")]
    pub message_type: i32,
    /// Set on requests only
    #[prost(message, optional, tag = "3")]
    pub request_header: Option<RequestHeader>,
    /// Set on error responses only
    #[prost(message, optional, tag = "4")]
    pub error_response: Option<ErrorResponse>,
}

/// Selects the service operation and carries the caller's identity
#[derive(Clone, PartialEq, prost::Message)]
pub struct RequestHeader {
    #[prost(fixed32, required, tag = "1")]
    pub interface_id: u32,
    #[prost(fixed32, required, tag = "2")]
    pub proc_id: u32,
    #[prost(message, required, tag = "3")]
    pub user_creds: UserCredentials,
    #[prost(message, required, tag = "4")]
    pub auth_data: Auth,
}

/// Error part of a response header
#[derive(Clone, PartialEq, prost::Message)]
pub struct ErrorResponse {
    #[prost(enumeration = "ErrorType", required, tag = "1")]
    pub error_type: i32,
    #[prost(enumeration = "PosixErrno", optional, tag = "2", default = "PosixErrorNone")]
    pub posix_errno: Option<i32>,
    #[prost(string, optional, tag = "3")]
    pub error_message: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub debug_info: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub redirect_to_server_uuid: Option<String>,
}

/// Build an `ErrorResponse` without debug info or redirect target.
pub fn error_response(
    error_type: ErrorType,
    posix_errno: PosixErrno,
    message: impl Into<String>,
) -> ErrorResponse {
    ErrorResponse {
        error_type: error_type as i32,
        posix_errno: Some(posix_errno as i32),
        error_message: Some(message.into()),
        debug_info: None,
        redirect_to_server_uuid: None,
    }
}

/// Wire presence of the required header fields.
///
/// prost fills in defaults for `required` fields missing on the wire, so a
/// header is decoded into this shape first to tell absent from zero.
#[derive(Clone, PartialEq, prost::Message)]
struct HeaderPresence {
    #[prost(fixed32, optional, tag = "1")]
    call_id: Option<u32>,
    #[prost(int32, optional, tag = "2")]
    message_type: Option<i32>,
    #[prost(message, optional, tag = "3")]
    request_header: Option<RequestHeaderPresence>,
    #[prost(message, optional, tag = "4")]
    error_response: Option<ErrorResponsePresence>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct RequestHeaderPresence {
    #[prost(fixed32, optional, tag = "1")]
    interface_id: Option<u32>,
    #[prost(fixed32, optional, tag = "2")]
    proc_id: Option<u32>,
    #[prost(bytes = "bytes", optional, tag = "3")]
    user_creds: Option<Bytes>,
    #[prost(bytes = "bytes", optional, tag = "4")]
    auth_data: Option<Bytes>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct ErrorResponsePresence {
    #[prost(int32, optional, tag = "1")]
    error_type: Option<i32>,
}

impl HeaderPresence {
    fn first_missing(&self) -> Option<&'static str> {
        if self.call_id.is_none() {
            return Some("call_id");
        }
        if self.message_type.is_none() {
            return Some("message_type");
        }
        if let Some(request) = &self.request_header {
            let missing = [
                (request.interface_id.is_none(), "request_header.interface_id"),
                (request.proc_id.is_none(), "request_header.proc_id"),
                (request.user_creds.is_none(), "request_header.user_creds"),
                (request.auth_data.is_none(), "request_header.auth_data"),
            ];
            if let Some((_, field)) = missing.into_iter().find(|(absent, _)| *absent) {
                return Some(field);
            }
        }
        match &self.error_response {
            Some(err) if err.error_type.is_none() => Some("error_response.error_type"),
            _ => None,
        }
    }
}

impl RpcHeader {
    /// Decode a received header.
    ///
    /// Fails on malformed input and on headers lacking a required field.
    pub fn parse(buf: Bytes) -> Result<RpcHeader> {
        let presence = HeaderPresence::decode(buf.clone())?;
        if let Some(field) = presence.first_missing() {
            return Err(Error::MissingField(field));
        }
        Ok(RpcHeader::decode(buf)?)
    }

    /// Header of an outgoing request.
    pub fn request(
        call_id: u32,
        interface_id: u32,
        proc_id: u32,
        user_creds: UserCredentials,
        auth: Auth,
    ) -> Self {
        RpcHeader {
            call_id,
            message_type: MessageType::RpcRequest as i32,
            request_header: Some(RequestHeader {
                interface_id,
                proc_id,
                user_creds,
                auth_data: auth,
            }),
            error_response: None,
        }
    }

    /// Header answering the request with `call_id`.
    pub fn response(call_id: u32, error: Option<ErrorResponse>) -> Self {
        let message_type = match error {
            Some(_) => MessageType::RpcResponseError,
            None => MessageType::RpcResponseSuccess,
        };
        RpcHeader {
            call_id,
            message_type: message_type as i32,
            request_header: None,
            error_response: error,
        }
    }
}
