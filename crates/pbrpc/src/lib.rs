#![forbid(unsafe_code)]
//! Asynchronous protocol-buffer RPC client transport for Rust.
//!
//! This crate provides the tokio-based client side of the XtreemFS RPC
//! protocol: requests are protobuf messages sent over long-lived TCP, TLS or
//! Grid TLS connections, multiplexed per server address and correlated with
//! their responses by call id.
//!
//! # Overview
//!
//! A [`Client`] hands requests to an [`EventLoop`] which owns one connection
//! per server address. Connections are opened lazily, reused while requests
//! flow, closed after a linger period without traffic, and re-established on
//! demand with a capped exponential delay between failed attempts.
//!
//! Every request terminates exactly once: with the server's response, with
//! the error response the server sent, or with an error synthesized by the
//! client (connection failure, timeout, shutdown, garbage on the wire).
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use pbrpc::{Auth, Client, ClientOptions, UserCredentials};
//!
//! #[tokio::main]
//! async fn main() -> pbrpc::Result<()> {
//!     let client = Client::start(ClientOptions::default())?;
//!     let creds = UserCredentials::new("user", vec!["users".to_owned()]);
//!
//!     // Any prost message can be a request or a response.
//!     let response = client
//!         .send_request::<_, UserCredentials>(
//!             "localhost:32636",
//!             20001,
//!             1,
//!             &creds,
//!             &Auth::none(),
//!             &creds,
//!             Bytes::new(),
//!         )
//!         .await?;
//!     println!("{:?}", response.message);
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Wire Format
//!
//! Each frame starts with a 12 byte record marker holding the big-endian
//! lengths of the three parts that follow: the [`RpcHeader`], the request or
//! response message, and an opaque data payload. See [`frame`].
//!
//! # Errors
//!
//! Failures of a request reach the caller as [`Error::Rpc`] carrying an
//! [`ErrorResponse`]. Its error type tells server errors (e.g. `ERRNO`,
//! `INVALID_PROC_ID`) from client side ones (`IO_ERROR`, `GARBAGE_ARGS`).
//!
//! # Testing
//!
//! [`testsrv`] contains a server peer with a registry of operations and knobs
//! to drop requests, for exercising timeouts and reconnects.
//!
//! # Safety
//!
//! This crate forbids unsafe code (`#![forbid(unsafe_code)]`).
pub mod backoff;
pub mod channel;
pub mod client;
pub mod config;
mod connection;
pub mod error;
pub mod frame;
pub mod proto;
pub mod request;
pub mod testsrv;
#[macro_use]
pub mod utils;

pub use crate::client::{Client, ClientStats, EventLoop};
pub use crate::config::{ClientOptions, SslOptions};
pub use crate::error::Error;
pub use crate::frame::{Frame, RecordCodec, RecordMarker};
pub use crate::proto::*;
pub use crate::request::{Response, ResponseFuture};
pub use crate::utils::Result;
