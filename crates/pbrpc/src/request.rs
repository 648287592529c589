//! Per-call state of the client.

use {
    crate::{
        error::Error,
        frame::Frame,
        proto::{ErrorResponse, ErrorType, PosixErrno, RpcHeader, error_response},
        utils::Result,
    },
    bytes::Bytes,
    log::warn,
    prost::Message,
    std::{
        collections::HashMap,
        future::Future,
        pin::Pin,
        task::{Context, Poll},
        time::Instant,
    },
    tokio::sync::oneshot,
};

/// A successful response.
#[derive(Clone, Debug, PartialEq)]
pub struct Response<M> {
    /// Response header as sent by the server
    pub header: RpcHeader,
    /// Decoded response message
    pub message: M,
    /// Payload following the message, empty if none was sent
    pub data: Bytes,
}

/// What the connection hands to a request when it terminates.
#[derive(Debug)]
pub(crate) enum Outcome {
    Response {
        header: RpcHeader,
        message: Bytes,
        data: Bytes,
    },
    Error(ErrorResponse),
}

impl Outcome {
    /// Decode the response message into `M`.
    ///
    /// A message that cannot be parsed turns into a `GARBAGE_ARGS` error.
    fn into_response<M: Message + Default>(self) -> Result<Response<M>> {
        match self {
            Outcome::Error(err) => Err(Error::Rpc(err)),
            Outcome::Response {
                header,
                message,
                data,
            } => match M::decode(message) {
                Ok(message) => Ok(Response {
                    header,
                    message,
                    data,
                }),
                Err(e) => Err(Error::Rpc(error_response(
                    ErrorType::GarbageArgs,
                    PosixErrno::PosixErrorNone,
                    format!("cannot parse message data: {}", e),
                ))),
            },
        }
    }
}

pub(crate) type Completion = Box<dyn FnOnce(Outcome) + Send>;

/// Builds the type-erased completion for a callback expecting `M`.
pub(crate) fn completion<M, F>(callback: F) -> Completion
where
    M: Message + Default + 'static,
    F: FnOnce(Result<Response<M>>) + Send + 'static,
{
    Box::new(move |outcome: Outcome| callback(outcome.into_response::<M>()))
}

/// One outstanding call.
///
/// Completing or failing consumes the request, so its callback runs exactly once.
pub(crate) struct ClientRequest {
    call_id: u32,
    address: String,
    frame: Frame,
    time_sent: Instant,
    completion: Completion,
}

impl ClientRequest {
    pub(crate) fn new(call_id: u32, address: String, frame: Frame, completion: Completion) -> Self {
        ClientRequest {
            call_id,
            address,
            frame,
            time_sent: Instant::now(),
            completion,
        }
    }

    pub(crate) fn call_id(&self) -> u32 {
        self.call_id
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    /// Serialized request, ready to be written.
    pub(crate) fn frame(&self) -> &Frame {
        &self.frame
    }

    pub(crate) fn time_sent(&self) -> Instant {
        self.time_sent
    }

    /// Mark the request as handed to the event loop.
    pub(crate) fn request_sent(&mut self) {
        self.time_sent = Instant::now();
    }

    pub(crate) fn complete(self, header: RpcHeader, message: Bytes, data: Bytes) {
        (self.completion)(Outcome::Response {
            header,
            message,
            data,
        })
    }

    pub(crate) fn fail(self, err: ErrorResponse) {
        (self.completion)(Outcome::Error(err))
    }
}

/// Outstanding requests of all connections, keyed by call id.
///
/// The table owns the requests. Connections only keep call ids; an id that is
/// no longer in the table belongs to a request that already terminated.
#[derive(Default)]
pub(crate) struct RequestTable {
    requests: HashMap<u32, ClientRequest>,
}

impl RequestTable {
    pub(crate) fn insert(&mut self, request: ClientRequest) {
        let call_id = request.call_id();
        if let Some(displaced) = self.requests.insert(call_id, request) {
            // The counter wrapped around while the old request was still outstanding.
            warn!(
                "call id {} reused while still outstanding, dropping the older request to {}",
                call_id,
                displaced.address()
            );
            displaced.fail(error_response(
                ErrorType::IoError,
                PosixErrno::PosixErrorEio,
                format!("call id {} was reused", call_id),
            ));
        }
    }

    pub(crate) fn get(&self, call_id: u32) -> Option<&ClientRequest> {
        self.requests.get(&call_id)
    }

    pub(crate) fn contains(&self, call_id: u32) -> bool {
        self.requests.contains_key(&call_id)
    }

    pub(crate) fn remove(&mut self, call_id: u32) -> Option<ClientRequest> {
        self.requests.remove(&call_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }

    /// Remove all requests sent before `deadline`.
    pub(crate) fn take_expired(&mut self, deadline: Instant) -> Vec<ClientRequest> {
        let expired: Vec<u32> = self
            .requests
            .values()
            .filter(|rq| rq.time_sent() < deadline)
            .map(|rq| rq.call_id())
            .collect();
        expired
            .into_iter()
            .filter_map(|call_id| self.requests.remove(&call_id))
            .collect()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = ClientRequest> + '_ {
        self.requests.drain().map(|(_, rq)| rq)
    }
}

/// Resolves once the request terminates.
pub struct ResponseFuture<M> {
    rx: oneshot::Receiver<Result<Response<M>>>,
}

impl<M: Message + Default + 'static> ResponseFuture<M> {
    pub(crate) fn channel() -> (Completion, ResponseFuture<M>) {
        let (tx, rx) = oneshot::channel();
        let completion = completion::<M, _>(move |result| {
            // The caller may have stopped waiting.
            let _ = tx.send(result);
        });
        (completion, ResponseFuture { rx })
    }
}

impl<M> Unpin for ResponseFuture<M> {}

impl<M> Future for ResponseFuture<M> {
    type Output = Result<Response<M>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                Err(Error::Rpc(error_response(
                    ErrorType::IoError,
                    PosixErrno::PosixErrorEio,
                    "request was abandoned by the client",
                )))
            })
        })
    }
}
