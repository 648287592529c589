//! RPC server peer for tests and demos.
//!
//! Serves the operations of one interface from an [`OperationRegistry`].
//! Sessions handle their requests strictly one after another, so responses
//! leave in request order. Requests can be dropped on purpose to provoke
//! client timeouts and reconnects.

use {
    crate::{
        error::Error,
        frame::{Frame, RecordCodec},
        proto::{ErrorResponse, ErrorType, PosixErrno, RpcHeader, error_response},
        res,
        utils::Result,
    },
    bytes::Bytes,
    futures::sink::SinkExt,
    log::{debug, error, info, warn},
    prost::Message,
    std::{
        collections::HashMap,
        net::SocketAddr,
        sync::{Arc, Mutex, MutexGuard},
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, TcpStream},
        task::{JoinHandle, JoinSet},
    },
    tokio_rustls::TlsAcceptor,
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedRead, FramedWrite},
};

/// Pseudo proc id for [`TestServer::drop_request_by_proc_id`]: the next
/// accepted connection is closed right away.
pub const DROP_NEW_CONNECTION: u32 = u32::MAX;

type Handler = Box<
    dyn Fn(Bytes, Bytes) -> std::result::Result<(Bytes, Bytes), ErrorResponse> + Send + Sync,
>;

/// Operations served by a [`TestServer`], keyed by interface and proc id.
pub struct OperationRegistry {
    interface_id: u32,
    operations: HashMap<(u32, u32), Handler>,
}

impl OperationRegistry {
    /// Registry for the operations of `interface_id`.
    pub fn new(interface_id: u32) -> OperationRegistry {
        OperationRegistry {
            interface_id,
            operations: HashMap::new(),
        }
    }

    pub fn interface_id(&self) -> u32 {
        self.interface_id
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Serve `proc_id` with `handler`.
    ///
    /// The handler gets the decoded request message and the request's data
    /// payload. It answers with a response message and data, or with an
    /// error response that is sent back to the client as is.
    pub fn register<Req, Resp, F>(&mut self, proc_id: u32, handler: F) -> &mut Self
    where
        Req: Message + Default + 'static,
        Resp: Message + 'static,
        F: Fn(Req, Bytes) -> std::result::Result<(Resp, Bytes), ErrorResponse>
            + Send
            + Sync
            + 'static,
    {
        let handler = move |message: Bytes, data: Bytes| {
            let request = Req::decode(message).map_err(|e| {
                error_response(
                    ErrorType::GarbageArgs,
                    PosixErrno::PosixErrorEinval,
                    format!("cannot parse request message: {}", e),
                )
            })?;
            let (response, data) = handler(request, data)?;
            Ok((response.encode_to_vec().into(), data))
        };
        self.operations
            .insert((self.interface_id, proc_id), Box::new(handler));
        self
    }

    /// Run the operation for `proc_id`, `None` if there is none.
    fn execute(
        &self,
        proc_id: u32,
        message: Bytes,
        data: Bytes,
    ) -> Option<std::result::Result<(Bytes, Bytes), ErrorResponse>> {
        self.operations
            .get(&(self.interface_id, proc_id))
            .map(|handler| handler(message, data))
    }
}

/// A request as seen by the server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedRequest {
    pub call_id: u32,
    pub proc_id: u32,
    /// Length of the data payload
    pub data_len: usize,
    /// Dropped without an answer
    pub dropped: bool,
}

#[derive(Debug)]
struct DropPolicy {
    next_requests: usize,
    proc_id: Option<u32>,
}

impl DropPolicy {
    fn check(&mut self, proc_id: u32) -> bool {
        if proc_id != 0 && self.proc_id == Some(proc_id) {
            self.proc_id = None;
            return true;
        }
        if self.next_requests > 0 {
            self.next_requests -= 1;
            return true;
        }
        false
    }
}

struct Shared {
    registry: OperationRegistry,
    drops: Mutex<DropPolicy>,
    received: Mutex<Vec<ReceivedRequest>>,
}

impl Shared {
    fn should_drop(&self, proc_id: u32) -> bool {
        let dropped = lock(&self.drops).check(proc_id);
        if dropped {
            debug!("dropping request (proc_id = {})", proc_id);
        }
        dropped
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An RPC server answering requests of one interface.
pub struct TestServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    listener: Option<TcpListener>,
    accept_task: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Bind to `addr` (e.g. `"127.0.0.1:0"`) without accepting connections yet.
    pub async fn bind(addr: &str, registry: OperationRegistry) -> Result<TestServer> {
        if registry.interface_id() == 0 {
            return res!(Error::Config("interface id of the test server is not set".to_owned()));
        }
        if registry.is_empty() {
            return res!(Error::Config("no operations registered".to_owned()));
        }

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(TestServer {
            shared: Arc::new(Shared {
                registry,
                drops: Mutex::new(DropPolicy {
                    next_requests: 0,
                    proc_id: None,
                }),
                received: Mutex::new(Vec::new()),
            }),
            local_addr,
            listener: Some(listener),
            accept_task: None,
        })
    }

    /// Serve plain TCP connections.
    pub fn start(&mut self) {
        self.spawn_accept_loop(None);
    }

    /// Serve TLS connections.
    pub fn start_tls(&mut self, acceptor: TlsAcceptor) {
        self.spawn_accept_loop(Some(acceptor));
    }

    /// `"ip:port"` the server listens on.
    pub fn address(&self) -> String {
        self.local_addr.to_string()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Drop the next `count` requests (or new connections) without answering.
    pub fn drop_next_requests(&self, count: usize) {
        lock(&self.shared.drops).next_requests += count;
    }

    /// Drop the next request with `proc_id` without answering.
    ///
    /// [`DROP_NEW_CONNECTION`] closes the next accepted connection instead.
    pub fn drop_request_by_proc_id(&self, proc_id: u32) {
        lock(&self.shared.drops).proc_id = Some(proc_id);
    }

    /// Every request received so far, in arrival order.
    pub fn received(&self) -> Vec<ReceivedRequest> {
        lock(&self.shared.received).clone()
    }

    /// Stop accepting and close every session.
    pub async fn stop(&mut self) {
        self.listener = None;
        if let Some(task) = self.accept_task.take() {
            task.abort();
            // Completes with a cancellation error, the sessions are gone then.
            let _ = task.await;
        }
        info!("test server on {} stopped", self.local_addr);
    }

    fn spawn_accept_loop(&mut self, acceptor: Option<TlsAcceptor>) {
        let Some(listener) = self.listener.take() else {
            warn!("test server on {} already started", self.local_addr);
            return;
        };
        info!(
            "test server for interface {} listening on {}{}",
            self.shared.registry.interface_id(),
            self.local_addr,
            if acceptor.is_some() { " (TLS)" } else { "" }
        );

        let shared = self.shared.clone();
        self.accept_task = Some(tokio::spawn(async move {
            // Dropping the set with the task aborts all sessions.
            let mut sessions = JoinSet::new();
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("accept failed: {}", e);
                        return;
                    }
                };
                while sessions.try_join_next().is_some() {}

                if shared.should_drop(DROP_NEW_CONNECTION) {
                    info!("closing new connection from {}", peer);
                    drop(stream);
                    continue;
                }
                info!("accepted: {:?}", peer);
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("cannot set TCP_NODELAY for {}: {}", peer, e);
                }

                let shared = shared.clone();
                let acceptor = acceptor.clone();
                sessions.spawn(async move {
                    if let Err(e) = serve(shared, stream, peer, acceptor).await {
                        warn!("session with {} ended: {}", peer, e);
                    }
                });
            }
        }));
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

async fn serve(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
) -> Result<()> {
    match acceptor {
        Some(acceptor) => {
            let stream = acceptor.accept(stream).await?;
            debug!("SSL handshake with {} done", peer);
            let (reader, writer) = tokio::io::split(stream);
            session(&shared, reader, writer, peer).await
        }
        None => {
            let (reader, writer) = stream.into_split();
            session(&shared, reader, writer, peer).await
        }
    }
}

async fn session<Reader, Writer>(
    shared: &Shared,
    reader: Reader,
    writer: Writer,
    peer: SocketAddr,
) -> Result<()>
where
    Reader: AsyncRead + Send + Unpin,
    Writer: AsyncWrite + Send + Unpin,
{
    let mut framedread = FramedRead::new(reader, RecordCodec::new());
    let mut framedwrite = FramedWrite::new(writer, RecordCodec::new());

    while let Some(frame) = framedread.next().await {
        let frame = frame?;

        let header = match RpcHeader::parse(frame.header.clone()) {
            Ok(header) => header,
            Err(e) => {
                warn!("failed to parse request header received from {}: {}", peer, e);
                break;
            }
        };
        let Some(request_header) = header.request_header.as_ref() else {
            warn!("message from {} is not a request", peer);
            break;
        };
        let (interface_id, proc_id) = (request_header.interface_id, request_header.proc_id);
        if interface_id != shared.registry.interface_id() {
            warn!(
                "received a message for interface {} instead of {} from {} (proc id = {})",
                interface_id,
                shared.registry.interface_id(),
                peer,
                proc_id
            );
            break;
        }
        info!("\t← call {} proc {} from {}", header.call_id, proc_id, peer);

        let dropped = shared.should_drop(proc_id);
        lock(&shared.received).push(ReceivedRequest {
            call_id: header.call_id,
            proc_id,
            data_len: frame.data.len(),
            dropped,
        });
        if dropped {
            continue;
        }

        let (error, message, data) = match shared.registry.execute(proc_id, frame.message, frame.data)
        {
            Some(Ok((message, data))) => (None, message, data),
            Some(Err(err)) => (Some(err), Bytes::new(), Bytes::new()),
            None => {
                warn!("no operation with proc id {} (call {})", proc_id, header.call_id);
                let err = error_response(
                    ErrorType::InvalidProcId,
                    PosixErrno::PosixErrorNone,
                    format!("proc id {} is not implemented", proc_id),
                );
                (Some(err), Bytes::new(), Bytes::new())
            }
        };

        let response = RpcHeader::response(header.call_id, error);
        framedwrite
            .send(Frame::new(response.encode_to_vec().into(), message, data))
            .await?;
        info!("\t→ call {} to {}", header.call_id, peer);
    }

    debug!("session with {} closed", peer);
    Ok(())
}
