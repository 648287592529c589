//! Asynchronous RPC client.
//!
//! A [`Client`] is a cheap handle for submitting requests; the [`EventLoop`]
//! owns every connection and every outstanding request and is the only place
//! where they change. Completions (callbacks and futures) are invoked from
//! the event loop task. Only requests rejected up front (oversized, or
//! submitted after shutdown) complete before the submitting call returns.

use {
    crate::{
        channel::Transport,
        config::ClientOptions,
        connection::{ClientConnection, Event, Reactor},
        error::Error,
        frame::{Frame, MAX_FRAME_LEN, RecordMarker},
        io_err,
        proto::{Auth, ErrorResponse, ErrorType, PosixErrno, RpcHeader, UserCredentials, error_response},
        request::{ClientRequest, Completion, RequestTable, Response, ResponseFuture, completion},
        utils::{Result, parse_address},
    },
    bytes::Bytes,
    log::{debug, error, info},
    prost::Message,
    std::{
        collections::HashMap,
        sync::{
            Mutex,
            atomic::{AtomicBool, AtomicU32, Ordering},
        },
        time::Instant,
    },
    tokio::{
        sync::{mpsc, oneshot},
        task::JoinHandle,
        time::MissedTickBehavior,
    },
};

/// Snapshot of the event loop's bookkeeping
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Open connections, one per server address
    pub connections: usize,
    /// Requests submitted but not terminated yet
    pub pending_requests: usize,
}

enum Command {
    Submit(ClientRequest),
    Stats(oneshot::Sender<ClientStats>),
    Shutdown,
}

/// Handle for submitting requests to an [`EventLoop`].
///
/// `Client` is `Send + Sync`; share it between tasks with an `Arc`.
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    next_call_id: AtomicU32,
    closed: AtomicBool,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Create a client and the event loop serving it.
    ///
    /// Nothing happens until [`EventLoop::run`] is polled.
    pub fn new(options: ClientOptions) -> Result<(Client, EventLoop)> {
        let transport = Transport::from_options(options.ssl.as_ref())?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let reactor = Reactor::new(
            events_tx,
            transport,
            options.connect_timeout,
            options.max_reconnect_interval,
        );
        let client = Client {
            commands: commands_tx,
            next_call_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            event_loop: Mutex::new(None),
        };
        let event_loop = EventLoop {
            options,
            commands: commands_rx,
            events: events_rx,
            reactor,
            connections: HashMap::new(),
            requests: RequestTable::default(),
        };
        Ok((client, event_loop))
    }

    /// Create a client and spawn its event loop on the current tokio runtime.
    pub fn start(options: ClientOptions) -> Result<Client> {
        let (client, event_loop) = Client::new(options)?;
        let handle = tokio::spawn(event_loop.run());
        *lock(&client.event_loop) = Some(handle);
        Ok(client)
    }

    /// Send a request and wait for its response.
    ///
    /// `message` is serialized immediately; `data` is appended to the frame
    /// as opaque payload. Any failure, local or reported by the server,
    /// resolves the future with [`Error::Rpc`].
    #[allow(clippy::too_many_arguments)]
    pub fn send_request<Req, Resp>(
        &self,
        address: &str,
        interface_id: u32,
        proc_id: u32,
        user_creds: &UserCredentials,
        auth: &Auth,
        message: &Req,
        data: Bytes,
    ) -> ResponseFuture<Resp>
    where
        Req: Message,
        Resp: Message + Default + 'static,
    {
        let (completion, future) = ResponseFuture::channel();
        self.submit(
            address,
            interface_id,
            proc_id,
            user_creds,
            auth,
            message,
            data,
            completion,
        );
        future
    }

    /// Like [`Client::send_request`], but `callback` receives the result.
    ///
    /// The callback runs exactly once, on the event loop task.
    #[allow(clippy::too_many_arguments)]
    pub fn send_request_with_callback<Req, Resp, F>(
        &self,
        address: &str,
        interface_id: u32,
        proc_id: u32,
        user_creds: &UserCredentials,
        auth: &Auth,
        message: &Req,
        data: Bytes,
        callback: F,
    ) where
        Req: Message,
        Resp: Message + Default + 'static,
        F: FnOnce(Result<Response<Resp>>) + Send + 'static,
    {
        self.submit(
            address,
            interface_id,
            proc_id,
            user_creds,
            auth,
            message,
            data,
            completion::<Resp, F>(callback),
        );
    }

    /// Call ids increase by one per request and wrap around at `u32::MAX`.
    ///
    /// Ids are not checked against outstanding requests. A request still
    /// outstanding when its id comes around again is failed and logged.
    pub fn next_call_id(&self) -> u32 {
        self.next_call_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of connections and outstanding requests.
    pub async fn stats(&self) -> Result<ClientStats> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats(tx))
            .map_err(|_| io_err!(NotConnected, "client is shut down"))?;
        rx.await
            .map_err(|_| Error::from(io_err!(NotConnected, "client is shut down")))
    }

    /// Stop the event loop.
    ///
    /// Every request not terminated yet fails, all connections are closed and
    /// later submissions fail immediately. Waits for the loop to finish if it
    /// was spawned by [`Client::start`].
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // The loop may already be gone.
        let _ = self.commands.send(Command::Shutdown);

        let handle = lock(&self.event_loop).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("event loop terminated abnormally: {}", e);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn submit<Req: Message>(
        &self,
        address: &str,
        interface_id: u32,
        proc_id: u32,
        user_creds: &UserCredentials,
        auth: &Auth,
        message: &Req,
        data: Bytes,
        completion: Completion,
    ) {
        let call_id = self.next_call_id();
        let header = RpcHeader::request(
            call_id,
            interface_id,
            proc_id,
            user_creds.clone(),
            auth.clone(),
        );
        let frame = Frame::encode(&header, message, data);
        let body_len = frame.wire_len() - RecordMarker::SIZE;
        let request = ClientRequest::new(call_id, address.to_owned(), frame, completion);

        if body_len > MAX_FRAME_LEN {
            request.fail(error_response(
                ErrorType::IoError,
                PosixErrno::PosixErrorEinval,
                format!(
                    "request of {} bytes exceeds the frame limit of {} bytes",
                    body_len, MAX_FRAME_LEN
                ),
            ));
            return;
        }
        if self.closed.load(Ordering::SeqCst) {
            request.fail(shut_down());
            return;
        }
        if let Err(mpsc::error::SendError(Command::Submit(request))) =
            self.commands.send(Command::Submit(request))
        {
            request.fail(shut_down());
        }
    }
}

fn shut_down() -> ErrorResponse {
    error_response(
        ErrorType::IoError,
        PosixErrno::PosixErrorEio,
        "client is shut down",
    )
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The task doing all the work of a [`Client`].
pub struct EventLoop {
    options: ClientOptions,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<Event>,
    reactor: Reactor,
    connections: HashMap<String, ClientConnection>,
    requests: RequestTable,
}

impl EventLoop {
    /// Serve the client until it is shut down or dropped.
    pub async fn run(mut self) {
        info!(
            "rpc client running in {} mode",
            self.reactor.transport().name()
        );

        let mut timer = tokio::time::interval(self.options.timer_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Submit(request)) => self.send_internal_request(request),
                    Some(Command::Stats(tx)) => {
                        let _ = tx.send(self.stats());
                    }
                    Some(Command::Shutdown) | None => break,
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                _ = timer.tick() => self.handle_timeout(),
            }
        }

        self.shutdown_internal();
        info!("rpc client stopped");
    }

    fn stats(&self) -> ClientStats {
        ClientStats {
            connections: self.connections.len(),
            pending_requests: self.requests.len(),
        }
    }

    fn send_internal_request(&mut self, mut request: ClientRequest) {
        let address = request.address().to_owned();

        if !self.connections.contains_key(&address) {
            let Some((host, port)) = parse_address(&address) else {
                request.fail(error_response(
                    ErrorType::IoError,
                    PosixErrno::PosixErrorEinval,
                    format!("invalid address: {}", address),
                ));
                return;
            };
            debug!("new connection for {}", address);
            let connection =
                ClientConnection::new(address.clone(), host.to_owned(), port, &mut self.reactor);
            self.connections.insert(address.clone(), connection);
        }

        let call_id = request.call_id();
        request.request_sent();
        self.requests.insert(request);

        if let Some(connection) = self.connections.get_mut(&address) {
            connection.add_request(call_id);
            connection.do_process(&mut self.reactor, &mut self.requests);
        }
    }

    fn handle_event(&mut self, event: Event) {
        match self.connections.get_mut(&event.address) {
            Some(connection) if connection.epoch() == event.epoch => {
                connection.on_event(event.kind, &mut self.reactor, &mut self.requests)
            }
            _ => debug!("dropping stale event for {}", event.address),
        }
    }

    /// Fail requests past the request timeout and close idle connections.
    fn handle_timeout(&mut self) {
        let now = Instant::now();

        if let Some(deadline) = now.checked_sub(self.options.request_timeout) {
            for request in self.requests.take_expired(deadline) {
                debug!(
                    "request {} to {} timed out",
                    request.call_id(),
                    request.address()
                );
                if let Some(connection) = self.connections.get_mut(request.address()) {
                    connection.forget(request.call_id());
                }
                request.fail(error_response(
                    ErrorType::IoError,
                    PosixErrno::PosixErrorEinval,
                    "Request timed out",
                ));
            }
        }

        let linger = self.options.linger_timeout;
        let idle: Vec<String> = self
            .connections
            .iter()
            .filter(|(_, connection)| now.saturating_duration_since(connection.last_used()) > linger)
            .map(|(address, _)| address.clone())
            .collect();
        for address in idle {
            if let Some(mut connection) = self.connections.remove(&address) {
                debug!(
                    "closing connection to {} ({:?}), unused for more than {:?}",
                    address,
                    connection.state(),
                    linger
                );
                connection.close(&mut self.requests);
            }
        }
    }

    fn shutdown_internal(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Submit(request) => request.fail(shut_down()),
                Command::Stats(tx) => {
                    let _ = tx.send(self.stats());
                }
                Command::Shutdown => {}
            }
        }

        for (_, mut connection) in self.connections.drain() {
            connection.close(&mut self.requests);
        }
        for request in self.requests.drain() {
            request.fail(shut_down());
        }
    }
}
