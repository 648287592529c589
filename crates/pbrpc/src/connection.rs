//! State machine of the connection to one server address.
//!
//! A connection is driven exclusively by the event loop. Everything that may
//! block (resolving, connecting, reading, writing) runs in a spawned task that
//! reports back through an [`Event`]. Every event carries the epoch of the
//! channel it belongs to; the loop drops events whose epoch is no longer
//! current, so a task outliving its channel never touches the connection.

use {
    crate::{
        backoff::{INITIAL_RECONNECT_INTERVAL, ReconnectBackoff},
        channel::{SocketChannel, Transport},
        frame::{Frame, RecordCodec},
        io_err,
        proto::{ErrorType, PosixErrno, RpcHeader, error_response},
        request::RequestTable,
    },
    futures::SinkExt,
    log::{debug, error, info, warn},
    std::{
        collections::{BTreeSet, VecDeque},
        future::Future,
        io,
        net::SocketAddr,
        time::{Duration, Instant},
    },
    tokio::{
        io::{ReadHalf, WriteHalf},
        net,
        sync::mpsc,
        task::JoinHandle,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedRead, FramedWrite},
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    /// No channel, or a channel with nothing being written
    Idle,
    Connecting,
    /// A request is being written
    Active,
    /// The last attempt failed, the next one is delayed
    WaitForReconnect,
    /// Closed locally, never used again
    Closed,
}

/// Completion of an I/O task, addressed to one connection and channel.
#[derive(Debug)]
pub(crate) struct Event {
    pub(crate) address: String,
    pub(crate) epoch: u64,
    pub(crate) kind: EventKind,
}

#[derive(Debug)]
pub(crate) enum EventKind {
    Resolved(io::Result<Vec<SocketAddr>>),
    Connected(SocketAddr, io::Result<SocketChannel>),
    ConnectTimedOut,
    Written(io::Result<()>),
    Received(io::Result<Frame>),
}

/// What connections share: the way back to the loop and how to connect.
pub(crate) struct Reactor {
    events: mpsc::UnboundedSender<Event>,
    transport: Transport,
    connect_timeout: Duration,
    max_reconnect_interval: Duration,
    next_epoch: u64,
}

impl Reactor {
    pub(crate) fn new(
        events: mpsc::UnboundedSender<Event>,
        transport: Transport,
        connect_timeout: Duration,
        max_reconnect_interval: Duration,
    ) -> Reactor {
        Reactor {
            events,
            transport,
            connect_timeout,
            max_reconnect_interval,
            next_epoch: 0,
        }
    }

    pub(crate) fn transport(&self) -> &Transport {
        &self.transport
    }

    fn next_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }
}

pub(crate) struct ClientConnection {
    address: String,
    host: String,
    port: u16,
    state: ConnectionState,
    /// Identifies the current channel, see [`Event`]
    epoch: u64,
    /// Requests not yet written, in submission order
    pending: VecDeque<u32>,
    writing: Option<u32>,
    /// Written requests waiting for their response
    awaiting: BTreeSet<u32>,
    /// Resolved endpoints not tried yet
    endpoints: VecDeque<SocketAddr>,
    endpoint: Option<SocketAddr>,
    writer: Option<mpsc::UnboundedSender<Frame>>,
    tasks: Vec<JoinHandle<()>>,
    backoff: ReconnectBackoff,
    last_used: Instant,
}

impl ClientConnection {
    pub(crate) fn new(address: String, host: String, port: u16, rt: &mut Reactor) -> Self {
        ClientConnection {
            address,
            host,
            port,
            state: ConnectionState::Idle,
            epoch: rt.next_epoch(),
            pending: VecDeque::new(),
            writing: None,
            awaiting: BTreeSet::new(),
            endpoints: VecDeque::new(),
            endpoint: None,
            writer: None,
            tasks: Vec::new(),
            backoff: ReconnectBackoff::new(INITIAL_RECONNECT_INTERVAL, rt.max_reconnect_interval),
            last_used: Instant::now(),
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Queue `call_id` for sending.
    pub(crate) fn add_request(&mut self, call_id: u32) {
        self.last_used = Instant::now();
        self.pending.push_back(call_id);
    }

    /// Drop every reference to a request that terminated elsewhere.
    pub(crate) fn forget(&mut self, call_id: u32) {
        self.pending.retain(|id| *id != call_id);
        self.awaiting.remove(&call_id);
        if self.writing == Some(call_id) {
            // The frame is already on its way; the write completion finds
            // nothing to move to `awaiting`.
            self.writing = None;
        }
    }

    /// Make progress on queued requests according to the current state.
    pub(crate) fn do_process(&mut self, rt: &mut Reactor, requests: &mut RequestTable) {
        match self.state {
            ConnectionState::Idle => {
                if self.writer.is_some() {
                    self.send_next(requests);
                } else {
                    self.connect(rt);
                }
            }
            ConnectionState::WaitForReconnect => {
                if self.backoff.may_attempt(Instant::now()) {
                    self.backoff.attempt();
                    self.connect(rt);
                } else {
                    self.send_error(
                        requests,
                        ErrorType::IoError,
                        PosixErrno::PosixErrorEio,
                        format!(
                            "cannot connect to server '{}', reconnect blocked locally to avoid flooding",
                            self.address
                        ),
                    );
                }
            }
            ConnectionState::Closed => self.send_error(
                requests,
                ErrorType::IoError,
                PosixErrno::PosixErrorEio,
                format!("connection to '{}' closed locally", self.address),
            ),
            ConnectionState::Connecting | ConnectionState::Active => {}
        }
    }

    pub(crate) fn on_event(&mut self, kind: EventKind, rt: &mut Reactor, requests: &mut RequestTable) {
        match kind {
            EventKind::Resolved(result) => self.on_resolved(result, rt, requests),
            EventKind::Connected(endpoint, result) => {
                self.on_connected(endpoint, result, rt, requests)
            }
            EventKind::ConnectTimedOut => {
                self.reset(rt);
                self.send_error(
                    requests,
                    ErrorType::IoError,
                    PosixErrno::PosixErrorEio,
                    format!("connection to '{}' timed out", self.address),
                );
            }
            EventKind::Written(result) => self.on_written(result, rt, requests),
            EventKind::Received(result) => self.on_received(result, rt, requests),
        }
    }

    /// Close the connection and fail everything it still holds.
    pub(crate) fn close(&mut self, requests: &mut RequestTable) {
        self.abort_tasks();
        self.state = ConnectionState::Closed;
        self.send_error(
            requests,
            ErrorType::IoError,
            PosixErrno::PosixErrorEio,
            format!("connection to '{}' closed locally", self.address),
        );
    }

    fn connect(&mut self, rt: &mut Reactor) {
        self.state = ConnectionState::Connecting;
        debug!("connecting to {}", self.address);

        let host = self.host.clone();
        let port = self.port;
        let timeout = rt.connect_timeout;
        self.spawn(rt, async move {
            match tokio::time::timeout(timeout, net::lookup_host((host.as_str(), port))).await {
                Ok(Ok(endpoints)) => EventKind::Resolved(Ok(endpoints.collect())),
                Ok(Err(e)) => EventKind::Resolved(Err(e)),
                Err(_) => EventKind::ConnectTimedOut,
            }
        });
    }

    fn on_resolved(
        &mut self,
        result: io::Result<Vec<SocketAddr>>,
        rt: &mut Reactor,
        requests: &mut RequestTable,
    ) {
        match result {
            Ok(endpoints) if endpoints.is_empty() => {
                self.reset(rt);
                self.send_error(
                    requests,
                    ErrorType::IoError,
                    PosixErrno::PosixErrorEinval,
                    format!("cannot resolve hostname: '{}'", self.address),
                );
            }
            Ok(endpoints) => {
                self.endpoints = endpoints.into();
                self.try_next_endpoint(rt);
            }
            Err(e) => {
                self.reset(rt);
                self.send_error(
                    requests,
                    ErrorType::IoError,
                    PosixErrno::PosixErrorEio,
                    format!("could not connect to '{}': {}", self.address, e),
                );
            }
        }
    }

    fn try_next_endpoint(&mut self, rt: &mut Reactor) {
        let Some(endpoint) = self.endpoints.pop_front() else {
            return;
        };
        debug!("trying endpoint {} of {}", endpoint, self.address);

        let transport = rt.transport.clone();
        let host = self.host.clone();
        let timeout = rt.connect_timeout;
        self.spawn(rt, async move {
            match tokio::time::timeout(timeout, transport.connect(&host, endpoint)).await {
                Ok(result) => EventKind::Connected(endpoint, result),
                Err(_) => EventKind::ConnectTimedOut,
            }
        });
    }

    fn on_connected(
        &mut self,
        endpoint: SocketAddr,
        result: io::Result<SocketChannel>,
        rt: &mut Reactor,
        requests: &mut RequestTable,
    ) {
        let channel = match result {
            Ok(channel) => channel,
            Err(e) if !self.endpoints.is_empty() => {
                debug!("connect to {} failed: {}, trying next endpoint", endpoint, e);
                self.new_channel(rt);
                self.try_next_endpoint(rt);
                return;
            }
            Err(e) => {
                self.reset(rt);
                self.send_error(
                    requests,
                    ErrorType::IoError,
                    PosixErrno::PosixErrorEio,
                    format!("could not connect to host name '{}': {}", self.host, e),
                );
                return;
            }
        };

        info!("connected to {} ({})", self.address, endpoint);
        self.backoff.succeeded();
        self.endpoints.clear();
        self.endpoint = Some(endpoint);
        self.state = ConnectionState::Idle;

        let (read_half, write_half) = tokio::io::split(channel);
        self.spawn_reader(rt, read_half);
        self.spawn_writer(rt, write_half);

        if !self.pending.is_empty() {
            self.send_next(requests);
        }
    }

    /// Start writing the oldest queued request that is still outstanding.
    fn send_next(&mut self, requests: &mut RequestTable) {
        while let Some(call_id) = self.pending.pop_front() {
            let Some(request) = requests.get(call_id) else {
                continue;
            };
            let Some(writer) = &self.writer else {
                self.pending.push_front(call_id);
                return;
            };
            if writer.send(request.frame().clone()).is_err() {
                // The writer task is gone; its completion event resets the connection.
                self.pending.push_front(call_id);
                return;
            }
            self.writing = Some(call_id);
            self.state = ConnectionState::Active;
            return;
        }
        self.state = ConnectionState::Idle;
    }

    fn on_written(&mut self, result: io::Result<()>, rt: &mut Reactor, requests: &mut RequestTable) {
        if let Err(e) = result {
            self.reset(rt);
            self.send_error(
                requests,
                ErrorType::IoError,
                PosixErrno::PosixErrorEio,
                format!("could not send request to '{}': {}", self.address, e),
            );
            return;
        }

        if let Some(call_id) = self.writing.take() {
            if requests.contains(call_id) {
                self.awaiting.insert(call_id);
            }
        }
        self.state = ConnectionState::Idle;
        self.send_next(requests);
    }

    fn on_received(
        &mut self,
        result: io::Result<Frame>,
        rt: &mut Reactor,
        requests: &mut RequestTable,
    ) {
        let frame = match result {
            Ok(frame) => frame,
            Err(e) => {
                self.reset(rt);
                self.send_error(
                    requests,
                    ErrorType::IoError,
                    PosixErrno::PosixErrorEio,
                    format!("could not read response from '{}': {}", self.address, e),
                );
                return;
            }
        };
        self.last_used = Instant::now();

        let mut header = match RpcHeader::parse(frame.header.clone()) {
            Ok(header) => header,
            Err(e) => {
                debug!("cannot parse response header from {}: {}", self.address, e);
                self.reset(rt);
                self.send_error(
                    requests,
                    ErrorType::GarbageArgs,
                    PosixErrno::PosixErrorEinval,
                    format!("received garbage header from '{}', closing connection", self.address),
                );
                return;
            }
        };

        let call_id = header.call_id;
        self.awaiting.remove(&call_id);
        let Some(request) = requests.remove(call_id) else {
            warn!(
                "received response for unknown request id {} from {}",
                call_id, self.address
            );
            return;
        };
        // A response may overtake the completion of its own write.
        if self.writing == Some(call_id) {
            self.writing = None;
        }

        match header.error_response.take() {
            Some(err) => request.fail(err),
            None => request.complete(header, frame.message, frame.data),
        }
    }

    /// Drop the channel and delay the next connect attempt.
    fn reset(&mut self, rt: &mut Reactor) {
        self.new_channel(rt);
        self.endpoints.clear();
        let endpoint = self.endpoint.take();
        self.state = ConnectionState::WaitForReconnect;
        let delay = self.backoff.failed(Instant::now());
        debug!(
            "connection to {} ({:?}) reset, next attempt in {:?} (failure {})",
            self.address,
            endpoint,
            delay,
            self.backoff.failures()
        );
    }

    /// Fail every request still held by this connection.
    fn send_error(
        &mut self,
        requests: &mut RequestTable,
        error_type: ErrorType,
        posix_errno: PosixErrno,
        message: String,
    ) {
        let held: Vec<u32> = self
            .awaiting
            .iter()
            .copied()
            .chain(self.writing.take())
            .chain(self.pending.iter().copied())
            .collect();
        self.awaiting.clear();
        self.pending.clear();

        let err = error_response(error_type, posix_errno, message);
        let mut failed = 0;
        for call_id in held {
            if let Some(request) = requests.remove(call_id) {
                request.fail(err.clone());
                failed += 1;
            }
        }
        if failed > 0 {
            error!(
                "operation failed for {} request(s) to {}: {}",
                failed,
                self.address,
                err.error_message()
            );
        }
    }

    /// Abort the tasks of the current channel and start a new epoch.
    fn new_channel(&mut self, rt: &mut Reactor) {
        self.abort_tasks();
        self.epoch = rt.next_epoch();
    }

    fn abort_tasks(&mut self) {
        self.writer = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn spawn<F>(&mut self, rt: &Reactor, task: F)
    where
        F: Future<Output = EventKind> + Send + 'static,
    {
        let events = rt.events.clone();
        let address = self.address.clone();
        let epoch = self.epoch;
        self.tasks.push(tokio::spawn(async move {
            let kind = task.await;
            // The loop is gone when sending fails; nothing left to report to.
            let _ = events.send(Event {
                address,
                epoch,
                kind,
            });
        }));
    }

    fn spawn_reader(&mut self, rt: &Reactor, read_half: ReadHalf<SocketChannel>) {
        let events = rt.events.clone();
        let address = self.address.clone();
        let epoch = self.epoch;
        self.tasks.push(tokio::spawn(async move {
            let mut framed = FramedRead::new(read_half, RecordCodec::new());
            loop {
                let result = match framed.next().await {
                    Some(result) => result,
                    None => Err(io_err!(UnexpectedEof, "connection closed by peer")),
                };
                let failed = result.is_err();
                let event = Event {
                    address: address.clone(),
                    epoch,
                    kind: EventKind::Received(result),
                };
                if events.send(event).is_err() || failed {
                    break;
                }
            }
        }));
    }

    fn spawn_writer(&mut self, rt: &Reactor, write_half: WriteHalf<SocketChannel>) {
        let (tx, mut frames) = mpsc::unbounded_channel::<Frame>();
        self.writer = Some(tx);

        let events = rt.events.clone();
        let address = self.address.clone();
        let epoch = self.epoch;
        self.tasks.push(tokio::spawn(async move {
            let mut framed = FramedWrite::new(write_half, RecordCodec::new());
            while let Some(frame) = frames.recv().await {
                let result = framed.send(frame).await;
                let failed = result.is_err();
                let event = Event {
                    address: address.clone(),
                    epoch,
                    kind: EventKind::Written(result),
                };
                if events.send(event).is_err() || failed {
                    return;
                }
            }
            let _ = framed.close().await;
        }));
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
