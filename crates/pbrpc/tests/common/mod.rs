#![allow(dead_code)]

use {
    bytes::Bytes,
    futures::SinkExt,
    pbrpc::{
        ErrorResponse, ErrorType, Frame, PosixErrno, RecordCodec, RpcHeader, error_response,
        testsrv::{OperationRegistry, TestServer},
    },
    prost::Message,
    std::time::Duration,
    tokio::net::{
        TcpListener,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedRead, FramedWrite},
};

pub const INTERFACE_ID: u32 = 20001;
pub const PROC_ECHO: u32 = 1;
pub const PROC_DENIED: u32 = 2;
pub const PROC_SLOW_ECHO: u32 = 3;

#[derive(Clone, PartialEq, Message)]
pub struct EchoRequest {
    #[prost(string, tag = "1")]
    pub text: String,
    #[prost(uint32, tag = "2")]
    pub delay_ms: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct EchoResponse {
    #[prost(string, tag = "1")]
    pub text: String,
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn echo(text: &str) -> EchoRequest {
    EchoRequest {
        text: text.to_owned(),
        delay_ms: 0,
    }
}

pub fn registry() -> OperationRegistry {
    let mut registry = OperationRegistry::new(INTERFACE_ID);
    registry
        .register(PROC_ECHO, |request: EchoRequest, data: Bytes| {
            Ok((EchoResponse { text: request.text }, data))
        })
        .register(
            PROC_DENIED,
            |_: EchoRequest, _: Bytes| -> Result<(EchoResponse, Bytes), ErrorResponse> {
                Err(error_response(
                    ErrorType::Errno,
                    PosixErrno::PosixErrorEacces,
                    "permission denied",
                ))
            },
        )
        .register(PROC_SLOW_ECHO, |request: EchoRequest, data: Bytes| {
            std::thread::sleep(Duration::from_millis(u64::from(request.delay_ms)));
            Ok((EchoResponse { text: request.text }, data))
        });
    registry
}

pub async fn start_server() -> TestServer {
    let mut server = TestServer::bind("127.0.0.1:0", registry()).await.unwrap();
    server.start();
    server
}

/// A free local port nobody listens on.
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Server end of a connection, driven by hand.
pub struct RawPeer {
    reader: FramedRead<OwnedReadHalf, RecordCodec>,
    writer: FramedWrite<OwnedWriteHalf, RecordCodec>,
}

impl RawPeer {
    pub async fn accept(listener: &TcpListener) -> RawPeer {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, writer) = stream.into_split();
        RawPeer {
            reader: FramedRead::new(reader, RecordCodec::new()),
            writer: FramedWrite::new(writer, RecordCodec::new()),
        }
    }

    /// Read the next `count` requests.
    pub async fn read_requests(&mut self, count: usize) -> Vec<(RpcHeader, EchoRequest)> {
        let mut requests = Vec::new();
        while requests.len() < count {
            let frame = self.reader.next().await.unwrap().unwrap();
            let header = RpcHeader::decode(frame.header).unwrap();
            let message = EchoRequest::decode(frame.message).unwrap();
            requests.push((header, message));
        }
        requests
    }

    pub async fn send(&mut self, frame: Frame) {
        self.writer.send(frame).await.unwrap();
    }
}

pub fn response_frame(call_id: u32, text: &str) -> Frame {
    Frame::encode(
        &RpcHeader::response(call_id, None),
        &EchoResponse {
            text: text.to_owned(),
        },
        Bytes::new(),
    )
}
