//! Serialize/deserialize RPC frames into/from binary.
//!
//! Every frame, in both directions, is
//!
//! ```text
//! [record marker: header_len(u32 BE) message_len(u32 BE) data_len(u32 BE)]
//! [header_len bytes: RpcHeader]
//! [message_len bytes: request/response message]
//! [data_len bytes: opaque payload]
//! ```

use crate::io_err;
use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use std::io::Result;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound for the sum of the three parts of a frame.
///
/// A record marker announcing more than this is treated as a broken stream.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Fixed-size length prefix of a frame
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordMarker {
    header_len: u32,
    message_len: u32,
    data_len: u32,
}

impl RecordMarker {
    /// Size of a serialized record marker in bytes
    pub const SIZE: usize = 12;

    pub fn new(header_len: u32, message_len: u32, data_len: u32) -> RecordMarker {
        RecordMarker {
            header_len,
            message_len,
            data_len,
        }
    }

    /// Same as [`RecordMarker::SIZE`]
    pub const fn get_size() -> usize {
        Self::SIZE
    }

    pub fn header_len(&self) -> u32 {
        self.header_len
    }

    pub fn message_len(&self) -> u32 {
        self.message_len
    }

    pub fn data_len(&self) -> u32 {
        self.data_len
    }

    /// Number of bytes following the marker
    pub fn body_len(&self) -> usize {
        self.header_len as usize + self.message_len as usize + self.data_len as usize
    }

    /// Parse a marker from the first [`RecordMarker::SIZE`] bytes of `buf`.
    ///
    /// Panics if `buf` is shorter than that.
    pub fn parse(buf: &[u8]) -> RecordMarker {
        RecordMarker {
            header_len: BigEndian::read_u32(&buf[0..4]),
            message_len: BigEndian::read_u32(&buf[4..8]),
            data_len: BigEndian::read_u32(&buf[8..12]),
        }
    }

    /// Serialize into the first [`RecordMarker::SIZE`] bytes of `buf`.
    pub fn serialize(&self, buf: &mut [u8]) {
        BigEndian::write_u32(&mut buf[0..4], self.header_len);
        BigEndian::write_u32(&mut buf[4..8], self.message_len);
        BigEndian::write_u32(&mut buf[8..12], self.data_len);
    }
}

/// One RPC frame with its three parts
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    /// Serialized `RpcHeader`
    pub header: Bytes,
    /// Serialized request or response message
    pub message: Bytes,
    /// Opaque payload, e.g. file content
    pub data: Bytes,
}

impl Frame {
    pub fn new(header: Bytes, message: Bytes, data: Bytes) -> Frame {
        Frame {
            header,
            message,
            data,
        }
    }

    /// Serialize a header and a message into a frame.
    pub fn encode<H: Message, M: Message>(header: &H, message: &M, data: Bytes) -> Frame {
        Frame {
            header: header.encode_to_vec().into(),
            message: message.encode_to_vec().into(),
            data,
        }
    }

    /// Record marker describing this frame.
    ///
    /// Only meaningful for frames within [`MAX_FRAME_LEN`].
    pub fn marker(&self) -> RecordMarker {
        RecordMarker::new(
            self.header.len() as u32,
            self.message.len() as u32,
            self.data.len() as u32,
        )
    }

    /// Total number of bytes on the wire, including the marker
    pub fn wire_len(&self) -> usize {
        RecordMarker::SIZE + self.header.len() + self.message.len() + self.data.len()
    }
}

/// Codec turning a byte stream into [`Frame`]s and back
#[derive(Clone, Copy, Debug)]
pub struct RecordCodec {
    max_frame_len: usize,
}

impl RecordCodec {
    pub fn new() -> RecordCodec {
        RecordCodec {
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> RecordCodec {
        RecordCodec { max_frame_len }
    }
}

impl Default for RecordCodec {
    fn default() -> Self {
        RecordCodec::new()
    }
}

impl Decoder for RecordCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < RecordMarker::SIZE {
            return Ok(None);
        }

        let marker = RecordMarker::parse(&src[..RecordMarker::SIZE]);
        let body_len = marker.body_len();
        if body_len > self.max_frame_len {
            return Err(io_err!(
                InvalidData,
                format!(
                    "record marker announces {} bytes, limit is {}",
                    body_len, self.max_frame_len
                )
            ));
        }

        let frame_len = RecordMarker::SIZE + body_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(RecordMarker::SIZE);
        let header = src.split_to(marker.header_len() as usize).freeze();
        let message = src.split_to(marker.message_len() as usize).freeze();
        let data = src.split_to(marker.data_len() as usize).freeze();

        Ok(Some(Frame {
            header,
            message,
            data,
        }))
    }
}

impl Encoder<Frame> for RecordCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let body_len = frame.wire_len() - RecordMarker::SIZE;
        if body_len > self.max_frame_len {
            return Err(io_err!(
                InvalidInput,
                format!("frame of {} bytes exceeds limit {}", body_len, self.max_frame_len)
            ));
        }

        let mut marker = [0u8; RecordMarker::SIZE];
        frame.marker().serialize(&mut marker);

        dst.reserve(frame.wire_len());
        dst.put_slice(&marker);
        dst.put_slice(&frame.header);
        dst.put_slice(&frame.message);
        dst.put_slice(&frame.data);
        Ok(())
    }
}

#[test]
fn record_marker_network_byte_order() {
    let mut buf = [0u8; RecordMarker::SIZE];
    RecordMarker::new(1, 0x0102, 0x01020304).serialize(&mut buf);
    assert_eq!(buf, [0, 0, 0, 1, 0, 0, 1, 2, 1, 2, 3, 4]);
    assert_eq!(RecordMarker::parse(&buf), RecordMarker::new(1, 0x0102, 0x01020304));
    assert_eq!(RecordMarker::get_size(), 12);
}

#[test]
fn codec_roundtrip_preserves_parts() {
    let expected = vec![
        Frame::new(
            Bytes::from_static(b"header"),
            Bytes::from_static(b"message"),
            Bytes::from_static(b"file content"),
        ),
        Frame::new(Bytes::from_static(b"h"), Bytes::new(), Bytes::new()),
        Frame::new(Bytes::from_static(b"hdr"), Bytes::from_static(b"m"), Bytes::new()),
    ];

    let mut codec = RecordCodec::new();
    let mut buf = BytesMut::new();
    for frame in &expected {
        codec.encode(frame.clone(), &mut buf).unwrap();
    }

    let mut actual = Vec::new();
    while let Some(frame) = codec.decode(&mut buf).unwrap() {
        actual.push(frame);
    }
    assert_eq!(expected, actual);
    assert!(buf.is_empty());
}

#[test]
fn codec_waits_for_complete_frame() {
    let frame = Frame::new(
        Bytes::from_static(b"header"),
        Bytes::from_static(b"message"),
        Bytes::from_static(b"data"),
    );
    let mut wire = BytesMut::new();
    RecordCodec::new().encode(frame.clone(), &mut wire).unwrap();

    let mut codec = RecordCodec::new();
    let mut buf = BytesMut::new();
    for (i, byte) in wire.iter().enumerate() {
        buf.put_u8(*byte);
        let decoded = codec.decode(&mut buf).unwrap();
        if i + 1 < wire.len() {
            assert!(decoded.is_none());
        } else {
            assert_eq!(decoded, Some(frame.clone()));
        }
    }
}

#[test]
fn codec_rejects_oversized_marker() {
    let mut buf = BytesMut::new();
    let mut marker = [0u8; RecordMarker::SIZE];
    RecordMarker::new(16, 16, 1024).serialize(&mut marker);
    buf.put_slice(&marker);

    let mut codec = RecordCodec::with_max_frame_len(64);
    assert!(codec.decode(&mut buf).is_err());
}
