//! Frame encoding/decoding for the multiplexed session.
//!
//! Every frame carries a fixed 10-byte header followed by its payload:
//!
//! ```text
//! +----------------+--------+--------+----------------+-----------------+
//! | stream_id (u32)| kind   | flags  | length (u32)   | payload[length] |
//! +----------------+--------+--------+----------------+-----------------+
//! ```
//!
//! All integers are big-endian. Stream 0 carries CONTROL frames only.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

pub const HEADER_LEN: usize = 10;
pub const MAX_FRAME_PAYLOAD: usize = 256 * 1024;
pub const CONTROL_STREAM_ID: u32 = 0;

pub const FLAG_ACK: u8 = 0x01;
pub const FLAG_RST: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Control = 0,
    Open = 1,
    Data = 2,
    WindowUpdate = 3,
    Close = 4,
}

impl FrameKind {
    fn allowed_flags(self) -> u8 {
        match self {
            FrameKind::Open => FLAG_ACK,
            FrameKind::Close => FLAG_RST,
            _ => 0,
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::Control),
            1 => Ok(FrameKind::Open),
            2 => Ok(FrameKind::Data),
            3 => Ok(FrameKind::WindowUpdate),
            4 => Ok(FrameKind::Close),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),
    #[error("flags {flags:#04x} not valid on {kind:?} frame")]
    BadFlags { kind: FrameKind, flags: u8 },
    #[error("frame payload too large: {0} bytes")]
    TooLarge(usize),
    #[error("{kind:?} frame not valid on stream {stream_id}")]
    BadStream { kind: FrameKind, stream_id: u32 },
    #[error("window update payload must be 4 bytes, got {0}")]
    BadWindowUpdate(usize),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Corrupt frames poison the byte stream; the connection must be dropped.
    pub fn is_corrupt(&self) -> bool {
        !matches!(self, FrameError::Io(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u32,
    pub kind: FrameKind,
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(stream_id: u32, kind: FrameKind, flags: u8, payload: Bytes) -> Self {
        Self {
            stream_id,
            kind,
            flags,
            payload,
        }
    }

    pub fn control(payload: Bytes) -> Self {
        Self::new(CONTROL_STREAM_ID, FrameKind::Control, 0, payload)
    }

    /// Zero-payload CONTROL frame.
    pub fn keepalive() -> Self {
        Self::control(Bytes::new())
    }

    pub fn open(stream_id: u32, target: &str) -> Self {
        Self::new(
            stream_id,
            FrameKind::Open,
            0,
            Bytes::copy_from_slice(target.as_bytes()),
        )
    }

    pub fn open_ack(stream_id: u32) -> Self {
        Self::new(stream_id, FrameKind::Open, FLAG_ACK, Bytes::new())
    }

    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self::new(stream_id, FrameKind::Data, 0, payload)
    }

    pub fn window_update(stream_id: u32, increment: u32) -> Self {
        let mut b = BytesMut::with_capacity(4);
        b.put_u32(increment);
        Self::new(stream_id, FrameKind::WindowUpdate, 0, b.freeze())
    }

    pub fn close(stream_id: u32) -> Self {
        Self::new(stream_id, FrameKind::Close, 0, Bytes::new())
    }

    pub fn reset(stream_id: u32) -> Self {
        Self::new(stream_id, FrameKind::Close, FLAG_RST, Bytes::new())
    }

    pub fn is_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }

    pub fn is_rst(&self) -> bool {
        self.flags & FLAG_RST != 0
    }

    pub fn is_keepalive(&self) -> bool {
        self.kind == FrameKind::Control && self.payload.is_empty()
    }

    /// Credit carried by a WINDOW_UPDATE frame (length validated on decode).
    pub fn window_increment(&self) -> u32 {
        let mut p = &self.payload[..];
        if p.len() < 4 {
            return 0;
        }
        p.get_u32()
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        validate(self.stream_id, self.kind, self.flags, self.payload.len())?;
        dst.reserve(self.encoded_len());
        dst.put_u32(self.stream_id);
        dst.put_u8(self.kind as u8);
        dst.put_u8(self.flags);
        dst.put_u32(self.payload.len() as u32);
        dst.extend_from_slice(&self.payload);
        Ok(())
    }

    /// Parses one frame off the front of `src`.
    ///
    /// `Ok(None)` means more bytes are needed. The header is fully validated
    /// before waiting for the payload, so an oversized length is rejected
    /// without buffering it.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut hdr = &src[..HEADER_LEN];
        let stream_id = hdr.get_u32();
        let kind = FrameKind::try_from(hdr.get_u8())?;
        let flags = hdr.get_u8();
        let len = hdr.get_u32() as usize;
        validate(stream_id, kind, flags, len)?;

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame {
            stream_id,
            kind,
            flags,
            payload,
        }))
    }
}

fn validate(stream_id: u32, kind: FrameKind, flags: u8, len: usize) -> Result<(), FrameError> {
    if len > MAX_FRAME_PAYLOAD {
        return Err(FrameError::TooLarge(len));
    }
    if flags & !kind.allowed_flags() != 0 {
        return Err(FrameError::BadFlags { kind, flags });
    }
    let on_control = stream_id == CONTROL_STREAM_ID;
    if on_control != (kind == FrameKind::Control) {
        return Err(FrameError::BadStream { kind, stream_id });
    }
    if kind == FrameKind::WindowUpdate && len != 4 {
        return Err(FrameError::BadWindowUpdate(len));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        Frame::decode(src)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        item.encode(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(f: &Frame) -> BytesMut {
        let mut b = BytesMut::new();
        f.encode(&mut b).unwrap();
        b
    }

    #[test]
    fn decode_waits_for_header_and_payload() {
        let full = encoded(&Frame::data(7, Bytes::from_static(b"hello world")));

        let mut buf = BytesMut::from(&full[..HEADER_LEN - 1]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[HEADER_LEN - 1..HEADER_LEN + 3]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        // nothing consumed while incomplete
        assert_eq!(buf.len(), HEADER_LEN + 3);

        buf.extend_from_slice(&full[HEADER_LEN + 3..]);
        let f = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(f.stream_id, 7);
        assert_eq!(f.kind, FrameKind::Data);
        assert_eq!(&f.payload[..], b"hello world");
        assert!(buf.is_empty());
    }

    #[test]
    fn frames_are_self_delimiting_on_a_continuous_stream() {
        let mut buf = BytesMut::new();
        Frame::open(1, "127.0.0.1:22").encode(&mut buf).unwrap();
        Frame::window_update(1, 4096).encode(&mut buf).unwrap();
        Frame::keepalive().encode(&mut buf).unwrap();
        Frame::reset(1).encode(&mut buf).unwrap();

        let a = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(a.kind, FrameKind::Open);
        assert_eq!(&a.payload[..], b"127.0.0.1:22");

        let b = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(b.window_increment(), 4096);

        let c = Frame::decode(&mut buf).unwrap().unwrap();
        assert!(c.is_keepalive());

        let d = Frame::decode(&mut buf).unwrap().unwrap();
        assert!(d.is_rst());
        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_length_is_rejected_from_header_alone() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(FrameKind::Data as u8);
        buf.put_u8(0);
        buf.put_u32((MAX_FRAME_PAYLOAD + 1) as u32);

        let err = Frame::decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(n) if n == MAX_FRAME_PAYLOAD + 1));
        assert!(err.is_corrupt());
    }

    #[test]
    fn corrupt_headers_are_rejected() {
        let mut unknown = BytesMut::new();
        unknown.put_u32(1);
        unknown.put_u8(9);
        unknown.put_u8(0);
        unknown.put_u32(0);
        assert!(matches!(
            Frame::decode(&mut unknown),
            Err(FrameError::UnknownKind(9))
        ));

        let mut data_on_zero = BytesMut::new();
        data_on_zero.put_u32(0);
        data_on_zero.put_u8(FrameKind::Data as u8);
        data_on_zero.put_u8(0);
        data_on_zero.put_u32(0);
        assert!(matches!(
            Frame::decode(&mut data_on_zero),
            Err(FrameError::BadStream { .. })
        ));

        let mut ack_on_data = BytesMut::new();
        ack_on_data.put_u32(5);
        ack_on_data.put_u8(FrameKind::Data as u8);
        ack_on_data.put_u8(FLAG_ACK);
        ack_on_data.put_u32(0);
        assert!(matches!(
            Frame::decode(&mut ack_on_data),
            Err(FrameError::BadFlags { .. })
        ));

        let mut short_update = BytesMut::new();
        short_update.put_u32(5);
        short_update.put_u8(FrameKind::WindowUpdate as u8);
        short_update.put_u8(0);
        short_update.put_u32(2);
        short_update.put_u16(1);
        assert!(matches!(
            Frame::decode(&mut short_update),
            Err(FrameError::BadWindowUpdate(2))
        ));
    }

    #[test]
    fn encode_refuses_control_off_stream_zero() {
        let f = Frame::new(3, FrameKind::Control, 0, Bytes::new());
        let mut b = BytesMut::new();
        assert!(f.encode(&mut b).is_err());
        assert!(b.is_empty());
    }
}
