use std::fmt;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::sluice::tunnel::frame::{Frame, FrameCodec, FrameError, FrameKind, MAX_FRAME_PAYLOAD};

/// Token carried in the HTTP `Upgrade` header.
pub const PROTOCOL_TOKEN: &str = "sluice-v1";
pub const PROTOCOL_VERSION: u32 = 1;

/// A control message travels in a single CONTROL frame.
pub const MAX_CONTROL_BYTES: usize = MAX_FRAME_PAYLOAD;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("control message too large: {0} bytes")]
    TooLarge(usize),
    #[error("unsupported protocol version {0}")]
    BadVersion(u32),
    #[error("expected {expected}, got {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },
    #[error("connection closed during handshake")]
    Closed,
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// A credential that never shows up in logs.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"***\"")
    }
}

/// Outcome of one requested spec, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecResult {
    pub spec: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SpecResult {
    pub fn accepted(spec: impl Into<String>) -> Self {
        Self {
            spec: spec.into(),
            accepted: true,
            error_kind: None,
            error: None,
        }
    }

    pub fn rejected(spec: impl Into<String>, kind: &str, error: impl fmt::Display) -> Self {
        Self {
            spec: spec.into(),
            accepted: false,
            error_kind: Some(kind.to_string()),
            error: Some(error.to_string()),
        }
    }
}

/// JSON payloads of non-empty CONTROL frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Hello {
        version: u32,
        #[serde(default)]
        client_version: String,
        #[serde(default)]
        user: String,
        #[serde(default)]
        secret: Secret,
        #[serde(default)]
        specs: Vec<String>,
    },
    Welcome {
        session_id: String,
        version: u32,
        keepalive_ms: u64,
        #[serde(default)]
        results: Vec<SpecResult>,
    },
    Rejected {
        reason: String,
    },
    GoAway {
        #[serde(default)]
        reason: String,
    },
}

impl ControlMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::Hello { .. } => "hello",
            ControlMessage::Welcome { .. } => "welcome",
            ControlMessage::Rejected { .. } => "rejected",
            ControlMessage::GoAway { .. } => "go_away",
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let b = serde_json::to_vec(self)?;
        if b.len() > MAX_CONTROL_BYTES {
            return Err(ProtocolError::TooLarge(b.len()));
        }
        Ok(Bytes::from(b))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() > MAX_CONTROL_BYTES {
            return Err(ProtocolError::TooLarge(payload.len()));
        }
        Ok(serde_json::from_slice(payload)?)
    }
}

pub async fn send_control<T>(
    framed: &mut Framed<T, FrameCodec>,
    msg: &ControlMessage,
) -> Result<(), ProtocolError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(Frame::control(msg.encode()?)).await?;
    Ok(())
}

/// Reads the next control message, skipping keepalives. Any other frame kind
/// before the handshake completes is an error.
pub async fn recv_control<T>(
    framed: &mut Framed<T, FrameCodec>,
) -> Result<ControlMessage, ProtocolError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = framed.next().await.ok_or(ProtocolError::Closed)??;
        if frame.kind != FrameKind::Control {
            return Err(ProtocolError::Unexpected {
                expected: "control frame",
                got: kind_name(frame.kind),
            });
        }
        if frame.is_keepalive() {
            continue;
        }
        return ControlMessage::decode(&frame.payload);
    }
}

fn kind_name(kind: FrameKind) -> &'static str {
    match kind {
        FrameKind::Control => "control frame",
        FrameKind::Open => "open frame",
        FrameKind::Data => "data frame",
        FrameKind::WindowUpdate => "window update frame",
        FrameKind::Close => "close frame",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed_pair() -> (
        Framed<tokio::io::DuplexStream, FrameCodec>,
        Framed<tokio::io::DuplexStream, FrameCodec>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Framed::new(a, FrameCodec), Framed::new(b, FrameCodec))
    }

    #[tokio::test]
    async fn hello_and_welcome_cross_the_wire() {
        let (mut c, mut s) = framed_pair();
        let hello = ControlMessage::Hello {
            version: PROTOCOL_VERSION,
            client_version: "0.1.0".into(),
            user: "alice".into(),
            secret: Secret::new("hunter2"),
            specs: vec!["R:8080:localhost:3000".into(), "5432".into()],
        };
        send_control(&mut c, &hello).await.unwrap();
        assert_eq!(recv_control(&mut s).await.unwrap(), hello);

        let welcome = ControlMessage::Welcome {
            session_id: "ab".repeat(16),
            version: PROTOCOL_VERSION,
            keepalive_ms: 25_000,
            results: vec![
                SpecResult::accepted("R:8080:localhost:3000"),
                SpecResult::rejected("5432", "authorization", "port 5432 not allowed"),
            ],
        };
        send_control(&mut s, &welcome).await.unwrap();
        assert_eq!(recv_control(&mut c).await.unwrap(), welcome);
    }

    #[test]
    fn wire_shape_is_tagged_json() {
        let b = ControlMessage::Rejected {
            reason: "authentication failed".into(),
        }
        .encode()
        .unwrap();
        let v: serde_json::Value = serde_json::from_slice(&b).unwrap();
        assert_eq!(v["type"], "rejected");
        assert_eq!(v["reason"], "authentication failed");

        let ok = serde_json::to_value(SpecResult::accepted("80")).unwrap();
        assert!(ok.get("error").is_none());
    }

    #[test]
    fn secret_is_redacted_in_debug_output() {
        let hello = ControlMessage::Hello {
            version: 1,
            client_version: String::new(),
            user: "bob".into(),
            secret: Secret::new("s3cr3t-value"),
            specs: vec![],
        };
        let dbg = format!("{hello:?}");
        assert!(!dbg.contains("s3cr3t-value"));
        assert!(dbg.contains("bob"));
    }

    #[tokio::test]
    async fn keepalives_are_skipped_and_data_is_rejected() {
        let (mut c, mut s) = framed_pair();
        c.send(Frame::keepalive()).await.unwrap();
        send_control(&mut c, &ControlMessage::GoAway { reason: "x".into() })
            .await
            .unwrap();
        assert!(matches!(
            recv_control(&mut s).await.unwrap(),
            ControlMessage::GoAway { .. }
        ));

        c.send(Frame::data(1, Bytes::from_static(b"early")))
            .await
            .unwrap();
        assert!(matches!(
            recv_control(&mut s).await,
            Err(ProtocolError::Unexpected { .. })
        ));
    }

    #[tokio::test]
    async fn eof_before_message_is_closed() {
        let (c, mut s) = framed_pair();
        drop(c);
        assert!(matches!(
            recv_control(&mut s).await,
            Err(ProtocolError::Closed)
        ));
    }

    #[test]
    fn oversized_payload_is_refused() {
        let big = vec![b' '; MAX_CONTROL_BYTES + 1];
        assert!(matches!(
            ControlMessage::decode(&big),
            Err(ProtocolError::TooLarge(_))
        ));
    }
}
