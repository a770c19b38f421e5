use std::fmt;

use thiserror::Error;

/// Why a session ended. Recorded once; later close attempts are no-ops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Requested by this side.
    Local(String),
    /// The peer sent `go_away`.
    Remote(String),
    Transport(String),
    Protocol(String),
    KeepaliveTimeout,
}

impl CloseReason {
    /// Whether the owner asked for the close (no reconnect wanted).
    pub fn is_requested(&self) -> bool {
        matches!(self, CloseReason::Local(_))
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local(r) => write!(f, "closed locally: {r}"),
            CloseReason::Remote(r) => write!(f, "closed by peer: {r}"),
            CloseReason::Transport(r) => write!(f, "transport: {r}"),
            CloseReason::Protocol(r) => write!(f, "protocol violation: {r}"),
            CloseReason::KeepaliveTimeout => write!(f, "keepalive timeout"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum TunnelError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Deliberately carries no detail: unknown user and wrong secret look the same.
    #[error("authentication failed")]
    Auth,
    #[error("not authorized: {0}")]
    Authorization(String),
    #[error("bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
    #[error("stream closed")]
    StreamClosed,
    #[error("stream refused by peer")]
    StreamRefused,
    #[error("stream ids exhausted")]
    IdsExhausted,
    #[error("session closed ({0})")]
    SessionClosed(CloseReason),
    #[error("timed out: {0}")]
    Timeout(&'static str),
}

impl TunnelError {
    /// Short tag used in handshake results and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelError::Transport(_) => "transport",
            TunnelError::Protocol(_) => "protocol",
            TunnelError::Auth => "auth",
            TunnelError::Authorization(_) => "authorization",
            TunnelError::Bind { .. } => "bind",
            TunnelError::StreamClosed => "stream_closed",
            TunnelError::StreamRefused => "stream_refused",
            TunnelError::IdsExhausted => "ids_exhausted",
            TunnelError::SessionClosed(_) => "session_closed",
            TunnelError::Timeout(_) => "timeout",
        }
    }
}

impl From<TunnelError> for std::io::Error {
    fn from(err: TunnelError) -> Self {
        use std::io::ErrorKind;
        let kind = match &err {
            TunnelError::StreamClosed => ErrorKind::BrokenPipe,
            TunnelError::StreamRefused => ErrorKind::ConnectionRefused,
            TunnelError::SessionClosed(_) => ErrorKind::ConnectionAborted,
            TunnelError::Timeout(_) => ErrorKind::TimedOut,
            TunnelError::Bind { .. } => ErrorKind::AddrInUse,
            TunnelError::Auth | TunnelError::Authorization(_) => ErrorKind::PermissionDenied,
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}
