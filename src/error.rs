use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Convenient type alias for `Result<T, TunnelError>`.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Error types surfaced by the tunnel engine.
///
/// A terminal error is recorded once per `FrameConn` (or per stream) and
/// observed by every waiter, so the variants are cheaply cloneable.
#[derive(Debug, Clone, Error)]
pub enum TunnelError {
    /// The peer closed the tunnel or the stream gracefully, or the
    /// `FrameConn` terminated without another recorded cause.
    #[error("end of stream")]
    EndOfStream,

    /// The peer reset this stream, or the local side reset it after a
    /// backpressure violation.
    #[error("connection reset")]
    ConnectionReset,

    /// The peer answered a Connect frame with a non-empty error payload.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The broker rejected this tunnel as not entitled.
    #[error("not a member")]
    NotMember,

    /// The broker asked for a teardown and reconnect.
    #[error("reload requested")]
    Reload,

    /// A second `Connect` was issued on a stream that already carries one.
    #[error("already connected")]
    AlreadyConnected,

    /// The ping or pong window expired.
    #[error("liveness timeout: {0}")]
    LivenessTimeout(String),

    /// Unknown opcode, malformed varint, or an unexpected stream ID.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The underlying transport failed to read or write.
    #[error("transport failure: {0}")]
    TransportFailure(Arc<io::Error>),
}

impl From<io::Error> for TunnelError {
    fn from(err: io::Error) -> Self {
        TunnelError::TransportFailure(Arc::new(err))
    }
}

impl TunnelError {
    /// Whether this error terminates the whole `FrameConn`.
    ///
    /// `ConnectFailed` only kills the stream that issued the Connect;
    /// everything else listed fatal here takes the tunnel down with it.
    pub fn is_fatal(&self) -> bool {
        match self {
            TunnelError::ConnectFailed(_)
            | TunnelError::ConnectionReset
            | TunnelError::AlreadyConnected => false,
            TunnelError::EndOfStream
            | TunnelError::NotMember
            | TunnelError::Reload
            | TunnelError::LivenessTimeout(_)
            | TunnelError::ProtocolError(_)
            | TunnelError::TransportFailure(_) => true,
        }
    }
}
