use std::io;
use std::sync::Arc;

/// Errors that can occur on a session or one of its channels.
///
/// Cloneable so the error that ended a session can be handed to every
/// waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MuxError {
    /// An I/O error occurred on the underlying transport.
    #[error("multiplexer I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// The payload exceeds the 24-bit length field or the configured maximum.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The frame header carries flag bits outside SYN and RST.
    #[error("invalid frame flags {0:#04x}")]
    InvalidFlags(u8),

    /// A frame arrived for a channel that is not open, without SYN.
    #[error("frame for unknown channel {0} without SYN")]
    UnknownChannel(u32),

    /// The peer opened a channel id from our half of the id space.
    #[error("peer opened channel {0} outside its id space")]
    ForeignChannelId(u32),

    /// The transport ended in the middle of a frame.
    #[error("transport closed mid-frame ({remaining} bytes buffered)")]
    Truncated { remaining: usize },

    /// The transport reached end-of-stream.
    #[error("transport closed")]
    ConnectionClosed,

    /// The session was closed locally.
    #[error("session closed")]
    SessionClosed,

    /// The channel was closed, locally or by the peer.
    #[error("channel {0} closed")]
    ChannelClosed(u32),
}

impl MuxError {
    /// Whether this error ends a session in an orderly way.
    ///
    /// Orderly endings give channels end-of-stream; everything else is
    /// reported to readers as an error once their buffered data is consumed.
    pub fn is_clean(&self) -> bool {
        matches!(self, MuxError::ConnectionClosed | MuxError::SessionClosed)
    }

    /// Whether this error means the framing state can no longer be trusted.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            MuxError::PayloadTooLarge { .. }
                | MuxError::InvalidFlags(_)
                | MuxError::UnknownChannel(_)
                | MuxError::ForeignChannelId(_)
                | MuxError::Truncated { .. }
        )
    }
}

impl From<io::Error> for MuxError {
    fn from(err: io::Error) -> Self {
        MuxError::Io(Arc::new(err))
    }
}

impl From<MuxError> for io::Error {
    fn from(err: MuxError) -> Self {
        let kind = match &err {
            MuxError::Io(inner) => inner.kind(),
            MuxError::Truncated { .. } => io::ErrorKind::UnexpectedEof,
            MuxError::ConnectionClosed | MuxError::SessionClosed => io::ErrorKind::NotConnected,
            MuxError::ChannelClosed(_) => io::ErrorKind::BrokenPipe,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}

pub type Result<T> = std::result::Result<T, MuxError>;
