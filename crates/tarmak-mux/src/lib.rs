//! Many logical byte streams over one duplex transport.
//!
//! A [`Session`] owns one transport (a child's stdio, our own stdio, or a
//! single socket) and carries any number of [`Channel`]s over it. Each
//! channel behaves like a connection: ordered, reliable, full duplex.
//!
//! Every unit on the wire is a frame:
//! - a 4-byte big-endian channel id
//! - a 4-byte big-endian word with the flags in the top byte and the payload
//!   length in the low 24 bits
//! - the payload
//!
//! The [`Proxy`] exposes a session's channels to local clients as ordinary
//! Unix socket connections.

pub mod channel;
pub mod codec;
pub mod error;
pub mod proxy;
pub mod session;

pub use channel::Channel;
pub use codec::{
    decode_frame, encode_frame, Flags, Frame, MuxCodec, FRAGMENT_SIZE, HEADER_SIZE, MAX_PAYLOAD,
};
pub use error::{MuxError, Result};
pub use proxy::{Proxy, ShutdownHandle};
pub use session::{Role, Session, SessionConfig};
