//! Local transports for the tarmak bridge.
//!
//! Two kinds of byte pipes are provided:
//! - Unix domain sockets, used by the RPC server, the RPC client and the
//!   local socket proxy
//! - Process stdio, either our own (sandboxed connector side) or a spawned
//!   child's (host side)
//!
//! This is the lowest layer. The multiplexer and the RPC layer build on the
//! streams handed out here.

pub mod error;
pub mod stdio;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use stdio::{stdio, ChildTransport};

#[cfg(unix)]
pub use uds::{connect, PeerCredentials, UnixSocketListener};
