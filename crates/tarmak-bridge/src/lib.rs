//! Privileged-operation bridge between sandboxed plugins and the Tarmak host.
//!
//! A plugin running inside a sandbox cannot reach the host's live state
//! directly. The bridge gives it a local Unix socket whose connections are
//! carried, one channel each, over a single multiplexed byte stream (for
//! example a container exec's stdio) to an RPC server on the host.
//!
//! # Crate Structure
//!
//! - [`transport`]: Unix sockets, process stdio and child pipes
//! - [`mux`]: frame codec, sessions, channels and the local socket proxy
//! - [`rpc`]: procedure catalog, RPC server and client, host service

/// Re-export transport types.
pub mod transport {
    pub use tarmak_transport::*;
}

/// Re-export multiplexer types.
pub mod mux {
    pub use tarmak_mux::*;
}

/// Re-export RPC types.
pub mod rpc {
    pub use tarmak_rpc::*;
}
