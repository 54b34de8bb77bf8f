//! The Tarmak procedure catalog and the RPC plumbing that carries it.
//!
//! Calls are JSON envelopes in length-delimited frames: a [`Request`] names
//! a procedure (`Tarmak.<Name>`) and carries its arguments, a [`Response`]
//! echoes the request's `seq` with either a result or an error message.
//!
//! The host runs an [`RpcServer`] over a [`ProcedureTable`], usually built
//! from a [`TarmakService`] with [`ProcedureTable::for_service`]. Inside
//! the sandbox an [`RpcClient`] dials the local socket exposed by the
//! multiplexer's proxy; every proxied connection becomes one channel and
//! ends up as one server connection on the host.

pub mod catalog;
pub mod client;
pub mod error;
pub mod server;
pub mod service;
pub mod state;
pub mod table;
pub mod wire;

pub use catalog::{Procedure, PROCEDURES, SERVICE_NAME};
pub use client::{RetryPolicy, RpcClient};
pub use error::{Result, RpcError};
pub use server::RpcServer;
pub use service::{CredentialBackend, HandlerRetry, HostService, Inventory, Phase, TarmakService};
pub use state::StateFile;
pub use table::ProcedureTable;
pub use wire::{Request, Response};
