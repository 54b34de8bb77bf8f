use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::catalog::{Ping, PingArgs, Procedure};
use crate::error::{Result, RpcError};
use crate::wire::{self, Request, Response, RpcFramed};

/// How long to keep dialing a socket that is not up yet.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Dial attempts, including the first.
    pub attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 20,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Upper bound on time spent sleeping before giving up.
    pub fn budget(&self) -> Duration {
        self.delay * self.attempts.saturating_sub(1)
    }
}

struct Connection {
    framed: RpcFramed<UnixStream>,
    last_seq: u64,
}

impl Connection {
    /// Send one request and read the reply that answers it.
    async fn exchange(&mut self, method: &str, params: Value) -> Result<Response> {
        self.last_seq += 1;
        let seq = self.last_seq;
        let request = Request {
            seq,
            method: method.to_string(),
            params,
        };
        debug!(procedure = method, seq, "calling");
        self.framed.send(wire::encode(&request)?).await?;

        let message = self.framed.next().await.ok_or(RpcError::Disconnected)??;
        let response: Response = wire::decode(&message)?;
        if response.seq != seq {
            return Err(RpcError::Protocol(format!(
                "reply {} does not match call {seq}",
                response.seq
            )));
        }
        Ok(response)
    }
}

/// Calls procedures on the host over one lazily dialed connection.
///
/// The first call (or [`connect`](Self::connect)) dials; concurrent first
/// callers wait for that dial instead of opening their own connection.
/// Calls are serialized over the single connection.
pub struct RpcClient {
    path: PathBuf,
    retry: RetryPolicy,
    connection: Mutex<Option<Connection>>,
    version: OnceLock<String>,
}

impl RpcClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_retry(path, RetryPolicy::default())
    }

    pub fn with_retry(path: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            path: path.into(),
            retry,
            connection: Mutex::new(None),
            version: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dial the socket unless already connected.
    pub async fn connect(&self) -> Result<()> {
        let mut connection = self.connection.lock().await;
        if connection.is_none() {
            *connection = Some(self.dial().await?);
        }
        Ok(())
    }

    /// Ping the host and remember the version it reports.
    pub async fn handshake(&self) -> Result<String> {
        let reply = self.call::<Ping>(&PingArgs {}).await?;
        info!(path = ?self.path, version = %reply.version, "connected to tarmak");
        let _ = self.version.set(reply.version.clone());
        Ok(reply.version)
    }

    /// Version reported by the last successful [`handshake`](Self::handshake).
    pub fn version(&self) -> Option<&str> {
        self.version.get().map(String::as_str)
    }

    /// Call `P` and wait for its reply.
    pub async fn call<P: Procedure>(&self, args: &P::Args) -> Result<P::Reply> {
        let params = serde_json::to_value(args)?;
        let result = self.call_raw(P::NAME, params).await?;
        serde_json::from_value(result).map_err(|err| {
            RpcError::Protocol(format!("unexpected reply to {}: {err}", P::NAME))
        })
    }

    /// Call a procedure by name with untyped arguments.
    ///
    /// A call that fails before its reply is read, or is cancelled while
    /// waiting, takes the connection down with it; the next call redials.
    pub async fn call_raw(&self, method: &str, params: Value) -> Result<Value> {
        let mut guard = self.connection.lock().await;
        let mut connection = match guard.take() {
            Some(connection) => connection,
            None => self.dial().await?,
        };

        let response = match connection.exchange(method, params).await {
            Ok(response) => response,
            Err(err) => {
                warn!(path = ?self.path, procedure = method, error = %err, "dropping tarmak connection");
                return Err(err);
            }
        };
        *guard = Some(connection);

        match (response.error, response.result) {
            (Some(message), _) => Err(RpcError::Remote {
                procedure: method.to_string(),
                message,
            }),
            (None, Some(result)) => Ok(result),
            (None, None) => Err(RpcError::Protocol(format!(
                "reply to {method} carries neither result nor error"
            ))),
        }
    }

    async fn dial(&self) -> Result<Connection> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            debug!(path = ?self.path, attempt, "dialing tarmak");
            match tarmak_transport::connect(&self.path).await {
                Ok(stream) => {
                    return Ok(Connection {
                        framed: wire::framed(stream),
                        last_seq: 0,
                    })
                }
                Err(source) if attempt >= attempts => {
                    return Err(RpcError::Connect {
                        path: self.path.clone(),
                        attempts,
                        source,
                    })
                }
                Err(err) => {
                    warn!(path = ?self.path, attempt, attempts, error = %err, "tarmak socket not reachable yet");
                    tokio::time::sleep(self.retry.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("path", &self.path)
            .field("retry", &self.retry)
            .field("version", &self.version.get())
            .finish()
    }
}
