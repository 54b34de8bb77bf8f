use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tarmak_mux::Session;
use tarmak_transport::UnixSocketListener;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::table::ProcedureTable;
use crate::wire::{self, Request, Response};

/// Pause after a transient accept failure.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Serves a [`ProcedureTable`] to any number of connections.
///
/// Cheap to clone; clones share the table.
#[derive(Debug, Clone)]
pub struct RpcServer {
    table: Arc<ProcedureTable>,
}

impl RpcServer {
    pub fn new(table: ProcedureTable) -> Self {
        Self {
            table: Arc::new(table),
        }
    }

    pub fn table(&self) -> &ProcedureTable {
        &self.table
    }

    /// Listen on a Unix socket at `path` until `shutdown` is cancelled.
    ///
    /// A socket left behind by an earlier run is replaced. Each connection
    /// is served on its own task.
    pub async fn serve_unix(&self, path: impl AsRef<Path>, shutdown: CancellationToken) -> Result<()> {
        let listener = UnixSocketListener::bind_replacing_stale(path)?;
        info!(path = ?listener.path(), "rpc server listening");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(path = ?listener.path(), "rpc server stopped");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, creds)) => {
                    debug!(?creds, "rpc connection accepted");
                    self.spawn_connection(stream);
                }
                Err(err) if err.is_transient() => {
                    warn!(error = %err, "transient accept failure");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
                Err(err) => {
                    error!(path = ?listener.path(), error = %err, "rpc listener failed");
                    return Err(err.into());
                }
            }
        }
    }

    /// Serve every channel the peer opens on `session`.
    ///
    /// Returns when the session ends; an orderly end is `Ok`.
    pub async fn serve_session(&self, session: &Session) -> Result<()> {
        info!(role = %session.role(), "rpc server attached to session");
        loop {
            match session.accept().await {
                Ok(channel) => {
                    debug!(channel = channel.id(), "rpc channel accepted");
                    self.spawn_connection(channel);
                }
                Err(err) if err.is_clean() => {
                    info!(reason = %err, "rpc server session ended");
                    return Ok(());
                }
                Err(err) => {
                    warn!(error = %err, "rpc server session failed");
                    return Err(err.into());
                }
            }
        }
    }

    fn spawn_connection<T>(&self, io: T)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let server = self.clone();
        tokio::spawn(async move {
            if let Err(err) = server.serve_connection(io).await {
                warn!(error = %err, "rpc connection ended with error");
            }
        });
    }

    /// Answer calls on one connection until the caller hangs up.
    pub async fn serve_connection<T>(&self, io: T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = wire::framed(io);
        debug!("new rpc connection");

        while let Some(message) = framed.next().await {
            let request: Request = wire::decode(&message?)?;
            let response = match self.table.dispatch(&request.method, request.params).await {
                Ok(result) => Response::ok(request.seq, result),
                Err(message) => Response::err(request.seq, message),
            };
            framed.send(wire::encode(&response)?).await?;
        }

        debug!("closed rpc connection");
        Ok(())
    }
}
