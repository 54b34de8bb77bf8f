use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tarmak_transport::{TransportError, UnixSocketListener};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::session::Session;

/// Pause after a transient accept failure such as running out of descriptors.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Serves a local Unix socket by forwarding each connection over its own
/// channel of a [`Session`].
#[derive(Debug)]
pub struct Proxy {
    listener: UnixSocketListener,
    session: Session,
    shutdown: CancellationToken,
    live: Arc<AtomicUsize>,
}

impl Proxy {
    /// Bind the local socket at `path`.
    ///
    /// Fails if anything already exists at `path`.
    pub fn bind(path: impl AsRef<Path>, session: Session) -> Result<Self, TransportError> {
        let listener = UnixSocketListener::bind(path)?;
        Ok(Self {
            listener,
            session,
            shutdown: CancellationToken::new(),
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn path(&self) -> &Path {
        self.listener.path()
    }

    /// A handle that can stop the proxy from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
            live: Arc::clone(&self.live),
        }
    }

    /// Stop accepting. Safe to call any number of times.
    pub fn stop(&self) {
        self.shutdown_handle().stop();
    }

    /// Local connections currently being forwarded.
    pub fn live_pairs(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Accept and forward local connections until stopped or the session ends.
    ///
    /// Returns an error only if the listener fails for good. The socket file
    /// is removed when this returns; pairings already running carry on until
    /// their connections close.
    pub async fn run(self) -> Result<(), TransportError> {
        info!(path = ?self.path(), "proxy accepting local connections");
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(path = ?self.path(), "proxy stopped");
                    return Ok(());
                }
                reason = self.session.closed() => {
                    info!(path = ?self.path(), %reason, "session ended; proxy stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            let stream = match accepted {
                Ok((stream, _creds)) => stream,
                Err(err) if err.is_transient() => {
                    warn!(error = %err, "transient accept failure");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
                Err(err) => {
                    error!(path = ?self.path(), error = %err, "proxy listener failed");
                    return Err(err);
                }
            };

            let channel = match self.session.dial().await {
                Ok(channel) => channel,
                Err(err) => {
                    error!(error = %err, "could not open channel for local connection");
                    continue;
                }
            };

            tokio::spawn(splice(stream, channel, Arc::clone(&self.live)));
        }
    }
}

/// Stops a [`Proxy`] from a signal handler or another task, and watches
/// its forwarding while [`Proxy::run`] owns it.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
    live: Arc<AtomicUsize>,
}

impl ShutdownHandle {
    /// Local connections the proxy is forwarding right now.
    pub fn live_pairs(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        if !self.token.is_cancelled() {
            debug!("proxy shutdown requested");
        }
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn stopped(&self) {
        self.token.cancelled().await
    }

    /// Stop on the first SIGINT or SIGTERM.
    ///
    /// Returns early, without stopping, if the proxy is stopped some other way.
    #[cfg(unix)]
    pub async fn stop_on_signal(&self) -> io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = self.stopped() => return Ok(()),
            _ = interrupt.recv() => info!("received SIGINT; shutting down"),
            _ = terminate.recv() => info!("received SIGTERM; shutting down"),
        }
        self.stop();
        Ok(())
    }
}

async fn splice(stream: UnixStream, mut channel: Channel, live: Arc<AtomicUsize>) {
    let id = channel.id();
    live.fetch_add(1, Ordering::AcqRel);
    debug!(channel = id, "forwarding local connection");

    let (mut local_read, mut local_write) = stream.into_split();
    {
        let (mut channel_read, mut channel_write) = tokio::io::split(&mut channel);
        tokio::select! {
            sent = tokio::io::copy(&mut local_read, &mut channel_write) => {
                log_direction(id, "local to channel", sent);
            }
            received = tokio::io::copy(&mut channel_read, &mut local_write) => {
                log_direction(id, "channel to local", received);
            }
        }
    }

    let _ = channel.close().await;
    let _ = local_write.shutdown().await;
    live.fetch_sub(1, Ordering::AcqRel);
    debug!(channel = id, "local connection closed");
}

fn log_direction(channel: u32, direction: &str, result: io::Result<u64>) {
    match result {
        Ok(bytes) => debug!(channel, direction, bytes, "forwarding finished"),
        Err(err) => debug!(channel, direction, error = %err, "forwarding failed"),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::{Role, SessionConfig};

    fn pair() -> (Session, Session) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Session::from_stream(Role::Client, a, SessionConfig::default()),
            Session::from_stream(Role::Server, b, SessionConfig::default()),
        )
    }

    #[tokio::test]
    async fn bind_refuses_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.sock");
        std::fs::write(&path, b"occupied").unwrap();

        let (client, _server) = pair();
        assert!(matches!(
            Proxy::bind(&path, client),
            Err(TransportError::Bind { .. })
        ));
    }

    #[tokio::test]
    async fn stop_twice_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.sock");
        let (client, _server) = pair();

        let proxy = Proxy::bind(&path, client).unwrap();
        let handle = proxy.shutdown_handle();
        let running = tokio::spawn(proxy.run());

        handle.stop();
        handle.stop();
        assert!(handle.is_stopped());
        running.await.unwrap().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn forwards_local_connection_over_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.sock");
        let (client, server) = pair();

        let proxy = Proxy::bind(&path, client).unwrap();
        let handle = proxy.shutdown_handle();
        let running = tokio::spawn(proxy.run());

        let echo = tokio::spawn(async move {
            let mut channel = server.accept().await.unwrap();
            let mut buf = [0u8; 5];
            channel.read_exact(&mut buf).await.unwrap();
            channel.write_all(&buf).await.unwrap();
            channel.close().await.unwrap();
        });

        let mut local = tarmak_transport::connect(&path).await.unwrap();
        local.write_all(b"hello").await.unwrap();
        let mut reply = Vec::new();
        local.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"hello");

        echo.await.unwrap();
        handle.stop();
        running.await.unwrap().unwrap();
    }

    async fn wait_for_pairs(handle: &ShutdownHandle, expected: usize) {
        for _ in 0..200 {
            if handle.live_pairs() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("live pairs stuck at {}, wanted {expected}", handle.live_pairs());
    }

    #[tokio::test]
    async fn live_pairs_track_open_local_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.sock");
        let (client, server) = pair();

        let proxy = Proxy::bind(&path, client).unwrap();
        let handle = proxy.shutdown_handle();
        assert_eq!(handle.live_pairs(), 0);
        let running = tokio::spawn(proxy.run());

        let far_end = tokio::spawn(async move {
            let mut channel = server.accept().await.unwrap();
            let mut buf = [0u8; 4];
            channel.read_exact(&mut buf).await.unwrap();
            channel.write_all(&buf).await.unwrap();
            let mut rest = Vec::new();
            channel.read_to_end(&mut rest).await.unwrap();
            (server, rest)
        });

        let mut local = tarmak_transport::connect(&path).await.unwrap();
        local.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        local.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");
        assert_eq!(handle.live_pairs(), 1);

        drop(local);
        wait_for_pairs(&handle, 0).await;
        let (_server, rest) = far_end.await.unwrap();
        assert!(rest.is_empty());

        handle.stop();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn session_end_stops_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.sock");
        let (client, server) = pair();

        let proxy = Proxy::bind(&path, client).unwrap();
        let running = tokio::spawn(proxy.run());

        server.close().await.unwrap();
        running.await.unwrap().unwrap();
    }
}
