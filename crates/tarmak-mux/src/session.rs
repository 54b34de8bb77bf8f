use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::channel::Channel;
use crate::codec::{Flags, Frame, MuxCodec, MAX_PAYLOAD};
use crate::error::{MuxError, Result};

/// How many locally closed ids are remembered so that frames the peer sent
/// before seeing our RST can be dropped quietly.
const CLOSED_HISTORY: usize = 256;

/// Upper bound on flushing queued frames after a local close.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Which half of the channel id space this end allocates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Odd ids; the first dialed channel is 3.
    Client,
    /// Even ids; the first dialed channel is 2.
    Server,
}

impl Role {
    fn seed(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 0,
        }
    }

    /// Whether `id` belongs to the ids this end dials.
    pub fn owns(self, id: u32) -> bool {
        id % 2 == self.seed()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Peer-opened channels waiting for [`Session::accept`].
    pub accept_backlog: usize,
    /// Inbound chunks buffered per channel before the dispatcher waits.
    pub inbound_capacity: usize,
    /// Frames queued for the transport before writers wait.
    pub outbound_capacity: usize,
    /// Largest inbound payload accepted before the session is torn down.
    pub max_payload: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            accept_backlog: 64,
            inbound_capacity: 64,
            outbound_capacity: 1024,
            max_payload: MAX_PAYLOAD,
        }
    }
}

struct Slot {
    tx: mpsc::Sender<Bytes>,
    reset: Arc<AtomicBool>,
}

#[derive(Default)]
struct Registry {
    open: HashMap<u32, Slot>,
    closed: VecDeque<u32>,
    torn_down: bool,
}

enum Route {
    Open(mpsc::Sender<Bytes>),
    LocallyClosed,
    Unknown,
}

/// State shared by the session handle, its tasks and every channel.
pub(crate) struct Shared {
    role: Role,
    next_id: AtomicU32,
    registry: Mutex<Registry>,
    pub(crate) outbound: mpsc::Sender<Frame>,
    pub(crate) cancel: CancellationToken,
    termination: OnceLock<MuxError>,
    config: SessionConfig,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store the first error without waking anyone.
    fn record(&self, err: MuxError) {
        if self.termination.set(err).is_ok() {
            if let Some(err) = self.termination.get() {
                if err.is_protocol() {
                    warn!(role = %self.role, error = %err, "session protocol error");
                } else if !err.is_clean() {
                    warn!(role = %self.role, error = %err, "session failed");
                }
            }
        }
    }

    /// Store the first error and stop every task.
    pub(crate) fn terminate(&self, err: MuxError) {
        self.record(err);
        self.cancel.cancel();
    }

    pub(crate) fn termination(&self) -> Option<MuxError> {
        self.termination.get().cloned()
    }

    pub(crate) fn termination_error(&self) -> MuxError {
        self.termination().unwrap_or(MuxError::SessionClosed)
    }

    fn register(self: &Arc<Self>, id: u32) -> Result<(Channel, mpsc::Sender<Bytes>)> {
        let (tx, rx) = mpsc::channel(self.config.inbound_capacity.max(1));
        let reset = Arc::new(AtomicBool::new(false));
        {
            let mut registry = self.registry();
            if registry.torn_down {
                return Err(self.termination_error());
            }
            registry.open.insert(
                id,
                Slot {
                    tx: tx.clone(),
                    reset: Arc::clone(&reset),
                },
            );
        }
        Ok((Channel::new(id, Arc::clone(self), rx, reset), tx))
    }

    /// Drop a channel that its owner closed.
    pub(crate) fn release(&self, id: u32) {
        let mut registry = self.registry();
        if registry.open.remove(&id).is_some() {
            if registry.closed.len() == CLOSED_HISTORY {
                registry.closed.pop_front();
            }
            registry.closed.push_back(id);
        }
    }

    fn lookup(&self, id: u32) -> Route {
        let registry = self.registry();
        if let Some(slot) = registry.open.get(&id) {
            Route::Open(slot.tx.clone())
        } else if registry.closed.contains(&id) {
            Route::LocallyClosed
        } else {
            Route::Unknown
        }
    }

    /// The peer reset `id`.
    fn reset(&self, id: u32) {
        let mut registry = self.registry();
        if let Some(slot) = registry.open.remove(&id) {
            slot.reset.store(true, Ordering::Release);
            debug!(channel = id, "channel reset by peer");
        }
        registry.closed.retain(|closed| *closed != id);
    }

    /// Hand every open channel end-of-stream.
    fn teardown(&self) {
        let mut registry = self.registry();
        registry.torn_down = true;
        registry.open.clear();
        registry.closed.clear();
    }

    fn channel_count(&self) -> usize {
        self.registry().open.len()
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(self.termination_error()),
            sent = self.outbound.send(frame) => sent.map_err(|_| self.termination_error()),
        }
    }

    async fn route(
        self: &Arc<Self>,
        frame: Frame,
        accept_tx: &mpsc::Sender<Channel>,
    ) -> Result<()> {
        let Frame {
            channel: id,
            flags,
            payload,
        } = frame;

        let tx = match self.lookup(id) {
            Route::Open(tx) => tx,
            Route::LocallyClosed => {
                if flags.contains(Flags::RST) {
                    self.reset(id);
                }
                trace!(channel = id, len = payload.len(), "dropping frame for closed channel");
                return Ok(());
            }
            Route::Unknown if flags.contains(Flags::SYN) => {
                if self.role.owns(id) {
                    return Err(MuxError::ForeignChannelId(id));
                }
                let (channel, tx) = self.register(id)?;
                debug!(channel = id, "peer opened channel");
                if accept_tx.send(channel).await.is_err() {
                    return Err(MuxError::SessionClosed);
                }
                tx
            }
            Route::Unknown if flags == Flags::RST && payload.is_empty() => {
                trace!(channel = id, "ignoring reset for unknown channel");
                return Ok(());
            }
            Route::Unknown => return Err(MuxError::UnknownChannel(id)),
        };

        if !payload.is_empty() {
            // The receiver is gone once the owner closed the channel.
            let _ = tx.send(payload).await;
        }
        if flags.contains(Flags::RST) {
            self.reset(id);
        }
        Ok(())
    }
}

struct Handle {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Channel>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.shared.terminate(MuxError::SessionClosed);
    }
}

/// Many channels over one duplex transport.
///
/// Cloning gives another handle to the same session. The session ends when
/// the transport closes, a protocol error occurs, [`close`](Self::close) is
/// called, or the last handle is dropped.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Handle>,
}

impl Session {
    /// Client end over `reader`/`writer`. Must be called inside a tokio runtime.
    pub fn client<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_config(Role::Client, reader, writer, SessionConfig::default())
    }

    /// Server end over `reader`/`writer`. Must be called inside a tokio runtime.
    pub fn server<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_config(Role::Server, reader, writer, SessionConfig::default())
    }

    /// Session over a single bidirectional stream, e.g. a socket.
    pub fn from_stream<S>(role: Role, stream: S, config: SessionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::with_config(role, reader, writer, config)
    }

    pub fn with_config<R, W>(role: Role, reader: R, writer: W, config: SessionConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));

        let shared = Arc::new(Shared {
            role,
            next_id: AtomicU32::new(role.seed()),
            registry: Mutex::new(Registry::default()),
            outbound: outbound_tx,
            cancel: CancellationToken::new(),
            termination: OnceLock::new(),
            config,
        });

        let tasks = vec![
            tokio::spawn(read_loop(Arc::clone(&shared), reader, inbound_tx)),
            tokio::spawn(dispatch_loop(Arc::clone(&shared), inbound_rx, accept_tx)),
            tokio::spawn(write_loop(Arc::clone(&shared), writer, outbound_rx)),
        ];

        info!(%role, "session started");

        Self {
            inner: Arc::new(Handle {
                shared,
                accept_rx: tokio::sync::Mutex::new(accept_rx),
                tasks: tokio::sync::Mutex::new(tasks),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.shared.role
    }

    /// Open a new channel to the peer.
    ///
    /// Returns as soon as the SYN is queued; the channel can be written to
    /// right away.
    pub async fn dial(&self) -> Result<Channel> {
        let shared = &self.inner.shared;
        if shared.cancel.is_cancelled() {
            return Err(shared.termination_error());
        }

        let id = shared
            .next_id
            .fetch_add(2, Ordering::Relaxed)
            .wrapping_add(2);
        let (channel, _) = shared.register(id)?;
        shared.send(Frame::syn(id)).await?;
        debug!(channel = id, "dialed channel");
        Ok(channel)
    }

    /// Wait for the peer to open a channel.
    pub async fn accept(&self) -> Result<Channel> {
        let shared = &self.inner.shared;
        let mut accept_rx = self.inner.accept_rx.lock().await;
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => Err(shared.termination_error()),
            channel = accept_rx.recv() => channel.ok_or_else(|| shared.termination_error()),
        }
    }

    /// Tear the session down and wait for its tasks to finish.
    ///
    /// Safe to call more than once. Returns the error that ended the session
    /// if it failed before this call.
    pub async fn close(&self) -> Result<()> {
        let shared = &self.inner.shared;
        shared.terminate(MuxError::SessionClosed);

        let tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }

        match shared.termination() {
            Some(err) if !err.is_clean() => Err(err),
            _ => Ok(()),
        }
    }

    /// Wait until the session has ended and return why.
    pub async fn closed(&self) -> MuxError {
        self.inner.shared.cancel.cancelled().await;
        self.inner.shared.termination_error()
    }

    /// Why the session ended, if it has.
    pub fn termination(&self) -> Option<MuxError> {
        if self.is_closed() {
            Some(self.inner.shared.termination_error())
        } else {
            None
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.cancel.is_cancelled()
    }

    /// Channels currently open on this session.
    pub fn channel_count(&self) -> usize {
        self.inner.shared.channel_count()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.inner.shared.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_loop<R>(shared: Arc<Shared>, reader: R, inbound: mpsc::Sender<Frame>)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, MuxCodec::with_max_payload(shared.config.max_payload));
    let end = loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(frame)) => {
                trace!(channel = frame.channel, flags = ?frame.flags, len = frame.payload.len(), "frame in");
                if inbound.send(frame).await.is_err() {
                    return;
                }
            }
            Some(Err(err)) => break err,
            None => break MuxError::ConnectionClosed,
        }
    };
    // Frames already queued are routed before the session is cancelled.
    shared.record(end);
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut inbound: mpsc::Receiver<Frame>,
    accept_tx: mpsc::Sender<Channel>,
) {
    loop {
        let frame = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            frame = inbound.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        let routed = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            routed = shared.route(frame, &accept_tx) => routed,
        };
        if let Err(err) = routed {
            shared.terminate(err);
            break;
        }
    }

    shared.terminate(MuxError::ConnectionClosed);
    shared.teardown();
    info!(role = %shared.role, reason = %shared.termination_error(), "session stopped");
}

async fn write_loop<W>(shared: Arc<Shared>, writer: W, mut outbound: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, MuxCodec::new());

    let run = async {
        while let Some(frame) = outbound.recv().await {
            sink.feed(frame).await?;
            while let Ok(frame) = outbound.try_recv() {
                sink.feed(frame).await?;
            }
            sink.flush().await?;
        }
        Ok::<(), MuxError>(())
    };

    tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => {}
        result = run => {
            if let Err(err) = result {
                shared.terminate(err);
            }
        }
    }

    if matches!(shared.termination(), Some(MuxError::SessionClosed)) {
        let drain = async {
            while let Ok(frame) = outbound.try_recv() {
                sink.feed(frame).await?;
            }
            sink.flush().await
        };
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;
    }
    let _ = sink.close().await;
}
