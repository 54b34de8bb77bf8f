use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;
use tracing::debug;

use crate::codec::{Frame, FRAGMENT_SIZE};
use crate::error::MuxError;
use crate::session::Shared;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    /// Deregistered, RST not yet queued.
    Closing,
    Closed,
}

/// One logical byte stream inside a [`Session`](crate::Session).
///
/// Reads yield data in the order the peer wrote it. Each write sends at most
/// [`FRAGMENT_SIZE`] bytes as one frame; `write_all` loops as usual.
/// Shutting down the write side closes the whole channel: an RST is sent
/// and the peer's reads see end-of-stream. Data already received stays
/// readable after either end closes.
pub struct Channel {
    id: u32,
    shared: Arc<Shared>,
    inbound: mpsc::Receiver<Bytes>,
    pending: Bytes,
    outbound: PollSender<Frame>,
    reset: Arc<AtomicBool>,
    state: State,
}

impl Channel {
    pub(crate) fn new(
        id: u32,
        shared: Arc<Shared>,
        inbound: mpsc::Receiver<Bytes>,
        reset: Arc<AtomicBool>,
    ) -> Self {
        let outbound = PollSender::new(shared.outbound.clone());
        Self {
            id,
            shared,
            inbound,
            pending: Bytes::new(),
            outbound,
            reset,
            state: State::Open,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether the peer has reset this channel.
    pub fn is_reset(&self) -> bool {
        self.reset.load(Ordering::Acquire)
    }

    /// Close the channel, sending RST if the peer and session are still there.
    pub async fn close(&mut self) -> io::Result<()> {
        std::future::poll_fn(|cx| self.poll_close(cx)).await
    }

    fn poll_close(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            match self.state {
                State::Closed => return Poll::Ready(Ok(())),
                State::Open => {
                    self.shared.release(self.id);
                    self.state = if self.is_reset() || self.shared.cancel.is_cancelled() {
                        State::Closed
                    } else {
                        State::Closing
                    };
                }
                State::Closing => {
                    if ready!(self.outbound.poll_reserve(cx)).is_ok() {
                        let _ = self.outbound.send_item(Frame::rst(self.id));
                        debug!(channel = self.id, "channel closed");
                    }
                    self.state = State::Closed;
                }
            }
        }
    }

    fn writable(&self) -> Result<(), MuxError> {
        if self.state != State::Open || self.is_reset() {
            return Err(MuxError::ChannelClosed(self.id));
        }
        if self.shared.cancel.is_cancelled() {
            return Err(self.closed_error());
        }
        Ok(())
    }

    fn closed_error(&self) -> MuxError {
        match self.shared.termination() {
            Some(err) if !err.is_clean() => err,
            _ => MuxError::ChannelClosed(self.id),
        }
    }

    fn end_of_stream(&self) -> io::Result<()> {
        if self.state != State::Open || self.is_reset() {
            return Ok(());
        }
        match self.shared.termination() {
            Some(err) if !err.is_clean() => Err(err.into()),
            _ => Ok(()),
        }
    }
}

impl AsyncRead for Channel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            if !this.pending.is_empty() {
                let n = buf.remaining().min(this.pending.len());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match ready!(this.inbound.poll_recv(cx)) {
                Some(chunk) => this.pending = chunk,
                None => return Poll::Ready(this.end_of_stream()),
            }
        }
    }
}

impl AsyncWrite for Channel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        this.writable()?;

        if ready!(this.outbound.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(this.closed_error().into()));
        }
        let n = data.len().min(FRAGMENT_SIZE);
        let frame = Frame::new(this.id, Bytes::copy_from_slice(&data[..n]));
        if this.outbound.send_item(frame).is_err() {
            return Poll::Ready(Err(this.closed_error().into()));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_close(cx)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.state == State::Closed {
            return;
        }
        self.shared.release(self.id);
        if self.is_reset() || self.shared.cancel.is_cancelled() {
            return;
        }

        let rst = Frame::rst(self.id);
        if let Err(err) = self.shared.outbound.try_send(rst) {
            let frame = match err {
                mpsc::error::TrySendError::Full(frame) => frame,
                mpsc::error::TrySendError::Closed(_) => return,
            };
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let outbound = self.shared.outbound.clone();
                runtime.spawn(async move {
                    let _ = outbound.send(frame).await;
                });
            }
        }
        debug!(channel = self.id, "channel dropped");
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("reset", &self.is_reset())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::{Role, Session, SessionConfig};

    use super::*;

    fn pair() -> (Session, Session) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Session::from_stream(Role::Client, a, SessionConfig::default()),
            Session::from_stream(Role::Server, b, SessionConfig::default()),
        )
    }

    #[tokio::test]
    async fn single_write_is_one_fragment() {
        let (client, server) = pair();
        let mut channel = client.dial().await.unwrap();
        let _accepted = server.accept().await.unwrap();

        let big = vec![7u8; FRAGMENT_SIZE * 3 + 10];
        let n = channel.write(&big).await.unwrap();
        assert_eq!(n, FRAGMENT_SIZE);
    }

    #[tokio::test]
    async fn large_write_arrives_in_order() {
        let (client, server) = pair();
        let mut channel = client.dial().await.unwrap();
        let mut accepted = server.accept().await.unwrap();

        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();
        let writer = tokio::spawn(async move {
            channel.write_all(&data).await.unwrap();
            channel.close().await.unwrap();
        });

        let mut received = Vec::new();
        accepted.read_to_end(&mut received).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let (client, _server) = pair();
        let mut channel = client.dial().await.unwrap();
        channel.close().await.unwrap();
        channel.close().await.unwrap();

        let err = channel.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn peer_reset_gives_end_of_stream_and_blocks_writes() {
        let (client, server) = pair();
        let mut channel = client.dial().await.unwrap();
        let mut accepted = server.accept().await.unwrap();

        channel.write_all(b"bye").await.unwrap();
        channel.shutdown().await.unwrap();

        let mut received = Vec::new();
        accepted.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");
        assert!(accepted.is_reset());

        let err = accepted.write_all(b"too late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn buffered_data_survives_session_teardown() {
        let (client, server) = pair();
        let mut channel = client.dial().await.unwrap();
        let mut accepted = server.accept().await.unwrap();

        channel.write_all(b"buffered").await.unwrap();
        let mut first = [0u8; 1];
        accepted.read_exact(&mut first).await.unwrap();

        client.close().await.unwrap();
        server.closed().await;

        let mut rest = Vec::new();
        accepted.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"uffered");
    }

    #[tokio::test]
    async fn drop_sends_reset() {
        let (client, server) = pair();
        let channel = client.dial().await.unwrap();
        let mut accepted = server.accept().await.unwrap();

        drop(channel);

        let mut received = Vec::new();
        accepted.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
        assert!(accepted.is_reset());
    }
}
