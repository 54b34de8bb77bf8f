use bytes::BytesMut;
use tarmak_mux::{
    decode_frame, encode_frame, Flags, Frame, MuxError, Role, Session, SessionConfig,
    FRAGMENT_SIZE, MAX_PAYLOAD,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

fn session_pair() -> (Session, Session) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    (
        Session::from_stream(Role::Client, a, SessionConfig::default()),
        Session::from_stream(Role::Server, b, SessionConfig::default()),
    )
}

/// A session whose peer is driven frame by frame from the test.
fn raw_peer(role: Role) -> (Session, ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
    let (raw, far) = tokio::io::duplex(256 * 1024);
    let session = Session::from_stream(role, far, SessionConfig::default());
    let (read, write) = tokio::io::split(raw);
    (session, read, write)
}

async fn send_frame(write: &mut WriteHalf<DuplexStream>, frame: Frame) {
    let mut buf = BytesMut::new();
    encode_frame(&frame, &mut buf).unwrap();
    write.write_all(&buf).await.unwrap();
}

async fn next_frame(read: &mut ReadHalf<DuplexStream>, buf: &mut BytesMut) -> Option<Frame> {
    loop {
        if let Some(frame) = decode_frame(buf, MAX_PAYLOAD).unwrap() {
            return Some(frame);
        }
        if read.read_buf(buf).await.unwrap() == 0 {
            return None;
        }
    }
}

#[tokio::test]
async fn ping_pong_over_first_client_channel() {
    let (client, server) = session_pair();

    let mut dialed = client.dial().await.unwrap();
    let mut accepted = server.accept().await.unwrap();
    assert_eq!(accepted.id(), 3);

    dialed.write_all(b"PING").await.unwrap();
    let mut buf = [0u8; 4];
    accepted.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"PING");

    accepted.write_all(b"PONG").await.unwrap();
    dialed.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"PONG");

    dialed.close().await.unwrap();
    let n = accepted.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn channels_keep_their_own_order() {
    let (client, server) = session_pair();

    let mut writers = Vec::new();
    for tag in 0u8..4 {
        let mut channel = client.dial().await.unwrap();
        writers.push(tokio::spawn(async move {
            for chunk in 0..50u8 {
                let piece = vec![tag.wrapping_mul(64).wrapping_add(chunk); 300 + chunk as usize];
                channel.write_all(&piece).await.unwrap();
            }
            channel.close().await.unwrap();
            tag
        }));
    }

    let mut readers = Vec::new();
    for _ in 0..4 {
        let mut channel = server.accept().await.unwrap();
        readers.push(tokio::spawn(async move {
            let mut received = Vec::new();
            channel.read_to_end(&mut received).await.unwrap();
            received
        }));
    }

    for writer in writers {
        writer.await.unwrap();
    }

    let mut seen_tags = Vec::new();
    for reader in readers {
        let received = reader.await.unwrap();
        let tag = received[0] / 64;
        let mut expected = Vec::new();
        for chunk in 0..50u8 {
            expected.extend(std::iter::repeat_n(
                tag.wrapping_mul(64).wrapping_add(chunk),
                300 + chunk as usize,
            ));
        }
        assert_eq!(received, expected);
        seen_tags.push(tag);
    }
    seen_tags.sort_unstable();
    assert_eq!(seen_tags, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn written_frames_never_exceed_fragment_size() {
    let (client, mut raw_read, _raw_write) = raw_peer(Role::Client);

    let mut channel = client.dial().await.unwrap();
    let big = vec![0xABu8; FRAGMENT_SIZE * 5 + 17];
    channel.write_all(&big).await.unwrap();
    channel.close().await.unwrap();

    let mut buf = BytesMut::new();
    let mut payload = Vec::new();
    loop {
        let frame = next_frame(&mut raw_read, &mut buf).await.unwrap();
        assert!(frame.payload.len() <= FRAGMENT_SIZE);
        payload.extend_from_slice(&frame.payload);
        if frame.flags.contains(Flags::RST) {
            break;
        }
    }
    assert_eq!(payload, big);
}

#[tokio::test]
async fn data_after_reset_is_a_protocol_error() {
    let (server, _raw_read, mut raw_write) = raw_peer(Role::Server);

    send_frame(&mut raw_write, Frame::syn(3)).await;
    send_frame(&mut raw_write, Frame::new(3, "before")).await;
    send_frame(&mut raw_write, Frame::rst(3)).await;

    let mut channel = server.accept().await.unwrap();
    let mut received = Vec::new();
    channel.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"before");

    send_frame(&mut raw_write, Frame::new(3, "after")).await;
    let err = server.closed().await;
    assert!(matches!(err, MuxError::UnknownChannel(3)));
    assert!(err.is_protocol());
}

#[tokio::test]
async fn protocol_error_reaches_readers_after_buffered_data() {
    let (server, _raw_read, mut raw_write) = raw_peer(Role::Server);

    send_frame(&mut raw_write, Frame::syn(5)).await;
    send_frame(&mut raw_write, Frame::new(5, "kept")).await;
    let mut channel = server.accept().await.unwrap();

    // Unknown flag bits: the framing can no longer be trusted.
    raw_write.write_all(&[0, 0, 0, 5, 0x80, 0, 0, 0]).await.unwrap();
    assert!(matches!(server.closed().await, MuxError::InvalidFlags(0x80)));

    let mut buf = [0u8; 4];
    channel.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"kept");
    let err = channel.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

#[tokio::test]
async fn frames_from_peer_after_local_close_are_dropped() {
    let (server, mut raw_read, mut raw_write) = raw_peer(Role::Server);

    send_frame(&mut raw_write, Frame::syn(7)).await;
    let mut channel = server.accept().await.unwrap();
    channel.close().await.unwrap();

    let mut buf = BytesMut::new();
    assert_eq!(
        next_frame(&mut raw_read, &mut buf).await.unwrap(),
        Frame::rst(7)
    );

    // Sent before the peer saw our RST.
    send_frame(&mut raw_write, Frame::new(7, "in flight")).await;
    send_frame(&mut raw_write, Frame::rst(7)).await;
    send_frame(&mut raw_write, Frame::syn(9)).await;

    assert_eq!(server.accept().await.unwrap().id(), 9);
    assert!(!server.is_closed());
}

#[tokio::test]
async fn both_ends_can_dial() {
    let (client, server) = session_pair();

    let mut from_server = server.dial().await.unwrap();
    assert_eq!(from_server.id(), 2);
    let mut at_client = client.accept().await.unwrap();

    from_server.write_all(b"push").await.unwrap();
    let mut buf = [0u8; 4];
    at_client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"push");

    client.close().await.unwrap();
    server.close().await.unwrap();
}
