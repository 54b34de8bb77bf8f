use std::fmt;
use std::ops::BitOr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{MuxError, Result};

/// Frame header: channel id (4) + flags/length word (4) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Largest payload the 24-bit length field can describe.
pub const MAX_PAYLOAD: usize = (1 << 24) - 1;

/// Largest payload a channel write puts into one frame.
///
/// Keeps a single busy channel from holding the transport for long.
pub const FRAGMENT_SIZE: usize = 1024;

const LENGTH_MASK: u32 = 0x00ff_ffff;
const FLAGS_SHIFT: u32 = 24;

/// Frame flag bits.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    /// No flags: a plain data frame.
    pub const NONE: Flags = Flags(0);
    /// Opens a new channel.
    pub const SYN: Flags = Flags(1 << 0);
    /// Closes a channel.
    pub const RST: Flags = Flags(1 << 1);

    const KNOWN: u8 = Self::SYN.0 | Self::RST.0;

    /// Raw flag byte.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Parse a flag byte, rejecting unknown bits.
    pub fn from_bits(bits: u8) -> Option<Flags> {
        if bits & !Self::KNOWN == 0 {
            Some(Flags(bits))
        } else {
            None
        }
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Flags::SYN) {
            names.push("SYN");
        }
        if self.contains(Flags::RST) {
            names.push("RST");
        }
        if names.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The channel this frame belongs to.
    pub channel: u32,
    /// SYN/RST flags.
    pub flags: Flags,
    /// The payload, possibly empty.
    pub payload: Bytes,
}

impl Frame {
    /// A data frame.
    pub fn new(channel: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            flags: Flags::NONE,
            payload: payload.into(),
        }
    }

    /// Empty frame announcing a new channel.
    pub fn syn(channel: u32) -> Self {
        Self {
            channel,
            flags: Flags::SYN,
            payload: Bytes::new(),
        }
    }

    /// Empty frame closing a channel.
    pub fn rst(channel: u32) -> Self {
        Self {
            channel,
            flags: Flags::RST,
            payload: Bytes::new(),
        }
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encode a frame into the wire format.
///
/// Wire format (big-endian):
/// ```text
/// ┌──────────────┬──────────┬──────────────┬──────────────────┐
/// │ Channel (4B) │ Flags    │ Length       │ Payload          │
/// │              │ (1B)     │ (3B)         │ (Length bytes)   │
/// └──────────────┴──────────┴──────────────┴──────────────────┘
/// ```
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    let len = frame.payload.len();
    if len > MAX_PAYLOAD {
        return Err(MuxError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD,
        });
    }
    dst.reserve(HEADER_SIZE + len);
    dst.put_u32(frame.channel);
    dst.put_u32((u32::from(frame.flags.bits()) << FLAGS_SHIFT) | len as u32);
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let channel = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
    let word = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);
    let raw_flags = (word >> FLAGS_SHIFT) as u8;
    let payload_len = (word & LENGTH_MASK) as usize;

    let flags = Flags::from_bits(raw_flags).ok_or(MuxError::InvalidFlags(raw_flags))?;

    if payload_len > max_payload {
        return Err(MuxError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame {
        channel,
        flags,
        payload,
    }))
}

/// `tokio_util` codec for session frames.
#[derive(Debug, Clone)]
pub struct MuxCodec {
    max_payload: usize,
}

impl MuxCodec {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD)
    }

    /// Reject inbound frames larger than `max_payload` (capped at [`MAX_PAYLOAD`]).
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(MAX_PAYLOAD),
        }
    }
}

impl Default for MuxCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MuxCodec {
    type Item = Frame;
    type Error = MuxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        decode_frame(src, self.max_payload)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(MuxError::Truncated {
                remaining: src.len(),
            }),
        }
    }
}

impl Encoder<Frame> for MuxCodec {
    type Error = MuxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        encode_frame(&frame, dst)
    }
}
