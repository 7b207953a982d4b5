use anyhow::{Result, bail, ensure};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// ASCII magic bytes that open every peerdrop frame.
const MAGIC: &[u8; 5] = b"PDROP";
/// Protocol version understood by this build.
const VERSION: u8 = 0x01;
/// Total header size: magic(5) + version(1) + type(1) + flags(2) + length(4).
pub const HEADER_LEN: usize = 13;
/// Upper bound on a single frame payload to protect against malicious peers.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 5;
const OFF_TYPE: usize = 6;
const OFF_FLAGS: usize = 7;
const OFF_LENGTH: usize = 9;

/// Sub-protocol carrying an [`OfferDescriptor`](crate::offer::OfferDescriptor).
pub const ANNOUNCE_PROTOCOL: &str = "/peerdrop/1.0.0/hello";
/// Sub-protocol carrying the raw bytes of the offered file.
pub const TRANSFER_PROTOCOL: &str = "/peerdrop/1.0.0/get";

/// Version string exchanged during the connection handshake.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Protocol-level message type codes (v1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    HelloAck = 0x02,
    StreamOpen = 0x10,
    Announce = 0x20,
}

impl TryFrom<u8> for MessageType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::HelloAck),
            0x10 => Ok(Self::StreamOpen),
            0x20 => Ok(Self::Announce),
            other => bail!("unknown message type: 0x{other:02X}"),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(mt: MessageType) -> u8 {
        mt as u8
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: MessageType,
    /// Reserved flags - MUST be `0x0000` in v1.
    pub flags: u16,
    pub payload_length: u32,
}

/// A fully decoded frame (header + payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// Attempts to decode one complete frame from the front of `buf`.
///
/// * `Ok(Some(frame))` - a full frame was present; its bytes have been consumed
///   from `buf`.
/// * `Ok(None)` - not enough bytes yet; `buf` is left untouched.  The caller
///   should read more data and try again.
/// * `Err(..)` - protocol violation (bad magic, unsupported version, unknown
///   message type, oversized payload).  The caller should drop the stream.
///
/// # Errors
///
/// Returns an error on protocol violations: bad magic, unsupported version,
/// unknown message type, or payload exceeding [`MAX_PAYLOAD_LEN`].
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    ensure!(
        &buf[OFF_MAGIC..OFF_MAGIC + MAGIC.len()] == MAGIC,
        "bad magic: expected PDROP"
    );

    let version = buf[OFF_VERSION];
    ensure!(version == VERSION, "unsupported version: 0x{version:02X}");

    let msg_type = MessageType::try_from(buf[OFF_TYPE])?;

    let flags = u16::from_be_bytes([buf[OFF_FLAGS], buf[OFF_FLAGS + 1]]);
    let payload_len = u32::from_be_bytes([
        buf[OFF_LENGTH],
        buf[OFF_LENGTH + 1],
        buf[OFF_LENGTH + 2],
        buf[OFF_LENGTH + 3],
    ]) as usize;

    ensure!(
        payload_len <= MAX_PAYLOAD_LEN,
        "payload too large: {payload_len} bytes (max {MAX_PAYLOAD_LEN})"
    );

    if buf.len() < HEADER_LEN + payload_len {
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let payload = buf.split_to(payload_len).to_vec();

    let header = Header {
        version,
        msg_type,
        flags,
        #[allow(clippy::cast_possible_truncation)] // guarded by MAX_PAYLOAD_LEN (fits in u32)
        payload_length: payload_len as u32,
    };

    Ok(Some(Frame { header, payload }))
}

/// Encodes a frame into `buf`.
///
/// Appends the 13-byte header followed by `payload` to the buffer.
///
/// # Errors
///
/// Returns an error if `payload` exceeds [`MAX_PAYLOAD_LEN`]; `buf` is left
/// untouched in that case.
pub fn encode_frame(msg_type: MessageType, payload: &[u8], buf: &mut BytesMut) -> Result<()> {
    ensure!(
        payload.len() <= MAX_PAYLOAD_LEN,
        "payload too large: {} bytes (max {MAX_PAYLOAD_LEN})",
        payload.len()
    );
    buf.reserve(HEADER_LEN + payload.len());
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(msg_type.into());
    buf.put_u16(0x0000);
    #[allow(clippy::cast_possible_truncation)] // checked against MAX_PAYLOAD_LEN above
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(())
}

/// Convenience wrapper that allocates and returns a new `BytesMut`.
///
/// # Errors
///
/// Same as [`encode_frame`].
pub fn encode_frame_to_bytes(msg_type: MessageType, payload: &[u8]) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_frame(msg_type, payload, &mut buf)?;
    Ok(buf)
}

// ── JSON payload types ──────────────────────────────────────────────

/// Payload for [`MessageType::Hello`] and [`MessageType::HelloAck`].
///
/// Exchanged once per connection so that each side learns the other's
/// peer id before any sub-protocol stream is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub peer_id: String,
    pub protocol_version: String,
}

/// Payload for [`MessageType::StreamOpen`], the first frame of every
/// logical stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOpenPayload {
    pub protocol: String,
}

/// Encodes a serializable payload into a protocol frame stored in a new
/// [`BytesMut`].
///
/// # Errors
///
/// Returns an error if JSON serialization fails or the encoded payload
/// exceeds [`MAX_PAYLOAD_LEN`].
pub fn encode_payload_frame<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<BytesMut> {
    let json = serde_json::to_vec(payload)?;
    encode_frame_to_bytes(msg_type, &json)
}

/// Decodes a frame's payload bytes into the requested type.
///
/// # Errors
///
/// Returns an error if the payload is not valid JSON or does not match `T`.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(Into::into)
}

/// Decodes `frame` as a `T`, checking that it carries the `expected` type.
///
/// # Errors
///
/// Returns an error on a message type mismatch or a malformed payload.
pub fn expect_payload<T: for<'de> Deserialize<'de>>(
    frame: &Frame,
    expected: MessageType,
) -> Result<T> {
    ensure!(
        frame.header.msg_type == expected,
        "unexpected message: expected {expected:?}, got {:?}",
        frame.header.msg_type
    );
    decode_payload(&frame.payload)
}
