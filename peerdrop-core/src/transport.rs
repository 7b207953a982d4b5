use std::fmt;
use std::future::Future;

use anyhow::bail;
use bytes::BytesMut;

use crate::protocol::{Frame, try_decode_frame};

/// Identifier of a peer, unique per running process.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(String);

impl PeerId {
    /// Generates a fresh random identity.
    #[must_use]
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A transport-agnostic byte stream.
///
/// Every logical stream opened through [`PeerTransport::open_stream`] or
/// delivered by [`TransportEvent::InboundStream`] implements this trait, so
/// the protocol handlers can read and write without knowing whether they
/// talk over QUIC or an in-memory pipe.
pub trait DataStream: Send + 'static {
    /// Reads bytes into `buf`, returning how many bytes were read.
    ///
    /// Returns `Ok(0)` when the remote end has closed the stream.
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a;

    /// Writes the entirety of `buf` to the stream.
    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a;

    /// Shuts down the write half of the stream, signalling to the
    /// remote end that no more data will be sent.
    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_;

    /// Abandons the write half so the remote end's reads fail instead of
    /// seeing a clean end of stream.
    fn abort(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_;
}

/// The peer transport layer as seen by the exchange protocol.
///
/// Identity, connection establishment and discovery stay inside the
/// implementation. The exchange protocol only opens named streams to
/// connected peers; everything inbound arrives as [`TransportEvent`]s on the
/// channel handed out when the transport was started.
pub trait PeerTransport: Send + Sync + 'static {
    /// The concrete stream type produced by [`open_stream`](PeerTransport::open_stream).
    type Stream: DataStream;

    /// Identity of the local peer.
    fn local_peer(&self) -> PeerId;

    /// Opens a new logical stream to a connected `peer` for `protocol`.
    fn open_stream<'a>(
        &'a self,
        peer: &'a PeerId,
        protocol: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::Stream>> + Send + 'a;
}

/// Notifications delivered by a [`PeerTransport`].
pub enum TransportEvent<S> {
    /// A connection to `peer` has been established and identified.
    PeerConnected { peer: PeerId },
    /// `peer` opened a stream for `protocol`.
    InboundStream {
        peer: PeerId,
        protocol: String,
        stream: S,
    },
}

impl<S> fmt::Debug for TransportEvent<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerConnected { peer } => {
                f.debug_struct("PeerConnected").field("peer", peer).finish()
            }
            Self::InboundStream { peer, protocol, .. } => f
                .debug_struct("InboundStream")
                .field("peer", peer)
                .field("protocol", protocol)
                .finish_non_exhaustive(),
        }
    }
}

/// Reads from `stream` until one complete frame is available in `accum`.
///
/// Bytes following the frame stay in `accum` for the next call.
///
/// # Errors
///
/// Returns an error if the stream fails, ends before a full frame arrived,
/// or carries a protocol violation.
pub async fn read_frame<S: DataStream>(stream: &mut S, accum: &mut BytesMut) -> anyhow::Result<Frame> {
    let mut buf = [0u8; 2048];
    loop {
        if let Some(frame) = try_decode_frame(accum)? {
            return Ok(frame);
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            bail!(
                "stream closed before a complete frame arrived ({} bytes buffered)",
                accum.len()
            );
        }
        accum.extend_from_slice(&buf[..n]);
    }
}
