//! In-process peer transport.
//!
//! Peers join a shared [`MemoryNetwork`] and talk over `tokio::io::duplex`
//! pipes. Connections are made explicitly with [`MemoryNetwork::connect`],
//! which plays the role of discovery + dialing in the real transport.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, anyhow, bail, ensure};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tracing::debug;

use peerdrop_core::transport::{DataStream, PeerId, PeerTransport, TransportEvent};

const PIPE_CAPACITY: usize = 64 * 1024;
const EVENT_QUEUE: usize = 64;

/// One end of an in-memory stream.
///
/// Both ends share `reset`; once either side aborts, reaching the end of the
/// pipe is reported as an error.
pub struct MemoryStream {
    inner: DuplexStream,
    reset: Arc<AtomicBool>,
}

impl MemoryStream {
    fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
        let reset = Arc::new(AtomicBool::new(false));
        (
            Self {
                inner: a,
                reset: Arc::clone(&reset),
            },
            Self { inner: b, reset },
        )
    }
}

impl DataStream for MemoryStream {
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            let n = self
                .inner
                .read(buf)
                .await
                .context("failed to read from memory stream")?;
            if n == 0 && !buf.is_empty() && self.reset.load(Ordering::SeqCst) {
                bail!("memory stream reset by peer");
            }
            Ok(n)
        }
    }

    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            self.inner
                .write_all(buf)
                .await
                .context("failed to write to memory stream")
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            self.inner
                .shutdown()
                .await
                .context("failed to shut down memory stream")
        }
    }

    fn abort(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            self.reset.store(true, Ordering::SeqCst);
            self.shutdown().await
        }
    }
}

type EventTx = mpsc::Sender<TransportEvent<MemoryStream>>;

#[derive(Default)]
struct NetworkState {
    peers: HashMap<PeerId, EventTx>,
    links: HashSet<(PeerId, PeerId)>,
}

/// A set of in-process peers that can be wired together.
#[derive(Default)]
pub struct MemoryNetwork {
    state: Mutex<NetworkState>,
}

impl MemoryNetwork {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a peer with a fresh identity and returns its transport together
    /// with the receiver for its transport events.
    pub fn join(
        self: &Arc<Self>,
    ) -> (
        Arc<MemoryTransport>,
        mpsc::Receiver<TransportEvent<MemoryStream>>,
    ) {
        let local = PeerId::random();
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        self.lock().peers.insert(local.clone(), tx);
        debug!(peer = %local.short(), "Peer joined memory network");

        let transport = MemoryTransport {
            local,
            network: Arc::clone(self),
        };
        (Arc::new(transport), rx)
    }

    /// Connects `a` and `b`, notifying both sides with
    /// [`TransportEvent::PeerConnected`].
    ///
    /// # Errors
    ///
    /// Returns an error if either peer is unknown or has dropped its event
    /// receiver.
    pub async fn connect(&self, a: &PeerId, b: &PeerId) -> anyhow::Result<()> {
        let (tx_a, tx_b) = {
            let mut state = self.lock();
            let tx_a = state.peers.get(a).cloned().ok_or_else(|| anyhow!("unknown peer {a}"))?;
            let tx_b = state.peers.get(b).cloned().ok_or_else(|| anyhow!("unknown peer {b}"))?;
            state.links.insert(link(a, b));
            (tx_a, tx_b)
        };

        tx_a.send(TransportEvent::PeerConnected { peer: b.clone() })
            .await
            .map_err(|_| anyhow!("peer {a} stopped listening"))?;
        tx_b.send(TransportEvent::PeerConnected { peer: a.clone() })
            .await
            .map_err(|_| anyhow!("peer {b} stopped listening"))?;
        Ok(())
    }

    fn route(&self, from: &PeerId, to: &PeerId) -> anyhow::Result<EventTx> {
        let state = self.lock();
        ensure!(
            state.links.contains(&link(from, to)),
            "not connected to peer {to}"
        );
        state
            .peers
            .get(to)
            .cloned()
            .ok_or_else(|| anyhow!("unknown peer {to}"))
    }
}

fn link(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// A peer's handle on a [`MemoryNetwork`].
pub struct MemoryTransport {
    local: PeerId,
    network: Arc<MemoryNetwork>,
}

impl PeerTransport for MemoryTransport {
    type Stream = MemoryStream;

    fn local_peer(&self) -> PeerId {
        self.local.clone()
    }

    fn open_stream<'a>(
        &'a self,
        peer: &'a PeerId,
        protocol: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::Stream>> + Send + 'a {
        async move {
            let remote_tx = self.network.route(&self.local, peer)?;
            let (local_end, remote_end) = MemoryStream::pair();

            remote_tx
                .send(TransportEvent::InboundStream {
                    peer: self.local.clone(),
                    protocol: protocol.to_owned(),
                    stream: remote_end,
                })
                .await
                .map_err(|_| anyhow!("peer {peer} stopped accepting streams"))?;

            Ok(local_end)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn given_connected_peers_when_connecting_then_both_sides_are_notified() {
        let network = MemoryNetwork::new();
        let (a, mut a_events) = network.join();
        let (b, mut b_events) = network.join();

        network.connect(&a.local_peer(), &b.local_peer()).await.unwrap();

        let Some(TransportEvent::PeerConnected { peer }) = a_events.recv().await else {
            panic!("expected PeerConnected on a");
        };
        assert_eq!(peer, b.local_peer());
        let Some(TransportEvent::PeerConnected { peer }) = b_events.recv().await else {
            panic!("expected PeerConnected on b");
        };
        assert_eq!(peer, a.local_peer());
    }

    #[tokio::test]
    async fn given_open_stream_when_data_written_then_remote_reads_it_with_origin() {
        let network = MemoryNetwork::new();
        let (a, _a_events) = network.join();
        let (b, mut b_events) = network.join();
        network.connect(&a.local_peer(), &b.local_peer()).await.unwrap();
        b_events.recv().await.unwrap();

        let mut stream = a.open_stream(&b.local_peer(), "/test/1").await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.shutdown().await.unwrap();

        let Some(TransportEvent::InboundStream {
            peer,
            protocol,
            stream: mut inbound,
        }) = b_events.recv().await
        else {
            panic!("expected InboundStream");
        };
        assert_eq!(peer, a.local_peer());
        assert_eq!(protocol, "/test/1");

        let mut received = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            let n = inbound.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, b"ping");
    }

    #[tokio::test]
    async fn given_aborted_stream_when_remote_reads_to_end_then_read_fails() {
        let network = MemoryNetwork::new();
        let (a, _a_events) = network.join();
        let (b, mut b_events) = network.join();
        network.connect(&a.local_peer(), &b.local_peer()).await.unwrap();
        b_events.recv().await.unwrap();

        let mut stream = a.open_stream(&b.local_peer(), "/test/1").await.unwrap();
        stream.write_all(b"part").await.unwrap();
        stream.abort().await.unwrap();

        let Some(TransportEvent::InboundStream {
            stream: mut inbound,
            ..
        }) = b_events.recv().await
        else {
            panic!("expected InboundStream");
        };
        let mut buf = [0u8; 16];
        assert_eq!(inbound.read(&mut buf).await.unwrap(), 4);
        let err = inbound.read(&mut buf).await.unwrap_err();
        assert!(err.to_string().contains("reset"));
    }

    #[tokio::test]
    async fn given_unconnected_peer_when_opening_stream_then_returns_error() {
        let network = MemoryNetwork::new();
        let (a, _a_events) = network.join();
        let (b, _b_events) = network.join();

        let result = a.open_stream(&b.local_peer(), "/test/1").await;
        assert!(result.is_err());
    }
}
