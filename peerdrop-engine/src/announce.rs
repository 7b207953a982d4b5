//! The announcement sub-protocol.
//!
//! Every new connection triggers one outbound announcement carrying the local
//! [`OfferDescriptor`]. Inbound announcements are either logged (sharing
//! side) or appended to the offer registry (receiving side).

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use peerdrop_core::offer::{OfferDescriptor, RegistryEntry};
use peerdrop_core::protocol::{ANNOUNCE_PROTOCOL, MessageType, encode_payload_frame, expect_payload};
use peerdrop_core::transport::{DataStream, PeerId, PeerTransport, read_frame};

use crate::deadline::within;
use crate::node::{NodeEvent, StreamHandler};
use crate::registry::OfferLog;

/// Opens an announcement stream to `peer`, writes `offer` and closes the
/// stream.
///
/// # Errors
///
/// Returns an error if the stream cannot be opened or written, or if an
/// operation exceeds `io_timeout`.
pub async fn send_announcement<T: PeerTransport>(
    transport: &T,
    peer: &PeerId,
    offer: &OfferDescriptor,
    io_timeout: Duration,
) -> anyhow::Result<()> {
    let frame = encode_payload_frame(MessageType::Announce, offer)?;

    let mut stream = within(
        io_timeout,
        "opening announcement stream",
        transport.open_stream(peer, ANNOUNCE_PROTOCOL),
    )
    .await?;
    within(io_timeout, "writing announcement", stream.write_all(&frame)).await?;
    within(io_timeout, "closing announcement stream", stream.shutdown()).await
}

/// Reacts to a new connection by announcing the local offer to `peer`.
///
/// Failures are logged and reported as [`NodeEvent::AnnouncementFailed`];
/// the connection itself is left alone.
pub async fn announce_to<T: PeerTransport>(
    transport: Arc<T>,
    peer: PeerId,
    offer: OfferDescriptor,
    io_timeout: Duration,
    events: broadcast::Sender<NodeEvent>,
) {
    match send_announcement(transport.as_ref(), &peer, &offer, io_timeout).await {
        Ok(()) => {
            debug!(peer = %peer.short(), file = %offer.file, "Announcement sent");
            let _ = events.send(NodeEvent::AnnouncementSent { peer });
        }
        Err(e) => {
            warn!(peer = %peer.short(), error = %e, "Error writing hello");
            let _ = events.send(NodeEvent::AnnouncementFailed {
                peer,
                message: format!("error writing hello: {e:#}"),
            });
        }
    }
}

/// Reads a single announcement frame from `stream`.
///
/// # Errors
///
/// Returns an error if the stream fails, times out, or does not carry a
/// well-formed [`MessageType::Announce`] frame.
pub async fn read_announcement<S: DataStream>(
    stream: &mut S,
    io_timeout: Duration,
) -> anyhow::Result<OfferDescriptor> {
    let mut accum = BytesMut::with_capacity(512);
    let frame = within(io_timeout, "reading announcement", read_frame(stream, &mut accum)).await?;
    expect_payload(&frame, MessageType::Announce)
}

/// Handles inbound streams of the announcement protocol.
///
/// With a registry attached (receiving side) every announcement that offers
/// a file becomes a new registry entry. Without one (sharing side) the
/// announcement is only reported.
pub struct AnnouncementHandler<R> {
    registry: Option<Arc<R>>,
    io_timeout: Duration,
    events: broadcast::Sender<NodeEvent>,
}

impl<R: OfferLog> AnnouncementHandler<R> {
    #[must_use]
    pub fn registering(
        registry: Arc<R>,
        io_timeout: Duration,
        events: broadcast::Sender<NodeEvent>,
    ) -> Self {
        Self {
            registry: Some(registry),
            io_timeout,
            events,
        }
    }

    #[must_use]
    pub fn logging(io_timeout: Duration, events: broadcast::Sender<NodeEvent>) -> Self {
        Self {
            registry: None,
            io_timeout,
            events,
        }
    }

    fn register(&self, registry: &R, offer: OfferDescriptor, origin: PeerId) {
        if !offer.has_file() {
            debug!(peer = %origin.short(), "Peer has nothing to offer, not registering");
            return;
        }

        let index = registry.append(offer.clone(), origin.clone());
        let entry = RegistryEntry {
            index,
            offer,
            origin,
        };
        info!(index = index, peer = %entry.origin.short(), offer = %entry.offer, "Offer discovered");
        let _ = self.events.send(NodeEvent::OfferDiscovered { entry });
    }
}

impl<R: OfferLog, S: DataStream> StreamHandler<S> for AnnouncementHandler<R> {
    async fn handle(&self, mut stream: S, peer: PeerId) {
        let offer = match read_announcement(&mut stream, self.io_timeout).await {
            Ok(offer) => offer,
            Err(e) => {
                warn!(peer = %peer.short(), error = %e, "Reading hello failed");
                let _ = self.events.send(NodeEvent::AnnouncementFailed {
                    peer,
                    message: format!("reading hello: {e:#}"),
                });
                return;
            }
        };

        match &self.registry {
            Some(registry) => self.register(registry, offer, peer),
            None => {
                info!(peer = %peer.short(), offer = %offer, "Found someone");
                let _ = self.events.send(NodeEvent::PeerFound { peer, offer });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryNetwork, MemoryStream};
    use crate::registry::OfferRegistry;
    use peerdrop_core::protocol::encode_frame_to_bytes;
    use peerdrop_core::transport::TransportEvent;
    use tokio::sync::mpsc;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn alice() -> OfferDescriptor {
        OfferDescriptor {
            name: "alice".into(),
            hostname: "laptop".into(),
            file: "report.pdf".into(),
            size: 4096,
        }
    }

    /// Connects two memory peers and returns an open stream from `a` to `b`
    /// together with b's end of it.
    async fn stream_pair() -> (MemoryStream, MemoryStream, PeerId) {
        let network = MemoryNetwork::new();
        let (a, _a_events) = network.join();
        let (b, mut b_events) = network.join();
        network.connect(&a.local_peer(), &b.local_peer()).await.unwrap();
        b_events.recv().await.unwrap();

        let outbound = a
            .open_stream(&b.local_peer(), ANNOUNCE_PROTOCOL)
            .await
            .unwrap();
        let Some(TransportEvent::InboundStream { stream, .. }) = b_events.recv().await else {
            panic!("expected InboundStream");
        };
        (outbound, stream, a.local_peer())
    }

    fn receiving_handler() -> (
        AnnouncementHandler<OfferRegistry>,
        Arc<OfferRegistry>,
        broadcast::Receiver<NodeEvent>,
    ) {
        let registry = Arc::new(OfferRegistry::new());
        let (events, events_rx) = broadcast::channel(16);
        let handler = AnnouncementHandler::registering(Arc::clone(&registry), TIMEOUT, events);
        (handler, registry, events_rx)
    }

    #[tokio::test]
    async fn given_offer_announced_when_handled_by_receiver_then_registered_at_index_zero() {
        let (mut outbound, inbound, origin) = stream_pair().await;
        let (handler, registry, mut events_rx) = receiving_handler();

        let frame = encode_payload_frame(MessageType::Announce, &alice()).unwrap();
        outbound.write_all(&frame).await.unwrap();
        outbound.shutdown().await.unwrap();

        handler.handle(inbound, origin.clone()).await;

        let entry = registry.get(0).unwrap();
        assert_eq!(entry.offer, alice());
        assert_eq!(entry.origin, origin);

        let NodeEvent::OfferDiscovered { entry } = events_rx.recv().await.unwrap() else {
            panic!("expected OfferDiscovered");
        };
        assert_eq!(entry.to_string(), "0: alice@laptop - report.pdf (4.00 KiB)");
    }

    #[tokio::test]
    async fn given_empty_file_announcement_when_handled_by_receiver_then_nothing_is_registered() {
        let (mut outbound, inbound, origin) = stream_pair().await;
        let (handler, registry, _events_rx) = receiving_handler();

        let frame =
            encode_payload_frame(MessageType::Announce, &OfferDescriptor::empty("bob", "desk"))
                .unwrap();
        outbound.write_all(&frame).await.unwrap();
        outbound.shutdown().await.unwrap();

        handler.handle(inbound, origin).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn given_malformed_payloads_when_handled_then_no_entry_and_failure_reported() {
        let garbage: Vec<Vec<u8>> = vec![
            b"this is not a frame at all".to_vec(),
            encode_frame_to_bytes(MessageType::Announce, b"{not json").unwrap().to_vec(),
            encode_frame_to_bytes(MessageType::Announce, br#"{"Name":1}"#).unwrap().to_vec(),
            encode_frame_to_bytes(MessageType::StreamOpen, b"{}").unwrap().to_vec(),
            encode_frame_to_bytes(MessageType::Announce, b"{}").unwrap()[..9].to_vec(),
            Vec::new(),
        ];

        for payload in garbage {
            let (mut outbound, inbound, origin) = stream_pair().await;
            let (handler, registry, mut events_rx) = receiving_handler();

            outbound.write_all(&payload).await.unwrap();
            outbound.shutdown().await.unwrap();
            handler.handle(inbound, origin).await;

            assert!(registry.is_empty(), "payload {payload:?} was registered");
            assert!(matches!(
                events_rx.recv().await.unwrap(),
                NodeEvent::AnnouncementFailed { .. }
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn given_silent_peer_when_handling_announcement_then_handler_gives_up_after_deadline() {
        let (_outbound, inbound, origin) = stream_pair().await;
        let (handler, registry, mut events_rx) = receiving_handler();

        handler.handle(inbound, origin).await;

        assert!(registry.is_empty());
        let NodeEvent::AnnouncementFailed { message, .. } = events_rx.recv().await.unwrap() else {
            panic!("expected AnnouncementFailed");
        };
        assert!(message.contains("timed out"));
    }

    #[tokio::test]
    async fn given_sharing_side_when_offer_arrives_then_peer_found_is_reported() {
        let (mut outbound, inbound, origin) = stream_pair().await;
        let (events, mut events_rx) = broadcast::channel(16);
        let handler = AnnouncementHandler::<OfferRegistry>::logging(TIMEOUT, events);

        let frame =
            encode_payload_frame(MessageType::Announce, &OfferDescriptor::empty("bob", "desk"))
                .unwrap();
        outbound.write_all(&frame).await.unwrap();
        outbound.shutdown().await.unwrap();
        handler.handle(inbound, origin.clone()).await;

        let NodeEvent::PeerFound { peer, offer } = events_rx.recv().await.unwrap() else {
            panic!("expected PeerFound");
        };
        assert_eq!(peer, origin);
        assert_eq!(offer.name, "bob");
    }

    #[tokio::test]
    async fn given_connected_peer_when_announcing_then_remote_decodes_same_offer() {
        let network = MemoryNetwork::new();
        let (a, _a_events) = network.join();
        let (b, mut b_events) = network.join();
        network.connect(&a.local_peer(), &b.local_peer()).await.unwrap();
        b_events.recv().await.unwrap();

        let (events, _events_rx) = broadcast::channel(16);
        announce_to(Arc::clone(&a), b.local_peer(), alice(), TIMEOUT, events).await;

        let Some(TransportEvent::InboundStream {
            peer,
            protocol,
            mut stream,
        }) = b_events.recv().await
        else {
            panic!("expected InboundStream");
        };
        assert_eq!(peer, a.local_peer());
        assert_eq!(protocol, ANNOUNCE_PROTOCOL);
        assert_eq!(read_announcement(&mut stream, TIMEOUT).await.unwrap(), alice());
    }

    #[tokio::test]
    async fn given_unconnected_peer_when_announcing_then_failure_is_reported() {
        let network = MemoryNetwork::new();
        let (a, _a_events) = network.join();
        let (events, mut events_rx) = broadcast::channel(16);

        announce_to(a, PeerId::from("nobody"), alice(), TIMEOUT, events).await;

        assert!(matches!(
            events_rx.recv().await.unwrap(),
            NodeEvent::AnnouncementFailed { .. }
        ));
    }

    #[tokio::test]
    async fn given_concurrent_announcements_when_handled_then_indices_are_dense() {
        const N: usize = 20;
        let (events, _events_rx) = broadcast::channel(64);
        let registry = Arc::new(OfferRegistry::new());
        let handler = Arc::new(AnnouncementHandler::registering(
            Arc::clone(&registry),
            TIMEOUT,
            events,
        ));

        let (tx, mut rx) = mpsc::channel(N);
        for i in 0..N {
            let (mut outbound, inbound, origin) = stream_pair().await;
            let mut offer = alice();
            offer.file = format!("file-{i}.bin");
            let frame = encode_payload_frame(MessageType::Announce, &offer).unwrap();
            outbound.write_all(&frame).await.unwrap();
            outbound.shutdown().await.unwrap();

            let handler = Arc::clone(&handler);
            let tx = tx.clone();
            tokio::spawn(async move {
                handler.handle(inbound, origin).await;
                let _ = tx.send(()).await;
            });
        }
        drop(tx);
        while rx.recv().await.is_some() {}

        let mut indices: Vec<usize> = registry.snapshot().iter().map(|e| e.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..N).collect::<Vec<_>>());
    }
}
