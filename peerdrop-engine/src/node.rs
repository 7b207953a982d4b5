use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use peerdrop_core::offer::{OfferDescriptor, RegistryEntry};
use peerdrop_core::protocol::{ANNOUNCE_PROTOCOL, TRANSFER_PROTOCOL};
use peerdrop_core::transport::{DataStream, PeerId, PeerTransport, TransportEvent};

use crate::announce::{AnnouncementHandler, announce_to};
use crate::registry::OfferLog;
use crate::transfer::{SharedFile, TransferReport, TransferServer, fetch_offer};

/// Default per-operation deadline for stream and file I/O.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Handler for inbound streams of one sub-protocol.
///
/// The node calls [`handle`](StreamHandler::handle) for every inbound stream
/// of the protocol the handler is registered for, each in its own spawned
/// task, together with the peer the transport says opened it.
pub trait StreamHandler<S: DataStream>: Send + Sync + 'static {
    fn handle(&self, stream: S, peer: PeerId) -> impl Future<Output = ()> + Send;
}

// ── Node commands (CLI → node) ──────────────────────────────────────

/// Commands sent to a running node.
#[derive(Debug)]
pub enum NodeCmd {
    /// Retrieve the offer described by `entry`; the outcome is sent back on
    /// `reply`.
    Fetch {
        entry: RegistryEntry,
        reply: oneshot::Sender<anyhow::Result<TransferReport>>,
    },
    /// Stop handling connections and streams.
    ShutDown,
}

// ── Node events (node → CLI) ────────────────────────────────────────

/// Events emitted by the node for the CLI to observe.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// The transport established a connection to `peer`.
    PeerConnected { peer: PeerId },
    /// The local offer was delivered to `peer`.
    AnnouncementSent { peer: PeerId },
    /// Sending or reading an announcement failed.
    AnnouncementFailed { peer: PeerId, message: String },
    /// An announcement was received while sharing.
    PeerFound { peer: PeerId, offer: OfferDescriptor },
    /// An announcement offering a file was registered.
    OfferDiscovered { entry: RegistryEntry },
    /// The shared file was streamed to `peer`.
    TransferServed { peer: PeerId, bytes: u64 },
    /// Streaming the shared file to `peer` failed.
    TransferServeFailed { peer: PeerId, message: String },
    /// Retrieval of `entry` has started.
    TransferStarted { entry: RegistryEntry },
    /// Retrieval of `entry` finished.
    TransferComplete {
        entry: RegistryEntry,
        report: TransferReport,
    },
    /// Retrieval of `entry` failed.
    TransferFailed { entry: RegistryEntry, message: String },
    /// Operator input was rejected.
    SelectionRejected { message: String },
    /// A non-fatal error occurred inside the node.
    Error { message: String },
}

// ── Node ────────────────────────────────────────────────────────────

/// What the local peer does.
#[derive(Clone, Debug)]
pub enum Role {
    /// Announce and serve one file; log the announcements of others.
    Share(SharedFile),
    /// Announce nothing; collect the offers of others.
    Receive,
}

/// Settings shared by every handler the node spawns.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Display name put into announcements.
    pub name: String,
    /// Host label put into announcements.
    pub hostname: String,
    /// Deadline for each stream open/read/write.
    pub io_timeout: Duration,
    /// Where retrieved files are written.
    pub receive_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "unknown".into(),
            hostname: "localhost".into(),
            io_timeout: DEFAULT_IO_TIMEOUT,
            receive_dir: PathBuf::from("."),
        }
    }
}

/// Handle returned by [`Node::start`].
pub struct NodeHandle<R> {
    pub cmd_tx: mpsc::Sender<NodeCmd>,
    pub events_tx: broadcast::Sender<NodeEvent>,
    pub registry: Arc<R>,
    pub local_peer: PeerId,
}

impl<R> NodeHandle<R> {
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events_tx.subscribe()
    }
}

/// The peerdrop node.
///
/// Wires the exchange protocol to a [`PeerTransport`]: every new connection
/// gets an announcement, inbound streams are routed to the handler
/// registered for their protocol, and `Fetch` commands start retrievals.
pub struct Node {
    role: Role,
    config: NodeConfig,
}

impl Node {
    #[must_use]
    pub fn new(role: Role, config: NodeConfig) -> Self {
        Self { role, config }
    }

    /// The descriptor this node announces to every peer.
    #[must_use]
    pub fn local_offer(&self) -> OfferDescriptor {
        match &self.role {
            Role::Share(file) => OfferDescriptor {
                name: self.config.name.clone(),
                hostname: self.config.hostname.clone(),
                file: file.file_name.clone(),
                size: file.size,
            },
            Role::Receive => {
                OfferDescriptor::empty(self.config.name.clone(), self.config.hostname.clone())
            }
        }
    }

    /// Spawn the node event loop and return a handle to control it.
    pub fn start<T, R>(
        self,
        transport: Arc<T>,
        transport_events: mpsc::Receiver<TransportEvent<T::Stream>>,
        registry: Arc<R>,
    ) -> NodeHandle<R>
    where
        T: PeerTransport,
        R: OfferLog,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel::<NodeCmd>(32);
        let (events_tx, _) = broadcast::channel::<NodeEvent>(128);
        let local_peer = transport.local_peer();

        let offer = self.local_offer();
        let io_timeout = self.config.io_timeout;
        let handlers = match self.role {
            Role::Share(file) => Handlers {
                announce: Arc::new(AnnouncementHandler::logging(io_timeout, events_tx.clone())),
                transfer: Some(Arc::new(TransferServer::new(
                    file,
                    io_timeout,
                    events_tx.clone(),
                ))),
            },
            Role::Receive => Handlers {
                announce: Arc::new(AnnouncementHandler::registering(
                    Arc::clone(&registry),
                    io_timeout,
                    events_tx.clone(),
                )),
                transfer: None,
            },
        };

        info!(peer = %local_peer.short(), file = %offer.file, "Spawning node event loop");

        tokio::spawn(run_node_loop(
            transport,
            transport_events,
            handlers,
            offer,
            self.config,
            cmd_rx,
            events_tx.clone(),
        ));

        NodeHandle {
            cmd_tx,
            events_tx,
            registry,
            local_peer,
        }
    }
}

/// Stream handlers, one per sub-protocol.
struct Handlers<R> {
    announce: Arc<AnnouncementHandler<R>>,
    transfer: Option<Arc<TransferServer>>,
}

async fn run_node_loop<T, R>(
    transport: Arc<T>,
    mut transport_events: mpsc::Receiver<TransportEvent<T::Stream>>,
    handlers: Handlers<R>,
    offer: OfferDescriptor,
    config: NodeConfig,
    mut cmd_rx: mpsc::Receiver<NodeCmd>,
    events: broadcast::Sender<NodeEvent>,
) where
    T: PeerTransport,
    R: OfferLog,
{
    debug!("Node event loop running");

    loop {
        tokio::select! {
            biased;

            // ── Commands ────────────────────────────────────────
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(NodeCmd::Fetch { entry, reply }) => {
                        spawn_fetch(Arc::clone(&transport), entry, &config, events.clone(), reply);
                    }
                    Some(NodeCmd::ShutDown) => {
                        info!("Received ShutDown command");
                        break;
                    }
                    None => {
                        debug!("Command channel closed, shutting down");
                        break;
                    }
                }
            }

            // ── Transport notifications ──────────────────────────
            event = transport_events.recv() => {
                match event {
                    Some(TransportEvent::PeerConnected { peer }) => {
                        debug!(peer = %peer.short(), "Peer connected, announcing");
                        let _ = events.send(NodeEvent::PeerConnected { peer: peer.clone() });
                        tokio::spawn(announce_to(
                            Arc::clone(&transport),
                            peer,
                            offer.clone(),
                            config.io_timeout,
                            events.clone(),
                        ));
                    }
                    Some(TransportEvent::InboundStream { peer, protocol, stream }) => {
                        route_stream(&handlers, peer, &protocol, stream);
                    }
                    None => {
                        info!("Transport stopped, shutting down");
                        let _ = events.send(NodeEvent::Error {
                            message: "transport stopped".into(),
                        });
                        break;
                    }
                }
            }
        }
    }

    info!("Node event loop stopped");
}

/// Hands an inbound stream to the handler registered for `protocol`.
fn route_stream<S, R>(handlers: &Handlers<R>, peer: PeerId, protocol: &str, stream: S)
where
    S: DataStream,
    R: OfferLog,
{
    match protocol {
        ANNOUNCE_PROTOCOL => {
            let handler = Arc::clone(&handlers.announce);
            tokio::spawn(async move { handler.handle(stream, peer).await });
        }
        TRANSFER_PROTOCOL => match &handlers.transfer {
            Some(server) => {
                let server = Arc::clone(server);
                tokio::spawn(async move { server.handle(stream, peer).await });
            }
            None => {
                warn!(peer = %peer.short(), "Transfer requested but nothing is shared, dropping stream");
            }
        },
        other => {
            warn!(peer = %peer.short(), protocol = %other, "No handler for protocol, dropping stream");
        }
    }
}

/// Spawns the retrieval of `entry` and reports its outcome on `reply`.
fn spawn_fetch<T: PeerTransport>(
    transport: Arc<T>,
    entry: RegistryEntry,
    config: &NodeConfig,
    events: broadcast::Sender<NodeEvent>,
    reply: oneshot::Sender<anyhow::Result<TransferReport>>,
) {
    info!(
        index = entry.index,
        file = %entry.offer.file,
        from = %entry.offer.name,
        "Fetching offer"
    );
    let _ = events.send(NodeEvent::TransferStarted {
        entry: entry.clone(),
    });

    let dest_dir = config.receive_dir.clone();
    let io_timeout = config.io_timeout;

    tokio::spawn(async move {
        let result = fetch_offer(transport.as_ref(), &entry, &dest_dir, io_timeout).await;
        match &result {
            Ok(report) => {
                info!(path = %report.path.display(), bytes = report.bytes, "Transfer complete");
                let _ = events.send(NodeEvent::TransferComplete {
                    entry,
                    report: report.clone(),
                });
            }
            Err(e) => {
                warn!(index = entry.index, error = %e, "Transfer failed");
                let _ = events.send(NodeEvent::TransferFailed {
                    entry,
                    message: format!("{e:#}"),
                });
            }
        }
        let _ = reply.send(result);
    });
}

// ── Tests ───────────────────────────────────────────────────────────
