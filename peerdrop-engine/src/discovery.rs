//! LAN peer discovery over UDP broadcast.
//!
//! Every peer broadcasts a small JSON beacon carrying its id and QUIC port.
//! A beacon from an unknown peer triggers a dial, but only from the peer with
//! the smaller id, so two peers never dial each other at the same time.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use peerdrop_core::transport::{PeerId, PeerTransport};

use crate::quic::QuicTransport;

pub const DEFAULT_DISCOVERY_PORT: u16 = 47474;
pub const BEACON_INTERVAL: Duration = Duration::from_secs(5);

const MAX_BEACON_LEN: usize = 1024;

/// Datagram announcing a peer's presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub peer_id: String,
    /// QUIC port of the sender; the address is taken from the datagram.
    pub port: u16,
}

/// Decodes a received datagram.
///
/// # Errors
///
/// Returns an error if the datagram is not a JSON beacon.
pub fn parse_beacon(datagram: &[u8]) -> anyhow::Result<Beacon> {
    serde_json::from_slice(datagram).context("malformed beacon")
}

/// Tie-break between two peers that discovered each other: the smaller id
/// dials.
#[must_use]
pub fn should_dial(local: &PeerId, remote: &PeerId) -> bool {
    local < remote
}

/// Address to dial in response to `beacon`, or `None` if the beacon is our
/// own, the remote is expected to dial us, or we are already connected.
#[must_use]
pub fn dial_target(
    local: &PeerId,
    beacon: &Beacon,
    from: IpAddr,
    connected: bool,
) -> Option<SocketAddr> {
    let remote = PeerId::from(beacon.peer_id.as_str());
    if &remote == local || connected || !should_dial(local, &remote) {
        return None;
    }
    Some(SocketAddr::new(from, beacon.port))
}

/// Binds a broadcast-capable UDP socket on `port`, shared with other
/// processes on the same host.
///
/// # Errors
///
/// Returns an error if the socket cannot be created, configured or bound.
pub fn bind_discovery_socket(port: u16) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("failed to create discovery socket")?;
    socket
        .set_reuse_address(true)
        .context("failed to set SO_REUSEADDR")?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .context("failed to set SO_REUSEPORT")?;
    socket
        .set_broadcast(true)
        .context("failed to enable broadcast")?;
    socket.set_nonblocking(true)?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind discovery socket on {addr}"))?;

    UdpSocket::from_std(socket.into()).context("failed to register discovery socket")
}

/// Broadcasts our beacon and dials the peers whose beacons we hear.
pub struct Discovery {
    transport: Arc<QuicTransport>,
    socket: UdpSocket,
    port: u16,
    beacon: Vec<u8>,
}

impl Discovery {
    /// # Errors
    ///
    /// Returns an error if the discovery socket cannot be bound or the QUIC
    /// address cannot be read.
    pub fn bind(transport: Arc<QuicTransport>, port: u16) -> anyhow::Result<Self> {
        let socket = bind_discovery_socket(port)?;
        let beacon = serde_json::to_vec(&Beacon {
            peer_id: transport.local_peer().to_string(),
            port: transport.local_addr()?.port(),
        })?;
        info!(port = port, "Discovery listening");
        Ok(Self {
            transport,
            socket,
            port,
            beacon,
        })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let target = SocketAddr::from((Ipv4Addr::BROADCAST, self.port));
        let mut ticker = tokio::time::interval(BEACON_INTERVAL);
        let mut buf = [0u8; MAX_BEACON_LEN];

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.socket.send_to(&self.beacon, target).await {
                        warn!(error = %e, "Failed to broadcast beacon");
                    }
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, from)) => self.on_datagram(&buf[..n], from),
                    Err(e) => warn!(error = %e, "Discovery receive failed"),
                },
            }
        }
    }

    fn on_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let beacon = match parse_beacon(datagram) {
            Ok(beacon) => beacon,
            Err(e) => {
                debug!(from = %from, error = %e, "Ignoring datagram");
                return;
            }
        };

        let local = self.transport.local_peer();
        let connected = self
            .transport
            .is_connected(&PeerId::from(beacon.peer_id.as_str()));
        let Some(addr) = dial_target(&local, &beacon, from.ip(), connected) else {
            trace!(from = %from, "Beacon needs no dial");
            return;
        };

        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            match transport.dial(addr).await {
                Ok(peer) => debug!(peer = %peer.short(), addr = %addr, "Discovered peer"),
                Err(e) => debug!(addr = %addr, error = %e, "Dial after beacon failed"),
            }
        });
    }
}
