//! QUIC peer transport.
//!
//! One [`quinn::Endpoint`] per process acts as both server and client. Every
//! connection starts with a `Hello`/`HelloAck` exchange on its first
//! bidirectional stream so that both sides learn the remote [`PeerId`]; each
//! later bidirectional stream starts with a `StreamOpen` frame naming its
//! sub-protocol.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, bail, ensure};
use bytes::BytesMut;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use peerdrop_core::protocol::{
    HelloPayload, MessageType, PROTOCOL_VERSION, StreamOpenPayload, encode_payload_frame,
    expect_payload,
};
use peerdrop_core::tls;
use peerdrop_core::transport::{DataStream, PeerId, PeerTransport, TransportEvent, read_frame};

use crate::deadline::within;

const ALPN_PROTOCOL: &[u8] = b"peerdrop/1";
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
const EVENT_QUEUE: usize = 64;

/// A bidirectional QUIC stream carrying one sub-protocol exchange.
///
/// Bytes that arrived together with the `StreamOpen` header are kept in
/// `pending` and returned by the first reads.
pub struct QuicStream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    pending: BytesMut,
}

impl QuicStream {
    fn new(send: quinn::SendStream, recv: quinn::RecvStream) -> Self {
        Self {
            send,
            recv,
            pending: BytesMut::new(),
        }
    }
}

impl DataStream for QuicStream {
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            if !self.pending.is_empty() {
                let n = buf.len().min(self.pending.len());
                buf[..n].copy_from_slice(&self.pending.split_to(n));
                return Ok(n);
            }
            self.recv
                .read(buf)
                .await
                .context("failed to read from QUIC stream")?
                .map_or(Ok(0), Ok)
        }
    }

    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            self.send
                .write_all(buf)
                .await
                .context("failed to write to QUIC stream")
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move { self.send.finish().context("failed to finish QUIC stream") }
    }

    fn abort(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            self.send
                .reset(0u32.into())
                .context("failed to reset QUIC stream")
        }
    }
}

type EventTx = mpsc::Sender<TransportEvent<QuicStream>>;

/// A registered connection and the peer that dialed it.
struct Tracked {
    connection: quinn::Connection,
    dialer: PeerId,
}

impl Tracked {
    fn is_live(&self) -> bool {
        self.connection.close_reason().is_none()
    }
}

/// The LAN transport: QUIC connections identified by a per-process
/// [`PeerId`].
///
/// At most one live connection is kept per peer. When both peers dial each
/// other, the connection dialed by the peer with the smaller id is kept on
/// both sides and the other one is closed. A connection that closes is
/// forgotten, so the peer can be dialed again.
pub struct QuicTransport {
    local: PeerId,
    endpoint: quinn::Endpoint,
    connections: Mutex<HashMap<PeerId, Tracked>>,
    dialing: Mutex<HashSet<SocketAddr>>,
    events: EventTx,
    handshake_timeout: Duration,
}

impl QuicTransport {
    /// Binds the endpoint on `listen` and starts accepting connections.
    ///
    /// Returns the transport together with the receiver for its events.
    ///
    /// # Errors
    ///
    /// Returns an error if certificate generation, TLS configuration or
    /// binding the UDP socket fails.
    pub fn bind(
        listen: SocketAddr,
        handshake_timeout: Duration,
    ) -> anyhow::Result<(Arc<Self>, mpsc::Receiver<TransportEvent<QuicStream>>)> {
        let local = PeerId::random();

        let mut endpoint = quinn::Endpoint::server(build_server_config(&local)?, listen)
            .with_context(|| format!("failed to bind QUIC endpoint on {listen}"))?;
        endpoint.set_default_client_config(insecure_client_config()?);

        let addr = endpoint
            .local_addr()
            .context("failed to retrieve local address")?;
        info!(addr = %addr, peer = %local.short(), "QUIC endpoint bound");

        let (events, events_rx) = mpsc::channel(EVENT_QUEUE);
        let transport = Arc::new(Self {
            local,
            endpoint,
            connections: Mutex::new(HashMap::new()),
            dialing: Mutex::new(HashSet::new()),
            events,
            handshake_timeout,
        });

        tokio::spawn(accept_loop(Arc::clone(&transport)));
        Ok((transport, events_rx))
    }

    /// Address the endpoint is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.endpoint
            .local_addr()
            .context("failed to retrieve local address")
    }

    /// Whether a live connection to `peer` exists.
    #[must_use]
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.lock_connections()
            .get(peer)
            .is_some_and(Tracked::is_live)
    }

    /// Connects to the peer listening on `addr` and returns its id.
    ///
    /// Dialing a peer that is already connected keeps the existing
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns an error if a dial to `addr` is already in progress, the
    /// connection or its identification handshake fails, or `addr` turns out
    /// to be the local endpoint.
    pub async fn dial(self: &Arc<Self>, addr: SocketAddr) -> anyhow::Result<PeerId> {
        let _guard = DialGuard::claim(self, addr)?;
        debug!(addr = %addr, "Dialing peer");

        let connecting = self
            .endpoint
            .connect(addr, tls::SERVER_NAME)
            .with_context(|| format!("failed to start connection to {addr}"))?;
        let connection = within(self.handshake_timeout, "connecting", async {
            connecting
                .await
                .with_context(|| format!("failed to connect to {addr}"))
        })
        .await?;

        let (send, recv) = connection
            .open_bi()
            .await
            .context("failed to open identification stream")?;
        let mut stream = QuicStream::new(send, recv);

        let hello = encode_payload_frame(MessageType::Hello, &self.hello())?;
        within(self.handshake_timeout, "sending hello", stream.write_all(&hello)).await?;
        stream.shutdown().await?;

        let mut accum = BytesMut::new();
        let frame = within(
            self.handshake_timeout,
            "waiting for hello ack",
            read_frame(&mut stream, &mut accum),
        )
        .await?;
        let ack: HelloPayload = expect_payload(&frame, MessageType::HelloAck)?;
        let peer = self.check_hello(&ack, &connection)?;

        info!(peer = %peer.short(), addr = %addr, "Connected to peer");
        let dialer = self.local.clone();
        if !self.register(&peer, &connection, dialer) {
            debug!(peer = %peer.short(), "Already connected, closing duplicate connection");
            connection.close(0u32.into(), b"duplicate");
        }
        Ok(peer)
    }

    /// Closes every connection and stops accepting new ones.
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"shutting down");
    }

    fn hello(&self) -> HelloPayload {
        HelloPayload {
            peer_id: self.local.to_string(),
            protocol_version: PROTOCOL_VERSION.to_owned(),
        }
    }

    fn check_hello(
        &self,
        hello: &HelloPayload,
        connection: &quinn::Connection,
    ) -> anyhow::Result<PeerId> {
        ensure!(
            hello.protocol_version == PROTOCOL_VERSION,
            "unsupported protocol version {} (expected {PROTOCOL_VERSION})",
            hello.protocol_version
        );
        let peer = PeerId::from(hello.peer_id.as_str());
        if peer == self.local {
            connection.close(0u32.into(), b"self");
            bail!("connected to ourselves");
        }
        Ok(peer)
    }

    async fn accept_connection(self: &Arc<Self>, incoming: quinn::Incoming) -> anyhow::Result<()> {
        let connection = within(self.handshake_timeout, "accepting connection", async {
            incoming
                .await
                .context("failed to complete QUIC handshake")
        })
        .await?;
        let addr = connection.remote_address();

        let (send, recv) = within(self.handshake_timeout, "waiting for hello", async {
            connection
                .accept_bi()
                .await
                .context("failed to accept identification stream")
        })
        .await?;
        let mut stream = QuicStream::new(send, recv);

        let mut accum = BytesMut::new();
        let frame = within(
            self.handshake_timeout,
            "reading hello",
            read_frame(&mut stream, &mut accum),
        )
        .await?;
        let hello: HelloPayload = expect_payload(&frame, MessageType::Hello)?;
        let peer = self.check_hello(&hello, &connection)?;

        let ack = encode_payload_frame(MessageType::HelloAck, &self.hello())?;
        within(self.handshake_timeout, "sending hello ack", stream.write_all(&ack)).await?;
        stream.shutdown().await?;

        info!(peer = %peer.short(), addr = %addr, "Accepted peer");
        if !self.register(&peer, &connection, peer.clone()) {
            // Give the dialer time to read the ack before the duplicate goes.
            let _ = tokio::time::timeout(self.handshake_timeout, connection.closed()).await;
            if connection.close_reason().is_none() {
                debug!(peer = %peer.short(), "Closing duplicate connection");
                connection.close(0u32.into(), b"duplicate");
            }
        }
        Ok(())
    }

    /// Tracks `connection` for `peer` and starts serving its streams.
    ///
    /// Returns `false` without doing anything if a live connection to `peer`
    /// already exists and should be kept. An existing connection is replaced
    /// only when `dialer` is the smaller of the two ids and the existing one
    /// was dialed by the other side; the replaced connection is closed.
    fn register(
        self: &Arc<Self>,
        peer: &PeerId,
        connection: &quinn::Connection,
        dialer: PeerId,
    ) -> bool {
        let preferred = (&self.local).min(peer);
        let replaced = {
            let mut connections = self.lock_connections();
            if let Some(existing) = connections.get(peer).filter(|t| t.is_live()) {
                if existing.dialer == *preferred || dialer != *preferred {
                    return false;
                }
            }
            connections.insert(
                peer.clone(),
                Tracked {
                    connection: connection.clone(),
                    dialer,
                },
            )
        };

        if let Some(old) = replaced.filter(Tracked::is_live) {
            debug!(peer = %peer.short(), "Replacing cross-dialed connection");
            old.connection.close(0u32.into(), b"duplicate");
        }
        tokio::spawn(Arc::clone(self).serve_connection(peer.clone(), connection.clone()));
        true
    }

    async fn serve_connection(self: Arc<Self>, peer: PeerId, connection: quinn::Connection) {
        self.emit(TransportEvent::PeerConnected { peer: peer.clone() })
            .await;

        loop {
            match connection.accept_bi().await {
                Ok((send, recv)) => {
                    let transport = Arc::clone(&self);
                    let peer = peer.clone();
                    tokio::spawn(async move { transport.accept_stream(peer, send, recv).await });
                }
                Err(e) => {
                    info!(peer = %peer.short(), reason = %e, "Connection closed");
                    break;
                }
            }
        }

        let mut connections = self.lock_connections();
        if connections
            .get(&peer)
            .is_some_and(|t| t.connection.stable_id() == connection.stable_id())
        {
            connections.remove(&peer);
        }
    }

    async fn accept_stream(&self, peer: PeerId, send: quinn::SendStream, recv: quinn::RecvStream) {
        let mut stream = QuicStream::new(send, recv);
        let mut accum = BytesMut::new();

        let header = within(
            self.handshake_timeout,
            "reading stream header",
            read_frame(&mut stream, &mut accum),
        )
        .await
        .and_then(|frame| expect_payload::<StreamOpenPayload>(&frame, MessageType::StreamOpen));

        match header {
            Ok(open) => {
                debug!(peer = %peer.short(), protocol = %open.protocol, "Inbound stream");
                stream.pending = accum;
                self.emit(TransportEvent::InboundStream {
                    peer,
                    protocol: open.protocol,
                    stream,
                })
                .await;
            }
            Err(e) => {
                warn!(peer = %peer.short(), error = %e, "Dropping stream with bad header");
            }
        }
    }

    async fn emit(&self, event: TransportEvent<QuicStream>) {
        if self.events.send(event).await.is_err() {
            debug!("Transport event receiver dropped");
        }
    }

    fn lock_connections(&self) -> MutexGuard<'_, HashMap<PeerId, Tracked>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl PeerTransport for QuicTransport {
    type Stream = QuicStream;

    fn local_peer(&self) -> PeerId {
        self.local.clone()
    }

    fn open_stream<'a>(
        &'a self,
        peer: &'a PeerId,
        protocol: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::Stream>> + Send + 'a {
        async move {
            let connection = self
                .lock_connections()
                .get(peer)
                .map(|t| t.connection.clone())
                .with_context(|| format!("not connected to peer {peer}"))?;

            let (send, recv) = connection
                .open_bi()
                .await
                .with_context(|| format!("failed to open stream to peer {peer}"))?;
            let mut stream = QuicStream::new(send, recv);

            let header = encode_payload_frame(
                MessageType::StreamOpen,
                &StreamOpenPayload {
                    protocol: protocol.to_owned(),
                },
            )?;
            stream.write_all(&header).await?;
            Ok(stream)
        }
    }
}

/// Marks a dial to one address as in progress for as long as it lives.
struct DialGuard<'a> {
    transport: &'a QuicTransport,
    addr: SocketAddr,
}

impl<'a> DialGuard<'a> {
    fn claim(transport: &'a QuicTransport, addr: SocketAddr) -> anyhow::Result<Self> {
        let mut dialing = transport
            .dialing
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        ensure!(dialing.insert(addr), "already dialing {addr}");
        Ok(Self { transport, addr })
    }
}

impl Drop for DialGuard<'_> {
    fn drop(&mut self) {
        self.transport
            .dialing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.addr);
    }
}

async fn accept_loop(transport: Arc<QuicTransport>) {
    while let Some(incoming) = transport.endpoint.accept().await {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            if let Err(e) = transport.accept_connection(incoming).await {
                warn!(error = %e, "Inbound connection failed");
            }
        });
    }
    debug!("QUIC endpoint closed, accept loop stopped");
}

fn transport_config() -> Arc<quinn::TransportConfig> {
    let mut config = quinn::TransportConfig::default();
    config.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    Arc::new(config)
}

fn build_server_config(local: &PeerId) -> anyhow::Result<quinn::ServerConfig> {
    let pair = tls::generate_peer_certificate(local)?;

    let cert_der = rustls::pki_types::CertificateDer::from(pair.cert_der);
    let key_der = rustls::pki_types::PrivateKeyDer::Pkcs8(
        rustls::pki_types::PrivatePkcs8KeyDer::from(pair.private_key_pkcs8_der),
    );

    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .context("failed to build rustls server config")?;

    tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let quic_config: QuicServerConfig = tls_config
        .try_into()
        .context("failed to build QUIC server config")?;

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_config));
    server_config.transport_config(transport_config());
    Ok(server_config)
}

/// Builds a QUIC client config that skips server certificate verification.
///
/// Peers are anonymous; the certificate only exists to satisfy TLS.
///
/// # Errors
///
/// Returns an error if the TLS client configuration fails to build.
pub fn insecure_client_config() -> anyhow::Result<quinn::ClientConfig> {
    let mut tls_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();

    tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let quic_config: QuicClientConfig = tls_config
        .try_into()
        .context("failed to build QUIC client config")?;

    let mut client_config = quinn::ClientConfig::new(Arc::new(quic_config));
    client_config.transport_config(transport_config());
    Ok(client_config)
}

#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
