//! The transfer sub-protocol.
//!
//! The requester opens a stream, sends nothing and half-closes it; the
//! sharing side answers with the raw bytes of its file and closes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, ensure};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use peerdrop_core::offer::{RegistryEntry, format_size};
use peerdrop_core::protocol::TRANSFER_PROTOCOL;
use peerdrop_core::transport::{DataStream, PeerId, PeerTransport};

use crate::deadline::within;
use crate::node::{NodeEvent, StreamHandler};

const CHUNK_SIZE: usize = 64 * 1024;

/// The file offered by the local peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFile {
    pub path: PathBuf,
    /// Name announced to peers: the last component of `path`.
    pub file_name: String,
    pub size: u64,
}

impl SharedFile {
    /// Checks that `path` is a readable regular file and records its name
    /// and size.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be inspected or is not a regular
    /// file.
    pub async fn inspect(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        ensure!(metadata.is_file(), "{} is not a regular file", path.display());

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", path.display()))?;

        Ok(Self {
            path,
            file_name,
            size: metadata.len(),
        })
    }
}

/// Outcome of a completed retrieval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Streams the whole of the file at `path` into `stream`, then closes it.
///
/// Returns the number of bytes sent.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the stream fails or
/// stalls past `io_timeout`.
pub async fn serve_file<S: DataStream>(
    stream: &mut S,
    path: &Path,
    io_timeout: Duration,
) -> anyhow::Result<u64> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("error opening file {}", path.display()))?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent: u64 = 0;
    loop {
        let n = file.read(&mut buf).await.context("error reading file")?;
        if n == 0 {
            break;
        }
        within(io_timeout, "writing file data", stream.write_all(&buf[..n])).await?;
        sent += n as u64;
    }

    within(io_timeout, "closing transfer stream", stream.shutdown()).await?;
    Ok(sent)
}

/// Retrieves the offer described by `entry` into `dest_dir`.
///
/// The destination file is named after the offer's declared file name and
/// truncated if it already exists.
///
/// # Errors
///
/// Returns an error if the stream cannot be opened, the destination cannot
/// be written, or the stream fails or stalls past `io_timeout`.
pub async fn fetch_offer<T: PeerTransport>(
    transport: &T,
    entry: &RegistryEntry,
    dest_dir: &Path,
    io_timeout: Duration,
) -> anyhow::Result<TransferReport> {
    let file_name = &entry.offer.file;
    if file_name.contains(['/', '\\']) || file_name == ".." {
        // Names are used verbatim; see DESIGN.md.
        warn!(file = %file_name, "Offered file name is not a bare file name");
    }

    let mut stream = within(
        io_timeout,
        "opening transfer stream",
        transport.open_stream(&entry.origin, TRANSFER_PROTOCOL),
    )
    .await?;
    within(io_timeout, "sending transfer request", stream.shutdown()).await?;

    let path = dest_dir.join(file_name);
    let received = match receive_to_file(&mut stream, &path, io_timeout).await {
        Ok(received) => received,
        Err(e) => {
            // A failed transfer leaves no partial file behind.
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }
    };

    if received != entry.offer.size {
        warn!(
            file = %file_name,
            declared = entry.offer.size,
            received = received,
            "Received size differs from the announced size"
        );
    }

    Ok(TransferReport {
        path,
        bytes: received,
    })
}

async fn receive_to_file<S: DataStream>(
    stream: &mut S,
    path: &Path,
    io_timeout: Duration,
) -> anyhow::Result<u64> {
    let mut out = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("create error: {}", path.display()))?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut received: u64 = 0;
    loop {
        let n = within(io_timeout, "reading file data", stream.read(&mut buf)).await?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])
            .await
            .with_context(|| format!("write error: {}", path.display()))?;
        received += n as u64;
    }
    out.flush()
        .await
        .with_context(|| format!("write error: {}", path.display()))?;
    Ok(received)
}

/// Serves the shared file to every inbound transfer stream.
pub struct TransferServer {
    file: SharedFile,
    io_timeout: Duration,
    events: broadcast::Sender<NodeEvent>,
}

impl TransferServer {
    #[must_use]
    pub fn new(file: SharedFile, io_timeout: Duration, events: broadcast::Sender<NodeEvent>) -> Self {
        Self {
            file,
            io_timeout,
            events,
        }
    }
}

impl<S: DataStream> StreamHandler<S> for TransferServer {
    async fn handle(&self, mut stream: S, peer: PeerId) {
        match serve_file(&mut stream, &self.file.path, self.io_timeout).await {
            Ok(bytes) => {
                info!(
                    peer = %peer.short(),
                    file = %self.file.file_name,
                    size = %format_size(bytes),
                    "File served"
                );
                let _ = self.events.send(NodeEvent::TransferServed { peer, bytes });
            }
            Err(e) => {
                warn!(peer = %peer.short(), error = %e, "Error copying file");
                if let Err(abort_err) = stream.abort().await {
                    debug!(peer = %peer.short(), error = %abort_err, "Could not abort transfer stream");
                }
                let _ = self.events.send(NodeEvent::TransferServeFailed {
                    peer,
                    message: format!("error copying file: {e:#}"),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use peerdrop_core::offer::OfferDescriptor;
    use peerdrop_core::transport::TransportEvent;
    use tokio::sync::mpsc;

    use super::*;
    use crate::memory::{MemoryNetwork, MemoryStream, MemoryTransport};

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Pair {
        requester: Arc<MemoryTransport>,
        server_peer: PeerId,
        server_events: mpsc::Receiver<TransportEvent<MemoryStream>>,
        _requester_events: mpsc::Receiver<TransportEvent<MemoryStream>>,
    }

    async fn connected_pair() -> Pair {
        let network = MemoryNetwork::new();
        let (requester, mut requester_events) = network.join();
        let (server, mut server_events) = network.join();
        network
            .connect(&requester.local_peer(), &server.local_peer())
            .await
            .unwrap();
        requester_events.recv().await.unwrap();
        server_events.recv().await.unwrap();
        Pair {
            requester,
            server_peer: server.local_peer(),
            server_events,
            _requester_events: requester_events,
        }
    }

    fn entry_for(peer: &PeerId, file: &str, size: u64) -> RegistryEntry {
        RegistryEntry {
            index: 0,
            offer: OfferDescriptor {
                name: "alice".into(),
                hostname: "laptop".into(),
                file: file.into(),
                size,
            },
            origin: peer.clone(),
        }
    }

    /// Answers the next inbound transfer stream with `server`.
    fn spawn_server(mut pair_events: mpsc::Receiver<TransportEvent<MemoryStream>>, server: TransferServer) {
        tokio::spawn(async move {
            if let Some(TransportEvent::InboundStream { peer, stream, .. }) = pair_events.recv().await {
                server.handle(stream, peer).await;
            }
        });
    }

    #[tokio::test]
    async fn given_shared_path_when_inspected_then_announces_base_name_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.pdf");
        tokio::fs::write(&path, vec![7u8; 4096]).await.unwrap();

        let shared = SharedFile::inspect(&path).await.unwrap();
        assert_eq!(shared.file_name, "report.pdf");
        assert_eq!(shared.size, 4096);
    }

    #[tokio::test]
    async fn given_directory_or_missing_path_when_inspected_then_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SharedFile::inspect(dir.path()).await.is_err());
        assert!(SharedFile::inspect(dir.path().join("missing")).await.is_err());
    }

    #[tokio::test]
    async fn given_served_file_when_fetched_then_destination_is_byte_identical() {
        let src_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0u32..200_000).map(|i| (i % 251) as u8).collect();
        let src = src_dir.path().join("data.bin");
        tokio::fs::write(&src, &content).await.unwrap();

        let pair = connected_pair().await;
        let (events, mut events_rx) = broadcast::channel(16);
        let shared = SharedFile::inspect(&src).await.unwrap();
        spawn_server(pair.server_events, TransferServer::new(shared, TIMEOUT, events));

        let entry = entry_for(&pair.server_peer, "data.bin", content.len() as u64);
        let report = fetch_offer(pair.requester.as_ref(), &entry, dest_dir.path(), TIMEOUT)
            .await
            .unwrap();

        assert_eq!(report.bytes, content.len() as u64);
        assert_eq!(report.path, dest_dir.path().join("data.bin"));
        assert_eq!(tokio::fs::read(&report.path).await.unwrap(), content);
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            NodeEvent::TransferServed { bytes, .. } if bytes == content.len() as u64
        ));
    }

    #[tokio::test]
    async fn given_existing_destination_when_fetched_then_it_is_truncated() {
        let src_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("note.txt");
        tokio::fs::write(&src, b"short").await.unwrap();
        tokio::fs::write(dest_dir.path().join("note.txt"), vec![b'x'; 10_000])
            .await
            .unwrap();

        let pair = connected_pair().await;
        let (events, _events_rx) = broadcast::channel(16);
        let shared = SharedFile::inspect(&src).await.unwrap();
        spawn_server(pair.server_events, TransferServer::new(shared, TIMEOUT, events));

        let entry = entry_for(&pair.server_peer, "note.txt", 5);
        fetch_offer(pair.requester.as_ref(), &entry, dest_dir.path(), TIMEOUT)
            .await
            .unwrap();

        let received = tokio::fs::read(dest_dir.path().join("note.txt")).await.unwrap();
        assert_eq!(received, b"short");
    }

    #[tokio::test]
    async fn given_shared_file_removed_when_requested_then_both_sides_report_failure() {
        let src_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("gone.txt");
        tokio::fs::write(&src, b"soon gone").await.unwrap();
        let shared = SharedFile::inspect(&src).await.unwrap();
        tokio::fs::remove_file(&src).await.unwrap();

        let pair = connected_pair().await;
        let (events, mut events_rx) = broadcast::channel(16);
        spawn_server(pair.server_events, TransferServer::new(shared, TIMEOUT, events));

        let entry = entry_for(&pair.server_peer, "gone.txt", 9);
        let err = fetch_offer(pair.requester.as_ref(), &entry, dest_dir.path(), TIMEOUT)
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("reset"));
        assert!(!dest_dir.path().join("gone.txt").exists());
        let NodeEvent::TransferServeFailed { message, .. } = events_rx.recv().await.unwrap() else {
            panic!("expected TransferServeFailed");
        };
        assert!(message.contains("error opening file"));
    }

    #[tokio::test]
    async fn given_unreachable_peer_when_fetching_then_returns_error_without_creating_file() {
        let dest_dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new();
        let (requester, _events) = network.join();

        let entry = entry_for(&PeerId::from("nobody"), "x.bin", 1);
        let result = fetch_offer(requester.as_ref(), &entry, dest_dir.path(), TIMEOUT).await;

        assert!(result.is_err());
        assert!(!dest_dir.path().join("x.bin").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn given_stalled_server_when_fetching_then_gives_up_after_deadline() {
        let dest_dir = tempfile::tempdir().unwrap();
        let pair = connected_pair().await;
        let mut server_events = pair.server_events;

        // Accept the stream but never answer.
        let holder = tokio::spawn(async move {
            let event = server_events.recv().await;
            std::future::pending::<()>().await;
            drop(event);
        });

        let entry = entry_for(&pair.server_peer, "slow.bin", 1);
        let err = fetch_offer(pair.requester.as_ref(), &entry, dest_dir.path(), TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        holder.abort();
    }
}
