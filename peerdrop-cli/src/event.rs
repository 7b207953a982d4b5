use std::sync::Arc;

use tokio::sync::broadcast;

use peerdrop_core::offer::format_size;
use peerdrop_engine::node::NodeEvent;

use crate::ui::StatusLog;

/// Status line for `event`, or `None` for events the display skips.
#[must_use]
pub fn describe(event: &NodeEvent) -> Option<String> {
    let line = match event {
        NodeEvent::PeerConnected { peer } => format!("Connected to {}", peer.short()),
        NodeEvent::AnnouncementSent { .. } => return None,
        NodeEvent::AnnouncementFailed { peer, message } => {
            format!("Error with {}: {message}", peer.short())
        }
        NodeEvent::PeerFound { offer, .. } => format!("Found someone: {offer}"),
        NodeEvent::OfferDiscovered { entry } => format!("New offer {entry}"),
        NodeEvent::TransferServed { peer, bytes } => {
            format!("Sent {} to {}", format_size(*bytes), peer.short())
        }
        NodeEvent::TransferServeFailed { peer, message } => {
            format!("Error sending to {}: {message}", peer.short())
        }
        NodeEvent::TransferStarted { entry } => {
            format!("fetching {} from {}", entry.offer.file, entry.offer.name)
        }
        NodeEvent::TransferComplete { report, .. } => format!(
            "Success! Saved {} ({})",
            report.path.display(),
            format_size(report.bytes)
        ),
        NodeEvent::TransferFailed { entry, message } => {
            format!("Fetching {} failed: {message}", entry.offer.file)
        }
        NodeEvent::SelectionRejected { message } => message.clone(),
        NodeEvent::Error { message } => format!("Error: {message}"),
    };
    Some(line)
}

/// Spawns a task that turns node events into status lines.
pub fn spawn_event_logger(mut events_rx: broadcast::Receiver<NodeEvent>, log: Arc<StatusLog>) {
    tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(event) => {
                    if let Some(line) = describe(&event) {
                        log.push(line);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log.push(format!("Missed {n} events"));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
