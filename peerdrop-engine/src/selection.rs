//! Operator selection of a discovered offer.

use anyhow::{Context, anyhow};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, warn};

use peerdrop_core::offer::RegistryEntry;

use crate::error::SelectionError;
use crate::node::{NodeCmd, NodeEvent};
use crate::registry::OfferLog;
use crate::transfer::TransferReport;

/// How the selection loop ended.
#[derive(Debug)]
pub enum SelectionOutcome {
    /// A selected offer was retrieved.
    Transferred(TransferReport),
    /// Input ended before any retrieval succeeded.
    InputClosed,
}

/// Resolves one operator token to a registry entry.
///
/// # Errors
///
/// Returns [`SelectionError::Parse`] if `token` is not a non-negative
/// integer and [`SelectionError::OutOfRange`] if the registry holds no such
/// entry.
pub fn parse_selection<R: OfferLog + ?Sized>(
    token: &str,
    registry: &R,
) -> Result<RegistryEntry, SelectionError> {
    let index = token.parse::<usize>().map_err(|_| SelectionError::Parse {
        token: token.to_owned(),
    })?;
    Ok(registry.get(index)?)
}

/// Reads offer numbers from `input` until one of them is retrieved.
///
/// Each whitespace-separated token is validated against `registry` and, if
/// valid, posted to the node as [`NodeCmd::Fetch`]. Invalid tokens and
/// failed retrievals are reported and reading continues.
///
/// # Errors
///
/// Returns an error if `input` cannot be read or the node has stopped.
pub async fn run_selection_loop<I, R>(
    input: I,
    registry: &R,
    cmd_tx: &mpsc::Sender<NodeCmd>,
    events: &broadcast::Sender<NodeEvent>,
) -> anyhow::Result<SelectionOutcome>
where
    I: AsyncBufRead + Unpin,
    R: OfferLog + ?Sized,
{
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await.context("error reading selection")? {
        for token in line.split_whitespace() {
            let entry = match parse_selection(token, registry) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(token = %token, error = %e, "Selection rejected");
                    let _ = events.send(NodeEvent::SelectionRejected {
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            info!(index = entry.index, file = %entry.offer.file, "Offer selected");
            let (reply, outcome) = oneshot::channel();
            cmd_tx
                .send(NodeCmd::Fetch { entry, reply })
                .await
                .map_err(|_| anyhow!("node is not running"))?;

            match outcome.await.context("node dropped the transfer")? {
                Ok(report) => return Ok(SelectionOutcome::Transferred(report)),
                Err(e) => {
                    warn!(error = %e, "Transfer failed, waiting for another selection");
                }
            }
        }
    }

    info!("Selection input closed");
    Ok(SelectionOutcome::InputClosed)
}
