use std::fmt;

use serde::{Deserialize, Serialize};

use crate::transport::PeerId;

/// Describes the single file a peer is willing to share.
///
/// Sent on the announcement protocol right after a connection is
/// established. A peer that only receives sends a descriptor with an empty
/// `file` and zero `size`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OfferDescriptor {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Hostname")]
    pub hostname: String,
    #[serde(rename = "File", default)]
    pub file: String,
    #[serde(rename = "Size", default)]
    pub size: u64,
}

impl OfferDescriptor {
    /// A descriptor that identifies the local peer without offering anything.
    #[must_use]
    pub fn empty(name: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hostname: hostname.into(),
            file: String::new(),
            size: 0,
        }
    }

    /// Returns `true` when the descriptor carries an actual file.
    #[must_use]
    pub fn has_file(&self) -> bool {
        !self.file.is_empty()
    }
}

/// `alice@laptop - report.pdf (4.00 KiB)`
impl fmt::Display for OfferDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} - {} ({})",
            self.name,
            self.hostname,
            self.file,
            format_size(self.size)
        )
    }
}

/// A discovered offer, as stored in the offer registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    /// Position assigned at insertion; never reused.
    pub index: usize,
    pub offer: OfferDescriptor,
    /// Peer the announcement arrived from, as reported by the transport.
    pub origin: PeerId,
}

impl fmt::Display for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.index, self.offer)
    }
}

/// Formats a byte count into a human-readable string (B, KiB, MiB, GiB).
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}
