//! # peerdrop-core
//!
//! Shared building blocks for the peerdrop file offer protocol.
//!
//! This crate provides the foundational types used by `peerdrop-engine`
//! and the `peerdrop` binary.
//!
//! ## Responsibilities
//!
//! - **Protocol primitives**: frame format (magic / version / type / length),
//!   message types, sub-protocol names and JSON payload encoding/decoding.
//!
//! - **Offer model**: the [`OfferDescriptor`](offer::OfferDescriptor) a peer
//!   announces and the [`RegistryEntry`](offer::RegistryEntry) a receiver
//!   keeps for each discovered offer.
//!
//! - **Transport traits**: the narrow view of the peer transport layer the
//!   exchange protocol depends on: peer identity, named streams and
//!   connection notifications.
//!
//! - **TLS material**: per-peer self-signed certificates for transports that
//!   need one.

pub mod offer;
pub mod protocol;
pub mod tls;
pub mod transport;
