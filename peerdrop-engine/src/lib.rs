//! # peerdrop-engine
//!
//! Runtime logic for peerdrop, embedded into the CLI.
//!
//! This crate provides:
//! - **Node** with two roles: share (announce and serve one file) and
//!   receive (collect offers and fetch the one the operator picks)
//! - **Offer registry**: append-only, index-stable log of discovered offers
//! - **Sub-protocol handlers**: announcement and transfer, over any
//!   transport (`PeerTransport` trait)
//! - **Transport implementations**: QUIC with UDP broadcast discovery, and an
//!   in-memory network for tests
//! - **Event bus**: emits events (offers, transfers, errors) consumed by the
//!   CLI status display

pub mod announce;
pub mod deadline;
pub mod discovery;
pub mod error;
pub mod memory;
pub mod node;
pub mod quic;
pub mod registry;
pub mod selection;
pub mod transfer;
