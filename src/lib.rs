//! Core settlement engine for a cross-chain Lightning/SPL-token atomic
//! swap broker.
//!
//! This crate is the auto-trader at the center of the system: a
//! signed-envelope negotiation protocol over a sidechannel bus (`bus`,
//! `envelope`, `canon`, `sign`, `validate`), a settlement state machine
//! that drives a trade from `terms_post` through `sol_claim`/`sol_refund`
//! (`driver`), a recovery sweeper that re-issues stuck claim/refund
//! transactions after a crash (`sweeper`), a repeating-listing scheduler
//! for offers and RFQs (`autopost`), and a durable receipts store
//! (`store`). Everything this core needs from the outside world — the
//! bus, the Lightning node, the chain — is expressed as a trait
//! (`BusClient`, `LnClient`, `ChainClient`) with an in-memory fake behind
//! the `testing` feature, so the whole settlement pipeline can be driven
//! deterministically without a real network.

pub mod autopost;
pub mod bus;
pub mod cache;
pub mod canon;
pub mod chain;
pub mod config;
pub mod context;
pub mod driver;
pub mod envelope;
pub mod error;
pub mod ln;
pub mod sign;
pub mod store;
pub mod sweeper;
pub mod trace;
pub mod validate;

pub use error::{Error, Result};
