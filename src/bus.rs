//! Sidechannel bus interface (spec §6, consumed).
//!
//! The bus is a channel-addressed, append-only, local-tailable event log
//! with a publish RPC. Its implementation is out of scope; this module
//! only defines the trait the rest of the crate programs against, plus
//! an in-memory fake used by tests.

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::error::Result;

/// One entry read off the bus's append-only log.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub seq: u64,
    pub ts: i64,
    pub channel: String,
    pub kind: String,
    pub trade_id: String,
    pub message: Envelope,
}

/// A page of log entries plus the latest known sequence number.
#[derive(Debug, Clone)]
pub struct LogPage {
    pub events: Vec<BusEvent>,
    pub latest_seq: u64,
}

/// Identity information the bus reports about the local peer.
#[derive(Debug, Clone)]
pub struct BusInfo {
    /// Hex-encoded 32-byte local peer public key.
    pub peer: String,
}

/// The bus operations the settlement core consumes (spec §6).
#[async_trait]
pub trait BusClient: Send + Sync {
    async fn subscribe(&self, channels: &[String]) -> Result<()>;
    async fn publish(&self, channel: &str, envelope: &Envelope) -> Result<()>;
    async fn log_read(&self, since_seq: u64, limit: usize) -> Result<LogPage>;
    async fn info(&self) -> Result<BusInfo>;
    async fn join(&self, channel: &str) -> Result<()>;
    async fn leave(&self, channel: &str) -> Result<()>;
}

/// Channel naming pattern from spec §6: `^[A-Za-z0-9_:.-]{1,128}$`.
pub fn is_valid_channel_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b':' | b'.' | b'-'))
}

/// The reserved prefix for per-trade swap channels created by `swap_invite`.
pub const SWAP_CHANNEL_PREFIX: &str = "swap:";

pub fn swap_channel_for(trade_id: &str) -> String {
    format!("{SWAP_CHANNEL_PREFIX}{trade_id}")
}

#[cfg(any(test, feature = "testing"))]
pub mod fake {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Deterministic in-memory bus: an append-only `Vec<BusEvent>` behind a
    /// mutex, with `publish` assigning sequence numbers. Good enough to
    /// drive the settlement driver end-to-end in tests without a real bus.
    ///
    /// The log is `Arc`-shared so [`FakeBus::fork`] can hand a second peer
    /// (e.g. a taker driver in the same test) its own `BusClient` view
    /// over the same append-only history, the way two real peers would
    /// observe the same bus.
    pub struct FakeBus {
        peer: String,
        log: Arc<Mutex<Vec<BusEvent>>>,
        subscribed: Mutex<Vec<String>>,
    }

    impl FakeBus {
        pub fn new(peer: impl Into<String>) -> Self {
            Self {
                peer: peer.into(),
                log: Arc::new(Mutex::new(Vec::new())),
                subscribed: Mutex::new(Vec::new()),
            }
        }

        /// A second `FakeBus` handle for a different peer, sharing this
        /// one's log so both observe every publish on the same `seq` order.
        pub fn fork(&self, peer: impl Into<String>) -> Self {
            Self {
                peer: peer.into(),
                log: self.log.clone(),
                subscribed: Mutex::new(Vec::new()),
            }
        }

        /// Test helper: append an envelope as if another peer had published it.
        pub fn inject(&self, channel: &str, envelope: Envelope) -> u64 {
            let mut log = self.log.lock().unwrap();
            let seq = log.len() as u64 + 1;
            log.push(BusEvent {
                seq,
                ts: envelope.ts,
                channel: channel.to_string(),
                kind: envelope.kind.as_str().to_string(),
                trade_id: envelope.trade_id.clone(),
                message: envelope,
            });
            seq
        }

        pub fn subscribed_channels(&self) -> Vec<String> {
            self.subscribed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BusClient for FakeBus {
        async fn subscribe(&self, channels: &[String]) -> Result<()> {
            let mut subs = self.subscribed.lock().unwrap();
            for c in channels {
                if !subs.contains(c) {
                    subs.push(c.clone());
                }
            }
            Ok(())
        }

        async fn publish(&self, channel: &str, envelope: &Envelope) -> Result<()> {
            self.inject(channel, envelope.clone());
            Ok(())
        }

        async fn log_read(&self, since_seq: u64, limit: usize) -> Result<LogPage> {
            let log = self.log.lock().unwrap();
            let events: Vec<BusEvent> = log
                .iter()
                .filter(|e| e.seq > since_seq)
                .take(limit)
                .cloned()
                .collect();
            let latest_seq = log.last().map(|e| e.seq).unwrap_or(0);
            Ok(LogPage { events, latest_seq })
        }

        async fn info(&self) -> Result<BusInfo> {
            Ok(BusInfo {
                peer: self.peer.clone(),
            })
        }

        async fn join(&self, channel: &str) -> Result<()> {
            self.subscribe(&[channel.to_string()]).await
        }

        async fn leave(&self, channel: &str) -> Result<()> {
            self.subscribed.lock().unwrap().retain(|c| c != channel);
            Ok(())
        }
    }
}
