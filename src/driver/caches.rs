//! Bounded per-tick caches the settlement driver threads through every
//! pipeline (spec §3 "Settlement driver caches").

use crate::cache::{BoundedMap, BoundedSet};
use crate::config::DriverConfig;

/// The driver's full set of bounded, aged, in-memory caches.
///
/// The four `auto_*_sig` sets and `auto_accepted_trade_lock` dedupe the
/// four negotiation pipelines; `stage_done`/`stage_in_flight`/
/// `stage_retry_after` drive the settlement state machine;
/// `trade_preimage` remembers a just-revealed Lightning preimage between
/// the `ln_pay` and `sol_claim` stages within the same process lifetime.
/// `pipeline_retry_after` is this crate's own addition: each negotiation
/// pipeline gets its own cooldown-after-failure bookkeeping, keyed
/// `"<pipeline>:<sig>"`, distinct from the state machine's per-stage one.
pub struct DriverCaches {
    pub auto_quoted_rfq_sig: BoundedSet<String>,
    pub auto_accepted_quote_sig: BoundedSet<String>,
    pub auto_invited_accept_sig: BoundedSet<String>,
    pub auto_joined_invite_sig: BoundedSet<String>,
    pub auto_accepted_trade_lock: BoundedMap<String, i64>,
    pub stage_done: BoundedMap<String, i64>,
    pub stage_in_flight: BoundedSet<String>,
    pub stage_retry_after: BoundedMap<String, i64>,
    pub trade_preimage: BoundedMap<String, String>,
    pipeline_retry_after: BoundedMap<String, i64>,
}

impl DriverCaches {
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            auto_quoted_rfq_sig: BoundedSet::new(config.dedupe_max),
            auto_accepted_quote_sig: BoundedSet::new(config.dedupe_max),
            auto_invited_accept_sig: BoundedSet::new(config.dedupe_max),
            auto_joined_invite_sig: BoundedSet::new(config.dedupe_max),
            auto_accepted_trade_lock: BoundedMap::new(config.dedupe_max),
            stage_done: BoundedMap::new(config.stage_max),
            stage_in_flight: BoundedSet::new(config.stage_max),
            stage_retry_after: BoundedMap::new(config.stage_max),
            trade_preimage: BoundedMap::new(config.preimage_max),
            pipeline_retry_after: BoundedMap::new(config.dedupe_max),
        }
    }

    pub fn pipeline_retry_ready(&self, pipeline: &str, sig: &str, now_ms: i64) -> bool {
        match self.pipeline_retry_after.get(&pipeline_key(pipeline, sig)) {
            Some(retry_after) => now_ms >= *retry_after,
            None => true,
        }
    }

    pub fn set_pipeline_retry(&mut self, pipeline: &str, sig: &str, retry_after_ms: i64, now_ms: i64) {
        self.pipeline_retry_after
            .insert(pipeline_key(pipeline, sig), retry_after_ms, now_ms);
    }

    /// Drop every entry older than `max_age_ms` from every cache (spec §9:
    /// the age cutoff is advisory, the receipts store remains the durable
    /// source of truth).
    pub fn prune(&mut self, now_ms: i64, max_age_ms: i64) {
        self.auto_quoted_rfq_sig.prune_older_than(now_ms, max_age_ms);
        self.auto_accepted_quote_sig.prune_older_than(now_ms, max_age_ms);
        self.auto_invited_accept_sig.prune_older_than(now_ms, max_age_ms);
        self.auto_joined_invite_sig.prune_older_than(now_ms, max_age_ms);
        self.auto_accepted_trade_lock.prune_older_than(now_ms, max_age_ms);
        self.stage_done.prune_older_than(now_ms, max_age_ms);
        self.stage_in_flight.prune_older_than(now_ms, max_age_ms);
        self.stage_retry_after.prune_older_than(now_ms, max_age_ms);
        self.trade_preimage.prune_older_than(now_ms, max_age_ms);
        self.pipeline_retry_after.prune_older_than(now_ms, max_age_ms);
    }
}

fn pipeline_key(pipeline: &str, sig: &str) -> String {
    format!("{pipeline}:{sig}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_caches_start_empty() {
        let caches = DriverCaches::new(&DriverConfig::default());
        assert!(caches.auto_quoted_rfq_sig.is_empty());
        assert!(caches.stage_done.is_empty());
        assert!(caches.trade_preimage.is_empty());
    }

    #[test]
    fn pipeline_retry_blocks_until_cooldown_elapses() {
        let mut caches = DriverCaches::new(&DriverConfig::default());
        caches.set_pipeline_retry("quote_from_offer", "sig-1", 5000, 1000);
        assert!(!caches.pipeline_retry_ready("quote_from_offer", "sig-1", 4000));
        assert!(caches.pipeline_retry_ready("quote_from_offer", "sig-1", 5000));
    }

    #[test]
    fn unseen_sig_is_always_retry_ready() {
        let caches = DriverCaches::new(&DriverConfig::default());
        assert!(caches.pipeline_retry_ready("accept_quote", "never-seen", 0));
    }
}
