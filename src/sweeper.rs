//! Recovery sweeper (spec §4.8, C8).
//!
//! Runs on its own cadence, independent of the settlement driver's tick
//! loop, and needs none of the driver's in-memory caches: every pass reads
//! its work list straight from the durable [`Store`] and re-derives
//! escrow account/preimage from the persisted [`TradeRecord`]. This makes
//! it safe to run concurrently with (or instead of) a live driver after a
//! crash — the two never race because each stage transition the driver
//! performs is itself idempotent against the chain (see `binding_ok`/
//! `stage_done` in `driver::mod`).
//!
//! Structurally this mirrors `autopost::AutopostManager`: one
//! `tokio::spawn`'d loop per sweeper instance, a `tokio::time::interval`
//! ticker, and an injectable [`Clock`] so tests can run under
//! `tokio::time::pause`/`advance` instead of real sleeps.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::chain::{ChainClient, ClaimParams, EscrowStatus, RefundParams};
use crate::config::SweeperConfig;
use crate::error::Result;
use crate::store::{Page, Patch, Store, TradePatch, TradeRecord, TradeState};
use crate::trace::{TraceBuffer, TraceEvent, TraceKind};

/// Monotonic clock the sweeper reads `now_unix`/`now_ms` from.
pub trait SweeperClock: Send + Sync {
    fn now_unix(&self) -> i64;
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl SweeperClock for SystemClock {
    fn now_unix(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs() as i64
    }

    fn now_ms(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as i64
    }
}

/// Tallies from one completed pass, surfaced through [`RecoverySweeper::stats`].
#[derive(Debug, Clone, Default)]
pub struct SweeperStats {
    pub passes: u64,
    pub claims_reissued: u64,
    pub claims_finalized: u64,
    pub refunds_reissued: u64,
    pub last_pass_at: Option<i64>,
    pub last_error: Option<String>,
}

/// Owns the background task driving repeated recovery passes.
pub struct RecoverySweeper<Ch: ChainClient + 'static> {
    chain: Arc<Ch>,
    store: Store,
    config: SweeperConfig,
    clock: Arc<dyn SweeperClock>,
    trace: Arc<TraceBuffer>,
    stats: Arc<Mutex<SweeperStats>>,
    pass_count: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
    last_pass_ms: Arc<AtomicI64>,
}

impl<Ch: ChainClient + 'static> RecoverySweeper<Ch> {
    pub fn new(chain: Arc<Ch>, store: Store, config: SweeperConfig) -> Self {
        Self::with_clock(chain, store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        chain: Arc<Ch>,
        store: Store,
        config: SweeperConfig,
        clock: Arc<dyn SweeperClock>,
    ) -> Self {
        Self {
            chain,
            store,
            config,
            clock,
            trace: Arc::new(TraceBuffer::new()),
            stats: Arc::new(Mutex::new(SweeperStats::default())),
            pass_count: Arc::new(AtomicU64::new(0)),
            handle: Mutex::new(None),
            last_pass_ms: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn trace(&self) -> &TraceBuffer {
        &self.trace
    }

    pub async fn stats(&self) -> SweeperStats {
        self.stats.lock().await.clone()
    }

    /// Spawn the periodic background task. Idempotent: a second call while
    /// already running is a no-op (matches `AutopostManager::start`'s
    /// "reject reused name" posture, simplified to a single job per
    /// sweeper instance).
    pub fn start(self: &Arc<Self>) {
        let mut guard = match self.handle.try_lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        if guard.is_some() {
            return;
        }
        let sweeper = self.clone();
        let period = std::time::Duration::from_millis(self.config.interval_ms.max(1));
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = sweeper.run_pass_inner().await {
                    tracing::warn!(error = %e, "recovery sweeper pass failed");
                }
            }
        }));
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }

    /// Run exactly one pass synchronously (used directly by tests, and by
    /// the background loop above).
    pub async fn run_pass(&self) -> Result<()> {
        self.run_pass_inner().await
    }

    async fn run_pass_inner(&self) -> Result<()> {
        let now_unix = self.clock.now_unix();
        let now_ms = self.clock.now_ms();
        let page = Page::new(self.config.page_size, 0);

        let claim_result = self.sweep_open_claims(page, now_ms).await;
        let refund_result = self.sweep_open_refunds(now_unix, page, now_ms).await;

        self.pass_count.fetch_add(1, Ordering::SeqCst);
        self.last_pass_ms.store(now_ms, Ordering::SeqCst);

        let mut stats = self.stats.lock().await;
        stats.passes += 1;
        stats.last_pass_at = Some(now_unix);
        match (&claim_result, &refund_result) {
            (Ok(c), Ok(r)) => {
                stats.claims_reissued += c.reissued;
                stats.claims_finalized += c.finalized;
                stats.refunds_reissued += r.reissued;
                stats.last_error = None;
            }
            (Err(e), _) | (_, Err(e)) => {
                stats.last_error = Some(e.to_string());
            }
        }
        drop(stats);

        claim_result.map(|_| ())?;
        refund_result.map(|_| ())
    }

    /// `listOpenClaims(state=ln_paid)`: re-issue the claim transaction if
    /// the escrow still exists on chain; otherwise the claim must have
    /// already landed (or the escrow was never funded), so mark the trade
    /// `claimed` in receipts without touching the chain again.
    async fn sweep_open_claims(&self, page: Page, now_ms: i64) -> Result<SweepTally> {
        let mut tally = SweepTally::default();
        let trades = self.store.list_open_claims(page).await?;
        for trade in trades {
            match self.recover_one_claim(&trade, now_ms).await {
                Ok(RecoverOutcome::Reissued) => tally.reissued += 1,
                Ok(RecoverOutcome::Finalized) => tally.finalized += 1,
                Ok(RecoverOutcome::Skipped) => {}
                Err(e) => {
                    self.trace.push(TraceEvent {
                        ts_ms: now_ms,
                        trade_id: Some(trade.trade_id.clone()),
                        stage: Some("sol_claim".into()),
                        kind: TraceKind::Failure,
                        message: format!("recovery claim failed: {e}"),
                        envelope_sig_prefix: None,
                    });
                }
            }
        }
        Ok(tally)
    }

    async fn recover_one_claim(&self, trade: &TradeRecord, now_ms: i64) -> Result<RecoverOutcome> {
        let (Some(escrow_account), Some(preimage)) =
            (trade.sol_escrow_pda.clone(), trade.ln_preimage_hex.clone())
        else {
            return Ok(RecoverOutcome::Skipped);
        };

        let state = self.chain.read_escrow_state(&escrow_account).await?;
        match state.map(|s| s.status) {
            Some(EscrowStatus::Funded) => {
                let tx = self
                    .chain
                    .build_claim_tx(&ClaimParams {
                        trade_id: trade.trade_id.clone(),
                        escrow_account: escrow_account.clone(),
                        preimage,
                    })
                    .await?;
                self.chain.send_and_confirm(&tx).await?;
                self.trace.push(TraceEvent {
                    ts_ms: now_ms,
                    trade_id: Some(trade.trade_id.clone()),
                    stage: Some("sol_claim".into()),
                    kind: TraceKind::Retry,
                    message: "reissued claim transaction during recovery pass".into(),
                    envelope_sig_prefix: None,
                });
                Ok(RecoverOutcome::Reissued)
            }
            Some(EscrowStatus::Claimed) | None => {
                self.store
                    .upsert_trade(
                        &trade.trade_id,
                        TradePatch {
                            state: Some(TradeState::Claimed),
                            ..Default::default()
                        },
                        now_ms,
                    )
                    .await?;
                self.trace.push(TraceEvent {
                    ts_ms: now_ms,
                    trade_id: Some(trade.trade_id.clone()),
                    stage: Some("sol_claim".into()),
                    kind: TraceKind::StageTransition,
                    message: "marked trade claimed during recovery pass".into(),
                    envelope_sig_prefix: None,
                });
                Ok(RecoverOutcome::Finalized)
            }
            Some(EscrowStatus::Uninitialized) | Some(EscrowStatus::Refunded) => {
                Ok(RecoverOutcome::Skipped)
            }
        }
    }

    /// `listOpenRefunds(state=escrow, now_unix)`: re-issue the refund
    /// transaction for every trade whose `sol_refund_after_unix` has
    /// elapsed; mark `refunded` on success.
    async fn sweep_open_refunds(
        &self,
        now_unix: i64,
        page: Page,
        now_ms: i64,
    ) -> Result<SweepTally> {
        let mut tally = SweepTally::default();
        let trades = self.store.list_open_refunds(now_unix, page).await?;
        for trade in trades {
            match self.recover_one_refund(&trade, now_ms).await {
                Ok(true) => tally.reissued += 1,
                Ok(false) => {}
                Err(e) => {
                    self.trace.push(TraceEvent {
                        ts_ms: now_ms,
                        trade_id: Some(trade.trade_id.clone()),
                        stage: Some("sol_refund".into()),
                        kind: TraceKind::Failure,
                        message: format!("recovery refund failed: {e}"),
                        envelope_sig_prefix: None,
                    });
                }
            }
        }
        Ok(tally)
    }

    async fn recover_one_refund(&self, trade: &TradeRecord, now_ms: i64) -> Result<bool> {
        let Some(escrow_account) = trade.sol_escrow_pda.clone() else {
            return Ok(false);
        };

        let state = self.chain.read_escrow_state(&escrow_account).await?;
        match state.map(|s| s.status) {
            Some(EscrowStatus::Funded) => {
                let tx = self
                    .chain
                    .build_refund_tx(&RefundParams {
                        trade_id: trade.trade_id.clone(),
                        escrow_account: escrow_account.clone(),
                    })
                    .await?;
                self.chain.send_and_confirm(&tx).await?;
                self.store
                    .upsert_trade(
                        &trade.trade_id,
                        TradePatch {
                            state: Some(TradeState::Refunded),
                            ..Default::default()
                        },
                        now_ms,
                    )
                    .await?;
                self.trace.push(TraceEvent {
                    ts_ms: now_ms,
                    trade_id: Some(trade.trade_id.clone()),
                    stage: Some("sol_refund".into()),
                    kind: TraceKind::Retry,
                    message: "reissued refund transaction during recovery pass".into(),
                    envelope_sig_prefix: None,
                });
                Ok(true)
            }
            Some(EscrowStatus::Refunded) => {
                self.store
                    .upsert_trade(
                        &trade.trade_id,
                        TradePatch {
                            state: Some(TradeState::Refunded),
                            ..Default::default()
                        },
                        now_ms,
                    )
                    .await?;
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}

enum RecoverOutcome {
    Reissued,
    Finalized,
    Skipped,
}

#[derive(Default)]
struct SweepTally {
    reissued: u64,
    finalized: u64,
}

// `last_pass_ms`/`pass_count` are read by tests through `stats()`; keep
// clippy quiet about the otherwise-unread atomics outside cfg(test).
#[allow(dead_code)]
impl<Ch: ChainClient + 'static> RecoverySweeper<Ch> {
    fn last_pass_ms(&self) -> i64 {
        self.last_pass_ms.load(Ordering::SeqCst)
    }

    fn pass_count(&self) -> u64 {
        self.pass_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::fake::FakeChain;
    use crate::chain::EscrowInitParams;
    use crate::store::Role;
    use sha2::Digest;

    async fn trade_with_funded_escrow(
        store: &Store,
        chain: &FakeChain,
        trade_id: &str,
        preimage: [u8; 32],
        refund_after_unix: i64,
        with_preimage: bool,
    ) -> String {
        let hashlock = hex::encode(sha2::Sha256::digest(preimage));
        let init = chain
            .build_escrow_init_tx(&EscrowInitParams {
                trade_id: trade_id.into(),
                mint: "mint".into(),
                amount: "1000".into(),
                beneficiary: "taker-chain".into(),
                depositor: "maker-chain".into(),
                hashlock,
                refund_after_unix,
            })
            .await
            .unwrap();
        let escrow_account = chain.send_and_confirm(&init).await.unwrap();

        store
            .upsert_trade(
                trade_id,
                TradePatch {
                    role: Some(Role::Maker),
                    state: Some(TradeState::Escrow),
                    sol_escrow_pda: Patch::Set(escrow_account.clone()),
                    sol_refund_after_unix: Patch::Set(refund_after_unix),
                    ln_preimage_hex: if with_preimage {
                        Patch::Set(hex::encode(preimage))
                    } else {
                        Patch::Keep
                    },
                    ..Default::default()
                },
                1000,
            )
            .await
            .unwrap();

        escrow_account
    }

    #[tokio::test]
    async fn reissues_claim_when_escrow_still_funded() {
        let store = Store::open_in_memory().await.unwrap();
        let chain = Arc::new(FakeChain::new("sweeper-chain"));
        let preimage = [7u8; 32];
        let escrow_account = {
            let hashlock = hex::encode(sha2::Sha256::digest(preimage));
            let init = chain
                .build_escrow_init_tx(&EscrowInitParams {
                    trade_id: "t1".into(),
                    mint: "mint".into(),
                    amount: "1000".into(),
                    beneficiary: "taker-chain".into(),
                    depositor: "maker-chain".into(),
                    hashlock,
                    refund_after_unix: 2_000_000_000,
                })
                .await
                .unwrap();
            chain.send_and_confirm(&init).await.unwrap()
        };
        store
            .upsert_trade(
                "t1",
                TradePatch {
                    role: Some(Role::Taker),
                    state: Some(TradeState::LnPaid),
                    sol_escrow_pda: Patch::Set(escrow_account.clone()),
                    ln_preimage_hex: Patch::Set(hex::encode(preimage)),
                    ..Default::default()
                },
                1000,
            )
            .await
            .unwrap();

        let sweeper = RecoverySweeper::new(chain.clone(), store.clone(), SweeperConfig::default());
        sweeper.run_pass().await.unwrap();

        let state = chain
            .read_escrow_state(&escrow_account)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, EscrowStatus::Claimed);

        let stats = sweeper.stats().await;
        assert_eq!(stats.claims_reissued, 1);

        let refreshed = store.get_trade("t1").await.unwrap().unwrap();
        assert_eq!(refreshed.state, TradeState::LnPaid);
    }

    #[tokio::test]
    async fn marks_claimed_when_escrow_already_gone() {
        let store = Store::open_in_memory().await.unwrap();
        let chain = Arc::new(FakeChain::new("sweeper-chain"));
        store
            .upsert_trade(
                "t2",
                TradePatch {
                    role: Some(Role::Taker),
                    state: Some(TradeState::LnPaid),
                    sol_escrow_pda: Patch::Set("never-funded-account".into()),
                    ln_preimage_hex: Patch::Set(hex::encode([1u8; 32])),
                    ..Default::default()
                },
                1000,
            )
            .await
            .unwrap();

        let sweeper = RecoverySweeper::new(chain, store.clone(), SweeperConfig::default());
        sweeper.run_pass().await.unwrap();

        let stats = sweeper.stats().await;
        assert_eq!(stats.claims_finalized, 1);

        let refreshed = store.get_trade("t2").await.unwrap().unwrap();
        assert_eq!(refreshed.state, TradeState::Claimed);
    }

    #[tokio::test]
    async fn reissues_refund_past_window_and_skips_before_it() {
        let store = Store::open_in_memory().await.unwrap();
        let chain = Arc::new(FakeChain::new("sweeper-chain"));

        trade_with_funded_escrow(&store, &chain, "t3", [2u8; 32], 500, false).await;
        trade_with_funded_escrow(&store, &chain, "t4", [3u8; 32], 5_000_000_000, false).await;

        let clock: Arc<dyn SweeperClock> = Arc::new(FixedSweeperClock {
            unix: AtomicI64::new(1000),
            ms: AtomicI64::new(1_000_000),
        });
        let sweeper = RecoverySweeper::with_clock(
            chain.clone(),
            store.clone(),
            SweeperConfig::default(),
            clock,
        );
        sweeper.run_pass().await.unwrap();

        let stats = sweeper.stats().await;
        assert_eq!(stats.refunds_reissued, 1);

        let t3 = store.get_trade("t3").await.unwrap().unwrap();
        assert_eq!(t3.state, TradeState::Refunded);
        let t4 = store.get_trade("t4").await.unwrap().unwrap();
        assert_eq!(t4.state, TradeState::Escrow);
    }

    struct FixedSweeperClock {
        unix: AtomicI64,
        ms: AtomicI64,
    }

    impl SweeperClock for FixedSweeperClock {
        fn now_unix(&self) -> i64 {
            self.unix.load(Ordering::SeqCst)
        }
        fn now_ms(&self) -> i64 {
            self.ms.load(Ordering::SeqCst)
        }
    }
}
