//! Settlement driver (spec §4.7, C7).
//!
//! The driver ticks on a fixed interval: it tails the bus log into an
//! in-memory event window, folds that window into a [`TickContext`]
//! (`context::build_tick_context`), then runs five independent pipelines
//! against it — four negotiation auto-responders plus the six-stage
//! settlement state machine — each bounded by a per-tick action budget.
//! A `tick_in_flight` fence makes overlapping ticks (e.g. a slow RPC still
//! running when the next interval fires) a no-op rather than a race.

mod caches;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use ed25519_dalek::SigningKey;
use tokio::sync::Mutex;

pub use caches::DriverCaches;

use crate::bus::{swap_channel_for, BusClient, BusEvent};
use crate::canon::envelope_id;
use crate::chain::{ChainClient, ClaimParams, EscrowInitParams};
use crate::config::DriverConfig;
use crate::context::{build_tick_context, Negotiation, TickContext, TradeContext};
use crate::envelope::{
    AcceptBody, Envelope, EnvelopeBody, LnInvoiceBody, LnPaidBody, QuoteAcceptBody, QuoteBody,
    SolClaimedBody, SolEscrowCreatedBody, SwapInviteBody, TermsBody,
};
use crate::error::Result;
use crate::ln::{LnClient, PayOutcome};
use crate::sign::{sign, verify, VerifyOutcome};
use crate::store::{ListingLockPatch, ListingLockState, Patch, Role, Store, TradePatch, TradeState};
use crate::trace::{sig_prefix, TraceBuffer, TraceEvent, TraceKind};
use crate::validate::{cross_validate_quote, validate, ValidationResult};

/// Wall-clock abstraction so tests can pin "now" instead of sleeping
/// (mirrors `autopost::Clock`, but driver bookkeeping needs millisecond
/// resolution for cache ages and cooldowns rather than autopost's
/// whole-second horizon arithmetic).
pub trait DriverClock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Real wall clock.
pub struct SystemClock;

impl DriverClock for SystemClock {
    fn now_ms(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as i64
    }
}

/// Maker fee policy applied when quoting from a matched offer line. The
/// spec's end-to-end scenario witnesses a maker choosing 10bps/10bps
/// regardless of the RFQ's (much higher) ceilings, so these are fixed
/// driver-side defaults rather than derived from the RFQ.
const DEFAULT_PLATFORM_FEE_BPS: u32 = 10;
const DEFAULT_TRADE_FEE_BPS: u32 = 10;
/// Target refund window a maker proposes, clamped into the RFQ/offer
/// overlap — 72 hours, matching the same scenario witness.
const DEFAULT_REFUND_WINDOW_SEC: u64 = 259_200;

fn stage_key(trade_id: &str, stage: &str) -> String {
    format!("{trade_id}:{stage}")
}

/// Check the two binding invariants (spec §4.7.1) that gate `terms_accept`,
/// `ln_pay`, and `sol_claim`: this process must be the `terms`-designated
/// Lightning payer and Solana recipient, not merely a bystander who saw
/// the trade on the shared swap channel.
fn binding_ok(
    trade_ctx: &TradeContext,
    local_peer: &str,
    local_chain_signer: &str,
) -> std::result::Result<(), String> {
    let Some(terms_event) = &trade_ctx.terms else {
        return Err("terms missing for binding check".to_string());
    };
    let EnvelopeBody::Terms(terms) = &terms_event.message.body else {
        return Err("terms body malformed".to_string());
    };
    if terms.ln_payer_peer != local_peer {
        return Err(format!(
            "ln_payer_peer {} != local_peer {local_peer}",
            terms.ln_payer_peer
        ));
    }
    if terms.sol_recipient != local_chain_signer {
        return Err(format!(
            "sol_recipient {} != local_chain_signer {local_chain_signer}",
            terms.sol_recipient
        ));
    }
    Ok(())
}

fn clamp_window(target: u64, lo: u64, hi: u64) -> Option<u64> {
    if lo > hi {
        return None;
    }
    Some(target.clamp(lo, hi))
}

#[derive(Debug, Clone, Default)]
pub struct DriverStats {
    pub ticks: u64,
    pub actions: u64,
    pub last_tick_at: Option<i64>,
    pub last_error: Option<String>,
    pub started_at: Option<i64>,
}

/// The settlement driver: one instance per running peer process, generic
/// over the bus/LN/chain collaborators so tests can wire in the
/// deterministic fakes in `bus::fake`, `ln::fake`, and `chain::fake`.
pub struct SettlementDriver<B: BusClient, L: LnClient, Ch: ChainClient> {
    bus: Arc<B>,
    ln: Arc<L>,
    chain: Arc<Ch>,
    store: Store,
    config: DriverConfig,
    clock: Arc<dyn DriverClock>,
    signing_key: SigningKey,
    /// The SPL mint this driver instance trades. One driver trades one
    /// pair against one mint; multi-pair operation runs one driver per
    /// pair, mirroring the one-`svc_announce`-per-pair shape of §3.
    mint_address: String,
    channels: Mutex<Vec<String>>,
    caches: Mutex<DriverCaches>,
    events: Mutex<Vec<BusEvent>>,
    last_seq: AtomicU64,
    last_keep_alive_ms: Mutex<i64>,
    tick_in_flight: AtomicBool,
    stats: Mutex<DriverStats>,
    trace: TraceBuffer,
}

impl<B, L, Ch> SettlementDriver<B, L, Ch>
where
    B: BusClient + 'static,
    L: LnClient + 'static,
    Ch: ChainClient + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<B>,
        ln: Arc<L>,
        chain: Arc<Ch>,
        store: Store,
        config: DriverConfig,
        signing_key: SigningKey,
        mint_address: impl Into<String>,
        rfq_channels: Vec<String>,
    ) -> Self {
        Self::with_clock(
            bus,
            ln,
            chain,
            store,
            config,
            signing_key,
            mint_address,
            rfq_channels,
            Arc::new(SystemClock),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_clock(
        bus: Arc<B>,
        ln: Arc<L>,
        chain: Arc<Ch>,
        store: Store,
        config: DriverConfig,
        signing_key: SigningKey,
        mint_address: impl Into<String>,
        rfq_channels: Vec<String>,
        clock: Arc<dyn DriverClock>,
    ) -> Self {
        let caches = DriverCaches::new(&config);
        Self {
            bus,
            ln,
            chain,
            store,
            clock,
            signing_key,
            mint_address: mint_address.into(),
            channels: Mutex::new(rfq_channels),
            caches: Mutex::new(caches),
            events: Mutex::new(Vec::new()),
            last_seq: AtomicU64::new(0),
            last_keep_alive_ms: Mutex::new(0),
            tick_in_flight: AtomicBool::new(false),
            stats: Mutex::new(DriverStats::default()),
            trace: TraceBuffer::new(),
            config,
        }
    }

    pub async fn stats(&self) -> DriverStats {
        self.stats.lock().await.clone()
    }

    pub fn trace(&self) -> Vec<TraceEvent> {
        self.trace.snapshot()
    }

    /// Run `tick()` on `config.interval_ms` forever. Callers that want
    /// their own scheduling (tests, a supervisor that also runs the
    /// sweeper) should call `tick()` directly instead.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.clamped_interval_ms()));
        loop {
            interval.tick().await;
            if let Err(e) = self.tick().await {
                tracing::warn!(error = %e, "settlement driver tick aborted");
            }
        }
    }

    /// Run one tick. Returns `Err` only when tailing the bus log itself
    /// fails (spec §7: "only a failure to tail the event log aborts the
    /// tick") — every other failure is caught, traced, and bookkept as a
    /// per-pipeline/per-stage retry instead of propagated.
    pub async fn tick(&self) -> Result<()> {
        if self.tick_in_flight.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.tick_inner().await;
        self.tick_in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn tick_inner(&self) -> Result<()> {
        let now_ms = self.clock.now_ms();
        let now_unix = now_ms / 1000;

        self.keep_alive_if_due(now_ms).await;
        self.read_log_tail(now_ms).await?;

        let local_peer = match self.with_timeout(self.config.identity_timeout_ms, self.bus.info()).await {
            Ok(info) => info.peer,
            Err(e) => {
                self.note_tick_error(now_ms, &format!("identity resolve (bus) failed: {e}")).await;
                return Ok(());
            }
        };
        let local_chain_signer = match self
            .with_timeout(self.config.identity_timeout_ms, self.chain.signer_pubkey())
            .await
        {
            Ok(pk) => pk,
            Err(e) => {
                self.note_tick_error(now_ms, &format!("identity resolve (chain) failed: {e}")).await;
                return Ok(());
            }
        };

        let events_snapshot = self.events.lock().await.clone();
        let ctx = build_tick_context(&events_snapshot, &local_peer);

        let mut actions_left = self.config.actions_per_tick;
        self.pipeline_quote_from_offer(&ctx, &local_peer, now_ms, now_unix, &mut actions_left).await;
        self.pipeline_accept_quote(&ctx, &local_chain_signer, now_ms, now_unix, &mut actions_left).await;
        self.pipeline_invite_from_accept(&ctx, &local_peer, now_ms, &mut actions_left).await;
        self.pipeline_join_invite(&ctx, now_ms, &mut actions_left).await;
        self.pipeline_settlement(&ctx, &local_peer, &local_chain_signer, now_ms, now_unix, &mut actions_left).await;

        let spent = self.config.actions_per_tick - actions_left;
        let mut stats = self.stats.lock().await;
        stats.ticks += 1;
        stats.actions += spent as u64;
        stats.last_tick_at = Some(now_ms);
        if stats.started_at.is_none() {
            stats.started_at = Some(now_ms);
        }
        drop(stats);

        let mut caches = self.caches.lock().await;
        caches.prune(now_ms, self.config.event_max_age_ms);
        Ok(())
    }

    async fn note_tick_error(&self, now_ms: i64, message: &str) {
        self.stats.lock().await.last_error = Some(message.to_string());
        self.trace.push(TraceEvent {
            ts_ms: now_ms,
            trade_id: None,
            stage: None,
            kind: TraceKind::Failure,
            message: message.to_string(),
            envelope_sig_prefix: None,
        });
    }

    async fn with_timeout<T>(&self, ms: u64, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(Duration::from_millis(ms), fut).await {
            Ok(inner) => inner,
            Err(_) => Err(crate::error::Error::Transient(format!("rpc timed out after {ms}ms"))),
        }
    }

    async fn keep_alive_if_due(&self, now_ms: i64) {
        let mut last = self.last_keep_alive_ms.lock().await;
        if now_ms - *last < self.config.keep_alive_interval_ms as i64 {
            return;
        }
        let channels = self.channels.lock().await.clone();
        if channels.is_empty() {
            *last = now_ms;
            return;
        }
        match self.with_timeout(self.config.subscribe_timeout_ms, self.bus.subscribe(&channels)).await {
            Ok(()) => *last = now_ms,
            Err(e) => {
                drop(last);
                self.trace.push(TraceEvent {
                    ts_ms: now_ms,
                    trade_id: None,
                    stage: None,
                    kind: TraceKind::Failure,
                    message: format!("keep-alive resubscribe failed: {e}"),
                    envelope_sig_prefix: None,
                });
            }
        }
    }

    async fn read_log_tail(&self, now_ms: i64) -> Result<()> {
        let since = self.last_seq.load(Ordering::SeqCst);
        let page = self
            .with_timeout(self.config.clamped_tool_timeout_ms(), self.bus.log_read(since, 500))
            .await?;
        self.last_seq.store(page.latest_seq.max(since), Ordering::SeqCst);

        let mut accepted = Vec::with_capacity(page.events.len());
        for event in page.events {
            match verify(&event.message) {
                Ok(outcome) if outcome.is_ok() => {}
                Ok(VerifyOutcome::BadSig { reason }) => {
                    self.trace.push(TraceEvent {
                        ts_ms: now_ms,
                        trade_id: Some(event.trade_id.clone()),
                        stage: None,
                        kind: TraceKind::Failure,
                        message: format!("dropped envelope with bad signature: {reason}"),
                        envelope_sig_prefix: event.message.sig.as_deref().map(sig_prefix),
                    });
                    continue;
                }
                Err(e) => {
                    self.trace.push(TraceEvent {
                        ts_ms: now_ms,
                        trade_id: Some(event.trade_id.clone()),
                        stage: None,
                        kind: TraceKind::Failure,
                        message: format!("dropped malformed envelope: {e}"),
                        envelope_sig_prefix: None,
                    });
                    continue;
                }
            }
            if let ValidationResult::Invalid { reason } = validate(&event.message) {
                self.trace.push(TraceEvent {
                    ts_ms: now_ms,
                    trade_id: Some(event.trade_id.clone()),
                    stage: None,
                    kind: TraceKind::Failure,
                    message: format!("dropped envelope failing schema validation: {reason}"),
                    envelope_sig_prefix: event.message.sig.as_deref().map(sig_prefix),
                });
                continue;
            }
            accepted.push(event);
        }

        let mut events = self.events.lock().await;
        events.extend(accepted);
        events.retain(|e| now_ms - e.ts <= self.config.event_max_age_ms);
        Ok(())
    }

    async fn publish_signed(&self, channel: &str, trade_id: &str, body: EnvelopeBody, now_ms: i64) -> Result<Envelope> {
        let unsigned = Envelope::new(1, trade_id, body, now_ms, uuid::Uuid::new_v4().to_string());
        let signed = sign(&unsigned, &self.signing_key)?;
        self.with_timeout(self.config.clamped_tool_timeout_ms(), self.bus.publish(channel, &signed))
            .await?;
        Ok(signed)
    }

    // ---- Pipeline 1: quote-from-offer (maker responds to a matching RFQ) ----

    async fn pipeline_quote_from_offer(
        &self,
        ctx: &TickContext,
        local_peer: &str,
        now_ms: i64,
        now_unix: i64,
        actions_left: &mut usize,
    ) {
        for (trade_id, negotiation) in &ctx.negotiations {
            if *actions_left == 0 {
                break;
            }
            let Some(rfq_event) = &negotiation.rfq else { continue };
            if rfq_event.message.signer.as_deref() == Some(local_peer) {
                continue;
            }
            let EnvelopeBody::Rfq(rfq) = &rfq_event.message.body else { continue };
            if rfq.valid_until_unix <= now_unix {
                continue;
            }
            let Some(sig) = rfq_event.message.sig.clone() else { continue };

            {
                let caches = self.caches.lock().await;
                if caches.auto_quoted_rfq_sig.contains(&sig)
                    || !caches.pipeline_retry_ready("quote_from_offer", &sig, now_ms)
                {
                    continue;
                }
            }

            let Some((offer_line, offer_id, line_index)) = self.match_offer_for_rfq(ctx, local_peer, rfq) else {
                continue;
            };
            let listing_key = format!("offer:{offer_id}:{line_index}");
            match self.store.get_listing_lock(&listing_key).await {
                Ok(Some(lock))
                    if lock.state == ListingLockState::InFlight
                        && lock.trade_id.as_deref() != Some(trade_id.as_str()) =>
                {
                    continue;
                }
                Err(e) => {
                    tracing::warn!(trade_id = %trade_id, error = %e, "failed to read listing lock");
                    continue;
                }
                _ => {}
            }

            let lo = rfq.min_sol_refund_window_sec.max(offer_line.min_sol_refund_window_sec);
            let hi = rfq.max_sol_refund_window_sec.min(offer_line.max_sol_refund_window_sec);
            let Some(window_sec) = clamp_window(DEFAULT_REFUND_WINDOW_SEC, lo, hi) else { continue };

            let platform_fee_bps = DEFAULT_PLATFORM_FEE_BPS
                .min(rfq.max_platform_fee_bps)
                .min(offer_line.max_platform_fee_bps);
            let trade_fee_bps = DEFAULT_TRADE_FEE_BPS
                .min(rfq.max_trade_fee_bps)
                .min(offer_line.max_trade_fee_bps);
            let total_ceiling = rfq.max_total_fee_bps.min(offer_line.max_total_fee_bps);
            if platform_fee_bps + trade_fee_bps > total_ceiling {
                continue;
            }

            let rfq_id = match envelope_id(&rfq_event.message) {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(trade_id = %trade_id, error = %e, "failed to hash rfq envelope");
                    continue;
                }
            };

            let quote_body = QuoteBody {
                rfq_id,
                pair: rfq.pair.clone(),
                direction: rfq.direction,
                app_hash: rfq.app_hash.clone(),
                btc_sats: rfq.btc_sats,
                usdt_amount: rfq.usdt_amount.clone(),
                platform_fee_bps,
                trade_fee_bps,
                trade_fee_collector: local_peer.to_string(),
                offer_id: Some(offer_id.clone()),
                offer_line_index: None,
                sol_refund_window_sec: window_sec,
                valid_until_unix: rfq.valid_until_unix,
            };

            match self
                .publish_signed(&rfq_event.channel, trade_id.as_str(), EnvelopeBody::Quote(quote_body), now_ms)
                .await
            {
                Ok(_) => {
                    *actions_left -= 1;
                    let mut caches = self.caches.lock().await;
                    caches.auto_quoted_rfq_sig.insert(sig, now_ms);
                    drop(caches);
                    let lock_patch = ListingLockPatch {
                        listing_type: Patch::Set("offer_line".to_string()),
                        listing_id: Patch::Set(offer_id.clone()),
                        trade_id: Patch::Set(trade_id.clone()),
                        state: Some(ListingLockState::InFlight),
                        ..Default::default()
                    };
                    if let Err(e) = self.store.upsert_listing_lock(&listing_key, lock_patch, now_ms).await {
                        tracing::warn!(trade_id = %trade_id, error = %e, "failed to lock listing");
                    }
                }
                Err(e) => {
                    let mut caches = self.caches.lock().await;
                    caches.set_pipeline_retry("quote_from_offer", &sig, now_ms + self.config.default_stage_cooldown_ms, now_ms);
                    drop(caches);
                    self.trace.push(TraceEvent {
                        ts_ms: now_ms,
                        trade_id: Some(trade_id.clone()),
                        stage: None,
                        kind: TraceKind::Failure,
                        message: format!("quote_from_offer publish failed: {e}"),
                        envelope_sig_prefix: None,
                    });
                }
            }
        }
    }

    fn match_offer_for_rfq(
        &self,
        ctx: &TickContext,
        local_peer: &str,
        rfq: &crate::envelope::RfqBody,
    ) -> Option<(crate::envelope::OfferLine, String, usize)> {
        for event in &ctx.local_offers {
            if event.message.signer.as_deref() != Some(local_peer) {
                continue;
            }
            let EnvelopeBody::SvcAnnounce(body) = &event.message.body else { continue };
            for (line_index, line) in body.offers.iter().enumerate() {
                let overlap_low = rfq.min_sol_refund_window_sec.max(line.min_sol_refund_window_sec);
                let overlap_high = rfq.max_sol_refund_window_sec.min(line.max_sol_refund_window_sec);
                if line.btc_sats == rfq.btc_sats
                    && line.usdt_amount == rfq.usdt_amount
                    && line.max_platform_fee_bps <= rfq.max_platform_fee_bps
                    && line.max_trade_fee_bps <= rfq.max_trade_fee_bps
                    && line.max_total_fee_bps <= rfq.max_total_fee_bps
                    && overlap_low <= overlap_high
                {
                    if let Ok(offer_id) = envelope_id(&event.message) {
                        return Some((line.clone(), offer_id, line_index));
                    }
                }
            }
        }
        None
    }

    // ---- Pipeline 2: accept-quote (taker accepts the first valid quote on its own RFQ) ----

    async fn pipeline_accept_quote(
        &self,
        ctx: &TickContext,
        local_chain_signer: &str,
        now_ms: i64,
        now_unix: i64,
        actions_left: &mut usize,
    ) {
        for event in &ctx.quote_events {
            if *actions_left == 0 {
                break;
            }
            let trade_id = &event.trade_id;
            if !ctx.my_rfq_trade_ids.contains(trade_id) {
                continue;
            }
            if ctx.trades.get(trade_id).map(|t| t.is_terminal()).unwrap_or(false) {
                continue;
            }
            let Some(sig) = event.message.sig.clone() else { continue };

            {
                let caches = self.caches.lock().await;
                if caches.auto_accepted_quote_sig.contains(&sig)
                    || caches.auto_accepted_trade_lock.contains_key(trade_id)
                    || !caches.pipeline_retry_ready("accept_quote", &sig, now_ms)
                {
                    continue;
                }
            }

            let EnvelopeBody::Quote(quote) = &event.message.body else { continue };
            if quote.valid_until_unix <= now_unix {
                continue;
            }
            let Some(negotiation) = ctx.negotiations.get(trade_id) else { continue };
            let Some(rfq_event) = &negotiation.rfq else { continue };
            let EnvelopeBody::Rfq(rfq) = &rfq_event.message.body else { continue };
            if !cross_validate_quote(quote, rfq).is_ok() {
                continue;
            }

            let quote_id = match envelope_id(&event.message) {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(trade_id = %trade_id, error = %e, "failed to hash quote envelope");
                    continue;
                }
            };
            let accept_body = QuoteAcceptBody {
                rfq_id: quote.rfq_id.clone(),
                quote_id,
                taker_chain_signer: local_chain_signer.to_string(),
            };

            match self
                .publish_signed(&event.channel, trade_id.as_str(), EnvelopeBody::QuoteAccept(accept_body), now_ms)
                .await
            {
                Ok(_) => {
                    *actions_left -= 1;
                    let mut caches = self.caches.lock().await;
                    caches.auto_accepted_quote_sig.insert(sig, now_ms);
                    caches.auto_accepted_trade_lock.insert(trade_id.clone(), now_ms, now_ms);
                }
                Err(e) => {
                    let mut caches = self.caches.lock().await;
                    caches.set_pipeline_retry("accept_quote", &sig, now_ms + self.config.default_stage_cooldown_ms, now_ms);
                    drop(caches);
                    self.trace.push(TraceEvent {
                        ts_ms: now_ms,
                        trade_id: Some(trade_id.clone()),
                        stage: None,
                        kind: TraceKind::Failure,
                        message: format!("accept_quote publish failed: {e}"),
                        envelope_sig_prefix: None,
                    });
                }
            }
        }
    }

    // ---- Pipeline 3: invite-from-accept (maker opens the private swap channel) ----

    async fn pipeline_invite_from_accept(&self, ctx: &TickContext, local_peer: &str, now_ms: i64, actions_left: &mut usize) {
        for event in &ctx.non_local_accepts {
            if *actions_left == 0 {
                break;
            }
            let trade_id = &event.trade_id;
            let EnvelopeBody::QuoteAccept(accept) = &event.message.body else { continue };
            if !ctx.my_quote_by_id.contains_key(&accept.quote_id) {
                continue;
            }
            let Some(sig) = event.message.sig.clone() else { continue };

            {
                let caches = self.caches.lock().await;
                if caches.auto_invited_accept_sig.contains(&sig)
                    || !caches.pipeline_retry_ready("invite_from_accept", &sig, now_ms)
                {
                    continue;
                }
            }

            let swap_channel = swap_channel_for(trade_id);
            let invite_b64 = base64::engine::general_purpose::STANDARD.encode(format!("{trade_id}:{swap_channel}"));
            let invite_body = SwapInviteBody {
                rfq_id: accept.rfq_id.clone(),
                quote_id: accept.quote_id.clone(),
                swap_channel: swap_channel.clone(),
                owner_pubkey: local_peer.to_string(),
                invite_b64,
            };

            match self
                .publish_signed(&event.channel, trade_id.as_str(), EnvelopeBody::SwapInvite(invite_body), now_ms)
                .await
            {
                Ok(_) => {
                    *actions_left -= 1;
                    match self.with_timeout(self.config.subscribe_timeout_ms, self.bus.join(&swap_channel)).await {
                        Ok(()) => self.channels.lock().await.push(swap_channel),
                        Err(e) => {
                            self.trace.push(TraceEvent {
                                ts_ms: now_ms,
                                trade_id: Some(trade_id.clone()),
                                stage: None,
                                kind: TraceKind::Failure,
                                message: format!("join {swap_channel} failed: {e}"),
                                envelope_sig_prefix: None,
                            });
                        }
                    }
                    let mut caches = self.caches.lock().await;
                    caches.auto_invited_accept_sig.insert(sig, now_ms);
                }
                Err(e) => {
                    let mut caches = self.caches.lock().await;
                    caches.set_pipeline_retry("invite_from_accept", &sig, now_ms + self.config.default_stage_cooldown_ms, now_ms);
                    drop(caches);
                    self.trace.push(TraceEvent {
                        ts_ms: now_ms,
                        trade_id: Some(trade_id.clone()),
                        stage: None,
                        kind: TraceKind::Failure,
                        message: format!("invite_from_accept publish failed: {e}"),
                        envelope_sig_prefix: None,
                    });
                }
            }
        }
    }

    // ---- Pipeline 4: join-invite (taker joins the swap channel it was invited to) ----

    async fn pipeline_join_invite(&self, ctx: &TickContext, now_ms: i64, actions_left: &mut usize) {
        for event in &ctx.non_local_invites {
            if *actions_left == 0 {
                break;
            }
            let trade_id = &event.trade_id;
            // SwapInviteBody carries no explicit invitee field; the practical
            // reading is "we're the one who opened the RFQ this invite answers".
            if !ctx.my_rfq_trade_ids.contains(trade_id) {
                continue;
            }
            let EnvelopeBody::SwapInvite(invite) = &event.message.body else { continue };
            let Some(sig) = event.message.sig.clone() else { continue };

            {
                let caches = self.caches.lock().await;
                if caches.auto_joined_invite_sig.contains(&sig)
                    || !caches.pipeline_retry_ready("join_invite", &sig, now_ms)
                {
                    continue;
                }
            }

            match self.with_timeout(self.config.subscribe_timeout_ms, self.bus.join(&invite.swap_channel)).await {
                Ok(()) => {
                    *actions_left -= 1;
                    self.channels.lock().await.push(invite.swap_channel.clone());
                    let mut caches = self.caches.lock().await;
                    caches.auto_joined_invite_sig.insert(sig, now_ms);
                }
                Err(e) => {
                    let mut caches = self.caches.lock().await;
                    caches.set_pipeline_retry("join_invite", &sig, now_ms + self.config.default_stage_cooldown_ms, now_ms);
                    drop(caches);
                    self.trace.push(TraceEvent {
                        ts_ms: now_ms,
                        trade_id: Some(trade_id.clone()),
                        stage: None,
                        kind: TraceKind::Failure,
                        message: format!("join_invite failed: {e}"),
                        envelope_sig_prefix: None,
                    });
                }
            }
        }
    }

    // ---- Pipeline 5: the settlement state machine ----

    async fn pipeline_settlement(
        &self,
        ctx: &TickContext,
        local_peer: &str,
        local_chain_signer: &str,
        now_ms: i64,
        now_unix: i64,
        actions_left: &mut usize,
    ) {
        let mut trade_ids: Vec<String> = ctx
            .negotiations
            .keys()
            .chain(ctx.trades.keys())
            .cloned()
            .collect();
        trade_ids.sort();
        trade_ids.dedup();

        for trade_id in trade_ids.into_iter().take(self.config.max_trades) {
            if *actions_left == 0 {
                break;
            }
            let empty_trade_ctx = TradeContext::default();
            let trade_ctx = ctx.trades.get(&trade_id).unwrap_or(&empty_trade_ctx);
            if trade_ctx.is_terminal() {
                self.release_listing_locks_for_trade(&trade_id, now_ms).await;
                continue;
            }
            let empty_negotiation = Negotiation::default();
            let negotiation = ctx.negotiations.get(&trade_id).unwrap_or(&empty_negotiation);

            let i_am_maker = negotiation
                .quote
                .as_ref()
                .map(|e| e.message.signer.as_deref() == Some(local_peer))
                .unwrap_or(false)
                || trade_ctx
                    .terms
                    .as_ref()
                    .map(|e| e.message.signer.as_deref() == Some(local_peer))
                    .unwrap_or(false);
            let i_am_taker = trade_ctx
                .accept
                .as_ref()
                .map(|e| e.message.signer.as_deref() == Some(local_peer))
                .unwrap_or(false)
                || negotiation
                    .quote_accept
                    .as_ref()
                    .map(|e| e.message.signer.as_deref() == Some(local_peer))
                    .unwrap_or(false)
                || ctx.my_rfq_trade_ids.contains(&trade_id);

            if !i_am_maker && !i_am_taker {
                continue;
            }

            self.run_stage_for_trade(
                &trade_id,
                negotiation,
                trade_ctx,
                i_am_maker,
                i_am_taker,
                local_peer,
                local_chain_signer,
                now_ms,
                now_unix,
                actions_left,
            )
            .await;
        }
    }

    async fn stage_ready(&self, trade_id: &str, stage: &str, now_ms: i64) -> bool {
        let caches = self.caches.lock().await;
        let key = stage_key(trade_id, stage);
        if caches.stage_done.contains_key(&key) || caches.stage_in_flight.contains(&key) {
            return false;
        }
        if let Some(retry_after) = caches.stage_retry_after.get(&key) {
            if now_ms < *retry_after {
                return false;
            }
        }
        true
    }

    async fn mark_in_flight(&self, trade_id: &str, stage: &str, now_ms: i64) {
        let mut caches = self.caches.lock().await;
        caches.stage_in_flight.insert(stage_key(trade_id, stage), now_ms);
    }

    async fn clear_in_flight(&self, trade_id: &str, stage: &str) {
        let mut caches = self.caches.lock().await;
        caches.stage_in_flight.remove(&stage_key(trade_id, stage));
    }

    async fn complete_stage(&self, trade_id: &str, stage: &str, now_ms: i64) {
        let mut caches = self.caches.lock().await;
        let key = stage_key(trade_id, stage);
        caches.stage_in_flight.remove(&key);
        caches.stage_done.insert(key, now_ms, now_ms);
        drop(caches);
        self.trace.push(TraceEvent {
            ts_ms: now_ms,
            trade_id: Some(trade_id.to_string()),
            stage: Some(stage.to_string()),
            kind: TraceKind::StageTransition,
            message: format!("{stage} completed"),
            envelope_sig_prefix: None,
        });
    }

    /// Flips any `in_flight` listing lock pointing at this trade to
    /// `filled` once the trade reaches a terminal state, so the listing
    /// can back a new trade again (spec §4.4, §4.7).
    async fn release_listing_locks_for_trade(&self, trade_id: &str, now_ms: i64) {
        let locks = match self.store.list_listing_locks_by_trade(trade_id).await {
            Ok(locks) => locks,
            Err(e) => {
                tracing::warn!(trade_id = %trade_id, error = %e, "failed to list listing locks");
                return;
            }
        };
        for lock in locks {
            if lock.state != ListingLockState::InFlight {
                continue;
            }
            let patch = ListingLockPatch {
                state: Some(ListingLockState::Filled),
                ..Default::default()
            };
            if let Err(e) = self.store.upsert_listing_lock(&lock.listing_key, patch, now_ms).await {
                tracing::warn!(trade_id = %trade_id, error = %e, "failed to release listing lock");
            }
        }
    }

    async fn fail_stage(&self, trade_id: &str, stage: &str, now_ms: i64, reason: &str) {
        let cooldown = if stage == "sol_claim" {
            self.config.sol_claim_cooldown_ms
        } else {
            self.config.default_stage_cooldown_ms
        };
        let mut caches = self.caches.lock().await;
        let key = stage_key(trade_id, stage);
        caches.stage_in_flight.remove(&key);
        caches.stage_retry_after.insert(key, now_ms + cooldown, now_ms);
        drop(caches);

        if let Ok(Some(_)) = self.store.get_trade(trade_id).await {
            let patch = TradePatch {
                last_error: Patch::Set(reason.to_string()),
                ..Default::default()
            };
            let _ = self.store.upsert_trade(trade_id, patch, now_ms).await;
        }
        self.trace.push(TraceEvent {
            ts_ms: now_ms,
            trade_id: Some(trade_id.to_string()),
            stage: Some(stage.to_string()),
            kind: TraceKind::Failure,
            message: reason.to_string(),
            envelope_sig_prefix: None,
        });
    }

    async fn persist_trade(&self, trade_id: &str, role: Role, now_ms: i64, build: impl FnOnce(&mut TradePatch)) {
        let mut patch = TradePatch {
            role: Some(role),
            ..Default::default()
        };
        build(&mut patch);
        if let Err(e) = self.store.upsert_trade(trade_id, patch, now_ms).await {
            tracing::warn!(trade_id = %trade_id, error = %e, "failed to persist trade receipt");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stage_for_trade(
        &self,
        trade_id: &str,
        negotiation: &Negotiation,
        trade_ctx: &TradeContext,
        i_am_maker: bool,
        i_am_taker: bool,
        local_peer: &str,
        local_chain_signer: &str,
        now_ms: i64,
        now_unix: i64,
        actions_left: &mut usize,
    ) {
        let has_terms = trade_ctx.terms.is_some();
        let has_accept = trade_ctx.accept.is_some();
        let has_invoice = trade_ctx.invoice.is_some();
        let has_escrow = trade_ctx.escrow.is_some();
        let has_ln_paid = trade_ctx.ln_paid.is_some();
        let has_claimed = trade_ctx.claimed.is_some();

        if i_am_maker
            && negotiation.quote.is_some()
            && negotiation.rfq.is_some()
            && negotiation.quote_accept.is_some()
            && !has_terms
        {
            if self.stage_ready(trade_id, "terms_post", now_ms).await {
                self.run_terms_post(trade_id, negotiation, local_chain_signer, now_ms, now_unix, actions_left).await;
            }
            return;
        }
        if i_am_taker && has_terms && !has_accept {
            if self.stage_ready(trade_id, "terms_accept", now_ms).await {
                self.run_terms_accept(trade_id, trade_ctx, local_peer, local_chain_signer, now_ms, actions_left).await;
            }
            return;
        }
        if i_am_maker && has_terms && has_accept && !has_invoice {
            if self.stage_ready(trade_id, "ln_invoice", now_ms).await {
                self.run_ln_invoice(trade_id, trade_ctx, now_ms, actions_left).await;
            }
            return;
        }
        if i_am_maker && has_terms && has_invoice && !has_escrow {
            if self.stage_ready(trade_id, "sol_escrow", now_ms).await {
                self.run_sol_escrow(trade_id, trade_ctx, now_ms, actions_left).await;
            }
            return;
        }
        if i_am_taker && has_terms && has_invoice && has_escrow && !has_ln_paid {
            if self.stage_ready(trade_id, "ln_pay", now_ms).await {
                self.run_ln_pay(trade_id, trade_ctx, local_peer, local_chain_signer, now_ms, actions_left).await;
            }
            return;
        }
        if i_am_taker && has_terms && has_ln_paid && !has_claimed {
            if self.stage_ready(trade_id, "sol_claim", now_ms).await {
                self.run_sol_claim(trade_id, trade_ctx, local_peer, local_chain_signer, now_ms, actions_left).await;
            }
        }
    }

    async fn run_terms_post(
        &self,
        trade_id: &str,
        negotiation: &Negotiation,
        local_chain_signer: &str,
        now_ms: i64,
        now_unix: i64,
        actions_left: &mut usize,
    ) {
        if *actions_left == 0 {
            return;
        }
        let stage = "terms_post";
        self.mark_in_flight(trade_id, stage, now_ms).await;

        let Some(quote_event) = &negotiation.quote else {
            self.clear_in_flight(trade_id, stage).await;
            return;
        };
        let EnvelopeBody::Quote(quote) = &quote_event.message.body else {
            self.clear_in_flight(trade_id, stage).await;
            return;
        };
        let Some(quote_accept_event) = &negotiation.quote_accept else {
            self.clear_in_flight(trade_id, stage).await;
            return;
        };
        let EnvelopeBody::QuoteAccept(quote_accept) = &quote_accept_event.message.body else {
            self.clear_in_flight(trade_id, stage).await;
            return;
        };
        let local_peer = quote_event.message.signer.clone().unwrap_or_default();
        let counterparty = quote_accept_event.message.signer.clone().unwrap_or_default();

        // The taker is the party paying BTC and claiming the token escrow;
        // the maker (this process) is refunded if the trade times out.
        let terms_body = TermsBody {
            btc_sats: quote.btc_sats,
            usdt_amount: quote.usdt_amount.clone(),
            sol_mint: self.mint_address.clone(),
            sol_recipient: quote_accept.taker_chain_signer.clone(),
            sol_refund: local_chain_signer.to_string(),
            sol_refund_after_unix: now_unix + quote.sol_refund_window_sec as i64,
            ln_receiver_peer: local_peer,
            ln_payer_peer: counterparty,
            trade_fee_collector: quote.trade_fee_collector.clone(),
            platform_fee_bps: quote.platform_fee_bps,
            trade_fee_bps: quote.trade_fee_bps,
            terms_valid_until_unix: quote.valid_until_unix,
        };

        let channel = swap_channel_for(trade_id);
        match self.publish_signed(&channel, trade_id, EnvelopeBody::Terms(terms_body.clone()), now_ms).await {
            Ok(_) => {
                *actions_left -= 1;
                self.persist_trade(trade_id, Role::Maker, now_ms, |p| {
                    p.swap_channel = Patch::Set(channel.clone());
                    p.btc_sats = Patch::Set(terms_body.btc_sats as i64);
                    p.usdt_amount = Patch::Set(terms_body.usdt_amount.clone());
                    p.platform_fee_bps = Patch::Set(terms_body.platform_fee_bps as i64);
                    p.trade_fee_bps = Patch::Set(terms_body.trade_fee_bps as i64);
                    p.sol_refund_after_unix = Patch::Set(terms_body.sol_refund_after_unix);
                    p.state = Some(TradeState::Terms);
                })
                .await;
                self.complete_stage(trade_id, stage, now_ms).await;
            }
            Err(e) => self.fail_stage(trade_id, stage, now_ms, &e.to_string()).await,
        }
    }

    async fn run_terms_accept(
        &self,
        trade_id: &str,
        trade_ctx: &TradeContext,
        local_peer: &str,
        local_chain_signer: &str,
        now_ms: i64,
        actions_left: &mut usize,
    ) {
        if *actions_left == 0 {
            return;
        }
        let stage = "terms_accept";
        self.mark_in_flight(trade_id, stage, now_ms).await;

        let Some(terms_event) = &trade_ctx.terms else {
            self.clear_in_flight(trade_id, stage).await;
            return;
        };
        if let Err(reason) = binding_ok(trade_ctx, local_peer, local_chain_signer) {
            self.fail_stage(trade_id, stage, now_ms, &reason).await;
            return;
        }

        let terms_hash = match envelope_id(&terms_event.message) {
            Ok(h) => h,
            Err(e) => {
                self.fail_stage(trade_id, stage, now_ms, &e.to_string()).await;
                return;
            }
        };

        let channel = swap_channel_for(trade_id);
        match self
            .publish_signed(&channel, trade_id, EnvelopeBody::Accept(AcceptBody { terms_hash }), now_ms)
            .await
        {
            Ok(_) => {
                *actions_left -= 1;
                self.persist_trade(trade_id, Role::Taker, now_ms, |p| {
                    p.swap_channel = Patch::Set(channel.clone());
                    p.state = Some(TradeState::Accepted);
                })
                .await;
                self.complete_stage(trade_id, stage, now_ms).await;
            }
            Err(e) => self.fail_stage(trade_id, stage, now_ms, &e.to_string()).await,
        }
    }

    async fn run_ln_invoice(&self, trade_id: &str, trade_ctx: &TradeContext, now_ms: i64, actions_left: &mut usize) {
        if *actions_left == 0 {
            return;
        }
        let stage = "ln_invoice";
        self.mark_in_flight(trade_id, stage, now_ms).await;

        let Some(terms_event) = &trade_ctx.terms else {
            self.clear_in_flight(trade_id, stage).await;
            return;
        };
        let EnvelopeBody::Terms(terms) = &terms_event.message.body else {
            self.clear_in_flight(trade_id, stage).await;
            return;
        };

        let expiry_sec = (terms.sol_refund_after_unix - now_ms / 1000).max(3600);
        let invoice = match self
            .with_timeout(
                self.config.clamped_tool_timeout_ms(),
                self.ln.create_invoice(terms.btc_sats * 1000, &format!("swap:{trade_id}"), expiry_sec),
            )
            .await
        {
            Ok(inv) => inv,
            Err(e) => {
                self.fail_stage(trade_id, stage, now_ms, &e.to_string()).await;
                return;
            }
        };

        let invoice_body = LnInvoiceBody {
            bolt11: invoice.payment_request.clone(),
            payment_hash_hex: invoice.payment_hash.clone(),
        };
        let channel = swap_channel_for(trade_id);
        match self.publish_signed(&channel, trade_id, EnvelopeBody::LnInvoice(invoice_body), now_ms).await {
            Ok(_) => {
                *actions_left -= 1;
                self.persist_trade(trade_id, Role::Maker, now_ms, |p| {
                    p.ln_invoice_bolt11 = Patch::Set(invoice.payment_request.clone());
                    p.ln_payment_hash_hex = Patch::Set(invoice.payment_hash.clone());
                    p.state = Some(TradeState::Invoice);
                })
                .await;
                self.complete_stage(trade_id, stage, now_ms).await;
            }
            Err(e) => self.fail_stage(trade_id, stage, now_ms, &e.to_string()).await,
        }
    }

    async fn run_sol_escrow(&self, trade_id: &str, trade_ctx: &TradeContext, now_ms: i64, actions_left: &mut usize) {
        if *actions_left == 0 {
            return;
        }
        let stage = "sol_escrow";
        self.mark_in_flight(trade_id, stage, now_ms).await;

        let (Some(terms_event), Some(invoice_event)) = (&trade_ctx.terms, &trade_ctx.invoice) else {
            self.clear_in_flight(trade_id, stage).await;
            return;
        };
        let EnvelopeBody::Terms(terms) = &terms_event.message.body else {
            self.clear_in_flight(trade_id, stage).await;
            return;
        };
        let EnvelopeBody::LnInvoice(invoice) = &invoice_event.message.body else {
            self.clear_in_flight(trade_id, stage).await;
            return;
        };

        let params = EscrowInitParams {
            trade_id: trade_id.to_string(),
            mint: terms.sol_mint.clone(),
            amount: terms.usdt_amount.clone(),
            beneficiary: terms.sol_recipient.clone(),
            depositor: terms.sol_refund.clone(),
            hashlock: invoice.payment_hash_hex.clone(),
            refund_after_unix: terms.sol_refund_after_unix,
            trade_fee_collector: terms.trade_fee_collector.clone(),
        };

        let tx = match self
            .with_timeout(self.config.clamped_tool_timeout_ms(), self.chain.build_escrow_init_tx(&params))
            .await
        {
            Ok(tx) => tx,
            Err(e) => {
                self.fail_stage(trade_id, stage, now_ms, &e.to_string()).await;
                return;
            }
        };
        let escrow_pda = match self
            .with_timeout(self.config.clamped_tool_timeout_ms(), self.chain.send_and_confirm(&tx))
            .await
        {
            Ok(sig) => sig,
            Err(e) => {
                self.fail_stage(trade_id, stage, now_ms, &e.to_string()).await;
                return;
            }
        };

        let net_amount: u64 = terms.usdt_amount.parse().unwrap_or(0);
        let total_fee_bps = (terms.platform_fee_bps + terms.trade_fee_bps) as u64;
        let fee_amount = net_amount.saturating_mul(total_fee_bps) / 10_000;
        let net_after_fee = net_amount.saturating_sub(fee_amount);
        let vault_ata = format!("vault-{trade_id}");

        let escrow_body = SolEscrowCreatedBody {
            escrow_pda: escrow_pda.clone(),
            vault_ata: vault_ata.clone(),
            payment_hash_hex: invoice.payment_hash_hex.clone(),
            net_amount: net_after_fee,
            fee_amount,
            refund_after_unix: terms.sol_refund_after_unix,
            tx_sig: escrow_pda.clone(),
        };

        let channel = swap_channel_for(trade_id);
        match self.publish_signed(&channel, trade_id, EnvelopeBody::SolEscrowCreated(escrow_body), now_ms).await {
            Ok(_) => {
                *actions_left -= 1;
                self.persist_trade(trade_id, Role::Maker, now_ms, |p| {
                    p.sol_escrow_pda = Patch::Set(escrow_pda.clone());
                    p.sol_vault_ata = Patch::Set(vault_ata.clone());
                    p.state = Some(TradeState::Escrow);
                })
                .await;
                self.complete_stage(trade_id, stage, now_ms).await;
            }
            Err(e) => self.fail_stage(trade_id, stage, now_ms, &e.to_string()).await,
        }
    }

    async fn run_ln_pay(
        &self,
        trade_id: &str,
        trade_ctx: &TradeContext,
        local_peer: &str,
        local_chain_signer: &str,
        now_ms: i64,
        actions_left: &mut usize,
    ) {
        if *actions_left == 0 {
            return;
        }
        let stage = "ln_pay";
        self.mark_in_flight(trade_id, stage, now_ms).await;

        if let Err(reason) = binding_ok(trade_ctx, local_peer, local_chain_signer) {
            self.fail_stage(trade_id, stage, now_ms, &reason).await;
            return;
        }
        let Some(invoice_event) = &trade_ctx.invoice else {
            self.clear_in_flight(trade_id, stage).await;
            return;
        };
        let EnvelopeBody::LnInvoice(invoice) = &invoice_event.message.body else {
            self.clear_in_flight(trade_id, stage).await;
            return;
        };

        let pay_result = match self
            .with_timeout(self.config.clamped_tool_timeout_ms(), self.ln.pay(&invoice.bolt11))
            .await
        {
            Ok(r) => r,
            Err(e) => {
                self.fail_stage(trade_id, stage, now_ms, &e.to_string()).await;
                return;
            }
        };

        match pay_result.outcome {
            PayOutcome::Succeeded => {
                let Some(preimage) = pay_result.preimage else {
                    self.fail_stage(trade_id, stage, now_ms, "ln pay succeeded without a preimage").await;
                    return;
                };
                let paid_body = LnPaidBody {
                    payment_hash_hex: invoice.payment_hash_hex.clone(),
                    preimage_hex: preimage.clone(),
                };
                let channel = swap_channel_for(trade_id);
                match self.publish_signed(&channel, trade_id, EnvelopeBody::LnPaid(paid_body), now_ms).await {
                    Ok(_) => {
                        *actions_left -= 1;
                        let mut caches = self.caches.lock().await;
                        caches.trade_preimage.insert(trade_id.to_string(), preimage.clone(), now_ms);
                        drop(caches);
                        self.persist_trade(trade_id, Role::Taker, now_ms, |p| {
                            p.ln_preimage_hex = Patch::Set(preimage.clone());
                            p.ln_payment_hash_hex = Patch::Set(invoice.payment_hash_hex.clone());
                            p.state = Some(TradeState::LnPaid);
                        })
                        .await;
                        self.complete_stage(trade_id, stage, now_ms).await;
                    }
                    Err(e) => self.fail_stage(trade_id, stage, now_ms, &e.to_string()).await,
                }
            }
            PayOutcome::Pending => self.fail_stage(trade_id, stage, now_ms, "payment pending").await,
            PayOutcome::Failed { reason } => self.fail_stage(trade_id, stage, now_ms, &reason).await,
        }
    }

    async fn run_sol_claim(
        &self,
        trade_id: &str,
        trade_ctx: &TradeContext,
        local_peer: &str,
        local_chain_signer: &str,
        now_ms: i64,
        actions_left: &mut usize,
    ) {
        if *actions_left == 0 {
            return;
        }
        let stage = "sol_claim";
        self.mark_in_flight(trade_id, stage, now_ms).await;

        if let Err(reason) = binding_ok(trade_ctx, local_peer, local_chain_signer) {
            self.fail_stage(trade_id, stage, now_ms, &reason).await;
            return;
        }
        let Some(ln_paid_event) = &trade_ctx.ln_paid else {
            self.clear_in_flight(trade_id, stage).await;
            return;
        };
        let EnvelopeBody::LnPaid(ln_paid) = &ln_paid_event.message.body else {
            self.clear_in_flight(trade_id, stage).await;
            return;
        };

        let cached_preimage = {
            let caches = self.caches.lock().await;
            caches.trade_preimage.get(&trade_id.to_string()).cloned()
        };
        let preimage = match cached_preimage {
            Some(p) => p,
            None => match self.store.get_trade(trade_id).await {
                Ok(Some(record)) if record.ln_preimage_hex.is_some() => record.ln_preimage_hex.unwrap(),
                _ => ln_paid.preimage_hex.clone(),
            },
        };

        let escrow_account = match self.store.get_trade(trade_id).await {
            Ok(Some(record)) if record.sol_escrow_pda.is_some() => record.sol_escrow_pda.unwrap(),
            _ => match &trade_ctx.escrow {
                Some(escrow_event) => match &escrow_event.message.body {
                    EnvelopeBody::SolEscrowCreated(body) => body.escrow_pda.clone(),
                    _ => {
                        self.fail_stage(trade_id, stage, now_ms, "escrow event malformed").await;
                        return;
                    }
                },
                None => {
                    self.fail_stage(trade_id, stage, now_ms, "no escrow account on record").await;
                    return;
                }
            },
        };

        let Some(terms_event) = &trade_ctx.terms else {
            self.fail_stage(trade_id, stage, now_ms, "no terms on record").await;
            return;
        };
        let EnvelopeBody::Terms(terms) = &terms_event.message.body else {
            self.fail_stage(trade_id, stage, now_ms, "terms event malformed").await;
            return;
        };

        let tx = match self
            .with_timeout(
                self.config.clamped_tool_timeout_ms(),
                self.chain.build_claim_tx(&ClaimParams {
                    trade_id: trade_id.to_string(),
                    escrow_account: escrow_account.clone(),
                    preimage: preimage.clone(),
                    trade_fee_collector: terms.trade_fee_collector.clone(),
                }),
            )
            .await
        {
            Ok(tx) => tx,
            Err(e) => {
                self.fail_stage(trade_id, stage, now_ms, &e.to_string()).await;
                return;
            }
        };
        let tx_sig = match self
            .with_timeout(self.config.clamped_tool_timeout_ms(), self.chain.send_and_confirm(&tx))
            .await
        {
            Ok(sig) => sig,
            Err(e) => {
                self.fail_stage(trade_id, stage, now_ms, &e.to_string()).await;
                return;
            }
        };

        let claimed_body = SolClaimedBody {
            payment_hash_hex: ln_paid.payment_hash_hex.clone(),
            tx_sig,
        };
        let channel = swap_channel_for(trade_id);
        match self.publish_signed(&channel, trade_id, EnvelopeBody::SolClaimed(claimed_body), now_ms).await {
            Ok(_) => {
                *actions_left -= 1;
                self.persist_trade(trade_id, Role::Taker, now_ms, |p| {
                    p.state = Some(TradeState::Claimed);
                })
                .await;
                self.complete_stage(trade_id, stage, now_ms).await;
            }
            Err(e) => self.fail_stage(trade_id, stage, now_ms, &e.to_string()).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::fake::FakeBus;
    use crate::chain::fake::FakeChain;
    use crate::envelope::{Direction, OfferLine, RfqBody, SvcAnnounceBody};
    use crate::ln::fake::FakeLn;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use std::sync::atomic::AtomicI64;

    struct FixedClock(AtomicI64);

    impl DriverClock for FixedClock {
        fn now_ms(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn maker_driver(
        clock_ms: i64,
    ) -> (
        SettlementDriver<FakeBus, FakeLn, FakeChain>,
        Arc<FakeBus>,
        SigningKey,
    ) {
        let bus = Arc::new(FakeBus::new("maker-peer"));
        let ln = Arc::new(FakeLn::new());
        let chain = Arc::new(FakeChain::new("maker-chain-signer"));
        let sk = SigningKey::generate(&mut OsRng);
        let store = futures::executor::block_on(Store::open_in_memory()).unwrap();
        let clock: Arc<dyn DriverClock> = Arc::new(FixedClock(AtomicI64::new(clock_ms)));
        let driver = SettlementDriver::with_clock(
            bus.clone(),
            ln,
            chain,
            store,
            DriverConfig::default(),
            sk.clone(),
            "usdt-mint",
            vec!["rfq:btc-usdt".to_string()],
            clock,
        );
        (driver, bus, sk)
    }

    fn sample_rfq() -> RfqBody {
        RfqBody {
            pair: "BTC-USDT".into(),
            direction: Direction::BtcForToken,
            app_hash: "deadbeef".into(),
            btc_sats: 1000,
            usdt_amount: "670000".into(),
            max_platform_fee_bps: 500,
            max_trade_fee_bps: 1000,
            max_total_fee_bps: 1500,
            min_sol_refund_window_sec: 3600,
            max_sol_refund_window_sec: 604_800,
            valid_until_unix: 4_000_000_000,
        }
    }

    fn sample_offer_line() -> OfferLine {
        OfferLine {
            btc_sats: 1000,
            usdt_amount: "670000".into(),
            max_platform_fee_bps: 500,
            max_trade_fee_bps: 1000,
            max_total_fee_bps: 1500,
            min_sol_refund_window_sec: 3600,
            max_sol_refund_window_sec: 604_800,
        }
    }

    #[tokio::test]
    async fn quote_from_offer_matches_s1_fee_and_window_witness() {
        let (driver, bus, sk) = maker_driver(1_700_000_000_000);
        let taker_sk = SigningKey::generate(&mut OsRng);

        let announce = Envelope::new(
            1,
            "offer-trade",
            EnvelopeBody::SvcAnnounce(SvcAnnounceBody {
                name: "maker".into(),
                pairs: vec!["BTC-USDT".into()],
                rfq_channels: vec!["rfq:btc-usdt".into()],
                note: None,
                offers: vec![sample_offer_line()],
                valid_until_unix: 4_000_000_000,
            }),
            1_700_000_000_000,
            "nonce-announce",
        );
        let signed_announce = sign(&announce, &sk).unwrap();
        bus.inject("rfq:btc-usdt", signed_announce);

        let rfq = Envelope::new(1, "trade-1", EnvelopeBody::Rfq(sample_rfq()), 1_700_000_000_000, "nonce-rfq");
        let rfq_signed = sign(&rfq, &taker_sk).unwrap();
        bus.inject("rfq:btc-usdt", rfq_signed);

        driver.tick().await.unwrap();

        let page = bus.log_read(0, 100).await.unwrap();
        let quote_event = page
            .events
            .iter()
            .find(|e| matches!(e.message.body, EnvelopeBody::Quote(_)))
            .expect("quote should have been published");

        match &quote_event.message.body {
            EnvelopeBody::Quote(q) => {
                assert_eq!(q.platform_fee_bps, 10);
                assert_eq!(q.trade_fee_bps, 10);
                assert_eq!(q.sol_refund_window_sec, 259_200);
            }
            _ => panic!("wrong body"),
        }
    }

    #[tokio::test]
    async fn quote_from_offer_is_not_republished_on_second_tick() {
        let (driver, bus, sk) = maker_driver(1_700_000_000_000);
        let taker_sk = SigningKey::generate(&mut OsRng);

        let announce = Envelope::new(
            1,
            "offer-trade",
            EnvelopeBody::SvcAnnounce(SvcAnnounceBody {
                name: "maker".into(),
                pairs: vec!["BTC-USDT".into()],
                rfq_channels: vec!["rfq:btc-usdt".into()],
                note: None,
                offers: vec![sample_offer_line()],
                valid_until_unix: 4_000_000_000,
            }),
            1_700_000_000_000,
            "nonce-announce",
        );
        bus.inject("rfq:btc-usdt", sign(&announce, &sk).unwrap());

        let rfq_signed = sign(
            &Envelope::new(1, "trade-1", EnvelopeBody::Rfq(sample_rfq()), 1_700_000_000_000, "nonce-rfq"),
            &taker_sk,
        )
        .unwrap();
        bus.inject("rfq:btc-usdt", rfq_signed);

        driver.tick().await.unwrap();
        driver.tick().await.unwrap();

        let page = bus.log_read(0, 100).await.unwrap();
        let quote_count = page
            .events
            .iter()
            .filter(|e| matches!(e.message.body, EnvelopeBody::Quote(_)))
            .count();
        assert_eq!(quote_count, 1);
    }

    #[tokio::test]
    async fn no_matching_offer_means_no_quote() {
        let (driver, bus, _sk) = maker_driver(1_700_000_000_000);
        let taker_sk = SigningKey::generate(&mut OsRng);

        let rfq_signed = sign(
            &Envelope::new(1, "trade-1", EnvelopeBody::Rfq(sample_rfq()), 1_700_000_000_000, "nonce-rfq"),
            &taker_sk,
        )
        .unwrap();
        bus.inject("rfq:btc-usdt", rfq_signed);

        driver.tick().await.unwrap();

        let page = bus.log_read(0, 100).await.unwrap();
        assert!(page.events.iter().all(|e| !matches!(e.message.body, EnvelopeBody::Quote(_))));
    }

    #[tokio::test]
    async fn stats_advance_after_a_tick() {
        let (driver, _bus, _sk) = maker_driver(1_700_000_000_000);
        driver.tick().await.unwrap();
        let stats = driver.stats().await;
        assert_eq!(stats.ticks, 1);
    }
}
