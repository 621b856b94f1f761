//! Event context builder (spec §4.6, C6).
//!
//! A pure, synchronous fold over the driver's in-memory window of bus
//! events into per-negotiation and per-trade contexts. Assumes `events`
//! is already ordered ascending by `seq` (as `BusClient::log_read`
//! returns it), so "first-seen" fields can be filled with a plain
//! `get_or_insert` during a single pass.

use std::collections::{HashMap, HashSet};

use crate::bus::{BusEvent, SWAP_CHANNEL_PREFIX};
use crate::envelope::EnvelopeBody;

/// First-seen negotiation envelopes for one `trade_id`, taken from
/// whichever channel they were published on (not necessarily `swap:*`).
#[derive(Debug, Clone, Default)]
pub struct Negotiation {
    pub rfq: Option<BusEvent>,
    pub quote: Option<BusEvent>,
    pub quote_accept: Option<BusEvent>,
    pub swap_invite: Option<BusEvent>,
    pub swap_channel: Option<String>,
}

/// Settlement-phase envelopes for one trade, taken only from its
/// `swap:<trade_id>` channel.
#[derive(Debug, Clone, Default)]
pub struct TradeContext {
    pub terms: Option<BusEvent>,
    pub accept: Option<BusEvent>,
    pub invoice: Option<BusEvent>,
    pub escrow: Option<BusEvent>,
    pub ln_paid: Option<BusEvent>,
    pub claimed: Option<BusEvent>,
    pub refunded: Option<BusEvent>,
    pub canceled: Option<BusEvent>,
    pub last_ts: i64,
}

impl TradeContext {
    /// Terminal trades are excluded from further driver work and pruned
    /// from caches (spec §4.6).
    pub fn is_terminal(&self) -> bool {
        self.claimed.is_some() || self.refunded.is_some() || self.canceled.is_some()
    }
}

/// The full per-tick fold result (spec §4.6).
#[derive(Debug, Clone, Default)]
pub struct TickContext {
    pub negotiations: HashMap<String, Negotiation>,
    pub trades: HashMap<String, TradeContext>,
    pub my_rfq_trade_ids: HashSet<String>,
    /// Local quotes, keyed by envelope ID (used as `quote_id` elsewhere).
    pub my_quote_by_id: HashMap<String, BusEvent>,
    /// Non-local quotes, in arrival order.
    pub quote_events: Vec<BusEvent>,
    /// This peer's own `svc_announce` listings.
    pub local_offers: Vec<BusEvent>,
    pub non_local_accepts: Vec<BusEvent>,
    pub non_local_invites: Vec<BusEvent>,
}

/// Fold a window of bus events into a [`TickContext`].
///
/// `local_peer` is this process's hex-encoded public key; an event is
/// "local" iff its envelope's `signer` matches it.
pub fn build_tick_context(events: &[BusEvent], local_peer: &str) -> TickContext {
    let mut ctx = TickContext::default();

    for event in events {
        let is_local = event.message.signer.as_deref() == Some(local_peer);
        let trade_id = event.trade_id.clone();

        match &event.message.body {
            EnvelopeBody::Rfq(_) => {
                if is_local {
                    ctx.my_rfq_trade_ids.insert(trade_id.clone());
                }
                let negotiation = ctx.negotiations.entry(trade_id).or_default();
                if negotiation.rfq.is_none() {
                    negotiation.rfq = Some(event.clone());
                }
            }
            EnvelopeBody::Quote(_) => {
                match crate::canon::envelope_id(&event.message) {
                    Ok(id) => {
                        if is_local {
                            ctx.my_quote_by_id.entry(id).or_insert_with(|| event.clone());
                        } else {
                            ctx.quote_events.push(event.clone());
                        }
                    }
                    Err(e) => {
                        tracing::warn!(trade_id = %trade_id, error = %e, "failed to hash quote envelope");
                    }
                }
                let negotiation = ctx.negotiations.entry(trade_id).or_default();
                if negotiation.quote.is_none() {
                    negotiation.quote = Some(event.clone());
                }
            }
            EnvelopeBody::QuoteAccept(_) => {
                if !is_local {
                    ctx.non_local_accepts.push(event.clone());
                }
                let negotiation = ctx.negotiations.entry(trade_id).or_default();
                if negotiation.quote_accept.is_none() {
                    negotiation.quote_accept = Some(event.clone());
                }
            }
            EnvelopeBody::SvcAnnounce(_) => {
                if is_local {
                    ctx.local_offers.push(event.clone());
                }
            }
            EnvelopeBody::SwapInvite(body) => {
                if !is_local {
                    ctx.non_local_invites.push(event.clone());
                }
                let negotiation = ctx.negotiations.entry(trade_id).or_default();
                if negotiation.swap_invite.is_none() {
                    negotiation.swap_invite = Some(event.clone());
                    negotiation.swap_channel = Some(body.swap_channel.clone());
                }
            }
            EnvelopeBody::Terms(_) => set_first_seen(&mut ctx, event, |t| &mut t.terms),
            EnvelopeBody::Accept(_) => set_first_seen(&mut ctx, event, |t| &mut t.accept),
            EnvelopeBody::LnInvoice(_) => set_first_seen(&mut ctx, event, |t| &mut t.invoice),
            EnvelopeBody::SolEscrowCreated(_) => set_first_seen(&mut ctx, event, |t| &mut t.escrow),
            EnvelopeBody::LnPaid(_) => set_first_seen(&mut ctx, event, |t| &mut t.ln_paid),
            EnvelopeBody::SolClaimed(_) => set_first_seen(&mut ctx, event, |t| &mut t.claimed),
            EnvelopeBody::SolRefunded(_) => set_first_seen(&mut ctx, event, |t| &mut t.refunded),
            EnvelopeBody::Cancel(_) => set_first_seen(&mut ctx, event, |t| &mut t.canceled),
        }

        if event.channel.starts_with(SWAP_CHANNEL_PREFIX) {
            let trade_ctx = ctx.trades.entry(event.trade_id.clone()).or_default();
            trade_ctx.last_ts = trade_ctx.last_ts.max(event.ts);
        }
    }

    ctx
}

fn set_first_seen(
    ctx: &mut TickContext,
    event: &BusEvent,
    slot: impl FnOnce(&mut TradeContext) -> &mut Option<BusEvent>,
) {
    if !event.channel.starts_with(SWAP_CHANNEL_PREFIX) {
        return;
    }
    let trade_ctx = ctx.trades.entry(event.trade_id.clone()).or_default();
    let field = slot(trade_ctx);
    if field.is_none() {
        *field = Some(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Direction, Envelope, EnvelopeBody, QuoteBody, RfqBody, TermsBody};

    fn rfq_event(seq: u64, trade_id: &str, signer: Option<&str>) -> BusEvent {
        let mut envelope = Envelope::new(
            1,
            trade_id,
            EnvelopeBody::Rfq(RfqBody {
                pair: "BTC-USDT".into(),
                direction: Direction::BtcForToken,
                app_hash: "deadbeef".into(),
                btc_sats: 1000,
                usdt_amount: "670000".into(),
                max_platform_fee_bps: 500,
                max_trade_fee_bps: 1000,
                max_total_fee_bps: 1500,
                min_sol_refund_window_sec: 3600,
                max_sol_refund_window_sec: 604800,
                valid_until_unix: 2_000_000_000,
            }),
            1000,
            format!("nonce-{seq}"),
        );
        envelope.signer = signer.map(|s| s.to_string());
        BusEvent {
            seq,
            ts: 1000,
            channel: "rfq:btc-usdt".into(),
            kind: "rfq".into(),
            trade_id: trade_id.into(),
            message: envelope,
        }
    }

    fn terms_event(seq: u64, trade_id: &str) -> BusEvent {
        let envelope = Envelope::new(
            1,
            trade_id,
            EnvelopeBody::Terms(TermsBody {
                btc_sats: 1000,
                usdt_amount: "670000".into(),
                sol_mint: "mint".into(),
                sol_recipient: "recipient".into(),
                sol_refund: "refund".into(),
                sol_refund_after_unix: 2_000_000_000,
                ln_receiver_peer: "maker-peer".into(),
                ln_payer_peer: "taker-peer".into(),
                trade_fee_collector: "collector".into(),
                platform_fee_bps: 10,
                trade_fee_bps: 10,
                terms_valid_until_unix: 2_000_000_000,
            }),
            1500,
            format!("nonce-terms-{seq}"),
        );
        BusEvent {
            seq,
            ts: 1500,
            channel: format!("swap:{trade_id}"),
            kind: "terms".into(),
            trade_id: trade_id.into(),
            message: envelope,
        }
    }

    #[test]
    fn local_rfq_marks_my_rfq_trade_ids() {
        let events = vec![rfq_event(1, "trade-1", Some("local-peer"))];
        let ctx = build_tick_context(&events, "local-peer");
        assert!(ctx.my_rfq_trade_ids.contains("trade-1"));
        assert!(ctx.negotiations["trade-1"].rfq.is_some());
    }

    #[test]
    fn non_local_rfq_is_not_mine() {
        let events = vec![rfq_event(1, "trade-1", Some("other-peer"))];
        let ctx = build_tick_context(&events, "local-peer");
        assert!(!ctx.my_rfq_trade_ids.contains("trade-1"));
        assert!(ctx.negotiations["trade-1"].rfq.is_some());
    }

    #[test]
    fn terms_builds_trade_context_on_swap_channel() {
        let events = vec![terms_event(1, "trade-1")];
        let ctx = build_tick_context(&events, "local-peer");
        let trade = &ctx.trades["trade-1"];
        assert!(trade.terms.is_some());
        assert!(!trade.is_terminal());
        assert_eq!(trade.last_ts, 1500);
    }

    #[test]
    fn first_seen_wins_on_duplicate_terms() {
        let mut first = terms_event(1, "trade-1");
        if let EnvelopeBody::Terms(ref mut body) = first.message.body {
            body.platform_fee_bps = 1;
        }
        let mut second = terms_event(2, "trade-1");
        second.ts = 2000;
        if let EnvelopeBody::Terms(ref mut body) = second.message.body {
            body.platform_fee_bps = 99;
        }

        let ctx = build_tick_context(&[first, second], "local-peer");
        let terms = ctx.trades["trade-1"].terms.as_ref().unwrap();
        match &terms.message.body {
            EnvelopeBody::Terms(body) => assert_eq!(body.platform_fee_bps, 1),
            _ => panic!("wrong body"),
        }
        // last_ts still advances to the later event's timestamp.
        assert_eq!(ctx.trades["trade-1"].last_ts, 2000);
    }

    #[test]
    fn local_quote_indexed_by_envelope_id() {
        let envelope = Envelope::new(
            1,
            "trade-1",
            EnvelopeBody::Quote(QuoteBody {
                rfq_id: "rfq-hash".into(),
                pair: "BTC-USDT".into(),
                direction: Direction::BtcForToken,
                app_hash: "deadbeef".into(),
                btc_sats: 1000,
                usdt_amount: "670000".into(),
                platform_fee_bps: 10,
                trade_fee_bps: 10,
                trade_fee_collector: "collector".into(),
                offer_id: None,
                offer_line_index: None,
                sol_refund_window_sec: 259200,
                valid_until_unix: 2_000_000_000,
            }),
            1000,
            "nonce-quote-1",
        );
        let mut signed = envelope;
        signed.signer = Some("local-peer".into());
        let event = BusEvent {
            seq: 1,
            ts: 1000,
            channel: "rfq:btc-usdt".into(),
            kind: "quote".into(),
            trade_id: "trade-1".into(),
            message: signed,
        };

        let ctx = build_tick_context(&[event], "local-peer");
        assert_eq!(ctx.my_quote_by_id.len(), 1);
        assert!(ctx.quote_events.is_empty());
    }
}
