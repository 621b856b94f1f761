//! Swap schema validator (spec §4.3).
//!
//! Pure, side-effect-free checks: presence/type is already enforced by
//! `Envelope`'s `Deserialize` (a structurally malformed envelope never
//! reaches here), so this module checks numeric ranges and cross-field
//! consistency. `validate` only sees a single envelope and so can only
//! check what that envelope alone claims; `cross_validate_quote` checks
//! a `quote` against the `rfq` it references, for callers that hold both
//! (the settlement driver's quote-matching pipeline, and tests).

use crate::envelope::{Envelope, EnvelopeBody, QuoteBody, RfqBody};

const MIN_REFUND_WINDOW_SEC: u64 = 3600;
const MAX_REFUND_WINDOW_SEC: u64 = 604_800;
const MAX_PLATFORM_FEE_BPS: u32 = 500;
const MAX_TRADE_FEE_BPS: u32 = 1000;
const MAX_TOTAL_FEE_BPS: u32 = 1500;

/// Outcome of schema validation: either `Ok` or a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Ok,
    Invalid { reason: String },
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, ValidationResult::Ok)
    }

    fn invalid(reason: impl Into<String>) -> Self {
        ValidationResult::Invalid {
            reason: reason.into(),
        }
    }
}

/// Validate a single envelope's self-contained invariants.
pub fn validate(envelope: &Envelope) -> ValidationResult {
    match &envelope.body {
        EnvelopeBody::Rfq(body) => validate_rfq(body),
        EnvelopeBody::Quote(body) => validate_quote(body),
        EnvelopeBody::QuoteAccept(body) => {
            if body.rfq_id.is_empty() || body.quote_id.is_empty() {
                return ValidationResult::invalid("rfq_id and quote_id must be non-empty");
            }
            ValidationResult::Ok
        }
        EnvelopeBody::SvcAnnounce(body) => {
            if body.offers.is_empty() {
                return ValidationResult::invalid("svc_announce must carry at least one offer");
            }
            for (i, offer) in body.offers.iter().enumerate() {
                if let ValidationResult::Invalid { reason } = validate_offer_line(offer) {
                    return ValidationResult::invalid(format!("offers[{i}]: {reason}"));
                }
            }
            ValidationResult::Ok
        }
        EnvelopeBody::SwapInvite(body) => {
            if body.swap_channel.starts_with("swap:") {
                ValidationResult::Ok
            } else {
                ValidationResult::invalid("swap_channel must start with 'swap:'")
            }
        }
        EnvelopeBody::Terms(body) => validate_terms(body),
        EnvelopeBody::Accept(body) => {
            if body.terms_hash.is_empty() {
                ValidationResult::invalid("terms_hash must be non-empty")
            } else {
                ValidationResult::Ok
            }
        }
        EnvelopeBody::LnInvoice(body) => {
            if body.bolt11.is_empty() || body.payment_hash_hex.is_empty() {
                ValidationResult::invalid("bolt11 and payment_hash_hex must be non-empty")
            } else {
                ValidationResult::Ok
            }
        }
        EnvelopeBody::SolEscrowCreated(_)
        | EnvelopeBody::LnPaid(_)
        | EnvelopeBody::SolClaimed(_)
        | EnvelopeBody::SolRefunded(_)
        | EnvelopeBody::Cancel(_) => ValidationResult::Ok,
    }
}

fn validate_decimal_string(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn validate_fee_ceilings(
    max_platform: u32,
    max_trade: u32,
    max_total: u32,
) -> ValidationResult {
    if max_platform > MAX_PLATFORM_FEE_BPS {
        return ValidationResult::invalid(format!(
            "max_platform_fee_bps {max_platform} exceeds ceiling {MAX_PLATFORM_FEE_BPS}"
        ));
    }
    if max_trade > MAX_TRADE_FEE_BPS {
        return ValidationResult::invalid(format!(
            "max_trade_fee_bps {max_trade} exceeds ceiling {MAX_TRADE_FEE_BPS}"
        ));
    }
    if max_total > MAX_TOTAL_FEE_BPS {
        return ValidationResult::invalid(format!(
            "max_total_fee_bps {max_total} exceeds ceiling {MAX_TOTAL_FEE_BPS}"
        ));
    }
    if max_platform + max_trade > max_total {
        return ValidationResult::invalid(
            "max_platform_fee_bps + max_trade_fee_bps exceeds max_total_fee_bps",
        );
    }
    ValidationResult::Ok
}

fn validate_refund_window(min_sec: u64, max_sec: u64) -> ValidationResult {
    if min_sec < MIN_REFUND_WINDOW_SEC || min_sec > MAX_REFUND_WINDOW_SEC {
        return ValidationResult::invalid(format!(
            "min_sol_refund_window_sec {min_sec} outside [{MIN_REFUND_WINDOW_SEC}, {MAX_REFUND_WINDOW_SEC}]"
        ));
    }
    if max_sec < MIN_REFUND_WINDOW_SEC || max_sec > MAX_REFUND_WINDOW_SEC {
        return ValidationResult::invalid(format!(
            "max_sol_refund_window_sec {max_sec} outside [{MIN_REFUND_WINDOW_SEC}, {MAX_REFUND_WINDOW_SEC}]"
        ));
    }
    if min_sec > max_sec {
        return ValidationResult::invalid("min_sol_refund_window_sec exceeds max");
    }
    ValidationResult::Ok
}

fn validate_rfq(body: &RfqBody) -> ValidationResult {
    if body.btc_sats < 1 {
        return ValidationResult::invalid("btc_sats must be >= 1");
    }
    if !validate_decimal_string(&body.usdt_amount) {
        return ValidationResult::invalid("usdt_amount must be a base-10 digit-only string");
    }
    let fees = validate_fee_ceilings(
        body.max_platform_fee_bps,
        body.max_trade_fee_bps,
        body.max_total_fee_bps,
    );
    if !fees.is_ok() {
        return fees;
    }
    validate_refund_window(body.min_sol_refund_window_sec, body.max_sol_refund_window_sec)
}

fn validate_offer_line(offer: &crate::envelope::OfferLine) -> ValidationResult {
    if offer.btc_sats < 1 {
        return ValidationResult::invalid("btc_sats must be >= 1");
    }
    if !validate_decimal_string(&offer.usdt_amount) {
        return ValidationResult::invalid("usdt_amount must be a base-10 digit-only string");
    }
    let fees = validate_fee_ceilings(
        offer.max_platform_fee_bps,
        offer.max_trade_fee_bps,
        offer.max_total_fee_bps,
    );
    if !fees.is_ok() {
        return fees;
    }
    validate_refund_window(offer.min_sol_refund_window_sec, offer.max_sol_refund_window_sec)
}

fn validate_quote(body: &QuoteBody) -> ValidationResult {
    if body.rfq_id.is_empty() {
        return ValidationResult::invalid("rfq_id must be non-empty");
    }
    if body.btc_sats < 1 {
        return ValidationResult::invalid("btc_sats must be >= 1");
    }
    if !validate_decimal_string(&body.usdt_amount) {
        return ValidationResult::invalid("usdt_amount must be a base-10 digit-only string");
    }
    if body.platform_fee_bps > MAX_PLATFORM_FEE_BPS {
        return ValidationResult::invalid("platform_fee_bps exceeds ceiling");
    }
    if body.trade_fee_bps > MAX_TRADE_FEE_BPS {
        return ValidationResult::invalid("trade_fee_bps exceeds ceiling");
    }
    if body.platform_fee_bps + body.trade_fee_bps > MAX_TOTAL_FEE_BPS {
        return ValidationResult::invalid("platform_fee_bps + trade_fee_bps exceeds total ceiling");
    }
    if body.sol_refund_window_sec < MIN_REFUND_WINDOW_SEC
        || body.sol_refund_window_sec > MAX_REFUND_WINDOW_SEC
    {
        return ValidationResult::invalid("sol_refund_window_sec outside allowed range");
    }
    ValidationResult::Ok
}

fn validate_terms(body: &crate::envelope::TermsBody) -> ValidationResult {
    if body.btc_sats < 1 {
        return ValidationResult::invalid("btc_sats must be >= 1");
    }
    if !validate_decimal_string(&body.usdt_amount) {
        return ValidationResult::invalid("usdt_amount must be a base-10 digit-only string");
    }
    if body.platform_fee_bps + body.trade_fee_bps > MAX_TOTAL_FEE_BPS {
        return ValidationResult::invalid("platform_fee_bps + trade_fee_bps exceeds total ceiling");
    }
    ValidationResult::Ok
}

/// Cross-check a `quote` against the `rfq` it claims to reference
/// (spec §4.3: `quote.btc_sats == rfq.btc_sats`, etc.), plus the fee-
/// ceiling and refund-window-overlap invariants (I8, I9).
///
/// This does NOT check `rfq_id == envelope_id(rfq)` — callers are
/// expected to have already resolved that reference (e.g. via the
/// receipts store or the event context) before calling this.
pub fn cross_validate_quote(quote: &QuoteBody, rfq: &RfqBody) -> ValidationResult {
    if quote.btc_sats != rfq.btc_sats {
        return ValidationResult::invalid("quote.btc_sats != rfq.btc_sats");
    }
    if quote.usdt_amount != rfq.usdt_amount {
        return ValidationResult::invalid("quote.usdt_amount != rfq.usdt_amount");
    }
    if quote.pair != rfq.pair {
        return ValidationResult::invalid("quote.pair != rfq.pair");
    }
    if quote.platform_fee_bps > rfq.max_platform_fee_bps {
        return ValidationResult::invalid("quote.platform_fee_bps exceeds rfq ceiling");
    }
    if quote.trade_fee_bps > rfq.max_trade_fee_bps {
        return ValidationResult::invalid("quote.trade_fee_bps exceeds rfq ceiling");
    }
    if quote.platform_fee_bps + quote.trade_fee_bps > rfq.max_total_fee_bps {
        return ValidationResult::invalid("quote total fee exceeds rfq max_total_fee_bps");
    }
    if quote.sol_refund_window_sec < rfq.min_sol_refund_window_sec
        || quote.sol_refund_window_sec > rfq.max_sol_refund_window_sec
    {
        return ValidationResult::invalid("quote.sol_refund_window_sec outside rfq's range");
    }
    ValidationResult::Ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Direction, Envelope, EnvelopeBody};

    fn rfq_body() -> RfqBody {
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
            max_sol_refund_window_sec: 604800,
            valid_until_unix: 2_000_000_000,
        }
    }

    #[test]
    fn valid_rfq_passes() {
        let env = Envelope::new(1, "t1", EnvelopeBody::Rfq(rfq_body()), 0, "n1");
        assert!(validate(&env).is_ok());
    }

    #[test]
    fn rfq_with_non_digit_amount_fails() {
        let mut body = rfq_body();
        body.usdt_amount = "6.70000".into();
        let env = Envelope::new(1, "t1", EnvelopeBody::Rfq(body), 0, "n1");
        assert!(!validate(&env).is_ok());
    }

    #[test]
    fn rfq_with_zero_sats_fails() {
        let mut body = rfq_body();
        body.btc_sats = 0;
        let env = Envelope::new(1, "t1", EnvelopeBody::Rfq(body), 0, "n1");
        assert!(!validate(&env).is_ok());
    }

    #[test]
    fn rfq_with_total_fee_over_ceiling_fails() {
        let mut body = rfq_body();
        body.max_total_fee_bps = 1600;
        let env = Envelope::new(1, "t1", EnvelopeBody::Rfq(body), 0, "n1");
        assert!(!validate(&env).is_ok());
    }

    #[test]
    fn rfq_with_refund_window_too_short_fails() {
        let mut body = rfq_body();
        body.min_sol_refund_window_sec = 10;
        let env = Envelope::new(1, "t1", EnvelopeBody::Rfq(body), 0, "n1");
        assert!(!validate(&env).is_ok());
    }

    #[test]
    fn cross_validate_matches_s1_scenario() {
        let rfq = rfq_body();
        let quote = QuoteBody {
            rfq_id: "ignored-here".into(),
            pair: rfq.pair.clone(),
            direction: Direction::BtcForToken,
            app_hash: rfq.app_hash.clone(),
            btc_sats: 1000,
            usdt_amount: "670000".into(),
            platform_fee_bps: 10,
            trade_fee_bps: 10,
            trade_fee_collector: "collector".into(),
            offer_id: None,
            offer_line_index: None,
            sol_refund_window_sec: 259_200,
            valid_until_unix: 2_000_000_000,
        };
        assert!(cross_validate_quote(&quote, &rfq).is_ok());
    }

    #[test]
    fn cross_validate_rejects_fee_over_rfq_ceiling() {
        let rfq = rfq_body();
        let mut quote = QuoteBody {
            rfq_id: "x".into(),
            pair: rfq.pair.clone(),
            direction: Direction::BtcForToken,
            app_hash: rfq.app_hash.clone(),
            btc_sats: 1000,
            usdt_amount: "670000".into(),
            platform_fee_bps: 600,
            trade_fee_bps: 10,
            trade_fee_collector: "collector".into(),
            offer_id: None,
            offer_line_index: None,
            sol_refund_window_sec: 259_200,
            valid_until_unix: 2_000_000_000,
        };
        assert!(!cross_validate_quote(&quote, &rfq).is_ok());
        quote.platform_fee_bps = 10;
        quote.sol_refund_window_sec = 3_700_000; // way outside rfq's range
        assert!(!cross_validate_quote(&quote, &rfq).is_ok());
    }
}
