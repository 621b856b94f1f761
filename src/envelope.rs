//! The signed-envelope negotiation protocol's wire types.
//!
//! An envelope is the unit of negotiation/settlement: every message that
//! crosses the sidechannel bus is one of these. See spec §3 for the field
//! list and §4.1 for the canonicalization/hashing rules that make
//! `trade_id`-free references (`rfq_id`, `quote_id`, `terms_hash`) work.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// The enumerated envelope kinds, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Rfq,
    Quote,
    QuoteAccept,
    SvcAnnounce,
    SwapInvite,
    Terms,
    Accept,
    LnInvoice,
    SolEscrowCreated,
    LnPaid,
    SolClaimed,
    SolRefunded,
    Cancel,
}

impl EnvelopeKind {
    /// The wire string for this kind, as used in the `kind` field.
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::Rfq => "rfq",
            EnvelopeKind::Quote => "quote",
            EnvelopeKind::QuoteAccept => "quote_accept",
            EnvelopeKind::SvcAnnounce => "svc_announce",
            EnvelopeKind::SwapInvite => "swap_invite",
            EnvelopeKind::Terms => "terms",
            EnvelopeKind::Accept => "accept",
            EnvelopeKind::LnInvoice => "ln_invoice",
            EnvelopeKind::SolEscrowCreated => "sol_escrow_created",
            EnvelopeKind::LnPaid => "ln_paid",
            EnvelopeKind::SolClaimed => "sol_claimed",
            EnvelopeKind::SolRefunded => "sol_refunded",
            EnvelopeKind::Cancel => "cancel",
        }
    }
}

/// Trade direction from the RFQ issuer's (the taker's) perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Taker pays Lightning BTC, wants the SPL token.
    BtcForToken,
    /// Taker pays the SPL token, wants Lightning BTC.
    TokenForBtc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RfqBody {
    pub pair: String,
    pub direction: Direction,
    pub app_hash: String,
    pub btc_sats: u64,
    /// Base-10 digit-only decimal string (spec §4.3).
    pub usdt_amount: String,
    pub max_platform_fee_bps: u32,
    pub max_trade_fee_bps: u32,
    pub max_total_fee_bps: u32,
    pub min_sol_refund_window_sec: u64,
    pub max_sol_refund_window_sec: u64,
    pub valid_until_unix: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteBody {
    pub rfq_id: String,
    pub pair: String,
    pub direction: Direction,
    pub app_hash: String,
    pub btc_sats: u64,
    pub usdt_amount: String,
    pub platform_fee_bps: u32,
    pub trade_fee_bps: u32,
    pub trade_fee_collector: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub offer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub offer_line_index: Option<u32>,
    pub sol_refund_window_sec: u64,
    pub valid_until_unix: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteAcceptBody {
    pub rfq_id: String,
    pub quote_id: String,
    /// The accepting taker's on-chain signer, carried here because it is
    /// the only taker-authored envelope preceding `terms_post`: the maker
    /// needs it to address `terms.sol_recipient` at the counterparty who
    /// will actually claim the escrow.
    pub taker_chain_signer: String,
}

/// One price point inside a `svc_announce` offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferLine {
    pub btc_sats: u64,
    pub usdt_amount: String,
    pub max_platform_fee_bps: u32,
    pub max_trade_fee_bps: u32,
    pub max_total_fee_bps: u32,
    pub min_sol_refund_window_sec: u64,
    pub max_sol_refund_window_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvcAnnounceBody {
    pub name: String,
    pub pairs: Vec<String>,
    pub rfq_channels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub note: Option<String>,
    pub offers: Vec<OfferLine>,
    pub valid_until_unix: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapInviteBody {
    pub rfq_id: String,
    pub quote_id: String,
    /// Addressed `"swap:<id>"`.
    pub swap_channel: String,
    pub owner_pubkey: String,
    /// Opaque bus-layer invite blob.
    pub invite_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TermsBody {
    pub btc_sats: u64,
    pub usdt_amount: String,
    pub sol_mint: String,
    pub sol_recipient: String,
    pub sol_refund: String,
    pub sol_refund_after_unix: i64,
    pub ln_receiver_peer: String,
    pub ln_payer_peer: String,
    pub trade_fee_collector: String,
    pub platform_fee_bps: u32,
    pub trade_fee_bps: u32,
    pub terms_valid_until_unix: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptBody {
    pub terms_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LnInvoiceBody {
    pub bolt11: String,
    pub payment_hash_hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolEscrowCreatedBody {
    pub escrow_pda: String,
    pub vault_ata: String,
    pub payment_hash_hex: String,
    pub net_amount: u64,
    pub fee_amount: u64,
    pub refund_after_unix: i64,
    pub tx_sig: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LnPaidBody {
    pub payment_hash_hex: String,
    pub preimage_hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolClaimedBody {
    pub payment_hash_hex: String,
    pub tx_sig: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolRefundedBody {
    pub payment_hash_hex: String,
    pub tx_sig: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelBody {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

/// The kind-specific `body` mapping. Serializes as a plain object (no
/// internal tag — the sibling `kind` field on [`Envelope`] carries that);
/// `Envelope`'s custom `Deserialize` picks the right variant by reading
/// `kind` first.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EnvelopeBody {
    Rfq(RfqBody),
    Quote(QuoteBody),
    QuoteAccept(QuoteAcceptBody),
    SvcAnnounce(SvcAnnounceBody),
    SwapInvite(SwapInviteBody),
    Terms(TermsBody),
    Accept(AcceptBody),
    LnInvoice(LnInvoiceBody),
    SolEscrowCreated(SolEscrowCreatedBody),
    LnPaid(LnPaidBody),
    SolClaimed(SolClaimedBody),
    SolRefunded(SolRefundedBody),
    Cancel(CancelBody),
}

impl EnvelopeBody {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            EnvelopeBody::Rfq(_) => EnvelopeKind::Rfq,
            EnvelopeBody::Quote(_) => EnvelopeKind::Quote,
            EnvelopeBody::QuoteAccept(_) => EnvelopeKind::QuoteAccept,
            EnvelopeBody::SvcAnnounce(_) => EnvelopeKind::SvcAnnounce,
            EnvelopeBody::SwapInvite(_) => EnvelopeKind::SwapInvite,
            EnvelopeBody::Terms(_) => EnvelopeKind::Terms,
            EnvelopeBody::Accept(_) => EnvelopeKind::Accept,
            EnvelopeBody::LnInvoice(_) => EnvelopeKind::LnInvoice,
            EnvelopeBody::SolEscrowCreated(_) => EnvelopeKind::SolEscrowCreated,
            EnvelopeBody::LnPaid(_) => EnvelopeKind::LnPaid,
            EnvelopeBody::SolClaimed(_) => EnvelopeKind::SolClaimed,
            EnvelopeBody::SolRefunded(_) => EnvelopeKind::SolRefunded,
            EnvelopeBody::Cancel(_) => EnvelopeKind::Cancel,
        }
    }

    fn from_kind_and_value(kind: EnvelopeKind, value: Value) -> Result<Self> {
        let map_err = |e: serde_json::Error| {
            Error::Parse(format!("invalid body for kind {}: {e}", kind.as_str()))
        };
        Ok(match kind {
            EnvelopeKind::Rfq => EnvelopeBody::Rfq(serde_json::from_value(value).map_err(map_err)?),
            EnvelopeKind::Quote => {
                EnvelopeBody::Quote(serde_json::from_value(value).map_err(map_err)?)
            }
            EnvelopeKind::QuoteAccept => {
                EnvelopeBody::QuoteAccept(serde_json::from_value(value).map_err(map_err)?)
            }
            EnvelopeKind::SvcAnnounce => {
                EnvelopeBody::SvcAnnounce(serde_json::from_value(value).map_err(map_err)?)
            }
            EnvelopeKind::SwapInvite => {
                EnvelopeBody::SwapInvite(serde_json::from_value(value).map_err(map_err)?)
            }
            EnvelopeKind::Terms => {
                EnvelopeBody::Terms(serde_json::from_value(value).map_err(map_err)?)
            }
            EnvelopeKind::Accept => {
                EnvelopeBody::Accept(serde_json::from_value(value).map_err(map_err)?)
            }
            EnvelopeKind::LnInvoice => {
                EnvelopeBody::LnInvoice(serde_json::from_value(value).map_err(map_err)?)
            }
            EnvelopeKind::SolEscrowCreated => {
                EnvelopeBody::SolEscrowCreated(serde_json::from_value(value).map_err(map_err)?)
            }
            EnvelopeKind::LnPaid => {
                EnvelopeBody::LnPaid(serde_json::from_value(value).map_err(map_err)?)
            }
            EnvelopeKind::SolClaimed => {
                EnvelopeBody::SolClaimed(serde_json::from_value(value).map_err(map_err)?)
            }
            EnvelopeKind::SolRefunded => {
                EnvelopeBody::SolRefunded(serde_json::from_value(value).map_err(map_err)?)
            }
            EnvelopeKind::Cancel => {
                EnvelopeBody::Cancel(serde_json::from_value(value).map_err(map_err)?)
            }
        })
    }
}

/// A protocol envelope, signed or unsigned.
///
/// `signer`/`sig` are omitted from the wire form entirely when absent
/// (not serialized as `null`) — this is what makes "canonical bytes of
/// the unsigned envelope" well defined for both a freshly-built envelope
/// and the unsigned projection of a signed one (spec §4.1).
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub v: u32,
    pub kind: EnvelopeKind,
    pub trade_id: String,
    pub body: EnvelopeBody,
    pub ts: i64,
    pub nonce: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sig: Option<String>,
}

impl Envelope {
    /// Build a fresh, unsigned envelope.
    pub fn new(v: u32, trade_id: impl Into<String>, body: EnvelopeBody, ts: i64, nonce: impl Into<String>) -> Self {
        Self {
            v,
            kind: body.kind(),
            trade_id: trade_id.into(),
            body,
            ts,
            nonce: nonce.into(),
            signer: None,
            sig: None,
        }
    }

    /// Is this envelope signed (has both `signer` and `sig` populated)?
    pub fn is_signed(&self) -> bool {
        self.signer.is_some() && self.sig.is_some()
    }

    /// The unsigned projection: a clone with `signer`/`sig` cleared. This is
    /// what gets canonicalized for hashing and for the signature digest.
    pub fn unsigned_projection(&self) -> Envelope {
        Envelope {
            signer: None,
            sig: None,
            ..self.clone()
        }
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            v: u32,
            kind: EnvelopeKind,
            trade_id: String,
            body: Value,
            ts: i64,
            nonce: String,
            #[serde(default)]
            signer: Option<String>,
            #[serde(default)]
            sig: Option<String>,
        }

        let raw = Raw::deserialize(deserializer)?;
        let body = EnvelopeBody::from_kind_and_value(raw.kind, raw.body)
            .map_err(serde::de::Error::custom)?;

        Ok(Envelope {
            v: raw.v,
            kind: raw.kind,
            trade_id: raw.trade_id,
            body,
            ts: raw.ts,
            nonce: raw.nonce,
            signer: raw.signer,
            sig: raw.sig,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rfq() -> Envelope {
        Envelope::new(
            1,
            "trade-1",
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
            1_700_000_000_000,
            "nonce-1",
        )
    }

    #[test]
    fn round_trips_through_json() {
        let env = sample_rfq();
        let json = serde_json::to_string(&env).unwrap();
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, EnvelopeKind::Rfq);
        assert_eq!(parsed.trade_id, "trade-1");
        match parsed.body {
            EnvelopeBody::Rfq(r) => assert_eq!(r.btc_sats, 1000),
            _ => panic!("wrong body variant"),
        }
    }

    #[test]
    fn signer_and_sig_absent_when_none() {
        let env = sample_rfq();
        let json = serde_json::to_string(&env).unwrap();
        assert!(!json.contains("\"signer\""));
        assert!(!json.contains("\"sig\""));
    }
}
