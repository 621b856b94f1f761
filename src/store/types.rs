//! Record types, enums, and patch semantics for the receipts store.

use crate::error::{Error, Result};

/// Which side of the trade the local peer occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Maker,
    Taker,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Maker => "maker",
            Role::Taker => "taker",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "maker" => Ok(Role::Maker),
            "taker" => Ok(Role::Taker),
            other => Err(Error::Parse(format!("unknown role {other:?}"))),
        }
    }
}

/// Trade lifecycle state (spec §3 "Trade receipt").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeState {
    Init,
    Negotiating,
    Terms,
    Accepted,
    Invoice,
    Escrow,
    LnPaid,
    Claimed,
    Refunded,
    Canceled,
    Error,
}

impl TradeState {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeState::Init => "init",
            TradeState::Negotiating => "negotiating",
            TradeState::Terms => "terms",
            TradeState::Accepted => "accepted",
            TradeState::Invoice => "invoice",
            TradeState::Escrow => "escrow",
            TradeState::LnPaid => "ln_paid",
            TradeState::Claimed => "claimed",
            TradeState::Refunded => "refunded",
            TradeState::Canceled => "canceled",
            TradeState::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "init" => TradeState::Init,
            "negotiating" => TradeState::Negotiating,
            "terms" => TradeState::Terms,
            "accepted" => TradeState::Accepted,
            "invoice" => TradeState::Invoice,
            "escrow" => TradeState::Escrow,
            "ln_paid" => TradeState::LnPaid,
            "claimed" => TradeState::Claimed,
            "refunded" => TradeState::Refunded,
            "canceled" => TradeState::Canceled,
            "error" => TradeState::Error,
            other => return Err(Error::Parse(format!("unknown trade state {other:?}"))),
        })
    }

    /// A trade in one of these states is terminal: no further driver action.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TradeState::Claimed | TradeState::Refunded | TradeState::Canceled
        )
    }
}

/// A merge-patch value: distinguishes "not provided" (keep existing or
/// default on insert) from an explicit clear, matching spec §4.4's
/// "undefined fields never clear; explicit null clears".
#[derive(Debug, Clone, Default)]
pub enum Patch<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T: Clone> Patch<T> {
    /// Apply this patch on top of an existing optional value.
    pub fn merge(&self, existing: Option<T>) -> Option<T> {
        match self {
            Patch::Keep => existing,
            Patch::Set(v) => Some(v.clone()),
            Patch::Clear => None,
        }
    }
}

/// A durable per-trade receipt (spec §3 "Trade receipt").
#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub trade_id: String,
    pub role: Role,
    pub rfq_channel: Option<String>,
    pub swap_channel: Option<String>,
    pub counterparty_pubkey: Option<String>,
    pub btc_sats: Option<i64>,
    pub usdt_amount: Option<String>,
    pub platform_fee_bps: Option<i64>,
    pub trade_fee_bps: Option<i64>,
    pub sol_refund_window_sec: Option<i64>,
    pub sol_escrow_pda: Option<String>,
    pub sol_vault_ata: Option<String>,
    pub sol_refund_after_unix: Option<i64>,
    pub ln_invoice_bolt11: Option<String>,
    pub ln_payment_hash_hex: Option<String>,
    pub ln_preimage_hex: Option<String>,
    pub state: TradeState,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_error: Option<String>,
}

/// A merge-patch against a [`TradeRecord`]. `role` is required on first
/// insert (there is no sensible default) but may be left `None` on a
/// patch to an existing row.
#[derive(Debug, Clone, Default)]
pub struct TradePatch {
    pub role: Option<Role>,
    pub rfq_channel: Patch<String>,
    pub swap_channel: Patch<String>,
    pub counterparty_pubkey: Patch<String>,
    pub btc_sats: Patch<i64>,
    pub usdt_amount: Patch<String>,
    pub platform_fee_bps: Patch<i64>,
    pub trade_fee_bps: Patch<i64>,
    pub sol_refund_window_sec: Patch<i64>,
    pub sol_escrow_pda: Patch<String>,
    pub sol_vault_ata: Patch<String>,
    pub sol_refund_after_unix: Patch<i64>,
    pub ln_invoice_bolt11: Patch<String>,
    pub ln_payment_hash_hex: Patch<String>,
    pub ln_preimage_hex: Patch<String>,
    pub state: Option<TradeState>,
    pub last_error: Patch<String>,
}

/// Lock state for an offer line or RFQ being used to start a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingLockState {
    InFlight,
    Filled,
}

impl ListingLockState {
    pub fn as_str(self) -> &'static str {
        match self {
            ListingLockState::InFlight => "in_flight",
            ListingLockState::Filled => "filled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "in_flight" => Ok(ListingLockState::InFlight),
            "filled" => Ok(ListingLockState::Filled),
            other => Err(Error::Parse(format!("unknown listing lock state {other:?}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListingLock {
    pub listing_key: String,
    pub listing_type: String,
    pub listing_id: String,
    pub trade_id: Option<String>,
    pub state: ListingLockState,
    pub note: Option<String>,
    pub meta_json: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ListingLockPatch {
    pub listing_type: Patch<String>,
    pub listing_id: Patch<String>,
    pub trade_id: Patch<String>,
    pub state: Option<ListingLockState>,
    pub note: Patch<String>,
    pub meta_json: Patch<String>,
}

/// One row of the append-only per-trade events log.
#[derive(Debug, Clone)]
pub struct TradeEvent {
    pub id: i64,
    pub trade_id: String,
    pub ts: i64,
    pub kind: String,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    pub fn new(limit: i64, offset: i64) -> Self {
        Self { limit, offset }
    }
}
