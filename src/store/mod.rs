//! Local durable trade receipts store (spec §4.4).
//!
//! One SQLite file per peer, opened in WAL mode with `synchronous=NORMAL`,
//! accessed through a single `rusqlite::Connection` behind a
//! `tokio::sync::Mutex` — this models spec's "single-writer" requirement
//! without pulling in an async SQL driver the pack never reaches for
//! (see `engine/src/quoter/database/mod.rs` in the pack for the
//! synchronous-`Connection`-in-a-struct shape this follows). Every public
//! method hands its SQL off to `spawn_blocking` since rusqlite blocks the
//! calling thread.

mod migrations;
pub mod types;

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
pub use types::{
    ListingLock, ListingLockPatch, ListingLockState, Page, Patch, Role, TradeEvent, TradePatch,
    TradeRecord, TradeState,
};

/// A durable per-peer trade receipts store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if absent) the database file at `path`, running any
    /// pending migrations.
    pub async fn open(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let mut conn = Connection::open(&path)?;
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
            migrations::migrate(&mut conn)?;
            Ok(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests: same schema, no file on disk.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection> {
            let mut conn = Connection::open_in_memory()?;
            migrations::migrate(&mut conn)?;
            Ok(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.blocking_lock();
            f(&guard)
        })
        .await?
    }

    /// Merge `patch` into the existing row for `trade_id` (or a fresh row
    /// if none exists, in which case `patch.role`/`patch.state` must be
    /// set), returning the resulting row. `created_at` is preserved across
    /// updates; `updated_at` is always refreshed to `now_ms`.
    pub async fn upsert_trade(
        &self,
        trade_id: &str,
        patch: TradePatch,
        now_ms: i64,
    ) -> Result<TradeRecord> {
        let trade_id = trade_id.to_string();
        self.with_conn(move |conn| {
            let existing = get_trade_row(conn, &trade_id)?;

            let role = patch
                .role
                .or(existing.as_ref().map(|t| t.role))
                .ok_or_else(|| Error::Validation("role required on first insert".into()))?;
            let state = patch
                .state
                .or(existing.as_ref().map(|t| t.state))
                .unwrap_or(TradeState::Init);
            let created_at = existing.as_ref().map(|t| t.created_at).unwrap_or(now_ms);

            let merged = TradeRecord {
                trade_id: trade_id.clone(),
                role,
                rfq_channel: patch
                    .rfq_channel
                    .merge(existing.as_ref().and_then(|t| t.rfq_channel.clone())),
                swap_channel: patch
                    .swap_channel
                    .merge(existing.as_ref().and_then(|t| t.swap_channel.clone())),
                counterparty_pubkey: patch.counterparty_pubkey.merge(
                    existing.as_ref().and_then(|t| t.counterparty_pubkey.clone()),
                ),
                btc_sats: patch
                    .btc_sats
                    .merge(existing.as_ref().and_then(|t| t.btc_sats)),
                usdt_amount: patch
                    .usdt_amount
                    .merge(existing.as_ref().and_then(|t| t.usdt_amount.clone())),
                platform_fee_bps: patch
                    .platform_fee_bps
                    .merge(existing.as_ref().and_then(|t| t.platform_fee_bps)),
                trade_fee_bps: patch
                    .trade_fee_bps
                    .merge(existing.as_ref().and_then(|t| t.trade_fee_bps)),
                sol_refund_window_sec: patch
                    .sol_refund_window_sec
                    .merge(existing.as_ref().and_then(|t| t.sol_refund_window_sec)),
                sol_escrow_pda: patch
                    .sol_escrow_pda
                    .merge(existing.as_ref().and_then(|t| t.sol_escrow_pda.clone())),
                sol_vault_ata: patch
                    .sol_vault_ata
                    .merge(existing.as_ref().and_then(|t| t.sol_vault_ata.clone())),
                sol_refund_after_unix: patch
                    .sol_refund_after_unix
                    .merge(existing.as_ref().and_then(|t| t.sol_refund_after_unix)),
                ln_invoice_bolt11: patch
                    .ln_invoice_bolt11
                    .merge(existing.as_ref().and_then(|t| t.ln_invoice_bolt11.clone())),
                ln_payment_hash_hex: patch
                    .ln_payment_hash_hex
                    .merge(existing.as_ref().and_then(|t| t.ln_payment_hash_hex.clone())),
                ln_preimage_hex: patch
                    .ln_preimage_hex
                    .merge(existing.as_ref().and_then(|t| t.ln_preimage_hex.clone())),
                state,
                created_at,
                updated_at: now_ms,
                last_error: patch
                    .last_error
                    .merge(existing.as_ref().and_then(|t| t.last_error.clone())),
            };

            // Hex fields are normalized to lowercase on ingestion (spec §4.4).
            let mut merged = merged;
            merged.ln_payment_hash_hex = merged.ln_payment_hash_hex.map(|h| h.to_lowercase());

            conn.execute(
                "INSERT INTO trades (
                    trade_id, role, rfq_channel, swap_channel, counterparty_pubkey,
                    btc_sats, usdt_amount, platform_fee_bps, trade_fee_bps,
                    sol_refund_window_sec, sol_escrow_pda, sol_vault_ata,
                    sol_refund_after_unix, ln_invoice_bolt11, ln_payment_hash_hex,
                    ln_preimage_hex, state, created_at, updated_at, last_error
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)
                ON CONFLICT(trade_id) DO UPDATE SET
                    role = excluded.role,
                    rfq_channel = excluded.rfq_channel,
                    swap_channel = excluded.swap_channel,
                    counterparty_pubkey = excluded.counterparty_pubkey,
                    btc_sats = excluded.btc_sats,
                    usdt_amount = excluded.usdt_amount,
                    platform_fee_bps = excluded.platform_fee_bps,
                    trade_fee_bps = excluded.trade_fee_bps,
                    sol_refund_window_sec = excluded.sol_refund_window_sec,
                    sol_escrow_pda = excluded.sol_escrow_pda,
                    sol_vault_ata = excluded.sol_vault_ata,
                    sol_refund_after_unix = excluded.sol_refund_after_unix,
                    ln_invoice_bolt11 = excluded.ln_invoice_bolt11,
                    ln_payment_hash_hex = excluded.ln_payment_hash_hex,
                    ln_preimage_hex = excluded.ln_preimage_hex,
                    state = excluded.state,
                    updated_at = excluded.updated_at,
                    last_error = excluded.last_error",
                params![
                    merged.trade_id,
                    merged.role.as_str(),
                    merged.rfq_channel,
                    merged.swap_channel,
                    merged.counterparty_pubkey,
                    merged.btc_sats,
                    merged.usdt_amount,
                    merged.platform_fee_bps,
                    merged.trade_fee_bps,
                    merged.sol_refund_window_sec,
                    merged.sol_escrow_pda,
                    merged.sol_vault_ata,
                    merged.sol_refund_after_unix,
                    merged.ln_invoice_bolt11,
                    merged.ln_payment_hash_hex,
                    merged.ln_preimage_hex,
                    merged.state.as_str(),
                    merged.created_at,
                    merged.updated_at,
                    merged.last_error,
                ],
            )?;

            Ok(merged)
        })
        .await
    }

    pub async fn get_trade(&self, trade_id: &str) -> Result<Option<TradeRecord>> {
        let trade_id = trade_id.to_string();
        self.with_conn(move |conn| get_trade_row(conn, &trade_id))
            .await
    }

    pub async fn get_trade_by_payment_hash(&self, hex: &str) -> Result<Option<TradeRecord>> {
        let hex = hex.to_lowercase();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("{TRADE_SELECT} WHERE ln_payment_hash_hex = ?1"),
                params![hex],
                row_to_trade,
            )
            .optional()
            .map_err(Error::from)
        })
        .await
    }

    pub async fn list_trades_paged(&self, page: Page) -> Result<Vec<TradeRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{TRADE_SELECT} ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2"
            ))?;
            let rows = stmt
                .query_map(params![page.limit, page.offset], row_to_trade)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Trades in `ln_paid` with a non-null preimage (spec §4.4).
    pub async fn list_open_claims(&self, page: Page) -> Result<Vec<TradeRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{TRADE_SELECT} WHERE state = 'ln_paid' AND ln_preimage_hex IS NOT NULL
                 ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2"
            ))?;
            let rows = stmt
                .query_map(params![page.limit, page.offset], row_to_trade)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Trades in `escrow` whose refund window has elapsed (spec §4.4).
    pub async fn list_open_refunds(&self, now_unix: i64, page: Page) -> Result<Vec<TradeRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{TRADE_SELECT} WHERE state = 'escrow' AND sol_refund_after_unix <= ?1
                 ORDER BY updated_at DESC LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt
                .query_map(params![now_unix, page.limit, page.offset], row_to_trade)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn append_event(
        &self,
        trade_id: &str,
        kind: &str,
        payload: &str,
        ts: i64,
    ) -> Result<TradeEvent> {
        let trade_id = trade_id.to_string();
        let kind = kind.to_string();
        let payload = payload.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO events (trade_id, ts, kind, payload) VALUES (?1, ?2, ?3, ?4)",
                params![trade_id, ts, kind, payload],
            )?;
            let id = conn.last_insert_rowid();
            Ok(TradeEvent {
                id,
                trade_id,
                ts,
                kind,
                payload,
            })
        })
        .await
    }

    pub async fn upsert_listing_lock(
        &self,
        listing_key: &str,
        patch: ListingLockPatch,
        now_ms: i64,
    ) -> Result<ListingLock> {
        let listing_key = listing_key.to_string();
        self.with_conn(move |conn| {
            let existing = get_listing_lock_row(conn, &listing_key)?;

            let listing_type = patch
                .listing_type
                .merge(existing.as_ref().map(|l| l.listing_type.clone()))
                .ok_or_else(|| Error::Validation("listing_type required".into()))?;
            let listing_id = patch
                .listing_id
                .merge(existing.as_ref().map(|l| l.listing_id.clone()))
                .ok_or_else(|| Error::Validation("listing_id required".into()))?;
            let state = patch
                .state
                .or(existing.as_ref().map(|l| l.state))
                .unwrap_or(ListingLockState::InFlight);
            let created_at = existing.as_ref().map(|l| l.created_at).unwrap_or(now_ms);

            let merged = ListingLock {
                listing_key: listing_key.clone(),
                listing_type,
                listing_id,
                trade_id: patch
                    .trade_id
                    .merge(existing.as_ref().and_then(|l| l.trade_id.clone())),
                state,
                note: patch.note.merge(existing.as_ref().and_then(|l| l.note.clone())),
                meta_json: patch
                    .meta_json
                    .merge(existing.as_ref().and_then(|l| l.meta_json.clone())),
                created_at,
                updated_at: now_ms,
            };

            conn.execute(
                "INSERT INTO listing_locks (
                    listing_key, listing_type, listing_id, trade_id, state, note,
                    meta_json, created_at, updated_at
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
                ON CONFLICT(listing_key) DO UPDATE SET
                    listing_type = excluded.listing_type,
                    listing_id = excluded.listing_id,
                    trade_id = excluded.trade_id,
                    state = excluded.state,
                    note = excluded.note,
                    meta_json = excluded.meta_json,
                    updated_at = excluded.updated_at",
                params![
                    merged.listing_key,
                    merged.listing_type,
                    merged.listing_id,
                    merged.trade_id,
                    merged.state.as_str(),
                    merged.note,
                    merged.meta_json,
                    merged.created_at,
                    merged.updated_at,
                ],
            )?;

            Ok(merged)
        })
        .await
    }

    pub async fn get_listing_lock(&self, listing_key: &str) -> Result<Option<ListingLock>> {
        let listing_key = listing_key.to_string();
        self.with_conn(move |conn| get_listing_lock_row(conn, &listing_key))
            .await
    }

    pub async fn list_listing_locks_by_trade(&self, trade_id: &str) -> Result<Vec<ListingLock>> {
        let trade_id = trade_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{LISTING_LOCK_SELECT} WHERE trade_id = ?1 ORDER BY updated_at DESC"
            ))?;
            let rows = stmt
                .query_map(params![trade_id], row_to_listing_lock)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn delete_listing_lock(&self, listing_key: &str) -> Result<bool> {
        let listing_key = listing_key.to_string();
        self.with_conn(move |conn| {
            let affected = conn.execute(
                "DELETE FROM listing_locks WHERE listing_key = ?1",
                params![listing_key],
            )?;
            Ok(affected > 0)
        })
        .await
    }
}

const TRADE_SELECT: &str = "SELECT
    trade_id, role, rfq_channel, swap_channel, counterparty_pubkey,
    btc_sats, usdt_amount, platform_fee_bps, trade_fee_bps,
    sol_refund_window_sec, sol_escrow_pda, sol_vault_ata,
    sol_refund_after_unix, ln_invoice_bolt11, ln_payment_hash_hex,
    ln_preimage_hex, state, created_at, updated_at, last_error
FROM trades";

fn row_to_trade(row: &Row<'_>) -> rusqlite::Result<TradeRecord> {
    Ok(TradeRecord {
        trade_id: row.get(0)?,
        role: Role::parse(&row.get::<_, String>(1)?)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e)))?,
        rfq_channel: row.get(2)?,
        swap_channel: row.get(3)?,
        counterparty_pubkey: row.get(4)?,
        btc_sats: row.get(5)?,
        usdt_amount: row.get(6)?,
        platform_fee_bps: row.get(7)?,
        trade_fee_bps: row.get(8)?,
        sol_refund_window_sec: row.get(9)?,
        sol_escrow_pda: row.get(10)?,
        sol_vault_ata: row.get(11)?,
        sol_refund_after_unix: row.get(12)?,
        ln_invoice_bolt11: row.get(13)?,
        ln_payment_hash_hex: row.get(14)?,
        ln_preimage_hex: row.get(15)?,
        state: TradeState::parse(&row.get::<_, String>(16)?)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(16, rusqlite::types::Type::Text, Box::new(e)))?,
        created_at: row.get(17)?,
        updated_at: row.get(18)?,
        last_error: row.get(19)?,
    })
}

fn get_trade_row(conn: &Connection, trade_id: &str) -> Result<Option<TradeRecord>> {
    conn.query_row(
        &format!("{TRADE_SELECT} WHERE trade_id = ?1"),
        params![trade_id],
        row_to_trade,
    )
    .optional()
    .map_err(Error::from)
}

const LISTING_LOCK_SELECT: &str = "SELECT
    listing_key, listing_type, listing_id, trade_id, state, note, meta_json,
    created_at, updated_at
FROM listing_locks";

fn row_to_listing_lock(row: &Row<'_>) -> rusqlite::Result<ListingLock> {
    Ok(ListingLock {
        listing_key: row.get(0)?,
        listing_type: row.get(1)?,
        listing_id: row.get(2)?,
        trade_id: row.get(3)?,
        state: ListingLockState::parse(&row.get::<_, String>(4)?)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e)))?,
        note: row.get(5)?,
        meta_json: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn get_listing_lock_row(conn: &Connection, listing_key: &str) -> Result<Option<ListingLock>> {
    conn.query_row(
        &format!("{LISTING_LOCK_SELECT} WHERE listing_key = ?1"),
        params![listing_key],
        row_to_listing_lock,
    )
    .optional()
    .map_err(Error::from)
}
