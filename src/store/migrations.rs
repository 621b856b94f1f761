//! Ordered schema migrations, tracked by an integer `schema_version` row
//! in `meta`, each applied inside its own transaction. There is no
//! `migrations/` directory artifact; these are the unit under test.

use rusqlite::Connection;

use crate::error::Result;

const MIGRATIONS: &[&str] = &[MIGRATION_0001];

const MIGRATION_0001: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trades (
    trade_id                TEXT PRIMARY KEY,
    role                    TEXT NOT NULL,
    rfq_channel             TEXT,
    swap_channel            TEXT,
    counterparty_pubkey     TEXT,
    btc_sats                INTEGER,
    usdt_amount             TEXT,
    platform_fee_bps        INTEGER,
    trade_fee_bps           INTEGER,
    sol_refund_window_sec   INTEGER,
    sol_escrow_pda          TEXT,
    sol_vault_ata           TEXT,
    sol_refund_after_unix   INTEGER,
    ln_invoice_bolt11       TEXT,
    ln_payment_hash_hex     TEXT,
    ln_preimage_hex         TEXT,
    state                   TEXT NOT NULL,
    created_at              INTEGER NOT NULL,
    updated_at              INTEGER NOT NULL,
    last_error              TEXT
);

CREATE INDEX IF NOT EXISTS idx_trades_payment_hash ON trades(ln_payment_hash_hex);
CREATE INDEX IF NOT EXISTS idx_trades_state ON trades(state);

CREATE TABLE IF NOT EXISTS events (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    trade_id  TEXT NOT NULL,
    ts        INTEGER NOT NULL,
    kind      TEXT NOT NULL,
    payload   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_trade_ts ON events(trade_id, ts);

CREATE TABLE IF NOT EXISTS listing_locks (
    listing_key   TEXT PRIMARY KEY,
    listing_type  TEXT NOT NULL,
    listing_id    TEXT NOT NULL,
    trade_id      TEXT,
    state         TEXT NOT NULL,
    note          TEXT,
    meta_json     TEXT,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_listing_locks_trade_updated ON listing_locks(trade_id, updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_listing_locks_state_updated ON listing_locks(state, updated_at DESC);
"#;

/// Run every migration the database hasn't seen yet, each in its own
/// transaction, bumping `meta.schema_version` as it goes.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    for (idx, migration) in MIGRATIONS.iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(migration)?;
        tx.execute(
            "INSERT INTO meta(key, value) VALUES ('schema_version', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![version.to_string()],
        )?;
        tx.commit()?;
    }

    Ok(())
}
