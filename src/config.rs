//! Typed in-process configuration knobs.
//!
//! These are plain constructor values, not a config-file/env loader —
//! the operator-facing configuration surface is out of scope (spec §1).
//! What remains is the set of numeric knobs spec.md calls out explicitly
//! for the driver, sweeper, and autopost scheduler, each with the default
//! and bound spec.md states.

/// Settlement driver tuning (spec §4.7).
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Tick period. Default 1000ms; clamped to [250, 10000].
    pub interval_ms: u64,
    /// Max external side-effects per tick.
    pub actions_per_tick: usize,
    /// Window events older than this are dropped on tail read.
    pub event_max_age_ms: i64,
    /// Cap on each dedupe set (`auto_*_sig`).
    pub dedupe_max: usize,
    /// Cap on the stage done/in-flight/retry-after maps.
    pub stage_max: usize,
    /// Cap on the cached preimages.
    pub preimage_max: usize,
    /// Per-RPC wall-clock timeout. Default 25s; bounded [250ms, 120s].
    pub tool_timeout_ms: u64,
    /// Bus resubscribe timeout. Bounded by 10s.
    pub subscribe_timeout_ms: u64,
    /// Identity RPC timeout (peer pubkey / chain signer pubkey).
    pub identity_timeout_ms: u64,
    /// How often to re-run the keep-alive resubscribe step.
    pub keep_alive_interval_ms: u64,
    /// Max trades considered per tick by the settlement state machine.
    pub max_trades: usize,
    /// Retry cooldown for most stages.
    pub default_stage_cooldown_ms: i64,
    /// Retry cooldown specific to `sol_claim`.
    pub sol_claim_cooldown_ms: i64,
}

impl DriverConfig {
    /// Clamp `interval_ms` into spec's allowed [250, 10000] range.
    pub fn clamped_interval_ms(&self) -> u64 {
        self.interval_ms.clamp(250, 10_000)
    }

    pub fn clamped_tool_timeout_ms(&self) -> u64 {
        self.tool_timeout_ms.clamp(250, 120_000)
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            actions_per_tick: 12,
            event_max_age_ms: 600_000,
            dedupe_max: 10_000,
            stage_max: 10_000,
            preimage_max: 10_000,
            tool_timeout_ms: 25_000,
            subscribe_timeout_ms: 10_000,
            identity_timeout_ms: 8_000,
            keep_alive_interval_ms: 60_000,
            max_trades: 1_000,
            default_stage_cooldown_ms: 10_000,
            sol_claim_cooldown_ms: 15_000,
        }
    }
}

/// Recovery sweeper tuning (spec §4.8).
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval_ms: u64,
    pub page_size: i64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            page_size: 100,
        }
    }
}

/// Bounds the autopost scheduler enforces on `start()` (spec §4.5).
pub struct AutopostBounds;

impl AutopostBounds {
    pub const MIN_INTERVAL_SEC: u64 = 1;
    pub const MAX_INTERVAL_SEC: u64 = 86_400;
    pub const MIN_TTL_SEC: i64 = 10;
    pub const MAX_TTL_SEC: i64 = 604_800;
    pub const MIN_HORIZON_SEC: i64 = 10;
    pub const MAX_HORIZON_SEC: i64 = 604_800;

    pub fn clamp_interval_sec(interval_sec: u64) -> u64 {
        interval_sec.clamp(Self::MIN_INTERVAL_SEC, Self::MAX_INTERVAL_SEC)
    }
}
