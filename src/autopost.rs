//! Repeating-listing scheduler (spec §4.5, C5).
//!
//! Each job is one `tokio::spawn`'d future holding its own frozen `args`
//! snapshot, so ticks for a single job are strictly sequential (there is
//! only ever one future driving that job) while different jobs run
//! concurrently. `stop()` aborts the `JoinHandle` synchronously, matching
//! the "owned task handles on a structured async runtime" guidance of
//! spec §9.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::AutopostBounds;
use crate::error::{Error, Result};

/// Which external publish RPC a job drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    PublishOffer,
    PublishRfq,
}

impl Tool {
    pub fn as_str(self) -> &'static str {
        match self {
            Tool::PublishOffer => "publish-offer",
            Tool::PublishRfq => "publish-rfq",
        }
    }
}

/// Inputs to [`AutopostManager::start`].
#[derive(Debug, Clone)]
pub struct StartArgs {
    pub name: String,
    pub tool: Tool,
    pub interval_sec: u64,
    pub ttl_sec: i64,
    /// If absent, computed as `now_unix + ttl_sec`.
    pub valid_until_unix: Option<i64>,
    /// Opaque publish-call arguments, deep-cloned at start and frozen.
    pub args: serde_json::Value,
}

/// A point-in-time snapshot of one job's status (spec §4.5 `status()`).
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub name: String,
    pub tool: Tool,
    pub interval_sec: u64,
    pub ttl_sec: i64,
    pub valid_until_unix: i64,
    pub args: serde_json::Value,
    pub runs: u64,
    pub started_at: i64,
    pub last_run_at: Option<i64>,
    pub last_ok: Option<bool>,
    pub last_error: Option<String>,
}

/// What the external world does with one tick's frozen args: build and
/// publish a signed `svc_announce`/`rfq` envelope. Supplied by the caller
/// so this module stays free of bus/envelope concerns.
#[async_trait::async_trait]
pub trait AutopostPublisher: Send + Sync {
    async fn publish(&self, tool: Tool, args: &serde_json::Value) -> Result<()>;
}

/// Monotonic clock the scheduler reads `now_unix`/`now_ms` from. Injected
/// so job-expiry and interval timing are testable without real sleeps.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs() as i64
    }
}

struct JobHandle {
    join: JoinHandle<()>,
    status: Arc<Mutex<JobStatus>>,
}

/// Owns every running autopost job.
pub struct AutopostManager<P: AutopostPublisher + 'static> {
    jobs: Mutex<HashMap<String, JobHandle>>,
    publisher: Arc<P>,
    clock: Arc<dyn Clock>,
}

impl<P: AutopostPublisher + 'static> AutopostManager<P> {
    pub fn new(publisher: P) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            publisher: Arc::new(publisher),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(publisher: P, clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            publisher: Arc::new(publisher),
            clock,
        }
    }

    /// Start a new job. Rejects a reused `name`, an out-of-range `ttl_sec`,
    /// or a `valid_until_unix` horizon outside `[10s, 7d]` from now.
    pub async fn start(&self, start: StartArgs) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&start.name) {
            return Err(Error::Validation(format!(
                "autopost job {:?} already exists",
                start.name
            )));
        }
        if !(AutopostBounds::MIN_TTL_SEC..=AutopostBounds::MAX_TTL_SEC).contains(&start.ttl_sec) {
            return Err(Error::Validation(format!(
                "ttl_sec {} out of range [{}, {}]",
                start.ttl_sec,
                AutopostBounds::MIN_TTL_SEC,
                AutopostBounds::MAX_TTL_SEC
            )));
        }

        let now = self.clock.now_unix();
        let interval_sec = AutopostBounds::clamp_interval_sec(start.interval_sec);
        let valid_until_unix = start.valid_until_unix.unwrap_or(now + start.ttl_sec);
        let horizon = valid_until_unix - now;
        if !(AutopostBounds::MIN_HORIZON_SEC..=AutopostBounds::MAX_HORIZON_SEC).contains(&horizon)
        {
            return Err(Error::Validation(format!(
                "valid_until_unix horizon {horizon}s out of range [{}, {}]",
                AutopostBounds::MIN_HORIZON_SEC,
                AutopostBounds::MAX_HORIZON_SEC
            )));
        }

        let status = Arc::new(Mutex::new(JobStatus {
            name: start.name.clone(),
            tool: start.tool,
            interval_sec,
            ttl_sec: start.ttl_sec,
            valid_until_unix,
            args: start.args.clone(),
            runs: 0,
            started_at: now,
            last_run_at: None,
            last_ok: None,
            last_error: None,
        }));

        let publisher = self.publisher.clone();
        let clock = self.clock.clone();
        let task_status = status.clone();
        let frozen_args = start.args;
        let tool = start.tool;
        let name = start.name.clone();

        let join = tokio::spawn(async move {
            run_job(
                name,
                tool,
                frozen_args,
                valid_until_unix,
                interval_sec,
                publisher,
                clock,
                task_status,
            )
            .await;
        });

        jobs.insert(start.name, JobHandle { join, status });
        Ok(())
    }

    /// Stop and delete `name`. Idempotent: a missing name is not an error.
    pub async fn stop(&self, name: &str) {
        let mut jobs = self.jobs.lock().await;
        if let Some(handle) = jobs.remove(name) {
            handle.join.abort();
        }
    }

    /// Snapshot of every job's status, sorted by `started_at` descending.
    pub async fn status(&self) -> Vec<JobStatus> {
        let jobs = self.jobs.lock().await;
        let mut statuses = Vec::with_capacity(jobs.len());
        for handle in jobs.values() {
            statuses.push(handle.status.lock().await.clone());
        }
        statuses.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        statuses
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_job<P: AutopostPublisher + 'static>(
    name: String,
    tool: Tool,
    frozen_args: serde_json::Value,
    valid_until_unix: i64,
    interval_sec: u64,
    publisher: Arc<P>,
    clock: Arc<dyn Clock>,
    status: Arc<Mutex<JobStatus>>,
) {
    let period = std::time::Duration::from_millis((interval_sec.max(1) * 1000).max(1000));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let now = clock.now_unix();
        if now >= valid_until_unix {
            return;
        }

        // Rebuild run args from the frozen snapshot, stripping any ttl and
        // re-overwriting valid_until_unix with the job's fixed value: a
        // run must never extend the listing's cryptographic validity.
        let run_args = build_run_args(&frozen_args, valid_until_unix);

        let result = publisher.publish(tool, &run_args).await;

        let mut guard = status.lock().await;
        guard.runs += 1;
        guard.last_run_at = Some(now);
        match result {
            Ok(()) => {
                guard.last_ok = Some(true);
                guard.last_error = None;
                tracing::debug!(job = %name, runs = guard.runs, "autopost run succeeded");
            }
            Err(e) => {
                guard.last_ok = Some(false);
                guard.last_error = Some(e.to_string());
                tracing::warn!(job = %name, error = %e, "autopost run failed");
            }
        }
        drop(guard);
    }
}

fn build_run_args(frozen_args: &serde_json::Value, valid_until_unix: i64) -> serde_json::Value {
    let mut args = frozen_args.clone();
    if let serde_json::Value::Object(map) = &mut args {
        map.remove("ttl_sec");
        map.insert(
            "valid_until_unix".to_string(),
            serde_json::Value::from(valid_until_unix),
        );
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    struct FixedClock(AtomicI64);

    impl Clock for FixedClock {
        fn now_unix(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct CountingPublisher {
        count: Arc<AtomicUsize>,
        last_valid_until: Arc<Mutex<Option<i64>>>,
    }

    #[async_trait::async_trait]
    impl AutopostPublisher for CountingPublisher {
        async fn publish(&self, _tool: Tool, args: &serde_json::Value) -> Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            *self.last_valid_until.lock().await = args.get("valid_until_unix").cloned().map(|v| v.as_i64().unwrap());
            Ok(())
        }
    }

    #[test]
    fn build_run_args_strips_ttl_and_pins_valid_until() {
        let frozen = serde_json::json!({"ttl_sec": 10, "pair": "BTC-USDT", "valid_until_unix": 999});
        let rebuilt = build_run_args(&frozen, 5000);
        assert!(rebuilt.get("ttl_sec").is_none());
        assert_eq!(rebuilt["valid_until_unix"], 5000);
        assert_eq!(rebuilt["pair"], "BTC-USDT");
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_ttl_out_of_range() {
        let count = Arc::new(AtomicUsize::new(0));
        let manager = AutopostManager::new(CountingPublisher {
            count: count.clone(),
            last_valid_until: Arc::new(Mutex::new(None)),
        });

        let err = manager
            .start(StartArgs {
                name: "job-1".into(),
                tool: Tool::PublishRfq,
                interval_sec: 1,
                ttl_sec: 5,
                valid_until_unix: None,
                args: serde_json::json!({}),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_duplicate_name() {
        let manager = AutopostManager::new(CountingPublisher {
            count: Arc::new(AtomicUsize::new(0)),
            last_valid_until: Arc::new(Mutex::new(None)),
        });
        let start_args = || StartArgs {
            name: "job-1".into(),
            tool: Tool::PublishRfq,
            interval_sec: 1,
            ttl_sec: 100,
            valid_until_unix: None,
            args: serde_json::json!({}),
        };

        manager.start(start_args()).await.unwrap();
        let err = manager.start(start_args()).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn every_run_carries_the_same_fixed_valid_until_i4() {
        let count = Arc::new(AtomicUsize::new(0));
        let last_valid_until = Arc::new(Mutex::new(None));
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(AtomicI64::new(1_700_000_000)));
        let manager = AutopostManager::with_clock(
            CountingPublisher {
                count: count.clone(),
                last_valid_until: last_valid_until.clone(),
            },
            clock,
        );

        manager
            .start(StartArgs {
                name: "job-1".into(),
                tool: Tool::PublishRfq,
                interval_sec: 1,
                ttl_sec: 10,
                valid_until_unix: Some(1_700_000_010),
                args: serde_json::json!({"ttl_sec": 10}),
            })
            .await
            .unwrap();

        tokio::time::advance(std::time::Duration::from_millis(3500)).await;
        tokio::task::yield_now().await;

        assert!(count.load(Ordering::SeqCst) >= 1);
        assert_eq!(*last_valid_until.lock().await, Some(1_700_000_010));
    }
}
