//! # nonce: NonceSequencer
//!
//! Process-wide, exchange-scoped generator of strictly increasing request
//! nonces that survives restarts.
//!
//! ## Issuance
//! On first use per exchange the lane is seeded with
//! `max(now_ns, persisted + 1)`. Every `issue()` computes
//! `max(now_ns, last + 1)` under the lane lock, releases it, then queues the
//! value for the background persister. Persistence never blocks issuance and a
//! failed write only costs durability.
//!
//! ## Full serialization
//! Some exchanges reject requests that *arrive* out of nonce order even when
//! the nonces themselves are monotonic. A serialized lane hands out a
//! [`NonceTicket`] that holds the lane's request permit until it is dropped,
//! so "issue → sign → send → receive" runs one request at a time and arrival
//! order matches issuance order. Lanes are serialized either permanently by
//! config or after `conflict_escalation` consecutive nonce rejections.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{env_list, env_or};
use crate::models::ExchangeId;

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NonceConfig {
    /// Exchanges that always run in full-serialization mode.
    pub serialized_exchanges: Vec<ExchangeId>,
    /// Consecutive nonce conflicts before a lane is serialized (0 = never).
    pub conflict_escalation: u32,
}

impl NonceConfig {
    pub fn from_env() -> Self {
        Self {
            serialized_exchanges: env_list("NONCE_FULL_SERIALIZATION")
                .iter()
                .map(ExchangeId::new)
                .collect(),
            conflict_escalation: env_or("NONCE_CONFLICT_ESCALATION", 3),
        }
    }
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            serialized_exchanges: Vec::new(),
            conflict_escalation: 3,
        }
    }
}

// ─── Persistence ──────────────────────────────────────────────────────────────

/// Durable home of the last issued nonce per exchange.
pub trait NonceStore: Send + Sync {
    fn load(&self, exchange: &ExchangeId) -> io::Result<Option<i64>>;
    fn store(&self, exchange: &ExchangeId, value: i64) -> io::Result<()>;
}

/// One small JSON file per exchange: `{"last_nonce": 1718000000000000000}`.
///
/// When the file is missing (ephemeral disks), `load` falls back to the
/// `NONCE_SEED_<EXCHANGE>` environment variable.
#[derive(Debug, Clone)]
pub struct FileNonceStore {
    dir: PathBuf,
}

impl FileNonceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, exchange: &ExchangeId) -> PathBuf {
        self.dir.join(format!("{}.nonce.json", exchange.as_str()))
    }

    fn env_seed(exchange: &ExchangeId) -> Option<i64> {
        let key = format!(
            "NONCE_SEED_{}",
            exchange.as_str().to_ascii_uppercase().replace(['-', '.'], "_")
        );
        std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
    }
}

impl NonceStore for FileNonceStore {
    fn load(&self, exchange: &ExchangeId) -> io::Result<Option<i64>> {
        let from_file = read_nonce_file(&self.path_for(exchange))?;
        let from_env = Self::env_seed(exchange);
        Ok(from_file.max(from_env))
    }

    fn store(&self, exchange: &ExchangeId, value: i64) -> io::Result<()> {
        write_nonce_file(&self.path_for(exchange), value)
    }
}

fn read_nonce_file(path: &Path) -> io::Result<Option<i64>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&content)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let last = value
        .get("last_nonce")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing last_nonce field"))?;
    Ok(Some(last))
}

/// Write to a temp file and rename over the target so a crash mid-write never
/// leaves a truncated nonce behind.
fn write_nonce_file(path: &Path, value: i64) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("nonce.json");
    let tmp_path = parent.join(format!(".{}.tmp.{}", file_name, std::process::id()));
    let content = serde_json::json!({ "last_nonce": value }).to_string();
    fs::write(&tmp_path, content)?;
    fs::rename(&tmp_path, path)
}

// ─── State ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NonceState {
    pub last_issued: i64,
    /// Highest value known to be durable.
    pub persisted: Option<i64>,
    pub persisted_at: Option<DateTime<Utc>>,
}

struct NonceLane {
    state: Mutex<NonceState>,
    permit: Arc<tokio::sync::Mutex<()>>,
    serialized: AtomicBool,
    conflicts: AtomicU32,
}

/// A nonce plus, on serialized lanes, the right to send the request it signs.
/// Drop it once the exchange has answered.
pub struct NonceTicket {
    pub exchange: ExchangeId,
    pub nonce: i64,
    _permit: Option<OwnedMutexGuard<()>>,
}

impl NonceTicket {
    pub fn is_serialized(&self) -> bool {
        self._permit.is_some()
    }
}

impl std::fmt::Debug for NonceTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceTicket")
            .field("exchange", &self.exchange)
            .field("nonce", &self.nonce)
            .field("serialized", &self.is_serialized())
            .finish()
    }
}

// ─── Sequencer ────────────────────────────────────────────────────────────────

pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

pub struct NonceSequencer {
    lanes: Mutex<HashMap<ExchangeId, Arc<NonceLane>>>,
    store: Arc<dyn NonceStore>,
    config: NonceConfig,
    clock: fn() -> i64,
    /// Exchanges with values not yet handed to the store. At most one entry
    /// per exchange, whether or not a persister is running.
    dirty: Mutex<HashSet<ExchangeId>>,
    flush_due: Notify,
    persister_started: AtomicBool,
    /// Serializes writers so an older value never overwrites a newer one.
    /// Never taken by `issue()`.
    write_lock: Mutex<()>,
}

impl NonceSequencer {
    pub fn new(store: Arc<dyn NonceStore>, config: NonceConfig) -> Self {
        Self::with_clock(store, config, now_nanos)
    }

    pub fn with_clock(store: Arc<dyn NonceStore>, config: NonceConfig, clock: fn() -> i64) -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
            store,
            config,
            clock,
            dirty: Mutex::new(HashSet::new()),
            flush_due: Notify::new(),
            persister_started: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }
    }

    /// Look up or seed the lane for `exchange`. The store read happens with
    /// no lock held; if two callers race, the first insert wins and both were
    /// seeded from the same persisted value anyway.
    fn lane(&self, exchange: &ExchangeId) -> Arc<NonceLane> {
        if let Some(lane) = self.lanes.lock().get(exchange) {
            return Arc::clone(lane);
        }

        let persisted = match self.store.load(exchange) {
            Ok(value) => value,
            Err(e) => {
                warn!(%exchange, error = %e, "nonce store unreadable, seeding from clock");
                None
            }
        };
        let seed = match persisted {
            Some(p) => (self.clock)().max(p.saturating_add(1)),
            None => (self.clock)(),
        };
        let serialized = self.config.serialized_exchanges.contains(exchange);

        let mut lanes = self.lanes.lock();
        let lane = lanes.entry(exchange.clone()).or_insert_with(|| {
            info!(%exchange, seed, ?persisted, serialized, "nonce lane seeded");
            Arc::new(NonceLane {
                state: Mutex::new(NonceState {
                    last_issued: seed,
                    persisted,
                    persisted_at: None,
                }),
                permit: Arc::new(tokio::sync::Mutex::new(())),
                serialized: AtomicBool::new(serialized),
                conflicts: AtomicU32::new(0),
            })
        });
        Arc::clone(lane)
    }

    fn issue_on(&self, exchange: &ExchangeId, lane: &NonceLane) -> i64 {
        let candidate = {
            let mut state = lane.state.lock();
            let candidate = (self.clock)().max(state.last_issued.saturating_add(1));
            state.last_issued = candidate;
            candidate
        };
        if self.dirty.lock().insert(exchange.clone()) {
            self.flush_due.notify_one();
        }
        candidate
    }

    /// Next nonce for `exchange`, strictly greater than anything issued before
    /// in this process or persisted by an earlier one.
    pub fn issue(&self, exchange: &ExchangeId) -> i64 {
        let lane = self.lane(exchange);
        self.issue_on(exchange, &lane)
    }

    /// Issue a nonce for a request about to be signed and sent. On serialized
    /// lanes this waits for the previous request to finish first.
    pub async fn begin_request(&self, exchange: &ExchangeId) -> NonceTicket {
        let lane = self.lane(exchange);
        let permit = if lane.serialized.load(Ordering::Acquire) {
            Some(Arc::clone(&lane.permit).lock_owned().await)
        } else {
            None
        };
        let nonce = self.issue_on(exchange, &lane);
        NonceTicket {
            exchange: exchange.clone(),
            nonce,
            _permit: permit,
        }
    }

    /// Count a nonce rejection. Returns `true` when this call switched the lane
    /// into full-serialization mode.
    pub fn record_conflict(&self, exchange: &ExchangeId) -> bool {
        let lane = self.lane(exchange);
        let conflicts = lane.conflicts.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(%exchange, conflicts, "exchange rejected nonce");

        let threshold = self.config.conflict_escalation;
        if threshold > 0
            && conflicts >= threshold
            && !lane.serialized.swap(true, Ordering::AcqRel)
        {
            warn!(%exchange, conflicts, "nonce lane escalated to full serialization");
            return true;
        }
        false
    }

    pub fn record_accepted(&self, exchange: &ExchangeId) {
        if let Some(lane) = self.lanes.lock().get(exchange) {
            lane.conflicts.store(0, Ordering::Release);
        }
    }

    pub fn is_serialized(&self, exchange: &ExchangeId) -> bool {
        self.lane(exchange).serialized.load(Ordering::Acquire)
    }

    pub fn state(&self, exchange: &ExchangeId) -> Option<NonceState> {
        self.lanes.lock().get(exchange).map(|lane| *lane.state.lock())
    }

    /// Write the lane's current value to the store now.
    pub fn persist(&self, exchange: &ExchangeId) -> io::Result<()> {
        let Some(lane) = self.lanes.lock().get(exchange).cloned() else {
            return Ok(());
        };

        let _writer = self.write_lock.lock();
        let (value, already) = {
            let state = lane.state.lock();
            (state.last_issued, state.persisted)
        };
        if already.is_some_and(|p| p >= value) {
            return Ok(());
        }

        self.store.store(exchange, value)?;

        let mut state = lane.state.lock();
        if state.persisted.map_or(true, |p| p < value) {
            state.persisted = Some(value);
            state.persisted_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Flush every lane. Errors are logged, not returned.
    pub fn persist_all(&self) {
        let exchanges: Vec<ExchangeId> = self.lanes.lock().keys().cloned().collect();
        for exchange in exchanges {
            if let Err(e) = self.persist(&exchange) {
                warn!(%exchange, error = %e, "nonce flush failed");
            }
        }
    }

    /// Start the background writer. Issues between two flushes coalesce into
    /// one write per exchange. Returns `None` if already started.
    pub fn spawn_persister(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.persister_started.swap(true, Ordering::SeqCst) {
            return None;
        }
        let sequencer = Arc::clone(self);

        Some(tokio::spawn(async move {
            loop {
                sequencer.flush_due.notified().await;
                let dirty: Vec<ExchangeId> = sequencer.dirty.lock().drain().collect();
                if dirty.is_empty() {
                    continue;
                }

                let worker = Arc::clone(&sequencer);
                let flushed = tokio::task::spawn_blocking(move || {
                    for exchange in dirty {
                        if let Err(e) = worker.persist(&exchange) {
                            warn!(%exchange, error = %e, "nonce persistence failed, continuing");
                        }
                    }
                })
                .await;
                if let Err(e) = flushed {
                    warn!(error = %e, "nonce persister write task aborted");
                }
            }
        }))
    }
}

// ─── Test Store ───────────────────────────────────────────────────────────────

#[cfg(test)]
#[derive(Default)]
pub struct MemoryNonceStore {
    values: Mutex<HashMap<ExchangeId, i64>>,
    fail_writes: AtomicBool,
}

#[cfg(test)]
impl MemoryNonceStore {
    pub fn seeded(exchange: &str, value: i64) -> Self {
        let store = Self::default();
        store.values.lock().insert(ExchangeId::new(exchange), value);
        store
    }

    pub fn failing() -> Self {
        let store = Self::default();
        store.fail_writes.store(true, Ordering::SeqCst);
        store
    }

    pub fn get(&self, exchange: &str) -> Option<i64> {
        self.values.lock().get(&ExchangeId::new(exchange)).copied()
    }
}

#[cfg(test)]
impl NonceStore for MemoryNonceStore {
    fn load(&self, exchange: &ExchangeId) -> io::Result<Option<i64>> {
        Ok(self.values.lock().get(exchange).copied())
    }

    fn store(&self, exchange: &ExchangeId, value: i64) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }
        self.values.lock().insert(exchange.clone(), value);
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::thread;

    fn frozen_clock() -> i64 {
        500
    }

    fn kraken() -> ExchangeId {
        ExchangeId::new("kraken")
    }

    #[test]
    fn test_issue_strictly_increasing_with_frozen_clock() {
        let seq = NonceSequencer::with_clock(
            Arc::new(MemoryNonceStore::default()),
            NonceConfig::default(),
            frozen_clock,
        );
        let a = seq.issue(&kraken());
        let b = seq.issue(&kraken());
        let c = seq.issue(&kraken());
        assert!(a < b && b < c);
        assert_eq!(b, a + 1);
    }

    #[test]
    fn test_restart_resumes_above_persisted_value() {
        let store = Arc::new(MemoryNonceStore::seeded("kraken", 1000));
        let seq = NonceSequencer::with_clock(store, NonceConfig::default(), frozen_clock);
        assert!(seq.issue(&kraken()) >= 1001);
    }

    #[test]
    fn test_real_clock_still_beats_far_future_persisted_value() {
        let far = now_nanos() + 1_000_000_000_000;
        let seq = NonceSequencer::new(
            Arc::new(MemoryNonceStore::seeded("kraken", far)),
            NonceConfig::default(),
        );
        assert!(seq.issue(&kraken()) > far);
    }

    #[test]
    fn test_exchanges_have_independent_lanes() {
        let store = Arc::new(MemoryNonceStore::seeded("kraken", 10_000));
        let seq = NonceSequencer::with_clock(store, NonceConfig::default(), frozen_clock);
        assert!(seq.issue(&kraken()) > 10_000);
        assert_eq!(seq.issue(&ExchangeId::new("bitstamp")), 501);
    }

    #[test]
    fn test_concurrent_issue_unique_and_above_persisted() {
        let persisted = 5_000;
        let seq = Arc::new(NonceSequencer::with_clock(
            Arc::new(MemoryNonceStore::seeded("kraken", persisted)),
            NonceConfig::default(),
            frozen_clock,
        ));

        let threads = 16;
        let per_thread = 200;
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let seq = Arc::clone(&seq);
                thread::spawn(move || {
                    let mut local = Vec::with_capacity(per_thread);
                    for _ in 0..per_thread {
                        local.push(seq.issue(&kraken()));
                    }
                    local
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            let local = handle.join().expect("join");
            assert!(local.windows(2).all(|w| w[0] < w[1]), "per-thread order broken");
            all.extend(local);
        }
        let unique: BTreeSet<i64> = all.iter().copied().collect();
        assert_eq!(unique.len(), threads * per_thread);
        assert!(all.iter().all(|&n| n > persisted));
    }

    #[test]
    fn test_persist_failure_does_not_affect_issue() {
        let seq = NonceSequencer::with_clock(
            Arc::new(MemoryNonceStore::failing()),
            NonceConfig::default(),
            frozen_clock,
        );
        let a = seq.issue(&kraken());
        assert!(seq.persist(&kraken()).is_err());
        let b = seq.issue(&kraken());
        assert!(b > a);
        assert_eq!(seq.state(&kraken()).map(|s| s.persisted), Some(None));
    }

    #[test]
    fn test_persist_records_highest_value() {
        let store = Arc::new(MemoryNonceStore::default());
        let seq = NonceSequencer::with_clock(store.clone(), NonceConfig::default(), frozen_clock);
        seq.issue(&kraken());
        let last = seq.issue(&kraken());
        seq.persist_all();
        assert_eq!(store.get("kraken"), Some(last));
        let state = seq.state(&kraken()).expect("lane exists");
        assert_eq!(state.persisted, Some(last));
        assert!(state.persisted_at.is_some());
    }

    #[test]
    fn test_conflicts_escalate_to_serialization() {
        let seq = NonceSequencer::with_clock(
            Arc::new(MemoryNonceStore::default()),
            NonceConfig { conflict_escalation: 3, ..NonceConfig::default() },
            frozen_clock,
        );
        assert!(!seq.record_conflict(&kraken()));
        seq.record_accepted(&kraken());
        assert!(!seq.record_conflict(&kraken()));
        assert!(!seq.record_conflict(&kraken()));
        assert!(seq.record_conflict(&kraken()));
        assert!(seq.is_serialized(&kraken()));
        // Stays serialized; no second escalation event.
        assert!(!seq.record_conflict(&kraken()));
    }

    #[test]
    fn test_file_store_roundtrip_and_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileNonceStore::new(dir.path());
        assert_eq!(store.load(&kraken()).expect("load"), None);
        store.store(&kraken(), 1_234).expect("store");
        assert_eq!(store.load(&kraken()).expect("load"), Some(1_234));
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileNonceStore::new(dir.path());
        fs::write(store.path_for(&kraken()), "not json").expect("write");
        assert!(store.load(&kraken()).is_err());

        // A corrupt store must not stop issuance.
        let seq = NonceSequencer::with_clock(Arc::new(store), NonceConfig::default(), frozen_clock);
        assert_eq!(seq.issue(&kraken()), 501);
    }

    #[tokio::test]
    async fn test_serialized_lane_preserves_send_order() {
        let seq = Arc::new(NonceSequencer::with_clock(
            Arc::new(MemoryNonceStore::default()),
            NonceConfig {
                serialized_exchanges: vec![kraken()],
                ..NonceConfig::default()
            },
            frozen_clock,
        ));
        let arrivals = Arc::new(Mutex::new(Vec::new()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let seq = Arc::clone(&seq);
                let arrivals = Arc::clone(&arrivals);
                tokio::spawn(async move {
                    let ticket = seq.begin_request(&kraken()).await;
                    assert!(ticket.is_serialized());
                    // Simulated network latency while the permit is held.
                    tokio::task::yield_now().await;
                    arrivals.lock().push(ticket.nonce);
                })
            })
            .collect();
        for task in tasks {
            task.await.expect("task");
        }

        let arrivals = arrivals.lock();
        assert_eq!(arrivals.len(), 8);
        assert!(arrivals.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_unflushed_issues_stay_one_entry_per_exchange() {
        let seq = NonceSequencer::with_clock(
            Arc::new(MemoryNonceStore::default()),
            NonceConfig::default(),
            frozen_clock,
        );
        for _ in 0..10_000 {
            seq.issue(&kraken());
            seq.issue(&ExchangeId::new("bitstamp"));
        }
        assert_eq!(seq.dirty.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_background_persister_flushes() {
        let store = Arc::new(MemoryNonceStore::default());
        let seq = Arc::new(NonceSequencer::with_clock(
            store.clone(),
            NonceConfig::default(),
            frozen_clock,
        ));
        let handle = seq.spawn_persister().expect("first spawn");
        assert!(seq.spawn_persister().is_none());

        let last = (0..5).map(|_| seq.issue(&kraken())).last().expect("issued");
        for _ in 0..200 {
            if store.get("kraken") == Some(last) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(store.get("kraken"), Some(last));
        handle.abort();
    }
}
