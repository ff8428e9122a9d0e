//! # snapshot
//!
//! Durable safety state that must survive a restart: which accounts an
//! operator killed, and how far each gradual unwind has progressed.
//!
//! Written as one JSON document via temp-file + rename, after every
//! enforcement pass that changed something, after control-surface kills,
//! and at shutdown.

use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::engine::UnwindRecord;
use crate::models::AccountId;
use crate::safety::SafetyController;
use crate::scheduler::TradingLoopScheduler;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("snapshot is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KilledAccount {
    pub account: AccountId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub killed_accounts: Vec<KilledAccount>,
    #[serde(default)]
    pub unwinds: Vec<UnwindRecord>,
}

impl StateSnapshot {
    pub async fn capture(safety: &SafetyController, scheduler: &TradingLoopScheduler) -> Self {
        Self {
            saved_at: Utc::now(),
            killed_accounts: safety
                .killed_accounts()
                .into_iter()
                .map(|(account, reason)| KilledAccount { account, reason })
                .collect(),
            unwinds: scheduler.unwind_records().await,
        }
    }

    /// `Ok(None)` when no snapshot has been written yet.
    pub fn load(path: &Path) -> Result<Option<Self>, SnapshotError> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("snapshot.json");
        let tmp_path = parent.join(format!(".{}.tmp.{}", file_name, std::process::id()));
        fs::write(&tmp_path, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Re-engage persisted account kills. Call after the accounts are
    /// registered; kills for accounts no longer configured are dropped.
    pub fn apply_kills(&self, safety: &SafetyController) {
        for killed in &self.killed_accounts {
            if safety.engage_account(&killed.account, &killed.reason) {
                info!(account = %killed.account, reason = %killed.reason, "account kill restored from snapshot");
            } else {
                warn!(account = %killed.account, "snapshot names an unknown account, kill dropped");
            }
        }
    }
}

/// Capture and write, logging instead of failing: a missed snapshot only
/// costs durability.
pub async fn persist(path: &Path, safety: &SafetyController, scheduler: &TradingLoopScheduler) {
    let snapshot = StateSnapshot::capture(safety, scheduler).await;
    match snapshot.save(path) {
        Ok(()) => info!(
            path = %path.display(),
            killed = snapshot.killed_accounts.len(),
            unwinds = snapshot.unwinds.len(),
            "state snapshot saved"
        ),
        Err(e) => warn!(path = %path.display(), error = %e, "state snapshot failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::enforcer::UnwindProgress;
    use crate::models::{ConnectionId, ExchangeId, PositionKey};
    use crate::registry::tests::account_with;
    use crate::safety::SafetyConfig;

    fn snapshot() -> StateSnapshot {
        StateSnapshot {
            saved_at: Utc::now(),
            killed_accounts: vec![KilledAccount {
                account: AccountId::new("u1"),
                reason: "margin call".into(),
            }],
            unwinds: vec![UnwindRecord {
                key: PositionKey {
                    connection: ConnectionId::new(AccountId::new("u1"), ExchangeId::new("kraken")),
                    symbol: "PEPE".into(),
                },
                progress: UnwindProgress {
                    initial_quantity: 100.0,
                    passes_done: 2,
                    last_pass_at: Utc::now(),
                },
            }],
        }
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state").join("snapshot.json");
        assert!(StateSnapshot::load(&path).expect("load").is_none());

        let snap = snapshot();
        snap.save(&path).expect("save");
        assert_eq!(StateSnapshot::load(&path).expect("load"), Some(snap));
    }

    #[test]
    fn test_corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("snapshot.json");
        fs::write(&path, "{ not json").expect("write");
        assert!(matches!(StateSnapshot::load(&path), Err(SnapshotError::Parse(_))));
    }

    #[test]
    fn test_apply_kills_only_for_known_accounts() {
        let safety = SafetyController::new(SafetyConfig::default());
        safety.register_account(&account_with("u1", &["kraken"]));
        let mut snap = snapshot();
        snap.killed_accounts.push(KilledAccount {
            account: AccountId::new("gone"),
            reason: "old".into(),
        });
        snap.apply_kills(&safety);
        assert_eq!(
            safety.killed_accounts(),
            vec![(AccountId::new("u1"), "margin call".to_string())]
        );
    }
}
