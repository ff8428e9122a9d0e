//! Per-account state shared by the workers of one account: the gateways of
//! every connection (enforcement needs the aggregated view), the last known
//! open-position counts, the connections whose loop has failed, and the
//! unwind ledger.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::engine::enforcer::{
    AccountView, EnforcementReport, PositionCapEnforcer, UnwindLedger, UnwindRecord,
};
use crate::engine::ConnectionGateway;
use crate::models::{Account, ConnectionId};
use crate::safety::SafetyController;

pub struct AccountDesk {
    pub account: Arc<Account>,
    gateways: Vec<Arc<ConnectionGateway>>,
    open_counts: SyncMutex<HashMap<ConnectionId, usize>>,
    failed: SyncMutex<HashSet<ConnectionId>>,
    ledger: Mutex<UnwindLedger>,
}

impl AccountDesk {
    pub fn new(account: Arc<Account>, gateways: Vec<Arc<ConnectionGateway>>, ledger: UnwindLedger) -> Self {
        Self {
            account,
            gateways,
            open_counts: SyncMutex::new(HashMap::new()),
            failed: SyncMutex::new(HashSet::new()),
            ledger: Mutex::new(ledger),
        }
    }

    pub fn record_open(&self, connection: &ConnectionId, open: usize) {
        self.open_counts.lock().insert(connection.clone(), open);
    }

    pub fn note_opened(&self, connection: &ConnectionId) {
        *self.open_counts.lock().entry(connection.clone()).or_insert(0) += 1;
    }

    /// The connection's loop is gone for good; enforcement stops calling it.
    pub fn mark_failed(&self, connection: &ConnectionId) {
        self.failed.lock().insert(connection.clone());
    }

    fn view(&self) -> AccountView {
        AccountView {
            failed: self.failed.lock().clone(),
            last_open: self.open_counts.lock().clone(),
        }
    }

    /// Last known open positions across all connections of the account.
    pub fn aggregated_open(&self) -> usize {
        self.open_counts.lock().values().sum()
    }

    /// Run one enforcement pass unless another worker of this account is
    /// already running one. Returns `None` when skipped.
    pub async fn try_enforce(
        &self,
        enforcer: &PositionCapEnforcer,
        safety: &SafetyController,
    ) -> Option<EnforcementReport> {
        let Ok(mut ledger) = self.ledger.try_lock() else {
            debug!(account = %self.account.id, "enforcement already in flight");
            return None;
        };
        let view = self.view();
        match enforcer
            .enforce(&self.account.id, &self.gateways, &view, &mut ledger, safety)
            .await
        {
            Ok(report) => Some(report),
            Err(skipped) => {
                warn!(account = %self.account.id, reason = %skipped, "enforcement pass skipped");
                None
            }
        }
    }

    pub async fn unwind_records(&self) -> Vec<UnwindRecord> {
        self.ledger.lock().await.records()
    }
}
