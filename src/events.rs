//! # events
//!
//! Defines [`SafetyEvent`], every state transition the safety layer records
//! for audit. Events are appended to the controller's audit trail, written to
//! the log, and broadcast to subscribers (the alert relay in `main`, tests).

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{AccountId, ConnectionId};
use crate::safety::KillSource;
use crate::scheduler::LoopState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyEvent {
    GlobalKillEngaged {
        source: KillSource,
        reason: String,
    },

    GlobalKillReleased {
        source: KillSource,
    },

    AccountKillEngaged {
        account: AccountId,
        reason: String,
    },

    AccountKillReleased {
        account: AccountId,
    },

    BreakerOpened {
        connection: ConnectionId,
        consecutive_errors: u32,
        reason: String,
    },

    BreakerHalfOpen {
        connection: ConnectionId,
    },

    BreakerClosed {
        connection: ConnectionId,
    },

    BalanceBelowMinimum {
        connection: ConnectionId,
        balance: f64,
        minimum: f64,
    },

    BalanceRestored {
        connection: ConnectionId,
        balance: f64,
    },

    /// The enforcer ran and the account is still over its cap.
    SafetyViolation {
        account: AccountId,
        open: usize,
        max: usize,
    },

    /// Enough workers have failed fatally that an operator must look.
    FatalEscalation {
        failed: Vec<ConnectionId>,
    },

    LoopStateChanged {
        connection: ConnectionId,
        from: LoopState,
        to: LoopState,
        reason: String,
    },
}

impl SafetyEvent {
    /// Alerts are relayed at error level; everything else is routine audit.
    /// A kill engaging is an alert, its release is not.
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            SafetyEvent::SafetyViolation { .. }
                | SafetyEvent::FatalEscalation { .. }
                | SafetyEvent::GlobalKillEngaged { .. }
                | SafetyEvent::AccountKillEngaged { .. }
        )
    }

    #[inline]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"event":"SERIALIZATION_ERROR"}"#.to_string())
    }
}

/// One audit-trail line: what happened and when.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: SafetyEvent,
}
