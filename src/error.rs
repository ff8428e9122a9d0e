//! # error
//!
//! Error taxonomy for the execution core.
//!
//! * [`ConfigError`]:     fatal at registration; the account never starts.
//! * [`BrokerError`]:     what a broker call can fail with, classified into
//!   transient / fatal / nonce-conflict / order-level by [`BrokerError::class`].
//! * [`WorkerError`]:     what a trading-loop cycle can fail with. Stays local
//!   to the worker that produced it.
//! * [`SafetyViolation`]: the enforcer could not bring an account under its cap.
//! * [`AppError`]:        HTTP-facing error for the control/health surface.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::{AccountId, ExchangeId};

// ─── Registration ─────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("account id must not be empty")]
    EmptyAccountId,

    #[error("account {0} has no exchange connections")]
    NoConnections(AccountId),

    #[error("account {account}: missing credential field `{field}` for {exchange}")]
    MissingCredential {
        account: AccountId,
        exchange: String,
        field: &'static str,
    },

    #[error("account {account}: malformed credential `{field}` for {exchange}: {reason}")]
    MalformedCredential {
        account: AccountId,
        exchange: String,
        field: &'static str,
        reason: &'static str,
    },

    #[error("account {0} is already registered with different credentials")]
    ConflictingRegistration(AccountId),

    #[error("account {account} lists exchange {exchange} more than once")]
    DuplicateExchange { account: AccountId, exchange: ExchangeId },

    #[error("api key for {exchange} is already bound to account {owner}")]
    SharedCredentials { exchange: ExchangeId, owner: AccountId },

    #[error("master account already registered as {0}")]
    SecondMaster(AccountId),

    #[error("no broker available for exchange {0}")]
    UnsupportedExchange(ExchangeId),

    #[error("failed to read accounts file: {0}")]
    Io(String),

    #[error("failed to parse accounts file: {0}")]
    Parse(String),
}

// ─── Broker ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("rate limited by exchange")]
    RateLimited,

    #[error("broker call timed out")]
    Timeout,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("exchange rejected nonce")]
    InvalidNonce,

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("account suspended")]
    AccountSuspended,
}

/// How the orchestrator reacts to a [`BrokerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff; trips the circuit breaker when repeated.
    Transient,
    /// No retry; the worker fails after repeated occurrences.
    Fatal,
    /// Re-issue a nonce; repeated conflicts escalate serialization.
    NonceConflict,
    /// The exchange is healthy but refused this particular order.
    OrderLevel,
}

impl BrokerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BrokerError::RateLimited | BrokerError::Timeout | BrokerError::Transport(_) => {
                ErrorClass::Transient
            }
            BrokerError::InvalidNonce => ErrorClass::NonceConflict,
            BrokerError::InsufficientFunds | BrokerError::Rejected(_) => ErrorClass::OrderLevel,
            BrokerError::InvalidCredentials | BrokerError::AccountSuspended => ErrorClass::Fatal,
        }
    }

    /// Whether the failure says something about connection health.
    pub fn counts_against_breaker(&self) -> bool {
        !matches!(self.class(), ErrorClass::OrderLevel)
    }
}

// ─── Worker ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq)]
pub enum WorkerError {
    #[error("transient broker error: {0}")]
    Transient(BrokerError),

    #[error("fatal broker error: {0}")]
    Fatal(BrokerError),

    #[error("nonce conflict on {0}")]
    NonceConflict(ExchangeId),

    #[error("cycle panicked: {0}")]
    Panicked(String),
}

impl From<BrokerError> for WorkerError {
    fn from(err: BrokerError) -> Self {
        match err.class() {
            ErrorClass::Fatal => WorkerError::Fatal(err),
            // Order-level errors are handled where the order is placed; one
            // surfacing here came from a read call and is treated as transient.
            ErrorClass::Transient | ErrorClass::OrderLevel => WorkerError::Transient(err),
            ErrorClass::NonceConflict => WorkerError::Transient(err),
        }
    }
}

impl WorkerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, WorkerError::Fatal(_))
    }
}

// ─── Safety ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq, serde::Serialize)]
#[error("account {account} holds {open} open positions after enforcement (max {max})")]
pub struct SafetyViolation {
    pub account: AccountId,
    pub open: usize,
    pub max: usize,
}

// ─── HTTP ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AppError {
    /// The request payload was syntactically correct but semantically invalid.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Unknown account or trading loop.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Catch-all for unexpected failures.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {err}"),
            ),
        };

        let body = Json(json!({
            "ok":    false,
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_classes() {
        assert_eq!(BrokerError::RateLimited.class(), ErrorClass::Transient);
        assert_eq!(BrokerError::Timeout.class(), ErrorClass::Transient);
        assert_eq!(BrokerError::InvalidNonce.class(), ErrorClass::NonceConflict);
        assert_eq!(BrokerError::AccountSuspended.class(), ErrorClass::Fatal);
        assert_eq!(BrokerError::InsufficientFunds.class(), ErrorClass::OrderLevel);
        assert!(!BrokerError::Rejected("lot size".into()).counts_against_breaker());
        assert!(BrokerError::InvalidCredentials.counts_against_breaker());
    }

    #[test]
    fn test_worker_error_from_broker() {
        assert!(WorkerError::from(BrokerError::InvalidCredentials).is_fatal());
        assert_eq!(
            WorkerError::from(BrokerError::RateLimited),
            WorkerError::Transient(BrokerError::RateLimited)
        );
    }
}
