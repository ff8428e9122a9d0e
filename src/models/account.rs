//! # models::account
//!
//! Identifiers, account definitions and exchange connections.
//!
//! An [`Account`] owns its [`ExchangeConnection`]s outright: connections are
//! built by the registry per (account, exchange) pair and are never handed to
//! a second account, even when the underlying HTTP client is pooled.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ─── Identifiers ──────────────────────────────────────────────────────────────

/// Stable account identifier, e.g. `"master"` or `"user-042"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exchange identifier, normalised to lowercase (`"kraken"`, `"coinbase"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeId(String);

impl ExchangeId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one (account, exchange) connection. Rendered as `account/exchange`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId {
    pub account: AccountId,
    pub exchange: ExchangeId,
}

impl ConnectionId {
    pub fn new(account: AccountId, exchange: ExchangeId) -> Self {
        Self { account, exchange }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account, self.exchange)
    }
}

// ─── Account Kind ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Master,
    User,
}

// ─── Credentials ──────────────────────────────────────────────────────────────

/// API credentials for one exchange connection.
///
/// `Debug` is implemented by hand so secrets never reach the log.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &mask(&self.api_key))
            .field("api_secret", &"***")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Keep the first four characters of a key for log correlation.
pub fn mask(key: &str) -> String {
    let visible: String = key.chars().take(4).collect();
    format!("{visible}…")
}

// ─── Config (as loaded from the accounts file) ───────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConnectionConfig {
    pub exchange: String,
    #[serde(flatten)]
    pub credentials: Credentials,
    /// Overrides the broker's own `requires_nonce()` answer when set.
    #[serde(default)]
    pub requires_nonce: Option<bool>,
}

/// One entry of the accounts file.
///
/// ```json
/// { "id": "user-7", "kind": "user",
///   "connections": [ { "exchange": "kraken", "api_key": "…", "api_secret": "…" } ] }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    pub kind: AccountKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub kill_switch: bool,
    /// Per-account override of the minimum tradable balance.
    #[serde(default)]
    pub min_balance: Option<f64>,
    pub connections: Vec<ConnectionConfig>,
}

fn default_true() -> bool {
    true
}

// ─── Runtime Objects ──────────────────────────────────────────────────────────

/// A live binding of one account to one exchange.
#[derive(Debug)]
pub struct ExchangeConnection {
    pub id: ConnectionId,
    pub credentials: Credentials,
    /// `None` defers to the broker's `requires_nonce()`.
    pub requires_nonce: Option<bool>,
    /// Pooled per exchange; the connection object itself is never shared.
    pub http: reqwest::Client,
}

impl ExchangeConnection {
    pub fn exchange(&self) -> &ExchangeId {
        &self.id.exchange
    }

    pub fn account(&self) -> &AccountId {
        &self.id.account
    }
}

#[derive(Debug)]
pub struct Account {
    pub id: AccountId,
    pub kind: AccountKind,
    pub enabled: bool,
    /// Kill-switch state requested by the accounts file at load time.
    pub kill_switch: bool,
    pub min_balance: Option<f64>,
    pub connections: Vec<Arc<ExchangeConnection>>,
}

impl Account {
    pub fn connection(&self, exchange: &ExchangeId) -> Option<&Arc<ExchangeConnection>> {
        self.connections.iter().find(|c| c.exchange() == exchange)
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|c| c.id.clone()).collect()
    }
}
