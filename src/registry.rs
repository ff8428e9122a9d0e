//! # registry: AccountRegistry
//!
//! Loads account definitions (one master plus any number of user accounts)
//! and binds each to its own exchange credentials.
//!
//! ## Guarantees
//! * Credentials are validated at registration; a bad entry is a
//!   [`ConfigError`] and that account never starts.
//! * Re-registering an id with identical credentials is a no-op; with
//!   different credentials it is rejected.
//! * Every (account, exchange) pair gets its own [`ExchangeConnection`]. HTTP
//!   clients are pooled per exchange, connection objects are not.
//! * One API key is never bound to two accounts on the same exchange.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{error, info};

use crate::error::ConfigError;
use crate::models::account::mask;
use crate::models::{
    Account, AccountConfig, AccountId, AccountKind, ConnectionConfig, ExchangeConnection, ExchangeId,
};

const MIN_KEY_LEN: usize = 8;

struct Registered {
    config: AccountConfig,
    account: Arc<Account>,
}

/// Outcome of loading an accounts file: good entries are registered, bad
/// ones are reported and skipped.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub registered: Vec<Arc<Account>>,
    pub rejected: Vec<(String, ConfigError)>,
}

pub struct AccountRegistry {
    accounts: RwLock<HashMap<AccountId, Registered>>,
    http_pool: Mutex<HashMap<ExchangeId, reqwest::Client>>,
    http_timeout: Duration,
}

impl AccountRegistry {
    pub fn new(http_timeout: Duration) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            http_pool: Mutex::new(HashMap::new()),
            http_timeout,
        }
    }

    /// Validate and register one account.
    pub fn register(&self, config: AccountConfig) -> Result<Arc<Account>, ConfigError> {
        let id = AccountId::new(config.id.trim());
        validate(&id, &config)?;

        let mut accounts = self.accounts.write();

        if let Some(existing) = accounts.get(&id) {
            if same_credentials(&existing.config, &config) {
                return Ok(Arc::clone(&existing.account));
            }
            return Err(ConfigError::ConflictingRegistration(id));
        }

        if config.kind == AccountKind::Master {
            if let Some(master) = accounts.values().find(|r| r.account.kind == AccountKind::Master) {
                return Err(ConfigError::SecondMaster(master.account.id.clone()));
            }
        }

        for conn in &config.connections {
            let exchange = ExchangeId::new(&conn.exchange);
            let owner = accounts.values().find(|r| {
                r.account
                    .connection(&exchange)
                    .is_some_and(|c| c.credentials.api_key == conn.credentials.api_key)
            });
            if let Some(owner) = owner {
                return Err(ConfigError::SharedCredentials {
                    exchange,
                    owner: owner.account.id.clone(),
                });
            }
        }

        let connections = config
            .connections
            .iter()
            .map(|conn| self.bind_connection(&id, conn))
            .collect();

        let account = Arc::new(Account {
            id: id.clone(),
            kind: config.kind,
            enabled: config.enabled,
            kill_switch: config.kill_switch,
            min_balance: config.min_balance,
            connections,
        });

        info!(
            account = %id,
            kind = ?account.kind,
            exchanges = ?account.connections.iter().map(|c| c.exchange().as_str()).collect::<Vec<_>>(),
            enabled = account.enabled,
            "account registered"
        );

        accounts.insert(
            id,
            Registered {
                config,
                account: Arc::clone(&account),
            },
        );
        Ok(account)
    }

    /// A fresh connection object around a pooled HTTP client.
    fn bind_connection(&self, account: &AccountId, conn: &ConnectionConfig) -> Arc<ExchangeConnection> {
        let exchange = ExchangeId::new(&conn.exchange);
        let http = {
            let mut pool = self.http_pool.lock();
            pool.entry(exchange.clone())
                .or_insert_with(|| {
                    reqwest::Client::builder()
                        .timeout(self.http_timeout)
                        .build()
                        .unwrap_or_else(|_| reqwest::Client::new())
                })
                .clone()
        };
        Arc::new(ExchangeConnection {
            id: crate::models::ConnectionId::new(account.clone(), exchange),
            credentials: conn.credentials.clone(),
            requires_nonce: conn.requires_nonce,
            http,
        })
    }

    /// Register every entry of a JSON accounts file. A malformed file is an
    /// error; a malformed entry only rejects that entry.
    pub fn load_file(&self, path: &Path) -> Result<LoadReport, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        self.load_json(&raw)
    }

    pub fn load_json(&self, raw: &str) -> Result<LoadReport, ConfigError> {
        let configs: Vec<AccountConfig> =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let mut report = LoadReport::default();
        for config in configs {
            let id = config.id.clone();
            match self.register(config) {
                Ok(account) => report.registered.push(account),
                Err(e) => {
                    error!(account = %id, error = %e, "account rejected");
                    report.rejected.push((id, e));
                }
            }
        }
        Ok(report)
    }

    pub fn get(&self, id: &AccountId) -> Option<Arc<Account>> {
        self.accounts.read().get(id).map(|r| Arc::clone(&r.account))
    }

    pub fn remove(&self, id: &AccountId) -> Option<Arc<Account>> {
        self.accounts.write().remove(id).map(|r| r.account)
    }

    /// All accounts, master first, then by id.
    pub fn accounts(&self) -> Vec<Arc<Account>> {
        let mut all: Vec<_> = self.accounts.read().values().map(|r| Arc::clone(&r.account)).collect();
        all.sort_by(|a, b| {
            (a.kind != AccountKind::Master, &a.id).cmp(&(b.kind != AccountKind::Master, &b.id))
        });
        all
    }

    pub fn len(&self) -> usize {
        self.accounts.read().len()
    }
}

fn same_credentials(a: &AccountConfig, b: &AccountConfig) -> bool {
    let key = |c: &ConnectionConfig| (ExchangeId::new(&c.exchange), c.credentials.clone());
    let mut left: Vec<_> = a.connections.iter().map(key).collect();
    let mut right: Vec<_> = b.connections.iter().map(key).collect();
    left.sort_by(|x, y| x.0.cmp(&y.0));
    right.sort_by(|x, y| x.0.cmp(&y.0));
    left == right
}

fn validate(id: &AccountId, config: &AccountConfig) -> Result<(), ConfigError> {
    if id.as_str().is_empty() {
        return Err(ConfigError::EmptyAccountId);
    }
    if config.connections.is_empty() {
        return Err(ConfigError::NoConnections(id.clone()));
    }

    let mut seen: Vec<ExchangeId> = Vec::with_capacity(config.connections.len());
    for conn in &config.connections {
        let exchange = conn.exchange.trim().to_string();
        let missing = |field| ConfigError::MissingCredential {
            account: id.clone(),
            exchange: exchange.clone(),
            field,
        };
        let malformed = |field, reason| ConfigError::MalformedCredential {
            account: id.clone(),
            exchange: exchange.clone(),
            field,
            reason,
        };

        if exchange.is_empty() {
            return Err(missing("exchange"));
        }
        let creds = &conn.credentials;
        if creds.api_key.trim().is_empty() {
            return Err(missing("api_key"));
        }
        if creds.api_secret.trim().is_empty() {
            return Err(missing("api_secret"));
        }
        if !is_token(&creds.api_key) {
            return Err(malformed("api_key", "contains whitespace or control characters"));
        }
        if creds.api_key.len() < MIN_KEY_LEN {
            return Err(malformed("api_key", "too short"));
        }
        if !is_token(&creds.api_secret) {
            return Err(malformed("api_secret", "contains whitespace or control characters"));
        }
        if let Some(passphrase) = &creds.passphrase {
            if passphrase.is_empty() {
                return Err(missing("passphrase"));
            }
        }

        let exchange_id = ExchangeId::new(&exchange);
        if seen.contains(&exchange_id) {
            return Err(ConfigError::DuplicateExchange {
                account: id.clone(),
                exchange: exchange_id,
            });
        }
        tracing::debug!(account = %id, exchange = %exchange_id, key = %mask(&creds.api_key), "credentials validated");
        seen.push(exchange_id);
    }
    Ok(())
}

fn is_token(value: &str) -> bool {
    value.chars().all(|c| c.is_ascii_graphic())
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::Credentials;

    pub(crate) fn connection_config(exchange: &str, key: &str) -> ConnectionConfig {
        ConnectionConfig {
            exchange: exchange.to_string(),
            credentials: Credentials {
                api_key: key.to_string(),
                api_secret: format!("{key}-secret"),
                passphrase: None,
            },
            requires_nonce: None,
        }
    }

    pub(crate) fn user_config(id: &str, exchanges: &[&str]) -> AccountConfig {
        AccountConfig {
            id: id.to_string(),
            kind: AccountKind::User,
            enabled: true,
            kill_switch: false,
            min_balance: None,
            connections: exchanges
                .iter()
                .map(|ex| connection_config(ex, &format!("key-{id}-{ex}")))
                .collect(),
        }
    }

    /// A registered account outside any registry, for other modules' tests.
    pub(crate) fn account_with(id: &str, exchanges: &[&str]) -> Account {
        let registry = AccountRegistry::new(Duration::from_secs(5));
        let account = registry.register(user_config(id, exchanges)).expect("valid config");
        Account {
            id: account.id.clone(),
            kind: account.kind,
            enabled: account.enabled,
            kill_switch: account.kill_switch,
            min_balance: account.min_balance,
            connections: account.connections.clone(),
        }
    }

    fn registry() -> AccountRegistry {
        AccountRegistry::new(Duration::from_secs(5))
    }

    #[test]
    fn test_register_builds_one_connection_per_exchange() {
        let reg = registry();
        let account = reg.register(user_config("u1", &["kraken", "Bitstamp"])).expect("ok");
        assert_eq!(account.connections.len(), 2);
        assert!(account.connection(&ExchangeId::new("bitstamp")).is_some());
        assert_eq!(account.connections[0].account(), &AccountId::new("u1"));
    }

    #[test]
    fn test_connections_never_shared_between_accounts() {
        let reg = registry();
        let a = reg.register(user_config("a", &["kraken"])).expect("ok");
        let b = reg.register(user_config("b", &["kraken"])).expect("ok");
        assert!(!Arc::ptr_eq(&a.connections[0], &b.connections[0]));
        assert_ne!(a.connections[0].id, b.connections[0].id);
    }

    #[test]
    fn test_missing_and_malformed_credentials() {
        let reg = registry();

        let mut cfg = user_config("u1", &["kraken"]);
        cfg.connections[0].credentials.api_secret = String::new();
        assert!(matches!(
            reg.register(cfg),
            Err(ConfigError::MissingCredential { field: "api_secret", .. })
        ));

        let mut cfg = user_config("u1", &["kraken"]);
        cfg.connections[0].credentials.api_key = "abc def ghi".into();
        assert!(matches!(
            reg.register(cfg),
            Err(ConfigError::MalformedCredential { field: "api_key", .. })
        ));

        let mut cfg = user_config("u1", &["kraken"]);
        cfg.connections[0].credentials.api_key = "short".into();
        assert!(matches!(
            reg.register(cfg),
            Err(ConfigError::MalformedCredential { reason: "too short", .. })
        ));
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn test_reregistration_same_vs_different_credentials() {
        let reg = registry();
        let first = reg.register(user_config("u1", &["kraken"])).expect("ok");
        let again = reg.register(user_config("u1", &["kraken"])).expect("idempotent");
        assert!(Arc::ptr_eq(&first, &again));

        let mut changed = user_config("u1", &["kraken"]);
        changed.connections[0].credentials.api_secret = "another-secret".into();
        assert_eq!(
            reg.register(changed).err(),
            Some(ConfigError::ConflictingRegistration(AccountId::new("u1")))
        );
    }

    #[test]
    fn test_shared_api_key_rejected() {
        let reg = registry();
        reg.register(user_config("a", &["kraken"])).expect("ok");
        let mut stolen = user_config("b", &["kraken"]);
        stolen.connections[0].credentials.api_key = "key-a-kraken".into();
        assert!(matches!(
            reg.register(stolen),
            Err(ConfigError::SharedCredentials { .. })
        ));
    }

    #[test]
    fn test_duplicate_exchange_and_second_master() {
        let reg = registry();
        let dup = user_config("a", &["kraken", "KRAKEN"]);
        assert!(matches!(reg.register(dup), Err(ConfigError::DuplicateExchange { .. })));

        let mut master = user_config("m1", &["kraken"]);
        master.kind = AccountKind::Master;
        reg.register(master).expect("first master");
        let mut other = user_config("m2", &["bitstamp"]);
        other.kind = AccountKind::Master;
        assert_eq!(
            reg.register(other).err(),
            Some(ConfigError::SecondMaster(AccountId::new("m1")))
        );
    }

    #[test]
    fn test_load_json_skips_bad_entries() {
        let reg = registry();
        let raw = r#"[
            { "id": "master", "kind": "master",
              "connections": [ { "exchange": "kraken", "api_key": "MASTERKEY01", "api_secret": "s3cr3t" } ] },
            { "id": "user-1", "kind": "user",
              "connections": [ { "exchange": "kraken", "api_key": "", "api_secret": "s3cr3t" } ] },
            { "id": "user-2", "kind": "user", "kill_switch": true, "min_balance": 250.0,
              "connections": [ { "exchange": "bitstamp", "api_key": "USERKEY0002", "api_secret": "x",
                                 "requires_nonce": true } ] }
        ]"#;
        let report = reg.load_json(raw).expect("parses");
        assert_eq!(report.registered.len(), 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].0, "user-1");

        let accounts = reg.accounts();
        assert_eq!(accounts[0].kind, AccountKind::Master);
        let user2 = reg.get(&AccountId::new("user-2")).expect("registered");
        assert!(user2.kill_switch);
        assert_eq!(user2.min_balance, Some(250.0));
        assert_eq!(user2.connections[0].requires_nonce, Some(true));
    }

    #[test]
    fn test_load_json_rejects_garbage() {
        assert!(matches!(registry().load_json("{"), Err(ConfigError::Parse(_))));
    }
}
