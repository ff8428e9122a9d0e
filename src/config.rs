//! # config
//!
//! Process configuration read from environment variables (`.env` is loaded
//! by `main` through `dotenvy`). Each subsystem owns its own config struct
//! with a `from_env()` constructor; [`AppConfig`] gathers them.
//!
//! | Variable              | Default              |
//! |-----------------------|----------------------|
//! | `BIND_ADDR`           | `0.0.0.0:3000`       |
//! | `ACCOUNTS_FILE`       | `accounts.json`      |
//! | `NONCE_DIR`           | `state/nonces`       |
//! | `STATE_FILE`          | `state/snapshot.json`|
//! | `EMERGENCY_STOP_FILE` | `EMERGENCY_STOP`     |
//! | `CONTROL_API_KEY`     | unset (open)         |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use crate::engine::enforcer::EnforcerConfig;
use crate::nonce::NonceConfig;
use crate::safety::SafetyConfig;
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub accounts_file: PathBuf,
    pub nonce_dir: PathBuf,
    pub state_file: PathBuf,
    pub scheduler: SchedulerConfig,
    pub safety: SafetyConfig,
    pub enforcer: EnforcerConfig,
    pub nonce: NonceConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr = std::env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:3000".to_string())
            .parse()
            .context("BIND_ADDR must be a socket address")?;

        Ok(Self {
            bind_addr,
            accounts_file: env_path("ACCOUNTS_FILE", "accounts.json"),
            nonce_dir: env_path("NONCE_DIR", "state/nonces"),
            state_file: env_path("STATE_FILE", "state/snapshot.json"),
            scheduler: SchedulerConfig::from_env(),
            safety: SafetyConfig::from_env(),
            enforcer: EnforcerConfig::from_env(),
            nonce: NonceConfig::from_env(),
        })
    }
}

// ─── Env Helpers ──────────────────────────────────────────────────────────────

/// Typed env lookup; unset or unparsable values fall back to `default`.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

pub fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_or(key, default_secs))
}

pub fn env_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_or(key, default_ms))
}

pub fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

/// Comma separated list, trimmed, empties dropped.
pub fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
