//! Configuration loading and representation.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, anyhow};

/// How batch usage guards its availability check against concurrent writers.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum BalanceLocking {
    /// No lock: two concurrent requests can both see enough stock and both
    /// commit, overdrawing the (lot, location). Acceptable for a single
    /// writer.
    #[default]
    None,
    /// Take a transaction-scoped lock per (lot, location) before reading its
    /// balance.
    Advisory,
}

impl FromStr for BalanceLocking {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(BalanceLocking::None),
            "advisory" => Ok(BalanceLocking::Advisory),
            other => Err(anyhow!(
                "invalid balance locking mode '{other}' (expected none or advisory)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryConfig {
    /// Only required by the Postgres store.
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// Deadline for one compound operation, transaction included.
    pub operation_timeout: Duration,
    pub balance_locking: BalanceLocking,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            operation_timeout: Duration::from_millis(5_000),
            balance_locking: BalanceLocking::None,
        }
    }
}

impl InventoryConfig {
    pub const DATABASE_URL: &'static str = "BREWSTOCK_DATABASE_URL";
    pub const MAX_CONNECTIONS: &'static str = "BREWSTOCK_DB_MAX_CONNECTIONS";
    pub const OPERATION_TIMEOUT_MS: &'static str = "BREWSTOCK_OPERATION_TIMEOUT_MS";
    pub const BALANCE_LOCKING: &'static str = "BREWSTOCK_BALANCE_LOCKING";

    /// Load from process environment; unset variables keep their defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(url) = lookup(Self::DATABASE_URL).filter(|u| !u.trim().is_empty()) {
            config.database_url = Some(url);
        }
        if let Some(raw) = lookup(Self::MAX_CONNECTIONS) {
            config.max_connections = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be a positive integer", Self::MAX_CONNECTIONS))?;
            if config.max_connections == 0 {
                return Err(anyhow!("{} must be at least 1", Self::MAX_CONNECTIONS));
            }
        }
        if let Some(raw) = lookup(Self::OPERATION_TIMEOUT_MS) {
            let millis: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be milliseconds", Self::OPERATION_TIMEOUT_MS))?;
            config.operation_timeout = Duration::from_millis(millis);
        }
        if let Some(raw) = lookup(Self::BALANCE_LOCKING) {
            config.balance_locking = raw.parse()?;
        }

        Ok(config)
    }

    pub fn require_database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| anyhow!("{} is not set", Self::DATABASE_URL))
    }
}
