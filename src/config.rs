//! Deployment Configuration
//!
//! Everything that is fixed at deployment time rather than per market:
//! the protocol fee, the creation deposit, the resolver authority, and the
//! await/retry policy for computation jobs.
//!
//! Sources, later ones winning:
//! 1. compiled defaults
//! 2. a TOML file (`Config::load`)
//! 3. `ESCROW_*` environment variables (after `.env` is loaded)

use crate::address::Address;
use crate::confidential::retry::{AwaitPolicy, BackoffKind, RetryPolicy};
use crate::ledger::Amount;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Basis-point denominator.
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub settlement: SettlementConfig,
    pub computation: ComputationConfig,
}

/// Settlement engine parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Protocol fee on the winnings portion of a payout, in basis points.
    pub fee_bps: u16,
    /// Deposit the creator pays into the vault float when creating a market.
    pub creation_deposit: Amount,
    /// The only identity allowed to resolve markets.
    pub resolver_authority: Address,
    /// Maximum byte length of a market name.
    pub max_name_len: usize,
    /// Maximum byte length of a market description.
    pub max_description_len: usize,
    /// Maximum byte length of the reference token symbol.
    pub max_token_len: usize,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            fee_bps: 200, // 2%
            creation_deposit: 2_000_000,
            resolver_authority: Address::resolver_authority(&Address::default()),
            max_name_len: 32,
            max_description_len: 256,
            max_token_len: 10,
        }
    }
}

/// Computation job await policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputationConfig {
    /// Delay between status polls.
    #[serde(rename = "poll_interval_ms", with = "duration_serde")]
    pub poll_interval: Duration,
    /// Overall bound on one await call.
    #[serde(rename = "timeout_ms", with = "duration_serde")]
    pub timeout: Duration,
    /// Consecutive transient poll failures tolerated before giving up.
    pub max_attempts: u32,
    /// First retry delay after a transient poll failure.
    #[serde(rename = "initial_backoff_ms", with = "duration_serde")]
    pub initial_backoff: Duration,
    /// Whether the retry delay is held or doubled.
    pub backoff: BackoffKind,
    /// Cap on the retry delay.
    #[serde(rename = "max_backoff_ms", with = "duration_serde")]
    pub max_backoff: Duration,
}

impl Default for ComputationConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(120),
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            backoff: BackoffKind::Exponential,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl ComputationConfig {
    /// Await policy derived from this configuration.
    pub fn await_policy(&self) -> AwaitPolicy {
        AwaitPolicy {
            poll_interval: self.poll_interval,
            timeout: self.timeout,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                initial_delay: self.initial_backoff,
                backoff: self.backoff,
                max_delay: self.max_backoff,
            },
        }
    }
}

impl Config {
    /// Parse a TOML document; missing fields keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw).context("Failed to parse configuration TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then apply environment overrides (reads `.env` if
    /// present).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let _ = dotenv::dotenv();
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config =
            toml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))?;
        config.apply_env_overrides()?;
        config.validate()?;
        info!(
            path = %path.display(),
            fee_bps = config.settlement.fee_bps,
            resolver = %config.settlement.resolver_authority.short(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Defaults plus environment overrides (reads `.env` if present).
    pub fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();
        let mut config = Config::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ESCROW_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_parse::<u16>("ESCROW_FEE_BPS")? {
            self.settlement.fee_bps = v;
        }
        if let Some(v) = env_parse::<u64>("ESCROW_CREATION_DEPOSIT")? {
            self.settlement.creation_deposit = v;
        }
        if let Ok(raw) = env::var("ESCROW_RESOLVER_AUTHORITY") {
            self.settlement.resolver_authority = raw
                .parse()
                .context("ESCROW_RESOLVER_AUTHORITY is not a 32-byte hex address")?;
        }
        if let Some(ms) = env_parse::<u64>("ESCROW_POLL_INTERVAL_MS")? {
            self.computation.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("ESCROW_JOB_TIMEOUT_MS")? {
            self.computation.timeout = Duration::from_millis(ms);
        }
        Ok(())
    }

    /// Reject configurations the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        if u64::from(self.settlement.fee_bps) > BPS_DENOMINATOR {
            bail!(
                "fee_bps must be <= {}, got {}",
                BPS_DENOMINATOR,
                self.settlement.fee_bps
            );
        }
        if self.computation.poll_interval.is_zero() {
            bail!("poll_interval_ms must be positive");
        }
        if self.computation.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.computation.timeout < self.computation.poll_interval {
            bail!("timeout_ms must not be shorter than poll_interval_ms");
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => {
            let parsed = raw
                .trim()
                .parse::<T>()
                .map_err(|_| anyhow::anyhow!("{} has invalid value {:?}", key, raw))?;
            debug!(key, "Environment override applied");
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}

// Serde helper for Duration (milliseconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.settlement.fee_bps, 200);
        assert_eq!(config.computation.max_attempts, 5);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let raw = r#"
            [settlement]
            fee_bps = 150

            [computation]
            poll_interval_ms = 250
            backoff = "fixed"
        "#;
        let config = Config::from_toml_str(raw).unwrap();
        assert_eq!(config.settlement.fee_bps, 150);
        assert_eq!(config.settlement.max_name_len, 32);
        assert_eq!(config.computation.poll_interval, Duration::from_millis(250));
        assert_eq!(config.computation.backoff, BackoffKind::Fixed);
        assert_eq!(config.computation.timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_rejects_fee_above_denominator() {
        let raw = "[settlement]\nfee_bps = 10001\n";
        assert!(Config::from_toml_str(raw).is_err());
    }

    #[test]
    fn test_rejects_timeout_shorter_than_poll() {
        let raw = "[computation]\npoll_interval_ms = 1000\ntimeout_ms = 10\n";
        assert!(Config::from_toml_str(raw).is_err());
    }

    #[test]
    fn test_load_from_file_with_resolver() {
        let resolver = Address::random();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[settlement]\nresolver_authority = \"{}\"\ncreation_deposit = 5",
            resolver.to_hex()
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.settlement.resolver_authority, resolver);
        assert_eq!(config.settlement.creation_deposit, 5);
    }

    #[test]
    fn test_await_policy_mapping() {
        let config = ComputationConfig::default();
        let policy = config.await_policy();
        assert_eq!(policy.poll_interval, config.poll_interval);
        assert_eq!(policy.retry.max_attempts, config.max_attempts);
        assert_eq!(policy.retry.backoff, BackoffKind::Exponential);
    }
}
