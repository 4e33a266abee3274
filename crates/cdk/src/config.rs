//! Wallet configuration
//!
//! Defaults can be overridden from a TOML file and from `CDK_WALLET__*` environment
//! variables, e.g. `CDK_WALLET__RETRY__MAX_ATTEMPTS=5`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "CDK_WALLET";

/// Backoff for read-only mint calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Upper bound for a single delay
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (starting at 1)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Wallet configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Proofs of each denomination to keep around when creating change
    pub target_proof_count: usize,
    /// How long fetched keysets are considered fresh
    pub keyset_ttl_secs: u64,
    /// Timeout for read-only mint calls
    pub read_timeout_ms: u64,
    /// Timeout for mint requests
    pub mint_timeout_ms: u64,
    /// Timeout for melt requests
    pub melt_timeout_ms: u64,
    /// Timeout for swap requests
    pub swap_timeout_ms: u64,
    /// Default timeout of [`crate::wallet::ActiveSubscription::recv`]
    pub subscription_recv_timeout_ms: u64,
    /// Buffered notifications per subscription before the oldest is dropped
    pub subscription_capacity: usize,
    /// Interval between mint polls backing a subscription
    pub subscription_poll_interval_ms: u64,
    /// Retry policy for read-only calls
    pub retry: RetryPolicy,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            target_proof_count: 3,
            keyset_ttl_secs: 3_600,
            read_timeout_ms: 10_000,
            mint_timeout_ms: 30_000,
            melt_timeout_ms: 60_000,
            swap_timeout_ms: 30_000,
            subscription_recv_timeout_ms: 30_000,
            subscription_capacity: 64,
            subscription_poll_interval_ms: 1_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl WalletConfig {
    /// Load config from an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::new(&path.to_string_lossy(), config::FileFormat::Toml)
                    .required(false),
            );
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: WalletConfig = settings.try_deserialize()?;

        tracing::debug!("Loaded wallet config: {:?}", config);

        Ok(config)
    }

    /// Keyset cache TTL
    pub fn keyset_ttl(&self) -> Duration {
        Duration::from_secs(self.keyset_ttl_secs)
    }

    /// Read timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Mint timeout
    pub fn mint_timeout(&self) -> Duration {
        Duration::from_millis(self.mint_timeout_ms)
    }

    /// Melt timeout
    pub fn melt_timeout(&self) -> Duration {
        Duration::from_millis(self.melt_timeout_ms)
    }

    /// Swap timeout
    pub fn swap_timeout(&self) -> Duration {
        Duration::from_millis(self.swap_timeout_ms)
    }

    /// Subscription receive timeout
    pub fn subscription_recv_timeout(&self) -> Duration {
        Duration::from_millis(self.subscription_recv_timeout_ms)
    }

    /// Subscription poll interval
    pub fn subscription_poll_interval(&self) -> Duration {
        Duration::from_millis(self.subscription_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_retry_delay_is_bounded() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };

        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay(80), Duration::from_millis(1_000));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("cdk-wallet-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "target_proof_count = 5\nmelt_timeout_ms = 1234\n\n[retry]\nmax_attempts = 7"
        )
        .unwrap();

        let config = WalletConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.target_proof_count, 5);
        assert_eq!(config.melt_timeout(), Duration::from_millis(1234));
        assert_eq!(config.retry.max_attempts, 7);
        // Untouched keys keep their defaults
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.swap_timeout_ms, WalletConfig::default().swap_timeout_ms);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let path = std::env::temp_dir().join("cdk-wallet-does-not-exist.toml");
        let config = WalletConfig::load(Some(&path)).unwrap();
        assert_eq!(config, WalletConfig::default());
    }
}
