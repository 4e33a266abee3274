//! Keyset cache
//!
//! Keyset listings are cached per mint and refreshed once older than
//! [`WalletConfig::keyset_ttl`](crate::WalletConfig::keyset_ttl). Keys are loaded lazily,
//! checked against their id and kept in the localstore.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::instrument;

use super::retry::retry_read;
use super::Wallet;
use crate::mint_url::MintUrl;
use crate::nuts::{Id, KeySetInfo, KeySetInfosMethods, Keys};
use crate::Error;

#[derive(Debug, Clone)]
struct CachedKeysets {
    keysets: Vec<KeySetInfo>,
    fetched_at: Instant,
}

/// Keyset listings per mint, shared between wallets
#[derive(Debug, Default)]
pub struct KeysetCache {
    entries: RwLock<HashMap<MintUrl, CachedKeysets>>,
}

impl KeysetCache {
    /// Create empty [`KeysetCache`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached keysets of a mint, `None` when absent or older than `ttl`
    pub async fn get_fresh(&self, mint_url: &MintUrl, ttl: Duration) -> Option<Vec<KeySetInfo>> {
        let entries = self.entries.read().await;

        entries
            .get(mint_url)
            .filter(|cached| cached.fetched_at.elapsed() < ttl)
            .map(|cached| cached.keysets.clone())
    }

    /// Cached keyset of a mint regardless of age
    pub async fn find(&self, mint_url: &MintUrl, keyset_id: &Id) -> Option<KeySetInfo> {
        let entries = self.entries.read().await;

        entries
            .get(mint_url)
            .and_then(|cached| cached.keysets.iter().find(|k| &k.id == keyset_id))
            .cloned()
    }

    /// Replace the cached keysets of a mint
    pub async fn insert(&self, mint_url: MintUrl, keysets: Vec<KeySetInfo>) {
        self.entries.write().await.insert(
            mint_url,
            CachedKeysets {
                keysets,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Drop the cached keysets of a mint
    pub async fn invalidate(&self, mint_url: &MintUrl) {
        self.entries.write().await.remove(mint_url);
    }
}

impl Wallet {
    /// Get keysets of the mint, from cache while fresh
    #[instrument(skip(self))]
    pub async fn get_mint_keysets(&self) -> Result<Vec<KeySetInfo>, Error> {
        if let Some(keysets) = self
            .keyset_cache
            .get_fresh(&self.mint_url, self.config.keyset_ttl())
            .await
        {
            return Ok(keysets);
        }

        self.refresh_keysets().await
    }

    /// Fetch keysets from the mint
    ///
    /// Updates the localstore and cache and loads the keys of active keysets of the wallet
    /// unit. Failures are returned to the caller; a stale cache entry is not served instead.
    #[instrument(skip(self))]
    pub async fn refresh_keysets(&self) -> Result<Vec<KeySetInfo>, Error> {
        tracing::debug!("Refreshing keysets for {}", self.mint_url);

        let response = retry_read(
            &self.config.retry,
            self.config.read_timeout(),
            "get_mint_keysets",
            || self.client.get_mint_keysets(),
        )
        .await?;

        let keysets = response.keysets;

        self.localstore
            .add_mint_keysets(self.mint_url.clone(), keysets.clone())
            .await?;

        self.keyset_cache
            .insert(self.mint_url.clone(), keysets.clone())
            .await;

        for keyset in keysets.unit(self.unit.clone()).filter(|k| k.active) {
            self.load_keyset_keys(keyset.id).await?;
        }

        Ok(keysets)
    }

    /// Active keyset of the wallet unit with the lowest input fee
    #[instrument(skip(self))]
    pub async fn get_active_keyset(&self) -> Result<KeySetInfo, Error> {
        let keysets = self.get_mint_keysets().await?;

        if let Some(keyset) = lowest_fee_active(&keysets, self) {
            return Ok(keyset);
        }

        // Cached listing may predate a rotation
        let keysets = self.refresh_keysets().await?;

        if keysets.unit(self.unit.clone()).next().is_none() {
            return Err(Error::UnsupportedUnit(self.unit.clone()));
        }

        lowest_fee_active(&keysets, self).ok_or(Error::NoActiveKeyset)
    }

    /// Resolve a keyset of this mint, including inactive ones
    ///
    /// Looks in the cache, then the localstore, then asks the mint. Fails with
    /// [`Error::UnknownKeyset`] when the mint does not know the id either.
    #[instrument(skip(self))]
    pub async fn lookup_keyset(&self, keyset_id: &Id) -> Result<KeySetInfo, Error> {
        if let Some(keyset) = self.keyset_cache.find(&self.mint_url, keyset_id).await {
            return Ok(keyset);
        }

        if let Some(keysets) = self
            .localstore
            .get_mint_keysets(self.mint_url.clone())
            .await?
        {
            if let Some(keyset) = keysets.into_iter().find(|k| &k.id == keyset_id) {
                return Ok(keyset);
            }
        }

        self.refresh_keysets()
            .await?
            .into_iter()
            .find(|k| &k.id == keyset_id)
            .ok_or(Error::UnknownKeyset(*keyset_id))
    }

    /// Keys of a keyset, fetched and verified on first use
    #[instrument(skip(self))]
    pub async fn load_keyset_keys(&self, keyset_id: Id) -> Result<Keys, Error> {
        if let Some(keys) = self.localstore.get_keys(&keyset_id).await? {
            return Ok(keys);
        }

        let keyset = retry_read(
            &self.config.retry,
            self.config.read_timeout(),
            "get_mint_keyset",
            || self.client.get_mint_keyset(keyset_id),
        )
        .await?;

        keyset.verify_id()?;

        let keys = keyset.keys.clone();
        self.localstore.add_keys(keyset).await?;

        Ok(keys)
    }

    /// Input fee per keyset of this mint
    #[instrument(skip(self))]
    pub async fn get_keyset_fees(&self) -> Result<HashMap<Id, u64>, Error> {
        Ok(self
            .get_mint_keysets()
            .await?
            .into_iter()
            .map(|k| (k.id, k.input_fee_ppk))
            .collect())
    }

    /// Input fee of a keyset
    pub async fn get_keyset_fees_by_id(&self, keyset_id: Id) -> Result<u64, Error> {
        Ok(self.lookup_keyset(&keyset_id).await?.input_fee_ppk)
    }
}

fn lowest_fee_active(keysets: &[KeySetInfo], wallet: &Wallet) -> Option<KeySetInfo> {
    keysets
        .iter()
        .filter(|k| k.active && k.unit == wallet.unit)
        .min_by_key(|k| k.input_fee_ppk)
        .cloned()
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::nuts::CurrencyUnit;

    fn info(id: &str, active: bool) -> KeySetInfo {
        KeySetInfo {
            id: Id::from_str(id).unwrap(),
            unit: CurrencyUnit::Sat,
            active,
            input_fee_ppk: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires() {
        let cache = KeysetCache::new();
        let mint_url = MintUrl::from_str("https://mint.example.com").unwrap();
        let ttl = Duration::from_secs(60);

        assert!(cache.get_fresh(&mint_url, ttl).await.is_none());

        cache
            .insert(mint_url.clone(), vec![info("00916bbf7ef91a36", true)])
            .await;
        assert_eq!(cache.get_fresh(&mint_url, ttl).await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get_fresh(&mint_url, ttl).await.is_none());

        // Stale entries still resolve ids
        let id = Id::from_str("00916bbf7ef91a36").unwrap();
        assert!(cache.find(&mint_url, &id).await.is_some());

        cache.invalidate(&mint_url).await;
        assert!(cache.find(&mint_url, &id).await.is_none());
    }
}
