use std::sync::Arc;

use crate::amount::DenominationPolicy;
use crate::config::WalletConfig;
use crate::database::DynWalletDatabase;
use crate::mint_url::MintUrl;
use crate::nuts::CurrencyUnit;
use crate::wallet::{
    Denominations, KeysetCache, MintConnector, ProofStore, QuoteLocks, SubscriptionHub, Wallet,
};
use crate::Error;

/// Builder for creating a new [`Wallet`]
#[derive(Debug, Default)]
pub struct WalletBuilder {
    mint_url: Option<MintUrl>,
    unit: Option<CurrencyUnit>,
    localstore: Option<DynWalletDatabase>,
    client: Option<Arc<dyn MintConnector + Send + Sync>>,
    config: WalletConfig,
    keyset_cache: Option<Arc<KeysetCache>>,
    denominations: Denominations,
    seed: Option<[u8; 64]>,
}

impl WalletBuilder {
    /// Create a new WalletBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the mint URL
    pub fn mint_url(mut self, mint_url: MintUrl) -> Self {
        self.mint_url = Some(mint_url);
        self
    }

    /// Set the currency unit
    pub fn unit(mut self, unit: CurrencyUnit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Set the local storage backend
    pub fn localstore(mut self, localstore: DynWalletDatabase) -> Self {
        self.localstore = Some(localstore);
        self
    }

    /// Set the seed output secrets are derived from
    pub fn seed(mut self, seed: [u8; 64]) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the mint connector
    pub fn client(mut self, client: Arc<dyn MintConnector + Send + Sync>) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the configuration
    pub fn config(mut self, config: WalletConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a keyset cache with other wallets
    pub fn keyset_cache(mut self, keyset_cache: Arc<KeysetCache>) -> Self {
        self.keyset_cache = Some(keyset_cache);
        self
    }

    /// Split amounts over the denominations the mint has keys for
    pub fn mint_denominations(mut self) -> Self {
        self.denominations = Denominations::MintAdvertised;
        self
    }

    /// Use a custom denomination policy
    pub fn denomination_policy(mut self, policy: Arc<dyn DenominationPolicy>) -> Self {
        self.denominations = Denominations::Custom(policy);
        self
    }

    /// Build the wallet
    pub fn build(self) -> Result<Wallet, Error> {
        let mint_url = self
            .mint_url
            .ok_or(Error::Custom("Mint url required".to_string()))?;
        let unit = self
            .unit
            .ok_or(Error::Custom("Unit required".to_string()))?;
        let localstore = self
            .localstore
            .ok_or(Error::Custom("Localstore required".to_string()))?;
        let client = self
            .client
            .ok_or(Error::Custom("Mint connector required".to_string()))?;
        let seed = self
            .seed
            .ok_or(Error::Custom("Seed required".to_string()))?;

        Ok(Wallet {
            mint_url,
            unit,
            localstore,
            client,
            config: self.config,
            keyset_cache: self.keyset_cache.unwrap_or_default(),
            proof_store: ProofStore::default(),
            quote_locks: QuoteLocks::default(),
            subscriptions: SubscriptionHub::new(),
            denominations: self.denominations,
            seed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::WalletMemoryDatabase;
    use crate::wallet::test_utils::{MockMintConnector, MINT_URL};

    #[test]
    fn test_missing_fields() {
        let err = WalletBuilder::new().unit(CurrencyUnit::Sat).build().unwrap_err();
        assert!(err.to_string().contains("Mint url required"));
    }

    #[test]
    fn test_seed_required() {
        let err = WalletBuilder::new()
            .mint_url(MINT_URL.parse().unwrap())
            .unit(CurrencyUnit::Sat)
            .localstore(Arc::new(WalletMemoryDatabase::new()))
            .client(Arc::new(MockMintConnector::default()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Seed required"));
    }
}
