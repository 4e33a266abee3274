//! MultiMint Wallet
//!
//! Wrapper around core [`Wallet`] that holds one wallet per mint and unit pair. The wallets
//! share a localstore and a keyset cache.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::instrument;

use super::melt::PreparedMelt;
use super::receive::ReceiveOptions;
use super::recovery::RecoveryReport;
use super::send::{PreparedSend, SendOptions};
use super::{KeysetCache, MintConnector, WalletBuilder};
use crate::amount::SplitTarget;
use crate::config::WalletConfig;
use crate::database::DynWalletDatabase;
use crate::mint_url::MintUrl;
use crate::nuts::{CurrencyUnit, MeltOptions, Proofs, SpendingConditions, Token};
use crate::types::Melted;
use crate::wallet::types::{MeltQuote, MintQuote, Transaction, TransactionDirection};
use crate::{Amount, Error, Wallet};

/// Mint and unit pair a wallet serves
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WalletKey {
    /// Mint Url
    pub mint_url: MintUrl,
    /// Unit
    pub unit: CurrencyUnit,
}

impl WalletKey {
    /// Create new [`WalletKey`]
    pub fn new(mint_url: MintUrl, unit: CurrencyUnit) -> Self {
        Self { mint_url, unit }
    }
}

impl fmt::Display for WalletKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mint_url: {}, unit: {}", self.mint_url, self.unit)
    }
}

/// Multi Mint Wallet
#[derive(Debug, Clone)]
pub struct MultiMintWallet {
    /// Storage backend
    pub localstore: DynWalletDatabase,
    seed: [u8; 64],
    config: WalletConfig,
    keyset_cache: Arc<KeysetCache>,
    wallets: Arc<RwLock<BTreeMap<WalletKey, Wallet>>>,
}

impl MultiMintWallet {
    /// Create a new [`MultiMintWallet`] without wallets
    ///
    /// Every wallet it creates derives its outputs from `seed`.
    pub fn new(localstore: DynWalletDatabase, seed: [u8; 64], config: WalletConfig) -> Self {
        Self {
            localstore,
            seed,
            config,
            keyset_cache: Arc::new(KeysetCache::new()),
            wallets: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Create a wallet for `mint_url` and `unit` and add it
    ///
    /// The wallet uses the shared localstore, seed, keyset cache and configuration. An existing
    /// wallet for the same pair is replaced.
    #[instrument(skip(self, client))]
    pub async fn create_and_add_wallet(
        &self,
        mint_url: MintUrl,
        unit: CurrencyUnit,
        client: Arc<dyn MintConnector + Send + Sync>,
    ) -> Result<Wallet, Error> {
        let wallet = WalletBuilder::new()
            .mint_url(mint_url)
            .unit(unit)
            .localstore(self.localstore.clone())
            .seed(self.seed)
            .client(client)
            .config(self.config.clone())
            .keyset_cache(self.keyset_cache.clone())
            .build()?;

        self.add_wallet(wallet.clone()).await;

        Ok(wallet)
    }

    /// Adds a [`Wallet`] to this [`MultiMintWallet`]
    #[instrument(skip(self, wallet))]
    pub async fn add_wallet(&self, wallet: Wallet) {
        let wallet_key = WalletKey::new(wallet.mint_url.clone(), wallet.unit.clone());

        self.wallets.write().await.insert(wallet_key, wallet);
    }

    /// Remove Wallet from MultiMintWallet
    #[instrument(skip(self))]
    pub async fn remove_wallet(&self, wallet_key: &WalletKey) {
        self.wallets.write().await.remove(wallet_key);
    }

    /// Get Wallets from MultiMintWallet
    pub async fn get_wallets(&self) -> Vec<Wallet> {
        self.wallets.read().await.values().cloned().collect()
    }

    /// Get Wallet from MultiMintWallet
    pub async fn get_wallet(&self, wallet_key: &WalletKey) -> Result<Wallet, Error> {
        self.wallets
            .read()
            .await
            .get(wallet_key)
            .cloned()
            .ok_or_else(|| Error::UnknownWallet(wallet_key.to_string()))
    }

    /// Check if mint unit pair is in wallet
    pub async fn has(&self, wallet_key: &WalletKey) -> bool {
        self.wallets.read().await.contains_key(wallet_key)
    }

    /// Unspent balance per mint for `unit`
    #[instrument(skip(self))]
    pub async fn get_balances(
        &self,
        unit: &CurrencyUnit,
    ) -> Result<BTreeMap<MintUrl, Amount>, Error> {
        let mut balances = BTreeMap::new();

        for wallet in self.wallets_for(unit).await {
            balances.insert(wallet.mint_url.clone(), wallet.total_balance().await?);
        }

        Ok(balances)
    }

    /// Total unspent balance across the wallets of `unit`
    #[instrument(skip(self))]
    pub async fn total_balance(&self, unit: &CurrencyUnit) -> Result<Amount, Error> {
        let mut total = Amount::ZERO;

        for wallet in self.wallets_for(unit).await {
            total = total
                .checked_add(wallet.total_balance().await?)
                .ok_or(Error::AmountOverflow)?;
        }

        Ok(total)
    }

    /// Restore every wallet from the seed, returning the total amount restored
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<Amount, Error> {
        let mut total = Amount::ZERO;

        for wallet in self.get_wallets().await {
            total = total
                .checked_add(wallet.restore().await?)
                .ok_or(Error::AmountOverflow)?;
        }

        Ok(total)
    }

    /// Transactions of every wallet, oldest first
    #[instrument(skip(self))]
    pub async fn list_transactions(
        &self,
        direction: Option<TransactionDirection>,
    ) -> Result<Vec<Transaction>, Error> {
        let mut transactions = Vec::new();

        for wallet in self.get_wallets().await {
            transactions.extend(wallet.list_transactions(direction).await?);
        }

        transactions.sort_by_key(|t| t.timestamp);

        Ok(transactions)
    }

    /// Prepare to send from the wallet of `wallet_key`
    #[instrument(skip(self))]
    pub async fn prepare_send(
        &self,
        wallet_key: &WalletKey,
        amount: Amount,
        opts: SendOptions,
    ) -> Result<PreparedSend, Error> {
        self.get_wallet(wallet_key)
            .await?
            .prepare_send(amount, opts)
            .await
    }

    /// Send from the first wallet of `unit` whose balance covers `amount`
    ///
    /// Sends are never split across mints.
    #[instrument(skip(self))]
    pub async fn send(
        &self,
        unit: &CurrencyUnit,
        amount: Amount,
        opts: SendOptions,
    ) -> Result<Token, Error> {
        for wallet in self.wallets_for(unit).await {
            if wallet.total_balance().await? >= amount {
                return wallet.send(amount, opts).await;
            }
        }

        Err(Error::InsufficientFunds)
    }

    /// Receive an encoded token with the wallet of its mint and unit
    ///
    /// The wallet must already be added.
    #[instrument(skip_all)]
    pub async fn receive(&self, encoded_token: &str, opts: ReceiveOptions) -> Result<Amount, Error> {
        let token = Token::decode(encoded_token)?;
        let wallet_key = WalletKey::new(token.mint_url.clone(), token.unit.clone());

        self.get_wallet(&wallet_key)
            .await?
            .receive_proofs(token.proofs, opts, token.memo)
            .await
    }

    /// Mint quote for wallet
    #[instrument(skip(self))]
    pub async fn mint_quote(
        &self,
        wallet_key: &WalletKey,
        amount: Option<Amount>,
        description: Option<String>,
    ) -> Result<MintQuote, Error> {
        self.get_wallet(wallet_key)
            .await?
            .mint_quote(amount, description)
            .await
    }

    /// Mint a specific quote
    #[instrument(skip(self, conditions))]
    pub async fn mint(
        &self,
        wallet_key: &WalletKey,
        quote_id: &str,
        conditions: Option<SpendingConditions>,
    ) -> Result<Proofs, Error> {
        self.get_wallet(wallet_key)
            .await?
            .mint(quote_id, SplitTarget::default(), conditions)
            .await
    }

    /// Mint every paid quote, per unit
    #[instrument(skip(self))]
    pub async fn check_all_mint_quotes(&self) -> Result<BTreeMap<CurrencyUnit, Amount>, Error> {
        let mut minted: BTreeMap<CurrencyUnit, Amount> = BTreeMap::new();

        for wallet in self.get_wallets().await {
            let amount = wallet.check_all_mint_quotes().await?;
            let entry = minted.entry(wallet.unit.clone()).or_default();
            *entry = entry.checked_add(amount).ok_or(Error::AmountOverflow)?;
        }

        Ok(minted)
    }

    /// Melt quote for wallet
    #[instrument(skip(self, request))]
    pub async fn melt_quote(
        &self,
        wallet_key: &WalletKey,
        request: String,
        options: Option<MeltOptions>,
    ) -> Result<MeltQuote, Error> {
        self.get_wallet(wallet_key)
            .await?
            .melt_quote(request, options)
            .await
    }

    /// Prepare a melt of a quote held by the wallet of `wallet_key`
    #[instrument(skip(self))]
    pub async fn prepare_melt(
        &self,
        wallet_key: &WalletKey,
        quote_id: &str,
    ) -> Result<PreparedMelt, Error> {
        self.get_wallet(wallet_key)
            .await?
            .prepare_melt(quote_id, Default::default())
            .await
    }

    /// Melt a quote held by the wallet of `wallet_key`
    #[instrument(skip(self))]
    pub async fn melt(&self, wallet_key: &WalletKey, quote_id: &str) -> Result<Melted, Error> {
        self.get_wallet(wallet_key).await?.melt(quote_id).await
    }

    /// Run crash recovery for every wallet and sum the reports
    #[instrument(skip(self))]
    pub async fn recover_incomplete_sagas(&self) -> Result<RecoveryReport, Error> {
        let mut total = RecoveryReport::default();

        for wallet in self.get_wallets().await {
            let report = wallet.recover_incomplete_sagas().await?;
            total.recovered += report.recovered;
            total.compensated += report.compensated;
            total.skipped += report.skipped;
            total.failed += report.failed;
        }

        Ok(total)
    }

    async fn wallets_for(&self, unit: &CurrencyUnit) -> Vec<Wallet> {
        self.wallets
            .read()
            .await
            .iter()
            .filter(|(key, _)| &key.unit == unit)
            .map(|(_, wallet)| wallet.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::WalletMemoryDatabase;
    use crate::nuts::{Id, Proof, SecretKey, State};
    use crate::secret::Secret;
    use crate::types::ProofInfo;
    use crate::wallet::test_utils::{MockMintConnector, TEST_SEED};

    fn mint_a() -> MintUrl {
        "https://a.example.com".parse().unwrap()
    }

    fn mint_b() -> MintUrl {
        "https://b.example.com".parse().unwrap()
    }

    async fn store_unspent(db: &DynWalletDatabase, mint_url: MintUrl, unit: CurrencyUnit, amount: u64) {
        let proof = Proof::new(
            Amount::from(amount),
            Id::from_bytes(&[0; 8]).unwrap(),
            Secret::generate(),
            SecretKey::generate().public_key(),
        );
        let info = ProofInfo::new(proof, mint_url, State::Unspent, unit).unwrap();
        db.update_proofs(vec![info], vec![]).await.unwrap();
    }

    async fn multi_mint() -> MultiMintWallet {
        let db: DynWalletDatabase = Arc::new(WalletMemoryDatabase::new());
        let multi = MultiMintWallet::new(db, TEST_SEED, WalletConfig::default());

        for (mint_url, unit) in [
            (mint_a(), CurrencyUnit::Sat),
            (mint_b(), CurrencyUnit::Sat),
            (mint_a(), CurrencyUnit::Usd),
        ] {
            multi
                .create_and_add_wallet(mint_url, unit, Arc::new(MockMintConnector::default()))
                .await
                .unwrap();
        }

        multi
    }

    #[tokio::test]
    async fn test_unknown_wallet() {
        let multi = multi_mint().await;

        let key = WalletKey::new(mint_b(), CurrencyUnit::Usd);
        assert!(!multi.has(&key).await);
        assert!(matches!(
            multi.get_wallet(&key).await,
            Err(Error::UnknownWallet(_))
        ));
    }

    #[tokio::test]
    async fn test_balances_per_unit() {
        let multi = multi_mint().await;

        store_unspent(&multi.localstore, mint_a(), CurrencyUnit::Sat, 8).await;
        store_unspent(&multi.localstore, mint_b(), CurrencyUnit::Sat, 4).await;
        store_unspent(&multi.localstore, mint_a(), CurrencyUnit::Usd, 100).await;

        let balances = multi.get_balances(&CurrencyUnit::Sat).await.unwrap();
        assert_eq!(balances.get(&mint_a()), Some(&Amount::from(8)));
        assert_eq!(balances.get(&mint_b()), Some(&Amount::from(4)));

        assert_eq!(
            multi.total_balance(&CurrencyUnit::Sat).await.unwrap(),
            Amount::from(12)
        );
        assert_eq!(
            multi.total_balance(&CurrencyUnit::Usd).await.unwrap(),
            Amount::from(100)
        );
    }

    #[tokio::test]
    async fn test_send_without_covering_wallet() {
        let multi = multi_mint().await;

        store_unspent(&multi.localstore, mint_a(), CurrencyUnit::Sat, 8).await;
        store_unspent(&multi.localstore, mint_b(), CurrencyUnit::Sat, 8).await;

        let result = multi
            .send(&CurrencyUnit::Sat, Amount::from(10), SendOptions::default())
            .await;

        assert!(matches!(result, Err(Error::InsufficientFunds)));
    }

    #[tokio::test]
    async fn test_transactions_merged_oldest_first() {
        let multi = multi_mint().await;

        for (mint_url, timestamp) in [(mint_b(), 20), (mint_a(), 10)] {
            multi
                .localstore
                .add_transaction(Transaction {
                    mint_url,
                    direction: TransactionDirection::Incoming,
                    amount: Amount::from(1),
                    fee: Amount::ZERO,
                    unit: CurrencyUnit::Sat,
                    ys: vec![SecretKey::generate().public_key()],
                    timestamp,
                    memo: None,
                    metadata: Default::default(),
                    quote_id: None,
                })
                .await
                .unwrap();
        }

        let transactions = multi.list_transactions(None).await.unwrap();

        let timestamps: Vec<u64> = transactions.iter().map(|t| t.timestamp).collect();
        assert_eq!(timestamps, vec![10, 20]);
    }
}
