//! Cashu Wallet
//!
//! Each wallet is single mint and single unit

use std::collections::HashSet;
use std::fmt::Debug;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tracing::instrument;

use crate::amount::{DenominationPolicy, KeysetDenominations, PowerOfTwo};
use crate::config::WalletConfig;
use crate::database::DynWalletDatabase;
use crate::mint_url::MintUrl;
use crate::nuts::{CurrencyUnit, Keys, ProofState, PublicKey, State};
use crate::{Amount, Error};

mod builder;
pub mod client;
mod issue;
mod keysets;
mod melt;
mod multi_mint_wallet;
mod proofs;
mod quotes;
mod receive;
pub mod recovery;
pub mod retry;
mod restore;
pub(crate) mod saga;
pub mod seed;
mod send;
pub mod subscription;
mod swap;
#[cfg(test)]
pub(crate) mod test_utils;
pub mod types;

pub use builder::WalletBuilder;
pub use client::MintConnector;
pub use keysets::KeysetCache;
pub use melt::PreparedMelt;
pub use multi_mint_wallet::{MultiMintWallet, WalletKey};
pub use proofs::{select_proofs, ProofStore};
pub use quotes::QuoteStatus;
pub use receive::ReceiveOptions;
pub use recovery::RecoveryReport;
pub use send::{split_proofs_for_send, PreparedSend, SendKind, SendMemo, SendOptions};
pub use subscription::{ActiveSubscription, NotificationPayload, SubscriptionHub};
pub use types::{MeltQuote, MintQuote, Transaction, TransactionDirection, TransactionId};

/// Where output denominations come from when no split target is given
#[derive(Debug, Clone, Default)]
pub enum Denominations {
    /// Binary decomposition
    #[default]
    PowerOfTwo,
    /// Greedy decomposition over the amounts the active keyset has keys for
    MintAdvertised,
    /// Custom policy
    Custom(Arc<dyn DenominationPolicy>),
}

/// Quotes claimed by a running operation
#[derive(Debug, Clone, Default)]
pub(crate) struct QuoteLocks {
    claimed: Arc<Mutex<HashSet<String>>>,
}

impl QuoteLocks {
    /// Claim a quote for the lifetime of the returned guard
    pub(crate) fn claim(&self, quote_id: &str) -> Result<QuoteGuard, Error> {
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());

        if !claimed.insert(quote_id.to_string()) {
            return Err(Error::QuoteInUse(quote_id.to_string()));
        }

        Ok(QuoteGuard {
            claimed: self.claimed.clone(),
            quote_id: quote_id.to_string(),
        })
    }
}

/// Releases a quote claim on drop
#[derive(Debug)]
pub(crate) struct QuoteGuard {
    claimed: Arc<Mutex<HashSet<String>>>,
    quote_id: String,
}

impl Drop for QuoteGuard {
    fn drop(&mut self) {
        self.claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.quote_id);
    }
}

/// Cashu Wallet
///
/// Cheap to clone; clones share the localstore, keyset cache, selection lock and
/// subscriptions.
#[derive(Debug, Clone)]
pub struct Wallet {
    /// Mint Url
    pub mint_url: MintUrl,
    /// Unit
    pub unit: CurrencyUnit,
    /// Storage backend
    pub localstore: DynWalletDatabase,
    /// Mint connector
    pub client: Arc<dyn MintConnector + Send + Sync>,
    /// Configuration
    pub config: WalletConfig,
    pub(crate) keyset_cache: Arc<KeysetCache>,
    pub(crate) proof_store: ProofStore,
    pub(crate) quote_locks: QuoteLocks,
    pub(crate) subscriptions: SubscriptionHub,
    pub(crate) denominations: Denominations,
    pub(crate) seed: [u8; 64],
}

impl Wallet {
    /// Create new [`Wallet`] with default settings
    ///
    /// Use [`WalletBuilder`] to share a keyset cache or change the configuration. `seed` is the
    /// BIP39 seed every output secret is derived from, see [`seed::mnemonic_to_seed`].
    pub fn new(
        mint_url: &str,
        unit: CurrencyUnit,
        localstore: DynWalletDatabase,
        seed: [u8; 64],
        client: Arc<dyn MintConnector + Send + Sync>,
    ) -> Result<Self, Error> {
        WalletBuilder::new()
            .mint_url(mint_url.parse()?)
            .unit(unit)
            .localstore(localstore)
            .seed(seed)
            .client(client)
            .build()
    }

    /// Total unspent balance of wallet
    #[instrument(skip(self))]
    pub async fn total_balance(&self) -> Result<Amount, Error> {
        self.balance_in_states(vec![State::Unspent]).await
    }

    /// Total balance held by running operations or handed out in tokens
    #[instrument(skip(self))]
    pub async fn total_pending_balance(&self) -> Result<Amount, Error> {
        self.balance_in_states(vec![State::Pending, State::PendingSpent])
            .await
    }

    async fn balance_in_states(&self, states: Vec<State>) -> Result<Amount, Error> {
        let proofs = self
            .localstore
            .get_proofs(
                Some(self.mint_url.clone()),
                Some(self.unit.clone()),
                Some(states),
                None,
            )
            .await?;

        Ok(Amount::try_sum(proofs.iter().map(|p| p.proof.amount))?)
    }

    /// List transactions of this wallet
    #[instrument(skip(self))]
    pub async fn list_transactions(
        &self,
        direction: Option<TransactionDirection>,
    ) -> Result<Vec<Transaction>, Error> {
        Ok(self
            .localstore
            .list_transactions(
                Some(self.mint_url.clone()),
                direction,
                Some(self.unit.clone()),
            )
            .await?)
    }

    /// Get transaction by id
    pub async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, Error> {
        Ok(self.localstore.get_transaction(id).await?)
    }

    /// Denomination policy for outputs of a keyset
    pub(crate) fn denomination_policy(&self, keys: &Keys) -> Result<Arc<dyn DenominationPolicy>, Error> {
        Ok(match &self.denominations {
            Denominations::PowerOfTwo => Arc::new(PowerOfTwo),
            Denominations::MintAdvertised => Arc::new(KeysetDenominations::new(keys.amounts())?),
            Denominations::Custom(policy) => policy.clone(),
        })
    }

    /// Read-only mint call with the configured timeout and retry policy
    pub(crate) async fn read_call<T, F, Fut>(&self, name: &str, call: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        retry::retry_read(&self.config.retry, self.config.read_timeout(), name, call).await
    }

    /// Publish a proof state change to subscriptions
    pub(crate) fn notify_proof_states(&self, ys: &[PublicKey], state: State) {
        for y in ys {
            self.subscriptions
                .publish(NotificationPayload::ProofState(ProofState {
                    y: *y,
                    state,
                    witness: None,
                }));
        }
    }

    /// Publish a mint quote change to subscriptions
    pub(crate) fn notify_mint_quote(&self, quote: &MintQuote) {
        self.subscriptions
            .publish(NotificationPayload::MintQuoteUpdate(quote.clone()));
    }

    /// Publish a melt quote change to subscriptions
    pub(crate) fn notify_melt_quote(&self, quote: &MeltQuote) {
        self.subscriptions
            .publish(NotificationPayload::MeltQuoteUpdate(quote.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_claim_is_exclusive() {
        let locks = QuoteLocks::default();

        let guard = locks.claim("quote").unwrap();
        assert!(matches!(locks.claim("quote"), Err(Error::QuoteInUse(_))));
        assert!(locks.claim("other").is_ok());

        drop(guard);
        assert!(locks.claim("quote").is_ok());
    }
}
