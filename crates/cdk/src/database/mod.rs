//! Wallet database
//!
//! Persistence capability the wallet engine needs. Implementations must make
//! [`WalletDatabase::reserve_proofs`], [`WalletDatabase::commit_operation`] and
//! [`WalletDatabase::update_proofs`] atomic: either every row changes or none does.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::amount::Amount;
use crate::mint_url::MintUrl;
use crate::nuts::{
    CurrencyUnit, Id, KeySet, KeySetInfo, Keys, MeltQuoteState, MintQuoteState, PublicKey,
    SpendingConditions, State,
};
use crate::state::InvalidTransition;
use crate::types::ProofInfo;
use crate::wallet::types::{
    MeltQuote, MintQuote, Transaction, TransactionDirection, TransactionId, WalletSaga,
};

mod memory;

pub use memory::WalletMemoryDatabase;

/// Database Error
#[derive(Debug, Error)]
pub enum Error {
    /// Proof is not in the store
    #[error("Proof not found")]
    ProofNotFound,
    /// Proof is already in the store
    #[error("Proof `{0}` already stored")]
    DuplicateProof(PublicKey),
    /// Quote is not in the store
    #[error("Unknown quote `{0}`")]
    UnknownQuote(String),
    /// No proofs were reserved under the operation
    #[error("Unknown operation `{0}`")]
    UnknownOperation(Uuid),
    /// Operation was already committed with a different outcome
    #[error("Operation `{0}` already committed as `{1}`")]
    OperationCommitted(Uuid, State),
    /// Row change rejected by the state machine
    #[error(transparent)]
    InvalidStateTransition(#[from] InvalidTransition),
    /// Keyset derivation counter would wrap
    #[error("Counter of keyset `{0}` overflowed")]
    CounterOverflow(Id),
    /// Saga is not in the store
    #[error("Unknown saga `{0}`")]
    UnknownSaga(Uuid),
    /// Serde Error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// Backend error
    #[error("Database: {0}")]
    Internal(String),
}

/// Shared handle to a wallet database
pub type DynWalletDatabase = Arc<dyn WalletDatabase + Send + Sync>;

/// Wallet Database trait
#[async_trait]
pub trait WalletDatabase: Debug {
    /// Add mint keysets to storage
    async fn add_mint_keysets(
        &self,
        mint_url: MintUrl,
        keysets: Vec<KeySetInfo>,
    ) -> Result<(), Error>;
    /// Get mint keysets for mint url
    async fn get_mint_keysets(&self, mint_url: MintUrl) -> Result<Option<Vec<KeySetInfo>>, Error>;
    /// Get mint keyset by id
    async fn get_keyset_by_id(&self, keyset_id: &Id) -> Result<Option<KeySetInfo>, Error>;

    /// Add mint quote to storage
    async fn add_mint_quote(&self, quote: MintQuote) -> Result<(), Error>;
    /// Get mint quote from storage
    async fn get_mint_quote(&self, quote_id: &str) -> Result<Option<MintQuote>, Error>;
    /// Get mint quotes from storage
    async fn get_mint_quotes(&self) -> Result<Vec<MintQuote>, Error>;
    /// Remove mint quote from storage
    async fn remove_mint_quote(&self, quote_id: &str) -> Result<(), Error>;
    /// Move a stored mint quote to `state`, recording `amount` if none is stored yet
    ///
    /// The transition is checked against the stored row inside the write, so a writer holding
    /// an older copy cannot move the quote backwards. Returns the stored quote after the change.
    async fn transition_mint_quote(
        &self,
        quote_id: &str,
        state: MintQuoteState,
        amount: Option<Amount>,
    ) -> Result<MintQuote, Error>;

    /// Add melt quote to storage
    async fn add_melt_quote(&self, quote: MeltQuote) -> Result<(), Error>;
    /// Get melt quote from storage
    async fn get_melt_quote(&self, quote_id: &str) -> Result<Option<MeltQuote>, Error>;
    /// Get melt quotes from storage
    async fn get_melt_quotes(&self) -> Result<Vec<MeltQuote>, Error>;
    /// Remove melt quote from storage
    async fn remove_melt_quote(&self, quote_id: &str) -> Result<(), Error>;
    /// Move a stored melt quote to `state`, recording `payment_preimage` if none is stored yet
    async fn transition_melt_quote(
        &self,
        quote_id: &str,
        state: MeltQuoteState,
        payment_preimage: Option<String>,
    ) -> Result<MeltQuote, Error>;

    /// Add [`Keys`] to storage
    async fn add_keys(&self, keyset: KeySet) -> Result<(), Error>;
    /// Get [`Keys`] from storage
    async fn get_keys(&self, id: &Id) -> Result<Option<Keys>, Error>;
    /// Remove [`Keys`] from storage
    async fn remove_keys(&self, id: &Id) -> Result<(), Error>;

    /// Advance the derivation counter of a keyset by `count`, returning the new value
    async fn increment_keyset_counter(&self, keyset_id: &Id, count: u32) -> Result<u32, Error>;
    /// Current derivation counter of a keyset, `0` if never used
    async fn get_keyset_counter(&self, keyset_id: &Id) -> Result<u32, Error>;

    /// Add and remove proofs in one atomic step
    async fn update_proofs(
        &self,
        added: Vec<ProofInfo>,
        removed_ys: Vec<PublicKey>,
    ) -> Result<(), Error>;
    /// Insert proofs the store does not hold yet
    ///
    /// Fails with [`Error::DuplicateProof`] without inserting anything if any `y` is already
    /// stored.
    async fn add_new_proofs(&self, proofs: Vec<ProofInfo>) -> Result<(), Error>;
    /// Get proofs from storage
    async fn get_proofs(
        &self,
        mint_url: Option<MintUrl>,
        unit: Option<CurrencyUnit>,
        state: Option<Vec<State>>,
        spending_conditions: Option<Vec<SpendingConditions>>,
    ) -> Result<Vec<ProofInfo>, Error>;
    /// Get proofs by their ys
    async fn get_proofs_by_ys(&self, ys: Vec<PublicKey>) -> Result<Vec<ProofInfo>, Error>;
    /// Move proofs to a state, validating every transition before changing any row
    async fn update_proofs_state(&self, ys: Vec<PublicKey>, state: State) -> Result<(), Error>;

    /// Mark proofs `PENDING` under an operation
    ///
    /// Fails without changing anything if a proof is unknown or cannot move to `PENDING`.
    async fn reserve_proofs(&self, ys: Vec<PublicKey>, operation_id: &Uuid) -> Result<(), Error>;
    /// Proofs currently held by an operation
    async fn get_reserved_proofs(&self, operation_id: &Uuid) -> Result<Vec<ProofInfo>, Error>;
    /// Resolve every proof held by an operation to `outcome`
    ///
    /// `outcome` is `SPENT`, `UNSPENT` or `PENDING_SPENT`. Repeating a commit with the same
    /// outcome is a no-op; a different outcome fails with [`Error::OperationCommitted`]; an
    /// operation that never reserved anything fails with [`Error::UnknownOperation`].
    async fn commit_operation(
        &self,
        operation_id: &Uuid,
        outcome: State,
    ) -> Result<Vec<PublicKey>, Error>;

    /// Add transaction to storage
    async fn add_transaction(&self, transaction: Transaction) -> Result<(), Error>;
    /// Get transaction from storage
    async fn get_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<Transaction>, Error>;
    /// List transactions from storage
    async fn list_transactions(
        &self,
        mint_url: Option<MintUrl>,
        direction: Option<TransactionDirection>,
        unit: Option<CurrencyUnit>,
    ) -> Result<Vec<Transaction>, Error>;

    /// Add saga record
    async fn add_saga(&self, saga: WalletSaga) -> Result<(), Error>;
    /// Get saga record
    async fn get_saga(&self, id: &Uuid) -> Result<Option<WalletSaga>, Error>;
    /// Replace a saga record if `saga.version` is exactly one ahead of the stored version
    ///
    /// Returns `false` on a version conflict.
    async fn update_saga(&self, saga: WalletSaga) -> Result<bool, Error>;
    /// Delete saga record
    ///
    /// Bookkeeping of the saga's operation is dropped too once no proof is held by it.
    async fn delete_saga(&self, id: &Uuid) -> Result<(), Error>;
    /// Saga records left behind by operations that did not finish
    async fn get_incomplete_sagas(&self) -> Result<Vec<WalletSaga>, Error>;
}
