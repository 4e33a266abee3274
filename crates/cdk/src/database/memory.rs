//! Memory Database

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Error, WalletDatabase};
use crate::amount::Amount;
use crate::mint_url::MintUrl;
use crate::nuts::{
    CurrencyUnit, Id, KeySet, KeySetInfo, Keys, MeltQuoteState, MintQuoteState, PublicKey,
    SpendingConditions, State,
};
use crate::state::{
    melt_quote_transition, mint_quote_transition, proof_transition, InvalidTransition,
};
use crate::types::ProofInfo;
use crate::wallet::types::{
    MeltQuote, MintQuote, Transaction, TransactionDirection, TransactionId, WalletSaga,
};

/// Outcome of an operation once committed, with the proofs it resolved
#[derive(Debug, Clone)]
struct OperationRecord {
    ys: Vec<PublicKey>,
    outcome: Option<State>,
}

impl OperationRecord {
    fn open() -> Self {
        Self {
            ys: Vec::new(),
            outcome: None,
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    mint_keysets: HashMap<MintUrl, Vec<KeySetInfo>>,
    keysets: HashMap<Id, KeySetInfo>,
    keys: HashMap<Id, Keys>,
    keyset_counters: HashMap<Id, u32>,
    mint_quotes: HashMap<String, MintQuote>,
    melt_quotes: HashMap<String, MeltQuote>,
    proofs: HashMap<PublicKey, ProofInfo>,
    operations: HashMap<Uuid, OperationRecord>,
    transactions: HashMap<TransactionId, Transaction>,
    sagas: HashMap<Uuid, WalletSaga>,
}

/// Wallet in-memory database
///
/// All tables sit behind one lock so multi-row updates are atomic.
#[derive(Debug, Clone, Default)]
pub struct WalletMemoryDatabase {
    tables: Arc<RwLock<Tables>>,
}

impl WalletMemoryDatabase {
    /// Create new [`WalletMemoryDatabase`]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WalletDatabase for WalletMemoryDatabase {
    async fn add_mint_keysets(
        &self,
        mint_url: MintUrl,
        keysets: Vec<KeySetInfo>,
    ) -> Result<(), Error> {
        let mut tables = self.tables.write().await;

        let known = tables.mint_keysets.entry(mint_url).or_default();
        for keyset in keysets.iter() {
            match known.iter_mut().find(|k| k.id == keyset.id) {
                Some(existing) => *existing = keyset.clone(),
                None => known.push(keyset.clone()),
            }
        }

        for keyset in keysets {
            tables.keysets.insert(keyset.id, keyset);
        }

        Ok(())
    }

    async fn get_mint_keysets(&self, mint_url: MintUrl) -> Result<Option<Vec<KeySetInfo>>, Error> {
        Ok(self.tables.read().await.mint_keysets.get(&mint_url).cloned())
    }

    async fn get_keyset_by_id(&self, keyset_id: &Id) -> Result<Option<KeySetInfo>, Error> {
        Ok(self.tables.read().await.keysets.get(keyset_id).cloned())
    }

    async fn add_mint_quote(&self, quote: MintQuote) -> Result<(), Error> {
        self.tables
            .write()
            .await
            .mint_quotes
            .insert(quote.id.clone(), quote);
        Ok(())
    }

    async fn get_mint_quote(&self, quote_id: &str) -> Result<Option<MintQuote>, Error> {
        Ok(self.tables.read().await.mint_quotes.get(quote_id).cloned())
    }

    async fn get_mint_quotes(&self) -> Result<Vec<MintQuote>, Error> {
        Ok(self
            .tables
            .read()
            .await
            .mint_quotes
            .values()
            .cloned()
            .collect())
    }

    async fn remove_mint_quote(&self, quote_id: &str) -> Result<(), Error> {
        self.tables.write().await.mint_quotes.remove(quote_id);
        Ok(())
    }

    async fn transition_mint_quote(
        &self,
        quote_id: &str,
        state: MintQuoteState,
        amount: Option<Amount>,
    ) -> Result<MintQuote, Error> {
        let mut tables = self.tables.write().await;

        let quote = tables
            .mint_quotes
            .get_mut(quote_id)
            .ok_or_else(|| Error::UnknownQuote(quote_id.to_string()))?;

        let transition = mint_quote_transition(quote.state, state)?;
        quote.state = transition.to;
        if quote.amount.is_none() {
            quote.amount = amount;
        }

        Ok(quote.clone())
    }

    async fn add_melt_quote(&self, quote: MeltQuote) -> Result<(), Error> {
        self.tables
            .write()
            .await
            .melt_quotes
            .insert(quote.id.clone(), quote);
        Ok(())
    }

    async fn get_melt_quote(&self, quote_id: &str) -> Result<Option<MeltQuote>, Error> {
        Ok(self.tables.read().await.melt_quotes.get(quote_id).cloned())
    }

    async fn get_melt_quotes(&self) -> Result<Vec<MeltQuote>, Error> {
        Ok(self
            .tables
            .read()
            .await
            .melt_quotes
            .values()
            .cloned()
            .collect())
    }

    async fn remove_melt_quote(&self, quote_id: &str) -> Result<(), Error> {
        self.tables.write().await.melt_quotes.remove(quote_id);
        Ok(())
    }

    async fn transition_melt_quote(
        &self,
        quote_id: &str,
        state: MeltQuoteState,
        payment_preimage: Option<String>,
    ) -> Result<MeltQuote, Error> {
        let mut tables = self.tables.write().await;

        let quote = tables
            .melt_quotes
            .get_mut(quote_id)
            .ok_or_else(|| Error::UnknownQuote(quote_id.to_string()))?;

        let transition = melt_quote_transition(quote.state, state)?;
        quote.state = transition.to;
        if quote.payment_preimage.is_none() {
            quote.payment_preimage = payment_preimage;
        }

        Ok(quote.clone())
    }

    async fn add_keys(&self, keyset: KeySet) -> Result<(), Error> {
        self.tables.write().await.keys.insert(keyset.id, keyset.keys);
        Ok(())
    }

    async fn get_keys(&self, id: &Id) -> Result<Option<Keys>, Error> {
        Ok(self.tables.read().await.keys.get(id).cloned())
    }

    async fn remove_keys(&self, id: &Id) -> Result<(), Error> {
        self.tables.write().await.keys.remove(id);
        Ok(())
    }

    async fn increment_keyset_counter(&self, keyset_id: &Id, count: u32) -> Result<u32, Error> {
        let mut tables = self.tables.write().await;

        let counter = tables.keyset_counters.entry(*keyset_id).or_insert(0);
        *counter = counter
            .checked_add(count)
            .ok_or(Error::CounterOverflow(*keyset_id))?;

        Ok(*counter)
    }

    async fn get_keyset_counter(&self, keyset_id: &Id) -> Result<u32, Error> {
        Ok(self
            .tables
            .read()
            .await
            .keyset_counters
            .get(keyset_id)
            .copied()
            .unwrap_or(0))
    }

    async fn update_proofs(
        &self,
        added: Vec<ProofInfo>,
        removed_ys: Vec<PublicKey>,
    ) -> Result<(), Error> {
        let mut tables = self.tables.write().await;

        for proof in added {
            if let Some(operation_id) = proof.used_by_operation {
                tables
                    .operations
                    .entry(operation_id)
                    .or_insert_with(OperationRecord::open);
            }
            tables.proofs.insert(proof.y, proof);
        }

        for y in removed_ys {
            tables.proofs.remove(&y);
        }

        Ok(())
    }

    async fn add_new_proofs(&self, proofs: Vec<ProofInfo>) -> Result<(), Error> {
        let mut tables = self.tables.write().await;

        if let Some(duplicate) = proofs.iter().find(|p| tables.proofs.contains_key(&p.y)) {
            return Err(Error::DuplicateProof(duplicate.y));
        }

        for proof in proofs {
            if let Some(operation_id) = proof.used_by_operation {
                tables
                    .operations
                    .entry(operation_id)
                    .or_insert_with(OperationRecord::open);
            }
            tables.proofs.insert(proof.y, proof);
        }

        Ok(())
    }

    async fn get_proofs(
        &self,
        mint_url: Option<MintUrl>,
        unit: Option<CurrencyUnit>,
        state: Option<Vec<State>>,
        spending_conditions: Option<Vec<SpendingConditions>>,
    ) -> Result<Vec<ProofInfo>, Error> {
        let tables = self.tables.read().await;

        Ok(tables
            .proofs
            .values()
            .filter(|p| p.matches_conditions(&mint_url, &unit, &state, &spending_conditions))
            .cloned()
            .collect())
    }

    async fn get_proofs_by_ys(&self, ys: Vec<PublicKey>) -> Result<Vec<ProofInfo>, Error> {
        let tables = self.tables.read().await;

        ys.iter()
            .map(|y| tables.proofs.get(y).cloned().ok_or(Error::ProofNotFound))
            .collect()
    }

    async fn update_proofs_state(&self, ys: Vec<PublicKey>, state: State) -> Result<(), Error> {
        let mut tables = self.tables.write().await;

        for y in ys.iter() {
            let proof = tables.proofs.get(y).ok_or(Error::ProofNotFound)?;
            proof_transition(proof.state, state)?;
        }

        for y in ys.iter() {
            if let Some(proof) = tables.proofs.get_mut(y) {
                proof.state = state;
                if state != State::Pending {
                    proof.used_by_operation = None;
                }
            }
        }

        Ok(())
    }

    async fn reserve_proofs(&self, ys: Vec<PublicKey>, operation_id: &Uuid) -> Result<(), Error> {
        let mut tables = self.tables.write().await;

        for y in ys.iter() {
            let proof = tables.proofs.get(y).ok_or(Error::ProofNotFound)?;
            // Held by another operation
            if proof.state == State::Pending {
                return Err(InvalidTransition {
                    entity: "proof",
                    from: proof.state.to_string(),
                    to: State::Pending.to_string(),
                }
                .into());
            }
            proof_transition(proof.state, State::Pending)?;
        }

        for y in ys.iter() {
            if let Some(proof) = tables.proofs.get_mut(y) {
                proof.state = State::Pending;
                proof.used_by_operation = Some(*operation_id);
            }
        }

        tables
            .operations
            .insert(*operation_id, OperationRecord::open());

        Ok(())
    }

    async fn get_reserved_proofs(&self, operation_id: &Uuid) -> Result<Vec<ProofInfo>, Error> {
        let tables = self.tables.read().await;

        Ok(tables
            .proofs
            .values()
            .filter(|p| p.used_by_operation.as_ref() == Some(operation_id))
            .cloned()
            .collect())
    }

    async fn commit_operation(
        &self,
        operation_id: &Uuid,
        outcome: State,
    ) -> Result<Vec<PublicKey>, Error> {
        let mut tables = self.tables.write().await;

        let record = tables
            .operations
            .get(operation_id)
            .cloned()
            .ok_or(Error::UnknownOperation(*operation_id))?;

        match record.outcome {
            Some(committed) if committed == outcome => return Ok(record.ys),
            Some(committed) => return Err(Error::OperationCommitted(*operation_id, committed)),
            None => (),
        }

        // Proofs removed by a swap in the same operation no longer need resolving
        let held: Vec<PublicKey> = tables
            .proofs
            .values()
            .filter(|p| p.used_by_operation.as_ref() == Some(operation_id))
            .map(|p| p.y)
            .collect();

        for y in held.iter() {
            if let Some(proof) = tables.proofs.get(y) {
                proof_transition(proof.state, outcome)?;
            }
        }

        for y in held.iter() {
            if let Some(proof) = tables.proofs.get_mut(y) {
                proof.state = outcome;
                proof.used_by_operation = None;
            }
        }

        tables.operations.insert(
            *operation_id,
            OperationRecord {
                ys: held.clone(),
                outcome: Some(outcome),
            },
        );

        Ok(held)
    }

    async fn add_transaction(&self, transaction: Transaction) -> Result<(), Error> {
        let id = transaction
            .id()
            .map_err(|e| Error::Internal(e.to_string()))?;

        self.tables.write().await.transactions.insert(id, transaction);
        Ok(())
    }

    async fn get_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<Transaction>, Error> {
        Ok(self
            .tables
            .read()
            .await
            .transactions
            .get(&transaction_id)
            .cloned())
    }

    async fn list_transactions(
        &self,
        mint_url: Option<MintUrl>,
        direction: Option<TransactionDirection>,
        unit: Option<CurrencyUnit>,
    ) -> Result<Vec<Transaction>, Error> {
        let tables = self.tables.read().await;

        let mut transactions: Vec<Transaction> = tables
            .transactions
            .values()
            .filter(|t| t.matches_conditions(&mint_url, &direction, &unit))
            .cloned()
            .collect();

        transactions.sort_by_key(|t| t.timestamp);

        Ok(transactions)
    }

    async fn add_saga(&self, saga: WalletSaga) -> Result<(), Error> {
        self.tables.write().await.sagas.insert(saga.id, saga);
        Ok(())
    }

    async fn get_saga(&self, id: &Uuid) -> Result<Option<WalletSaga>, Error> {
        Ok(self.tables.read().await.sagas.get(id).cloned())
    }

    async fn update_saga(&self, saga: WalletSaga) -> Result<bool, Error> {
        let mut tables = self.tables.write().await;

        let stored = tables.sagas.get(&saga.id).ok_or(Error::UnknownSaga(saga.id))?;

        if stored.version + 1 != saga.version {
            return Ok(false);
        }

        tables.sagas.insert(saga.id, saga);
        Ok(true)
    }

    async fn delete_saga(&self, id: &Uuid) -> Result<(), Error> {
        let mut tables = self.tables.write().await;

        tables.sagas.remove(id);

        let still_held = tables
            .proofs
            .values()
            .any(|p| p.used_by_operation.as_ref() == Some(id));
        if !still_held {
            tables.operations.remove(id);
        }

        Ok(())
    }

    async fn get_incomplete_sagas(&self) -> Result<Vec<WalletSaga>, Error> {
        let tables = self.tables.read().await;

        let mut sagas: Vec<WalletSaga> = tables.sagas.values().cloned().collect();
        sagas.sort_by_key(|s| s.created_at);

        Ok(sagas)
    }
}
