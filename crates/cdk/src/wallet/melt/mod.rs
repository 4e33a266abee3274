//! Melt
//!
//! Pays a melt quote with proofs. Use [`Wallet::prepare_melt`] to reserve inputs and see the
//! fees, then [`PreparedMelt::confirm`] or [`PreparedMelt::cancel`]. [`Wallet::melt`] does both.

use std::collections::HashSet;
use std::fmt::Debug;

use tracing::instrument;
use uuid::Uuid;

use crate::dhke::construct_proofs;
use crate::nuts::{BlindSignature, MeltQuoteState, PreMintSecrets, Proofs, ProofsMethods, State};
use crate::types::{Melted, ProofInfo};
use crate::util::unix_time;
use crate::wallet::saga::finish_saga;
use crate::wallet::types::{
    MeltSagaState, Metadata, OperationData, Transaction, TransactionDirection, WalletSaga,
    WalletSagaState,
};
use crate::wallet::MeltQuote;
use crate::{Amount, Error, Wallet};

pub(crate) mod saga;

use saga::state::Prepared;
use saga::MeltSaga;

/// Prepared melt
///
/// Holds the quote and the reserved inputs until [`confirm`](Self::confirm) or
/// [`cancel`](Self::cancel). The quote cannot be melted by anyone else meanwhile.
pub struct PreparedMelt {
    saga: MeltSaga<Prepared>,
}

impl PreparedMelt {
    /// Operation ID for this prepared melt
    pub fn operation_id(&self) -> Uuid {
        self.saga.operation_id()
    }

    /// The melt quote
    pub fn quote(&self) -> &MeltQuote {
        self.saga.quote()
    }

    /// Amount to pay
    pub fn amount(&self) -> Amount {
        self.saga.quote().amount
    }

    /// Fee reserve of the quote
    pub fn fee_reserve(&self) -> Amount {
        self.saga.quote().fee_reserve
    }

    /// Reserved inputs
    pub fn proofs(&self) -> &Proofs {
        self.saga.proofs()
    }

    /// Fee the mint charges to spend the inputs
    pub fn input_fee(&self) -> Amount {
        self.saga.input_fee()
    }

    /// Pay the quote
    pub async fn confirm(self) -> Result<Melted, Error> {
        self.saga.confirm().await
    }

    /// Release the inputs and the quote
    pub async fn cancel(self) -> Result<(), Error> {
        self.saga.cancel().await
    }
}

impl Debug for PreparedMelt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedMelt")
            .field("operation_id", &self.operation_id())
            .field("quote_id", &self.quote().id)
            .field("amount", &self.amount())
            .field("fee_reserve", &self.fee_reserve())
            .field(
                "proofs",
                &self.proofs().iter().map(|p| p.amount).collect::<Vec<_>>(),
            )
            .field("input_fee", &self.input_fee())
            .finish()
    }
}

/// How a melt left in flight was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MeltResolution {
    /// The operation no longer holds any proofs
    NothingHeld,
    /// The mint paid the quote
    Paid(Melted),
    /// The payment is still in flight
    Pending,
    /// The payment failed or was never sent, inputs are unspent again
    Released,
}

impl Wallet {
    /// Prepare a melt
    ///
    /// Claims the quote and reserves inputs covering amount, fee reserve and input fee.
    ///
    /// # Example
    /// ```no_run
    /// # use cdk::wallet::Wallet;
    /// # async fn example(wallet: &Wallet) -> Result<(), Box<dyn std::error::Error>> {
    /// let quote = wallet.melt_quote("lnbc100n1...".to_string(), None).await?;
    /// let prepared = wallet.prepare_melt(&quote.id, Default::default()).await?;
    /// println!("Input fee: {}", prepared.input_fee());
    /// let melted = prepared.confirm().await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip(self, metadata), err)]
    pub async fn prepare_melt(
        &self,
        quote_id: &str,
        metadata: Metadata,
    ) -> Result<PreparedMelt, Error> {
        let quote = self
            .localstore
            .get_melt_quote(quote_id)
            .await?
            .ok_or(Error::UnknownQuote)?;
        if quote.mint_url != self.mint_url || quote.unit != self.unit {
            return Err(Error::UnknownQuote);
        }

        let saga = MeltSaga::new(self.clone())
            .prepare(quote_id, metadata)
            .await?;

        Ok(PreparedMelt { saga })
    }

    /// Melt
    ///
    /// On success the inputs are `SPENT` and the quote `PAID`, on failure the inputs are
    /// `UNSPENT` and the quote `UNPAID`. A payment the mint reports in flight is returned with
    /// state `PENDING`; [`check_pending_melt_quotes`](Self::check_pending_melt_quotes)
    /// settles it later. A paid melt whose change cannot be verified or restored yet returns
    /// that error with the quote `PAID` and the inputs still reserved; the change is restored
    /// by the same check or by recovery.
    #[instrument(skip(self), err)]
    pub async fn melt(&self, quote_id: &str) -> Result<Melted, Error> {
        self.melt_with_metadata(quote_id, Metadata::new()).await
    }

    /// Melt, storing `metadata` with the transaction
    #[instrument(skip(self, metadata), err)]
    pub async fn melt_with_metadata(
        &self,
        quote_id: &str,
        metadata: Metadata,
    ) -> Result<Melted, Error> {
        self.prepare_melt(quote_id, metadata).await?.confirm().await
    }

    /// Settle melts the mint reported as in flight
    ///
    /// Paid melts are finalized and returned, failed ones release their inputs. Pending quotes
    /// without a running melt only get their state refreshed.
    #[instrument(skip(self))]
    pub async fn check_pending_melt_quotes(&self) -> Result<Vec<Melted>, Error> {
        let sagas: Vec<WalletSaga> = self
            .localstore
            .get_incomplete_sagas()
            .await?
            .into_iter()
            .filter(|s| {
                s.mint_url == self.mint_url
                    && s.unit == self.unit
                    && s.state == WalletSagaState::Melt(MeltSagaState::MeltRequested)
            })
            .collect();

        let mut settled = Vec::new();
        let mut handled = HashSet::new();

        for saga in sagas {
            if let OperationData::Melt { quote_id, .. } = &saga.data {
                handled.insert(quote_id.clone());
            }

            match self.resolve_melt_saga(&saga).await {
                Ok(MeltResolution::Paid(melted)) => settled.push(melted),
                Ok(resolution) => {
                    tracing::debug!("Melt {} resolved as {:?}", saga.id, resolution)
                }
                Err(Error::QuoteInUse(quote_id)) => {
                    tracing::debug!("Quote {} is being melted, skipping", quote_id)
                }
                Err(e) => tracing::warn!("Could not settle melt {}: {}", saga.id, e),
            }
        }

        for quote in self.get_pending_melt_quotes().await? {
            if handled.contains(&quote.id) {
                continue;
            }

            if let Err(e) = self.melt_quote_status(&quote.id).await {
                tracing::warn!("Could not check melt quote {}: {}", quote.id, e);
            }
        }

        Ok(settled)
    }

    /// Settle a melt saga against the mint's view of its quote
    pub(crate) async fn resolve_melt_saga(&self, saga: &WalletSaga) -> Result<MeltResolution, Error> {
        let OperationData::Melt {
            quote_id,
            change_outputs,
            ..
        } = &saga.data
        else {
            return Err(Error::Custom(format!("Saga {} is not a melt", saga.id)));
        };

        let _quote_guard = self.quote_locks.claim(quote_id)?;

        let held = self.localstore.get_reserved_proofs(&saga.id).await?;
        if held.is_empty() {
            finish_saga(&self.localstore, &saga.id).await;
            return Ok(MeltResolution::NothingHeld);
        }

        // Nothing was sent before the record reached MeltRequested
        if saga.state == WalletSagaState::Melt(MeltSagaState::ProofsReserved) {
            self.commit_operation(saga.id, State::Unspent).await?;
            finish_saga(&self.localstore, &saga.id).await;
            return Ok(MeltResolution::Released);
        }

        let quote = self.melt_quote_status(quote_id).await?;

        match quote.state {
            MeltQuoteState::Paid => {
                let change = match change_outputs {
                    Some(outputs) => self.restore_outputs(outputs).await?,
                    None => Proofs::new(),
                };
                let inputs: Proofs = held.into_iter().map(|p| p.proof).collect();
                let preimage = quote.payment_preimage.clone();

                let melted = self
                    .finalize_melt(saga.id, quote, inputs, change, preimage, Metadata::new())
                    .await?;

                Ok(MeltResolution::Paid(melted))
            }
            MeltQuoteState::Pending => Ok(MeltResolution::Pending),
            MeltQuoteState::Unpaid => {
                self.commit_operation(saga.id, State::Unspent).await?;
                finish_saga(&self.localstore, &saga.id).await;

                tracing::info!("Melt {} was not paid, inputs released", saga.id);

                Ok(MeltResolution::Released)
            }
        }
    }

    /// Record a paid melt
    ///
    /// Change is stored unspent, the inputs are committed `SPENT` and the quote moves to
    /// `PAID`.
    pub(crate) async fn finalize_melt(
        &self,
        operation_id: Uuid,
        quote: MeltQuote,
        inputs: Proofs,
        change: Proofs,
        payment_preimage: Option<String>,
        metadata: Metadata,
    ) -> Result<Melted, Error> {
        if !change.is_empty() {
            let added = change
                .iter()
                .cloned()
                .map(|p| ProofInfo::new(p, self.mint_url.clone(), State::Unspent, self.unit.clone()))
                .collect::<Result<Vec<_>, _>>()?;
            let change_ys: Vec<_> = added.iter().map(|p| p.y).collect();

            self.localstore.update_proofs(added, vec![]).await?;
            self.notify_proof_states(&change_ys, State::Unspent);
        }

        self.commit_operation(operation_id, State::Spent).await?;

        let quote = self
            .set_melt_quote_state(&quote.id, MeltQuoteState::Paid, payment_preimage)
            .await?;

        let melted = Melted::from_proofs(
            MeltQuoteState::Paid,
            quote.payment_preimage.clone(),
            quote.amount,
            inputs.clone(),
            (!change.is_empty()).then_some(change),
        )?;

        let transaction = Transaction {
            mint_url: self.mint_url.clone(),
            direction: TransactionDirection::Outgoing,
            amount: quote.amount,
            fee: melted.fee_paid,
            unit: self.unit.clone(),
            ys: inputs.ys()?,
            timestamp: unix_time(),
            memo: None,
            metadata,
            quote_id: Some(quote.id.clone()),
        };
        if let Err(e) = self.localstore.add_transaction(transaction).await {
            tracing::warn!("Failed to record melt {}: {}", operation_id, e);
        }

        finish_saga(&self.localstore, &operation_id).await;

        tracing::info!(
            "Melt {} paid quote {}, fee {}",
            operation_id,
            quote.id,
            melted.fee_paid
        );

        Ok(melted)
    }

    /// Unblind the change the mint returned on blank outputs
    ///
    /// The mint signs a prefix of the outputs.
    pub(crate) async fn change_from_signatures(
        &self,
        outputs: &PreMintSecrets,
        signatures: Vec<BlindSignature>,
    ) -> Result<Proofs, Error> {
        if signatures.is_empty() {
            return Ok(Proofs::new());
        }

        self.unblind_change(outputs, signatures).await
    }

    /// Record a melt the mint paid but whose change is not in hand yet
    ///
    /// The inputs stay reserved and the saga stays at `MeltRequested`, so
    /// [`Wallet::check_pending_melt_quotes`] or recovery restores the change later. Returns
    /// `err` for the caller to surface.
    pub(crate) async fn leave_paid_melt(
        &self,
        operation_id: Uuid,
        quote_id: &str,
        payment_preimage: Option<String>,
        err: Error,
    ) -> Error {
        tracing::error!(
            "Melt {} paid but its change is missing ({}). Left for recovery.",
            operation_id,
            err
        );

        if let Err(e) = self
            .set_melt_quote_state(quote_id, MeltQuoteState::Paid, payment_preimage)
            .await
        {
            tracing::warn!("Could not record quote {} as paid: {}", quote_id, e);
        }

        err
    }

    async fn unblind_change(
        &self,
        outputs: &PreMintSecrets,
        signatures: Vec<BlindSignature>,
    ) -> Result<Proofs, Error> {
        if signatures.len() > outputs.len() {
            return Err(Error::InvalidSignature(format!(
                "{} change signatures for {} outputs",
                signatures.len(),
                outputs.len()
            )));
        }

        if let Some(signature) = signatures
            .iter()
            .find(|s| s.keyset_id != outputs.keyset_id)
        {
            return Err(Error::InvalidSignature(format!(
                "change signed with keyset {}, expected {}",
                signature.keyset_id, outputs.keyset_id
            )));
        }

        let count = signatures.len();
        let rs = outputs.rs().into_iter().take(count).collect();
        let secrets = outputs.secrets().into_iter().take(count).collect();

        let keys = self.load_keyset_keys(outputs.keyset_id).await?;

        Ok(construct_proofs(signatures, rs, secrets, &keys)?)
    }
}
