//! Issue saga
//!
//! ```text
//! IssueSaga<Initial>
//!   └─> prepare() -> IssueSaga<Prepared>
//!         └─> execute() -> Proofs
//! ```
//!
//! The quote is claimed and checked paid, outputs are created and written with the record
//! (`SecretsPrepared`). The record moves to `MintRequested` right before the request, so a lost
//! response can be recovered by asking the mint to restore the outputs.

use tracing::instrument;
use uuid::Uuid;

use self::compensation::DiscardIssueRecord;
use crate::amount::SplitTarget;
use crate::dhke::construct_proofs;
use crate::nuts::{
    BlindSignature, MintQuoteState, MintRequest, PreMintSecrets, Proofs, SpendingConditions,
};
use crate::state::mint_quote_transition;
use crate::wallet::retry::with_timeout;
use crate::wallet::saga::{
    add_compensation, advance_saga, clear_compensations, execute_compensations,
    new_compensations, Compensations,
};
use crate::wallet::types::{IssueSagaState, OperationData, WalletSaga, WalletSagaState};
use crate::wallet::{MintQuote, QuoteGuard};
use crate::{Amount, Error, Wallet};

pub mod compensation;

/// Nothing done yet
pub struct Initial {
    operation_id: Uuid,
}

/// Quote claimed and paid, outputs recorded
pub struct Prepared {
    saga: WalletSaga,
    quote: MintQuote,
    outputs: PreMintSecrets,
    _quote_guard: QuoteGuard,
}

/// Issue saga
pub struct IssueSaga<S> {
    wallet: Wallet,
    compensations: Compensations,
    state_data: S,
}

impl IssueSaga<Initial> {
    /// Create a new issue saga
    pub fn new(wallet: Wallet) -> Self {
        Self {
            wallet,
            compensations: new_compensations(),
            state_data: Initial {
                operation_id: Uuid::new_v4(),
            },
        }
    }

    /// Claim the quote, make sure it is paid and create the outputs
    ///
    /// Fails with [`Error::QuoteNotPaid`] when the mint has not seen the payment and with
    /// [`Error::AmountMismatch`] when `split_target` does not add up to the quote amount. An open
    /// amount quote takes the amount the mint reports for it, failing with
    /// [`Error::AmountUndefined`] if the mint reports none. None of these leave anything behind.
    #[instrument(skip_all)]
    pub async fn prepare(
        self,
        quote_id: &str,
        split_target: SplitTarget,
        spending_conditions: Option<SpendingConditions>,
    ) -> Result<IssueSaga<Prepared>, Error> {
        let operation_id = self.state_data.operation_id;

        let quote_guard = self.wallet.quote_locks.claim(quote_id)?;

        let mut quote = self
            .wallet
            .localstore
            .get_mint_quote(quote_id)
            .await?
            .ok_or(Error::UnknownQuote)?;

        // ISSUED quotes cannot be minted again
        mint_quote_transition(quote.state, MintQuoteState::Paid)?;

        if quote.state != MintQuoteState::Paid || quote.amount.is_none() {
            quote = self.wallet.mint_quote_state(quote_id).await?;
        }
        if quote.state != MintQuoteState::Paid {
            tracing::debug!("Mint quote {} is {}", quote_id, quote.state);
            return Err(Error::QuoteNotPaid);
        }

        let amount = quote.amount.ok_or(Error::AmountUndefined)?;

        let active_keyset = self.wallet.get_active_keyset().await?;
        let keys = self.wallet.load_keyset_keys(active_keyset.id).await?;
        let policy = self.wallet.denomination_policy(&keys)?;
        let amounts = amount.split_targeted(&split_target, policy.as_ref())?;

        let outputs = match &spending_conditions {
            Some(conditions) => {
                PreMintSecrets::with_conditions(active_keyset.id, &amounts, conditions)?
            }
            None => self.wallet.derive_outputs(active_keyset.id, &amounts).await?,
        };

        tracing::info!(
            "Issuing {} for quote {} in {} outputs with operation {}",
            amount,
            quote_id,
            outputs.len(),
            operation_id
        );

        let saga = WalletSaga::new(
            operation_id,
            WalletSagaState::Issue(IssueSagaState::SecretsPrepared),
            amount,
            self.wallet.mint_url.clone(),
            self.wallet.unit.clone(),
            OperationData::Issue {
                quote_id: quote_id.to_string(),
                amount,
                outputs: Some(outputs.clone()),
            },
        );
        self.wallet.localstore.add_saga(saga.clone()).await?;

        add_compensation(
            &self.compensations,
            Box::new(DiscardIssueRecord {
                wallet: self.wallet.clone(),
                quote_id: quote_id.to_string(),
                operation_id,
            }),
        )
        .await;

        Ok(IssueSaga {
            wallet: self.wallet,
            compensations: self.compensations,
            state_data: Prepared {
                saga,
                quote,
                outputs,
                _quote_guard: quote_guard,
            },
        })
    }
}

impl IssueSaga<Prepared> {
    /// Request signatures and store the new proofs
    #[instrument(skip_all)]
    pub async fn execute(self) -> Result<Proofs, Error> {
        let Prepared {
            mut saga,
            quote,
            outputs,
            _quote_guard,
        } = self.state_data;
        let operation_id = saga.id;
        let amount = saga.amount;

        if let Err(err) = advance_saga(
            &self.wallet.localstore,
            &mut saga,
            WalletSagaState::Issue(IssueSagaState::MintRequested),
            OperationData::Issue {
                quote_id: quote.id.clone(),
                amount,
                outputs: Some(outputs.clone()),
            },
        )
        .await
        {
            execute_compensations(&self.compensations).await?;
            return Err(err);
        }

        let request = MintRequest {
            quote: quote.id.clone(),
            outputs: outputs.blinded_messages(),
        };

        let result = with_timeout(
            self.wallet.config.mint_timeout(),
            self.wallet.client.post_mint(request),
        )
        .await;

        let proofs = match result {
            Ok(response) => match unblind(&self.wallet, &outputs, response.signatures).await {
                Ok(proofs) => proofs,
                Err(err) => {
                    tracing::error!("Mint signatures for quote {} rejected: {}", quote.id, err);
                    execute_compensations(&self.compensations).await?;
                    return Err(err);
                }
            },
            Err(err) if err.is_retriable() => {
                tracing::warn!(
                    "Issue {} outcome unknown ({}), restoring outputs",
                    operation_id,
                    err
                );

                match self.wallet.restore_outputs(&outputs).await {
                    Ok(restored) if !restored.is_empty() => restored,
                    Ok(_) => {
                        execute_compensations(&self.compensations).await?;
                        return Err(err);
                    }
                    Err(restore_err) => {
                        clear_compensations(&self.compensations).await;
                        tracing::warn!(
                            "Could not restore outputs of issue {}: {}. Left for recovery.",
                            operation_id,
                            restore_err
                        );
                        return Err(err);
                    }
                }
            }
            Err(err) => {
                tracing::warn!("Issue {} failed: {}", operation_id, err);
                execute_compensations(&self.compensations).await?;
                return Err(err);
            }
        };

        clear_compensations(&self.compensations).await;

        self.wallet
            .finalize_issue(operation_id, &quote.id, proofs)
            .await
    }
}

/// Check the mint's signatures against the outputs and unblind them
async fn unblind(
    wallet: &Wallet,
    outputs: &PreMintSecrets,
    signatures: Vec<BlindSignature>,
) -> Result<Proofs, Error> {
    if signatures.len() != outputs.len() {
        return Err(Error::InvalidSignature(format!(
            "expected {} signatures, got {}",
            outputs.len(),
            signatures.len()
        )));
    }

    for (signature, premint) in signatures.iter().zip(outputs.iter()) {
        if signature.keyset_id != outputs.keyset_id || signature.amount != premint.amount {
            return Err(Error::InvalidSignature(format!(
                "signature for {} in keyset {} does not match output of {}",
                signature.amount, signature.keyset_id, premint.amount
            )));
        }
    }

    let keys = wallet.load_keyset_keys(outputs.keyset_id).await?;

    let proofs = construct_proofs(signatures, outputs.rs(), outputs.secrets(), &keys)?;

    let total = Amount::try_sum(proofs.iter().map(|p| p.amount))?;
    tracing::debug!("Unblinded {} proofs worth {}", proofs.len(), total);

    Ok(proofs)
}
