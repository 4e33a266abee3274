//! Melt saga
//!
//! ```text
//! MeltSaga<Initial>
//!   └─> prepare() -> MeltSaga<Prepared>
//!         ├─> confirm() -> Melted
//!         └─> cancel()
//! ```
//!
//! The quote is claimed for the lifetime of the prepared saga. The record is written before
//! inputs are reserved (`ProofsReserved`) and advanced to `MeltRequested` with the blank change
//! outputs before the quote is marked `PENDING` and the request is sent. A payment the mint
//! reports as in flight leaves the record and the reserved inputs in place for
//! [`Wallet::check_pending_melt_quotes`](crate::Wallet::check_pending_melt_quotes). So does a
//! paid melt whose change could not be verified or restored: the quote is recorded `PAID` and
//! the change is restored from the recorded outputs on the next check or recovery run.

use tracing::instrument;
use uuid::Uuid;

use self::compensation::RevertMeltQuote;
use self::state::{Initial, Prepared};
use crate::nuts::{MeltQuoteState, MeltRequest, PreMintSecrets, Proofs, ProofsMethods};
use crate::types::Melted;
use crate::util::unix_time;
use crate::wallet::retry::with_timeout;
use crate::wallet::saga::{
    add_compensation, advance_saga, clear_compensations, execute_compensations, finish_saga,
    new_compensations, Compensations, ReleaseReservation,
};
use crate::wallet::types::{
    MeltSagaState, Metadata, OperationData, WalletSaga, WalletSagaState,
};
use crate::wallet::MeltQuote;
use crate::{Amount, Error, Wallet};

pub mod compensation;
pub mod state;

/// Melt saga
pub struct MeltSaga<S> {
    wallet: Wallet,
    compensations: Compensations,
    state_data: S,
}

impl MeltSaga<Initial> {
    /// Create a new melt saga
    pub fn new(wallet: Wallet) -> Self {
        Self {
            wallet,
            compensations: new_compensations(),
            state_data: Initial {
                operation_id: Uuid::new_v4(),
            },
        }
    }

    /// Claim the quote and reserve inputs covering amount, fee reserve and input fee
    #[instrument(skip_all)]
    pub async fn prepare(
        self,
        quote_id: &str,
        metadata: Metadata,
    ) -> Result<MeltSaga<Prepared>, Error> {
        let operation_id = self.state_data.operation_id;

        let quote_guard = self.wallet.quote_locks.claim(quote_id)?;

        let quote = self
            .wallet
            .localstore
            .get_melt_quote(quote_id)
            .await?
            .ok_or(Error::UnknownQuote)?;

        let now = unix_time();
        if quote.expiry != 0 && quote.expiry <= now {
            return Err(Error::ExpiredQuote(quote.expiry, now));
        }

        if quote.state != MeltQuoteState::Unpaid {
            return Err(Error::Custom(format!(
                "Melt quote {} is {}, expected UNPAID",
                quote.id, quote.state
            )));
        }

        let inputs_needed = quote.inputs_needed()?;

        tracing::info!(
            "Preparing melt of quote {} ({} + reserve {}) with operation {}",
            quote.id,
            quote.amount,
            quote.fee_reserve,
            operation_id
        );

        let saga = WalletSaga::new(
            operation_id,
            WalletSagaState::Melt(MeltSagaState::ProofsReserved),
            quote.amount,
            self.wallet.mint_url.clone(),
            self.wallet.unit.clone(),
            OperationData::Melt {
                quote_id: quote.id.clone(),
                amount: quote.amount,
                fee_reserve: quote.fee_reserve,
                change_outputs: None,
            },
        );
        self.wallet.localstore.add_saga(saga.clone()).await?;

        let proofs = match self
            .wallet
            .reserve_proofs_for(inputs_needed, true, operation_id, None)
            .await
        {
            Ok(proofs) => proofs,
            Err(err) => {
                finish_saga(&self.wallet.localstore, &operation_id).await;
                return Err(err);
            }
        };

        add_compensation(
            &self.compensations,
            Box::new(ReleaseReservation {
                wallet: self.wallet.clone(),
                operation_id,
            }),
        )
        .await;

        let input_fee = match self.wallet.get_proofs_fee(&proofs).await {
            Ok(fee) => fee.total,
            Err(err) => {
                execute_compensations(&self.compensations).await?;
                return Err(err);
            }
        };

        Ok(MeltSaga {
            wallet: self.wallet,
            compensations: self.compensations,
            state_data: Prepared {
                saga,
                quote,
                proofs,
                input_fee,
                metadata,
                quote_guard,
            },
        })
    }
}

impl MeltSaga<Prepared> {
    /// Operation id
    pub fn operation_id(&self) -> Uuid {
        self.state_data.saga.id
    }

    /// The melt quote
    pub fn quote(&self) -> &MeltQuote {
        &self.state_data.quote
    }

    /// Reserved inputs
    pub fn proofs(&self) -> &Proofs {
        &self.state_data.proofs
    }

    /// Input fee of the reserved proofs
    pub fn input_fee(&self) -> Amount {
        self.state_data.input_fee
    }

    /// Pay the quote
    ///
    /// Blank outputs cover everything the inputs hold beyond amount and input fee, so an
    /// unused fee reserve and any overshoot of the selection come back as change.
    #[instrument(skip_all)]
    pub async fn confirm(self) -> Result<Melted, Error> {
        let Prepared {
            mut saga,
            quote,
            proofs,
            input_fee,
            metadata,
            quote_guard,
        } = self.state_data;
        let operation_id = saga.id;

        tracing::info!("Confirming melt {} for quote {}", operation_id, quote.id);

        let change_outputs = match change_outputs(&self.wallet, &quote, &proofs, input_fee).await {
            Ok(outputs) => outputs,
            Err(err) => {
                execute_compensations(&self.compensations).await?;
                return Err(err);
            }
        };

        if let Err(err) = advance_saga(
            &self.wallet.localstore,
            &mut saga,
            WalletSagaState::Melt(MeltSagaState::MeltRequested),
            OperationData::Melt {
                quote_id: quote.id.clone(),
                amount: quote.amount,
                fee_reserve: quote.fee_reserve,
                change_outputs: Some(change_outputs.clone()),
            },
        )
        .await
        {
            execute_compensations(&self.compensations).await?;
            return Err(err);
        }

        let quote = match self
            .wallet
            .set_melt_quote_state(&quote.id, MeltQuoteState::Pending, None)
            .await
        {
            Ok(quote) => quote,
            Err(err) => {
                execute_compensations(&self.compensations).await?;
                return Err(err);
            }
        };
        add_compensation(
            &self.compensations,
            Box::new(RevertMeltQuote {
                wallet: self.wallet.clone(),
                quote_id: quote.id.clone(),
            }),
        )
        .await;

        let request = MeltRequest {
            quote: quote.id.clone(),
            inputs: proofs.clone(),
            outputs: (!change_outputs.is_empty()).then(|| change_outputs.blinded_messages()),
        };

        let result = with_timeout(
            self.wallet.config.melt_timeout(),
            self.wallet.client.post_melt(request),
        )
        .await;

        let melted = match result {
            Ok(response) => match response.state {
                MeltQuoteState::Paid => {
                    clear_compensations(&self.compensations).await;

                    let change = match self
                        .wallet
                        .change_from_signatures(&change_outputs, response.change.unwrap_or_default())
                        .await
                    {
                        Ok(change) => change,
                        Err(err) => {
                            return Err(self
                                .wallet
                                .leave_paid_melt(operation_id, &quote.id, response.payment_preimage, err)
                                .await)
                        }
                    };

                    self.wallet
                        .finalize_melt(
                            operation_id,
                            quote,
                            proofs,
                            change,
                            response.payment_preimage,
                            metadata,
                        )
                        .await?
                }
                MeltQuoteState::Pending => {
                    clear_compensations(&self.compensations).await;
                    tracing::info!(
                        "Melt {} is pending at the mint, left for check_pending_melt_quotes",
                        operation_id
                    );
                    pending_melted(&quote)
                }
                MeltQuoteState::Unpaid => {
                    tracing::warn!("Mint did not pay quote {}", quote.id);
                    execute_compensations(&self.compensations).await?;
                    return Err(Error::ProtocolError(format!(
                        "payment for quote {} failed",
                        quote.id
                    )));
                }
            },
            Err(err) if err.is_retriable() => {
                tracing::warn!(
                    "Melt {} outcome unknown ({}), checking with the mint",
                    operation_id,
                    err
                );

                match self.wallet.melt_quote_status(&quote.id).await {
                    Ok(current) if current.state == MeltQuoteState::Paid => {
                        clear_compensations(&self.compensations).await;

                        let preimage = current.payment_preimage.clone();
                        let change = match self.wallet.restore_outputs(&change_outputs).await {
                            Ok(change) => change,
                            Err(restore_err) => {
                                return Err(self
                                    .wallet
                                    .leave_paid_melt(operation_id, &current.id, preimage, restore_err)
                                    .await)
                            }
                        };
                        self.wallet
                            .finalize_melt(operation_id, current, proofs, change, preimage, metadata)
                            .await?
                    }
                    Ok(current) if current.state == MeltQuoteState::Pending => {
                        clear_compensations(&self.compensations).await;
                        pending_melted(&current)
                    }
                    Ok(_) => {
                        execute_compensations(&self.compensations).await?;
                        return Err(err);
                    }
                    Err(check_err) => {
                        clear_compensations(&self.compensations).await;
                        tracing::warn!(
                            "Could not reach mint to settle melt {}: {}. Left for recovery.",
                            operation_id,
                            check_err
                        );
                        return Err(err);
                    }
                }
            }
            Err(err) => {
                tracing::warn!("Melt {} failed: {}", operation_id, err);
                execute_compensations(&self.compensations).await?;
                return Err(err);
            }
        };

        drop(quote_guard);

        Ok(melted)
    }

    /// Release the reserved inputs and the quote
    #[instrument(skip_all)]
    pub async fn cancel(self) -> Result<(), Error> {
        tracing::info!("Cancelling melt {}", self.state_data.saga.id);

        execute_compensations(&self.compensations).await
    }
}

/// Blank outputs for the change of a melt
///
/// Blanks cover everything the inputs hold beyond amount and input fee.
async fn change_outputs(
    wallet: &Wallet,
    quote: &MeltQuote,
    proofs: &Proofs,
    input_fee: Amount,
) -> Result<PreMintSecrets, Error> {
    let active_keyset = wallet.get_active_keyset().await?;

    let spendable = proofs.total_amount()?.saturating_sub(input_fee);
    let max_change = spendable.saturating_sub(quote.amount);

    if max_change == Amount::ZERO {
        return Ok(PreMintSecrets::new(active_keyset.id));
    }

    wallet
        .derive_blank_outputs(active_keyset.id, max_change)
        .await
}

/// Result for a payment still in flight
fn pending_melted(quote: &MeltQuote) -> Melted {
    Melted {
        state: MeltQuoteState::Pending,
        preimage: None,
        change: None,
        amount: quote.amount,
        fee_paid: Amount::ZERO,
    }
}
