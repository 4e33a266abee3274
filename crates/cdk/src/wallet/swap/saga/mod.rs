//! Swap saga
//!
//! ```text
//! SwapSaga<Initial>
//!   └─> reserve() -> SwapSaga<Reserved>
//!         └─> execute() -> SwapOutputs
//! ```
//!
//! The record moves `ProofsReserved` -> `SwapRequested` (outputs stored) and is deleted once
//! the outputs are stored.

use std::collections::HashSet;

use tracing::instrument;
use uuid::Uuid;

use crate::amount::SplitTarget;
use crate::nuts::{Proofs, ProofsMethods, SpendingConditions, State};
use crate::wallet::saga::{
    add_compensation, advance_saga, clear_compensations, execute_compensations, finish_saga,
    new_compensations, Compensations, ReleaseReservation,
};
use crate::wallet::swap::{PreSwap, SwapOutputs, SwapResolution};
use crate::wallet::types::{OperationData, SwapSagaState, WalletSaga, WalletSagaState};
use crate::{Amount, Error, Secret, Wallet};

/// No work done yet
pub struct Initial {
    operation_id: Uuid,
}

/// Inputs reserved and the record written
pub struct Reserved {
    saga: WalletSaga,
    input_amount: Amount,
    inputs: Proofs,
}

/// Swap saga
pub struct SwapSaga<S> {
    wallet: Wallet,
    compensations: Compensations,
    state_data: S,
}

impl SwapSaga<Initial> {
    /// Create a new swap saga
    pub fn new(wallet: Wallet) -> Self {
        Self {
            wallet,
            compensations: new_compensations(),
            state_data: Initial {
                operation_id: Uuid::new_v4(),
            },
        }
    }

    /// Reserve the inputs
    #[instrument(skip_all)]
    pub async fn reserve(self, inputs: Proofs) -> Result<SwapSaga<Reserved>, Error> {
        let operation_id = self.state_data.operation_id;
        let input_amount = inputs.total_amount()?;

        let saga = WalletSaga::new(
            operation_id,
            WalletSagaState::Swap(SwapSagaState::ProofsReserved),
            input_amount,
            self.wallet.mint_url.clone(),
            self.wallet.unit.clone(),
            OperationData::Swap {
                input_amount,
                outputs: None,
            },
        );
        self.wallet.localstore.add_saga(saga.clone()).await?;

        if let Err(err) = self
            .wallet
            .reserve_specific_proofs(&inputs, operation_id)
            .await
        {
            finish_saga(&self.wallet.localstore, &operation_id).await;
            return Err(err);
        }

        add_compensation(
            &self.compensations,
            Box::new(ReleaseReservation {
                wallet: self.wallet.clone(),
                operation_id,
            }),
        )
        .await;

        tracing::info!(
            "Swap {} reserved {} inputs worth {}",
            operation_id,
            inputs.len(),
            input_amount
        );

        Ok(SwapSaga {
            wallet: self.wallet,
            compensations: self.compensations,
            state_data: Reserved {
                saga,
                input_amount,
                inputs,
            },
        })
    }
}

impl SwapSaga<Reserved> {
    /// Request the swap and store the outputs
    ///
    /// A failure the mint reported releases the inputs. When the outcome is unknown the mint
    /// is asked what happened; if it cannot be reached the inputs stay reserved for recovery.
    #[instrument(skip_all)]
    pub async fn execute(
        self,
        amount: Option<Amount>,
        amount_split_target: SplitTarget,
        spending_conditions: Option<SpendingConditions>,
        include_fees: bool,
    ) -> Result<SwapOutputs, Error> {
        let Reserved {
            mut saga,
            input_amount,
            inputs,
        } = self.state_data;
        let operation_id = saga.id;

        let pre_swap = match prepare(
            &self.wallet,
            amount,
            amount_split_target,
            spending_conditions,
            include_fees,
            inputs,
        )
        .await
        {
            Ok(pre_swap) => pre_swap,
            Err(err) => {
                execute_compensations(&self.compensations).await?;
                return Err(err);
            }
        };

        let outputs = pre_swap.pre_mint_secrets.clone();
        let send_secrets = pre_swap.send_secrets.clone();

        if let Err(err) = advance_saga(
            &self.wallet.localstore,
            &mut saga,
            WalletSagaState::Swap(SwapSagaState::SwapRequested),
            OperationData::Swap {
                input_amount,
                outputs: Some(outputs.clone()),
            },
        )
        .await
        {
            execute_compensations(&self.compensations).await?;
            return Err(err);
        }

        match self.wallet.execute_swap(pre_swap, None).await {
            Ok(swapped) => {
                self.wallet
                    .commit_operation(operation_id, State::Spent)
                    .await?;
                clear_compensations(&self.compensations).await;
                finish_saga(&self.wallet.localstore, &operation_id).await;

                tracing::info!("Swap {} completed", operation_id);

                Ok(swapped)
            }
            Err(err) if err.is_retriable() => {
                tracing::warn!(
                    "Swap {} outcome unknown ({}), checking with the mint",
                    operation_id,
                    err
                );

                clear_compensations(&self.compensations).await;

                match self.wallet.reconcile_swap(operation_id, &outputs).await {
                    Ok(SwapResolution::Restored(restored)) => {
                        finish_saga(&self.wallet.localstore, &operation_id).await;
                        Ok(partition(restored, &send_secrets))
                    }
                    Ok(_) => {
                        finish_saga(&self.wallet.localstore, &operation_id).await;
                        Err(err)
                    }
                    Err(check_err) => {
                        tracing::warn!(
                            "Could not reach mint to settle swap {}: {}. Left for recovery.",
                            operation_id,
                            check_err
                        );
                        Err(err)
                    }
                }
            }
            Err(err) => {
                tracing::warn!("Swap {} failed: {}", operation_id, err);
                execute_compensations(&self.compensations).await?;
                Err(err)
            }
        }
    }
}

async fn prepare(
    wallet: &Wallet,
    amount: Option<Amount>,
    amount_split_target: SplitTarget,
    spending_conditions: Option<SpendingConditions>,
    include_fees: bool,
    inputs: Proofs,
) -> Result<PreSwap, Error> {
    let active_keyset = wallet.get_active_keyset().await?;

    wallet
        .create_swap(
            &active_keyset,
            amount,
            amount_split_target,
            inputs,
            spending_conditions,
            include_fees,
        )
        .await
}

fn partition(proofs: Proofs, send_secrets: &HashSet<Secret>) -> SwapOutputs {
    let (send, change) = proofs
        .into_iter()
        .partition(|p| send_secrets.contains(&p.secret));

    SwapOutputs { send, change }
}
