//! Receive saga
//!
//! ```text
//! ReceiveSaga<Initial>
//!   └─> validate() -> ReceiveSaga<Validated>
//!         └─> execute() -> Amount
//! ```
//!
//! Validation touches nothing. Execution stores the incoming proofs `PENDING` under the
//! operation (`ProofsPending`), records the swap outputs (`SwapRequested`) and swaps them for
//! fresh proofs. Incoming proofs are never released as unspent: until the swap went through
//! they still belong to the sender. A token holding a proof the store already has is refused
//! before anything is written.

use std::collections::HashSet;

use tracing::instrument;
use uuid::Uuid;

use self::compensation::RemovePendingProofs;
use self::state::{Initial, Validated};
use crate::nuts::{Id, Proofs, ProofsMethods, SpendingConditions, State};
use crate::types::ProofInfo;
use crate::util::unix_time;
use crate::wallet::receive::ReceiveOptions;
use crate::wallet::saga::{
    add_compensation, advance_saga, clear_compensations, execute_compensations, finish_saga,
    new_compensations, Compensations,
};
use crate::wallet::swap::SwapResolution;
use crate::wallet::types::{
    OperationData, ReceiveSagaState, Transaction, TransactionDirection, WalletSaga,
    WalletSagaState,
};
use crate::{Amount, Error, Wallet};

pub mod compensation;
pub mod state;

/// Receive saga
pub struct ReceiveSaga<S> {
    wallet: Wallet,
    compensations: Compensations,
    state_data: S,
}

impl ReceiveSaga<Initial> {
    /// Create a new receive saga
    pub fn new(wallet: Wallet) -> Self {
        Self {
            wallet,
            compensations: new_compensations(),
            state_data: Initial {
                operation_id: Uuid::new_v4(),
            },
        }
    }

    /// Resolve the keysets of the incoming proofs and attach witnesses
    ///
    /// Fails with [`Error::UnknownKeyset`] if the mint does not know a keyset.
    #[instrument(skip_all)]
    pub async fn validate(
        self,
        proofs: Proofs,
        memo: Option<String>,
        options: ReceiveOptions,
    ) -> Result<ReceiveSaga<Validated>, Error> {
        if proofs.is_empty() {
            return Err(Error::MalformedToken("token holds no proofs".to_string()));
        }

        let keyset_ids: HashSet<Id> = proofs.iter().map(|p| p.keyset_id).collect();
        for keyset_id in keyset_ids {
            let keyset = self.wallet.lookup_keyset(&keyset_id).await?;
            if keyset.unit != self.wallet.unit {
                return Err(Error::UnsupportedUnit(keyset.unit));
            }
        }

        let proofs = attach_witnesses(proofs, &options)?;
        let proofs_amount = proofs.total_amount()?;
        let active_keyset = self.wallet.get_active_keyset().await?;

        tracing::debug!(
            "Receive {} validated {} proofs worth {}",
            self.state_data.operation_id,
            proofs.len(),
            proofs_amount
        );

        Ok(ReceiveSaga {
            wallet: self.wallet,
            compensations: self.compensations,
            state_data: Validated {
                operation_id: self.state_data.operation_id,
                options,
                memo,
                proofs,
                proofs_amount,
                active_keyset,
            },
        })
    }
}

impl ReceiveSaga<Validated> {
    /// Swap the incoming proofs for fresh ones
    ///
    /// Returns the amount received after the swap fee.
    #[instrument(skip_all)]
    pub async fn execute(self) -> Result<Amount, Error> {
        let Validated {
            operation_id,
            options,
            memo,
            proofs,
            proofs_amount,
            active_keyset,
        } = self.state_data;

        tracing::info!("Receiving {} with operation {}", proofs_amount, operation_id);

        let mut saga = WalletSaga::new(
            operation_id,
            WalletSagaState::Receive(ReceiveSagaState::ProofsPending),
            proofs_amount,
            self.wallet.mint_url.clone(),
            self.wallet.unit.clone(),
            OperationData::Receive {
                token_amount: proofs_amount,
                outputs: None,
            },
        );
        self.wallet.localstore.add_saga(saga.clone()).await?;

        let incoming = match pending_infos(&self.wallet, &proofs, operation_id) {
            Ok(incoming) => incoming,
            Err(err) => {
                finish_saga(&self.wallet.localstore, &operation_id).await;
                return Err(err);
            }
        };
        let incoming_ys: Vec<_> = incoming.iter().map(|p| p.y).collect();

        if let Err(err) = self.wallet.localstore.add_new_proofs(incoming).await {
            finish_saga(&self.wallet.localstore, &operation_id).await;
            return Err(err.into());
        }
        self.wallet.notify_proof_states(&incoming_ys, State::Pending);

        add_compensation(
            &self.compensations,
            Box::new(RemovePendingProofs {
                wallet: self.wallet.clone(),
                operation_id,
                proof_ys: incoming_ys.clone(),
            }),
        )
        .await;

        let pre_swap = match self
            .wallet
            .create_swap(
                &active_keyset,
                None,
                options.amount_split_target.clone(),
                proofs,
                None,
                false,
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
        let fee = pre_swap.fee;

        if let Err(err) = advance_saga(
            &self.wallet.localstore,
            &mut saga,
            WalletSagaState::Receive(ReceiveSagaState::SwapRequested),
            OperationData::Receive {
                token_amount: proofs_amount,
                outputs: Some(outputs.clone()),
            },
        )
        .await
        {
            execute_compensations(&self.compensations).await?;
            return Err(err);
        }

        let received = match self.wallet.execute_swap(pre_swap, None).await {
            Ok(swapped) => {
                clear_compensations(&self.compensations).await;
                self.wallet
                    .commit_operation(operation_id, State::Spent)
                    .await?;
                swapped.change
            }
            Err(err) if err.is_retriable() => {
                tracing::warn!(
                    "Swap for receive {} outcome unknown ({}), checking with the mint",
                    operation_id,
                    err
                );

                match self.wallet.reconcile_swap(operation_id, &outputs).await {
                    Ok(SwapResolution::Restored(restored)) if !restored.is_empty() => restored,
                    Ok(_) => {
                        execute_compensations(&self.compensations).await?;
                        return Err(err);
                    }
                    Err(check_err) => {
                        clear_compensations(&self.compensations).await;
                        tracing::warn!(
                            "Could not reach mint to settle receive {}: {}. Left for recovery.",
                            operation_id,
                            check_err
                        );
                        return Err(err);
                    }
                }
            }
            Err(err) => {
                tracing::warn!("Swap for receive {} failed: {}", operation_id, err);
                execute_compensations(&self.compensations).await?;
                return Err(err);
            }
        };

        clear_compensations(&self.compensations).await;

        let amount = received.total_amount()?;

        let transaction = Transaction {
            mint_url: self.wallet.mint_url.clone(),
            direction: TransactionDirection::Incoming,
            amount,
            fee,
            unit: self.wallet.unit.clone(),
            ys: incoming_ys,
            timestamp: unix_time(),
            memo,
            metadata: options.metadata,
            quote_id: None,
        };
        if let Err(e) = self.wallet.localstore.add_transaction(transaction).await {
            tracing::warn!("Failed to record receive {}: {}", operation_id, e);
        }

        finish_saga(&self.wallet.localstore, &operation_id).await;

        tracing::info!("Receive {} completed: {} (fee {})", operation_id, amount, fee);

        Ok(amount)
    }
}

fn pending_infos(
    wallet: &Wallet,
    proofs: &Proofs,
    operation_id: Uuid,
) -> Result<Vec<ProofInfo>, Error> {
    proofs
        .iter()
        .cloned()
        .map(|p| {
            Ok(ProofInfo::new(
                p,
                wallet.mint_url.clone(),
                State::Pending,
                wallet.unit.clone(),
            )?
            .with_operation(operation_id))
        })
        .collect()
}

/// Sign P2PK locked proofs and add HTLC preimages from the options
///
/// Proofs without well-known secrets pass through. Missing keys are left for the mint to
/// reject.
fn attach_witnesses(proofs: Proofs, options: &ReceiveOptions) -> Result<Proofs, Error> {
    let mut signed = Proofs::with_capacity(proofs.len());

    for mut proof in proofs {
        let Ok(conditions) = SpendingConditions::try_from(&proof.secret) else {
            signed.push(proof);
            continue;
        };

        if let SpendingConditions::HTLCConditions { data, .. } = &conditions {
            if let Some(preimage) = options
                .preimages
                .iter()
                .find(|p| unlocks_hash(p, data))
            {
                proof.add_preimage(preimage.clone());
            }
        }

        let pubkeys = conditions.pubkeys().unwrap_or_default();
        let refund_keys = conditions.refund_keys().unwrap_or_default();
        for key in &options.p2pk_signing_keys {
            let public = key.public_key();
            if pubkeys.contains(&public) || refund_keys.contains(&public) {
                proof.sign_p2pk(key)?;
            }
        }

        signed.push(proof);
    }

    Ok(signed)
}

fn unlocks_hash(preimage: &str, hash: &bitcoin::hashes::sha256::Hash) -> bool {
    matches!(
        SpendingConditions::new_htlc(preimage.to_string(), None),
        Ok(SpendingConditions::HTLCConditions { data, .. }) if data == *hash
    )
}
