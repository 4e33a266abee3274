//! Send saga
//!
//! ```text
//! SendSaga<Initial>
//!   └─> prepare() -> SendSaga<Prepared>
//!         ├─> confirm() -> Token
//!         └─> cancel()
//! ```
//!
//! The record is written before proofs are reserved (`ProofsReserved`), advanced to
//! `SwapRequested` with the swap outputs before a swap is sent, and deleted once the token
//! proofs are `PENDING_SPENT`. Proofs created by the swap for the token are held by the send
//! operation, so releasing it returns them as well.

use std::collections::HashSet;

use tracing::instrument;
use uuid::Uuid;

use self::state::{Initial, Prepared};
use super::{split_proofs_for_send, SendMemo, SendOptions};
use crate::amount::SplitTarget;
use crate::nuts::{Id, Proofs, ProofsMethods, State, Token};
use crate::util::unix_time;
use crate::wallet::saga::{
    add_compensation, advance_saga, clear_compensations, execute_compensations, finish_saga,
    new_compensations, Compensations, ReleaseReservation,
};
use crate::wallet::swap::split_covering_fee;
use crate::wallet::types::{
    OperationData, SendSagaState, Transaction, TransactionDirection, WalletSaga, WalletSagaState,
};
use crate::{Amount, Error, Wallet};

pub mod state;

/// Send saga
pub struct SendSaga<S> {
    wallet: Wallet,
    compensations: Compensations,
    state_data: S,
}

impl SendSaga<Initial> {
    /// Create a new send saga
    pub fn new(wallet: Wallet) -> Self {
        Self {
            wallet,
            compensations: new_compensations(),
            state_data: Initial {
                operation_id: Uuid::new_v4(),
            },
        }
    }

    /// Select and reserve proofs for the send
    ///
    /// Registers a compensation releasing the reservation if a later step fails.
    #[instrument(skip_all)]
    pub async fn prepare(
        self,
        amount: Amount,
        opts: SendOptions,
    ) -> Result<SendSaga<Prepared>, Error> {
        let operation_id = self.state_data.operation_id;

        tracing::info!("Preparing send of {} with operation {}", amount, operation_id);

        if opts.send_kind.is_online() {
            if let Err(e) = self.wallet.refresh_keysets().await {
                tracing::error!("Error refreshing keysets: {}. Using stored keysets", e);
            }
        }

        let active_keyset = self.wallet.get_active_keyset().await?;
        let keys = self.wallet.load_keyset_keys(active_keyset.id).await?;
        let policy = self.wallet.denomination_policy(&keys)?;

        let send_amounts = if opts.include_fee {
            split_covering_fee(
                amount,
                &opts.amount_split_target,
                policy.as_ref(),
                active_keyset.input_fee_ppk,
            )?
        } else {
            amount.split_targeted(&opts.amount_split_target, policy.as_ref())?
        };
        let target = Amount::try_sum(send_amounts.iter().copied())?;
        let send_fee = target.checked_sub(amount).unwrap_or(Amount::ZERO);

        let saga = WalletSaga::new(
            operation_id,
            WalletSagaState::Send(SendSagaState::ProofsReserved),
            amount,
            self.wallet.mint_url.clone(),
            self.wallet.unit.clone(),
            OperationData::Send {
                amount,
                memo: opts.memo.as_ref().map(|m| m.memo.clone()),
                outputs: None,
            },
        );
        self.wallet.localstore.add_saga(saga.clone()).await?;

        let (proofs, force_swap) = match self.reserve(target, &opts).await {
            Ok(reserved) => reserved,
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

        match self
            .split(amount, send_fee, &send_amounts, proofs, &opts, force_swap)
            .await
        {
            Ok((proofs_to_send, proofs_to_swap, swap_fee, total_fee)) => {
                tracing::debug!(
                    "Send {} prepared: {} direct, {} to swap, fee {}",
                    operation_id,
                    proofs_to_send.len(),
                    proofs_to_swap.len(),
                    total_fee
                );

                Ok(SendSaga {
                    wallet: self.wallet,
                    compensations: self.compensations,
                    state_data: Prepared {
                        saga,
                        amount,
                        options: opts,
                        proofs_to_swap,
                        swap_fee,
                        proofs_to_send,
                        send_fee,
                        total_fee,
                    },
                })
            }
            Err(err) => {
                execute_compensations(&self.compensations).await?;
                Err(err)
            }
        }
    }

    /// Reserve proofs worth `target`
    ///
    /// With spending conditions, proofs already locked to them are preferred. Online sends
    /// fall back to unlocked proofs, which then have to be swapped.
    async fn reserve(&self, target: Amount, opts: &SendOptions) -> Result<(Proofs, bool), Error> {
        let operation_id = self.state_data.operation_id;

        let Some(conditions) = opts.conditions.clone() else {
            let proofs = self
                .wallet
                .reserve_proofs_for(target, opts.include_fee, operation_id, None)
                .await?;
            return Ok((proofs, false));
        };

        match self
            .wallet
            .reserve_proofs_for(target, opts.include_fee, operation_id, Some(conditions))
            .await
        {
            Ok(proofs) => Ok((proofs, false)),
            Err(Error::InsufficientFunds) if opts.send_kind.is_online() => {
                tracing::debug!("Insufficient proofs matching conditions, swapping");
                let proofs = self
                    .wallet
                    .reserve_proofs_for(target, true, operation_id, None)
                    .await?;
                Ok((proofs, true))
            }
            Err(err) => Err(err),
        }
    }

    /// Check the selection against the send kind and split it
    async fn split(
        &self,
        amount: Amount,
        send_fee: Amount,
        send_amounts: &[Amount],
        proofs: Proofs,
        opts: &SendOptions,
        force_swap: bool,
    ) -> Result<(Proofs, Proofs, Amount, Amount), Error> {
        let target = amount.checked_add(send_fee).ok_or(Error::AmountOverflow)?;
        let selected_total = proofs.total_amount()?;
        let excess = selected_total.checked_sub(target).unwrap_or(Amount::ZERO);

        let exact = excess == Amount::ZERO;
        let within_tolerance = opts
            .send_kind
            .tolerance()
            .is_some_and(|tolerance| excess <= tolerance);

        if opts.send_kind.is_offline() && !exact && !within_tolerance {
            tracing::debug!(
                "Offline send of {} cannot be made from proofs at hand ({} over)",
                amount,
                excess
            );
            return Err(Error::InsufficientFunds);
        }

        let mut exact_proofs = exact;
        if let Some(max_proofs) = opts.max_proofs {
            exact_proofs &= proofs.len() <= max_proofs;
        }

        let send_directly = exact_proofs || within_tolerance || opts.send_kind.is_offline();

        let keyset_fees = self.wallet.get_keyset_fees().await?;
        let split = split_proofs_for_send(
            proofs,
            send_amounts,
            amount,
            send_fee,
            &keyset_fees,
            force_swap,
            send_directly,
        )?;

        if !split.proofs_unneeded.is_empty() {
            let ys = split.proofs_unneeded.ys()?;
            self.wallet
                .localstore
                .update_proofs_state(ys.clone(), State::Unspent)
                .await?;
            self.wallet.notify_proof_states(&ys, State::Unspent);
        }

        let total_fee = split
            .swap_fee
            .checked_add(send_fee)
            .ok_or(Error::AmountOverflow)?;

        Ok((
            split.proofs_to_send,
            split.proofs_to_swap,
            split.swap_fee,
            total_fee,
        ))
    }
}

impl SendSaga<Prepared> {
    /// Operation id
    pub fn operation_id(&self) -> Uuid {
        self.state_data.saga.id
    }

    /// Amount to send
    pub fn amount(&self) -> Amount {
        self.state_data.amount
    }

    /// Send options
    pub fn options(&self) -> &SendOptions {
        &self.state_data.options
    }

    /// Proofs swapped before sending
    pub fn proofs_to_swap(&self) -> &Proofs {
        &self.state_data.proofs_to_swap
    }

    /// Proofs put into the token directly
    pub fn proofs_to_send(&self) -> &Proofs {
        &self.state_data.proofs_to_send
    }

    /// Swap fee
    pub fn swap_fee(&self) -> Amount {
        self.state_data.swap_fee
    }

    /// Fee the recipient pays to redeem the token
    pub fn send_fee(&self) -> Amount {
        self.state_data.send_fee
    }

    /// Swap and send fee
    pub fn fee(&self) -> Amount {
        self.state_data.total_fee
    }

    /// Swap if needed and build the token
    ///
    /// Token proofs end up `PENDING_SPENT`. When a swap response is lost the mint is asked
    /// what happened; if it cannot be reached the record is left for recovery.
    #[instrument(skip_all)]
    pub async fn confirm(self, memo: Option<SendMemo>) -> Result<Token, Error> {
        let Prepared {
            mut saga,
            amount,
            options,
            proofs_to_swap,
            proofs_to_send: mut token_proofs,
            send_fee,
            total_fee,
            ..
        } = self.state_data;
        let operation_id = saga.id;

        tracing::info!("Confirming send {}", operation_id);

        if !proofs_to_swap.is_empty() {
            let target = amount.checked_add(send_fee).ok_or(Error::AmountOverflow)?;
            let swap_amount = target
                .checked_sub(token_proofs.total_amount()?)
                .unwrap_or(Amount::ZERO);

            tracing::debug!("Swapping {} proofs for {}", proofs_to_swap.len(), swap_amount);

            let pre_swap = match async {
                let active_keyset = self.wallet.get_active_keyset().await?;
                self.wallet
                    .create_swap(
                        &active_keyset,
                        Some(swap_amount),
                        SplitTarget::None,
                        proofs_to_swap,
                        options.conditions.clone(),
                        false,
                    )
                    .await
            }
            .await
            {
                Ok(pre_swap) => pre_swap,
                Err(err) => {
                    execute_compensations(&self.compensations).await?;
                    return Err(err);
                }
            };
            let outputs = pre_swap.pre_mint_secrets.clone();

            if let Err(err) = advance_saga(
                &self.wallet.localstore,
                &mut saga,
                WalletSagaState::Send(SendSagaState::SwapRequested),
                OperationData::Send {
                    amount,
                    memo: options.memo.as_ref().map(|m| m.memo.clone()),
                    outputs: Some(outputs.clone()),
                },
            )
            .await
            {
                execute_compensations(&self.compensations).await?;
                return Err(err);
            }

            match self.wallet.execute_swap(pre_swap, Some(operation_id)).await {
                Ok(swapped) => token_proofs.extend(swapped.send),
                Err(err) if err.is_retriable() => {
                    tracing::warn!(
                        "Swap for send {} outcome unknown ({}), checking with the mint",
                        operation_id,
                        err
                    );
                    clear_compensations(&self.compensations).await;

                    match self.wallet.reconcile_swap(operation_id, &outputs).await {
                        Ok(_) => finish_saga(&self.wallet.localstore, &operation_id).await,
                        Err(check_err) => tracing::warn!(
                            "Could not reach mint to settle send {}: {}. Left for recovery.",
                            operation_id,
                            check_err
                        ),
                    }

                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!("Swap for send {} failed: {}", operation_id, err);
                    execute_compensations(&self.compensations).await?;
                    return Err(err);
                }
            }
        }

        // Tokens only carry proofs of keysets the mint knows
        let keyset_ids: HashSet<Id> = token_proofs.iter().map(|p| p.keyset_id).collect();
        for keyset_id in keyset_ids {
            if let Err(err) = self.wallet.lookup_keyset(&keyset_id).await {
                execute_compensations(&self.compensations).await?;
                return Err(err);
            }
        }

        if let Err(err) = self
            .wallet
            .commit_operation(operation_id, State::PendingSpent)
            .await
        {
            execute_compensations(&self.compensations).await?;
            return Err(err);
        }
        clear_compensations(&self.compensations).await;

        let send_memo = options.memo.clone().or(memo);
        let token_memo = send_memo.and_then(|m| m.include_memo.then_some(m.memo));

        let transaction = Transaction {
            mint_url: self.wallet.mint_url.clone(),
            direction: TransactionDirection::Outgoing,
            amount,
            fee: total_fee,
            unit: self.wallet.unit.clone(),
            ys: token_proofs.ys()?,
            timestamp: unix_time(),
            memo: token_memo.clone(),
            metadata: options.metadata.clone(),
            quote_id: None,
        };
        if let Err(e) = self.wallet.localstore.add_transaction(transaction).await {
            tracing::warn!("Failed to record send {}: {}", operation_id, e);
        }

        let token = Token::new(
            self.wallet.mint_url.clone(),
            token_proofs,
            token_memo,
            self.wallet.unit.clone(),
        );

        finish_saga(&self.wallet.localstore, &operation_id).await;

        tracing::info!("Send {} completed", operation_id);

        Ok(token)
    }

    /// Release the reserved proofs
    #[instrument(skip_all)]
    pub async fn cancel(self) -> Result<(), Error> {
        tracing::info!("Cancelling send {}", self.state_data.saga.id);

        execute_compensations(&self.compensations).await
    }
}
