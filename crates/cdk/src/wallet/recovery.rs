//! Wallet saga recovery
//!
//! Finishes or undoes operations a crash left behind. Call
//! [`Wallet::recover_incomplete_sagas`] after building the wallet and before using it:
//!
//! ```no_run
//! # use cdk::wallet::Wallet;
//! # async fn example(wallet: &Wallet) -> Result<(), cdk::Error> {
//! let report = wallet.recover_incomplete_sagas().await?;
//! if report.recovered > 0 || report.compensated > 0 {
//!     tracing::info!(
//!         "Recovered {} operations, compensated {}",
//!         report.recovered,
//!         report.compensated
//!     );
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Every saga record is examined by the step it reached:
//!
//! - Before the request (`ProofsReserved`, `ProofsPending`, `SecretsPrepared`) nothing reached
//!   the mint, so the operation is undone.
//! - After the request (`SwapRequested`, `MeltRequested`, `MintRequested`) the mint may have
//!   acted. It is asked for the state of the inputs or quote, and the outputs are restored when
//!   it did. Sagas whose outcome the mint cannot tell yet are skipped and kept for the next run.

use tracing::instrument;
use uuid::Uuid;

use crate::database;
use crate::nuts::{PreMintSecrets, PublicKey, State};
use crate::wallet::melt::MeltResolution;
use crate::wallet::saga::finish_saga;
use crate::wallet::swap::SwapResolution;
use crate::wallet::types::{
    IssueSagaState, OperationData, ReceiveSagaState, SendSagaState, SwapSagaState, WalletSaga,
    WalletSagaState,
};
use crate::{Error, Wallet};

/// Report of a recovery run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Sagas completed with the outcome the mint reported
    pub recovered: usize,
    /// Sagas rolled back
    pub compensated: usize,
    /// Sagas left for a later run
    pub skipped: usize,
    /// Sagas that failed to recover
    pub failed: usize,
}

enum RecoveryAction {
    Recovered,
    Compensated,
    Skipped,
}

impl Wallet {
    /// Recover incomplete sagas of this wallet's mint and unit
    ///
    /// Failures are counted in the report and do not stop the run.
    #[instrument(skip(self))]
    pub async fn recover_incomplete_sagas(&self) -> Result<RecoveryReport, Error> {
        let sagas: Vec<WalletSaga> = self
            .localstore
            .get_incomplete_sagas()
            .await?
            .into_iter()
            .filter(|s| s.mint_url == self.mint_url && s.unit == self.unit)
            .collect();

        let mut report = RecoveryReport::default();

        if sagas.is_empty() {
            tracing::debug!("No incomplete sagas to recover");
            return Ok(report);
        }

        tracing::info!("Found {} incomplete saga(s) to recover", sagas.len());

        for saga in sagas {
            tracing::info!("Recovering saga {} ({:?})", saga.id, saga.state);

            let result = match saga.state {
                WalletSagaState::Swap(state) => self.recover_swap_saga(&saga, state).await,
                WalletSagaState::Send(state) => self.recover_send_saga(&saga, state).await,
                WalletSagaState::Receive(state) => self.recover_receive_saga(&saga, state).await,
                WalletSagaState::Issue(state) => self.recover_issue_saga(&saga, state).await,
                WalletSagaState::Melt(_) => self.recover_melt_saga(&saga).await,
            };

            match result {
                Ok(RecoveryAction::Recovered) => report.recovered += 1,
                Ok(RecoveryAction::Compensated) => report.compensated += 1,
                Ok(RecoveryAction::Skipped) => {
                    tracing::info!("Saga {} left for a later recovery run", saga.id);
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::error!("Failed to recover saga {}: {}", saga.id, e);
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            "Recovery finished: {} recovered, {} compensated, {} skipped, {} failed",
            report.recovered,
            report.compensated,
            report.skipped,
            report.failed
        );

        Ok(report)
    }

    async fn recover_swap_saga(
        &self,
        saga: &WalletSaga,
        state: SwapSagaState,
    ) -> Result<RecoveryAction, Error> {
        let outputs = match (&saga.data, state) {
            (_, SwapSagaState::ProofsReserved) => None,
            (OperationData::Swap { outputs, .. }, SwapSagaState::SwapRequested) => {
                outputs.as_ref()
            }
            _ => return Err(mismatched(saga)),
        };

        self.settle_swap(saga.id, outputs).await
    }

    async fn recover_send_saga(
        &self,
        saga: &WalletSaga,
        state: SendSagaState,
    ) -> Result<RecoveryAction, Error> {
        let outputs = match (&saga.data, state) {
            (_, SendSagaState::ProofsReserved) => None,
            (OperationData::Send { outputs, .. }, SendSagaState::SwapRequested) => {
                outputs.as_ref()
            }
            _ => return Err(mismatched(saga)),
        };

        self.settle_swap(saga.id, outputs).await
    }

    /// Settle the proofs a swap or send held
    ///
    /// Without outputs the request was never sent and the proofs are released.
    async fn settle_swap(
        &self,
        operation_id: Uuid,
        outputs: Option<&PreMintSecrets>,
    ) -> Result<RecoveryAction, Error> {
        let Some(outputs) = outputs else {
            return self.release(operation_id).await;
        };

        match self.reconcile_swap(operation_id, outputs).await {
            Ok(SwapResolution::NothingHeld) | Ok(SwapResolution::Restored(_)) => {
                finish_saga(&self.localstore, &operation_id).await;
                Ok(RecoveryAction::Recovered)
            }
            Ok(SwapResolution::Released) => {
                finish_saga(&self.localstore, &operation_id).await;
                Ok(RecoveryAction::Compensated)
            }
            Err(e) if e.is_retriable() => {
                tracing::warn!("Mint unreachable for swap {}: {}", operation_id, e);
                Ok(RecoveryAction::Skipped)
            }
            Err(e) => Err(e),
        }
    }

    async fn recover_receive_saga(
        &self,
        saga: &WalletSaga,
        state: ReceiveSagaState,
    ) -> Result<RecoveryAction, Error> {
        let held_ys: Vec<PublicKey> = self
            .localstore
            .get_reserved_proofs(&saga.id)
            .await?
            .into_iter()
            .map(|p| p.y)
            .collect();

        let outputs = match (&saga.data, state) {
            (_, ReceiveSagaState::ProofsPending) => None,
            (OperationData::Receive { outputs, .. }, ReceiveSagaState::SwapRequested) => {
                outputs.as_ref()
            }
            _ => return Err(mismatched(saga)),
        };

        if let Some(outputs) = outputs {
            match self.reconcile_swap(saga.id, outputs).await {
                Ok(SwapResolution::Restored(restored)) if !restored.is_empty() => {
                    finish_saga(&self.localstore, &saga.id).await;
                    return Ok(RecoveryAction::Recovered);
                }
                Ok(SwapResolution::NothingHeld) if held_ys.is_empty() => {
                    finish_saga(&self.localstore, &saga.id).await;
                    return Ok(RecoveryAction::Recovered);
                }
                Ok(_) => (),
                Err(e) if e.is_retriable() => {
                    tracing::warn!("Mint unreachable for receive {}: {}", saga.id, e);
                    return Ok(RecoveryAction::Skipped);
                }
                Err(e) => return Err(e),
            }
        }

        // The token was never redeemed by us; its proofs stay with the sender
        self.discard_received(saga.id, held_ys).await?;

        Ok(RecoveryAction::Compensated)
    }

    async fn recover_issue_saga(
        &self,
        saga: &WalletSaga,
        state: IssueSagaState,
    ) -> Result<RecoveryAction, Error> {
        let OperationData::Issue {
            quote_id, outputs, ..
        } = &saga.data
        else {
            return Err(mismatched(saga));
        };

        let _quote_guard = match self.quote_locks.claim(quote_id) {
            Ok(guard) => guard,
            Err(Error::QuoteInUse(_)) => return Ok(RecoveryAction::Skipped),
            Err(e) => return Err(e),
        };

        let outputs = match (state, outputs) {
            (IssueSagaState::MintRequested, Some(outputs)) => outputs,
            _ => {
                finish_saga(&self.localstore, &saga.id).await;
                return Ok(RecoveryAction::Compensated);
            }
        };

        let restored = match self.restore_outputs(outputs).await {
            Ok(restored) => restored,
            Err(e) if e.is_retriable() => {
                tracing::warn!("Mint unreachable for issue {}: {}", saga.id, e);
                return Ok(RecoveryAction::Skipped);
            }
            Err(e) => return Err(e),
        };

        if restored.is_empty() {
            tracing::info!("Mint never signed issue {}, quote {} stays paid", saga.id, quote_id);
            finish_saga(&self.localstore, &saga.id).await;
            return Ok(RecoveryAction::Compensated);
        }

        self.finalize_issue(saga.id, quote_id, restored).await?;

        Ok(RecoveryAction::Recovered)
    }

    async fn recover_melt_saga(&self, saga: &WalletSaga) -> Result<RecoveryAction, Error> {
        match self.resolve_melt_saga(saga).await {
            Ok(MeltResolution::Paid(_)) | Ok(MeltResolution::NothingHeld) => {
                Ok(RecoveryAction::Recovered)
            }
            Ok(MeltResolution::Released) => Ok(RecoveryAction::Compensated),
            Ok(MeltResolution::Pending) => {
                tracing::info!("Melt {} still pending at the mint", saga.id);
                Ok(RecoveryAction::Skipped)
            }
            Err(Error::QuoteInUse(_)) => Ok(RecoveryAction::Skipped),
            Err(e) if e.is_retriable() => {
                tracing::warn!("Mint unreachable for melt {}: {}", saga.id, e);
                Ok(RecoveryAction::Skipped)
            }
            Err(e) => Err(e),
        }
    }

    /// Return the proofs an operation holds to `UNSPENT` and drop its record
    async fn release(&self, operation_id: Uuid) -> Result<RecoveryAction, Error> {
        let action = match self.commit_operation(operation_id, State::Unspent).await {
            Ok(()) => RecoveryAction::Compensated,
            // Never reserved anything
            Err(Error::ProofNotFound) => RecoveryAction::Compensated,
            Err(Error::Database(database::Error::OperationCommitted(_, outcome))) => {
                tracing::debug!(
                    "Operation {} already committed as {}",
                    operation_id,
                    outcome
                );
                RecoveryAction::Recovered
            }
            Err(e) => return Err(e),
        };

        finish_saga(&self.localstore, &operation_id).await;

        Ok(action)
    }
}

fn mismatched(saga: &WalletSaga) -> Error {
    Error::Custom(format!(
        "Saga {} data does not match state {:?}",
        saga.id, saga.state
    ))
}
