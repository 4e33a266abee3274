//! Wallet saga infrastructure
//!
//! Mutating operations are written as typestate sagas. Before the first side effect a
//! [`WalletSaga`] record is stored so crash recovery can find the operation; each completed
//! step may register a [`CompensatingAction`]. When a later step fails the actions run newest
//! first and undo what was done. On success the record is deleted and the actions dropped.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

use crate::database::DynWalletDatabase;
use crate::nuts::State;
use crate::wallet::types::{OperationData, WalletSaga, WalletSagaState};
use crate::{Error, Wallet};

/// Undo step registered by a saga
///
/// Actions may run more than once (a crash during compensation is retried by recovery) and
/// must be idempotent.
#[async_trait]
pub trait CompensatingAction: Send + Sync {
    /// Execute the compensating action
    async fn execute(&self) -> Result<(), Error>;

    /// Name used in logs
    fn name(&self) -> &'static str;
}

/// Compensating actions, most recent first
pub type Compensations = Arc<Mutex<VecDeque<Box<dyn CompensatingAction>>>>;

/// Create a new empty compensations queue
pub fn new_compensations() -> Compensations {
    Arc::new(Mutex::new(VecDeque::new()))
}

/// Run and drain every queued action, most recent first
///
/// A failing action is logged and the rest still run.
pub async fn execute_compensations(compensations: &Compensations) -> Result<(), Error> {
    let mut queue = compensations.lock().await;

    if queue.is_empty() {
        return Ok(());
    }

    tracing::warn!("Running {} compensating actions", queue.len());

    while let Some(compensation) = queue.pop_front() {
        tracing::debug!("Running compensation: {}", compensation.name());
        if let Err(e) = compensation.execute().await {
            tracing::error!(
                "Compensation {} failed: {}. Continuing...",
                compensation.name(),
                e
            );
        }
    }

    Ok(())
}

/// Drop all queued actions once the operation has completed
pub async fn clear_compensations(compensations: &Compensations) {
    compensations.lock().await.clear();
}

/// Queue an action ahead of the ones already registered
pub async fn add_compensation(compensations: &Compensations, action: Box<dyn CompensatingAction>) {
    compensations.lock().await.push_front(action);
}

/// Store the next step of a saga
///
/// Fails when another writer advanced the record in between.
pub(crate) async fn advance_saga(
    localstore: &DynWalletDatabase,
    saga: &mut WalletSaga,
    state: WalletSagaState,
    data: OperationData,
) -> Result<(), Error> {
    saga.advance(state, data);

    if !localstore.update_saga(saga.clone()).await? {
        return Err(Error::Custom(format!(
            "Saga {} version conflict during update",
            saga.id
        )));
    }

    Ok(())
}

/// Delete the record of a finished saga
///
/// Failure only leaves an orphaned record that recovery cleans up.
pub(crate) async fn finish_saga(localstore: &DynWalletDatabase, saga_id: &Uuid) {
    if let Err(e) = localstore.delete_saga(saga_id).await {
        tracing::warn!(
            "Failed to delete saga {}: {}. Will be cleaned up on recovery.",
            saga_id,
            e
        );
    }
}

/// Return the proofs an operation holds to `UNSPENT` and drop its saga record
pub struct ReleaseReservation {
    /// Wallet owning the proofs
    pub wallet: Wallet,
    /// Operation holding the proofs
    pub operation_id: Uuid,
}

#[async_trait]
impl CompensatingAction for ReleaseReservation {
    #[instrument(skip_all)]
    async fn execute(&self) -> Result<(), Error> {
        tracing::info!(
            "Compensation: Releasing proofs held by operation {}",
            self.operation_id
        );

        self.wallet
            .commit_operation(self.operation_id, State::Unspent)
            .await?;

        finish_saga(&self.wallet.localstore, &self.operation_id).await;

        Ok(())
    }

    fn name(&self) -> &'static str {
        "ReleaseReservation"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Record {
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
        label: &'static str,
        fail: bool,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CompensatingAction for Record {
        async fn execute(&self) -> Result<(), Error> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(self.label);
            if self.fail {
                return Err(Error::Custom("compensation failed".to_string()));
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            self.label
        }
    }

    #[tokio::test]
    async fn test_compensations_run_newest_first() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let runs = Arc::new(AtomicUsize::new(0));
        let compensations = new_compensations();

        for (label, fail) in [("first", false), ("second", true), ("third", false)] {
            add_compensation(
                &compensations,
                Box::new(Record {
                    order: order.clone(),
                    label,
                    fail,
                    runs: runs.clone(),
                }),
            )
            .await;
        }

        execute_compensations(&compensations).await.unwrap();

        // A failing action does not stop the rest
        assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);

        // Drained, a second run does nothing
        execute_compensations(&compensations).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cleared_compensations_do_not_run() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let runs = Arc::new(AtomicUsize::new(0));
        let compensations = new_compensations();

        add_compensation(
            &compensations,
            Box::new(Record {
                order,
                label: "only",
                fail: false,
                runs: runs.clone(),
            }),
        )
        .await;

        clear_compensations(&compensations).await;
        execute_compensations(&compensations).await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
