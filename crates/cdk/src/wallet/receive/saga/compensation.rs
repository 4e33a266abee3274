//! Receive compensations

use async_trait::async_trait;
use tracing::instrument;
use uuid::Uuid;

use crate::nuts::PublicKey;
use crate::wallet::saga::CompensatingAction;
use crate::{Error, Wallet};

/// Drop the incoming proofs a failed receive stored and its record
///
/// The proofs still belong to the sender, so they are removed rather than released.
pub struct RemovePendingProofs {
    /// Wallet holding the proofs
    pub wallet: Wallet,
    /// Receive operation
    pub operation_id: Uuid,
    /// Ys of the incoming proofs
    pub proof_ys: Vec<PublicKey>,
}

#[async_trait]
impl CompensatingAction for RemovePendingProofs {
    #[instrument(skip_all)]
    async fn execute(&self) -> Result<(), Error> {
        tracing::info!(
            "Compensation: Removing proofs stored by receive {}",
            self.operation_id
        );

        self.wallet
            .discard_received(self.operation_id, self.proof_ys.clone())
            .await
    }

    fn name(&self) -> &'static str {
        "RemovePendingProofs"
    }
}
