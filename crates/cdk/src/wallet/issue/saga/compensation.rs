//! Issue compensations
//!
//! Nothing is stored and the quote is untouched until the mint signs, so undoing an issue
//! only drops its record.

use async_trait::async_trait;
use tracing::instrument;
use uuid::Uuid;

use crate::wallet::saga::{finish_saga, CompensatingAction};
use crate::{Error, Wallet};

/// Drop the record of an issue that never reached the mint
pub struct DiscardIssueRecord {
    /// Wallet owning the record
    pub wallet: Wallet,
    /// Quote id
    pub quote_id: String,
    /// Operation id
    pub operation_id: Uuid,
}

#[async_trait]
impl CompensatingAction for DiscardIssueRecord {
    #[instrument(skip_all)]
    async fn execute(&self) -> Result<(), Error> {
        tracing::info!(
            "Compensation: Discarding issue {} for quote {}",
            self.operation_id,
            self.quote_id
        );

        finish_saga(&self.wallet.localstore, &self.operation_id).await;

        Ok(())
    }

    fn name(&self) -> &'static str {
        "DiscardIssueRecord"
    }
}
