//! Melt compensations

use async_trait::async_trait;
use tracing::instrument;

use crate::nuts::MeltQuoteState;
use crate::wallet::saga::CompensatingAction;
use crate::{Error, Wallet};

/// Return a melt quote marked `PENDING` for this attempt to `UNPAID`
///
/// A quote the mint already settled is left alone.
pub struct RevertMeltQuote {
    /// Wallet owning the quote
    pub wallet: Wallet,
    /// Quote id
    pub quote_id: String,
}

#[async_trait]
impl CompensatingAction for RevertMeltQuote {
    #[instrument(skip_all)]
    async fn execute(&self) -> Result<(), Error> {
        let Some(quote) = self.wallet.localstore.get_melt_quote(&self.quote_id).await? else {
            return Ok(());
        };

        if quote.state != MeltQuoteState::Pending {
            return Ok(());
        }

        tracing::info!(
            "Compensation: Reverting melt quote {} to unpaid",
            self.quote_id
        );

        match self
            .wallet
            .set_melt_quote_state(&self.quote_id, MeltQuoteState::Unpaid, None)
            .await
        {
            Ok(_) => Ok(()),
            // Paid in the meantime
            Err(Error::InvalidStateTransition(err)) => {
                tracing::warn!("Melt quote {} not reverted: {}", self.quote_id, err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn name(&self) -> &'static str {
        "RevertMeltQuote"
    }
}
