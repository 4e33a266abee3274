//! Issue
//!
//! Mints proofs for a paid mint quote.

use tracing::instrument;
use uuid::Uuid;

use crate::amount::SplitTarget;
use crate::nuts::{MintQuoteState, Proofs, ProofsMethods, SpendingConditions, State};
use crate::types::ProofInfo;
use crate::util::unix_time;
use crate::wallet::saga::finish_saga;
use crate::wallet::types::{Metadata, Transaction, TransactionDirection};
use crate::{Amount, Error, Wallet};

pub(crate) mod saga;

use saga::IssueSaga;

impl Wallet {
    /// Mint
    ///
    /// The quote must be paid; if the stored state says otherwise the mint is asked once and
    /// [`Error::QuoteNotPaid`] returned if it still is not. New proofs are stored unspent and the
    /// quote moves to `ISSUED`.
    ///
    /// # Example
    /// ```no_run
    /// # use cdk::amount::SplitTarget;
    /// # use cdk::wallet::Wallet;
    /// # use cdk::Amount;
    /// # async fn example(wallet: &Wallet) -> Result<(), Box<dyn std::error::Error>> {
    /// let quote = wallet.mint_quote(Some(Amount::from(100)), None).await?;
    /// // pay quote.request, then
    /// let proofs = wallet.mint(&quote.id, SplitTarget::default(), None).await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip(self, spending_conditions), err)]
    pub async fn mint(
        &self,
        quote_id: &str,
        split_target: SplitTarget,
        spending_conditions: Option<SpendingConditions>,
    ) -> Result<Proofs, Error> {
        let quote = self
            .localstore
            .get_mint_quote(quote_id)
            .await?
            .ok_or(Error::UnknownQuote)?;
        if quote.mint_url != self.mint_url || quote.unit != self.unit {
            return Err(Error::UnknownQuote);
        }

        IssueSaga::new(self.clone())
            .prepare(quote_id, split_target, spending_conditions)
            .await?
            .execute()
            .await
    }

    /// Mint every paid quote of this wallet
    ///
    /// Unpaid quotes are checked with the mint first. Quotes that fail are logged and skipped.
    /// Returns the total minted.
    #[instrument(skip(self))]
    pub async fn check_all_mint_quotes(&self) -> Result<Amount, Error> {
        let mut total = Amount::ZERO;

        for quote in self.get_active_mint_quotes().await? {
            let quote = match quote.state {
                MintQuoteState::Paid => quote,
                _ => match self.mint_quote_state(&quote.id).await {
                    Ok(quote) => quote,
                    Err(e) => {
                        tracing::warn!("Could not check mint quote {}: {}", quote.id, e);
                        continue;
                    }
                },
            };

            if quote.state != MintQuoteState::Paid {
                continue;
            }

            match self.mint(&quote.id, SplitTarget::default(), None).await {
                Ok(proofs) => {
                    total = total
                        .checked_add(proofs.total_amount()?)
                        .ok_or(Error::AmountOverflow)?;
                }
                Err(e) => tracing::warn!("Could not mint quote {}: {}", quote.id, e),
            }
        }

        Ok(total)
    }

    /// Store minted proofs and close the quote
    pub(crate) async fn finalize_issue(
        &self,
        operation_id: Uuid,
        quote_id: &str,
        proofs: Proofs,
    ) -> Result<Proofs, Error> {
        let added = proofs
            .iter()
            .cloned()
            .map(|p| ProofInfo::new(p, self.mint_url.clone(), State::Unspent, self.unit.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        let ys: Vec<_> = added.iter().map(|p| p.y).collect();

        self.localstore.update_proofs(added, vec![]).await?;
        self.notify_proof_states(&ys, State::Unspent);

        self.mark_issued(quote_id).await?;

        let amount = proofs.total_amount()?;

        let transaction = Transaction {
            mint_url: self.mint_url.clone(),
            direction: TransactionDirection::Incoming,
            amount,
            fee: Amount::ZERO,
            unit: self.unit.clone(),
            ys,
            timestamp: unix_time(),
            memo: None,
            metadata: Metadata::new(),
            quote_id: Some(quote_id.to_string()),
        };
        if let Err(e) = self.localstore.add_transaction(transaction).await {
            tracing::warn!("Failed to record issue {}: {}", operation_id, e);
        }

        finish_saga(&self.localstore, &operation_id).await;

        tracing::info!("Minted {} for quote {}", amount, quote_id);

        Ok(proofs)
    }
}
