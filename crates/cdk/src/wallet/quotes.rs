//! Quote manager
//!
//! Mint and melt quotes are persisted as the mint reports them and only move forward through
//! the transition functions in [`crate::state`]. Every change is published to subscriptions.

use std::time::Duration;

use tokio::time::Instant;
use tracing::instrument;

use crate::nuts::{
    MeltOptions, MeltQuoteBolt11Request, MeltQuoteState, MintQuoteBolt11Request, MintQuoteState,
    SubscribeParams, SubscriptionKind,
};
use crate::util::unix_time;
use crate::wallet::retry::with_timeout;
use crate::wallet::{MeltQuote, MintQuote, NotificationPayload, Wallet};
use crate::{Amount, Error};

/// State of a quote as returned by [`Wallet::poll_or_await`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuoteStatus {
    /// Mint quote
    Mint(MintQuote),
    /// Melt quote
    Melt(MeltQuote),
}

impl QuoteStatus {
    /// The quote reached the state callers wait for: paid (or issued) for mint quotes,
    /// paid for melt quotes
    pub fn is_settled(&self) -> bool {
        match self {
            Self::Mint(quote) => {
                matches!(quote.state, MintQuoteState::Paid | MintQuoteState::Issued)
            }
            Self::Melt(quote) => quote.state == MeltQuoteState::Paid,
        }
    }

    fn from_payload(payload: NotificationPayload) -> Option<Self> {
        match payload {
            NotificationPayload::MintQuoteUpdate(quote) => Some(Self::Mint(quote)),
            NotificationPayload::MeltQuoteUpdate(quote) => Some(Self::Melt(quote)),
            NotificationPayload::ProofState(_) => None,
        }
    }
}

impl Wallet {
    /// Mint Quote
    ///
    /// Requests a quote from the mint and stores it as the mint reports it. Without `amount`
    /// the quote is open: the payer picks the amount and the mint reports it once paid.
    #[instrument(skip(self))]
    pub async fn mint_quote(
        &self,
        amount: Option<Amount>,
        description: Option<String>,
    ) -> Result<MintQuote, Error> {
        let request = MintQuoteBolt11Request {
            amount,
            unit: self.unit.clone(),
            description,
        };

        let response = with_timeout(
            self.config.read_timeout(),
            self.client.post_mint_quote(request),
        )
        .await?;

        let quote = MintQuote {
            id: response.quote,
            mint_url: self.mint_url.clone(),
            amount: response.amount.or(amount),
            unit: self.unit.clone(),
            request: response.request,
            state: response.state,
            expiry: response.expiry.unwrap_or_default(),
        };

        self.localstore.add_mint_quote(quote.clone()).await?;
        self.notify_mint_quote(&quote);

        tracing::debug!("Created mint quote {} for {:?}", quote.id, quote.amount);

        Ok(quote)
    }

    /// Check mint quote status
    ///
    /// Queries the mint and applies the reported state to the stored quote. A state the
    /// stored quote cannot move to is ignored with a warning; the stored quote is returned.
    #[instrument(skip(self))]
    pub async fn mint_quote_state(&self, quote_id: &str) -> Result<MintQuote, Error> {
        if self.localstore.get_mint_quote(quote_id).await?.is_none() {
            return Err(Error::UnknownQuote);
        }

        let response = self
            .read_call("get_mint_quote_status", || {
                self.client.get_mint_quote_status(quote_id)
            })
            .await?;

        let quote = match self
            .set_mint_quote_state(quote_id, response.state, response.amount)
            .await
        {
            Ok(quote) => quote,
            Err(Error::InvalidStateTransition(err)) => {
                tracing::warn!("Ignoring mint quote state from mint: {}", err);
                self.localstore
                    .get_mint_quote(quote_id)
                    .await?
                    .ok_or(Error::UnknownQuote)?
            }
            Err(err) => return Err(err),
        };

        self.notify_mint_quote(&quote);

        Ok(quote)
    }

    /// Move a mint quote to `ISSUED` once its proofs are stored
    #[instrument(skip(self))]
    pub async fn mark_issued(&self, quote_id: &str) -> Result<MintQuote, Error> {
        let quote = self
            .set_mint_quote_state(quote_id, MintQuoteState::Issued, None)
            .await?;
        self.notify_mint_quote(&quote);

        Ok(quote)
    }

    /// Store a new mint quote state
    ///
    /// The transition is checked against the stored quote as it is written. Open amount
    /// quotes take `amount` once the mint reports one.
    async fn set_mint_quote_state(
        &self,
        quote_id: &str,
        state: MintQuoteState,
        amount: Option<Amount>,
    ) -> Result<MintQuote, Error> {
        let before = self
            .localstore
            .get_mint_quote(quote_id)
            .await?
            .ok_or(Error::UnknownQuote)?;

        let quote = self
            .localstore
            .transition_mint_quote(quote_id, state, amount)
            .await?;

        if quote.state != before.state {
            tracing::debug!(
                "Mint quote {} moved {} -> {}",
                quote_id,
                before.state,
                quote.state
            );
        }

        Ok(quote)
    }

    /// Melt Quote
    #[instrument(skip(self, request))]
    pub async fn melt_quote(
        &self,
        request: String,
        options: Option<MeltOptions>,
    ) -> Result<MeltQuote, Error> {
        let quote_request = MeltQuoteBolt11Request {
            request: request.clone(),
            unit: self.unit.clone(),
            options,
        };

        let response = with_timeout(
            self.config.read_timeout(),
            self.client.post_melt_quote(quote_request),
        )
        .await?;

        let quote = MeltQuote::from_response(
            response,
            self.mint_url.clone(),
            self.unit.clone(),
            request,
        );

        self.localstore.add_melt_quote(quote.clone()).await?;
        self.notify_melt_quote(&quote);

        tracing::debug!(
            "Created melt quote {} for {} with fee reserve {}",
            quote.id,
            quote.amount,
            quote.fee_reserve
        );

        Ok(quote)
    }

    /// Melt quote status
    ///
    /// Queries the mint and applies the reported state and preimage to the stored quote.
    #[instrument(skip(self))]
    pub async fn melt_quote_status(&self, quote_id: &str) -> Result<MeltQuote, Error> {
        if self.localstore.get_melt_quote(quote_id).await?.is_none() {
            return Err(Error::UnknownQuote);
        }

        let response = self
            .read_call("get_melt_quote_status", || {
                self.client.get_melt_quote_status(quote_id)
            })
            .await?;

        let quote = match self
            .set_melt_quote_state(quote_id, response.state, response.payment_preimage)
            .await
        {
            Ok(quote) => quote,
            Err(Error::InvalidStateTransition(err)) => {
                tracing::warn!("Ignoring melt quote state from mint: {}", err);
                self.localstore
                    .get_melt_quote(quote_id)
                    .await?
                    .ok_or(Error::UnknownQuote)?
            }
            Err(err) => return Err(err),
        };

        Ok(quote)
    }

    /// Store a new melt quote state
    ///
    /// The transition is checked against the stored quote as it is written, so a caller
    /// holding an older copy cannot move it backwards.
    pub(crate) async fn set_melt_quote_state(
        &self,
        quote_id: &str,
        state: MeltQuoteState,
        payment_preimage: Option<String>,
    ) -> Result<MeltQuote, Error> {
        let before = self
            .localstore
            .get_melt_quote(quote_id)
            .await?
            .ok_or(Error::UnknownQuote)?;

        let quote = self
            .localstore
            .transition_melt_quote(quote_id, state, payment_preimage)
            .await?;

        if quote != before {
            self.notify_melt_quote(&quote);

            tracing::debug!(
                "Melt quote {} moved {} -> {}",
                quote_id,
                before.state,
                quote.state
            );
        }

        Ok(quote)
    }

    /// Unexpired mint quotes that have not been issued
    #[instrument(skip(self))]
    pub async fn get_active_mint_quotes(&self) -> Result<Vec<MintQuote>, Error> {
        let now = unix_time();

        Ok(self
            .localstore
            .get_mint_quotes()
            .await?
            .into_iter()
            .filter(|q| {
                q.mint_url == self.mint_url
                    && q.unit == self.unit
                    && q.state != MintQuoteState::Issued
                    && (q.expiry == 0 || q.expiry > now || q.state == MintQuoteState::Paid)
            })
            .collect())
    }

    /// Melt quotes with a payment in flight
    #[instrument(skip(self))]
    pub async fn get_pending_melt_quotes(&self) -> Result<Vec<MeltQuote>, Error> {
        Ok(self
            .localstore
            .get_melt_quotes()
            .await?
            .into_iter()
            .filter(|q| {
                q.mint_url == self.mint_url
                    && q.unit == self.unit
                    && q.state == MeltQuoteState::Pending
            })
            .collect())
    }

    /// Current state of a quote
    ///
    /// Returns the stored state if the quote is already settled, otherwise asks the mint.
    /// With `wait` set and the quote still unsettled it subscribes and waits up to `wait` for
    /// the quote to settle, failing with [`Error::Timeout`].
    #[instrument(skip(self))]
    pub async fn poll_or_await(
        &self,
        quote_id: &str,
        wait: Option<Duration>,
    ) -> Result<QuoteStatus, Error> {
        let cached = self.cached_quote_status(quote_id).await?;
        if cached.is_settled() {
            return Ok(cached);
        }

        let queried = match &cached {
            QuoteStatus::Mint(_) => self.mint_quote_state(quote_id).await.map(QuoteStatus::Mint),
            QuoteStatus::Melt(_) => self.melt_quote_status(quote_id).await.map(QuoteStatus::Melt),
        };

        let current = match queried {
            Ok(status) if status.is_settled() => return Ok(status),
            Ok(status) => status,
            Err(err) if err.is_retriable() && wait.is_some() => {
                tracing::debug!("Quote {} query failed ({}), waiting for updates", quote_id, err);
                cached
            }
            Err(err) => return Err(err),
        };

        let Some(wait) = wait else {
            return Ok(current);
        };

        let kind = match current {
            QuoteStatus::Mint(_) => SubscriptionKind::Bolt11MintQuote,
            QuoteStatus::Melt(_) => SubscriptionKind::Bolt11MeltQuote,
        };
        let subscription = self
            .subscribe(SubscribeParams::new(kind, vec![quote_id.to_string()]))
            .await?;

        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let payload = subscription.recv_timeout(remaining).await?;

            if let Some(status) = QuoteStatus::from_payload(payload) {
                if status.is_settled() {
                    return Ok(status);
                }
            }
        }
    }

    async fn cached_quote_status(&self, quote_id: &str) -> Result<QuoteStatus, Error> {
        if let Some(quote) = self.localstore.get_mint_quote(quote_id).await? {
            return Ok(QuoteStatus::Mint(quote));
        }

        if let Some(quote) = self.localstore.get_melt_quote(quote_id).await? {
            return Ok(QuoteStatus::Melt(quote));
        }

        Err(Error::UnknownQuote)
    }
}
