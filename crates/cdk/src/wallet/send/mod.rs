//! Send
//!
//! Use [`Wallet::prepare_send`] to create a [`PreparedSend`], then call
//! [`confirm`](PreparedSend::confirm) to create the token or
//! [`cancel`](PreparedSend::cancel) to release the reserved proofs.

use std::collections::HashMap;
use std::fmt::Debug;

use tracing::instrument;
use uuid::Uuid;

use crate::amount::SplitTarget;
use crate::fees::calculate_fee;
use crate::nuts::{Id, Proofs, ProofsMethods, SpendingConditions, Token};
use crate::wallet::types::Metadata;
use crate::{Amount, Error, Wallet};

pub(crate) mod saga;

use saga::state::Prepared;
use saga::SendSaga;

/// How strictly the token has to match the requested amount
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SendKind {
    /// Swap at the mint if needed to hit the amount exactly
    #[default]
    OnlineExact,
    /// Accept a token worth up to `amount + tolerance`, swapping otherwise
    OnlineTolerance(Amount),
    /// Only use proofs at hand, they must add up exactly
    OfflineExact,
    /// Only use proofs at hand, worth at most `amount + tolerance`
    OfflineTolerance(Amount),
}

impl SendKind {
    /// May contact the mint
    pub fn is_online(&self) -> bool {
        matches!(self, Self::OnlineExact | Self::OnlineTolerance(_))
    }

    /// Never contacts the mint
    pub fn is_offline(&self) -> bool {
        matches!(self, Self::OfflineExact | Self::OfflineTolerance(_))
    }

    /// Allows sending more than the amount
    pub fn has_tolerance(&self) -> bool {
        matches!(self, Self::OnlineTolerance(_) | Self::OfflineTolerance(_))
    }

    fn tolerance(&self) -> Option<Amount> {
        match self {
            Self::OnlineTolerance(tolerance) | Self::OfflineTolerance(tolerance) => {
                Some(*tolerance)
            }
            _ => None,
        }
    }
}

/// Send options
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Memo
    pub memo: Option<SendMemo>,
    /// Lock the token to these conditions
    pub conditions: Option<SpendingConditions>,
    /// Amount split target
    pub amount_split_target: SplitTarget,
    /// Send kind
    pub send_kind: SendKind,
    /// Include fee
    ///
    /// When true the token also carries the fee the recipient pays to redeem it.
    pub include_fee: bool,
    /// Maximum number of proofs in the token
    pub max_proofs: Option<usize>,
    /// Metadata stored with the transaction
    pub metadata: Metadata,
}

/// Send memo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMemo {
    /// Memo
    pub memo: String,
    /// Include memo in token
    pub include_memo: bool,
}

impl SendMemo {
    /// Create a new send memo
    pub fn for_token(memo: &str) -> Self {
        Self {
            memo: memo.to_string(),
            include_memo: true,
        }
    }
}

/// Prepared send
///
/// Created by [`Wallet::prepare_send`]. The selected proofs stay reserved until
/// [`confirm`](Self::confirm) or [`cancel`](Self::cancel). Dropping it leaves them reserved
/// for [`Wallet::recover_incomplete_sagas`] to release.
pub struct PreparedSend {
    saga: SendSaga<Prepared>,
}

impl PreparedSend {
    /// Operation ID for this prepared send
    pub fn operation_id(&self) -> Uuid {
        self.saga.operation_id()
    }

    /// Amount to send
    pub fn amount(&self) -> Amount {
        self.saga.amount()
    }

    /// Send options
    pub fn options(&self) -> &SendOptions {
        self.saga.options()
    }

    /// Proofs swapped at the mint before sending
    pub fn proofs_to_swap(&self) -> &Proofs {
        self.saga.proofs_to_swap()
    }

    /// Proofs put into the token as they are
    pub fn proofs_to_send(&self) -> &Proofs {
        self.saga.proofs_to_send()
    }

    /// All reserved proofs
    pub fn proofs(&self) -> Proofs {
        let mut proofs = self.proofs_to_swap().clone();
        proofs.extend(self.proofs_to_send().iter().cloned());
        proofs
    }

    /// Fee of the swap
    pub fn swap_fee(&self) -> Amount {
        self.saga.swap_fee()
    }

    /// Fee the recipient pays to redeem the token
    pub fn send_fee(&self) -> Amount {
        self.saga.send_fee()
    }

    /// Total fee (swap + send)
    pub fn fee(&self) -> Amount {
        self.saga.fee()
    }

    /// Confirm the prepared send and create a token
    pub async fn confirm(self, memo: Option<SendMemo>) -> Result<Token, Error> {
        self.saga.confirm(memo).await
    }

    /// Cancel the prepared send and release reserved proofs
    pub async fn cancel(self) -> Result<(), Error> {
        self.saga.cancel().await
    }
}

impl Debug for PreparedSend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedSend")
            .field("operation_id", &self.operation_id())
            .field("amount", &self.amount())
            .field("options", self.options())
            .field(
                "proofs_to_swap",
                &self
                    .proofs_to_swap()
                    .iter()
                    .map(|p| p.amount)
                    .collect::<Vec<_>>(),
            )
            .field("swap_fee", &self.swap_fee())
            .field(
                "proofs_to_send",
                &self
                    .proofs_to_send()
                    .iter()
                    .map(|p| p.amount)
                    .collect::<Vec<_>>(),
            )
            .field("send_fee", &self.send_fee())
            .finish()
    }
}

impl Wallet {
    /// Prepare a send
    ///
    /// Selects and reserves proofs and decides which of them need a swap, so the fee is known
    /// before anything is sent to the mint.
    ///
    /// # Example
    /// ```no_run
    /// # use cdk::wallet::{Wallet, SendOptions};
    /// # use cdk::Amount;
    /// # async fn example(wallet: &Wallet) -> Result<(), Box<dyn std::error::Error>> {
    /// let prepared = wallet.prepare_send(Amount::from(10), SendOptions::default()).await?;
    /// println!("Fee: {}", prepared.fee());
    /// let token = prepared.confirm(None).await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip(self, opts), err)]
    pub async fn prepare_send(
        &self,
        amount: Amount,
        opts: SendOptions,
    ) -> Result<PreparedSend, Error> {
        let saga = SendSaga::new(self.clone()).prepare(amount, opts).await?;

        Ok(PreparedSend { saga })
    }

    /// Send `amount` as a token
    ///
    /// [`prepare_send`](Self::prepare_send) followed by [`PreparedSend::confirm`].
    #[instrument(skip(self, opts), err)]
    pub async fn send(&self, amount: Amount, opts: SendOptions) -> Result<Token, Error> {
        self.prepare_send(amount, opts).await?.confirm(None).await
    }
}

/// Result of splitting proofs for a send operation
#[derive(Debug, Clone)]
pub struct ProofSplitResult {
    /// Proofs that can be sent directly (matching desired denominations)
    pub proofs_to_send: Proofs,
    /// Proofs that need to be swapped first
    pub proofs_to_swap: Proofs,
    /// Selected proofs the send turned out not to need
    pub proofs_unneeded: Proofs,
    /// Fee required for the swap operation
    pub swap_fee: Amount,
}

/// Split selected proofs between those sent directly and those swapped first
///
/// Proofs matching a wanted denomination are sent as they are. The rest are swapped for the
/// missing amount and must cover it plus their own fee, else [`Error::InsufficientFunds`].
/// Swap candidates not needed because the direct proofs already cover the amount are returned
/// separately. With `force_swap` everything is swapped; with `is_exact_or_offline` everything
/// is sent.
pub fn split_proofs_for_send(
    proofs: Proofs,
    send_amounts: &[Amount],
    amount: Amount,
    send_fee: Amount,
    keyset_fees: &HashMap<Id, u64>,
    force_swap: bool,
    is_exact_or_offline: bool,
) -> Result<ProofSplitResult, Error> {
    let mut proofs_to_swap = Proofs::new();
    let mut proofs_to_send = Proofs::new();
    let mut proofs_unneeded = Proofs::new();

    let target = amount.checked_add(send_fee).ok_or(Error::AmountOverflow)?;

    if force_swap {
        proofs_to_swap = proofs;
    } else if is_exact_or_offline {
        proofs_to_send = proofs;
    } else {
        let mut remaining_send_amounts: Vec<Amount> = send_amounts.to_vec();
        for proof in proofs {
            if let Some(idx) = remaining_send_amounts
                .iter()
                .position(|a| a == &proof.amount)
            {
                proofs_to_send.push(proof);
                remaining_send_amounts.remove(idx);
            } else {
                proofs_to_swap.push(proof);
            }
        }

        if !proofs_to_swap.is_empty() {
            let swap_output_needed = target
                .checked_sub(proofs_to_send.total_amount()?)
                .unwrap_or(Amount::ZERO);

            if swap_output_needed == Amount::ZERO {
                // Direct proofs already cover the amount
                proofs_unneeded = std::mem::take(&mut proofs_to_swap);
            } else {
                let swap_input_fee =
                    calculate_fee(&proofs_to_swap.count_by_keyset(), keyset_fees)?;
                let can_produce = proofs_to_swap
                    .total_amount()?
                    .checked_sub(swap_input_fee)
                    .unwrap_or(Amount::ZERO);

                // Moving a direct proof into the swap raises the need by its full value
                if can_produce < swap_output_needed {
                    return Err(Error::InsufficientFunds);
                }
            }
        }
    }

    let swap_fee = calculate_fee(&proofs_to_swap.count_by_keyset(), keyset_fees)?;

    Ok(ProofSplitResult {
        proofs_to_send,
        proofs_to_swap,
        proofs_unneeded,
        swap_fee,
    })
}
