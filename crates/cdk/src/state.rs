//! State machines for proofs and quotes
//!
//! Every state change goes through one of the transition functions here. They are pure: they
//! validate the move and return a [`Transition`] record, storage applies it.

use std::fmt;

use thiserror::Error;

use crate::nuts::{MeltQuoteState, MintQuoteState, State};

/// Record of an accepted state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S> {
    /// State before
    pub from: S,
    /// State after
    pub to: S,
}

impl<S: PartialEq> Transition<S> {
    /// Source and target are the same state
    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }
}

/// Rejected state change
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid {entity} state transition from `{from}` to `{to}`")]
pub struct InvalidTransition {
    /// Kind of entity
    pub entity: &'static str,
    /// Current state
    pub from: String,
    /// Requested state
    pub to: String,
}

fn check<S>(entity: &'static str, from: S, to: S, allowed: bool) -> Result<Transition<S>, InvalidTransition>
where
    S: fmt::Display + PartialEq + Copy,
{
    if from == to || allowed {
        return Ok(Transition { from, to });
    }

    Err(InvalidTransition {
        entity,
        from: from.to_string(),
        to: to.to_string(),
    })
}

/// Proof lifecycle
///
/// `UNSPENT -> PENDING -> SPENT`, `PENDING -> UNSPENT` on failure. `PENDING_SPENT` marks
/// proofs handed out in a token; it resolves to `SPENT`, or back to `PENDING` when the wallet
/// reclaims them. `SPENT` is terminal. Moving to the current state is a no-op.
pub fn proof_transition(from: State, to: State) -> Result<Transition<State>, InvalidTransition> {
    let allowed = matches!(
        (from, to),
        (State::Unspent, State::Pending)
            | (State::Unspent, State::Spent)
            | (State::Pending, State::Unspent)
            | (State::Pending, State::Spent)
            | (State::Pending, State::PendingSpent)
            | (State::PendingSpent, State::Spent)
            | (State::PendingSpent, State::Pending)
    );

    check("proof", from, to, allowed)
}

/// Mint quote lifecycle, strictly forward: `UNPAID -> PAID -> ISSUED`
pub fn mint_quote_transition(
    from: MintQuoteState,
    to: MintQuoteState,
) -> Result<Transition<MintQuoteState>, InvalidTransition> {
    let allowed = matches!(
        (from, to),
        (MintQuoteState::Unpaid, MintQuoteState::Paid)
            | (MintQuoteState::Unpaid, MintQuoteState::Issued)
            | (MintQuoteState::Paid, MintQuoteState::Issued)
    );

    check("mint quote", from, to, allowed)
}

/// Melt quote lifecycle: `UNPAID -> PENDING -> PAID`, with `PENDING -> UNPAID` when a payment
/// attempt fails and the quote can be reused
pub fn melt_quote_transition(
    from: MeltQuoteState,
    to: MeltQuoteState,
) -> Result<Transition<MeltQuoteState>, InvalidTransition> {
    let allowed = matches!(
        (from, to),
        (MeltQuoteState::Unpaid, MeltQuoteState::Pending)
            | (MeltQuoteState::Unpaid, MeltQuoteState::Paid)
            | (MeltQuoteState::Pending, MeltQuoteState::Paid)
            | (MeltQuoteState::Pending, MeltQuoteState::Unpaid)
    );

    check("melt quote", from, to, allowed)
}
