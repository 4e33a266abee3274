//! CDK Errors

use thiserror::Error;

use crate::amount::Amount;
use crate::database;
use crate::nuts::{CurrencyUnit, Id, PublicKey};
use crate::state::InvalidTransition;

/// CDK Error
#[derive(Debug, Error)]
pub enum Error {
    /// Not enough unspent proofs to cover the amount
    #[error("Insufficient funds")]
    InsufficientFunds,
    /// State machine rejected a transition
    #[error(transparent)]
    InvalidStateTransition(#[from] InvalidTransition),
    /// Keyset is not known to the mint
    #[error("Unknown keyset `{0}`")]
    UnknownKeyset(Id),
    /// Mint has no active keyset for the unit
    #[error("No active keyset")]
    NoActiveKeyset,
    /// Mint does not support the unit
    #[error("Unsupported unit `{0}`")]
    UnsupportedUnit(CurrencyUnit),
    /// Quote has not been paid
    #[error("Quote not paid")]
    QuoteNotPaid,
    /// Quote is not in the local store
    #[error("Unknown quote")]
    UnknownQuote,
    /// Quote expired
    #[error("Quote expired at `{0}`, now `{1}`")]
    ExpiredQuote(u64, u64),
    /// Another operation is working on the quote
    #[error("Quote `{0}` is in use by another operation")]
    QuoteInUse(String),
    /// Explicit split values do not add up
    #[error("Split values sum to `{actual}` but `{expected}` was requested")]
    AmountMismatch {
        /// Requested amount
        expected: Amount,
        /// Sum of the provided values
        actual: Amount,
    },
    /// Amount arithmetic overflowed
    #[error("Amount overflow")]
    AmountOverflow,
    /// Open amount quote the mint has not reported an amount for
    #[error("Quote amount undefined")]
    AmountUndefined,
    /// Proofs or operation are not in the local store
    #[error("Proof not found")]
    ProofNotFound,
    /// Incoming proof is already in the wallet
    #[error("Proof `{0}` is already held by the wallet")]
    ProofAlreadyHeld(PublicKey),
    /// Subscription was closed
    #[error("Subscription closed")]
    SubscriptionClosed,
    /// Operation did not complete in time
    #[error("Timeout")]
    Timeout,
    /// Mint could not be reached
    #[error("Transport failure: {0}")]
    TransportFailure(String),
    /// Mint rejected the request
    #[error("Mint error: {0}")]
    ProtocolError(String),
    /// Token could not be decoded
    #[error("Malformed token: {0}")]
    MalformedToken(String),
    /// Spending conditions are not structurally valid
    #[error("Invalid spending conditions: {0}")]
    InvalidSpendingConditions(String),
    /// Mint signature or keys failed verification
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    /// Multi mint wallet has no wallet for the key
    #[error("Unknown wallet: `{0}`")]
    UnknownWallet(String),
    /// Token was issued by another mint
    #[error("Token is from another mint")]
    IncorrectMint,
    /// Other cashu primitive error
    #[error(transparent)]
    Cashu(cashu::Error),
    /// Database error
    #[error(transparent)]
    Database(database::Error),
    /// Mnemonic error
    #[error(transparent)]
    Bip39(#[from] bip39::Error),
    /// Json error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Config error
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    /// Custom error
    #[error("`{0}`")]
    Custom(String),
}

impl Error {
    /// Failure that may succeed when tried again
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::TransportFailure(_) | Self::Timeout)
    }
}

impl From<cashu::Error> for Error {
    fn from(err: cashu::Error) -> Self {
        match err {
            cashu::Error::AmountOverflow => Self::AmountOverflow,
            cashu::Error::AmountMismatch { expected, actual } => {
                Self::AmountMismatch { expected, actual }
            }
            cashu::Error::MalformedToken(msg) => Self::MalformedToken(msg),
            cashu::Error::InvalidSpendingConditions(msg) => Self::InvalidSpendingConditions(msg),
            cashu::Error::InvalidSignature(msg) => Self::InvalidSignature(msg),
            cashu::Error::AmountKey(amount) => {
                Self::InvalidSignature(format!("no key for amount {amount}"))
            }
            cashu::Error::IncorrectKeysetId { expected, derived } => Self::InvalidSignature(
                format!("keyset id {expected} does not match its keys ({derived})"),
            ),
            err => Self::Cashu(err),
        }
    }
}

impl From<database::Error> for Error {
    fn from(err: database::Error) -> Self {
        match err {
            database::Error::ProofNotFound | database::Error::UnknownOperation(_) => {
                Self::ProofNotFound
            }
            database::Error::DuplicateProof(y) => Self::ProofAlreadyHeld(y),
            database::Error::UnknownQuote(_) => Self::UnknownQuote,
            database::Error::InvalidStateTransition(transition) => {
                Self::InvalidStateTransition(transition)
            }
            err => Self::Database(err),
        }
    }
}
