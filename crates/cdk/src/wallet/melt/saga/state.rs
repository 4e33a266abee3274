//! Melt saga states

use uuid::Uuid;

use crate::nuts::Proofs;
use crate::wallet::types::{Metadata, WalletSaga};
use crate::wallet::{MeltQuote, QuoteGuard};
use crate::Amount;

/// Operation id assigned, nothing reserved yet
pub struct Initial {
    /// Operation id
    pub operation_id: Uuid,
}

/// Quote claimed and inputs reserved
pub struct Prepared {
    /// Stored saga record
    pub saga: WalletSaga,
    /// The melt quote
    pub quote: MeltQuote,
    /// Inputs
    pub proofs: Proofs,
    /// Input fee of the proofs
    pub input_fee: Amount,
    /// Metadata stored with the transaction
    pub metadata: Metadata,
    /// Claim on the quote, released on drop
    pub(crate) quote_guard: QuoteGuard,
}
