//! Receive saga states

use uuid::Uuid;

use crate::nuts::{KeySetInfo, Proofs};
use crate::wallet::receive::ReceiveOptions;
use crate::Amount;

/// Operation id assigned, nothing checked yet
pub struct Initial {
    /// Operation id
    pub operation_id: Uuid,
}

/// Keysets resolved and witnesses attached
pub struct Validated {
    /// Operation id
    pub operation_id: Uuid,
    /// Receive options
    pub options: ReceiveOptions,
    /// Memo of the token
    pub memo: Option<String>,
    /// Incoming proofs, signed where keys or preimages were given
    pub proofs: Proofs,
    /// Value of the incoming proofs
    pub proofs_amount: Amount,
    /// Keyset the new proofs are issued in
    pub active_keyset: KeySetInfo,
}
