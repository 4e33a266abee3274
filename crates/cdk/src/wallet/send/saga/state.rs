//! Send saga states

use uuid::Uuid;

use crate::nuts::Proofs;
use crate::wallet::send::SendOptions;
use crate::wallet::types::WalletSaga;
use crate::Amount;

/// Operation id assigned, nothing reserved yet
pub struct Initial {
    /// Operation id
    pub operation_id: Uuid,
}

/// Proofs reserved and split between direct send and swap
pub struct Prepared {
    /// Stored saga record
    pub saga: WalletSaga,
    /// Amount to send
    pub amount: Amount,
    /// Send options
    pub options: SendOptions,
    /// Proofs swapped before sending
    pub proofs_to_swap: Proofs,
    /// Input fee of the swap
    pub swap_fee: Amount,
    /// Proofs put into the token directly
    pub proofs_to_send: Proofs,
    /// Fee the recipient pays to redeem the token
    pub send_fee: Amount,
    /// Swap and send fee
    pub total_fee: Amount,
}
