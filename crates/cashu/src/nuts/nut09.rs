//! NUT-09: Restore signatures
//!
//! <https://github.com/cashubtc/nuts/blob/main/09.md>

use serde::{Deserialize, Serialize};

use super::nut00::{BlindSignature, BlindedMessage};

/// Restore Request [NUT-09]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    /// Outputs
    pub outputs: Vec<BlindedMessage>,
}

/// Restore Response [NUT-09]
///
/// Only outputs the mint has signed are returned, each paired with its signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreResponse {
    /// Outputs
    pub outputs: Vec<BlindedMessage>,
    /// Signatures
    pub signatures: Vec<BlindSignature>,
}
