//! Errors

use thiserror::Error;

use crate::Amount;

/// Cashu primitive error
#[derive(Debug, Error)]
pub enum Error {
    /// Arithmetic on amounts overflowed
    #[error("Amount overflow")]
    AmountOverflow,
    /// Explicit split values do not add up to the requested amount
    #[error("Split values sum to `{actual}` but `{expected}` was requested")]
    AmountMismatch {
        /// Requested amount
        expected: Amount,
        /// Sum of the provided values
        actual: Amount,
    },
    /// Denomination policy cannot represent an amount
    #[error("Invalid denominations: {0}")]
    InvalidDenominations(String),
    /// Token could not be decoded
    #[error("Malformed token: {0}")]
    MalformedToken(String),
    /// Spending conditions failed structural validation
    #[error("Invalid spending conditions: {0}")]
    InvalidSpendingConditions(String),
    /// Keyset id is not well formed
    #[error("Invalid keyset id: `{0}`")]
    InvalidKeysetId(String),
    /// Keyset id does not match the keys it was served with
    #[error("Keyset id `{expected}` does not match keys (derived `{derived}`)")]
    IncorrectKeysetId {
        /// Id the mint advertised
        expected: String,
        /// Id derived from the keys
        derived: String,
    },
    /// Public key is not well formed
    #[error("Invalid public key: `{0}`")]
    InvalidPublicKey(String),
    /// Secret key is not well formed
    #[error("Invalid secret key")]
    InvalidSecretKey,
    /// Mint url is not well formed
    #[error("Invalid mint url: `{0}`")]
    InvalidUrl(String),
    /// Keyset has no key for a denomination
    #[error("No key for amount `{0}`")]
    AmountKey(Amount),
    /// Blind signature cannot be turned into a valid proof
    #[error("Invalid blind signature: {0}")]
    InvalidSignature(String),
    /// Hash to curve found no valid point
    #[error("No valid point found on curve")]
    NoValidPoint,
    /// Witness is missing or unusable
    #[error("Invalid witness: {0}")]
    InvalidWitness(String),
    /// Unknown enum variant
    #[error("Unknown `{kind}`: `{value}`")]
    UnknownVariant {
        /// Type being parsed
        kind: &'static str,
        /// Offending value
        value: String,
    },
    /// Deterministic counter ran past the derivable range
    #[error("Derivation counter overflow")]
    CounterOverflow,
    /// BIP32 derivation error
    #[error(transparent)]
    Bip32(#[from] bitcoin::bip32::Error),
    /// Secp256k1 error
    #[error(transparent)]
    Secp256k1(#[from] bitcoin::secp256k1::Error),
    /// Hex error
    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
    /// Json error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
