//! NUT-00: Notation and Models
//!
//! <https://github.com/cashubtc/nuts/blob/main/00.md>

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::nut01::{PublicKey, SecretKey};
use super::nut02::Id;
use super::nut11::SpendingConditions;
use super::nut12::BlindSignatureDleq;
use crate::dhke::{blind_message, hash_to_curve};
use crate::{Amount, Error, Secret};

pub mod token;

pub use token::Token;

/// List of [`Proof`]
pub type Proofs = Vec<Proof>;

/// Utility methods for [`Proofs`]
pub trait ProofsMethods {
    /// Total amount, failing on overflow
    fn total_amount(&self) -> Result<Amount, Error>;

    /// Curve points of the secrets
    fn ys(&self) -> Result<Vec<PublicKey>, Error>;

    /// Count proofs by keyset
    fn count_by_keyset(&self) -> HashMap<Id, u64>;

    /// Sum proofs by keyset
    fn sum_by_keyset(&self) -> Result<HashMap<Id, Amount>, Error>;
}

impl ProofsMethods for [Proof] {
    fn total_amount(&self) -> Result<Amount, Error> {
        Amount::try_sum(self.iter().map(|p| p.amount))
    }

    fn ys(&self) -> Result<Vec<PublicKey>, Error> {
        self.iter().map(|p| p.y()).collect()
    }

    fn count_by_keyset(&self) -> HashMap<Id, u64> {
        let mut counts = HashMap::new();
        for proof in self {
            *counts.entry(proof.keyset_id).or_insert(0) += 1;
        }
        counts
    }

    fn sum_by_keyset(&self) -> Result<HashMap<Id, Amount>, Error> {
        let mut sums: HashMap<Id, Amount> = HashMap::new();
        for proof in self {
            let entry = sums.entry(proof.keyset_id).or_insert(Amount::ZERO);
            *entry = entry
                .checked_add(proof.amount)
                .ok_or(Error::AmountOverflow)?;
        }
        Ok(sums)
    }
}

/// Blinded Message (also called `output`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlindedMessage {
    /// Amount
    ///
    /// The value for the requested [BlindSignature]
    pub amount: Amount,
    /// Keyset ID
    ///
    /// ID from which we expect a signature.
    #[serde(rename = "id")]
    pub keyset_id: Id,
    /// Blinded secret message (B_)
    ///
    /// The blinded secret message generated by the sender.
    #[serde(rename = "B_")]
    pub blinded_secret: PublicKey,
}

impl BlindedMessage {
    /// Compose new blinded message
    pub fn new(amount: Amount, keyset_id: Id, blinded_secret: PublicKey) -> Self {
        Self {
            amount,
            keyset_id,
            blinded_secret,
        }
    }
}

/// Blind Signature (also called `promise`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindSignature {
    /// Amount
    ///
    /// The value of the blinded token.
    pub amount: Amount,
    /// Keyset ID
    ///
    /// ID of the mint keys that signed the token.
    #[serde(rename = "id")]
    pub keyset_id: Id,
    /// Blinded signature (C_)
    ///
    /// The blinded signature on the secret message `B_` of [BlindedMessage].
    #[serde(rename = "C_")]
    pub c: PublicKey,
    /// DLEQ Proof
    ///
    /// <https://github.com/cashubtc/nuts/blob/main/12.md>
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dleq: Option<BlindSignatureDleq>,
}

/// Witness unlocking a [`Proof`] with spending conditions
///
/// Serialized as a JSON string inside the proof.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Witness {
    /// P2PK witness
    P2PKWitness {
        /// Schnorr signatures over the secret
        signatures: Vec<String>,
    },
    /// HTLC witness
    HTLCWitness {
        /// Hex encoded preimage
        preimage: String,
        /// Schnorr signatures over the secret
        signatures: Option<Vec<String>>,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawWitness {
    Htlc {
        preimage: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signatures: Option<Vec<String>>,
    },
    P2pk {
        signatures: Vec<String>,
    },
}

impl Witness {
    /// Signatures carried by the witness
    pub fn signatures(&self) -> Vec<String> {
        match self {
            Self::P2PKWitness { signatures } => signatures.clone(),
            Self::HTLCWitness { signatures, .. } => signatures.clone().unwrap_or_default(),
        }
    }

    /// Append a signature
    pub fn add_signature(&mut self, signature: String) {
        match self {
            Self::P2PKWitness { signatures } => signatures.push(signature),
            Self::HTLCWitness { signatures, .. } => {
                signatures.get_or_insert_with(Vec::new).push(signature)
            }
        }
    }

    /// Preimage of an HTLC witness
    pub fn preimage(&self) -> Option<String> {
        match self {
            Self::P2PKWitness { .. } => None,
            Self::HTLCWitness { preimage, .. } => Some(preimage.clone()),
        }
    }
}

impl Serialize for Witness {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let raw = match self.clone() {
            Self::P2PKWitness { signatures } => RawWitness::P2pk { signatures },
            Self::HTLCWitness {
                preimage,
                signatures,
            } => RawWitness::Htlc {
                preimage,
                signatures,
            },
        };
        let json = serde_json::to_string(&raw).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&json)
    }
}

impl<'de> Deserialize<'de> for Witness {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let json = String::deserialize(deserializer)?;
        let raw: RawWitness = serde_json::from_str(&json).map_err(serde::de::Error::custom)?;
        Ok(match raw {
            RawWitness::P2pk { signatures } => Self::P2PKWitness { signatures },
            RawWitness::Htlc {
                preimage,
                signatures,
            } => Self::HTLCWitness {
                preimage,
                signatures,
            },
        })
    }
}

/// Proofs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Proof {
    /// Amount
    pub amount: Amount,
    /// `Keyset id`
    #[serde(rename = "id")]
    pub keyset_id: Id,
    /// Secret message
    pub secret: Secret,
    /// Unblinded signature
    #[serde(rename = "C")]
    pub c: PublicKey,
    /// Witness
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness: Option<Witness>,
}

impl Proof {
    /// Create new [`Proof`]
    pub fn new(amount: Amount, keyset_id: Id, secret: Secret, c: PublicKey) -> Self {
        Proof {
            amount,
            keyset_id,
            secret,
            c,
            witness: None,
        }
    }

    /// Get y from proof
    ///
    /// Where y is `hash_to_curve(secret)`
    pub fn y(&self) -> Result<PublicKey, Error> {
        hash_to_curve(self.secret.as_bytes())
    }

    /// Spending conditions carried by the secret, if it is a well-known secret
    pub fn spending_conditions(&self) -> Option<SpendingConditions> {
        SpendingConditions::try_from(&self.secret).ok()
    }
}

/// Currency Unit
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum CurrencyUnit {
    /// Sat
    #[default]
    Sat,
    /// Msat
    Msat,
    /// Usd
    Usd,
    /// Euro
    Eur,
    /// Auth
    Auth,
    /// Custom currency unit
    Custom(String),
}

impl FromStr for CurrencyUnit {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.is_empty() {
            return Err(Error::UnknownVariant {
                kind: "currency unit",
                value: value.to_string(),
            });
        }

        let unit = match value.to_lowercase().as_str() {
            "sat" => Self::Sat,
            "msat" => Self::Msat,
            "usd" => Self::Usd,
            "eur" => Self::Eur,
            "auth" => Self::Auth,
            _ => Self::Custom(value.to_string()),
        };

        Ok(unit)
    }
}

impl fmt::Display for CurrencyUnit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            CurrencyUnit::Sat => "sat",
            CurrencyUnit::Msat => "msat",
            CurrencyUnit::Usd => "usd",
            CurrencyUnit::Eur => "eur",
            CurrencyUnit::Auth => "auth",
            CurrencyUnit::Custom(unit) => unit,
        };
        f.write_str(s)
    }
}

impl Serialize for CurrencyUnit {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CurrencyUnit {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let currency: String = String::deserialize(deserializer)?;
        Self::from_str(&currency).map_err(serde::de::Error::custom)
    }
}

/// Output about to be sent to the mint, with what is needed to unblind its signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreMint {
    /// Blinded message
    pub blinded_message: BlindedMessage,
    /// Secret
    pub secret: Secret,
    /// R
    pub r: SecretKey,
    /// Amount
    pub amount: Amount,
}

/// Set of [`PreMint`] for one keyset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreMintSecrets {
    /// Secrets
    pub secrets: Vec<PreMint>,
    /// Keyset Id
    pub keyset_id: Id,
}

impl PreMintSecrets {
    /// Empty set for a keyset
    pub fn new(keyset_id: Id) -> Self {
        Self {
            secrets: Vec::new(),
            keyset_id,
        }
    }

    /// Outputs with fresh random secrets, one per amount
    pub fn random(keyset_id: Id, amounts: &[Amount]) -> Result<Self, Error> {
        let mut output = Vec::with_capacity(amounts.len());

        for amount in amounts {
            output.push(Self::premint(keyset_id, *amount, Secret::generate(), None)?);
        }

        Ok(Self {
            secrets: output,
            keyset_id,
        })
    }

    /// Outputs locked to spending conditions. Every output gets its own nonce.
    pub fn with_conditions(
        keyset_id: Id,
        amounts: &[Amount],
        conditions: &SpendingConditions,
    ) -> Result<Self, Error> {
        let mut output = Vec::with_capacity(amounts.len());

        for amount in amounts {
            output.push(Self::premint(keyset_id, *amount, conditions.to_secret()?, None)?);
        }

        Ok(Self {
            secrets: output,
            keyset_id,
        })
    }

    pub(crate) fn premint(
        keyset_id: Id,
        amount: Amount,
        secret: Secret,
        r: Option<SecretKey>,
    ) -> Result<PreMint, Error> {
        let (blinded, r) = blind_message(secret.as_bytes(), r)?;

        Ok(PreMint {
            blinded_message: BlindedMessage::new(amount, keyset_id, blinded),
            secret,
            r,
            amount,
        })
    }

    /// Iterate over secrets
    pub fn iter(&self) -> impl Iterator<Item = &PreMint> {
        self.secrets.iter()
    }

    /// Length of secrets
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    /// If secrets is empty
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Total amount of secrets
    pub fn total_amount(&self) -> Result<Amount, Error> {
        Amount::try_sum(self.secrets.iter().map(|p| p.amount))
    }

    /// [`BlindedMessage`]s from [`PreMintSecrets`]
    pub fn blinded_messages(&self) -> Vec<BlindedMessage> {
        self.iter().map(|pm| pm.blinded_message.clone()).collect()
    }

    /// [`Secret`]s from [`PreMintSecrets`]
    pub fn secrets(&self) -> Vec<Secret> {
        self.iter().map(|pm| pm.secret.clone()).collect()
    }

    /// Blinding factor from [`PreMintSecrets`]
    pub fn rs(&self) -> Vec<SecretKey> {
        self.iter().map(|pm| pm.r.clone()).collect()
    }

    /// Amounts from [`PreMintSecrets`]
    pub fn amounts(&self) -> Vec<Amount> {
        self.iter().map(|pm| pm.amount).collect()
    }

    /// Combine [`PreMintSecrets`]
    pub fn combine(&mut self, mut other: Self) {
        self.secrets.append(&mut other.secrets)
    }

    /// Sort [`PreMintSecrets`] by [`Amount`] so outputs do not reveal their purpose
    pub fn sort_secrets(&mut self) {
        self.secrets.sort_by_key(|pm| pm.amount);
    }
}

/// Number of blank outputs needed to return up to `fee_reserve` as change
///
/// `max(ceil(log2(fee_reserve)), 1)`; blanks carry amount zero and the mint assigns amounts
/// when it signs.
pub fn blank_output_count(fee_reserve: Amount) -> usize {
    let fee_reserve = fee_reserve.to_u64();
    if fee_reserve <= 1 {
        return 1;
    }

    // ceil(log2(n)) for n >= 2
    (u64::BITS - (fee_reserve - 1).leading_zeros()) as usize
}
