//! NUT-11: Pay to Public Key (P2PK) and NUT-14: Hashed Timelock Contracts (HTLC)
//!
//! <https://github.com/cashubtc/nuts/blob/main/11.md>
//! <https://github.com/cashubtc/nuts/blob/main/14.md>

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::schnorr::Signature;
use bitcoin::secp256k1::{KeyPair, Message};
use serde::{Deserialize, Serialize};

use super::nut00::{Proof, Witness};
use super::nut01::{PublicKey, SecretKey};
use super::nut10::{Kind, Nut10Secret};
use crate::util::{random_hex_32, secp, unix_time};
use crate::{Error, Secret};

/// Signature flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SigFlag {
    /// Requires valid signatures on all inputs.
    #[default]
    #[serde(rename = "SIG_INPUTS")]
    SigInputs,
    /// Requires valid signatures on all inputs and on all outputs.
    #[serde(rename = "SIG_ALL")]
    SigAll,
}

impl fmt::Display for SigFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SigAll => write!(f, "SIG_ALL"),
            Self::SigInputs => write!(f, "SIG_INPUTS"),
        }
    }
}

impl FromStr for SigFlag {
    type Err = Error;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "SIG_ALL" => Ok(Self::SigAll),
            "SIG_INPUTS" => Ok(Self::SigInputs),
            _ => Err(Error::UnknownVariant {
                kind: "sig flag",
                value: tag.to_string(),
            }),
        }
    }
}

/// Optional conditions committed to in the secret tags
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Conditions {
    /// Unix locktime after which refund keys can be used
    pub locktime: Option<u64>,
    /// Additional Public keys
    pub pubkeys: Option<Vec<PublicKey>>,
    /// Refund keys
    pub refund_keys: Option<Vec<PublicKey>>,
    /// Number of signatures required
    ///
    /// Default is 1
    pub num_sigs: Option<u64>,
    /// Signature flag
    ///
    /// Default [`SigFlag::SigInputs`]
    pub sig_flag: SigFlag,
    /// Number of refund signatures required
    ///
    /// Default is 1
    pub num_sigs_refund: Option<u64>,
}

impl Conditions {
    /// Create new Spending [`Conditions`]
    pub fn new(
        locktime: Option<u64>,
        pubkeys: Option<Vec<PublicKey>>,
        refund_keys: Option<Vec<PublicKey>>,
        num_sigs: Option<u64>,
        sig_flag: Option<SigFlag>,
        num_sigs_refund: Option<u64>,
    ) -> Result<Self, Error> {
        let conditions = Self {
            locktime,
            pubkeys,
            refund_keys,
            num_sigs,
            sig_flag: sig_flag.unwrap_or_default(),
            num_sigs_refund,
        };

        conditions.validate(0)?;

        Ok(conditions)
    }

    /// Structural checks. `extra_keys` counts signing keys carried outside the tags, the
    /// P2PK data key.
    fn validate(&self, extra_keys: usize) -> Result<(), Error> {
        let pubkeys = self.pubkeys.clone().unwrap_or_default();
        let refund_keys = self.refund_keys.clone().unwrap_or_default();

        if pubkeys.iter().collect::<HashSet<_>>().len() != pubkeys.len() {
            return Err(Error::InvalidSpendingConditions(
                "duplicate pubkeys".to_string(),
            ));
        }

        if let Some(num_sigs) = self.num_sigs {
            if num_sigs == 0 {
                return Err(Error::InvalidSpendingConditions(
                    "n_sigs must be at least one".to_string(),
                ));
            }

            let available = (pubkeys.len() + extra_keys) as u64;
            if extra_keys > 0 && num_sigs > available {
                return Err(Error::InvalidSpendingConditions(format!(
                    "n_sigs {num_sigs} exceeds the {available} signing keys"
                )));
            }
        }

        if !refund_keys.is_empty() && self.locktime.is_none() {
            return Err(Error::InvalidSpendingConditions(
                "refund keys require a locktime".to_string(),
            ));
        }

        if let Some(num_sigs_refund) = self.num_sigs_refund {
            if num_sigs_refund == 0 || num_sigs_refund > refund_keys.len() as u64 {
                return Err(Error::InvalidSpendingConditions(format!(
                    "n_sigs_refund {num_sigs_refund} needs as many refund keys"
                )));
            }
        }

        Ok(())
    }
}

impl From<Conditions> for Vec<Vec<String>> {
    fn from(conditions: Conditions) -> Vec<Vec<String>> {
        let Conditions {
            locktime,
            pubkeys,
            refund_keys,
            num_sigs,
            sig_flag,
            num_sigs_refund,
        } = conditions;

        let mut tags = Vec::new();

        if let Some(pubkeys) = pubkeys {
            tags.push(tag("pubkeys", pubkeys.iter().map(|k| k.to_hex())));
        }

        if let Some(locktime) = locktime {
            tags.push(tag("locktime", [locktime.to_string()]));
        }

        if let Some(num_sigs) = num_sigs {
            tags.push(tag("n_sigs", [num_sigs.to_string()]));
        }

        if let Some(refund_keys) = refund_keys {
            tags.push(tag("refund", refund_keys.iter().map(|k| k.to_hex())));
        }

        if let Some(num_sigs_refund) = num_sigs_refund {
            tags.push(tag("n_sigs_refund", [num_sigs_refund.to_string()]));
        }

        tags.push(tag("sigflag", [sig_flag.to_string()]));

        tags
    }
}

fn tag<I>(key: &str, values: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    std::iter::once(key.to_string()).chain(values).collect()
}

impl TryFrom<Vec<Vec<String>>> for Conditions {
    type Error = Error;

    fn try_from(tags: Vec<Vec<String>>) -> Result<Conditions, Self::Error> {
        let mut conditions = Conditions::default();

        for tag in tags {
            let Some((key, values)) = tag.split_first() else {
                continue;
            };

            let first = || {
                values.first().ok_or_else(|| {
                    Error::InvalidSpendingConditions(format!("tag `{key}` has no value"))
                })
            };

            let parse_u64 = |value: &String| {
                value.parse::<u64>().map_err(|_| {
                    Error::InvalidSpendingConditions(format!("tag `{key}` is not a number"))
                })
            };

            match key.as_str() {
                "locktime" => conditions.locktime = Some(parse_u64(first()?)?),
                "n_sigs" => conditions.num_sigs = Some(parse_u64(first()?)?),
                "n_sigs_refund" => conditions.num_sigs_refund = Some(parse_u64(first()?)?),
                "sigflag" => conditions.sig_flag = SigFlag::from_str(first()?)?,
                "pubkeys" => {
                    conditions.pubkeys = Some(
                        values
                            .iter()
                            .map(PublicKey::from_hex)
                            .collect::<Result<_, _>>()?,
                    )
                }
                "refund" => {
                    conditions.refund_keys = Some(
                        values
                            .iter()
                            .map(PublicKey::from_hex)
                            .collect::<Result<_, _>>()?,
                    )
                }
                _ => (),
            }
        }

        Ok(conditions)
    }
}

/// Spending Conditions
///
/// Defined in [NUT10](https://github.com/cashubtc/nuts/blob/main/10.md)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SpendingConditions {
    /// NUT11 Spending conditions
    ///
    /// Defined in [NUT11](https://github.com/cashubtc/nuts/blob/main/11.md)
    P2PKConditions {
        /// The public key of the recipient of the locked ecash
        data: PublicKey,
        /// Additional Optional Spending [`Conditions`]
        conditions: Option<Conditions>,
    },
    /// NUT14 Spending conditions
    ///
    /// Dedined in [NUT14](https://github.com/cashubtc/nuts/blob/main/14.md)
    HTLCConditions {
        /// Hash Lock of ecash
        data: sha256::Hash,
        /// Additional Optional Spending [`Conditions`]
        conditions: Option<Conditions>,
    },
}

impl SpendingConditions {
    /// New P2PK [SpendingConditions]
    pub fn new_p2pk(pubkey: PublicKey, conditions: Option<Conditions>) -> Result<Self, Error> {
        let spending_conditions = Self::P2PKConditions {
            data: pubkey,
            conditions,
        };
        spending_conditions.validate()?;
        Ok(spending_conditions)
    }

    /// New HTLC [SpendingConditions] locked to the hash of a hex encoded preimage
    pub fn new_htlc(preimage: String, conditions: Option<Conditions>) -> Result<Self, Error> {
        let preimage = hex::decode(preimage)?;
        let spending_conditions = Self::HTLCConditions {
            data: sha256::Hash::hash(&preimage),
            conditions,
        };
        spending_conditions.validate()?;
        Ok(spending_conditions)
    }

    /// New HTLC [SpendingConditions] from a hex encoded hash
    pub fn new_htlc_hash(hash: &str, conditions: Option<Conditions>) -> Result<Self, Error> {
        let data = sha256::Hash::from_str(hash)
            .map_err(|_| Error::InvalidSpendingConditions(format!("invalid hash `{hash}`")))?;
        let spending_conditions = Self::HTLCConditions { data, conditions };
        spending_conditions.validate()?;
        Ok(spending_conditions)
    }

    /// Kind of [SpendingConditions]
    pub fn kind(&self) -> Kind {
        match self {
            Self::P2PKConditions { .. } => Kind::P2PK,
            Self::HTLCConditions { .. } => Kind::HTLC,
        }
    }

    /// Optional [`Conditions`]
    pub fn conditions(&self) -> Option<&Conditions> {
        match self {
            Self::P2PKConditions { conditions, .. } => conditions.as_ref(),
            Self::HTLCConditions { conditions, .. } => conditions.as_ref(),
        }
    }

    /// Number of signatures required to unlock
    pub fn num_sigs(&self) -> Option<u64> {
        self.conditions().and_then(|c| c.num_sigs)
    }

    /// Public keys of locked [`Proof`]
    pub fn pubkeys(&self) -> Option<Vec<PublicKey>> {
        match self {
            Self::P2PKConditions { data, conditions } => {
                let mut pubkeys = vec![*data];
                if let Some(extra) = conditions.as_ref().and_then(|c| c.pubkeys.clone()) {
                    pubkeys.extend(extra);
                }
                Some(pubkeys)
            }
            Self::HTLCConditions { conditions, .. } => {
                conditions.as_ref().and_then(|c| c.pubkeys.clone())
            }
        }
    }

    /// Locktime of Spending Conditions
    pub fn locktime(&self) -> Option<u64> {
        self.conditions().and_then(|c| c.locktime)
    }

    /// Refund keys
    pub fn refund_keys(&self) -> Option<Vec<PublicKey>> {
        self.conditions().and_then(|c| c.refund_keys.clone())
    }

    /// Structural validation
    pub fn validate(&self) -> Result<(), Error> {
        match self {
            Self::P2PKConditions { conditions, .. } => {
                if let Some(conditions) = conditions {
                    conditions.validate(1)?;
                }
            }
            Self::HTLCConditions { conditions, .. } => {
                if let Some(conditions) = conditions {
                    let has_pubkeys = conditions
                        .pubkeys
                        .as_ref()
                        .is_some_and(|keys| !keys.is_empty());

                    if conditions.num_sigs.is_some() && !has_pubkeys {
                        return Err(Error::InvalidSpendingConditions(
                            "n_sigs without pubkeys".to_string(),
                        ));
                    }

                    conditions.validate(0)?;

                    let available = conditions.pubkeys.as_ref().map_or(0, |k| k.len()) as u64;
                    if conditions.num_sigs.is_some_and(|n| n > available) {
                        return Err(Error::InvalidSpendingConditions(format!(
                            "n_sigs exceeds the {available} signing keys"
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Fresh secret committing to these conditions with a random nonce
    pub fn to_secret(&self) -> Result<Secret, Error> {
        let data = match self {
            Self::P2PKConditions { data, .. } => data.to_hex(),
            Self::HTLCConditions { data, .. } => data.to_string(),
        };

        let tags: Option<Vec<Vec<String>>> = self.conditions().cloned().map(Into::into);

        Nut10Secret::new(self.kind(), random_hex_32(), data, tags).try_into()
    }
}

impl TryFrom<&Secret> for SpendingConditions {
    type Error = Error;

    fn try_from(secret: &Secret) -> Result<SpendingConditions, Self::Error> {
        let nut10_secret = Nut10Secret::try_from(secret)?;
        SpendingConditions::try_from(nut10_secret)
    }
}

impl TryFrom<Nut10Secret> for SpendingConditions {
    type Error = Error;

    fn try_from(secret: Nut10Secret) -> Result<SpendingConditions, Self::Error> {
        let conditions = match secret.secret_data.tags {
            Some(tags) if !tags.is_empty() => Some(Conditions::try_from(tags)?),
            _ => None,
        };

        let spending_conditions = match secret.kind {
            Kind::P2PK => Self::P2PKConditions {
                data: PublicKey::from_hex(&secret.secret_data.data)?,
                conditions,
            },
            Kind::HTLC => Self::HTLCConditions {
                data: sha256::Hash::from_str(&secret.secret_data.data).map_err(|_| {
                    Error::InvalidSpendingConditions("invalid hash lock".to_string())
                })?,
                conditions,
            },
        };

        spending_conditions.validate()?;

        Ok(spending_conditions)
    }
}

fn secret_message(secret: &Secret) -> Result<Message, Error> {
    let hash = sha256::Hash::hash(secret.as_bytes()).to_byte_array();
    Ok(Message::from_slice(&hash)?)
}

impl Proof {
    /// Sign the secret with a P2PK key and append the signature to the witness
    pub fn sign_p2pk(&mut self, secret_key: &SecretKey) -> Result<(), Error> {
        let msg = secret_message(&self.secret)?;
        let keypair = KeyPair::from_secret_key(secp(), secret_key.as_secp());
        let signature: Signature = secp().sign_schnorr(&msg, &keypair);

        match self.witness.as_mut() {
            Some(witness) => witness.add_signature(signature.to_string()),
            None => {
                self.witness = Some(Witness::P2PKWitness {
                    signatures: vec![signature.to_string()],
                })
            }
        }

        Ok(())
    }

    /// Attach an HTLC preimage, keeping any signatures already present
    pub fn add_preimage(&mut self, preimage: String) {
        let signatures = self
            .witness
            .as_ref()
            .map(|w| w.signatures())
            .filter(|s| !s.is_empty());

        self.witness = Some(Witness::HTLCWitness {
            preimage,
            signatures,
        });
    }

    /// Check the witness satisfies the spending conditions of the secret
    ///
    /// Proofs without a well-known secret always verify.
    pub fn verify_spending_conditions(&self) -> Result<(), Error> {
        let conditions = match SpendingConditions::try_from(&self.secret) {
            Ok(conditions) => conditions,
            Err(_) => return Ok(()),
        };

        let witness = self
            .witness
            .as_ref()
            .ok_or_else(|| Error::InvalidWitness("missing witness".to_string()))?;

        if let SpendingConditions::HTLCConditions { data, .. } = &conditions {
            let preimage = witness
                .preimage()
                .ok_or_else(|| Error::InvalidWitness("missing preimage".to_string()))?;
            let preimage = hex::decode(preimage)?;

            if sha256::Hash::hash(&preimage) != *data {
                return Err(Error::InvalidWitness("preimage does not match".to_string()));
            }
        }

        let msg = secret_message(&self.secret)?;
        let signatures = witness.signatures();

        let count_valid = |pubkeys: &[PublicKey]| -> u64 {
            pubkeys
                .iter()
                .filter(|pubkey| {
                    let (xonly, _) = pubkey.x_only_public_key();
                    signatures.iter().any(|sig| {
                        Signature::from_str(sig)
                            .map(|sig| secp().verify_schnorr(&sig, &msg, &xonly).is_ok())
                            .unwrap_or(false)
                    })
                })
                .count() as u64
        };

        let locktime_passed = conditions.locktime().is_some_and(|l| l < unix_time());

        if locktime_passed {
            let refund_keys = conditions.refund_keys().unwrap_or_default();
            if refund_keys.is_empty() {
                return Ok(());
            }

            let required = conditions
                .conditions()
                .and_then(|c| c.num_sigs_refund)
                .unwrap_or(1);

            if count_valid(&refund_keys) >= required {
                return Ok(());
            }
        }

        let pubkeys = conditions.pubkeys().unwrap_or_default();
        if pubkeys.is_empty() {
            return Ok(());
        }

        let required = conditions.num_sigs().unwrap_or(1);
        if count_valid(&pubkeys) >= required {
            return Ok(());
        }

        Err(Error::InvalidWitness(format!(
            "needs {required} valid signatures"
        )))
    }
}
