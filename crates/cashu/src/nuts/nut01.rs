//! NUT-01: Mint public key exchange
//!
//! <https://github.com/cashubtc/nuts/blob/main/01.md>

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use bitcoin::secp256k1;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::nut02::KeySet;
use crate::util::secp;
use crate::{Amount, Error};

/// Compressed secp256k1 public key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey {
    inner: secp256k1::PublicKey,
}

impl Deref for PublicKey {
    type Target = secp256k1::PublicKey;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl From<secp256k1::PublicKey> for PublicKey {
    fn from(inner: secp256k1::PublicKey) -> Self {
        Self { inner }
    }
}

impl PublicKey {
    /// Parse from compressed bytes
    pub fn from_slice(slice: &[u8]) -> Result<Self, Error> {
        Ok(Self {
            inner: secp256k1::PublicKey::from_slice(slice)?,
        })
    }

    /// Parse from hex string
    pub fn from_hex<S>(hex: S) -> Result<Self, Error>
    where
        S: AsRef<str>,
    {
        let hex = hex.as_ref();
        let bytes = hex::decode(hex).map_err(|_| Error::InvalidPublicKey(hex.to_string()))?;
        if bytes.len() != 33 {
            return Err(Error::InvalidPublicKey(hex.to_string()));
        }
        Self::from_slice(&bytes).map_err(|_| Error::InvalidPublicKey(hex.to_string()))
    }

    /// Compressed bytes
    pub fn to_bytes(&self) -> [u8; 33] {
        self.inner.serialize()
    }

    /// Hex encoded compressed key
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Inner secp256k1 key
    pub fn as_secp(&self) -> &secp256k1::PublicKey {
        &self.inner
    }
}

impl FromStr for PublicKey {
    type Err = Error;

    fn from_str(hex: &str) -> Result<Self, Self::Err> {
        Self::from_hex(hex)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let public_key: String = String::deserialize(deserializer)?;
        Self::from_hex(public_key).map_err(serde::de::Error::custom)
    }
}

/// Secret key
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey {
    inner: secp256k1::SecretKey,
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

impl Deref for SecretKey {
    type Target = secp256k1::SecretKey;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl From<secp256k1::SecretKey> for SecretKey {
    fn from(inner: secp256k1::SecretKey) -> Self {
        Self { inner }
    }
}

impl SecretKey {
    /// Generate random secret key
    pub fn generate() -> Self {
        Self {
            inner: secp256k1::SecretKey::new(&mut secp256k1::rand::thread_rng()),
        }
    }

    /// Parse from bytes
    pub fn from_slice(slice: &[u8]) -> Result<Self, Error> {
        secp256k1::SecretKey::from_slice(slice)
            .map(|inner| Self { inner })
            .map_err(|_| Error::InvalidSecretKey)
    }

    /// Parse from hex string
    pub fn from_hex<S>(hex: S) -> Result<Self, Error>
    where
        S: AsRef<str>,
    {
        let bytes = hex::decode(hex.as_ref()).map_err(|_| Error::InvalidSecretKey)?;
        Self::from_slice(&bytes)
    }

    /// Hex encoded secret key
    pub fn to_secret_hex(&self) -> String {
        hex::encode(self.inner.secret_bytes())
    }

    /// Corresponding public key
    pub fn public_key(&self) -> PublicKey {
        secp256k1::PublicKey::from_secret_key(secp(), &self.inner).into()
    }

    /// Inner secp256k1 key
    pub fn as_secp(&self) -> &secp256k1::SecretKey {
        &self.inner
    }
}

impl Serialize for SecretKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_secret_hex())
    }
}

impl<'de> Deserialize<'de> for SecretKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secret_key: String = String::deserialize(deserializer)?;
        Self::from_hex(secret_key).map_err(serde::de::Error::custom)
    }
}

/// Mint public keys per amount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Keys(BTreeMap<Amount, PublicKey>);

impl From<BTreeMap<Amount, PublicKey>> for Keys {
    fn from(keys: BTreeMap<Amount, PublicKey>) -> Self {
        Self(keys)
    }
}

impl Keys {
    /// Create new [`Keys`]
    pub fn new(keys: BTreeMap<Amount, PublicKey>) -> Self {
        Self(keys)
    }

    /// Get [`PublicKey`] for [`Amount`]
    pub fn amount_key(&self, amount: Amount) -> Option<PublicKey> {
        self.0.get(&amount).copied()
    }

    /// Advertised denominations, smallest first
    pub fn amounts(&self) -> Vec<Amount> {
        self.0.keys().copied().collect()
    }

    /// Iterate over amount key pairs, smallest amount first
    pub fn iter(&self) -> impl Iterator<Item = (&Amount, &PublicKey)> {
        self.0.iter()
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// No keys
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Mint keys response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysResponse {
    /// Keysets
    pub keysets: Vec<KeySet>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pubkey() {
        let pubkey_str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
        let pubkey = PublicKey::from_hex(pubkey_str).unwrap();

        assert_eq!(pubkey_str, pubkey.to_hex());
        assert!(PublicKey::from_hex("02c0").is_err());
    }

    #[test]
    fn keys_serialize_with_amount_keys() {
        let one = SecretKey::generate().public_key();
        let two = SecretKey::generate().public_key();
        let keys = Keys::new(BTreeMap::from([
            (Amount::from(1), one),
            (Amount::from(2), two),
        ]));

        let json = serde_json::to_value(&keys).unwrap();
        assert_eq!(json["1"], one.to_hex());
        assert_eq!(json["2"], two.to_hex());

        let parsed: Keys = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, keys);
        assert_eq!(parsed.amounts(), vec![Amount::from(1), Amount::from(2)]);
    }

    #[test]
    fn secret_key_public_key() {
        let secret = SecretKey::generate();
        let round = SecretKey::from_hex(secret.to_secret_hex()).unwrap();

        assert_eq!(secret.public_key(), round.public_key());
    }
}
