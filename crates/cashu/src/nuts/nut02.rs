//! NUT-02: Keysets and keyset ID
//!
//! <https://github.com/cashubtc/nuts/blob/main/02.md>

use std::fmt;
use std::str::FromStr;

use bitcoin::hashes::{sha256, Hash};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::nut00::CurrencyUnit;
use super::nut01::Keys;
use crate::Error;

/// Keyset version byte
const KEYSET_VERSION: u8 = 0x00;

/// A keyset ID is an identifier for a specific keyset. It can be derived by anyone who knows
/// the set of public keys of a mint.
///
/// Eight bytes: a version byte followed by the first seven bytes of the SHA-256 of the
/// concatenated compressed keys, sorted by amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id([u8; Self::BYTELEN]);

impl Id {
    const STRLEN: usize = 14;
    const BYTELEN: usize = 8;

    /// Keyset version
    pub fn version(&self) -> u8 {
        self.0[0]
    }

    /// Id bytes
    pub fn to_bytes(&self) -> [u8; Self::BYTELEN] {
        self.0
    }

    /// Parse from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let id: [u8; Self::BYTELEN] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKeysetId(hex::encode(bytes)))?;

        if id[0] != KEYSET_VERSION {
            return Err(Error::InvalidKeysetId(hex::encode(bytes)));
        }

        Ok(Self(id))
    }
}

impl From<&Keys> for Id {
    fn from(keys: &Keys) -> Self {
        let pubkeys_concat: Vec<u8> = keys
            .iter()
            .flat_map(|(_, pubkey)| pubkey.to_bytes())
            .collect();

        let hash = sha256::Hash::hash(&pubkeys_concat).to_byte_array();

        let mut id = [0u8; Self::BYTELEN];
        id[0] = KEYSET_VERSION;
        id[1..].copy_from_slice(&hash[..Self::STRLEN / 2]);

        Self(id)
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != Self::STRLEN + 2 {
            return Err(Error::InvalidKeysetId(s.to_string()));
        }

        let bytes = hex::decode(s).map_err(|_| Error::InvalidKeysetId(s.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let id = String::deserialize(deserializer)?;
        Id::from_str(&id).map_err(serde::de::Error::custom)
    }
}

/// Keyset with its keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySet {
    /// Keyset [`Id`]
    pub id: Id,
    /// Keyset [`CurrencyUnit`]
    pub unit: CurrencyUnit,
    /// Keyset [`Keys`]
    pub keys: Keys,
}

impl KeySet {
    /// Check the advertised id matches the id derived from the keys
    pub fn verify_id(&self) -> Result<(), Error> {
        let derived = Id::from(&self.keys);

        if derived != self.id {
            return Err(Error::IncorrectKeysetId {
                expected: self.id.to_string(),
                derived: derived.to_string(),
            });
        }

        Ok(())
    }
}

/// KeySetInfo
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeySetInfo {
    /// Keyset [`Id`]
    pub id: Id,
    /// Keyset [`CurrencyUnit`]
    pub unit: CurrencyUnit,
    /// Keyset state
    /// Mint will only sign from an active keyset
    pub active: bool,
    /// Input Fee PPK
    #[serde(default)]
    pub input_fee_ppk: u64,
}

/// Ids of mints keyset ids
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysetResponse {
    /// set of public key ids that the mint generates
    pub keysets: Vec<KeySetInfo>,
}

/// Filtering helpers over keyset listings
pub trait KeySetInfosMethods {
    /// Only active keysets
    fn active(&self) -> impl Iterator<Item = &KeySetInfo> + '_;

    /// Only keysets of a unit
    fn unit(&self, unit: CurrencyUnit) -> impl Iterator<Item = &KeySetInfo> + '_;
}

impl KeySetInfosMethods for Vec<KeySetInfo> {
    fn active(&self) -> impl Iterator<Item = &KeySetInfo> + '_ {
        self.iter().filter(|info| info.active)
    }

    fn unit(&self, unit: CurrencyUnit) -> impl Iterator<Item = &KeySetInfo> + '_ {
        self.iter().filter(move |info| info.unit == unit)
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use super::*;
    use crate::nuts::nut01::SecretKey;
    use crate::Amount;

    fn keys() -> Keys {
        let map: BTreeMap<Amount, _> = (0..8)
            .map(|i| (Amount::from(1 << i), SecretKey::generate().public_key()))
            .collect();
        Keys::new(map)
    }

    #[test]
    fn test_deserialization_and_id_generation() {
        let keys = keys();
        let id = Id::from(&keys);

        let id_str = id.to_string();
        assert_eq!(id_str.len(), 16);
        assert!(id_str.starts_with("00"));
        assert_eq!(Id::from_str(&id_str).unwrap(), id);

        let keyset = KeySet {
            id,
            unit: CurrencyUnit::Sat,
            keys: keys.clone(),
        };
        assert!(keyset.verify_id().is_ok());

        let wrong = KeySet {
            id: Id::from(&self::keys()),
            unit: CurrencyUnit::Sat,
            keys,
        };
        assert!(matches!(
            wrong.verify_id(),
            Err(Error::IncorrectKeysetId { .. })
        ));
    }

    #[test]
    fn test_id_from_invalid_str() {
        assert!(Id::from_str("009a1f293253e4").is_err());
        assert!(Id::from_str("019a1f293253e41e").is_err());
        assert!(Id::from_str("009a1f293253e41g").is_err());
        assert!(Id::from_str("009a1f293253e41e").is_ok());
    }

    #[test]
    fn test_keyset_info_defaults_fee() {
        let info: KeySetInfo =
            serde_json::from_str(r#"{"id":"009a1f293253e41e","unit":"sat","active":true}"#)
                .unwrap();

        assert_eq!(info.input_fee_ppk, 0);
        assert_eq!(info.unit, CurrencyUnit::Sat);

        let infos = vec![
            info.clone(),
            KeySetInfo {
                active: false,
                ..info
            },
        ];
        assert_eq!(infos.active().count(), 1);
        assert_eq!(infos.unit(CurrencyUnit::Usd).count(), 0);
    }
}
