//! NUT-10: Spending conditions
//!
//! <https://github.com/cashubtc/nuts/blob/main/10.md>

use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Secret};

/// NUT10 Secret Kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    /// NUT-11 P2PK
    P2PK,
    /// NUT-14 HTLC
    HTLC,
}

/// Secret Date
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretData {
    /// Unique random string
    pub nonce: String,
    /// Expresses the spending condition specific to each kind
    pub data: String,
    /// Additional data committed to and can be used for feature extensions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<Vec<String>>>,
}

/// NUT10 Secret
///
/// Serialized as the two element array `[kind, {nonce, data, tags}]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Nut10Secret {
    /// Kind of the spending condition
    pub kind: Kind,
    /// Secret Data
    pub secret_data: SecretData,
}

impl Nut10Secret {
    /// Create new [`Nut10Secret`]
    pub fn new<S, V>(kind: Kind, nonce: String, data: S, tags: Option<V>) -> Self
    where
        S: Into<String>,
        V: Into<Vec<Vec<String>>>,
    {
        Self {
            kind,
            secret_data: SecretData {
                nonce,
                data: data.into(),
                tags: tags.map(|t| t.into()),
            },
        }
    }
}

impl Serialize for Nut10Secret {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (&self.kind, &self.secret_data).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Nut10Secret {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let (kind, secret_data) = <(Kind, SecretData)>::deserialize(deserializer)?;
        Ok(Self { kind, secret_data })
    }
}

impl TryFrom<Nut10Secret> for Secret {
    type Error = Error;

    fn try_from(value: Nut10Secret) -> Result<Secret, Self::Error> {
        let secret = serde_json::to_string(&value)?;
        Secret::from_str(&secret)
    }
}

impl TryFrom<&Secret> for Nut10Secret {
    type Error = Error;

    fn try_from(secret: &Secret) -> Result<Nut10Secret, Self::Error> {
        Ok(serde_json::from_str(secret.as_str())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_serialize() {
        let secret = Nut10Secret {
            kind: Kind::P2PK,
            secret_data: SecretData {
                nonce: "5d11913ee0f92fefdc82a6764fd2457a".to_string(),
                data: "026562efcfadc8e86d44da6a8adf80633d974302e62c850774db1fb36ff4cc7198"
                    .to_string(),
                tags: Some(vec![vec![
                    "key".to_string(),
                    "value1".to_string(),
                    "value2".to_string(),
                ]]),
            },
        };

        let secret_str = r#"["P2PK",{"nonce":"5d11913ee0f92fefdc82a6764fd2457a","data":"026562efcfadc8e86d44da6a8adf80633d974302e62c850774db1fb36ff4cc7198","tags":[["key","value1","value2"]]}]"#;

        assert_eq!(serde_json::to_string(&secret).unwrap(), secret_str);

        let parsed = Nut10Secret::try_from(&Secret::new(secret_str)).unwrap();
        assert_eq!(parsed, secret);
    }

    #[test]
    fn test_plain_secret_is_not_nut10() {
        assert!(Nut10Secret::try_from(&Secret::generate()).is_err());
    }
}
