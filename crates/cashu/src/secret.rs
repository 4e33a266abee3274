//! Secret

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::util::random_hex_32;
use crate::Error;

/// The secret data that allows spending ecash
///
/// Either 32 random bytes hex encoded or a serialized well-known secret carrying
/// spending conditions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Create secret from string
    pub fn new<S>(secret: S) -> Self
    where
        S: Into<String>,
    {
        Self(secret.into())
    }

    /// Create new random secret
    pub fn generate() -> Self {
        Self(random_hex_32())
    }

    /// Bytes hashed to the curve
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Secret as str
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Secret {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_from_str() {
        let secret = Secret::generate();

        assert_eq!(secret.as_str().len(), 64);
        assert!(hex::decode(secret.as_str()).is_ok());
        assert_ne!(secret, Secret::generate());
    }
}
