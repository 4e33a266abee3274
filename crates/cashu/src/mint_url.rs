//! Url

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

use crate::Error;

/// Normalized mint url
///
/// Scheme must be `http` or `https`. Host is lowercased and any trailing slash is removed so
/// the same mint always maps to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MintUrl(String);

impl MintUrl {
    /// Url as str
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MintUrl {
    type Err = Error;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        let parsed = Url::parse(url.trim()).map_err(|e| Error::InvalidUrl(e.to_string()))?;

        match parsed.scheme() {
            "http" | "https" => (),
            other => return Err(Error::InvalidUrl(format!("unsupported scheme {other}"))),
        }

        if parsed.host_str().is_none() {
            return Err(Error::InvalidUrl(url.to_string()));
        }

        Ok(Self(parsed.as_str().trim_end_matches('/').to_string()))
    }
}

impl fmt::Display for MintUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for MintUrl {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MintUrl {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        MintUrl::from_str(&s).map_err(serde::de::Error::custom)
    }
}
