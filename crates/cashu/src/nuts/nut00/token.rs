//! Cashu Token
//!
//! <https://github.com/cashubtc/nuts/blob/main/00.md>

use std::fmt;
use std::str::FromStr;

use base64::engine::{general_purpose, DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::{alphabet, Engine as _};
use serde::{Deserialize, Serialize};

use super::{CurrencyUnit, Proofs, ProofsMethods};
use crate::mint_url::MintUrl;
use crate::{Amount, Error};

const TOKEN_PREFIX_V3: &str = "cashuA";

/// Url safe base64 that accepts input with or without padding
const URL_SAFE_INDIFFERENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Token
///
/// Proofs from a single mint in a single unit, with an optional memo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Mint url
    pub mint_url: MintUrl,
    /// Unit
    pub unit: CurrencyUnit,
    /// Proofs
    pub proofs: Proofs,
    /// Memo for token
    pub memo: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct TokenV3 {
    token: Vec<TokenV3Entry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    memo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unit: Option<CurrencyUnit>,
}

#[derive(Serialize, Deserialize)]
struct TokenV3Entry {
    mint: MintUrl,
    proofs: Proofs,
}

impl Token {
    /// Create new [`Token`]
    pub fn new(mint_url: MintUrl, proofs: Proofs, memo: Option<String>, unit: CurrencyUnit) -> Self {
        Self {
            mint_url,
            unit,
            proofs,
            memo,
        }
    }

    /// Total value of the token
    pub fn value(&self) -> Result<Amount, Error> {
        self.proofs.total_amount()
    }

    /// Serialize to the `cashuA` text form
    pub fn encode(&self) -> Result<String, Error> {
        let token = TokenV3 {
            token: vec![TokenV3Entry {
                mint: self.mint_url.clone(),
                proofs: self.proofs.clone(),
            }],
            memo: self.memo.clone(),
            unit: Some(self.unit.clone()),
        };

        let json = serde_json::to_string(&token)?;
        let encoded = general_purpose::URL_SAFE.encode(json);

        Ok(format!("{TOKEN_PREFIX_V3}{encoded}"))
    }

    /// Parse the `cashuA` text form
    ///
    /// Entries for the same mint are merged. Tokens spanning several mints, empty tokens and
    /// anything not well formed are rejected with [`Error::MalformedToken`].
    pub fn decode(s: &str) -> Result<Self, Error> {
        let encoded = s
            .trim()
            .strip_prefix(TOKEN_PREFIX_V3)
            .ok_or_else(|| Error::MalformedToken("unsupported token prefix".to_string()))?;

        let bytes = URL_SAFE_INDIFFERENT
            .decode(encoded)
            .map_err(|e| Error::MalformedToken(e.to_string()))?;

        let token: TokenV3 =
            serde_json::from_slice(&bytes).map_err(|e| Error::MalformedToken(e.to_string()))?;

        let mut entries = token.token.into_iter();
        let first = entries
            .next()
            .ok_or_else(|| Error::MalformedToken("token has no entries".to_string()))?;

        let mint_url = first.mint;
        let mut proofs = first.proofs;

        for entry in entries {
            if entry.mint != mint_url {
                return Err(Error::MalformedToken(
                    "token spans multiple mints".to_string(),
                ));
            }
            proofs.extend(entry.proofs);
        }

        if proofs.is_empty() {
            return Err(Error::MalformedToken("token has no proofs".to_string()));
        }

        if proofs.iter().any(|p| p.amount == Amount::ZERO) {
            return Err(Error::MalformedToken("token has zero amount proof".to_string()));
        }

        // Reject tokens whose value cannot be represented
        proofs
            .total_amount()
            .map_err(|_| Error::MalformedToken("token amount overflows".to_string()))?;

        Ok(Self {
            mint_url,
            unit: token.unit.unwrap_or_default(),
            proofs,
            memo: token.memo,
        })
    }
}

impl FromStr for Token {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = self.encode().map_err(|_| fmt::Error)?;
        f.write_str(&token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nuts::nut00::{Proof, Witness};
    use crate::nuts::nut01::SecretKey;
    use crate::nuts::nut02::Id;
    use crate::Secret;

    fn proof(amount: u64) -> Proof {
        Proof::new(
            Amount::from(amount),
            Id::from_str("009a1f293253e41e").unwrap(),
            Secret::generate(),
            SecretKey::generate().public_key(),
        )
    }

    fn mint_url() -> MintUrl {
        MintUrl::from_str("https://8333.space:3338").unwrap()
    }

    #[test]
    fn test_token_str_round_trip() {
        let mut witnessed = proof(8);
        witnessed.witness = Some(Witness::P2PKWitness {
            signatures: vec!["00".repeat(64)],
        });

        let token = Token::new(
            mint_url(),
            vec![proof(2), witnessed],
            Some("Thank you.".to_string()),
            CurrencyUnit::Sat,
        );

        let encoded = token.to_string();
        assert!(encoded.starts_with("cashuA"));

        let decoded = Token::from_str(&encoded).unwrap();
        assert_eq!(decoded, token);
        assert_eq!(decoded.value().unwrap(), Amount::from(10));
    }

    #[test]
    fn test_token_merges_same_mint_entries() {
        let json = serde_json::json!({
            "token": [
                {"mint": "https://8333.space:3338/", "proofs": [proof(1)]},
                {"mint": "https://8333.space:3338", "proofs": [proof(4)]}
            ]
        });
        let encoded = format!(
            "cashuA{}",
            general_purpose::URL_SAFE_NO_PAD.encode(json.to_string())
        );

        let token = Token::decode(&encoded).unwrap();
        assert_eq!(token.proofs.len(), 2);
        assert_eq!(token.unit, CurrencyUnit::Sat);
        assert_eq!(token.memo, None);
    }

    #[test]
    fn test_token_rejects_multiple_mints() {
        let json = serde_json::json!({
            "token": [
                {"mint": "https://a.example.com", "proofs": [proof(1)]},
                {"mint": "https://b.example.com", "proofs": [proof(4)]}
            ],
            "unit": "sat"
        });
        let encoded = format!("cashuA{}", general_purpose::URL_SAFE.encode(json.to_string()));

        assert!(matches!(
            Token::decode(&encoded),
            Err(Error::MalformedToken(_))
        ));
    }

    #[test]
    fn test_malformed_tokens() {
        // token field is a string instead of a list
        assert!(matches!(
            Token::decode("cashuAeyJ0b2tlbiI6IltdIiwibWVtbyI6IiJ9"),
            Err(Error::MalformedToken(_))
        ));
        assert!(Token::decode("cashuBo2F0").is_err());
        assert!(Token::decode("cashuA!!!").is_err());
        assert!(Token::decode("").is_err());

        let empty = serde_json::json!({ "token": [] });
        let encoded = format!("cashuA{}", general_purpose::URL_SAFE.encode(empty.to_string()));
        assert!(Token::decode(&encoded).is_err());
    }
}
