//! NUT-04: Mint Tokens via Bolt11
//!
//! <https://github.com/cashubtc/nuts/blob/main/04.md>

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::nut00::{BlindSignature, BlindedMessage, CurrencyUnit};
use crate::{Amount, Error};

/// Possible states of a mint quote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QuoteState {
    /// Quote has not been paid
    #[default]
    Unpaid,
    /// Quote has been paid and wallet can mint
    Paid,
    /// ecash issued for quote
    Issued,
}

impl fmt::Display for QuoteState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Unpaid => write!(f, "UNPAID"),
            Self::Paid => write!(f, "PAID"),
            Self::Issued => write!(f, "ISSUED"),
        }
    }
}

impl FromStr for QuoteState {
    type Err = Error;

    fn from_str(state: &str) -> Result<Self, Self::Err> {
        match state {
            "UNPAID" => Ok(Self::Unpaid),
            "PAID" => Ok(Self::Paid),
            "ISSUED" => Ok(Self::Issued),
            _ => Err(Error::UnknownVariant {
                kind: "mint quote state",
                value: state.to_string(),
            }),
        }
    }
}

/// Mint quote request [NUT-04]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintQuoteBolt11Request {
    /// Amount, `None` for an open amount invoice
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Amount>,
    /// Unit wallet would like to pay with
    pub unit: CurrencyUnit,
    /// Memo to create the invoice with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Mint quote response [NUT-04]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintQuoteBolt11Response {
    /// Quote Id
    pub quote: String,
    /// Payment request to fulfil
    pub request: String,
    /// Amount
    #[serde(default)]
    pub amount: Option<Amount>,
    /// Unit
    #[serde(default)]
    pub unit: Option<CurrencyUnit>,
    /// Quote State
    pub state: QuoteState,
    /// Unix timestamp until the quote is valid
    #[serde(default)]
    pub expiry: Option<u64>,
}

/// Mint request [NUT-04]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintRequest {
    /// Quote id
    pub quote: String,
    /// Outputs
    pub outputs: Vec<BlindedMessage>,
}

/// Mint response [NUT-04]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintResponse {
    /// Blinded Signatures
    pub signatures: Vec<BlindSignature>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_state_wire_format() {
        assert_eq!(serde_json::to_string(&QuoteState::Issued).unwrap(), "\"ISSUED\"");
        assert_eq!(QuoteState::from_str("PAID").unwrap(), QuoteState::Paid);
        assert!(QuoteState::from_str("paid").is_err());

        let response: MintQuoteBolt11Response = serde_json::from_str(
            r#"{"quote":"q1","request":"lnbc100n1","state":"UNPAID","expiry":1701704757}"#,
        )
        .unwrap();
        assert_eq!(response.state, QuoteState::Unpaid);
        assert_eq!(response.amount, None);
    }

    #[test]
    fn test_open_amount_request_omits_amount() {
        let request = MintQuoteBolt11Request {
            amount: None,
            unit: CurrencyUnit::Sat,
            description: None,
        };

        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"unit":"sat"}"#
        );
    }
}
