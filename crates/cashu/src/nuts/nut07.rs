//! NUT-07: Spendable Check
//!
//! <https://github.com/cashubtc/nuts/blob/main/07.md>

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::nut00::Witness;
use super::nut01::PublicKey;
use crate::Error;

/// State of Proof
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Spent
    Spent,
    /// Unspent
    Unspent,
    /// Pending
    ///
    /// Currently being used in a transaction i.e. melt in progress
    Pending,
    /// Proof is handed out in a token and not yet claimed by the receiver
    PendingSpent,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            State::Spent => "SPENT",
            State::Unspent => "UNSPENT",
            State::Pending => "PENDING",
            State::PendingSpent => "PENDING_SPENT",
        };

        write!(f, "{}", s)
    }
}

impl FromStr for State {
    type Err = Error;

    fn from_str(state: &str) -> Result<Self, Self::Err> {
        match state {
            "SPENT" => Ok(Self::Spent),
            "UNSPENT" => Ok(Self::Unspent),
            "PENDING" => Ok(Self::Pending),
            "PENDING_SPENT" => Ok(Self::PendingSpent),
            _ => Err(Error::UnknownVariant {
                kind: "proof state",
                value: state.to_string(),
            }),
        }
    }
}

/// Check spendable request [NUT-07]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStateRequest {
    /// Y's of the proofs to check
    #[serde(rename = "Ys")]
    pub ys: Vec<PublicKey>,
}

/// Proof state [NUT-07]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofState {
    /// Y of proof
    #[serde(rename = "Y")]
    pub y: PublicKey,
    /// State of proof
    pub state: State,
    /// Witness data if it is supplied
    #[serde(default)]
    pub witness: Option<Witness>,
}

/// Check Spendable Response [NUT-07]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStateResponse {
    /// Proof states
    pub states: Vec<ProofState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_wire_format() {
        assert_eq!(
            serde_json::to_string(&State::PendingSpent).unwrap(),
            "\"PENDING_SPENT\""
        );
        assert_eq!(State::from_str("UNSPENT").unwrap(), State::Unspent);
        assert!(State::from_str("unspent").is_err());
    }
}
