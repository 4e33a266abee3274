//! Wallet types: quotes, transactions and saga records

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bitcoin::hashes::{sha256, Hash};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mint_url::MintUrl;
use crate::nuts::{
    CurrencyUnit, MeltQuoteBolt11Response, MeltQuoteState, MintQuoteState, PreMintSecrets,
    PublicKey,
};
use crate::util::unix_time;
use crate::{Amount, Error};

/// Mint Quote Info
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintQuote {
    /// Quote id
    pub id: String,
    /// Mint Url
    pub mint_url: MintUrl,
    /// Amount of quote, `None` for open amount quotes
    pub amount: Option<Amount>,
    /// Unit of quote
    pub unit: CurrencyUnit,
    /// Quote payment request e.g. bolt11
    pub request: String,
    /// Quote state
    pub state: MintQuoteState,
    /// Expiration time of quote
    pub expiry: u64,
}

/// Melt Quote Info
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeltQuote {
    /// Quote id
    pub id: String,
    /// Mint Url
    pub mint_url: MintUrl,
    /// Quote unit
    pub unit: CurrencyUnit,
    /// Quote amount
    pub amount: Amount,
    /// Quote Payment request e.g. bolt11
    pub request: String,
    /// Quote fee reserve
    pub fee_reserve: Amount,
    /// Quote state
    pub state: MeltQuoteState,
    /// Expiration time of quote
    pub expiry: u64,
    /// Payment preimage
    pub payment_preimage: Option<String>,
}

impl MeltQuote {
    /// Build from the mint response to a quote request
    pub fn from_response(
        response: MeltQuoteBolt11Response,
        mint_url: MintUrl,
        unit: CurrencyUnit,
        request: String,
    ) -> Self {
        Self {
            id: response.quote,
            mint_url,
            unit,
            amount: response.amount,
            request,
            fee_reserve: response.fee_reserve,
            state: response.state,
            expiry: response.expiry,
            payment_preimage: response.payment_preimage,
        }
    }

    /// Amount the inputs have to cover
    pub fn inputs_needed(&self) -> Result<Amount, Error> {
        self.amount
            .checked_add(self.fee_reserve)
            .ok_or(Error::AmountOverflow)
    }
}

/// Transaction direction
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionDirection {
    /// Incoming transaction (i.e., receive or mint)
    Incoming,
    /// Outgoing transaction (i.e., send or melt)
    Outgoing,
}

impl fmt::Display for TransactionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionDirection::Incoming => write!(f, "Incoming"),
            TransactionDirection::Outgoing => write!(f, "Outgoing"),
        }
    }
}

impl FromStr for TransactionDirection {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Incoming" => Ok(Self::Incoming),
            "Outgoing" => Ok(Self::Outgoing),
            _ => Err(Error::Custom(format!("invalid transaction direction `{value}`"))),
        }
    }
}

/// Transaction ID
///
/// SHA-256 over the sorted compressed Ys of the proofs involved.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId([u8; 32]);

impl TransactionId {
    /// Create new [`TransactionId`] from proof ys
    pub fn from_ys(mut ys: Vec<PublicKey>) -> Result<Self, Error> {
        if ys.is_empty() {
            return Err(Error::Custom("transaction has no proofs".to_string()));
        }

        ys.sort();
        let bytes: Vec<u8> = ys.iter().flat_map(|y| y.to_bytes()).collect();

        Ok(Self(sha256::Hash::hash(&bytes).to_byte_array()))
    }

    /// Hex encoded id
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Wallet transaction
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Mint Url
    pub mint_url: MintUrl,
    /// Transaction direction
    pub direction: TransactionDirection,
    /// Amount
    pub amount: Amount,
    /// Fee
    pub fee: Amount,
    /// Currency Unit
    pub unit: CurrencyUnit,
    /// Proof Ys
    pub ys: Vec<PublicKey>,
    /// Unix timestamp
    pub timestamp: u64,
    /// Memo
    pub memo: Option<String>,
    /// User-defined metadata
    pub metadata: Metadata,
    /// Quote ID if this is a mint or melt transaction
    pub quote_id: Option<String>,
}

impl Transaction {
    /// Transaction ID
    pub fn id(&self) -> Result<TransactionId, Error> {
        TransactionId::from_ys(self.ys.clone())
    }

    /// Check if transaction matches conditions
    pub fn matches_conditions(
        &self,
        mint_url: &Option<MintUrl>,
        direction: &Option<TransactionDirection>,
        unit: &Option<CurrencyUnit>,
    ) -> bool {
        if let Some(mint_url) = mint_url {
            if &self.mint_url != mint_url {
                return false;
            }
        }
        if let Some(direction) = direction {
            if &self.direction != direction {
                return false;
            }
        }
        if let Some(unit) = unit {
            if &self.unit != unit {
                return false;
            }
        }
        true
    }
}

/// Step reached by a send saga
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendSagaState {
    /// Proofs reserved for the token
    ProofsReserved,
    /// Swap for token denominations sent to the mint
    SwapRequested,
}

/// Step reached by a receive saga
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiveSagaState {
    /// Incoming proofs stored as pending
    ProofsPending,
    /// Swap sent to the mint
    SwapRequested,
}

/// Step reached by a swap saga
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapSagaState {
    /// Inputs reserved
    ProofsReserved,
    /// Swap sent to the mint
    SwapRequested,
}

/// Step reached by a melt saga
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeltSagaState {
    /// Inputs reserved
    ProofsReserved,
    /// Melt sent to the mint
    MeltRequested,
}

/// Step reached by an issue saga
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueSagaState {
    /// Quote claimed and outputs prepared
    SecretsPrepared,
    /// Mint request sent
    MintRequested,
}

/// Saga state per operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletSagaState {
    /// Send
    Send(SendSagaState),
    /// Receive
    Receive(ReceiveSagaState),
    /// Swap
    Swap(SwapSagaState),
    /// Melt
    Melt(MeltSagaState),
    /// Issue
    Issue(IssueSagaState),
}

/// Data needed to resume or undo an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationData {
    /// Send
    Send {
        /// Amount being sent
        amount: Amount,
        /// Memo
        memo: Option<String>,
        /// Outputs of the swap for token denominations, set before the request
        outputs: Option<PreMintSecrets>,
    },
    /// Receive
    Receive {
        /// Token value
        token_amount: Amount,
        /// Outputs of the receive swap, set before the request
        outputs: Option<PreMintSecrets>,
    },
    /// Swap
    Swap {
        /// Value of the inputs
        input_amount: Amount,
        /// Outputs, set before the request
        outputs: Option<PreMintSecrets>,
    },
    /// Melt
    Melt {
        /// Quote id
        quote_id: String,
        /// Quote amount
        amount: Amount,
        /// Fee reserve
        fee_reserve: Amount,
        /// Blank change outputs, set before the request
        change_outputs: Option<PreMintSecrets>,
    },
    /// Issue
    Issue {
        /// Quote id
        quote_id: String,
        /// Amount minted
        amount: Amount,
        /// Outputs, set before the request
        outputs: Option<PreMintSecrets>,
    },
}

/// Write-ahead record of an in-flight operation
///
/// Written before the first side effect and deleted once the operation completes, so crash
/// recovery can find what was left behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletSaga {
    /// Operation id
    pub id: Uuid,
    /// Step reached
    pub state: WalletSagaState,
    /// Amount involved
    pub amount: Amount,
    /// Mint Url
    pub mint_url: MintUrl,
    /// Unit
    pub unit: CurrencyUnit,
    /// Operation data
    pub data: OperationData,
    /// Optimistic concurrency version
    pub version: u32,
    /// Creation time
    pub created_at: u64,
    /// Last update time
    pub updated_at: u64,
}

impl WalletSaga {
    /// Create new [`WalletSaga`]
    pub fn new(
        id: Uuid,
        state: WalletSagaState,
        amount: Amount,
        mint_url: MintUrl,
        unit: CurrencyUnit,
        data: OperationData,
    ) -> Self {
        let now = unix_time();
        Self {
            id,
            state,
            amount,
            mint_url,
            unit,
            data,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to the next step, bumping the version
    pub fn advance(&mut self, state: WalletSagaState, data: OperationData) {
        self.state = state;
        self.data = data;
        self.version += 1;
        self.updated_at = unix_time();
    }
}

/// Metadata attached to transactions
pub type Metadata = BTreeMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nuts::SecretKey;

    #[test]
    fn test_transaction_id_ignores_order() {
        let a = SecretKey::generate().public_key();
        let b = SecretKey::generate().public_key();

        let first = TransactionId::from_ys(vec![a, b]).unwrap();
        let second = TransactionId::from_ys(vec![b, a]).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.to_hex().len(), 64);

        assert!(TransactionId::from_ys(vec![]).is_err());
    }

    #[test]
    fn test_saga_advance_bumps_version() {
        let mut saga = WalletSaga::new(
            Uuid::new_v4(),
            WalletSagaState::Swap(SwapSagaState::ProofsReserved),
            Amount::from(8),
            MintUrl::from_str("https://example.com").unwrap(),
            CurrencyUnit::Sat,
            OperationData::Swap {
                input_amount: Amount::from(8),
                outputs: None,
            },
        );

        saga.advance(
            WalletSagaState::Swap(SwapSagaState::SwapRequested),
            saga.data.clone(),
        );
        assert_eq!(saga.version, 1);
        assert_eq!(saga.state, WalletSagaState::Swap(SwapSagaState::SwapRequested));
    }
}
