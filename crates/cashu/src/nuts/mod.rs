//! Nuts
//!
//! See all at <https://github.com/cashubtc/nuts>

pub mod nut00;
pub mod nut01;
pub mod nut02;
pub mod nut03;
pub mod nut04;
pub mod nut05;
pub mod nut07;
pub mod nut09;
pub mod nut10;
pub mod nut11;
pub mod nut12;
pub mod nut13;
pub mod nut17;

pub use nut00::{
    BlindSignature, BlindedMessage, CurrencyUnit, PreMint, PreMintSecrets, Proof, Proofs,
    ProofsMethods, Token, Witness,
};
pub use nut01::{Keys, KeysResponse, PublicKey, SecretKey};
pub use nut02::{Id, KeySet, KeySetInfo, KeySetInfosMethods, KeysetResponse};
pub use nut03::{SwapRequest, SwapResponse};
pub use nut04::{
    MintQuoteBolt11Request, MintQuoteBolt11Response, MintRequest, MintResponse,
    QuoteState as MintQuoteState,
};
pub use nut05::{
    MeltOptions, MeltQuoteBolt11Request, MeltQuoteBolt11Response, MeltRequest,
    QuoteState as MeltQuoteState,
};
pub use nut07::{CheckStateRequest, CheckStateResponse, ProofState, State};
pub use nut09::{RestoreRequest, RestoreResponse};
pub use nut10::{Kind, Nut10Secret, SecretData};
pub use nut11::{Conditions, SigFlag, SpendingConditions};
pub use nut12::BlindSignatureDleq;
pub use nut17::{SubscribeParams, SubscriptionKind};
