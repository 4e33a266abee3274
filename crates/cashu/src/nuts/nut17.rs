//! NUT-17: WebSocket subscriptions
//!
//! <https://github.com/cashubtc/nuts/blob/main/17.md>

use serde::{Deserialize, Serialize};

/// What a subscription listens to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    /// Bolt 11 Melt Quote
    Bolt11MeltQuote,
    /// Bolt 11 Mint Quote
    Bolt11MintQuote,
    /// Proof State
    ProofState,
}

/// Subscription Parameter according to the standard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeParams {
    /// Kind
    pub kind: SubscriptionKind,
    /// Filters: quote ids or hex encoded proof Ys depending on kind
    pub filters: Vec<String>,
    /// Subscription Id, generated when absent
    #[serde(default, rename = "subId", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl SubscribeParams {
    /// Subscribe to a set of filters of one kind
    pub fn new(kind: SubscriptionKind, filters: Vec<String>) -> Self {
        Self {
            kind,
            filters,
            id: None,
        }
    }
}
