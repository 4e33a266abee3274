//! Mint connector
//!
//! Network capability the wallet calls. Implementations report unreachable mints as
//! [`Error::TransportFailure`] and mint rejections as [`Error::ProtocolError`].

use std::fmt::Debug;

use async_trait::async_trait;

use crate::nuts::{
    CheckStateRequest, CheckStateResponse, Id, KeySet, KeysetResponse, MeltQuoteBolt11Request,
    MeltQuoteBolt11Response, MeltRequest, MintQuoteBolt11Request, MintQuoteBolt11Response,
    MintRequest, MintResponse, RestoreRequest, RestoreResponse, SwapRequest, SwapResponse,
};
use crate::Error;

/// Interface that connects a wallet to a mint
#[async_trait]
pub trait MintConnector: Debug {
    /// Get Active Mint Keys [NUT-01]
    async fn get_mint_keys(&self) -> Result<Vec<KeySet>, Error>;
    /// Get Keyset Keys [NUT-01]
    async fn get_mint_keyset(&self, keyset_id: Id) -> Result<KeySet, Error>;
    /// Get Keysets [NUT-02]
    async fn get_mint_keysets(&self) -> Result<KeysetResponse, Error>;
    /// Mint Quote [NUT-04]
    async fn post_mint_quote(
        &self,
        request: MintQuoteBolt11Request,
    ) -> Result<MintQuoteBolt11Response, Error>;
    /// Mint Quote status
    async fn get_mint_quote_status(&self, quote_id: &str)
        -> Result<MintQuoteBolt11Response, Error>;
    /// Mint Tokens [NUT-04]
    async fn post_mint(&self, request: MintRequest) -> Result<MintResponse, Error>;
    /// Melt Quote [NUT-05]
    async fn post_melt_quote(
        &self,
        request: MeltQuoteBolt11Request,
    ) -> Result<MeltQuoteBolt11Response, Error>;
    /// Melt Quote Status
    async fn get_melt_quote_status(&self, quote_id: &str)
        -> Result<MeltQuoteBolt11Response, Error>;
    /// Melt [NUT-05]
    /// [Nut-08] Lightning fee return if outputs defined
    async fn post_melt(&self, request: MeltRequest) -> Result<MeltQuoteBolt11Response, Error>;
    /// Split Token [NUT-06]
    async fn post_swap(&self, request: SwapRequest) -> Result<SwapResponse, Error>;
    /// Spendable check [NUT-07]
    async fn post_check_state(&self, request: CheckStateRequest)
        -> Result<CheckStateResponse, Error>;
    /// Restore request [NUT-13]
    async fn post_restore(&self, request: RestoreRequest) -> Result<RestoreResponse, Error>;
}
