//! Wallet test helpers

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::{RetryPolicy, WalletConfig};
use crate::database::DynWalletDatabase;
use crate::nuts::{
    CheckStateRequest, CheckStateResponse, CurrencyUnit, Id, KeySet, KeysetResponse,
    MeltQuoteBolt11Request, MeltQuoteBolt11Response, MeltRequest, MintQuoteBolt11Request,
    MintQuoteBolt11Response, MintRequest, MintResponse, Proof, RestoreRequest, RestoreResponse,
    SecretKey, SwapRequest, SwapResponse,
};
use crate::secret::Secret;
use crate::wallet::{MintConnector, Wallet, WalletBuilder};
use crate::{Amount, Error};

pub(crate) const MINT_URL: &str = "https://mint.example.com";

/// Seed of every test wallet
pub(crate) const TEST_SEED: [u8; 64] = [7; 64];

/// Connector answering check state and melt quote status with canned responses
///
/// Every other call fails as a transport error.
#[derive(Debug, Default)]
pub(crate) struct MockMintConnector {
    check_state_response: Mutex<Option<Result<CheckStateResponse, Error>>>,
    melt_quote_status_response: Mutex<Option<Result<MeltQuoteBolt11Response, Error>>>,
}

impl MockMintConnector {
    pub(crate) fn set_check_state_response(&self, response: Result<CheckStateResponse, Error>) {
        *self.check_state_response.lock().unwrap() = Some(response);
    }

    pub(crate) fn set_melt_quote_status_response(
        &self,
        response: Result<MeltQuoteBolt11Response, Error>,
    ) {
        *self.melt_quote_status_response.lock().unwrap() = Some(response);
    }
}

fn not_mocked<T>() -> Result<T, Error> {
    Err(Error::TransportFailure("not mocked".to_string()))
}

#[async_trait]
impl MintConnector for MockMintConnector {
    async fn get_mint_keys(&self) -> Result<Vec<KeySet>, Error> {
        not_mocked()
    }

    async fn get_mint_keyset(&self, _keyset_id: Id) -> Result<KeySet, Error> {
        not_mocked()
    }

    async fn get_mint_keysets(&self) -> Result<KeysetResponse, Error> {
        not_mocked()
    }

    async fn post_mint_quote(
        &self,
        _request: MintQuoteBolt11Request,
    ) -> Result<MintQuoteBolt11Response, Error> {
        not_mocked()
    }

    async fn get_mint_quote_status(
        &self,
        _quote_id: &str,
    ) -> Result<MintQuoteBolt11Response, Error> {
        not_mocked()
    }

    async fn post_mint(&self, _request: MintRequest) -> Result<MintResponse, Error> {
        not_mocked()
    }

    async fn post_melt_quote(
        &self,
        _request: MeltQuoteBolt11Request,
    ) -> Result<MeltQuoteBolt11Response, Error> {
        not_mocked()
    }

    async fn get_melt_quote_status(
        &self,
        _quote_id: &str,
    ) -> Result<MeltQuoteBolt11Response, Error> {
        self.melt_quote_status_response
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(not_mocked)
    }

    async fn post_melt(&self, _request: MeltRequest) -> Result<MeltQuoteBolt11Response, Error> {
        not_mocked()
    }

    async fn post_swap(&self, _request: SwapRequest) -> Result<SwapResponse, Error> {
        not_mocked()
    }

    async fn post_check_state(
        &self,
        _request: CheckStateRequest,
    ) -> Result<CheckStateResponse, Error> {
        self.check_state_response
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(not_mocked)
    }

    async fn post_restore(&self, _request: RestoreRequest) -> Result<RestoreResponse, Error> {
        not_mocked()
    }
}

pub(crate) fn keyset_id() -> Id {
    Id::from_bytes(&[0; 8]).unwrap()
}

/// Sat wallet for [`MINT_URL`] without retries
pub(crate) fn test_wallet(db: DynWalletDatabase, client: Arc<MockMintConnector>) -> Wallet {
    let config = WalletConfig {
        retry: RetryPolicy::none(),
        ..Default::default()
    };

    WalletBuilder::new()
        .mint_url(MINT_URL.parse().unwrap())
        .unit(CurrencyUnit::Sat)
        .localstore(db)
        .client(client)
        .config(config)
        .seed(TEST_SEED)
        .build()
        .unwrap()
}

pub(crate) fn test_proof(amount: u64) -> Proof {
    Proof::new(
        Amount::from(amount),
        keyset_id(),
        Secret::generate(),
        SecretKey::generate().public_key(),
    )
}
