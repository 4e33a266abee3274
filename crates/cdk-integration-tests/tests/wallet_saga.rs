//! Wallet Saga Integration Tests
//!
//! Reservation, cancellation and concurrency of send and melt sagas against an in-process
//! mint. Happy paths live in `integration_tests_pure.rs`, crash recovery in `recovery.rs`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use cdk::amount::SplitTarget;
use cdk::database::WalletMemoryDatabase;
use cdk::nuts::{
    CheckStateRequest, CheckStateResponse, CurrencyUnit, Id, KeySet, KeysetResponse,
    MeltQuoteBolt11Request, MeltQuoteBolt11Response, MeltQuoteState, MeltRequest,
    MintQuoteBolt11Request, MintQuoteBolt11Response, MintQuoteState, MintRequest, MintResponse,
    ProofsMethods, RestoreRequest, RestoreResponse, SecretKey, SpendingConditions, State,
    SwapRequest, SwapResponse, Token,
};
use cdk::wallet::{MintConnector, ReceiveOptions, SendOptions};
use cdk::{Amount, Error, WalletBuilder};
use cdk_integration_tests::{
    create_fake_invoice, create_test_mint, create_test_wallet_for_mint, fund_wallet,
    setup_tracing, test_seed, test_wallet_config, DirectMintConnection, Fault, MeltOutcome,
    MintCall, TEST_MINT_URL,
};
use futures::future::join_all;
use tokio::sync::oneshot;

/// Tests that cancelling a prepared send releases proofs back to Unspent
#[tokio::test]
async fn test_send_cancel_releases_proofs() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let wallet = create_test_wallet_for_mint(mint.clone())?;

    fund_wallet(&wallet, &mint, 1000).await?;

    let prepared = wallet
        .prepare_send(Amount::from(400), SendOptions::default())
        .await?;

    let reserved = wallet.get_pending_proofs().await?;
    assert!(!reserved.is_empty());
    assert_eq!(
        reserved.ys()?.into_iter().collect::<HashSet<_>>(),
        prepared.proofs().ys()?.into_iter().collect::<HashSet<_>>()
    );

    prepared.cancel().await?;

    assert!(wallet.get_pending_proofs().await?.is_empty());
    assert_eq!(wallet.total_balance().await?, Amount::from(1000));

    Ok(())
}

/// Tests that proofs reserved by prepare_send cannot be used by another send
#[tokio::test]
async fn test_reserved_proofs_excluded_from_selection() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let wallet = create_test_wallet_for_mint(mint.clone())?;

    fund_wallet(&wallet, &mint, 1000).await?;

    let prepared1 = wallet
        .prepare_send(Amount::from(300), SendOptions::default())
        .await?;
    let prepared2 = wallet
        .prepare_send(Amount::from(300), SendOptions::default())
        .await?;

    let ys1: HashSet<_> = prepared1.proofs().ys()?.into_iter().collect();
    let ys2: HashSet<_> = prepared2.proofs().ys()?.into_iter().collect();
    assert!(ys1.is_disjoint(&ys2));

    // Everything left is less than the full balance
    let result = wallet
        .prepare_send(Amount::from(1000), SendOptions::default())
        .await;
    assert!(matches!(result, Err(Error::InsufficientFunds)));

    prepared1.cancel().await?;

    let prepared3 = wallet
        .prepare_send(Amount::from(300), SendOptions::default())
        .await;
    assert!(prepared3.is_ok());

    Ok(())
}

/// Tests that multiple concurrent send sagas don't interfere with each other
#[tokio::test]
async fn test_concurrent_sends_isolated() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let wallet = create_test_wallet_for_mint(mint.clone())?;

    fund_wallet(&wallet, &mint, 2000).await?;

    let wallet1 = wallet.clone();
    let wallet2 = wallet.clone();

    let (prepared1, prepared2) = tokio::join!(
        wallet1.prepare_send(Amount::from(300), SendOptions::default()),
        wallet2.prepare_send(Amount::from(400), SendOptions::default())
    );
    let prepared1 = prepared1?;
    let prepared2 = prepared2?;

    let ys1: HashSet<_> = prepared1.proofs().ys()?.into_iter().collect();
    let ys2: HashSet<_> = prepared2.proofs().ys()?.into_iter().collect();
    assert!(ys1.is_disjoint(&ys2));

    let (token1, token2) = tokio::join!(prepared1.confirm(None), prepared2.confirm(None));

    assert_eq!(token1?.value()?, Amount::from(300));
    assert_eq!(token2?.value()?, Amount::from(400));

    assert_eq!(wallet.total_balance().await?, Amount::from(1300));
    assert_eq!(
        wallet.get_pending_spent_proofs().await?.total_amount()?,
        Amount::from(700)
    );

    Ok(())
}

/// Tests that racing sends never hand out the same proof twice
#[tokio::test]
async fn test_many_concurrent_sends_disjoint() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let wallet = create_test_wallet_for_mint(mint.clone())?;

    fund_wallet(&wallet, &mint, 1000).await?;

    let sends = (0..4).map(|_| {
        let wallet = wallet.clone();
        async move {
            wallet
                .send(Amount::from(50), SendOptions::default())
                .await
        }
    });
    let tokens = join_all(sends)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    let mut seen = HashSet::new();
    for token in tokens.iter() {
        assert_eq!(token.value()?, Amount::from(50));
        for y in token.proofs.ys()? {
            assert!(seen.insert(y));
        }
    }

    assert_eq!(wallet.total_balance().await?, Amount::from(800));
    assert!(wallet.get_pending_proofs().await?.is_empty());

    Ok(())
}

/// Tests concurrent melt operations are isolated
#[tokio::test]
async fn test_concurrent_melts_isolated() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let wallet = create_test_wallet_for_mint(mint.clone())?;

    fund_wallet(&wallet, &mint, 2000).await?;
    mint.set_melt_outcome(MeltOutcome::Paid {
        fee_paid: Amount::from(1),
    });

    let quote1 = wallet.melt_quote(create_fake_invoice(200), None).await?;
    let quote2 = wallet.melt_quote(create_fake_invoice(300), None).await?;

    let wallet1 = wallet.clone();
    let wallet2 = wallet.clone();

    let (result1, result2) = tokio::join!(wallet1.melt(&quote1.id), wallet2.melt(&quote2.id));

    let melted1 = result1?;
    let melted2 = result2?;

    assert_eq!(melted1.state, MeltQuoteState::Paid);
    assert_eq!(melted2.state, MeltQuoteState::Paid);
    assert_eq!(melted1.fee_paid, Amount::from(1));
    assert_eq!(melted2.fee_paid, Amount::from(1));

    // Unused fee reserve and overshoot come back as change
    assert_eq!(wallet.total_balance().await?, Amount::from(1498));
    assert!(wallet.get_pending_proofs().await?.is_empty());

    Ok(())
}

/// Tests that the same quote cannot be melted twice at once
#[tokio::test]
async fn test_melt_quote_claimed_by_prepared_melt() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let wallet = create_test_wallet_for_mint(mint.clone())?;

    fund_wallet(&wallet, &mint, 500).await?;

    let quote = wallet.melt_quote(create_fake_invoice(100), None).await?;

    let prepared = wallet.prepare_melt(&quote.id, Default::default()).await?;

    let second = wallet.melt(&quote.id).await;
    assert!(matches!(second, Err(Error::QuoteInUse(_))));

    prepared.cancel().await?;

    assert!(wallet.get_pending_proofs().await?.is_empty());
    assert_eq!(wallet.total_balance().await?, Amount::from(500));

    Ok(())
}

/// Tests that a rejected swap compensates the send and leaves the balance untouched
#[tokio::test]
async fn test_rejected_send_swap_compensates() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let wallet = create_test_wallet_for_mint(mint.clone())?;

    fund_wallet(&wallet, &mint, 1000).await?;

    // Locking to a key forces the selected proofs through a swap
    let conditions = SpendingConditions::new_p2pk(SecretKey::generate().public_key(), None)?;
    let prepared = wallet
        .prepare_send(
            Amount::from(333),
            SendOptions {
                conditions: Some(conditions),
                ..Default::default()
            },
        )
        .await?;
    assert!(!prepared.proofs_to_swap().is_empty());

    mint.inject_fault(MintCall::Swap, Fault::Reject("keyset inactive".to_string()));

    let result = prepared.confirm(None).await;
    assert!(matches!(result, Err(Error::ProtocolError(_))));

    assert!(wallet.get_pending_proofs().await?.is_empty());
    assert_eq!(wallet.total_balance().await?, Amount::from(1000));

    let unspent = wallet.get_unspent_proofs().await?;
    let states = wallet.check_proofs_spent(unspent).await?;
    assert!(states.iter().all(|s| s.state == State::Unspent));

    Ok(())
}

/// Tests that a failed receive never removes proofs the wallet already holds
#[tokio::test]
async fn test_failed_receive_keeps_owned_proofs() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let alice = create_test_wallet_for_mint(mint.clone())?;
    let bob = create_test_wallet_for_mint(mint.clone())?;

    fund_wallet(&alice, &mint, 64).await?;
    fund_wallet(&bob, &mint, 20).await?;

    let owned = alice.get_unspent_proofs().await?;
    let owned_ys: HashSet<_> = owned.ys()?.into_iter().collect();
    let foreign = bob.send(Amount::from(8), SendOptions::default()).await?;

    // Alice's own proofs next to Bob's
    let mut mixed = owned.clone();
    mixed.extend(foreign.proofs.clone());
    let mixed = Token::new(alice.mint_url.clone(), mixed, None, CurrencyUnit::Sat);

    let result = alice
        .receive(&mixed.encode()?, ReceiveOptions::default())
        .await;
    assert!(matches!(result, Err(Error::ProofAlreadyHeld(_))));
    assert_eq!(alice.total_balance().await?, Amount::from(64));
    assert!(alice.get_pending_proofs().await?.is_empty());

    // Bob's token alone, rejected at the swap
    mint.inject_fault(MintCall::Swap, Fault::Reject("keyset inactive".to_string()));
    let result = alice
        .receive(&foreign.encode()?, ReceiveOptions::default())
        .await;
    assert!(matches!(result, Err(Error::ProtocolError(_))));

    assert_eq!(alice.total_balance().await?, Amount::from(64));
    assert!(alice.get_pending_proofs().await?.is_empty());
    let unspent: HashSet<_> = alice.get_unspent_proofs().await?.ys()?.into_iter().collect();
    assert_eq!(unspent, owned_ys);

    // Nothing of the failed attempt is left behind
    let received = alice
        .receive(&foreign.encode()?, ReceiveOptions::default())
        .await?;
    assert_eq!(received, Amount::from(8));
    assert_eq!(alice.total_balance().await?, Amount::from(72));

    Ok(())
}

/// Connector that holds back the first mint quote status response until released
#[derive(Debug)]
struct HeldQuoteStatus {
    inner: DirectMintConnection,
    fetched: Mutex<Option<oneshot::Sender<()>>>,
    release: Mutex<Option<oneshot::Receiver<()>>>,
}

#[async_trait]
impl MintConnector for HeldQuoteStatus {
    async fn get_mint_keys(&self) -> Result<Vec<KeySet>, Error> {
        self.inner.get_mint_keys().await
    }

    async fn get_mint_keyset(&self, keyset_id: Id) -> Result<KeySet, Error> {
        self.inner.get_mint_keyset(keyset_id).await
    }

    async fn get_mint_keysets(&self) -> Result<KeysetResponse, Error> {
        self.inner.get_mint_keysets().await
    }

    async fn post_mint_quote(
        &self,
        request: MintQuoteBolt11Request,
    ) -> Result<MintQuoteBolt11Response, Error> {
        self.inner.post_mint_quote(request).await
    }

    async fn get_mint_quote_status(
        &self,
        quote_id: &str,
    ) -> Result<MintQuoteBolt11Response, Error> {
        let response = self.inner.get_mint_quote_status(quote_id).await;

        let release = self.release.lock().unwrap().take();
        if let Some(release) = release {
            if let Some(fetched) = self.fetched.lock().unwrap().take() {
                let _ = fetched.send(());
            }
            let _ = release.await;
        }

        response
    }

    async fn post_mint(&self, request: MintRequest) -> Result<MintResponse, Error> {
        self.inner.post_mint(request).await
    }

    async fn post_melt_quote(
        &self,
        request: MeltQuoteBolt11Request,
    ) -> Result<MeltQuoteBolt11Response, Error> {
        self.inner.post_melt_quote(request).await
    }

    async fn get_melt_quote_status(
        &self,
        quote_id: &str,
    ) -> Result<MeltQuoteBolt11Response, Error> {
        self.inner.get_melt_quote_status(quote_id).await
    }

    async fn post_melt(&self, request: MeltRequest) -> Result<MeltQuoteBolt11Response, Error> {
        self.inner.post_melt(request).await
    }

    async fn post_swap(&self, request: SwapRequest) -> Result<SwapResponse, Error> {
        self.inner.post_swap(request).await
    }

    async fn post_check_state(
        &self,
        request: CheckStateRequest,
    ) -> Result<CheckStateResponse, Error> {
        self.inner.post_check_state(request).await
    }

    async fn post_restore(&self, request: RestoreRequest) -> Result<RestoreResponse, Error> {
        self.inner.post_restore(request).await
    }
}

/// Tests that a quote status fetched before a mint cannot move the issued quote back to paid
#[tokio::test]
async fn test_stale_quote_status_after_mint() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();

    let (fetched_tx, fetched_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel();
    let connector = HeldQuoteStatus {
        inner: DirectMintConnection::new(mint.clone()),
        fetched: Mutex::new(Some(fetched_tx)),
        release: Mutex::new(Some(release_rx)),
    };

    let wallet = WalletBuilder::new()
        .mint_url(TEST_MINT_URL.parse()?)
        .unit(CurrencyUnit::Sat)
        .localstore(Arc::new(WalletMemoryDatabase::new()))
        .seed(test_seed()?)
        .client(Arc::new(connector))
        .config(test_wallet_config())
        .build()?;

    let quote = wallet.mint_quote(Some(Amount::from(100)), None).await?;
    mint.pay_mint_quote(&quote.id)?;

    let stale = tokio::spawn({
        let wallet = wallet.clone();
        let quote_id = quote.id.clone();
        async move { wallet.mint_quote_state(&quote_id).await }
    });

    // The mint said PAID, the wallet has not written it yet
    fetched_rx.await?;

    let proofs = wallet
        .mint(&quote.id, SplitTarget::default(), None)
        .await?;
    assert_eq!(proofs.total_amount()?, Amount::from(100));

    release_tx
        .send(())
        .map_err(|_| anyhow!("quote status call went away"))?;

    let stale = stale.await??;
    assert_eq!(stale.state, MintQuoteState::Issued);

    let stored = wallet
        .localstore
        .get_mint_quote(&quote.id)
        .await?
        .ok_or_else(|| anyhow!("quote missing"))?;
    assert_eq!(stored.state, MintQuoteState::Issued);

    // Issued quotes are not minted again
    let again = wallet.mint(&quote.id, SplitTarget::default(), None).await;
    assert!(again.is_err());
    assert_eq!(wallet.total_balance().await?, Amount::from(100));

    Ok(())
}
