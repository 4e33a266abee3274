//! Wallet flows against an in-process mint
//!
//! Every test runs a [`TestMint`](cdk_integration_tests::TestMint) with real keys, so proofs
//! are signed, unblinded and checked with DLEQ exactly as against a remote mint.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cdk::amount::SplitTarget;
use cdk::database::WalletMemoryDatabase;
use cdk::nuts::{
    CurrencyUnit, Id, MeltQuoteState, MintQuoteState, Proof, ProofsMethods, SecretKey,
    SpendingConditions, State, SubscribeParams, SubscriptionKind, Token,
};
use cdk::wallet::{
    MultiMintWallet, NotificationPayload, ReceiveOptions, SendMemo, SendOptions,
    TransactionDirection, WalletKey,
};
use cdk::{Amount, Error, Secret};
use cdk_integration_tests::{
    create_fake_invoice, create_test_mint, create_test_mint_with_fee, create_test_wallet_for_mint,
    create_test_wallet_with_seed, fund_wallet, setup_tracing, test_seed, test_wallet_config, DirectMintConnection, MeltOutcome,
    TEST_MINT_URL,
};

/// Tests that a token sent by one wallet is redeemed by another
#[tokio::test]
async fn test_mint_send_receive() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let alice = create_test_wallet_for_mint(mint.clone())?;
    let bob = create_test_wallet_for_mint(mint.clone())?;

    let minted = fund_wallet(&alice, &mint, 100).await?;
    assert_eq!(minted, Amount::from(100));

    let token = alice
        .send(
            Amount::from(37),
            SendOptions {
                memo: Some(SendMemo::for_token("coffee")),
                ..Default::default()
            },
        )
        .await?;
    assert_eq!(token.value()?, Amount::from(37));
    assert_eq!(token.memo.as_deref(), Some("coffee"));

    assert_eq!(alice.total_balance().await?, Amount::from(63));
    assert_eq!(
        alice.get_pending_spent_proofs().await?.total_amount()?,
        Amount::from(37)
    );

    let received = bob.receive(&token.encode()?, ReceiveOptions::default()).await?;
    assert_eq!(received, Amount::from(37));
    assert_eq!(bob.total_balance().await?, Amount::from(37));

    let incoming = bob
        .list_transactions(Some(TransactionDirection::Incoming))
        .await?;
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].amount, Amount::from(37));
    assert_eq!(incoming[0].memo.as_deref(), Some("coffee"));

    // Bob's swap spent the proofs Alice handed out
    assert_eq!(alice.check_pending_sent_proofs().await?, Amount::from(37));
    assert!(alice.get_pending_spent_proofs().await?.is_empty());

    Ok(())
}

/// Tests that a token cannot be redeemed twice
#[tokio::test]
async fn test_receive_twice_fails() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let alice = create_test_wallet_for_mint(mint.clone())?;
    let bob = create_test_wallet_for_mint(mint.clone())?;

    fund_wallet(&alice, &mint, 64).await?;

    let token = alice
        .send(Amount::from(16), SendOptions::default())
        .await?
        .encode()?;

    bob.receive(&token, ReceiveOptions::default()).await?;

    // Bob still holds the redeemed proofs as spent
    let second = bob.receive(&token, ReceiveOptions::default()).await;
    assert!(matches!(second, Err(Error::ProofAlreadyHeld(_))));

    assert_eq!(bob.total_balance().await?, Amount::from(16));
    assert!(bob.get_pending_proofs().await?.is_empty());

    // Anyone else is turned away by the mint
    let carol = create_test_wallet_for_mint(mint.clone())?;
    let third = carol.receive(&token, ReceiveOptions::default()).await;
    assert!(matches!(third, Err(Error::ProtocolError(_))));

    assert_eq!(carol.total_balance().await?, Amount::ZERO);
    assert!(carol.get_pending_proofs().await?.is_empty());

    Ok(())
}

/// Tests that a token of a keyset the mint does not know is refused before any state change
#[tokio::test]
async fn test_receive_unknown_keyset() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let wallet = create_test_wallet_for_mint(mint.clone())?;

    let keyset_id = Id::from_bytes(&[0, 1, 2, 3, 4, 5, 6, 7])?;
    let proof = Proof::new(
        Amount::from(8),
        keyset_id,
        Secret::generate(),
        SecretKey::generate().public_key(),
    );
    let token = Token::new(
        TEST_MINT_URL.parse()?,
        vec![proof],
        None,
        CurrencyUnit::Sat,
    );

    let result = wallet
        .receive(&token.encode()?, ReceiveOptions::default())
        .await;
    assert!(matches!(result, Err(Error::UnknownKeyset(id)) if id == keyset_id));

    assert!(wallet.get_pending_proofs().await?.is_empty());
    assert!(wallet.list_transactions(None).await?.is_empty());

    Ok(())
}

/// Tests that input fees are charged on swaps and covered by `include_fee`
#[tokio::test]
async fn test_send_with_input_fees() -> Result<()> {
    setup_tracing();
    // One sat per input
    let mint = create_test_mint_with_fee(1_000);
    let alice = create_test_wallet_for_mint(mint.clone())?;
    let bob = create_test_wallet_for_mint(mint.clone())?;

    fund_wallet(&alice, &mint, 200).await?;

    let prepared = alice
        .prepare_send(
            Amount::from(10),
            SendOptions {
                include_fee: true,
                ..Default::default()
            },
        )
        .await?;
    let send_fee = prepared.send_fee();
    let swap_fee = prepared.swap_fee();
    assert!(send_fee > Amount::ZERO);

    let token = prepared.confirm(None).await?;
    let token_value = token.value()?;
    assert_eq!(token_value.to_u64(), 10 + send_fee.to_u64());

    let received = bob.receive(&token.encode()?, ReceiveOptions::default()).await?;
    assert_eq!(received, Amount::from(10));

    let alice_total =
        alice.total_balance().await?.to_u64() + token_value.to_u64() + swap_fee.to_u64();
    assert_eq!(alice_total, 200);

    Ok(())
}

/// Tests that P2PK locked tokens need the right key
#[tokio::test]
async fn test_p2pk_locked_token() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let alice = create_test_wallet_for_mint(mint.clone())?;
    let bob = create_test_wallet_for_mint(mint.clone())?;

    fund_wallet(&alice, &mint, 100).await?;

    let bob_key = SecretKey::generate();
    let conditions = SpendingConditions::new_p2pk(bob_key.public_key(), None)?;

    let token = alice
        .send(
            Amount::from(16),
            SendOptions {
                conditions: Some(conditions),
                ..Default::default()
            },
        )
        .await?
        .encode()?;

    let unsigned = bob.receive(&token, ReceiveOptions::default()).await;
    assert!(matches!(unsigned, Err(Error::ProtocolError(_))));
    assert_eq!(bob.total_balance().await?, Amount::ZERO);

    let received = bob
        .receive(
            &token,
            ReceiveOptions {
                p2pk_signing_keys: vec![bob_key],
                ..Default::default()
            },
        )
        .await?;
    assert_eq!(received, Amount::from(16));

    Ok(())
}

/// Tests that HTLC locked tokens need the preimage
#[tokio::test]
async fn test_htlc_locked_token() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let alice = create_test_wallet_for_mint(mint.clone())?;
    let bob = create_test_wallet_for_mint(mint.clone())?;

    fund_wallet(&alice, &mint, 100).await?;

    let preimage = "ab".repeat(32);
    let conditions = SpendingConditions::new_htlc(preimage.clone(), None)?;

    let token = alice
        .send(
            Amount::from(21),
            SendOptions {
                conditions: Some(conditions),
                ..Default::default()
            },
        )
        .await?
        .encode()?;

    let without = bob.receive(&token, ReceiveOptions::default()).await;
    assert!(without.is_err());

    let received = bob
        .receive(
            &token,
            ReceiveOptions {
                preimages: vec![preimage],
                ..Default::default()
            },
        )
        .await?;
    assert_eq!(received, Amount::from(21));

    Ok(())
}

/// Tests that unused fee reserve comes back as change
#[tokio::test]
async fn test_melt_returns_change() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let wallet = create_test_wallet_for_mint(mint.clone())?;

    fund_wallet(&wallet, &mint, 100).await?;
    mint.set_melt_outcome(MeltOutcome::Paid {
        fee_paid: Amount::from(1),
    });

    let quote = wallet.melt_quote(create_fake_invoice(10), None).await?;
    assert_eq!(quote.amount, Amount::from(10));
    assert_eq!(quote.fee_reserve, Amount::from(2));

    let melted = wallet.melt(&quote.id).await?;

    assert_eq!(melted.state, MeltQuoteState::Paid);
    assert!(melted.preimage.is_some());
    assert_eq!(melted.amount, Amount::from(10));
    assert_eq!(melted.fee_paid, Amount::from(1));
    assert!(melted.change.is_some());

    assert_eq!(wallet.total_balance().await?, Amount::from(89));

    let outgoing = wallet
        .list_transactions(Some(TransactionDirection::Outgoing))
        .await?;
    assert_eq!(outgoing.len(), 1);
    assert_eq!(outgoing[0].quote_id.as_deref(), Some(quote.id.as_str()));

    Ok(())
}

/// Tests that a failed payment releases the inputs
#[tokio::test]
async fn test_failed_melt_releases_inputs() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let wallet = create_test_wallet_for_mint(mint.clone())?;

    fund_wallet(&wallet, &mint, 100).await?;
    mint.set_melt_outcome(MeltOutcome::Failed);

    let quote = wallet.melt_quote(create_fake_invoice(10), None).await?;

    let result = wallet.melt(&quote.id).await;
    assert!(matches!(result, Err(Error::ProtocolError(_))));

    assert_eq!(wallet.total_balance().await?, Amount::from(100));
    assert!(wallet.get_pending_proofs().await?.is_empty());
    assert_eq!(
        wallet.melt_quote_status(&quote.id).await?.state,
        MeltQuoteState::Unpaid
    );

    Ok(())
}

/// Tests that an in-flight payment is settled by `check_pending_melt_quotes`
#[tokio::test]
async fn test_pending_melt_settled_later() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let wallet = create_test_wallet_for_mint(mint.clone())?;

    fund_wallet(&wallet, &mint, 100).await?;
    mint.set_melt_outcome(MeltOutcome::Pending);

    let quote = wallet.melt_quote(create_fake_invoice(10), None).await?;

    let melted = wallet.melt(&quote.id).await?;
    assert_eq!(melted.state, MeltQuoteState::Pending);
    assert!(!wallet.get_pending_proofs().await?.is_empty());

    // Still in flight
    assert!(wallet.check_pending_melt_quotes().await?.is_empty());
    assert!(!wallet.get_pending_proofs().await?.is_empty());

    mint.settle_melt(&quote.id, true)?;

    let settled = wallet.check_pending_melt_quotes().await?;
    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].state, MeltQuoteState::Paid);

    assert!(wallet.get_pending_proofs().await?.is_empty());
    assert_eq!(wallet.total_balance().await?, Amount::from(90));

    Ok(())
}

/// Tests that proofs of a rotated out keyset are still spendable
#[tokio::test]
async fn test_keyset_rotation() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let wallet = create_test_wallet_for_mint(mint.clone())?;

    fund_wallet(&wallet, &mint, 100).await?;
    let old_keyset = wallet.get_active_keyset().await?.id;

    let new_keyset = mint.rotate_keyset(0);
    let keysets = wallet.refresh_keysets().await?;
    assert!(keysets.iter().any(|k| k.id == old_keyset && !k.active));
    assert_eq!(wallet.get_active_keyset().await?.id, new_keyset);

    let old_proofs = wallet.get_unspent_proofs().await?;
    wallet
        .swap(None, SplitTarget::default(), old_proofs, None, false)
        .await?;

    let proofs = wallet.get_unspent_proofs().await?;
    assert_eq!(proofs.total_amount()?, Amount::from(100));
    assert!(proofs.iter().all(|p| p.keyset_id == new_keyset));

    Ok(())
}

/// Tests that an unredeemed token can be taken back
#[tokio::test]
async fn test_reclaim_unredeemed_token() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let wallet = create_test_wallet_for_mint(mint.clone())?;

    fund_wallet(&wallet, &mint, 100).await?;

    let token = wallet.send(Amount::from(20), SendOptions::default()).await?;
    assert_eq!(wallet.total_balance().await?, Amount::from(80));

    let reclaimed = wallet.reclaim_unspent(token.proofs.clone()).await?;
    assert_eq!(reclaimed, Amount::from(20));

    assert_eq!(wallet.total_balance().await?, Amount::from(100));
    assert!(wallet.get_pending_spent_proofs().await?.is_empty());

    for proof in token.proofs.iter() {
        assert!(mint.is_spent(&proof.y()?));
    }

    Ok(())
}

/// Tests that every paid quote is minted by `check_all_mint_quotes`
#[tokio::test]
async fn test_check_all_mint_quotes() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let wallet = create_test_wallet_for_mint(mint.clone())?;

    let paid = wallet.mint_quote(Some(Amount::from(10)), None).await?;
    let also_paid = wallet.mint_quote(Some(Amount::from(20)), None).await?;
    let unpaid = wallet.mint_quote(Some(Amount::from(40)), None).await?;

    mint.pay_mint_quote(&paid.id)?;
    mint.pay_mint_quote(&also_paid.id)?;

    assert_eq!(wallet.check_all_mint_quotes().await?, Amount::from(30));
    assert_eq!(wallet.total_balance().await?, Amount::from(30));

    assert_eq!(
        wallet.mint_quote_state(&paid.id).await?.state,
        MintQuoteState::Issued
    );
    assert_eq!(
        wallet.mint_quote_state(&unpaid.id).await?.state,
        MintQuoteState::Unpaid
    );

    // An issued quote cannot be minted again
    let again = wallet.mint(&paid.id, SplitTarget::default(), None).await;
    assert!(again.is_err());
    assert_eq!(wallet.total_balance().await?, Amount::from(30));

    Ok(())
}

/// Tests that a mint quote subscription sees the payment
#[tokio::test]
async fn test_mint_quote_subscription() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let wallet = create_test_wallet_for_mint(mint.clone())?;

    let quote = wallet.mint_quote(Some(Amount::from(50)), None).await?;

    let subscription = wallet
        .subscribe(SubscribeParams::new(
            SubscriptionKind::Bolt11MintQuote,
            vec![quote.id.clone()],
        ))
        .await?;

    let current = subscription.recv_timeout(Duration::from_secs(5)).await?;
    assert!(matches!(
        current,
        NotificationPayload::MintQuoteUpdate(ref q) if q.state == MintQuoteState::Unpaid
    ));

    mint.pay_mint_quote(&quote.id)?;

    let paid = subscription.recv_timeout(Duration::from_secs(5)).await?;
    assert!(matches!(
        paid,
        NotificationPayload::MintQuoteUpdate(ref q) if q.id == quote.id && q.state == MintQuoteState::Paid
    ));

    subscription.close();
    assert!(matches!(
        subscription.recv().await,
        Err(Error::SubscriptionClosed)
    ));

    Ok(())
}

/// Tests that proof state subscriptions see a token being redeemed
#[tokio::test]
async fn test_proof_state_subscription() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let alice = create_test_wallet_for_mint(mint.clone())?;
    let bob = create_test_wallet_for_mint(mint.clone())?;

    fund_wallet(&alice, &mint, 32).await?;

    let token = alice.send(Amount::from(8), SendOptions::default()).await?;
    let y = token.proofs[0].y()?;

    let subscription = alice
        .subscribe(SubscribeParams::new(
            SubscriptionKind::ProofState,
            vec![y.to_hex()],
        ))
        .await?;

    let current = subscription.recv_timeout(Duration::from_secs(5)).await?;
    assert!(matches!(
        current,
        NotificationPayload::ProofState(ref s) if s.state == State::Unspent
    ));

    bob.receive(&token.encode()?, ReceiveOptions::default()).await?;

    let spent = subscription.recv_timeout(Duration::from_secs(5)).await?;
    assert!(matches!(
        spent,
        NotificationPayload::ProofState(ref s) if s.y == y && s.state == State::Spent
    ));

    Ok(())
}

/// Tests routing between wallets of several mints
#[tokio::test]
async fn test_multi_mint_wallet() -> Result<()> {
    setup_tracing();
    let mint_a = create_test_mint();
    let mint_b = create_test_mint();

    let multi = MultiMintWallet::new(
        Arc::new(WalletMemoryDatabase::new()),
        test_seed()?,
        test_wallet_config(),
    );

    let url_a: cdk::MintUrl = "https://a.testmint.example".parse()?;
    let url_b: cdk::MintUrl = "https://b.testmint.example".parse()?;

    let wallet_a = multi
        .create_and_add_wallet(
            url_a.clone(),
            CurrencyUnit::Sat,
            Arc::new(DirectMintConnection::new(mint_a.clone())),
        )
        .await?;
    let wallet_b = multi
        .create_and_add_wallet(
            url_b.clone(),
            CurrencyUnit::Sat,
            Arc::new(DirectMintConnection::new(mint_b.clone())),
        )
        .await?;

    fund_wallet(&wallet_a, &mint_a, 10).await?;
    fund_wallet(&wallet_b, &mint_b, 50).await?;

    assert_eq!(multi.total_balance(&CurrencyUnit::Sat).await?, Amount::from(60));

    // Only mint b covers it
    let token = multi
        .send(&CurrencyUnit::Sat, Amount::from(30), SendOptions::default())
        .await?;
    assert_eq!(token.mint_url, url_b);

    // Neither mint covers it on its own
    let too_much = multi
        .send(&CurrencyUnit::Sat, Amount::from(25), SendOptions::default())
        .await;
    assert!(matches!(too_much, Err(Error::InsufficientFunds)));

    let recipient = MultiMintWallet::new(
        Arc::new(WalletMemoryDatabase::new()),
        test_seed()?,
        test_wallet_config(),
    );
    recipient
        .create_and_add_wallet(
            url_b.clone(),
            CurrencyUnit::Sat,
            Arc::new(DirectMintConnection::new(mint_b.clone())),
        )
        .await?;

    let received = recipient
        .receive(&token.encode()?, ReceiveOptions::default())
        .await?;
    assert_eq!(received, Amount::from(30));
    assert_eq!(
        recipient.total_balance(&CurrencyUnit::Sat).await?,
        Amount::from(30)
    );

    let balances = multi.get_balances(&CurrencyUnit::Sat).await?;
    assert_eq!(balances.get(&url_a), Some(&Amount::from(10)));
    assert_eq!(balances.get(&url_b), Some(&Amount::from(20)));

    let missing = WalletKey::new(url_a, CurrencyUnit::Usd);
    assert!(matches!(
        multi.get_wallet(&missing).await,
        Err(Error::UnknownWallet(_))
    ));

    Ok(())
}

/// Tests that signatures without a DLEQ proof are still accepted
#[tokio::test]
async fn test_signatures_without_dleq() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    mint.set_dleq(false);
    let wallet = create_test_wallet_for_mint(mint.clone())?;

    fund_wallet(&wallet, &mint, 50).await?;

    let proofs = wallet.get_unspent_proofs().await?;
    assert_eq!(proofs.total_amount()?, Amount::from(50));

    Ok(())
}

/// Tests minting against a quote created without an amount
#[tokio::test]
async fn test_open_amount_mint_quote() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let wallet = create_test_wallet_for_mint(mint.clone())?;

    let quote = wallet.mint_quote(None, None).await?;
    assert_eq!(quote.amount, None);

    let early = wallet.mint(&quote.id, SplitTarget::default(), None).await;
    assert!(matches!(early, Err(Error::QuoteNotPaid)));

    mint.pay_open_mint_quote(&quote.id, Amount::from(42))?;

    let proofs = wallet
        .mint(&quote.id, SplitTarget::default(), None)
        .await?;
    assert_eq!(proofs.total_amount()?, Amount::from(42));
    assert_eq!(wallet.total_balance().await?, Amount::from(42));

    let issued = wallet.mint_quote_state(&quote.id).await?;
    assert_eq!(issued.state, MintQuoteState::Issued);
    assert_eq!(issued.amount, Some(Amount::from(42)));

    Ok(())
}

/// Tests that a wallet rebuilt from its seed finds its unspent proofs
#[tokio::test]
async fn test_restore_from_seed() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let seed = test_seed()?;
    let alice = create_test_wallet_with_seed(
        mint.clone(),
        Arc::new(WalletMemoryDatabase::new()),
        seed,
    )?;
    let bob = create_test_wallet_for_mint(mint.clone())?;

    fund_wallet(&alice, &mint, 100).await?;
    let token = alice.send(Amount::from(30), SendOptions::default()).await?;
    bob.receive(&token.encode()?, ReceiveOptions::default()).await?;
    assert_eq!(alice.total_balance().await?, Amount::from(70));

    // Same seed, empty store
    let restored = create_test_wallet_with_seed(
        mint.clone(),
        Arc::new(WalletMemoryDatabase::new()),
        seed,
    )?;
    assert_eq!(restored.restore().await?, Amount::from(70));
    assert_eq!(restored.total_balance().await?, Amount::from(70));

    // Nothing new the second time
    assert_eq!(restored.restore().await?, Amount::ZERO);
    assert_eq!(restored.total_balance().await?, Amount::from(70));

    // Counters moved past the restored outputs, so new outputs are accepted
    let token = restored
        .send(Amount::from(10), SendOptions::default())
        .await?;
    assert_eq!(
        bob.receive(&token.encode()?, ReceiveOptions::default())
            .await?,
        Amount::from(10)
    );
    assert_eq!(restored.total_balance().await?, Amount::from(60));

    Ok(())
}

/// Tests that a different seed restores nothing
#[tokio::test]
async fn test_restore_other_seed_finds_nothing() -> Result<()> {
    setup_tracing();
    let mint = create_test_mint();
    let wallet = create_test_wallet_for_mint(mint.clone())?;

    fund_wallet(&wallet, &mint, 50).await?;

    let stranger = create_test_wallet_for_mint(mint.clone())?;
    assert_eq!(stranger.restore().await?, Amount::ZERO);
    assert_eq!(stranger.total_balance().await?, Amount::ZERO);

    Ok(())
}
