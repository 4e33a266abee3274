//! Receive
//!
//! Redeems a token by swapping its proofs at the mint, and takes back unredeemed proofs
//! handed out earlier.

use std::collections::HashSet;

use tracing::instrument;
use uuid::Uuid;

use crate::amount::SplitTarget;
use crate::nuts::{Proofs, ProofsMethods, PublicKey, SecretKey, State, Token};
use crate::wallet::saga::finish_saga;
use crate::wallet::swap::saga::SwapSaga;
use crate::wallet::types::Metadata;
use crate::{Amount, Error, Wallet};

pub(crate) mod saga;

use saga::ReceiveSaga;

/// Receive options
#[derive(Debug, Clone, Default)]
pub struct ReceiveOptions {
    /// Amount split target of the new proofs
    pub amount_split_target: SplitTarget,
    /// Keys to sign P2PK locked proofs with
    pub p2pk_signing_keys: Vec<SecretKey>,
    /// Preimages for HTLC locked proofs
    pub preimages: Vec<String>,
    /// Metadata stored with the transaction
    pub metadata: Metadata,
}

impl Wallet {
    /// Receive an encoded token
    ///
    /// The token must be for this wallet's mint and unit. Every proof is swapped for a fresh
    /// one; the amount received after the swap fee is returned. A token that fails to decode
    /// leaves the store untouched. Proofs the wallet already stores are refused with
    /// [`Error::ProofAlreadyHeld`]; use [`Wallet::reclaim_unspent`] to take back a token this
    /// wallet handed out.
    ///
    /// # Example
    /// ```no_run
    /// # use cdk::wallet::{ReceiveOptions, Wallet};
    /// # async fn example(wallet: &Wallet, token: &str) -> Result<(), Box<dyn std::error::Error>> {
    /// let amount = wallet.receive(token, ReceiveOptions::default()).await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all, err)]
    pub async fn receive(
        &self,
        encoded_token: &str,
        options: ReceiveOptions,
    ) -> Result<Amount, Error> {
        let token = Token::decode(encoded_token)?;

        if token.mint_url != self.mint_url {
            return Err(Error::IncorrectMint);
        }
        if token.unit != self.unit {
            return Err(Error::UnsupportedUnit(token.unit));
        }

        self.receive_proofs(token.proofs, options, token.memo).await
    }

    /// Receive proofs of this wallet's mint
    #[instrument(skip_all, err)]
    pub async fn receive_proofs(
        &self,
        proofs: Proofs,
        options: ReceiveOptions,
        memo: Option<String>,
    ) -> Result<Amount, Error> {
        ReceiveSaga::new(self.clone())
            .validate(proofs, memo, options)
            .await?
            .execute()
            .await
    }

    /// Take back proofs handed out in a token the recipient has not redeemed
    ///
    /// Proofs the mint reports spent are settled as `SPENT`; the rest are swapped for fresh
    /// unspent proofs. Returns the amount reclaimed.
    #[instrument(skip_all, err)]
    pub async fn reclaim_unspent(&self, proofs: Proofs) -> Result<Amount, Error> {
        let states = self.check_proofs_spent(proofs.clone()).await?;

        let unspent_ys: Vec<_> = states
            .into_iter()
            .filter(|s| s.state == State::Unspent)
            .map(|s| s.y)
            .collect();

        let mut unspent = Proofs::new();
        for proof in proofs {
            if unspent_ys.contains(&proof.y()?) {
                unspent.push(proof);
            }
        }

        if unspent.is_empty() {
            tracing::debug!("Nothing left to reclaim");
            return Ok(Amount::ZERO);
        }

        tracing::info!(
            "Reclaiming {} unredeemed proofs worth {}",
            unspent.len(),
            unspent.total_amount()?
        );

        let swapped = SwapSaga::new(self.clone())
            .reserve(unspent)
            .await?
            .execute(None, SplitTarget::default(), None, false)
            .await?;

        swapped.change.total_amount().map_err(Error::from)
    }

    /// Remove the incoming proofs a receive stored and drop its record
    ///
    /// Only proofs still held by the operation are removed.
    pub(crate) async fn discard_received(
        &self,
        operation_id: Uuid,
        proof_ys: Vec<PublicKey>,
    ) -> Result<(), Error> {
        let held: HashSet<PublicKey> = self
            .localstore
            .get_reserved_proofs(&operation_id)
            .await?
            .into_iter()
            .map(|p| p.y)
            .collect();

        let stored_by_receive: Vec<PublicKey> =
            proof_ys.into_iter().filter(|y| held.contains(y)).collect();

        if !stored_by_receive.is_empty() {
            self.localstore
                .update_proofs(vec![], stored_by_receive)
                .await?;
        }

        finish_saga(&self.localstore, &operation_id).await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::database::{DynWalletDatabase, WalletMemoryDatabase};
    use crate::nuts::CurrencyUnit;
    use crate::types::ProofInfo;
    use crate::wallet::test_utils::{test_proof, test_wallet, MockMintConnector, MINT_URL};

    fn proof_info(amount: u64, state: State) -> ProofInfo {
        ProofInfo::new(
            test_proof(amount),
            MINT_URL.parse().unwrap(),
            state,
            CurrencyUnit::Sat,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_discard_keeps_proofs_the_wallet_owns() {
        let db: DynWalletDatabase = Arc::new(WalletMemoryDatabase::new());
        let wallet = test_wallet(db.clone(), Arc::new(MockMintConnector::default()));
        let operation_id = Uuid::new_v4();

        let owned = proof_info(64, State::Unspent);
        db.update_proofs(vec![owned.clone()], vec![]).await.unwrap();

        let incoming = proof_info(8, State::Pending).with_operation(operation_id);
        db.add_new_proofs(vec![incoming.clone()]).await.unwrap();

        // A token carrying an owned proof next to the new one
        wallet
            .discard_received(operation_id, vec![owned.y, incoming.y])
            .await
            .unwrap();

        let remaining = db.get_proofs(None, None, None, None).await.unwrap();
        assert_eq!(remaining, vec![owned]);
        assert_eq!(wallet.total_balance().await.unwrap(), Amount::from(64));
    }

    #[tokio::test]
    async fn test_receive_of_owned_proofs_refused() {
        let db: DynWalletDatabase = Arc::new(WalletMemoryDatabase::new());
        let wallet = test_wallet(db.clone(), Arc::new(MockMintConnector::default()));

        let owned = proof_info(64, State::Unspent);
        db.update_proofs(vec![owned.clone()], vec![]).await.unwrap();

        let incoming = vec![proof_info(8, State::Pending), owned.clone()]
            .into_iter()
            .map(|p| p.with_operation(Uuid::new_v4()))
            .collect();

        let result: Result<(), Error> = db.add_new_proofs(incoming).await.map_err(Error::from);
        assert!(matches!(result, Err(Error::ProofAlreadyHeld(y)) if y == owned.y));

        assert_eq!(db.get_proofs(None, None, None, None).await.unwrap(), vec![owned]);
        assert_eq!(wallet.total_balance().await.unwrap(), Amount::from(64));
    }
}
