//! Deterministic outputs and seed restore
//!
//! Outputs without spending conditions are derived from the wallet seed. Each keyset has a
//! counter in the localstore; creating outputs reserves the next counters before the outputs
//! leave the wallet, so no counter is used twice even if the request fails.

use std::collections::HashSet;

use tracing::instrument;

use crate::nuts::nut00::blank_output_count;
use crate::nuts::{
    CheckStateRequest, Id, KeySetInfosMethods, PreMintSecrets, Proofs, ProofsMethods, State,
};
use crate::types::ProofInfo;
use crate::wallet::Wallet;
use crate::{Amount, Error};

/// Counters asked for per restore request
const RESTORE_BATCH_SIZE: u32 = 100;

/// Consecutive empty batches after which a keyset is considered exhausted
const EMPTY_BATCHES_BEFORE_STOP: u32 = 3;

impl Wallet {
    /// Seed derived outputs for `amounts`
    pub(crate) async fn derive_outputs(
        &self,
        keyset_id: Id,
        amounts: &[Amount],
    ) -> Result<PreMintSecrets, Error> {
        if amounts.is_empty() {
            return Ok(PreMintSecrets::new(keyset_id));
        }

        let counter = self.reserve_counters(keyset_id, amounts.len()).await?;

        Ok(PreMintSecrets::from_seed(
            keyset_id,
            counter,
            &self.seed,
            amounts,
        )?)
    }

    /// Seed derived blank outputs able to return up to `fee_reserve`
    pub(crate) async fn derive_blank_outputs(
        &self,
        keyset_id: Id,
        fee_reserve: Amount,
    ) -> Result<PreMintSecrets, Error> {
        let count = blank_output_count(fee_reserve);
        let counter = self.reserve_counters(keyset_id, count).await?;

        Ok(PreMintSecrets::from_seed_blank(
            keyset_id,
            counter,
            &self.seed,
            fee_reserve,
        )?)
    }

    /// Reserve `count` counters of a keyset, returning the first
    async fn reserve_counters(&self, keyset_id: Id, count: usize) -> Result<u32, Error> {
        let count = u32::try_from(count).map_err(|_| Error::AmountOverflow)?;
        let end = self
            .localstore
            .increment_keyset_counter(&keyset_id, count)
            .await?;

        tracing::trace!(
            "Reserved counters {}..{} of keyset {}",
            end - count,
            end,
            keyset_id
        );

        Ok(end - count)
    }

    /// Rebuild the wallet from its seed
    ///
    /// Walks the counters of every keyset of the wallet unit and asks the mint which outputs
    /// it signed. A keyset is done after three consecutive batches come back empty. Unspent
    /// proofs the wallet does not hold yet are stored, and each keyset counter is moved past
    /// the last output found. Returns the amount restored.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<Amount, Error> {
        let keysets = self.refresh_keysets().await?;
        let mut restored = Amount::ZERO;

        for keyset in keysets.unit(self.unit.clone()) {
            let (proofs, next_counter) = self.restore_keyset(keyset.id).await?;

            let current = self.localstore.get_keyset_counter(&keyset.id).await?;
            if next_counter > current {
                self.localstore
                    .increment_keyset_counter(&keyset.id, next_counter - current)
                    .await?;
            }

            if proofs.is_empty() {
                continue;
            }

            let amount = self.store_unspent(proofs).await?;
            tracing::info!("Restored {} from keyset {}", amount, keyset.id);

            restored = restored
                .checked_add(amount)
                .ok_or(Error::AmountOverflow)?;
        }

        Ok(restored)
    }

    /// Proofs the mint signed for a keyset and the counter after the last of them
    async fn restore_keyset(&self, keyset_id: Id) -> Result<(Proofs, u32), Error> {
        let mut proofs = Proofs::new();
        let mut next_counter = 0;
        let mut empty_batches = 0;
        let mut start = 0u32;

        while empty_batches < EMPTY_BATCHES_BEFORE_STOP {
            let end = start
                .checked_add(RESTORE_BATCH_SIZE)
                .ok_or(Error::AmountOverflow)?;
            let outputs = PreMintSecrets::restore_batch(keyset_id, &self.seed, start, end)?;
            let found = self.restore_outputs(&outputs).await?;

            tracing::debug!(
                "Keyset {} counters {}..{}: {} signed",
                keyset_id,
                start,
                end,
                found.len()
            );

            if found.is_empty() {
                empty_batches += 1;
            } else {
                empty_batches = 0;

                let secrets: HashSet<_> = found.iter().map(|p| &p.secret).collect();
                if let Some(last) = outputs
                    .iter()
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rposition(|pm| secrets.contains(&pm.secret))
                {
                    next_counter = start + last as u32 + 1;
                }

                proofs.extend(found);
            }

            start = end;
        }

        Ok((proofs, next_counter))
    }

    /// Store the proofs the mint reports unspent and not already held
    async fn store_unspent(&self, proofs: Proofs) -> Result<Amount, Error> {
        let held: HashSet<_> = self
            .localstore
            .get_proofs(Some(self.mint_url.clone()), None, None, None)
            .await?
            .into_iter()
            .map(|p| p.y)
            .collect();

        let ys = proofs.ys()?;
        let response = self
            .read_call("post_check_state", || {
                self.client
                    .post_check_state(CheckStateRequest { ys: ys.clone() })
            })
            .await?;

        let unspent: HashSet<_> = response
            .states
            .iter()
            .filter(|s| s.state == State::Unspent)
            .map(|s| s.y)
            .collect();

        let infos = proofs
            .into_iter()
            .map(|p| ProofInfo::new(p, self.mint_url.clone(), State::Unspent, self.unit.clone()))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|info| unspent.contains(&info.y) && !held.contains(&info.y))
            .collect::<Vec<_>>();

        let amount = Amount::try_sum(infos.iter().map(|p| p.proof.amount))?;

        if !infos.is_empty() {
            let ys: Vec<_> = infos.iter().map(|p| p.y).collect();
            self.localstore.add_new_proofs(infos).await?;
            self.notify_proof_states(&ys, State::Unspent);
        }

        Ok(amount)
    }
}
