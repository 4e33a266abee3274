//! Swap
//!
//! Exchanges proofs at the mint for fresh ones in chosen denominations. Used on its own and
//! by send, receive and reclaim whenever the proofs at hand do not fit.

use std::collections::{HashMap, HashSet};

use tracing::instrument;
use uuid::Uuid;

use crate::amount::{DenominationPolicy, SplitTarget};
use crate::dhke::construct_proofs;
use crate::nuts::{
    CheckStateRequest, KeySetInfo, Keys, PreMintSecrets, Proofs, ProofsMethods, PublicKey,
    RestoreRequest, SpendingConditions, State, SwapRequest, SwapResponse,
};
use crate::types::ProofInfo;
use crate::wallet::proofs::proofs_fee;
use crate::wallet::retry::with_timeout;
use crate::wallet::Wallet;
use crate::{Amount, Error, Secret};

pub(crate) mod saga;

use saga::SwapSaga;

/// Outputs and request of a swap not yet sent
#[derive(Debug, Clone)]
pub(crate) struct PreSwap {
    /// All outputs, sorted by amount
    pub pre_mint_secrets: PreMintSecrets,
    /// Secrets of the outputs that make up the requested amount
    pub send_secrets: HashSet<Secret>,
    /// Request for the mint
    pub swap_request: SwapRequest,
    /// Input fee
    pub fee: Amount,
}

/// Proofs produced by a swap
#[derive(Debug, Clone, Default)]
pub(crate) struct SwapOutputs {
    /// Proofs of the requested amount
    pub send: Proofs,
    /// Everything else
    pub change: Proofs,
}

/// How a swap with unknown outcome was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SwapResolution {
    /// The operation no longer holds any proofs
    NothingHeld,
    /// The mint never spent the inputs, they are unspent again
    Released,
    /// The mint spent the inputs; these outputs were recovered and stored unspent
    Restored(Proofs),
}

impl Wallet {
    /// Swap proofs for new ones
    ///
    /// With `amount` the returned proofs add up to it (plus the fee to redeem them when
    /// `include_fees` is set) and are locked to `spending_conditions` if given. Whatever the
    /// inputs hold beyond that is stored as change. Without `amount` all value is change and
    /// `None` is returned. Both the returned and the change proofs are stored unspent.
    #[instrument(skip(self, input_proofs, spending_conditions), err)]
    pub async fn swap(
        &self,
        amount: Option<Amount>,
        amount_split_target: SplitTarget,
        input_proofs: Proofs,
        spending_conditions: Option<SpendingConditions>,
        include_fees: bool,
    ) -> Result<Option<Proofs>, Error> {
        let saga = SwapSaga::new(self.clone());
        let reserved = saga.reserve(input_proofs).await?;
        let outputs = reserved
            .execute(amount, amount_split_target, spending_conditions, include_fees)
            .await?;

        Ok(amount.map(|_| outputs.send))
    }

    /// Build the outputs and request for a swap of `proofs`
    #[instrument(skip_all)]
    pub(crate) async fn create_swap(
        &self,
        active_keyset: &KeySetInfo,
        amount: Option<Amount>,
        amount_split_target: SplitTarget,
        proofs: Proofs,
        spending_conditions: Option<SpendingConditions>,
        include_fees: bool,
    ) -> Result<PreSwap, Error> {
        let keys = self.load_keyset_keys(active_keyset.id).await?;
        let policy = self.denomination_policy(&keys)?;
        let keyset_fees = self.get_keyset_fees().await?;

        let input_total = proofs.total_amount()?;
        let fee = proofs_fee(&proofs, &keyset_fees)?.total;
        let available = input_total
            .checked_sub(fee)
            .ok_or(Error::InsufficientFunds)?;

        let (send_amounts, change_amounts) = match amount {
            Some(amount) => {
                let send_amounts = if include_fees {
                    split_covering_fee(
                        amount,
                        &amount_split_target,
                        policy.as_ref(),
                        active_keyset.input_fee_ppk,
                    )?
                } else {
                    amount.split_targeted(&amount_split_target, policy.as_ref())?
                };
                let send_total = Amount::try_sum(send_amounts.iter().copied())?;

                let change = available
                    .checked_sub(send_total)
                    .ok_or(Error::InsufficientFunds)?;

                let change_amounts = self.change_split(change, &keys, policy.as_ref()).await?;

                (send_amounts, change_amounts)
            }
            None => (
                Vec::new(),
                available.split_targeted(&amount_split_target, policy.as_ref())?,
            ),
        };

        tracing::debug!(
            "Swap of {} (fee {}): send {:?}, change {:?}",
            input_total,
            fee,
            send_amounts,
            change_amounts
        );

        let send_premints = match &spending_conditions {
            Some(conditions) => {
                PreMintSecrets::with_conditions(active_keyset.id, &send_amounts, conditions)?
            }
            None => self.derive_outputs(active_keyset.id, &send_amounts).await?,
        };
        let send_secrets: HashSet<Secret> = send_premints.secrets().into_iter().collect();

        let mut pre_mint_secrets = send_premints;
        pre_mint_secrets.combine(self.derive_outputs(active_keyset.id, &change_amounts).await?);
        pre_mint_secrets.sort_secrets();

        let swap_request = SwapRequest::new(proofs, pre_mint_secrets.blinded_messages());

        Ok(PreSwap {
            pre_mint_secrets,
            send_secrets,
            swap_request,
            fee,
        })
    }

    /// Send a prepared swap and store its outputs
    ///
    /// Mutating call: it gets the swap timeout and is never retried.
    pub(crate) async fn execute_swap(
        &self,
        pre_swap: PreSwap,
        send_operation: Option<Uuid>,
    ) -> Result<SwapOutputs, Error> {
        let response = with_timeout(
            self.config.swap_timeout(),
            self.client.post_swap(pre_swap.swap_request.clone()),
        )
        .await?;

        self.finish_swap(pre_swap, response, send_operation).await
    }

    /// Verify the mint's signatures and store the new proofs
    ///
    /// Inputs are removed and outputs added in one write. Outputs for the requested amount
    /// are held `PENDING` by `send_operation` when given, everything else is unspent. A
    /// signature failing verification stores nothing.
    pub(crate) async fn finish_swap(
        &self,
        pre_swap: PreSwap,
        response: SwapResponse,
        send_operation: Option<Uuid>,
    ) -> Result<SwapOutputs, Error> {
        let premints = &pre_swap.pre_mint_secrets;

        if response.signatures.len() != premints.len() {
            return Err(Error::InvalidSignature(format!(
                "expected {} signatures, got {}",
                premints.len(),
                response.signatures.len()
            )));
        }

        for (signature, premint) in response.signatures.iter().zip(premints.iter()) {
            if signature.keyset_id != premints.keyset_id || signature.amount != premint.amount {
                return Err(Error::InvalidSignature(format!(
                    "signature for {} in keyset {} does not match output of {}",
                    signature.amount, signature.keyset_id, premint.amount
                )));
            }
        }

        let keys = self.load_keyset_keys(premints.keyset_id).await?;
        let proofs = construct_proofs(
            response.signatures,
            premints.rs(),
            premints.secrets(),
            &keys,
        )?;

        let (send, change): (Proofs, Proofs) = proofs
            .into_iter()
            .partition(|p| pre_swap.send_secrets.contains(&p.secret));

        let mut added = Vec::with_capacity(send.len() + change.len());
        for proof in send.iter() {
            let info = match send_operation {
                Some(operation_id) => ProofInfo::new(
                    proof.clone(),
                    self.mint_url.clone(),
                    State::Pending,
                    self.unit.clone(),
                )?
                .with_operation(operation_id),
                None => ProofInfo::new(
                    proof.clone(),
                    self.mint_url.clone(),
                    State::Unspent,
                    self.unit.clone(),
                )?,
            };
            added.push(info);
        }
        for proof in change.iter() {
            added.push(ProofInfo::new(
                proof.clone(),
                self.mint_url.clone(),
                State::Unspent,
                self.unit.clone(),
            )?);
        }

        let input_ys = pre_swap.swap_request.inputs.ys()?;
        self.localstore.update_proofs(added, input_ys.clone()).await?;

        self.notify_proof_states(&input_ys, State::Spent);
        self.notify_proof_states(&change.ys()?, State::Unspent);
        let send_state = match send_operation {
            Some(_) => State::Pending,
            None => State::Unspent,
        };
        self.notify_proof_states(&send.ys()?, send_state);

        tracing::debug!(
            "Swap stored {} send and {} change proofs",
            send.len(),
            change.len()
        );

        Ok(SwapOutputs { send, change })
    }

    /// Settle a swap whose response never arrived
    ///
    /// Asks the mint for the state of the proofs still held by `operation_id`. Proofs it
    /// reports spent were the swap inputs: they are removed and the outputs restored from the
    /// mint and stored unspent. Whatever else the operation holds is released.
    #[instrument(skip(self, outputs))]
    pub(crate) async fn reconcile_swap(
        &self,
        operation_id: Uuid,
        outputs: &PreMintSecrets,
    ) -> Result<SwapResolution, Error> {
        let held = self.localstore.get_reserved_proofs(&operation_id).await?;
        if held.is_empty() {
            return Ok(SwapResolution::NothingHeld);
        }

        let ys: Vec<PublicKey> = held.iter().map(|p| p.y).collect();
        let response = self
            .read_call("post_check_state", || {
                self.client
                    .post_check_state(CheckStateRequest { ys: ys.clone() })
            })
            .await?;

        let spent_ys: Vec<PublicKey> = response
            .states
            .iter()
            .filter(|s| s.state == State::Spent)
            .map(|s| s.y)
            .collect();

        if spent_ys.is_empty() {
            self.commit_operation(operation_id, State::Unspent).await?;
            tracing::info!("Swap {} never reached the mint, inputs released", operation_id);
            return Ok(SwapResolution::Released);
        }

        let restored = self.restore_outputs(outputs).await?;
        let amount = restored.total_amount()?;

        let added = restored
            .iter()
            .cloned()
            .map(|p| ProofInfo::new(p, self.mint_url.clone(), State::Unspent, self.unit.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        let added_ys: Vec<PublicKey> = added.iter().map(|p| p.y).collect();

        self.localstore
            .update_proofs(added, spent_ys.clone())
            .await?;
        self.commit_operation(operation_id, State::Unspent).await?;
        self.notify_proof_states(&spent_ys, State::Spent);
        self.notify_proof_states(&added_ys, State::Unspent);

        tracing::info!(
            "Swap {} completed at the mint, restored {}",
            operation_id,
            amount
        );

        Ok(SwapResolution::Restored(restored))
    }

    /// Ask the mint for signatures it already issued on `outputs`
    pub(crate) async fn restore_outputs(&self, outputs: &PreMintSecrets) -> Result<Proofs, Error> {
        if outputs.is_empty() {
            return Ok(Proofs::new());
        }

        let request = RestoreRequest {
            outputs: outputs.blinded_messages(),
        };
        let response = self
            .read_call("post_restore", || self.client.post_restore(request.clone()))
            .await?;

        let mut signatures = Vec::new();
        let mut rs = Vec::new();
        let mut secrets = Vec::new();

        for (output, signature) in response.outputs.iter().zip(response.signatures) {
            if let Some(premint) = outputs
                .iter()
                .find(|pm| pm.blinded_message.blinded_secret == output.blinded_secret)
            {
                signatures.push(signature);
                rs.push(premint.r.clone());
                secrets.push(premint.secret.clone());
            }
        }

        if signatures.is_empty() {
            return Ok(Proofs::new());
        }

        let keys = self.load_keyset_keys(outputs.keyset_id).await?;

        Ok(construct_proofs(signatures, rs, secrets, &keys)?)
    }

    /// Denominations for change
    ///
    /// Each denomination the keyset offers is topped up to `target_proof_count` unspent
    /// proofs, smallest first; the rest follows the denomination policy.
    pub(crate) async fn change_split(
        &self,
        change: Amount,
        keys: &Keys,
        policy: &dyn DenominationPolicy,
    ) -> Result<Vec<Amount>, Error> {
        if change == Amount::ZERO {
            return Ok(Vec::new());
        }

        let target = self.config.target_proof_count as u64;
        let mut counts: HashMap<Amount, u64> = HashMap::new();
        for proof in self.get_unspent_proofs().await? {
            *counts.entry(proof.amount).or_default() += 1;
        }

        let mut parts = Vec::new();
        let mut remaining = change;

        for denomination in keys.amounts() {
            if denomination == Amount::ZERO {
                continue;
            }
            let have = counts.get(&denomination).copied().unwrap_or_default();
            for _ in have..target {
                match remaining.checked_sub(denomination) {
                    Some(rest) => {
                        parts.push(denomination);
                        remaining = rest;
                    }
                    None => break,
                }
            }
        }

        parts.extend(policy.denominations(remaining)?);
        parts.sort();

        Ok(parts)
    }
}

/// Fee for spending `count` proofs of a keyset charging `fee_ppk`, rounded up
pub(crate) fn output_fee(fee_ppk: u64, count: usize) -> Result<Amount, Error> {
    let total_ppk = fee_ppk
        .checked_mul(count as u64)
        .ok_or(Error::AmountOverflow)?;

    Ok(Amount::from(total_ppk.div_ceil(1000)))
}

/// Split `amount` into outputs that also carry the fee to spend them again
///
/// The amount is split by `target`, the fee goes into extra outputs.
pub(crate) fn split_covering_fee(
    amount: Amount,
    target: &SplitTarget,
    policy: &dyn DenominationPolicy,
    fee_ppk: u64,
) -> Result<Vec<Amount>, Error> {
    let base = amount.split_targeted(target, policy)?;
    let mut fee = Amount::ZERO;

    // Fee outputs add to the fee, stop once it stays covered
    for _ in 0..16 {
        let mut parts = base.clone();
        parts.extend(policy.denominations(fee)?);

        let needed = output_fee(fee_ppk, parts.len())?;
        if needed <= fee {
            return Ok(parts);
        }
        fee = needed;
    }

    Err(Error::Custom(format!(
        "Cannot cover a fee of {fee_ppk} ppk per output for {amount}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::PowerOfTwo;

    #[test]
    fn test_output_fee_rounds_up() {
        assert_eq!(output_fee(0, 5).unwrap(), Amount::ZERO);
        assert_eq!(output_fee(400, 1).unwrap(), Amount::from(1));
        assert_eq!(output_fee(400, 3).unwrap(), Amount::from(2));
        assert_eq!(output_fee(1000, 4).unwrap(), Amount::from(4));
        assert!(matches!(
            output_fee(u64::MAX, 2),
            Err(Error::AmountOverflow)
        ));
    }

    #[test]
    fn test_split_covering_fee() {
        // Two outputs cost 1, the extra output raises it to 2
        let parts = split_covering_fee(Amount::from(10), &SplitTarget::None, &PowerOfTwo, 400)
            .unwrap();
        assert_eq!(
            Amount::try_sum(parts.iter().copied()).unwrap(),
            Amount::from(12)
        );

        let parts =
            split_covering_fee(Amount::from(10), &SplitTarget::None, &PowerOfTwo, 0).unwrap();
        assert_eq!(parts, vec![Amount::from(8), Amount::from(2)]);

        let parts = split_covering_fee(
            Amount::from(10),
            &SplitTarget::Values(vec![Amount::from(5), Amount::from(5)]),
            &PowerOfTwo,
            1000,
        )
        .unwrap();
        assert_eq!(&parts[..2], &[Amount::from(5), Amount::from(5)]);
        assert!(Amount::try_sum(parts.iter().copied()).unwrap() >= Amount::from(10 + parts.len() as u64));
    }
}
