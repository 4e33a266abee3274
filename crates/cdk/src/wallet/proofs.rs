use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

use crate::fees::calculate_fee;
use crate::nuts::{
    CheckStateRequest, Id, Proof, ProofState, Proofs, ProofsMethods, SpendingConditions, State,
};
use crate::types::ProofsFee;
use crate::wallet::Wallet;
use crate::{Amount, Error};

/// Upper bound on fee re-selection rounds when the selection has to cover its own fee
const MAX_FEE_ROUNDS: usize = 16;

/// Serializes proof selection so two operations never pick the same proofs
///
/// The lock covers reading candidates and the reservation write, never a mint round-trip.
#[derive(Debug, Clone, Default)]
pub struct ProofStore {
    select_lock: Arc<Mutex<()>>,
}

impl Wallet {
    /// Get unspent proofs for mint
    #[instrument(skip(self))]
    pub async fn get_unspent_proofs(&self) -> Result<Proofs, Error> {
        self.get_proofs_by_states(vec![State::Unspent]).await
    }

    /// Get pending [`Proofs`]
    #[instrument(skip(self))]
    pub async fn get_pending_proofs(&self) -> Result<Proofs, Error> {
        self.get_proofs_by_states(vec![State::Pending]).await
    }

    /// Get proofs handed out in tokens and not yet claimed
    #[instrument(skip(self))]
    pub async fn get_pending_spent_proofs(&self) -> Result<Proofs, Error> {
        self.get_proofs_by_states(vec![State::PendingSpent]).await
    }

    /// Get this wallet's proofs in any of `states`
    #[instrument(skip(self))]
    pub async fn get_proofs_by_states(&self, states: Vec<State>) -> Result<Proofs, Error> {
        self.get_proofs_with(Some(states), None).await
    }

    /// Get this wallet's proofs filtered by state and spending conditions
    pub async fn get_proofs_with(
        &self,
        state: Option<Vec<State>>,
        spending_conditions: Option<Vec<SpendingConditions>>,
    ) -> Result<Proofs, Error> {
        Ok(self
            .localstore
            .get_proofs(
                Some(self.mint_url.clone()),
                Some(self.unit.clone()),
                state,
                spending_conditions,
            )
            .await?
            .into_iter()
            .map(|p| p.proof)
            .collect())
    }

    /// Fee the mint charges to spend `proofs`
    #[instrument(skip_all)]
    pub async fn get_proofs_fee(&self, proofs: &Proofs) -> Result<ProofsFee, Error> {
        let keyset_fees = self.get_keyset_fees().await?;
        proofs_fee(proofs, &keyset_fees)
    }

    /// Select proofs covering `amount` and reserve them for `operation_id`
    ///
    /// With `include_fee` the selection also covers the input fee of the selected proofs.
    /// Proofs with spending conditions are only considered when `conditions` asks for them.
    #[instrument(skip(self, conditions))]
    pub(crate) async fn reserve_proofs_for(
        &self,
        amount: Amount,
        include_fee: bool,
        operation_id: Uuid,
        conditions: Option<SpendingConditions>,
    ) -> Result<Proofs, Error> {
        // Keyset fees may need the mint, fetch before taking the lock
        let keyset_fees = self.get_keyset_fees().await?;

        let _guard = self.proof_store.select_lock.lock().await;

        let locked_allowed = conditions.is_some();
        let available: Proofs = self
            .localstore
            .get_proofs(
                Some(self.mint_url.clone()),
                Some(self.unit.clone()),
                Some(vec![State::Unspent]),
                conditions.map(|c| vec![c]),
            )
            .await?
            .into_iter()
            .filter(|p| locked_allowed || p.spending_condition.is_none())
            .map(|p| p.proof)
            .collect();

        let selected = select_proofs(amount, available, &keyset_fees, include_fee)?;

        self.localstore
            .reserve_proofs(selected.ys()?, &operation_id)
            .await?;

        tracing::debug!(
            "Reserved {} proofs worth {} for operation {}",
            selected.len(),
            selected.total_amount()?,
            operation_id
        );

        Ok(selected)
    }

    /// Reserve specific proofs for `operation_id`
    pub(crate) async fn reserve_specific_proofs(
        &self,
        proofs: &Proofs,
        operation_id: Uuid,
    ) -> Result<(), Error> {
        let _guard = self.proof_store.select_lock.lock().await;

        self.localstore
            .reserve_proofs(proofs.ys()?, &operation_id)
            .await?;

        Ok(())
    }

    /// Resolve the proofs held by an operation and notify subscribers
    pub(crate) async fn commit_operation(
        &self,
        operation_id: Uuid,
        outcome: State,
    ) -> Result<(), Error> {
        let ys = self
            .localstore
            .commit_operation(&operation_id, outcome)
            .await?;

        self.notify_proof_states(&ys, outcome);

        Ok(())
    }

    /// Ask the mint for the state of `proofs`
    ///
    /// Proofs the mint reports spent are marked spent locally.
    #[instrument(skip(self, proofs))]
    pub async fn check_proofs_spent(&self, proofs: Proofs) -> Result<Vec<ProofState>, Error> {
        let ys = proofs.ys()?;

        let response = self
            .read_call("post_check_state", || {
                self.client
                    .post_check_state(CheckStateRequest { ys: ys.clone() })
            })
            .await?;

        let spent_ys: Vec<_> = response
            .states
            .iter()
            .filter(|s| s.state == State::Spent)
            .map(|s| s.y)
            .collect();

        if !spent_ys.is_empty() {
            let known: Vec<_> = self
                .localstore
                .get_proofs(Some(self.mint_url.clone()), None, None, None)
                .await?
                .into_iter()
                .filter(|p| spent_ys.contains(&p.y) && p.state != State::Spent)
                .map(|p| p.y)
                .collect();

            if !known.is_empty() {
                self.localstore
                    .update_proofs_state(known.clone(), State::Spent)
                    .await?;
                self.notify_proof_states(&known, State::Spent);
            }
        }

        for state in response.states.iter() {
            self.subscriptions
                .publish(super::NotificationPayload::ProofState(state.clone()));
        }

        Ok(response.states)
    }

    /// Settle proofs handed out in tokens
    ///
    /// Proofs the recipient has redeemed move from `PENDING_SPENT` to `SPENT`. Returns the
    /// amount settled.
    #[instrument(skip(self))]
    pub async fn check_pending_sent_proofs(&self) -> Result<Amount, Error> {
        let pending = self.get_pending_spent_proofs().await?;

        if pending.is_empty() {
            return Ok(Amount::ZERO);
        }

        let states = self.check_proofs_spent(pending.clone()).await?;

        let spent: Vec<_> = states
            .into_iter()
            .filter(|s| s.state == State::Spent)
            .map(|s| s.y)
            .collect();

        let mut settled = Amount::ZERO;
        for proof in pending.iter() {
            if spent.contains(&proof.y()?) {
                settled = settled
                    .checked_add(proof.amount)
                    .ok_or(Error::AmountOverflow)?;
            }
        }

        tracing::debug!("{} of sent tokens were redeemed", settled);

        Ok(settled)
    }
}

/// Fee of a proof set from a keyset fee table
pub(crate) fn proofs_fee(
    proofs: &[Proof],
    keyset_fees: &HashMap<Id, u64>,
) -> Result<ProofsFee, Error> {
    let counts = proofs.count_by_keyset();
    let total = calculate_fee(&counts, keyset_fees)?;

    let mut per_keyset = HashMap::new();
    for (keyset_id, count) in counts {
        let single = HashMap::from([(keyset_id, count)]);
        per_keyset.insert(keyset_id, calculate_fee(&single, keyset_fees)?);
    }

    Ok(ProofsFee { total, per_keyset })
}

/// Select proofs for `amount`
///
/// An exact match is preferred. Otherwise the candidate with the least leftover wins between
/// the smallest single proof covering the amount and a largest-first pick that stops once the
/// amount is covered (pruned of proofs it does not need). Ties go to fewer proofs.
///
/// With `include_fee` the result also covers its own input fee.
pub fn select_proofs(
    amount: Amount,
    proofs: Proofs,
    keyset_fees: &HashMap<Id, u64>,
    include_fee: bool,
) -> Result<Proofs, Error> {
    if amount == Amount::ZERO {
        return Ok(Proofs::new());
    }

    let total = proofs.total_amount()?;
    if total < amount {
        return Err(Error::InsufficientFunds);
    }

    let mut sorted = proofs;
    sorted.sort_by(|a, b| b.amount.cmp(&a.amount));

    if !include_fee {
        return select_for_target(amount, &sorted).ok_or(Error::InsufficientFunds);
    }

    let mut target = amount;
    for _ in 0..MAX_FEE_ROUNDS {
        let selected = select_for_target(target, &sorted).ok_or(Error::InsufficientFunds)?;
        let fee = proofs_fee(&selected, keyset_fees)?.total;
        let needed = amount.checked_add(fee).ok_or(Error::AmountOverflow)?;

        if selected.total_amount()? >= needed {
            return Ok(selected);
        }

        target = needed;
    }

    Err(Error::InsufficientFunds)
}

/// `sorted` is largest first and sums to at least `target`
fn select_for_target(target: Amount, sorted: &[Proof]) -> Option<Proofs> {
    let target = target.to_u64();
    if sorted.iter().map(|p| p.amount.to_u64()).sum::<u64>() < target {
        return None;
    }

    let mut exact = Vec::new();
    let mut acc = 0u64;
    for proof in sorted {
        let amount = proof.amount.to_u64();
        if acc + amount <= target {
            acc += amount;
            exact.push(proof.clone());
        }
        if acc == target {
            return Some(exact);
        }
    }

    let single = sorted
        .iter()
        .filter(|p| p.amount.to_u64() >= target)
        .min_by_key(|p| p.amount)
        .map(|p| vec![p.clone()]);

    let mut greedy: Vec<Proof> = Vec::new();
    let mut acc = 0u64;
    for proof in sorted {
        if acc >= target {
            break;
        }
        acc += proof.amount.to_u64();
        greedy.push(proof.clone());
    }

    // Drop the smallest proofs the pick does not need
    greedy.sort_by(|a, b| a.amount.cmp(&b.amount));
    let mut pruned = Vec::with_capacity(greedy.len());
    for proof in greedy {
        let amount = proof.amount.to_u64();
        if acc - amount >= target {
            acc -= amount;
        } else {
            pruned.push(proof);
        }
    }

    let candidates = [single, Some(pruned)];
    candidates
        .into_iter()
        .flatten()
        .min_by_key(|c| (c.iter().map(|p| p.amount.to_u64()).sum::<u64>(), c.len()))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::nuts::SecretKey;
    use crate::Secret;

    fn id() -> Id {
        Id::from_str("00916bbf7ef91a36").unwrap()
    }

    fn proofs(amounts: &[u64]) -> Proofs {
        amounts
            .iter()
            .map(|a| {
                Proof::new(
                    Amount::from(*a),
                    id(),
                    Secret::generate(),
                    SecretKey::generate().public_key(),
                )
            })
            .collect()
    }

    fn amounts(proofs: &Proofs) -> Vec<u64> {
        let mut amounts: Vec<u64> = proofs.iter().map(|p| p.amount.to_u64()).collect();
        amounts.sort_unstable_by(|a, b| b.cmp(a));
        amounts
    }

    fn no_fees() -> HashMap<Id, u64> {
        HashMap::from([(id(), 0)])
    }

    #[test]
    fn test_select_exact_match() {
        let selected =
            select_proofs(Amount::from(7), proofs(&[8, 4, 2, 1]), &no_fees(), false).unwrap();
        assert_eq!(amounts(&selected), vec![4, 2, 1]);
    }

    #[test]
    fn test_select_smallest_superset() {
        // No subset sums to 5; a single 8 leaves more over than 4 + 2
        let selected =
            select_proofs(Amount::from(5), proofs(&[8, 4, 2]), &no_fees(), false).unwrap();
        assert_eq!(amounts(&selected), vec![4, 2]);

        let selected = select_proofs(Amount::from(600), proofs(&[1000]), &no_fees(), false).unwrap();
        assert_eq!(amounts(&selected), vec![1000]);
    }

    #[test]
    fn test_select_prefers_single_on_tie() {
        // 4 alone and 2 + 2 both leave 1 over
        let selected =
            select_proofs(Amount::from(3), proofs(&[4, 2, 2]), &no_fees(), false).unwrap();
        assert_eq!(selected.total_amount().unwrap(), Amount::from(4));
    }

    #[test]
    fn test_select_sufficient() {
        let available = proofs(&[64, 32, 16, 8, 8, 4, 2, 1]);

        for target in 1..=135u64 {
            let selected =
                select_proofs(Amount::from(target), available.clone(), &no_fees(), false).unwrap();
            assert!(selected.total_amount().unwrap() >= Amount::from(target));
        }
    }

    #[test]
    fn test_select_insufficient() {
        assert!(matches!(
            select_proofs(Amount::from(16), proofs(&[8, 4]), &no_fees(), false),
            Err(Error::InsufficientFunds)
        ));
    }

    #[test]
    fn test_select_zero() {
        assert!(select_proofs(Amount::ZERO, proofs(&[8]), &no_fees(), false)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_select_include_fee() {
        let fees = HashMap::from([(id(), 1000)]);

        // 8 exactly covers the amount but then cannot pay its own fee of 1
        let selected = select_proofs(Amount::from(8), proofs(&[8, 4, 2, 1]), &fees, true).unwrap();
        let fee = proofs_fee(&selected, &fees).unwrap().total;
        assert!(selected.total_amount().unwrap() >= Amount::from(8).checked_add(fee).unwrap());

        assert!(matches!(
            select_proofs(Amount::from(15), proofs(&[8, 4, 2, 1]), &fees, true),
            Err(Error::InsufficientFunds)
        ));
    }
}
