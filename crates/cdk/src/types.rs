//! Types

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mint_url::MintUrl;
use crate::nuts::{
    CurrencyUnit, Id, MeltQuoteState, Proof, Proofs, ProofsMethods, PublicKey, SpendingConditions,
    State,
};
use crate::{Amount, Error};

/// Melt response with proofs
#[derive(Debug, Clone, Hash, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Melted {
    /// State of quote
    pub state: MeltQuoteState,
    /// Preimage of melt payment
    pub preimage: Option<String>,
    /// Melt change
    pub change: Option<Proofs>,
    /// Melt amount
    pub amount: Amount,
    /// Fee paid
    pub fee_paid: Amount,
}

impl Melted {
    /// Create new [`Melted`]
    pub fn from_proofs(
        state: MeltQuoteState,
        preimage: Option<String>,
        amount: Amount,
        proofs: Proofs,
        change_proofs: Option<Proofs>,
    ) -> Result<Self, Error> {
        let proofs_amount = proofs.total_amount()?;
        let change_amount = match &change_proofs {
            Some(change_proofs) => change_proofs.total_amount()?,
            None => Amount::ZERO,
        };

        let fee_paid = proofs_amount
            .checked_sub(
                amount
                    .checked_add(change_amount)
                    .ok_or(Error::AmountOverflow)?,
            )
            .ok_or(Error::AmountOverflow)?;

        Ok(Self {
            state,
            preimage,
            change: change_proofs,
            amount,
            fee_paid,
        })
    }

    /// Total amount melted
    pub fn total_amount(&self) -> Result<Amount, Error> {
        self.amount
            .checked_add(self.fee_paid)
            .ok_or(Error::AmountOverflow)
    }
}

/// Proof as stored in the wallet
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct ProofInfo {
    /// Proof
    pub proof: Proof,
    /// y
    pub y: PublicKey,
    /// Mint Url
    pub mint_url: MintUrl,
    /// Proof State
    pub state: State,
    /// Proof Spending Conditions
    pub spending_condition: Option<SpendingConditions>,
    /// Unit
    pub unit: CurrencyUnit,
    /// Operation holding the proof while it is pending
    pub used_by_operation: Option<Uuid>,
}

impl ProofInfo {
    /// Create new [`ProofInfo`]
    pub fn new(
        proof: Proof,
        mint_url: MintUrl,
        state: State,
        unit: CurrencyUnit,
    ) -> Result<Self, Error> {
        let y = proof.y()?;
        let spending_condition = proof.spending_conditions();

        Ok(Self {
            proof,
            y,
            mint_url,
            state,
            spending_condition,
            unit,
            used_by_operation: None,
        })
    }

    /// Same proof held by an operation
    pub fn with_operation(mut self, operation_id: Uuid) -> Self {
        self.used_by_operation = Some(operation_id);
        self
    }

    /// Check if [`Proof`] matches conditions
    pub fn matches_conditions(
        &self,
        mint_url: &Option<MintUrl>,
        unit: &Option<CurrencyUnit>,
        state: &Option<Vec<State>>,
        spending_conditions: &Option<Vec<SpendingConditions>>,
    ) -> bool {
        if let Some(mint_url) = mint_url {
            if mint_url.ne(&self.mint_url) {
                return false;
            }
        }

        if let Some(unit) = unit {
            if unit.ne(&self.unit) {
                return false;
            }
        }

        if let Some(state) = state {
            if !state.contains(&self.state) {
                return false;
            }
        }

        if let Some(spending_conditions) = spending_conditions {
            match &self.spending_condition {
                None => return false,
                Some(s) => {
                    if !spending_conditions.contains(s) {
                        return false;
                    }
                }
            }
        }

        true
    }
}

/// Fee breakdown for a proof set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofsFee {
    /// Total fee
    pub total: Amount,
    /// Fee per keyset
    pub per_keyset: HashMap<Id, Amount>,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::nuts::SecretKey;
    use crate::Secret;

    fn proof(amount: u64) -> Proof {
        Proof::new(
            Amount::from(amount),
            Id::from_str("00916bbf7ef91a36").unwrap(),
            Secret::generate(),
            SecretKey::generate().public_key(),
        )
    }

    #[test]
    fn test_melted() {
        let proofs = vec![proof(64), proof(8)];
        let change = vec![proof(2)];

        let melted = Melted::from_proofs(
            MeltQuoteState::Paid,
            Some("preimage".to_string()),
            Amount::from(64),
            proofs,
            Some(change),
        )
        .unwrap();

        assert_eq!(melted.amount, Amount::from(64));
        assert_eq!(melted.fee_paid, Amount::from(6));
        assert_eq!(melted.total_amount().unwrap(), Amount::from(70));
    }

    #[test]
    fn test_matches_conditions() {
        let mint_url = MintUrl::from_str("https://example.com").unwrap();
        let info = ProofInfo::new(proof(1), mint_url.clone(), State::Unspent, CurrencyUnit::Sat)
            .unwrap();

        assert!(info.matches_conditions(&Some(mint_url.clone()), &None, &None, &None));
        assert!(info.matches_conditions(
            &None,
            &Some(CurrencyUnit::Sat),
            &Some(vec![State::Unspent, State::Pending]),
            &None
        ));
        assert!(!info.matches_conditions(&None, &Some(CurrencyUnit::Usd), &None, &None));
        assert!(!info.matches_conditions(&None, &None, &Some(vec![State::Spent]), &None));

        let other = MintUrl::from_str("https://other.example.com").unwrap();
        assert!(!info.matches_conditions(&Some(other), &None, &None, &None));
    }
}
