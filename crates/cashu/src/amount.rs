//! CDK Amount
//!
//! Is any unit and will be treated as the unit of the wallet. Arithmetic is checked: there is no
//! `Add` impl, callers go through [`Amount::checked_add`] or [`Amount::try_sum`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Amount can be any unit
#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    /// Amount zero
    pub const ZERO: Amount = Amount(0);

    /// Amount one
    pub const ONE: Amount = Amount(1);

    /// Checked addition, `None` on overflow
    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    /// Checked subtraction, `None` on underflow
    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Saturating subtraction
    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    /// Sum amounts, failing with [`Error::AmountOverflow`] instead of wrapping
    pub fn try_sum<I>(iter: I) -> Result<Amount, Error>
    where
        I: IntoIterator<Item = Amount>,
    {
        iter.into_iter()
            .try_fold(Amount::ZERO, |acc, x| acc.checked_add(x))
            .ok_or(Error::AmountOverflow)
    }

    /// Split into parts that are powers of two, largest first
    pub fn split(&self) -> Vec<Amount> {
        let sats = self.0;
        (0_u64..64)
            .rev()
            .filter_map(|bit| {
                let part = 1 << bit;
                ((sats & part) == part).then_some(Amount(part))
            })
            .collect()
    }

    /// Split into output amounts following a [`SplitTarget`]
    ///
    /// The result always sums to `self`. [`SplitTarget::Values`] must add up exactly,
    /// otherwise [`Error::AmountMismatch`] is returned and nothing is produced.
    pub fn split_targeted(
        &self,
        target: &SplitTarget,
        policy: &dyn DenominationPolicy,
    ) -> Result<Vec<Amount>, Error> {
        match target {
            SplitTarget::None => policy.denominations(*self),
            SplitTarget::Value(value) => {
                if *value == Amount::ZERO || self <= value {
                    return policy.denominations(*self);
                }

                let value_parts = policy.denominations(*value)?;
                let mut parts = Vec::new();
                let mut remaining = *self;

                while remaining >= *value {
                    parts.extend(value_parts.iter().copied());
                    remaining = remaining
                        .checked_sub(*value)
                        .ok_or(Error::AmountOverflow)?;
                }

                if remaining > Amount::ZERO {
                    parts.extend(policy.denominations(remaining)?);
                }

                Ok(parts)
            }
            SplitTarget::Values(values) => {
                let actual = Amount::try_sum(values.iter().copied())?;
                if actual != *self {
                    return Err(Error::AmountMismatch {
                        expected: *self,
                        actual,
                    });
                }
                if values.iter().any(|v| *v == Amount::ZERO) {
                    return Err(Error::InvalidDenominations(
                        "split values cannot contain zero".to_string(),
                    ));
                }
                Ok(values.clone())
            }
        }
    }

    /// Underlying value
    pub fn to_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Amount> for u64 {
    fn from(value: Amount) -> Self {
        value.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Amount)
            .map_err(|_| Error::UnknownVariant {
                kind: "amount",
                value: s.to_string(),
            })
    }
}

/// Kinds of targeting that are supported
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SplitTarget {
    /// Default target; least amount of proofs
    #[default]
    None,
    /// Target amount for wallet to have most proofs that add up to value
    Value(Amount),
    /// Specific amounts to split into **MUST** equal amount being split
    Values(Vec<Amount>),
}

/// How an amount is broken into output denominations
pub trait DenominationPolicy: fmt::Debug + Send + Sync {
    /// Denominations summing exactly to `amount`, largest first
    fn denominations(&self, amount: Amount) -> Result<Vec<Amount>, Error>;
}

/// Binary decomposition into powers of two
#[derive(Debug, Default, Clone, Copy)]
pub struct PowerOfTwo;

impl DenominationPolicy for PowerOfTwo {
    fn denominations(&self, amount: Amount) -> Result<Vec<Amount>, Error> {
        Ok(amount.split())
    }
}

/// Most outputs a single decomposition may produce
pub const MAX_OUTPUTS: u64 = 10_000;

/// Greedy decomposition over the denominations a keyset advertises
#[derive(Debug, Clone)]
pub struct KeysetDenominations {
    /// Sorted largest first, always contains one
    amounts: Vec<Amount>,
}

impl KeysetDenominations {
    /// Build from advertised amounts. A denomination of one is required so every amount is
    /// representable.
    pub fn new<I>(amounts: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = Amount>,
    {
        let mut amounts: Vec<Amount> = amounts
            .into_iter()
            .filter(|a| *a > Amount::ZERO)
            .collect();
        amounts.sort_unstable_by(|a, b| b.cmp(a));
        amounts.dedup();

        if !amounts.contains(&Amount::ONE) {
            return Err(Error::InvalidDenominations(
                "keyset has no denomination of one".to_string(),
            ));
        }

        Ok(Self { amounts })
    }
}

impl DenominationPolicy for KeysetDenominations {
    fn denominations(&self, amount: Amount) -> Result<Vec<Amount>, Error> {
        let mut remaining = amount.to_u64();
        let mut parts = Vec::new();

        for denomination in &self.amounts {
            let d = denomination.to_u64();
            let count = remaining / d;
            if parts.len() as u64 + count > MAX_OUTPUTS {
                return Err(Error::AmountOverflow);
            }
            parts.extend(std::iter::repeat(*denomination).take(count as usize));
            remaining -= count * d;
        }

        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amounts(values: &[u64]) -> Vec<Amount> {
        values.iter().map(|v| Amount::from(*v)).collect()
    }

    #[test]
    fn test_split_amount() {
        assert_eq!(Amount::from(1).split(), amounts(&[1]));
        assert_eq!(Amount::from(2).split(), amounts(&[2]));
        assert_eq!(Amount::from(3).split(), amounts(&[2, 1]));
        assert_eq!(Amount::from(13).split(), amounts(&[8, 4, 1]));
        assert_eq!(Amount::from(600).split(), amounts(&[512, 64, 16, 8]));
        assert!(Amount::ZERO.split().is_empty());
    }

    #[test]
    fn test_split_target_amount() {
        let amount = Amount::from(65);

        let split = amount
            .split_targeted(&SplitTarget::Value(Amount::from(32)), &PowerOfTwo)
            .unwrap();
        assert_eq!(split, amounts(&[32, 32, 1]));

        let amount = Amount::from(150);
        let split = amount
            .split_targeted(&SplitTarget::Value(Amount::from(50)), &PowerOfTwo)
            .unwrap();
        assert_eq!(
            split,
            amounts(&[32, 16, 2, 32, 16, 2, 32, 16, 2])
        );
        assert_eq!(Amount::try_sum(split).unwrap(), amount);
    }

    #[test]
    fn test_split_values() {
        let amount = Amount::from(10);
        let target = SplitTarget::Values(amounts(&[2, 4, 4]));
        let split = amount.split_targeted(&target, &PowerOfTwo).unwrap();
        assert_eq!(split, amounts(&[2, 4, 4]));

        let bad_target = SplitTarget::Values(amounts(&[2, 4]));
        let err = amount.split_targeted(&bad_target, &PowerOfTwo).unwrap_err();
        assert!(matches!(
            err,
            Error::AmountMismatch { expected, actual }
                if expected == Amount::from(10) && actual == Amount::from(6)
        ));
    }

    #[test]
    fn test_try_sum_overflow() {
        let values = vec![Amount::from(u64::MAX), Amount::ONE];
        assert!(matches!(Amount::try_sum(values), Err(Error::AmountOverflow)));
        assert!(Amount::from(u64::MAX).checked_add(Amount::ONE).is_none());
        assert!(Amount::ZERO.checked_sub(Amount::ONE).is_none());
    }

    #[test]
    fn test_keyset_denominations() {
        let policy = KeysetDenominations::new(amounts(&[1, 5, 10, 50])).unwrap();
        assert_eq!(
            policy.denominations(Amount::from(67)).unwrap(),
            amounts(&[50, 10, 5, 1, 1])
        );

        assert!(KeysetDenominations::new(amounts(&[2, 4])).is_err());
    }

    #[test]
    fn test_keyset_denominations_bounded() {
        let policy = KeysetDenominations::new(amounts(&[1])).unwrap();
        assert!(matches!(
            policy.denominations(Amount::from(u64::MAX)),
            Err(Error::AmountOverflow)
        ));
        assert_eq!(
            policy.denominations(Amount::from(MAX_OUTPUTS)).unwrap().len() as u64,
            MAX_OUTPUTS
        );
    }
}
