//! NUT-13: Deterministic Secrets
//!
//! <https://github.com/cashubtc/nuts/blob/main/13.md>
//!
//! Secrets and blinding factors are derived from a BIP39 seed along
//! `m/129372'/0'/{keyset}'/{counter}'/{0|1}` so a wallet can rebuild its proofs from the seed
//! alone.

use bitcoin::bip32::{ChildNumber, DerivationPath, ExtendedPrivKey};
use bitcoin::Network;

use super::nut00::{blank_output_count, PreMintSecrets};
use super::nut01::SecretKey;
use super::nut02::Id;
use crate::util::secp;
use crate::{Amount, Error, Secret};

const PURPOSE: u32 = 129372;
const SECRET_INDEX: u32 = 0;
const BLINDING_FACTOR_INDEX: u32 = 1;

fn keyset_path(keyset_id: Id) -> Result<DerivationPath, Error> {
    let index = u64::from_be_bytes(keyset_id.to_bytes()) % (2u64.pow(31) - 1);
    let index = u32::try_from(index).map_err(|_| Error::CounterOverflow)?;

    Ok(DerivationPath::from(vec![
        ChildNumber::from_hardened_idx(PURPOSE)?,
        ChildNumber::from_hardened_idx(0)?,
        ChildNumber::from_hardened_idx(index)?,
    ]))
}

fn derive_key(
    seed: &[u8; 64],
    keyset_id: Id,
    counter: u32,
    leaf: u32,
) -> Result<[u8; 32], Error> {
    let xpriv = ExtendedPrivKey::new_master(Network::Bitcoin, seed)?;
    let path = keyset_path(keyset_id)?
        .child(ChildNumber::from_hardened_idx(counter)?)
        .child(ChildNumber::from_normal_idx(leaf)?);

    Ok(xpriv.derive_priv(secp(), &path)?.private_key.secret_bytes())
}

impl Secret {
    /// Secret for `counter` under `keyset_id`
    pub fn from_seed(seed: &[u8; 64], keyset_id: Id, counter: u32) -> Result<Self, Error> {
        let key = derive_key(seed, keyset_id, counter, SECRET_INDEX)?;
        Ok(Self::new(hex::encode(key)))
    }
}

impl SecretKey {
    /// Blinding factor for `counter` under `keyset_id`
    pub fn from_seed(seed: &[u8; 64], keyset_id: Id, counter: u32) -> Result<Self, Error> {
        let key = derive_key(seed, keyset_id, counter, BLINDING_FACTOR_INDEX)?;
        Self::from_slice(&key)
    }
}

impl PreMintSecrets {
    /// Outputs derived from the seed, one per amount, starting at `counter`
    pub fn from_seed(
        keyset_id: Id,
        counter: u32,
        seed: &[u8; 64],
        amounts: &[Amount],
    ) -> Result<Self, Error> {
        let mut output = Vec::with_capacity(amounts.len());

        for (i, amount) in amounts.iter().enumerate() {
            let counter = u32::try_from(i)
                .ok()
                .and_then(|i| counter.checked_add(i))
                .ok_or(Error::CounterOverflow)?;

            let secret = Secret::from_seed(seed, keyset_id, counter)?;
            let r = SecretKey::from_seed(seed, keyset_id, counter)?;

            output.push(Self::premint(keyset_id, *amount, secret, Some(r))?);
        }

        Ok(Self {
            secrets: output,
            keyset_id,
        })
    }

    /// Blank outputs for fee return derived from the seed
    pub fn from_seed_blank(
        keyset_id: Id,
        counter: u32,
        seed: &[u8; 64],
        fee_reserve: Amount,
    ) -> Result<Self, Error> {
        let amounts = vec![Amount::ZERO; blank_output_count(fee_reserve)];
        Self::from_seed(keyset_id, counter, seed, &amounts)
    }

    /// Zero amount outputs for every counter in `start..end`, used to ask the mint which of
    /// them it signed
    pub fn restore_batch(
        keyset_id: Id,
        seed: &[u8; 64],
        start: u32,
        end: u32,
    ) -> Result<Self, Error> {
        let count = end.saturating_sub(start) as usize;
        Self::from_seed(keyset_id, start, seed, &vec![Amount::ZERO; count])
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use bip39::Mnemonic;

    use super::*;

    const MNEMONIC: &str =
        "half depart obvious quality work element tank gorilla view sugar picture humble";

    fn seed() -> [u8; 64] {
        Mnemonic::from_str(MNEMONIC).unwrap().to_seed_normalized("")
    }

    #[test]
    fn test_secret_from_seed() {
        let keyset_id = Id::from_str("009a1f293253e41e").unwrap();
        let seed = seed();

        assert_eq!(
            Secret::from_seed(&seed, keyset_id, 0).unwrap().as_str(),
            "485875df74771877439ac06339e284c3acfcd9be7abf3bc20b516faeadfe77ae"
        );
        assert_eq!(
            Secret::from_seed(&seed, keyset_id, 1).unwrap().as_str(),
            "8f2b39e8e594a4056eb1e6dbb4b0c38ef13b1b2c751f64f810ec04ee35b77270"
        );
    }

    #[test]
    fn test_r_from_seed() {
        let keyset_id = Id::from_str("009a1f293253e41e").unwrap();

        assert_eq!(
            SecretKey::from_seed(&seed(), keyset_id, 0)
                .unwrap()
                .to_secret_hex(),
            "ad00d431add9c673e843d4c2bf9a778a5f402b985b8da2d5550bf39cda41d679"
        );
    }

    #[test]
    fn test_restore_batch_matches_issued_outputs() {
        let keyset_id = Id::from_str("009a1f293253e41e").unwrap();
        let seed = seed();

        let issued =
            PreMintSecrets::from_seed(keyset_id, 5, &seed, &[Amount::from(8), Amount::from(2)])
                .unwrap();
        let restored = PreMintSecrets::restore_batch(keyset_id, &seed, 5, 7).unwrap();

        assert_eq!(restored.len(), 2);
        assert_eq!(issued.secrets(), restored.secrets());
        assert_eq!(issued.rs(), restored.rs());
        // Blinded point does not depend on the amount
        for (a, b) in issued.iter().zip(restored.iter()) {
            assert_eq!(
                a.blinded_message.blinded_secret,
                b.blinded_message.blinded_secret
            );
        }
    }

    #[test]
    fn test_counter_overflow() {
        let keyset_id = Id::from_str("009a1f293253e41e").unwrap();
        let result = PreMintSecrets::from_seed(
            keyset_id,
            u32::MAX,
            &seed(),
            &[Amount::ONE, Amount::ONE],
        );
        assert!(result.is_err());
    }
}
