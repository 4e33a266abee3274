//! BIP39 mnemonic helpers
//!
//! A wallet derives every output secret from a 64 byte seed. The seed comes from a mnemonic,
//! so backing up the words is enough to [restore](crate::Wallet::restore) the funds.

use bip39::Mnemonic;

use crate::Error;

/// Words in a generated mnemonic
const WORD_COUNT: usize = 12;

/// New random 12 word English mnemonic
pub fn generate_mnemonic() -> Result<String, Error> {
    Ok(Mnemonic::generate(WORD_COUNT)?.to_string())
}

/// Entropy encoded by a mnemonic
pub fn mnemonic_to_entropy(mnemonic: &str) -> Result<Vec<u8>, Error> {
    Ok(Mnemonic::parse(mnemonic)?.to_entropy())
}

/// Wallet seed for a mnemonic and optional passphrase
pub fn mnemonic_to_seed(mnemonic: &str, passphrase: &str) -> Result<[u8; 64], Error> {
    Ok(Mnemonic::parse(mnemonic)?.to_seed_normalized(passphrase))
}
