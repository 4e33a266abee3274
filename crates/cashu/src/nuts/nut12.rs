//! NUT-12: Offline ecash signature validation
//!
//! <https://github.com/cashubtc/nuts/blob/main/12.md>

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{self, Scalar};
use serde::{Deserialize, Serialize};

use super::nut01::{PublicKey, SecretKey};
use crate::util::secp;
use crate::Error;

/// Blind Signature DLEQ
///
/// Proves the mint used the private key behind its advertised public key for `C_`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindSignatureDleq {
    /// e
    pub e: SecretKey,
    /// s
    pub s: SecretKey,
}

/// `e = sha256(R1 || R2 || A || C_)` over uncompressed hex encodings
fn hash_e<'a, I>(public_keys: I) -> [u8; 32]
where
    I: IntoIterator<Item = &'a secp256k1::PublicKey>,
{
    let mut e = String::new();
    for pk in public_keys {
        e.push_str(&hex::encode(pk.serialize_uncompressed()));
    }
    sha256::Hash::hash(e.as_bytes()).to_byte_array()
}

impl BlindSignatureDleq {
    /// Create proof for `blinded_signature = mint_secret_key * blinded_message`
    pub fn new(
        mint_secret_key: &SecretKey,
        blinded_message: &PublicKey,
        blinded_signature: &PublicKey,
    ) -> Result<Self, Error> {
        let nonce = SecretKey::generate();

        // R1 = r*G, R2 = r*B_
        let r1 = nonce.public_key();
        let r2 = blinded_message.mul_tweak(secp(), &Scalar::from(*nonce.as_secp()))?;

        let e = hash_e([
            r1.as_secp(),
            &r2,
            mint_secret_key.public_key().as_secp(),
            blinded_signature.as_secp(),
        ]);
        let e = SecretKey::from_slice(&e)?;

        // s = r + e*a
        let ea = e
            .as_secp()
            .mul_tweak(&Scalar::from(*mint_secret_key.as_secp()))?;
        let s = nonce.as_secp().add_tweak(&Scalar::from(ea))?;

        Ok(Self { e, s: s.into() })
    }

    /// Verify against the mint public key `A`, `B_` and `C_`
    pub fn verify(
        &self,
        mint_pubkey: &PublicKey,
        blinded_message: &PublicKey,
        blinded_signature: &PublicKey,
    ) -> Result<(), Error> {
        let e = Scalar::from(*self.e.as_secp());
        let s = Scalar::from(*self.s.as_secp());

        // R1 = s*G - e*A
        let ea = mint_pubkey.mul_tweak(secp(), &e)?.negate(secp());
        let r1 = self.s.public_key().combine(&ea)?;

        // R2 = s*B_ - e*C_
        let sb = blinded_message.mul_tweak(secp(), &s)?;
        let ec = blinded_signature.mul_tweak(secp(), &e)?.negate(secp());
        let r2 = sb.combine(&ec)?;

        let expected = hash_e([&r1, &r2, mint_pubkey.as_secp(), blinded_signature.as_secp()]);

        if expected != self.e.as_secp().secret_bytes() {
            return Err(Error::InvalidSignature("DLEQ proof does not verify".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhke::{blind_message, sign_message};

    #[test]
    fn test_dleq_verifies() {
        let mint_key = SecretKey::generate();
        let (blinded, _r) = blind_message(b"test_message", None).unwrap();
        let signature = sign_message(&mint_key, &blinded).unwrap();

        let dleq = BlindSignatureDleq::new(&mint_key, &blinded, &signature).unwrap();
        assert!(dleq
            .verify(&mint_key.public_key(), &blinded, &signature)
            .is_ok());

        // Signature made with another key
        let other = SecretKey::generate();
        let forged = sign_message(&other, &blinded).unwrap();
        assert!(dleq
            .verify(&mint_key.public_key(), &blinded, &forged)
            .is_err());
        assert!(dleq.verify(&other.public_key(), &blinded, &signature).is_err());
    }
}
