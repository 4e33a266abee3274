//! Diffie-Hellmann key exchange

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{self, Scalar};

use crate::nuts::nut00::{BlindSignature, Proof, Proofs};
use crate::nuts::nut01::{Keys, PublicKey, SecretKey};
use crate::util::secp;
use crate::{Error, Secret};

const DOMAIN_SEPARATOR: &[u8; 28] = b"Secp256k1_HashToCurve_Cashu_";

/// Deterministically maps a message to a public key point on the secp256k1 curve, utilizing a
/// domain separator to ensure uniqueness.
///
/// For definition in NUT see [NUT-00](https://github.com/cashubtc/nuts/blob/main/00.md)
pub fn hash_to_curve(message: &[u8]) -> Result<PublicKey, Error> {
    let msg_to_hash: Vec<u8> = [DOMAIN_SEPARATOR.as_slice(), message].concat();

    let msg_hash: [u8; 32] = sha256::Hash::hash(&msg_to_hash).to_byte_array();

    let mut counter: u32 = 0;
    while counter < 2_u32.pow(16) {
        let mut bytes_to_hash: Vec<u8> = Vec::with_capacity(36);
        bytes_to_hash.extend_from_slice(&msg_hash);
        bytes_to_hash.extend_from_slice(&counter.to_le_bytes());
        let hash: [u8; 32] = sha256::Hash::hash(&bytes_to_hash).to_byte_array();

        // Try to parse public key
        let mut candidate = [0u8; 33];
        candidate[0] = 0x02;
        candidate[1..].copy_from_slice(&hash);
        match PublicKey::from_slice(&candidate) {
            Ok(pk) => return Ok(pk),
            Err(_) => {
                counter += 1;
            }
        }
    }

    Err(Error::NoValidPoint)
}

/// Blind Message
///
/// `B_ = Y + rG`
pub fn blind_message(
    secret: &[u8],
    blinding_factor: Option<SecretKey>,
) -> Result<(PublicKey, SecretKey), Error> {
    let y: PublicKey = hash_to_curve(secret)?;
    let r: SecretKey = blinding_factor.unwrap_or_else(SecretKey::generate);
    Ok((y.combine(&r.public_key())?.into(), r))
}

/// Unblind Message
///
/// `C_ - rK`
pub fn unblind_message(
    // C_
    blinded_key: &PublicKey,
    r: &SecretKey,
    // K
    mint_pubkey: &PublicKey,
) -> Result<PublicKey, Error> {
    let r: Scalar = Scalar::from(*r.as_secp());

    // a = r * K
    let a: secp256k1::PublicKey = mint_pubkey.mul_tweak(secp(), &r)?;

    // C_ - a
    let a: secp256k1::PublicKey = a.negate(secp());
    Ok(blinded_key.combine(&a)?.into())
}

/// Sign Blinded Message
///
/// `C_ = k * B_`, where:
/// * `k` is the private key of mint (one for each amount)
/// * `B_` is the blinded message
#[inline]
pub fn sign_message(k: &SecretKey, blinded_message: &PublicKey) -> Result<PublicKey, Error> {
    let k: Scalar = Scalar::from(*k.as_secp());
    Ok(blinded_message.mul_tweak(secp(), &k)?.into())
}

/// Verify Message
///
/// `C == k * Y`
pub fn verify_message(a: &SecretKey, unblinded_message: PublicKey, msg: &[u8]) -> Result<(), Error> {
    let y: PublicKey = hash_to_curve(msg)?;
    let expected: PublicKey = sign_message(a, &y)?;

    if unblinded_message == expected {
        return Ok(());
    }

    Err(Error::InvalidSignature("proof does not verify".to_string()))
}

/// Construct proofs from the mint's blind signatures
///
/// All or nothing: a count mismatch, a signature for a denomination the keys do not cover or
/// a DLEQ proof that does not verify fails the whole batch.
pub fn construct_proofs(
    promises: Vec<BlindSignature>,
    rs: Vec<SecretKey>,
    secrets: Vec<Secret>,
    keys: &Keys,
) -> Result<Proofs, Error> {
    if (promises.len() != rs.len()) || (promises.len() != secrets.len()) {
        return Err(Error::InvalidSignature(format!(
            "expected {} signatures, got {}",
            secrets.len(),
            promises.len()
        )));
    }

    let mut proofs = Vec::with_capacity(promises.len());
    for ((blinded_signature, r), secret) in promises.into_iter().zip(rs).zip(secrets) {
        let a: PublicKey = keys
            .amount_key(blinded_signature.amount)
            .ok_or(Error::AmountKey(blinded_signature.amount))?;

        if let Some(dleq) = &blinded_signature.dleq {
            let (blinded_message, _) = blind_message(secret.as_bytes(), Some(r.clone()))?;
            dleq.verify(&a, &blinded_message, &blinded_signature.c)?;
        }

        let unblinded_signature: PublicKey = unblind_message(&blinded_signature.c, &r, &a)?;

        let proof = Proof::new(
            blinded_signature.amount,
            blinded_signature.keyset_id,
            secret,
            unblinded_signature,
        );

        proofs.push(proof);
    }

    Ok(proofs)
}
