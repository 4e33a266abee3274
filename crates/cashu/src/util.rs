//! Utils

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::secp256k1::{All, Secp256k1};

/// Shared secp256k1 context
pub fn secp() -> &'static Secp256k1<All> {
    static SECP256K1: OnceLock<Secp256k1<All>> = OnceLock::new();
    SECP256K1.get_or_init(Secp256k1::new)
}

/// Seconds since unix epoch
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Random 32 bytes, hex encoded
pub fn random_hex_32() -> String {
    use bitcoin::secp256k1::rand::{self, RngCore};

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
