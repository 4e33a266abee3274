//! Cashu shared types and functions.
//!
//! Protocol primitives used by the CDK wallet: amounts and split policies, keys and keyset
//! ids, proofs and tokens, spending conditions and the blind Diffie-Hellman key exchange.

#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

pub mod amount;
pub mod dhke;
pub mod error;
pub mod mint_url;
pub mod nuts;
pub mod secret;
pub mod util;

pub use self::amount::{Amount, DenominationPolicy, KeysetDenominations, PowerOfTwo, SplitTarget};
pub use self::error::Error;
pub use self::mint_url::MintUrl;
pub use self::nuts::*;
pub use self::secret::Secret;
