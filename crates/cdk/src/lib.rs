//! Rust implementation of the Cashu wallet protocol engine.
//!
//! Tracks proofs and quotes against one or more mints, keeping a consistent local ledger under
//! concurrent network I/O and partial failures.

#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

pub mod config;
pub mod database;
pub mod error;
pub mod fees;
pub mod state;
pub mod types;
pub mod wallet;

#[doc(hidden)]
pub use cashu::{self, amount, dhke, mint_url, nuts, secret, util};
#[doc(hidden)]
pub use cashu::{Amount, MintUrl, Secret};

pub use self::config::WalletConfig;
pub use self::error::Error;
pub use self::wallet::seed::{generate_mnemonic, mnemonic_to_entropy, mnemonic_to_seed};
pub use self::wallet::{MultiMintWallet, Wallet, WalletBuilder};

/// Return early with an error if the condition does not hold
#[macro_export]
macro_rules! ensure_cdk {
    ($cond:expr, $err:expr) => {
        if !$cond {
            return Err($err);
        }
    };
}
