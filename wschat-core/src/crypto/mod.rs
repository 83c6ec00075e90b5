//! CryptoBox: password sealing for the keystore at rest and the integrated
//! encryption scheme used for every message in transit.

mod asymmetric;
mod symmetric;
mod types;

pub use asymmetric::{decrypt_with, encrypt_for, MESSAGE_OVERHEAD};
pub use symmetric::{derive_and_seal, open_sealed, DEFAULT_ITERATIONS};
pub use types::{KeyPair, Password, PrivateKey, PublicKey, KEY_LENGTH};
