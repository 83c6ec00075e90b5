use std::num::NonZeroU32;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use ring::pbkdf2;
use zeroize::Zeroizing;

use super::types::Password;
use crate::error::{Error, Result};

/// PBKDF2 iterations used by keystores unless configured otherwise.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

const SALT_LENGTH: usize = 16;
const NONCE_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;

fn derive_key(
    password: &Password,
    salt: &[u8],
    iterations: u32,
) -> Result<Zeroizing<[u8; 32]>> {
    let iterations = NonZeroU32::new(iterations)
        .ok_or_else(|| Error::Config("iteration count must be non-zero".to_string()))?;

    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        password.as_bytes(),
        key.as_mut_slice(),
    );
    Ok(key)
}

/// Seal `plaintext` under a key derived from `password`.
///
/// Every call draws a fresh salt and nonce. The result is
/// `hex(salt)-hex(nonce)-hex(ciphertext || tag)`.
pub fn derive_and_seal(plaintext: &[u8], password: &Password, iterations: u32) -> Result<String> {
    let mut salt = [0u8; SALT_LENGTH];
    OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);

    let key = derive_key(password, &salt, iterations)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::InvalidMessage("plaintext too large to seal".to_string()))?;

    Ok(format!(
        "{}-{}-{}",
        hex::encode(salt),
        hex::encode(nonce),
        hex::encode(ciphertext)
    ))
}

/// Open a blob produced by [`derive_and_seal`].
///
/// Shape problems are reported as `MalformedBlob`; everything past parsing
/// (wrong password, flipped bits, truncated tag) is `AuthenticationFailure`.
pub fn open_sealed(
    blob: &str,
    password: &Password,
    iterations: u32,
) -> Result<Zeroizing<Vec<u8>>> {
    let fields: Vec<&str> = blob.trim().split('-').collect();
    if fields.len() != 3 {
        return Err(Error::MalformedBlob);
    }

    let salt = hex::decode(fields[0]).map_err(|_| Error::MalformedBlob)?;
    let nonce = hex::decode(fields[1]).map_err(|_| Error::MalformedBlob)?;
    let ciphertext = hex::decode(fields[2]).map_err(|_| Error::MalformedBlob)?;
    if salt.len() != SALT_LENGTH || nonce.len() != NONCE_LENGTH || ciphertext.len() < TAG_LENGTH
    {
        return Err(Error::MalformedBlob);
    }

    let key = derive_key(password, &salt, iterations)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
        .map(Zeroizing::new)
        .map_err(|_| Error::AuthenticationFailure)
}
