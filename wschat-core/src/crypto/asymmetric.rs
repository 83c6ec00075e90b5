use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, SharedSecret};
use zeroize::Zeroizing;

use super::types::{PrivateKey, PublicKey, KEY_LENGTH};
use crate::error::{Error, Result};

const NONCE_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;
const HKDF_INFO: &[u8] = b"wschat-message-v1";

/// Bytes added to every plaintext: ephemeral public key, nonce and tag.
pub const MESSAGE_OVERHEAD: usize = KEY_LENGTH + NONCE_LENGTH + TAG_LENGTH;

/// Derive the per-message AES key, binding both public halves into the salt.
fn derive_message_key(
    shared: &SharedSecret,
    ephemeral: &X25519Public,
    recipient: &X25519Public,
) -> Result<Zeroizing<[u8; 32]>> {
    let mut salt = [0u8; KEY_LENGTH * 2];
    salt[..KEY_LENGTH].copy_from_slice(ephemeral.as_bytes());
    salt[KEY_LENGTH..].copy_from_slice(recipient.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(HKDF_INFO, key.as_mut_slice())
        .map_err(|_| Error::AuthenticationFailure)?;
    Ok(key)
}

/// Encrypt `plaintext` so only the holder of `recipient`'s private key can
/// read it.
///
/// Output layout: `ephemeral_public (32) || nonce (12) || ciphertext || tag (16)`.
pub fn encrypt_for(plaintext: &[u8], recipient: &PublicKey) -> Result<Vec<u8>> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient.inner());
    if !shared.was_contributory() {
        return Err(Error::InvalidPublicKey);
    }

    let key = derive_message_key(&shared, &ephemeral_public, recipient.inner())?;
    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::InvalidMessage("plaintext too large to encrypt".to_string()))?;

    let mut out = Vec::with_capacity(KEY_LENGTH + NONCE_LENGTH + sealed.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Inverse of [`encrypt_for`]. Any malformed or tampered input is an
/// `AuthenticationFailure`.
pub fn decrypt_with(ciphertext: &[u8], own: &PrivateKey) -> Result<Vec<u8>> {
    if ciphertext.len() < MESSAGE_OVERHEAD {
        return Err(Error::AuthenticationFailure);
    }
    let (ephemeral_bytes, rest) = ciphertext.split_at(KEY_LENGTH);
    let (nonce, sealed) = rest.split_at(NONCE_LENGTH);

    let ephemeral_raw: [u8; KEY_LENGTH] = ephemeral_bytes
        .try_into()
        .map_err(|_| Error::AuthenticationFailure)?;
    let ephemeral_public = X25519Public::from(ephemeral_raw);
    let shared = own.secret().diffie_hellman(&ephemeral_public);
    if !shared.was_contributory() {
        return Err(Error::AuthenticationFailure);
    }

    let own_public = own.public_key();
    let key = derive_message_key(&shared, &ephemeral_public, own_public.inner())?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| Error::AuthenticationFailure)
}
