use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::{Contact, Identity};
use crate::crypto::{self, KeyPair, Password, PrivateKey, PublicKey};
use crate::error::{Error, Result};

/// JSON shape sealed inside the keystore blob.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
struct StoredKeystore {
    username: String,
    id: String,
    #[serde(with = "crate::b64")]
    public_key: Vec<u8>,
    #[serde(with = "crate::b64")]
    private_key: Vec<u8>,
    #[serde(default)]
    contacts: Vec<StoredContact>,
}

#[derive(Serialize, Deserialize, Zeroize)]
#[serde(rename_all = "camelCase")]
struct StoredContact {
    #[serde(with = "crate::b64")]
    public_key: Vec<u8>,
    id: String,
    username: String,
}

impl StoredKeystore {
    fn from_identity(identity: &Identity) -> Self {
        Self {
            username: identity.username().to_string(),
            id: identity.id().to_string(),
            public_key: identity.public_key().as_bytes().to_vec(),
            private_key: identity.private_key().to_bytes().to_vec(),
            contacts: identity
                .contacts()
                .iter()
                .map(|c| StoredContact {
                    public_key: c.public_key.as_bytes().to_vec(),
                    id: c.id.clone(),
                    username: c.username.clone(),
                })
                .collect(),
        }
    }

    fn to_identity(&self) -> Result<Identity> {
        let public_key = PublicKey::from_bytes(&self.public_key)
            .map_err(|_| Error::InvalidKeystore("identity public key is not valid".to_string()))?;
        let private_key = PrivateKey::from_bytes(&self.private_key)?;

        let contacts = self
            .contacts
            .iter()
            .map(|c| {
                let public_key = PublicKey::from_bytes(&c.public_key).map_err(|_| {
                    Error::InvalidKeystore(format!("public key for contact {} is not valid", c.id))
                })?;
                Ok(Contact {
                    id: c.id.clone(),
                    username: c.username.clone(),
                    public_key,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Identity::from_parts(
            self.id.clone(),
            self.username.clone(),
            KeyPair {
                private_key,
                public_key,
            },
            contacts,
        )
    }
}

/// Open a sealed keystore blob and rebuild the identity it holds.
pub fn load(blob: &str, password: &Password, iterations: u32) -> Result<Identity> {
    let plaintext = crypto::open_sealed(blob, password, iterations)?;
    // serde_json errors can quote input, so keep the message generic.
    let stored: StoredKeystore = serde_json::from_slice(&plaintext)
        .map_err(|_| Error::InvalidKeystore("keystore contents are not valid JSON".to_string()))?;
    let identity = stored.to_identity()?;
    debug!(contacts = identity.contacts().len(), "Keystore loaded");
    Ok(identity)
}

/// Seal an identity into a keystore blob under a fresh salt and nonce.
pub fn save(identity: &Identity, password: &Password, iterations: u32) -> Result<String> {
    let stored = StoredKeystore::from_identity(identity);
    let json = Zeroizing::new(
        serde_json::to_vec_pretty(&stored)
            .map_err(|e| Error::InvalidKeystore(format!("failed to serialize keystore: {}", e)))?,
    );
    crypto::derive_and_seal(&json, password, iterations)
}

pub fn read_keystore_file(path: impl AsRef<Path>) -> Result<String> {
    Ok(fs::read_to_string(path)?)
}

/// Write a keystore blob, readable by the owner only on unix.
pub fn write_keystore_file(path: impl AsRef<Path>, blob: &str) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(blob.as_bytes())?;
    file.sync_all()?;
    Ok(())
}
