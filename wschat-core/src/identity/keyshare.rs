use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{Contact, Identity};
use crate::crypto::PublicKey;
use crate::error::{Error, Result};

/// Public record exchanged out-of-band so peers can add each other as
/// contacts. Nothing in it is secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyShare {
    pub id: String,
    pub username: String,
    /// Standard base64 of the raw public key.
    pub public_key: String,
}

impl KeyShare {
    pub fn from_identity(identity: &Identity) -> Self {
        Self {
            id: identity.id().to_string(),
            username: identity.username().to_string(),
            public_key: identity.public_key().to_base64(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::InvalidMessage(format!("failed to serialize keyshare: {}", e)))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidMessage(format!("invalid keyshare: {}", e)))
    }

    pub fn to_contact(&self) -> Result<Contact> {
        Ok(Contact {
            id: self.id.clone(),
            username: self.username.clone(),
            public_key: PublicKey::from_base64(&self.public_key)?,
        })
    }

    /// Conventional file name, `<username>.keyshare`.
    pub fn file_name(&self) -> String {
        format!("{}.keyshare", self.username)
    }

    /// Write the keyshare into `dir` and return the path written.
    pub fn write_to_dir(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let path = dir.as_ref().join(self.file_name());
        fs::write(&path, self.to_json()?)?;
        Ok(path)
    }

    pub fn read_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }
}
