//! Endpoint identity: id, display name, key pair and the contact list.

mod keyshare;
mod keystore;

pub use keyshare::KeyShare;
pub use keystore::{load, read_keystore_file, save, write_keystore_file};

use rand::{distributions::Uniform, rngs::OsRng, Rng};

use crate::crypto::{KeyPair, PrivateKey, PublicKey};
use crate::error::{Error, Result};

/// Length of every identity id, and the only thing the relay checks at
/// handshake time.
pub const ID_LENGTH: usize = 64;

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_";

/// Generate a random identity id from the OS random source.
pub fn generate_id() -> String {
    let mut rng = OsRng;
    let index = Uniform::from(0..ID_ALPHABET.len());
    (0..ID_LENGTH)
        .map(|_| ID_ALPHABET[rng.sample(index)] as char)
        .collect()
}

/// A known peer, learned out-of-band from a keyshare file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: String,
    pub username: String,
    pub public_key: PublicKey,
}

/// The local endpoint's identity.
///
/// Everything except the contact list is fixed at creation. Adding a contact
/// yields a new `Identity`; persist it with [`save`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    id: String,
    username: String,
    keypair: KeyPair,
    contacts: Vec<Contact>,
}

impl Identity {
    /// Provision a brand new identity with a fresh key pair and id.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            username: username.into(),
            keypair: KeyPair::generate(),
            contacts: Vec::new(),
        }
    }

    /// Assemble an identity from stored parts, enforcing key pair consistency
    /// and contact id uniqueness.
    pub fn from_parts(
        id: String,
        username: String,
        keypair: KeyPair,
        contacts: Vec<Contact>,
    ) -> Result<Self> {
        if keypair.private_key.public_key() != keypair.public_key {
            return Err(Error::InvalidKeystore(
                "public key does not match private key".to_string(),
            ));
        }
        let mut identity = Self {
            id,
            username,
            keypair,
            contacts: Vec::with_capacity(contacts.len()),
        };
        for contact in contacts {
            if identity.contact(&contact.id).is_some() {
                return Err(Error::InvalidKeystore(format!(
                    "duplicate contact {}",
                    contact.id
                )));
            }
            identity.contacts.push(contact);
        }
        Ok(identity)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.keypair.public_key
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.keypair.private_key
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn contact(&self, id: &str) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.id == id)
    }

    pub fn lookup_username(&self, id: &str) -> Option<&str> {
        self.contact(id).map(|c| c.username.as_str())
    }

    /// Return a copy of this identity with one more contact appended.
    pub fn add_contact(
        &self,
        id: impl Into<String>,
        username: impl Into<String>,
        public_key: PublicKey,
    ) -> Result<Identity> {
        let id = id.into();
        if self.contact(&id).is_some() {
            return Err(Error::DuplicateContact(id));
        }

        let mut next = self.clone();
        next.contacts.push(Contact {
            id,
            username: username.into(),
            public_key,
        });
        Ok(next)
    }

    pub fn add_contact_from_keyshare(&self, share: &KeyShare) -> Result<Identity> {
        let contact = share.to_contact()?;
        self.add_contact(contact.id, contact.username, contact.public_key)
    }

    pub fn keyshare(&self) -> KeyShare {
        KeyShare::from_identity(self)
    }
}
