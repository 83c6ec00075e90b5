//! The surface a front-end drives: unlock the keystore, connect, send text to
//! contacts and open what arrives.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::client::RelayClient;
use crate::config::ClientConfig;
use crate::crypto::{decrypt_with, encrypt_for, Password};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::identity::{self, Identity};
use crate::retry::{retry, RetryPolicy};

/// Messages older than this on arrival are shown with their age.
const DELAYED_AFTER: Duration = Duration::from_secs(5);

/// What the user is currently looking at. Passed in explicitly wherever a
/// notification decision is made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewState {
    pub background: bool,
}

/// A decrypted inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub from_id: String,
    /// `None` when the sender is not in the contact list.
    pub username: Option<String>,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

impl ReceivedMessage {
    /// Time since the sender stamped the message; zero if its clock is ahead.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.sent_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_delayed(&self) -> bool {
        self.age() > DELAYED_AFTER
    }

    pub fn should_notify(&self, view: &ViewState) -> bool {
        view.background
    }
}

pub struct ChatSession {
    identity: Identity,
    client: Arc<RelayClient>,
    retry_policy: RetryPolicy,
}

impl ChatSession {
    /// Open the keystore with `password` and prepare a relay client for the
    /// identity inside. The password is wiped when this returns.
    pub fn unlock(
        config: ClientConfig,
        keystore_blob: &str,
        password: Password,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Envelope>)> {
        let identity = identity::load(keystore_blob, &password, config.iterations)?;
        drop(password);
        info!(username = %identity.username(), "Keystore unlocked");
        Ok(Self::new(identity, config))
    }

    pub fn new(
        identity: Identity,
        config: ClientConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (client, inbound) = RelayClient::new(config, identity.id());
        let session = Self {
            identity,
            client,
            retry_policy: RetryPolicy::default(),
        };
        (session, inbound)
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn client(&self) -> &Arc<RelayClient> {
        &self.client
    }

    /// Connect and keep the link alive in the background.
    pub async fn start(&self) -> Result<Option<JoinHandle<()>>> {
        self.client.connect().await?;
        Ok(self.client.keep_alive())
    }

    /// Encrypt `text` for a contact and send it, retrying per the session's
    /// policy while the link is down.
    pub async fn send_text(&self, contact_id: &str, text: &str) -> Result<Envelope> {
        let contact = self
            .identity
            .contact(contact_id)
            .ok_or_else(|| Error::UnknownContact(contact_id.to_string()))?;
        let ciphertext = encrypt_for(text.as_bytes(), &contact.public_key)?;
        let envelope = Envelope::new(contact.id.as_str(), ciphertext, self.identity.id());

        retry(self.retry_policy, || self.client.send_envelope(&envelope))
            .await
            .map_err(|e| {
                warn!(target = %contact_id, error = %e, "Giving up on message");
                e
            })?;
        Ok(envelope)
    }

    /// Decrypt an inbound envelope with the local private key.
    pub fn open(&self, envelope: &Envelope) -> Result<ReceivedMessage> {
        let plaintext = decrypt_with(&envelope.ciphertext, self.identity.private_key())?;
        let text = String::from_utf8(plaintext)
            .map_err(|_| Error::InvalidMessage("message is not UTF-8 text".to_string()))?;

        Ok(ReceivedMessage {
            from_id: envelope.from_id.clone(),
            username: self
                .identity
                .lookup_username(&envelope.from_id)
                .map(String::from),
            text,
            sent_at: envelope.timestamp,
        })
    }

    pub async fn stop(&self) -> Result<()> {
        self.client.disconnect().await
    }
}
