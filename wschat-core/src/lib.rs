//! Core of the wschat end-to-end encrypted relay chat.
//!
//! The relay only ever sees [`Envelope`]s: a target id, a sender id, a
//! timestamp and ciphertext produced by [`crypto::encrypt_for`]. Identities
//! live in a password-sealed keystore on each endpoint.

pub mod client;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod retry;
pub mod session;

mod b64;

pub use client::{ConnectionState, RelayClient};
pub use config::ClientConfig;
pub use envelope::{Envelope, Handshake};
pub use error::{Error, Result};
pub use identity::{Contact, Identity, KeyShare, ID_LENGTH};
pub use retry::RetryPolicy;
pub use session::{ChatSession, ReceivedMessage, ViewState};
