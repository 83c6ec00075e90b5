use thiserror::Error;

/// Errors surfaced by the chat core.
///
/// Cryptographic failures never carry detail about why they failed, so a
/// wrong password and a tampered blob look the same to the caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed keystore blob")]
    MalformedBlob,

    #[error("authentication failed")]
    AuthenticationFailure,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid keystore: {0}")]
    InvalidKeystore(String),

    #[error("contact {0} already exists")]
    DuplicateContact(String),

    #[error("unknown contact {0}")]
    UnknownContact(String),

    #[error("dial failed: {0}")]
    DialError(String),

    #[error("handshake write failed: {0}")]
    HandshakeWriteError(String),

    #[error("write failed: {0}")]
    WriteError(String),

    #[error("not connected to relay")]
    NotConnected,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
