/// Errors that can occur while establishing or driving a secure session.
///
/// Messages never carry key material or intermediate values; they describe
/// which step failed, not what it was computing.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// An argument was malformed or had the wrong length.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Guarded memory could not be allocated.
    #[error("Secure memory allocation failed: {0}")]
    Allocation(String),

    /// Key pair generation failed.
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// A key derivation or agreement step failed.
    #[error("Key derivation failed: {0}")]
    DeriveKey(String),

    /// Remote public key material failed validation.
    #[error("Peer public key rejected: {0}")]
    PeerPubKey(String),

    /// Local key material required for the operation is not prepared.
    #[error("Local key material not prepared: {0}")]
    PrepareLocal(String),

    /// The handshake could not be completed with the data provided.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// An object was used after it had been disposed.
    #[error("Object disposed: {0}")]
    ObjectDisposed(&'static str),

    /// The message was already processed or falls outside the replay window.
    #[error("Replay detected")]
    ReplayDetected,

    /// The ciphertext failed authentication.
    #[error("Decryption failed")]
    Decrypt,

    /// The message lies further ahead of its chain than the skip limit allows.
    #[error("Message gap of {0} exceeds the skip limit")]
    TooManySkipped(u32),

    /// The persistence collaborator failed.
    #[error("Storage failure: {0}")]
    Storage(String),

    /// The persistence collaborator has no state for the requested session.
    #[error("Persisted state not found")]
    NotFound,

    /// Persisted or wire data could not be decoded.
    #[error("Decode failed: {0}")]
    Decode(String),

    /// The operation was cancelled before it committed.
    #[error("Operation cancelled")]
    Cancelled,

    /// The crypto provider is unusable.
    #[error("Crypto provider unavailable: {0}")]
    Provider(String),

    /// No live session exists for the connection id.
    #[error("No session for connection {0}")]
    SessionNotFound(u32),
}

/// What the transport layer is told when an operation fails.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelSignal {
    /// The secure channel is unavailable; the caller may retry later.
    UnavailableRetry,
    /// The message was dropped; the channel itself is fine.
    MessageRejected,
    /// The local engine is misused or broken; retrying will not help.
    Fault,
}

impl Error {
    /// Whether the caller may retry the failed operation a bounded number of times.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::KeyGeneration(_) | Self::DeriveKey(_) | Self::Storage(_) | Self::Cancelled
        )
    }

    /// Maps the error onto the coarse signal surfaced to the transport layer.
    pub fn channel_signal(&self) -> ChannelSignal {
        match self {
            Self::ReplayDetected | Self::Decrypt | Self::TooManySkipped(_) => {
                ChannelSignal::MessageRejected
            }
            Self::ObjectDisposed(_) | Self::Provider(_) | Self::InvalidInput(_) => {
                ChannelSignal::Fault
            }
            _ => ChannelSignal::UnavailableRetry,
        }
    }
}

impl From<aes_gcm_siv::Error> for Error {
    fn from(_: aes_gcm_siv::Error) -> Self {
        Self::Decrypt
    }
}

impl From<prost::DecodeError> for Error {
    fn from(value: prost::DecodeError) -> Self {
        Self::Decode(value.to_string())
    }
}
