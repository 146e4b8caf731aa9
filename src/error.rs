use thiserror::Error;

/// Errors that can occur in the stash library.
///
/// Access-state errors (`Disposed`, `LockReleased`, `TooManyLocks`) indicate
/// misuse of a secret or lock by the caller and are never retried. The
/// remaining variants report failures of a storage backend or codec; they are
/// propagated unchanged and never turned into a degraded state.
///
/// # Examples
///
/// ```rust,no_run
/// use stash::{Stash, SecretSpec, StringCodec, StashError};
///
/// let stash = Stash::builder().build().unwrap();
/// let secret = stash.put(&SecretSpec::builder(StringCodec).build(), "foo".to_string()).unwrap();
///
/// stash.clear().unwrap();
///
/// match secret.acquire() {
///     Err(StashError::Disposed) => println!("secret is gone"),
///     other => println!("unexpected: {:?}", other.map(|_| ())),
/// }
/// ```
#[derive(Error, Debug)]
pub enum StashError {
    /// The secret has already been disposed.
    ///
    /// Returned by `acquire` and `set` once the secret's storage has been
    /// released, either through `Lock::dispose`, `Secret::dispose` or
    /// `Stash::clear`.
    #[error("Secret is already disposed")]
    Disposed,

    /// The lock has already been released and can no longer be used to
    /// modify the secret.
    #[error("Lock is already released")]
    LockReleased,

    /// The hold counter of a secret would overflow.
    #[error("Too many locks held on secret")]
    TooManyLocks,

    /// A cryptographic primitive failed to initialize or operate.
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    /// Failed to generate secure random data for a key or nonce.
    #[error("Random generation failed: {0}")]
    RandomGenerationFailed(String),

    /// A storage backend failed to acquire or release an underlying resource.
    #[error("Storage operation failed: {0}")]
    StorageFailed(String),

    /// No storage factory reported itself as supported, not even the
    /// default ChaCha20 backend.
    #[error("No supported storage backend available")]
    NoSupportedStorage,

    /// A codec failed to convert a value to or from bytes.
    #[error("Codec failed: {0}")]
    Codec(String),
}

/// Result type for stash operations.
pub type Result<T> = std::result::Result<T, StashError>;
