//! The storage port: the seam every at-rest backend implements.
//!
//! A [`Storage`] holds exactly one secret's bytes in an encrypted or
//! obscured "cold" form. Its lifecycle is driven by the owning secret:
//!
//! ```text
//!   create ──> write ──> read ──> write ──> read ... ──> dispose
//! ```
//!
//! Each `write` produces a new generation and discards the previous one.
//! Each `read` consumes the current generation; a second `read` without an
//! intervening `write` is a contract violation and panics.
//!
//! A [`StorageFactory`] creates storages and reports whether its backend is
//! usable on the current platform. [`crate::StashBuilder`] probes registered
//! factories in order and falls back to [`crate::ChaChaStorageFactory`].

use crate::error::Result;
use zeroize::Zeroizing;

/// At-rest representation of one secret's value.
///
/// Implementers must wipe every transient plaintext or key buffer they
/// allocate internally on every exit path, including error paths.
pub trait Storage: Send {
    /// Stores a fresh generation of `plaintext`, discarding any prior one.
    ///
    /// The caller's buffer must not be retained or aliased past the call.
    /// If the write fails, the previous generation (if any) must be left
    /// intact.
    fn write(&mut self, plaintext: &[u8]) -> Result<()>;

    /// Decrypts and returns the current generation, then clears all
    /// generation state.
    ///
    /// # Panics
    ///
    /// Panics if there is no current generation, i.e. `write` was never
    /// called or `read` was already called since the last `write`.
    fn read(&mut self) -> Result<Zeroizing<Vec<u8>>>;

    /// Releases any resources held. Must be safe to call before `write` and
    /// more than once.
    fn dispose(&mut self) -> Result<()>;
}

/// Creates [`Storage`] instances for one backend.
pub trait StorageFactory: Send + Sync {
    /// Creates a new, empty storage.
    fn create(&self) -> Result<Box<dyn Storage>>;

    /// Reports whether this backend can operate in the current process.
    fn is_supported(&self) -> bool;

    /// Short human-readable backend name, used for logging.
    fn name(&self) -> &'static str;
}
