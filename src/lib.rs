//! # Stash
//!
//! Keep sensitive values out of plain memory while they are idle.
//!
//! A [`Stash`] owns a set of [`Secret`]s. Each secret keeps its value
//! encrypted in a [`Storage`] and only decrypts it into memory while at
//! least one [`Lock`] is held on it. When the last lock is released, the
//! value is re-encrypted under a fresh key and the plaintext is wiped.
//!
//! ## Features
//!
//! - **Encrypted at rest**: idle secrets only exist as ciphertext
//! - **Reference counting**: concurrent locks share one decrypted copy
//! - **Guaranteed wiping**: every plaintext and key buffer is zeroed on all
//!   exit paths, including errors
//! - **Thread-safe**: each secret is guarded by its own mutex; different
//!   secrets never contend
//! - **Pluggable backends**: register platform storages in priority order,
//!   with an in-process ChaCha20-Poly1305 fallback
//!
//! ## Basic Usage
//!
//! ```rust
//! use stash::{SecretSpec, Stash, StringCodec};
//!
//! let stash = Stash::builder().build().unwrap();
//! let spec = SecretSpec::builder(StringCodec).build();
//!
//! // The value is encrypted before `put` returns
//! let secret = stash.put(&spec, "foo".to_string()).unwrap();
//!
//! {
//!     let mut lock = secret.acquire().unwrap();
//!     assert_eq!(lock.get().as_deref().map(String::as_str), Some("foo"));
//!     lock.set("bar".to_string()).unwrap();
//!     // Dropping the lock re-encrypts "bar" and wipes it from memory
//! }
//!
//! // Dispose everything, e.g. on logout
//! stash.clear().unwrap();
//! assert!(secret.acquire().is_err());
//! ```
//!
//! ## Custom Backends
//!
//! Implement [`Storage`] and [`StorageFactory`] and register the factory:
//!
//! ```rust,no_run
//! use stash::{ChaChaStorageFactory, Stash};
//!
//! let stash = Stash::builder()
//!     // .with_provider(KeychainStorageFactory::new())
//!     .with_provider(ChaChaStorageFactory::new())
//!     .build()
//!     .unwrap();
//! ```
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T, StashError>`](Result). Using a
//! disposed secret or a released lock is reported as an access error;
//! backend and codec failures are propagated as-is.

/// Error types
pub mod error;

/// Value codecs and secret specs
pub mod codec;

/// Storage and storage factory traits
pub mod storage;

/// Default in-process ChaCha20-Poly1305 storage
pub mod chacha;

/// Secrets and locks
pub mod secret;

/// The secret registry
pub mod stash;

/// Utilities for testing
pub mod test_utils;

// Re-export key types
pub use crate::chacha::{ChaChaStorage, ChaChaStorageFactory};
pub use crate::codec::{BytesCodec, Codec, SecretSpec, SecretSpecBuilder, StringCodec};
pub use crate::error::{Result, StashError};
pub use crate::secret::{Lock, Secret, SecretId, SecretValue};
pub use crate::stash::{Stash, StashBuilder};
pub use crate::storage::{Storage, StorageFactory};
