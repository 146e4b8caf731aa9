//! Conversion between secret values and the bytes handed to storage.

use crate::error::{Result, StashError};
use std::fmt;
use std::sync::Arc;

/// Converts values of type `T` to and from a byte sequence.
///
/// Implementations must not retain the byte buffer beyond the call. The
/// caller wipes every buffer passed to or returned from a codec as soon as
/// the call completes.
pub trait Codec<T>: Send + Sync {
    /// Serializes `value` into a freshly allocated byte vector.
    fn serialize(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserializes a value from `bytes`.
    fn deserialize(&self, bytes: &[u8]) -> Result<T>;
}

/// Codec for UTF-8 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec<String> for StringCodec {
    fn serialize(&self, value: &String) -> Result<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<String> {
        match std::str::from_utf8(bytes) {
            Ok(s) => Ok(s.to_owned()),
            // The error message only carries positions, never content
            Err(e) => Err(StashError::Codec(format!("invalid UTF-8: {}", e))),
        }
    }
}

/// Codec for raw byte vectors.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec<Vec<u8>> for BytesCodec {
    fn serialize(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// Describes how secrets of type `T` behave.
///
/// A spec is created once per value type and passed to [`crate::Stash::put`]
/// for every secret of that type. Cloning a spec is cheap.
///
/// # Examples
///
/// ```rust
/// use stash::{SecretSpec, StringCodec};
///
/// let spec = SecretSpec::builder(StringCodec).build();
/// ```
pub struct SecretSpec<T> {
    codec: Arc<dyn Codec<T>>,
}

impl<T> SecretSpec<T> {
    /// Returns a builder for a spec using the given codec.
    pub fn builder<C>(codec: C) -> SecretSpecBuilder<T>
    where
        C: Codec<T> + 'static,
    {
        SecretSpecBuilder {
            codec: Arc::new(codec),
        }
    }

    /// Returns the codec used for secrets of this spec.
    pub fn codec(&self) -> &Arc<dyn Codec<T>> {
        &self.codec
    }
}

impl<T> Clone for SecretSpec<T> {
    fn clone(&self) -> Self {
        Self {
            codec: Arc::clone(&self.codec),
        }
    }
}

impl<T> fmt::Debug for SecretSpec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretSpec").finish_non_exhaustive()
    }
}

/// Builder for [`SecretSpec`] instances.
pub struct SecretSpecBuilder<T> {
    codec: Arc<dyn Codec<T>>,
}

impl<T> SecretSpecBuilder<T> {
    /// Builds the spec.
    pub fn build(self) -> SecretSpec<T> {
        SecretSpec { codec: self.codec }
    }
}
