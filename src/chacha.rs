//! Default at-rest backend built on ChaCha20-Poly1305.
//!
//! Every `write` generates a fresh 256-bit key and 96-bit nonce, seals the
//! plaintext under that pair and keeps key, nonce and ciphertext in process
//! memory as the only record of the value. Every `read` opens the ciphertext
//! and wipes all three.
//!
//! This backend runs entirely in-process with no OS assistance. It obscures
//! secrets from casual inspection (core dumps of other processes, accidental
//! serialization), but an adversary able to scan this process's memory can
//! find the key next to the ciphertext.
//!
//! The key, nonce and ciphertext buffers owned here are wiped. The key
//! schedule inside ring's `UnboundKey`/`LessSafeKey` is not: ring offers no
//! way to zeroize it, so each seal or open leaves one unwiped copy of that
//! generation's key in freed memory. A ring key lives only for the duration
//! of one seal or open. The copy of the nonce handed to ring is not wiped
//! either; nonces are not secret.

use crate::error::{Result, StashError};
use crate::storage::{Storage, StorageFactory};
use log::{debug, trace};
use once_cell::sync::Lazy;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN};
use std::fmt;
#[cfg(feature = "metrics")]
use std::time::Instant;
use zeroize::Zeroizing;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = NONCE_LEN;

static SUPPORTED: Lazy<bool> = Lazy::new(|| match probe() {
    Ok(()) => true,
    Err(e) => {
        debug!("ChaCha20-Poly1305 backend unavailable: {}", e);
        false
    }
});

fn chacha20_poly1305_alg() -> &'static aead::Algorithm {
    &aead::CHACHA20_POLY1305
}

fn fill_random(dest: &mut [u8]) -> Result<()> {
    getrandom::getrandom(dest).map_err(|e| StashError::RandomGenerationFailed(e.to_string()))
}

fn less_safe_key(key: &[u8; KEY_SIZE]) -> Result<LessSafeKey> {
    let unbound = UnboundKey::new(chacha20_poly1305_alg(), key)
        .map_err(|_| StashError::Crypto("Failed to create ChaCha20-Poly1305 key".into()))?;
    Ok(LessSafeKey::new(unbound))
}

// Round-trips a short message through a full generation.
fn probe() -> Result<()> {
    const PROBE: &[u8] = b"stash-probe";

    let generation = Generation::seal(PROBE)?;
    let opened = generation.open()?;
    if opened.as_slice() != PROBE {
        return Err(StashError::Crypto("Probe round trip mismatch".into()));
    }
    Ok(())
}

/// One write cycle's key material and ciphertext. Every field wipes itself
/// on drop.
struct Generation {
    key: Zeroizing<[u8; KEY_SIZE]>,
    nonce: Zeroizing<[u8; NONCE_SIZE]>,
    ciphertext: Zeroizing<Vec<u8>>,
}

impl Generation {
    fn seal(plaintext: &[u8]) -> Result<Self> {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        fill_random(&mut key[..])?;
        let mut nonce = Zeroizing::new([0u8; NONCE_SIZE]);
        fill_random(&mut nonce[..])?;

        let sealing_key = less_safe_key(&key)?;

        // Reserve room for the tag up front so the buffer never reallocates
        // and leaves a stray plaintext copy behind.
        let tag_len = chacha20_poly1305_alg().tag_len();
        let mut in_out = Zeroizing::new(Vec::with_capacity(plaintext.len() + tag_len));
        in_out.extend_from_slice(plaintext);

        sealing_key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(*nonce),
                Aad::empty(),
                &mut *in_out,
            )
            .map_err(|_| StashError::Crypto("Encryption failed".into()))?;

        Ok(Self {
            key,
            nonce,
            ciphertext: in_out,
        })
    }

    fn open(self) -> Result<Zeroizing<Vec<u8>>> {
        let Generation {
            key,
            nonce,
            mut ciphertext,
        } = self;

        let opening_key = less_safe_key(&key)?;
        let plaintext_len = opening_key
            .open_in_place(
                Nonce::assume_unique_for_key(*nonce),
                Aad::empty(),
                &mut ciphertext[..],
            )
            .map_err(|_| StashError::Crypto("Decryption failed".into()))?
            .len();

        // The tag bytes past the plaintext are wiped along with the spare
        // capacity when the returned buffer is dropped.
        ciphertext.truncate(plaintext_len);
        Ok(ciphertext)
    }
}

/// In-process ChaCha20-Poly1305 storage for one secret.
///
/// # Examples
///
/// ```rust
/// use stash::{ChaChaStorage, Storage};
///
/// let mut storage = ChaChaStorage::new();
/// storage.write(b"token").unwrap();
/// assert_eq!(storage.read().unwrap().as_slice(), b"token");
/// ```
#[derive(Default)]
pub struct ChaChaStorage {
    generation: Option<Generation>,
    disposed: bool,
}

impl ChaChaStorage {
    /// Creates an empty storage with no generation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a generation is currently stored.
    pub fn has_generation(&self) -> bool {
        self.generation.is_some()
    }
}

impl Storage for ChaChaStorage {
    fn write(&mut self, plaintext: &[u8]) -> Result<()> {
        if self.disposed {
            return Err(StashError::StorageFailed(
                "Cannot write to a disposed storage".into(),
            ));
        }

        #[cfg(feature = "metrics")]
        let start = Instant::now();

        // Seal into a local first so a failure leaves the previous generation
        // untouched. Replacing the option drops (and wipes) the old one.
        let generation = Generation::seal(plaintext)?;
        self.generation = Some(generation);

        trace!("Sealed new generation of {} bytes", plaintext.len());

        #[cfg(feature = "metrics")]
        metrics::histogram!("stash.storage.chacha.write_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        Ok(())
    }

    #[allow(clippy::panic)]
    fn read(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        let generation = match self.generation.take() {
            Some(generation) => generation,
            None => panic!("ChaChaStorage::read called without a preceding write"),
        };

        generation.open()
    }

    fn dispose(&mut self) -> Result<()> {
        self.generation = None;
        self.disposed = true;
        Ok(())
    }
}

impl fmt::Debug for ChaChaStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChaChaStorage")
            .field("has_generation", &self.has_generation())
            .field("disposed", &self.disposed)
            .finish()
    }
}

/// Factory for [`ChaChaStorage`]; the fallback every stash can rely on.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChaChaStorageFactory;

impl ChaChaStorageFactory {
    /// Creates a new factory.
    pub fn new() -> Self {
        Self
    }
}

impl StorageFactory for ChaChaStorageFactory {
    fn create(&self) -> Result<Box<dyn Storage>> {
        Ok(Box::new(ChaChaStorage::new()))
    }

    fn is_supported(&self) -> bool {
        *SUPPORTED
    }

    fn name(&self) -> &'static str {
        "chacha20-poly1305"
    }
}
