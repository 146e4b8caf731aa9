//! The registry that creates and tracks secrets.

use crate::chacha::ChaChaStorageFactory;
use crate::codec::SecretSpec;
use crate::error::{Result, StashError};
use crate::secret::{DisposeCallback, ManagedSecret, Secret, SecretId, SecretValue};
use crate::storage::StorageFactory;
use log::{debug, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

type Entries = Vec<(SecretId, Arc<dyn ManagedSecret>)>;

// Removes a secret by identity; a no-op if it is already gone or the stash
// has been dropped.
fn remove_entry(entries: &Weak<Mutex<Entries>>, id: SecretId) {
    if let Some(entries) = entries.upgrade() {
        entries.lock().retain(|(entry_id, _)| *entry_id != id);
    }
}

fn removal_callback(entries: &Arc<Mutex<Entries>>, id: SecretId) -> DisposeCallback {
    let entries = Arc::downgrade(entries);
    Box::new(move || remove_entry(&entries, id))
}

/// A container that manages [`Secret`]s.
///
/// Every secret is backed by a storage obtained from the stash's storage
/// factory, chosen once when the stash is built (see [`StashBuilder`]).
///
/// # Examples
///
/// ```rust
/// use stash::{SecretSpec, Stash, StashError, StringCodec};
///
/// let stash = Stash::builder().build().unwrap();
/// let spec = SecretSpec::builder(StringCodec).build();
///
/// let secret = stash.put(&spec, "api-token".to_string()).unwrap();
/// assert_eq!(stash.len(), 1);
///
/// stash.clear().unwrap();
/// assert!(stash.is_empty());
/// assert!(matches!(secret.acquire(), Err(StashError::Disposed)));
/// ```
pub struct Stash {
    secrets: Arc<Mutex<Entries>>,
    storage_factory: Arc<dyn StorageFactory>,
}

impl Stash {
    /// Returns a builder for a stash.
    pub fn builder() -> StashBuilder {
        StashBuilder::default()
    }

    /// Creates a new secret holding `value` and puts it into this stash.
    ///
    /// The value is encrypted into fresh storage before this returns; no
    /// plaintext is kept in memory.
    pub fn put<T: SecretValue>(&self, spec: &SecretSpec<T>, value: T) -> Result<Secret<T>> {
        let storage = self.storage_factory.create()?;
        let id = SecretId::next();

        let secret = Secret::new(
            id,
            Arc::clone(spec.codec()),
            storage,
            value,
            removal_callback(&self.secrets, id),
        )?;

        self.secrets.lock().push((id, secret.managed()));
        Ok(secret)
    }

    /// Disposes every secret in this stash.
    ///
    /// Each secret is removed as its disposal completes. Locks still held on
    /// those secrets observe them as disposed. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns `StashError::StorageFailed` listing every storage that failed
    /// to release its resources. All secrets are disposed and removed
    /// regardless.
    pub fn clear(&self) -> Result<()> {
        // Snapshot so no stash lock is held while secrets are disposed; the
        // removal callbacks take it again.
        let snapshot: Vec<_> = self.secrets.lock().clone();
        debug!("Clearing stash with {} secrets", snapshot.len());

        let mut failures = Vec::new();
        for (id, secret) in snapshot {
            if let Err(e) = secret.dispose_with(Some(removal_callback(&self.secrets, id))) {
                warn!("{}: dispose failed during clear: {}", id, e);
                failures.push(format!("{}: {}", id, e));
            }
            // A secret disposed earlier with a custom teardown is still listed
            self.detach(id);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(StashError::StorageFailed(format!(
                "Errors during stash clear: {}",
                failures.join("; ")
            )))
        }
    }

    fn detach(&self, id: SecretId) {
        self.secrets.lock().retain(|(entry_id, _)| *entry_id != id);
    }

    /// Returns the number of live secrets.
    pub fn len(&self) -> usize {
        self.secrets.lock().len()
    }

    /// Returns true if the stash holds no live secrets.
    pub fn is_empty(&self) -> bool {
        self.secrets.lock().is_empty()
    }

    /// Returns the name of the storage backend in use.
    pub fn storage_name(&self) -> &'static str {
        self.storage_factory.name()
    }
}

impl fmt::Debug for Stash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stash")
            .field("secrets", &self.len())
            .field("storage", &self.storage_name())
            .finish()
    }
}

/// Builder for [`Stash`] instances.
///
/// The storage factory is chosen as follows:
///
/// 1. A factory set through [`with_storage_factory`](Self::with_storage_factory)
///    is always used.
/// 2. Otherwise the providers registered through
///    [`with_provider`](Self::with_provider) are probed in registration order
///    and the first supported one is used.
/// 3. Otherwise [`ChaChaStorageFactory`] is used. It obscures secrets
///    in-process instead of offloading them to protected storage.
#[derive(Default)]
pub struct StashBuilder {
    storage_factory: Option<Arc<dyn StorageFactory>>,
    providers: Vec<Arc<dyn StorageFactory>>,
}

impl StashBuilder {
    /// Sets the storage factory explicitly, bypassing provider selection.
    pub fn with_storage_factory<F>(mut self, factory: F) -> Self
    where
        F: StorageFactory + 'static,
    {
        self.storage_factory = Some(Arc::new(factory));
        self
    }

    /// Registers a candidate storage backend. Candidates are probed in the
    /// order they were registered.
    pub fn with_provider<F>(mut self, factory: F) -> Self
    where
        F: StorageFactory + 'static,
    {
        self.providers.push(Arc::new(factory));
        self
    }

    /// Builds the stash.
    ///
    /// # Errors
    ///
    /// Returns `StashError::NoSupportedStorage` if no explicit factory was
    /// set, no provider is supported and the default backend is unavailable.
    pub fn build(self) -> Result<Stash> {
        let storage_factory = match self.storage_factory {
            Some(factory) => {
                if !factory.is_supported() {
                    warn!("Explicit storage '{}' reports itself unsupported", factory.name());
                }
                factory
            }
            None => select_storage_factory(self.providers)?,
        };

        debug!("Stash using '{}' storage", storage_factory.name());

        Ok(Stash {
            secrets: Arc::new(Mutex::new(Vec::new())),
            storage_factory,
        })
    }
}

impl fmt::Debug for StashBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StashBuilder")
            .field(
                "storage_factory",
                &self.storage_factory.as_ref().map(|factory| factory.name()),
            )
            .field(
                "providers",
                &self.providers.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn select_storage_factory(
    providers: Vec<Arc<dyn StorageFactory>>,
) -> Result<Arc<dyn StorageFactory>> {
    for provider in providers {
        if provider.is_supported() {
            return Ok(provider);
        }
        debug!("Storage '{}' is not supported, skipping", provider.name());
    }

    let fallback = ChaChaStorageFactory::new();
    if !fallback.is_supported() {
        return Err(StashError::NoSupportedStorage);
    }
    Ok(Arc::new(fallback))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StringCodec;
    use crate::test_utils::RecordingStorageFactory;

    fn spec() -> SecretSpec<String> {
        SecretSpec::builder(StringCodec).build()
    }

    #[test]
    fn test_default_backend() {
        let stash = Stash::builder().build().unwrap();
        assert_eq!(stash.storage_name(), "chacha20-poly1305");
    }

    #[test]
    fn test_explicit_factory_wins() {
        let stash = Stash::builder()
            .with_provider(RecordingStorageFactory::named("provider", true))
            .with_storage_factory(RecordingStorageFactory::named("explicit", false))
            .build()
            .unwrap();
        assert_eq!(stash.storage_name(), "explicit");
    }

    #[test]
    fn test_first_supported_provider_wins() {
        let stash = Stash::builder()
            .with_provider(RecordingStorageFactory::named("unsupported", false))
            .with_provider(RecordingStorageFactory::named("first", true))
            .with_provider(RecordingStorageFactory::named("second", true))
            .build()
            .unwrap();
        assert_eq!(stash.storage_name(), "first");
    }

    #[test]
    fn test_falls_back_when_no_provider_supported() {
        let stash = Stash::builder()
            .with_provider(RecordingStorageFactory::named("unsupported", false))
            .build()
            .unwrap();
        assert_eq!(stash.storage_name(), "chacha20-poly1305");
    }

    #[test]
    fn test_put_tracks_secret() {
        let factory = RecordingStorageFactory::new();
        let stash = Stash::builder()
            .with_storage_factory(factory.clone())
            .build()
            .unwrap();

        let _first = stash.put(&spec(), "one".to_string()).unwrap();
        let _second = stash.put(&spec(), "two".to_string()).unwrap();

        assert_eq!(stash.len(), 2);
        assert_eq!(factory.writes(), 2);
    }

    #[test]
    fn test_failed_put_is_not_tracked() {
        let factory = RecordingStorageFactory::new();
        factory.fail_writes(true);
        let stash = Stash::builder()
            .with_storage_factory(factory.clone())
            .build()
            .unwrap();

        assert!(stash.put(&spec(), "one".to_string()).is_err());
        assert!(stash.is_empty());
    }

    #[test]
    fn test_dispose_removes_by_identity() {
        let stash = Stash::builder().build().unwrap();
        let first = stash.put(&spec(), "one".to_string()).unwrap();
        let second = stash.put(&spec(), "two".to_string()).unwrap();
        let third = stash.put(&spec(), "three".to_string()).unwrap();

        // Out of insertion order
        first.dispose().unwrap();
        third.dispose().unwrap();
        assert_eq!(stash.len(), 1);

        let remaining: Vec<_> = stash.secrets.lock().iter().map(|(id, _)| *id).collect();
        assert_eq!(remaining, vec![second.id()]);
    }

    #[test]
    fn test_clear_disposes_everything() {
        let factory = RecordingStorageFactory::new();
        let stash = Stash::builder()
            .with_storage_factory(factory.clone())
            .build()
            .unwrap();

        let secrets: Vec<_> = (0..5)
            .map(|i| stash.put(&spec(), format!("secret-{}", i)).unwrap())
            .collect();

        stash.clear().unwrap();

        assert!(stash.is_empty());
        assert_eq!(factory.disposes(), 5);
        for secret in &secrets {
            assert!(secret.is_disposed());
        }

        stash.clear().unwrap();
        assert_eq!(factory.disposes(), 5);

        let _next = stash.put(&spec(), "after".to_string()).unwrap();
        assert_eq!(stash.len(), 1);
    }

    #[test]
    fn test_secret_outlives_stash() {
        let stash = Stash::builder().build().unwrap();
        let secret = stash.put(&spec(), "kept".to_string()).unwrap();
        drop(stash);

        let lock = secret.acquire().unwrap();
        assert_eq!(lock.get().as_deref().map(String::as_str), Some("kept"));
        drop(lock);
        secret.dispose().unwrap();
    }
}
