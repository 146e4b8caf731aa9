//! Reference-counted access to a single secret.
//!
//! A [`Secret`] keeps its value encrypted in a [`Storage`] while nobody uses
//! it. Acquiring the first [`Lock`] decrypts the value into memory; releasing
//! the last lock re-encrypts it into a fresh storage generation and wipes the
//! resident copy.
//!
//! ```text
//!            acquire (0 -> 1): read + deserialize
//!   Idle ─────────────────────────────────────────> Held
//!    ^  <─────────────────────────────────────────   |
//!    |       release (1 -> 0): serialize + write     |
//!    |                                               |
//!    └──────────────> Disposed <─────────────────────┘
//!                     (absorbing)
//! ```
//!
//! All state of a secret (disposed flag, hold count, resident value and
//! storage) sits behind one mutex. Every operation, including reads through
//! a lock, runs inside that critical section; different secrets never share
//! a mutex.
//!
//! A lock dropped while its store fails gives its hold back anyway. If it
//! was the last hold, the value stays resident with a pending store: the
//! next acquire reuses it instead of reading storage, and the next last
//! release writes it. Disposal wipes it.

use crate::codec::Codec;
use crate::error::{Result, StashError};
use crate::storage::Storage;
use log::{debug, error, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use zeroize::{Zeroize, Zeroizing};

static NEXT_SECRET_ID: AtomicU64 = AtomicU64::new(1);

/// Values that can be held in a [`Secret`].
///
/// Resident values are wiped through [`Zeroize`] whenever they leave memory.
pub trait SecretValue: Zeroize + Send + 'static {}

impl<T: Zeroize + Send + 'static> SecretValue for T {}

/// Callback run exactly once when a secret is disposed.
pub(crate) type DisposeCallback = Box<dyn FnOnce() + Send>;

/// Process-unique identifier of a secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecretId(u64);

impl SecretId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SECRET_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "secret-{}", self.0)
    }
}

struct SecretState<T: SecretValue> {
    storage: Box<dyn Storage>,
    // Present iff (holds > 0 or pending_store) and not disposed
    value: Option<Zeroizing<T>>,
    holds: u32,
    // Resident value not yet written back; storage holds no generation
    pending_store: bool,
    disposed: bool,
    // Set while the winning disposer runs its teardown callback
    tearing_down: bool,
    on_dispose: Option<DisposeCallback>,
}

impl<T: SecretValue> SecretState<T> {
    fn teardown(&mut self) -> Result<()> {
        let result = self.storage.dispose();
        self.disposed = true;
        self.value = None;
        self.pending_store = false;
        result
    }

    // Serializes the resident value and writes it as a new generation. The
    // serialization buffer is wiped on every path.
    fn store(&mut self, codec: &dyn Codec<T>) -> Result<()> {
        let bytes = match self.value.as_deref() {
            Some(value) => Zeroizing::new(codec.serialize(value)?),
            None => {
                return Err(StashError::StorageFailed(
                    "No resident value to store".into(),
                ))
            }
        };
        self.storage.write(&bytes)
    }
}

pub(crate) struct SecretInner<T: SecretValue> {
    id: SecretId,
    codec: Arc<dyn Codec<T>>,
    state: Mutex<SecretState<T>>,
    teardown_done: Condvar,
    next_lock_id: AtomicU64,
}

// Clears `tearing_down` and wakes waiting disposers, also if the callback
// panics.
struct TeardownGuard<'inner, T: SecretValue> {
    inner: &'inner SecretInner<T>,
}

impl<T: SecretValue> Drop for TeardownGuard<'_, T> {
    fn drop(&mut self) {
        self.inner.state.lock().tearing_down = false;
        self.inner.teardown_done.notify_all();
    }
}

impl<T: SecretValue> SecretInner<T> {
    fn acquire(self: &Arc<Self>) -> Result<Lock<T>> {
        let mut state = self.state.lock();

        if state.disposed {
            return Err(StashError::Disposed);
        }

        let holds = state.holds.checked_add(1).ok_or(StashError::TooManyLocks)?;

        if state.holds == 0 && state.pending_store {
            trace!("{}: reusing value with a pending store", self.id);
        } else if state.holds == 0 {
            let bytes = match state.storage.read() {
                Ok(bytes) => bytes,
                Err(e) => return self.fail_load(state, e),
            };

            match self.codec.deserialize(&bytes) {
                Ok(value) => state.value = Some(Zeroizing::new(value)),
                Err(e) => {
                    // The read consumed the generation; put it back so the
                    // value survives the failed decode.
                    if let Err(restore) = state.storage.write(&bytes) {
                        warn!("{}: failed to restore generation after decode error: {}", self.id, e);
                        return self.fail_load(state, restore);
                    }
                    return Err(e);
                }
            }

            trace!("{}: loaded into memory", self.id);
        }

        state.holds = holds;
        drop(state);

        #[cfg(feature = "metrics")]
        metrics::counter!("stash.secret.acquire").increment(1);

        let lock_id = self.next_lock_id.fetch_add(1, Ordering::Relaxed);
        trace!("{}: acquired lock {} (holds: {})", self.id, lock_id, holds);

        Ok(Lock {
            secret: Arc::clone(self),
            id: lock_id,
            released: false,
        })
    }

    // Storage has nothing left to load from; the secret can never be
    // acquired again.
    fn fail_load(
        &self,
        mut state: MutexGuard<'_, SecretState<T>>,
        cause: StashError,
    ) -> Result<Lock<T>> {
        error!("{}: failed to load from storage, disposing: {}", self.id, cause);

        if let Err(e) = state.teardown() {
            warn!("{}: storage dispose failed: {}", self.id, e);
        }
        let teardown = state.on_dispose.take();
        state.tearing_down = true;
        drop(state);

        let _done = TeardownGuard { inner: self };
        if let Some(teardown) = teardown {
            teardown();
        }
        Err(cause)
    }

    fn release(&self, lock_id: u64) -> Result<bool> {
        let mut state = self.state.lock();

        if state.disposed {
            return Ok(false);
        }

        debug_assert!(state.holds > 0, "outstanding lock on a secret with no holds");
        let remaining = state.holds.saturating_sub(1);

        if remaining == 0 {
            // Nothing changes unless the new generation is written; on
            // failure the lock stays outstanding and the value resident.
            state.store(self.codec.as_ref())?;
            state.value = None;
            state.pending_store = false;
            trace!("{}: stored to storage", self.id);
        }

        state.holds = remaining;
        drop(state);

        #[cfg(feature = "metrics")]
        metrics::counter!("stash.secret.release").increment(1);

        trace!("{}: released lock {} (holds: {})", self.id, lock_id, remaining);
        Ok(true)
    }

    // Gives up the hold of a lock whose release failed while it was being
    // dropped. Nothing else can release that hold.
    fn abandon(&self, lock_id: u64) {
        let mut state = self.state.lock();

        if state.disposed {
            return;
        }

        state.holds = state.holds.saturating_sub(1);
        if state.holds == 0 {
            state.pending_store = true;
        }

        warn!(
            "{}: dropped lock {} without storing (holds: {}, store pending: {})",
            self.id, lock_id, state.holds, state.pending_store
        );
    }

    // Only the first caller tears down and runs a callback. Later callers
    // return once that callback has finished.
    fn dispose_inner(&self, callback: Option<DisposeCallback>) -> Result<()> {
        let mut state = self.state.lock();

        if state.disposed {
            while state.tearing_down {
                self.teardown_done.wait(&mut state);
            }
            return Ok(());
        }

        let result = state.teardown();
        let default = state.on_dispose.take();
        state.tearing_down = true;
        drop(state);

        debug!("{}: disposed", self.id);

        let _done = TeardownGuard { inner: self };
        if let Some(teardown) = callback.or(default) {
            teardown();
        }
        result
    }
}

impl<T: SecretValue> Drop for SecretInner<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.disposed {
            if let Err(e) = state.teardown() {
                warn!("{}: storage dispose failed on drop: {}", self.id, e);
            }
        }
    }
}

/// Type-erased view of a secret used by the stash for bulk teardown.
pub(crate) trait ManagedSecret: Send + Sync {
    fn dispose_with(&self, callback: Option<DisposeCallback>) -> Result<()>;
}

impl<T: SecretValue> ManagedSecret for SecretInner<T> {
    fn dispose_with(&self, callback: Option<DisposeCallback>) -> Result<()> {
        self.dispose_inner(callback)
    }
}

/// A managed sensitive value of type `T`.
///
/// Secrets are created by [`crate::Stash::put`]. To read or modify the value
/// a [`Lock`] must be acquired; the value is only held in memory while at
/// least one lock is outstanding.
///
/// Cloning a `Secret` produces another handle to the same secret.
///
/// # Examples
///
/// ```rust
/// use stash::{SecretSpec, Stash, StringCodec};
///
/// let stash = Stash::builder().build().unwrap();
/// let spec = SecretSpec::builder(StringCodec).build();
/// let secret = stash.put(&spec, "foo".to_string()).unwrap();
///
/// let mut lock = secret.acquire().unwrap();
/// assert_eq!(lock.get().as_deref().map(String::as_str), Some("foo"));
/// lock.set("bar".to_string()).unwrap();
/// lock.release().unwrap();
///
/// let lock = secret.acquire().unwrap();
/// assert_eq!(lock.get().as_deref().map(String::as_str), Some("bar"));
/// ```
pub struct Secret<T: SecretValue> {
    inner: Arc<SecretInner<T>>,
}

impl<T: SecretValue> Secret<T> {
    /// Creates a secret and immediately writes `value` into `storage`.
    ///
    /// The initial value is wiped once it has been written. If the write
    /// fails the storage is disposed and the error returned.
    pub(crate) fn new(
        id: SecretId,
        codec: Arc<dyn Codec<T>>,
        mut storage: Box<dyn Storage>,
        value: T,
        on_dispose: DisposeCallback,
    ) -> Result<Self> {
        let value = Zeroizing::new(value);

        let written = codec
            .serialize(&value)
            .map(Zeroizing::new)
            .and_then(|bytes| storage.write(&bytes));

        if let Err(e) = written {
            if let Err(dispose_err) = storage.dispose() {
                warn!("{}: storage dispose failed: {}", id, dispose_err);
            }
            return Err(e);
        }

        #[cfg(feature = "metrics")]
        metrics::counter!("stash.secret.created").increment(1);

        debug!("{}: created", id);

        Ok(Self {
            inner: Arc::new(SecretInner {
                id,
                codec,
                state: Mutex::new(SecretState {
                    storage,
                    value: None,
                    holds: 0,
                    pending_store: false,
                    disposed: false,
                    tearing_down: false,
                    on_dispose: Some(on_dispose),
                }),
                teardown_done: Condvar::new(),
                next_lock_id: AtomicU64::new(1),
            }),
        })
    }

    pub(crate) fn managed(&self) -> Arc<dyn ManagedSecret> {
        let managed: Arc<dyn ManagedSecret> = self.inner.clone();
        managed
    }

    /// Returns this secret's identifier.
    pub fn id(&self) -> SecretId {
        self.inner.id
    }

    /// Acquires a lock holding onto this secret.
    ///
    /// If no other lock is outstanding, the value is read from storage and
    /// deserialized into memory.
    ///
    /// # Errors
    ///
    /// * `StashError::Disposed` - If the secret has been disposed
    /// * `StashError::TooManyLocks` - If the hold counter would overflow
    /// * Storage or codec errors while loading the value. A storage failure
    ///   leaves nothing to recover from and disposes the secret.
    pub fn acquire(&self) -> Result<Lock<T>> {
        self.inner.acquire()
    }

    /// Disposes this secret, releasing its storage.
    ///
    /// Outstanding locks become inert. Calling this more than once has no
    /// further effect. The owning stash forgets the secret before this
    /// returns, also when another thread won the race to dispose it.
    pub fn dispose(&self) -> Result<()> {
        self.inner.dispose_inner(None)
    }

    /// Disposes this secret, running `teardown` instead of the default
    /// stash-removal callback.
    ///
    /// `teardown` is not run if the secret was already disposed. It must not
    /// dispose this same secret again.
    pub fn dispose_with<F>(&self, teardown: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.dispose_inner(Some(Box::new(teardown)))
    }

    /// Returns true once the secret has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    /// Returns the number of outstanding locks.
    pub fn holds(&self) -> u32 {
        self.inner.state.lock().holds
    }
}

impl<T: SecretValue> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: SecretValue> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret").field("id", &self.inner.id).finish_non_exhaustive()
    }
}

/// Scoped access to a [`Secret`]'s value.
///
/// A lock can only be obtained from [`Secret::acquire`]. It does not own the
/// value; it is a permission to use the secret's resident copy. Dropping a
/// lock releases it.
pub struct Lock<T: SecretValue> {
    secret: Arc<SecretInner<T>>,
    id: u64,
    released: bool,
}

impl<T: SecretValue> Lock<T> {
    /// Returns the lock's identifier, unique within its secret.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the identifier of the secret this lock holds onto.
    pub fn secret_id(&self) -> SecretId {
        self.secret.id
    }

    /// Returns true once this lock has been released.
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Returns a copy of the secret's value, wiped when dropped.
    ///
    /// Returns `None` if this lock has been released or the secret has been
    /// disposed.
    pub fn get(&self) -> Option<Zeroizing<T>>
    where
        T: Clone,
    {
        self.with_value(|value| value.map(|value| Zeroizing::new(T::clone(value))))
    }

    /// Calls `f` with a reference to the secret's value without copying it.
    ///
    /// `f` receives `None` if this lock has been released or the secret has
    /// been disposed. It runs inside the secret's critical section and must
    /// not use the same secret.
    pub fn with_value<F, R>(&self, f: F) -> R
    where
        F: FnOnce(Option<&T>) -> R,
    {
        let state = self.secret.state.lock();
        if state.disposed || self.released {
            return f(None);
        }
        f(state.value.as_deref())
    }

    /// Replaces the secret's value.
    ///
    /// # Errors
    ///
    /// * `StashError::Disposed` - If the secret has been disposed
    /// * `StashError::LockReleased` - If this lock has been released
    pub fn set(&mut self, value: T) -> Result<()> {
        let value = Zeroizing::new(value);
        let mut state = self.secret.state.lock();

        if state.disposed {
            return Err(StashError::Disposed);
        }
        if self.released {
            return Err(StashError::LockReleased);
        }

        state.value = Some(value);
        Ok(())
    }

    /// Replaces the secret's value with the one produced by `f`, if this
    /// lock is still usable.
    ///
    /// Returns whether the value was updated. `f` is only called if it was.
    pub fn set_if_acquired<F>(&mut self, f: F) -> bool
    where
        F: FnOnce() -> T,
    {
        let mut state = self.secret.state.lock();

        if state.disposed || self.released {
            return false;
        }

        state.value = Some(Zeroizing::new(f()));
        true
    }

    /// Releases this lock.
    ///
    /// Does nothing if the lock was already released or the secret has been
    /// disposed. If this was the last outstanding lock, the value is written
    /// to storage as a new generation and wiped from memory.
    ///
    /// # Errors
    ///
    /// Codec or storage errors while storing the value. The lock then stays
    /// unreleased and the value resident, so nothing is lost; the call may
    /// be retried. Dropping the lock instead gives its hold back and leaves
    /// the store to the next last release.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        if self.secret.release(self.id)? {
            self.released = true;
        }
        Ok(())
    }

    /// Disposes the secret this lock holds onto.
    pub fn dispose(&self) -> Result<()> {
        self.secret.dispose_inner(None)
    }
}

impl<T: SecretValue> Drop for Lock<T> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!(
                "{}: failed to release lock {} on drop: {}",
                self.secret.id, self.id, e
            );
            self.secret.abandon(self.id);
            self.released = true;
        }
    }
}

impl<T: SecretValue> fmt::Debug for Lock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("secret", &self.secret.id)
            .field("id", &self.id)
            .field("released", &self.released)
            .finish()
    }
}
