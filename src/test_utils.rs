//! Utilities for testing code built on stash
//!
//! [`RecordingStorageFactory`] creates storages that delegate to
//! [`ChaChaStorage`] while counting calls and remembering the last written
//! plaintext. All storages created by one factory share a single record, so
//! a test can keep a clone of the factory and inspect it after handing the
//! original to a [`crate::StashBuilder`].
//!
//! The record keeps a plaintext copy of the last write. Never use these
//! types outside tests.

use crate::chacha::ChaChaStorage;
use crate::error::{Result, StashError};
use crate::storage::{Storage, StorageFactory};
use parking_lot::Mutex;
use std::sync::Arc;
use zeroize::Zeroizing;

#[derive(Debug, Default)]
struct StorageRecord {
    writes: usize,
    reads: usize,
    disposes: usize,
    last_written: Zeroizing<Vec<u8>>,
    fail_writes: bool,
}

/// A storage factory that records every call made to its storages.
#[derive(Debug, Clone)]
pub struct RecordingStorageFactory {
    record: Arc<Mutex<StorageRecord>>,
    supported: bool,
    name: &'static str,
}

impl RecordingStorageFactory {
    /// Creates a factory that reports itself as supported.
    pub fn new() -> Self {
        Self::named("recording", true)
    }

    /// Creates a factory with the given name and support probe result.
    pub fn named(name: &'static str, supported: bool) -> Self {
        Self {
            record: Arc::new(Mutex::new(StorageRecord::default())),
            supported,
            name,
        }
    }

    /// Number of successful writes across all storages of this factory.
    pub fn writes(&self) -> usize {
        self.record.lock().writes
    }

    /// Number of reads across all storages of this factory.
    pub fn reads(&self) -> usize {
        self.record.lock().reads
    }

    /// Number of dispose calls across all storages of this factory.
    pub fn disposes(&self) -> usize {
        self.record.lock().disposes
    }

    /// Plaintext of the most recent successful write.
    pub fn last_written(&self) -> Vec<u8> {
        self.record.lock().last_written.to_vec()
    }

    /// Makes subsequent writes fail with `StashError::StorageFailed`.
    pub fn fail_writes(&self, fail: bool) {
        self.record.lock().fail_writes = fail;
    }
}

impl Default for RecordingStorageFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageFactory for RecordingStorageFactory {
    fn create(&self) -> Result<Box<dyn Storage>> {
        Ok(Box::new(RecordingStorage {
            inner: ChaChaStorage::new(),
            record: Arc::clone(&self.record),
        }))
    }

    fn is_supported(&self) -> bool {
        self.supported
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Storage created by [`RecordingStorageFactory`].
#[derive(Debug)]
pub struct RecordingStorage {
    inner: ChaChaStorage,
    record: Arc<Mutex<StorageRecord>>,
}

impl Storage for RecordingStorage {
    fn write(&mut self, plaintext: &[u8]) -> Result<()> {
        let mut record = self.record.lock();
        if record.fail_writes {
            return Err(StashError::StorageFailed("injected write failure".into()));
        }

        self.inner.write(plaintext)?;
        record.writes += 1;
        record.last_written = Zeroizing::new(plaintext.to_vec());
        Ok(())
    }

    fn read(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        self.record.lock().reads += 1;
        self.inner.read()
    }

    fn dispose(&mut self) -> Result<()> {
        self.record.lock().disposes += 1;
        self.inner.dispose()
    }
}
