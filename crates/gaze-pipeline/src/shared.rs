//! Shared store access for concurrent readers and writers.

use gaze_core::EmbeddingStore;
use std::sync::{Arc, PoisonError, RwLock};

/// Clone-cheap handle to a shared [`EmbeddingStore`].
///
/// Readers take an `Arc` snapshot and scan it with no lock held, so a slow
/// similarity scan never blocks enrollment and never observes a partial
/// mutation. Writers copy the current store, apply the change, and swap the
/// snapshot in under a brief write lock.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<RwLock<Arc<EmbeddingStore>>>,
}

impl StoreHandle {
    pub fn new(store: EmbeddingStore) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(store))),
        }
    }

    /// The current immutable snapshot.
    pub fn snapshot(&self) -> Arc<EmbeddingStore> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply a mutation through copy-and-swap. In-flight snapshots keep
    /// seeing the pre-mutation store.
    pub fn mutate<R>(&self, mutation: impl FnOnce(&mut EmbeddingStore) -> R) -> R {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = EmbeddingStore::clone(&guard);
        let out = mutation(&mut next);
        *guard = Arc::new(next);
        out
    }
}
