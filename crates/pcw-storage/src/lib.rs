//! Relational store, per-identifier locks and HTTP fetch utilities for PCW.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard};

pub mod http;
pub mod store;

pub use http::{ApiAuth, FetchError, HttpClientConfig, HttpFetcher, RateLimit, RetryPolicy};
pub use store::*;

pub const CRATE_NAME: &str = "pcw-storage";

type LockMap = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Serialization points keyed by an arbitrary identifier string.
///
/// Holders of the same key run one at a time; different keys never contend.
/// An entry is dropped once only the map references it. Entries left behind
/// by cancelled waiters are swept on the next `lock`.
#[derive(Debug, Clone, Default)]
pub struct KeyedLocks {
    inner: LockMap,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: impl Into<String>) -> KeyGuard {
        let key = key.into();
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.retain(|_, slot| Arc::strong_count(slot) > 1);
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = slot.lock_owned().await;
        KeyGuard {
            key,
            locks: Arc::clone(&self.inner),
            guard: Some(guard),
        }
    }

    /// Keys currently held or awaited.
    pub fn held_keys(&self) -> usize {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.retain(|_, slot| Arc::strong_count(slot) > 1);
        map.len()
    }
}

#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    locks: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // release first so the map holds the last reference when nobody waits
        self.guard.take();
        let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if map
            .get(&self.key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            map.remove(&self.key);
        }
    }
}
