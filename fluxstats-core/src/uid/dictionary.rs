//! Cached, concurrency-safe front for a [`UidStore`]

use super::{Uid, UidStore, ROLLED_UP_NAME};
use crate::config::RetryConfig;
use crate::{Result, StatsError};
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Whether a lookup may allocate a new identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Lookup only
    Get,
    /// Allocate when the name is unseen
    GetOrCreate,
}

/// Bidirectional name to identifier dictionary
///
/// Both directions are held in bounded LRU caches loaded on miss. Mappings
/// never change once written, so cached entries are never invalidated.
///
/// Creation is serialized per name: callers racing on the same unseen name
/// queue behind one lock while unrelated names proceed. The store's
/// conditional create is the final arbiter across processes.
pub struct UidDictionary {
    store: Arc<dyn UidStore>,
    by_name: Mutex<LruCache<String, Uid>>,
    by_id: Mutex<LruCache<Uid, String>>,
    creating: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    retry: RetryConfig,
}

impl UidDictionary {
    /// Create a dictionary with `cache_capacity` entries per direction
    pub fn new(store: Arc<dyn UidStore>, cache_capacity: usize, retry: RetryConfig) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            by_name: Mutex::new(LruCache::new(capacity)),
            by_id: Mutex::new(LruCache::new(capacity)),
            creating: DashMap::new(),
            retry,
        }
    }

    /// Fixed byte width of identifiers
    pub fn width(&self) -> usize {
        self.store.width()
    }

    /// Number of names currently cached
    pub fn cache_len(&self) -> usize {
        self.by_name.lock().len()
    }

    /// Look up a name without allocating
    pub async fn get(&self, name: &str) -> Result<Option<Uid>> {
        let cached = self.by_name.lock().get(name).copied();
        if cached.is_some() {
            return Ok(cached);
        }
        let found = self.with_retry(name, || self.store.get_id(name)).await?;
        if let Some(id) = found {
            self.cache(name, id);
        }
        Ok(found)
    }

    /// Look up a name, allocating the next identifier if it is unseen
    pub async fn get_or_create(&self, name: &str) -> Result<Uid> {
        if let Some(id) = self.get(name).await? {
            return Ok(id);
        }

        let lock = self
            .creating
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.create(name).await
        };
        drop(lock);
        self.creating
            .remove_if(name, |_, l| Arc::strong_count(l) == 1);
        result
    }

    /// Look up or create depending on `mode`
    pub async fn resolve(&self, name: &str, mode: FetchMode) -> Result<Option<Uid>> {
        match mode {
            FetchMode::Get => self.get(name).await,
            FetchMode::GetOrCreate => self.get_or_create(name).await.map(Some),
        }
    }

    /// Reverse lookup; an issued identifier with no name is corruption
    pub async fn get_name(&self, id: Uid) -> Result<String> {
        if id.is_rolled_up() {
            return Ok(ROLLED_UP_NAME.to_string());
        }
        let cached = self.by_id.lock().get(&id).cloned();
        if let Some(name) = cached {
            return Ok(name);
        }
        let key = id.to_string();
        match self.with_retry(&key, || self.store.get_name(id)).await? {
            Some(name) => {
                self.cache(&name, id);
                Ok(name)
            }
            None => {
                error!(uid = %id, "No reverse mapping for issued uid");
                Err(StatsError::DictionaryCorruption(key))
            }
        }
    }

    /// Load every stored mapping into the caches, up to capacity
    pub async fn warm(&self) -> Result<usize> {
        let all = self.store.load_all().await?;
        let loaded = all.len();
        for (name, id) in all {
            self.cache(&name, id);
        }
        debug!(loaded, "Warmed uid caches");
        Ok(loaded)
    }

    async fn create(&self, name: &str) -> Result<Uid> {
        // Another caller may have finished while we waited for the lock
        if let Some(id) = self.get(name).await? {
            return Ok(id);
        }

        let width = self.width();
        let next = self.with_retry(name, || self.store.next_sequence()).await?;
        let max = Uid::max_issuable(width);
        if next > max {
            error!(name, next, max, width, "UID namespace exhausted");
            return Err(StatsError::NamespaceExhausted { next, max, width });
        }
        let candidate = Uid::new(next, width)?;

        // Reverse first so a forward mapping never points at a missing name
        self.with_retry(name, || self.store.put_reverse(candidate, name))
            .await?;
        let winner = self
            .with_retry(name, || self.store.create_forward_if_absent(name, candidate))
            .await?;

        if winner != candidate {
            debug!(name, lost = %candidate, winner = %winner, "Lost uid creation race");
            self.with_retry(name, || self.store.delete_reverse(candidate))
                .await?;
        } else {
            debug!(name, uid = %winner, "Created uid");
        }

        self.cache(name, winner);
        Ok(winner)
    }

    async fn with_retry<T, F, Fut>(&self, name: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(name, attempt, error = %e, ?delay, "Retrying uid store call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn cache(&self, name: &str, id: Uid) {
        self.by_name.lock().put(name.to_string(), id);
        self.by_id.lock().put(id, name.to_string());
    }
}
