//! Persistence boundary for the forward and reverse uid tables

use super::Uid;
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Backing tables for the dictionary
///
/// Implementations hold a forward table (name to uid), a reverse table (uid
/// to name) and a namespace-wide sequence. Only
/// [`create_forward_if_absent`](UidStore::create_forward_if_absent) needs to
/// be atomic; it is the point where racing creators converge.
#[async_trait]
pub trait UidStore: Send + Sync + 'static {
    /// Fixed width of identifiers held by this store
    fn width(&self) -> usize;

    /// Point lookup in the forward table
    async fn get_id(&self, name: &str) -> Result<Option<Uid>>;

    /// Point lookup in the reverse table
    async fn get_name(&self, id: Uid) -> Result<Option<String>>;

    /// Advance the sequence and return the new value; the first call returns 1
    async fn next_sequence(&self) -> Result<u64>;

    /// Write the reverse mapping
    async fn put_reverse(&self, id: Uid, name: &str) -> Result<()>;

    /// Remove a reverse mapping left behind by a lost creation race
    async fn delete_reverse(&self, id: Uid) -> Result<()>;

    /// Map `name` to `id` unless it is already mapped; returns the uid the
    /// name is mapped to afterwards
    async fn create_forward_if_absent(&self, name: &str, id: Uid) -> Result<Uid>;

    /// Every forward mapping, for warming caches
    async fn load_all(&self) -> Result<Vec<(String, Uid)>>;
}

/// Uid tables held in concurrent maps
#[derive(Debug)]
pub struct MemoryUidStore {
    width: usize,
    sequence: AtomicU64,
    forward: DashMap<String, Uid>,
    reverse: DashMap<Uid, String>,
}

impl MemoryUidStore {
    /// Create an empty store for identifiers of `width` bytes
    pub fn new(width: usize) -> Self {
        Self::with_sequence(width, 0)
    }

    /// Create an empty store whose sequence resumes after `sequence`
    pub fn with_sequence(width: usize, sequence: u64) -> Self {
        Self {
            width,
            sequence: AtomicU64::new(sequence),
            forward: DashMap::new(),
            reverse: DashMap::new(),
        }
    }

    /// Current value of the sequence
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Number of forward mappings
    pub fn forward_len(&self) -> usize {
        self.forward.len()
    }

    /// Number of reverse mappings
    pub fn reverse_len(&self) -> usize {
        self.reverse.len()
    }

    pub(super) fn raise_sequence(&self, at_least: u64) {
        self.sequence.fetch_max(at_least, Ordering::SeqCst);
    }

    pub(super) fn lookup_forward(&self, name: &str) -> Option<Uid> {
        self.forward.get(name).map(|id| *id)
    }

    pub(super) fn insert_forward(&self, name: &str, id: Uid) -> Uid {
        *self.forward.entry(name.to_string()).or_insert(id)
    }

    pub(super) fn insert_reverse(&self, id: Uid, name: &str) {
        self.reverse.insert(id, name.to_string());
    }

    pub(super) fn remove_reverse(&self, id: Uid) {
        self.reverse.remove(&id);
    }
}

#[async_trait]
impl UidStore for MemoryUidStore {
    fn width(&self) -> usize {
        self.width
    }

    async fn get_id(&self, name: &str) -> Result<Option<Uid>> {
        Ok(self.lookup_forward(name))
    }

    async fn get_name(&self, id: Uid) -> Result<Option<String>> {
        Ok(self.reverse.get(&id).map(|name| name.clone()))
    }

    async fn next_sequence(&self) -> Result<u64> {
        Ok(self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn put_reverse(&self, id: Uid, name: &str) -> Result<()> {
        self.insert_reverse(id, name);
        Ok(())
    }

    async fn delete_reverse(&self, id: Uid) -> Result<()> {
        self.remove_reverse(id);
        Ok(())
    }

    async fn create_forward_if_absent(&self, name: &str, id: Uid) -> Result<Uid> {
        Ok(self.insert_forward(name, id))
    }

    async fn load_all(&self) -> Result<Vec<(String, Uid)>> {
        Ok(self
            .forward
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_conditional_create() {
        let store = MemoryUidStore::new(4);
        let first = Uid::new(store.next_sequence().await.unwrap(), 4).unwrap();
        let second = Uid::new(store.next_sequence().await.unwrap(), 4).unwrap();
        assert_eq!(first.value(), 1);
        assert_eq!(second.value(), 2);

        assert_eq!(store.create_forward_if_absent("env", first).await.unwrap(), first);
        assert_eq!(store.create_forward_if_absent("env", second).await.unwrap(), first);
        assert_eq!(store.get_id("env").await.unwrap(), Some(first));
        assert_eq!(store.forward_len(), 1);
    }

    #[tokio::test]
    async fn test_reverse_table() {
        let store = MemoryUidStore::new(2);
        let id = Uid::new(9, 2).unwrap();
        store.put_reverse(id, "system").await.unwrap();
        assert_eq!(store.get_name(id).await.unwrap().as_deref(), Some("system"));

        store.delete_reverse(id).await.unwrap();
        assert_eq!(store.get_name(id).await.unwrap(), None);
    }
}
