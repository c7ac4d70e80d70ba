//! The consensus store and everything replicated through it.
//!
//! Masters run an etcd quorum (booted by the supervisor); this crate wraps
//! it behind the small [`Store`] trait, runs the leader election over it,
//! and keeps the container/label directories — the authoritative record of
//! container IPs and label membership — in sync with the local database.
//!
//! [`MemStore`] implements the same semantics in process for tests.

pub mod directory;
pub mod elector;
mod etcd;
pub mod ipdef;
mod mem;

pub use etcd::EtcdStore;
pub use mem::MemStore;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key already exists")]
    KeyExists,

    #[error("key not found")]
    NotFound,

    #[error("consensus store unavailable: {0}")]
    Unavailable(String),

    #[error("consensus store error: {0}")]
    Api(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A node of the hierarchical keyspace, with its subtree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    pub key: String,
    pub value: String,
    pub children: BTreeMap<String, Tree>,
}

/// Hierarchical key-value store with TTLs and watches (etcd semantics).
#[async_trait]
pub trait Store: Send + Sync {
    /// Create an empty directory; fails with [`StoreError::KeyExists`] if
    /// the path is taken.
    async fn mkdir(&self, dir: &str) -> StoreResult<()>;

    /// The subtree rooted at `dir`.
    async fn get_tree(&self, dir: &str) -> StoreResult<Tree>;

    /// The value at `path`.
    async fn get(&self, path: &str) -> StoreResult<String>;

    /// Delete `path` (recursively for directories).
    async fn delete(&self, path: &str) -> StoreResult<()>;

    /// Set `path` only if it does not exist yet.
    async fn create(&self, path: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Set `path` only if it already exists (refreshing any TTL).
    async fn update(&self, path: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Set `path` unconditionally.
    async fn set(&self, path: &str, value: &str) -> StoreResult<()>;

    /// A channel that ticks once at startup and then once per change under
    /// `prefix`, never more often than `rate_limit`.
    fn watch(&self, prefix: &str, rate_limit: Duration) -> mpsc::Receiver<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Trait-level semantics are exercised against MemStore in mem.rs; this
    // module only checks the Tree helper shape used by both backends.
    #[test]
    fn tree_children_are_ordered() {
        let mut tree = Tree { key: "root".to_string(), ..Default::default() };
        tree.children.insert("b".to_string(), Tree::default());
        tree.children.insert("a".to_string(), Tree::default());
        let keys: Vec<&String> = tree.children.keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
