//! In-process store with etcd semantics, for tests and single-node runs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::{Store, StoreError, StoreResult, Tree};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    dir: bool,
    expires: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires.map_or(true, |deadline| deadline > now)
    }
}

#[derive(Clone)]
pub struct MemStore {
    entries: Arc<Mutex<BTreeMap<String, Entry>>>,
    changes: broadcast::Sender<String>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> MemStore {
        let (changes, _) = broadcast::channel(64);
        MemStore { entries: Arc::new(Mutex::new(BTreeMap::new())), changes }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, path: &str) {
        let _ = self.changes.send(path.to_string());
    }

    fn exists(entries: &BTreeMap<String, Entry>, path: &str, now: Instant) -> bool {
        entries.get(path).is_some_and(|e| e.live(now))
    }

    /// Ensure the parent directories of `path` exist, as etcd does on set.
    fn ensure_parents(entries: &mut BTreeMap<String, Entry>, path: &str, now: Instant) {
        let mut parent = path;
        while let Some(idx) = parent.rfind('/') {
            parent = &parent[..idx];
            if parent.is_empty() {
                break;
            }
            if !Self::exists(entries, parent, now) {
                entries.insert(
                    parent.to_string(),
                    Entry { value: String::new(), dir: true, expires: None },
                );
            }
        }
    }
}

#[async_trait::async_trait]
impl Store for MemStore {
    async fn mkdir(&self, dir: &str) -> StoreResult<()> {
        let now = Instant::now();
        let mut entries = self.lock();
        if Self::exists(&entries, dir, now) {
            return Err(StoreError::KeyExists);
        }
        Self::ensure_parents(&mut entries, dir, now);
        entries.insert(dir.to_string(), Entry { value: String::new(), dir: true, expires: None });
        drop(entries);
        self.notify(dir);
        Ok(())
    }

    async fn get_tree(&self, dir: &str) -> StoreResult<Tree> {
        let now = Instant::now();
        let entries = self.lock();
        if !Self::exists(&entries, dir, now) {
            return Err(StoreError::NotFound);
        }

        let leaf = dir.rsplit('/').next().unwrap_or(dir);
        let mut root = Tree { key: leaf.to_string(), ..Default::default() };
        let prefix = format!("{dir}/");
        for (path, entry) in entries.range(prefix.clone()..) {
            if !path.starts_with(&prefix) {
                break;
            }
            if !entry.live(now) {
                continue;
            }
            let mut node = &mut root;
            for part in path[prefix.len()..].split('/') {
                node = node
                    .children
                    .entry(part.to_string())
                    .or_insert_with(|| Tree { key: part.to_string(), ..Default::default() });
            }
            if !entry.dir {
                node.value = entry.value.clone();
            }
        }
        Ok(root)
    }

    async fn get(&self, path: &str) -> StoreResult<String> {
        let now = Instant::now();
        let entries = self.lock();
        match entries.get(path) {
            Some(entry) if entry.live(now) => Ok(entry.value.clone()),
            _ => Err(StoreError::NotFound),
        }
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        let mut entries = self.lock();
        let prefix = format!("{path}/");
        let existed = entries.remove(path).is_some();
        entries.retain(|k, _| !k.starts_with(&prefix));
        drop(entries);
        if !existed {
            return Err(StoreError::NotFound);
        }
        self.notify(path);
        Ok(())
    }

    async fn create(&self, path: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let now = Instant::now();
        let mut entries = self.lock();
        if Self::exists(&entries, path, now) {
            return Err(StoreError::KeyExists);
        }
        Self::ensure_parents(&mut entries, path, now);
        entries.insert(
            path.to_string(),
            Entry { value: value.to_string(), dir: false, expires: ttl.map(|t| now + t) },
        );
        drop(entries);
        self.notify(path);
        Ok(())
    }

    async fn update(&self, path: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let now = Instant::now();
        let mut entries = self.lock();
        if !Self::exists(&entries, path, now) {
            return Err(StoreError::NotFound);
        }
        entries.insert(
            path.to_string(),
            Entry { value: value.to_string(), dir: false, expires: ttl.map(|t| now + t) },
        );
        drop(entries);
        self.notify(path);
        Ok(())
    }

    async fn set(&self, path: &str, value: &str) -> StoreResult<()> {
        let now = Instant::now();
        let mut entries = self.lock();
        Self::ensure_parents(&mut entries, path, now);
        entries.insert(
            path.to_string(),
            Entry { value: value.to_string(), dir: false, expires: None },
        );
        drop(entries);
        self.notify(path);
        Ok(())
    }

    fn watch(&self, prefix: &str, rate_limit: Duration) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        let mut changes = self.changes.subscribe();
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            // Startup tick.
            if tx.send(()).await.is_err() {
                return;
            }
            loop {
                match changes.recv().await {
                    Ok(path) if path.starts_with(&prefix) => {
                        if tx.try_send(()).is_err() && tx.is_closed() {
                            return;
                        }
                        tokio::time::sleep(rate_limit).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if tx.try_send(()).is_err() && tx.is_closed() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        rx
    }
}
