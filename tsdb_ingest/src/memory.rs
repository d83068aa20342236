//! In-memory implementations of the collaborator traits, for embedding the
//! pipeline without external services and for tests.
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, watch};
use tsdb_types::{MetaType, MetadataDocument};

use crate::{
    index::{IndexError, KeysetCatalog, MetadataIndex},
    persister::{PersistError, RowPersister},
};

/// A fixed, mutable set of keysets.
#[derive(Debug, Default)]
pub struct MemKeysetCatalog {
    keysets: RwLock<HashSet<String>>,
}

impl MemKeysetCatalog {
    pub fn new<I, S>(keysets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keysets: RwLock::new(keysets.into_iter().map(Into::into).collect()),
        }
    }

    pub fn create(&self, keyset: impl Into<String>) {
        self.keysets.write().insert(keyset.into());
    }
}

#[async_trait]
impl KeysetCatalog for MemKeysetCatalog {
    async fn keyset_exists(&self, keyset: &str) -> bool {
        self.keysets.read().contains(keyset)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub keyspace: String,
    pub id: String,
    pub timestamp: i64,
    pub value: StoredValue,
}

/// Row store keeping every written row in insertion order.
///
/// Writes can be held at a gate to simulate a slow store, and keyspaces can be
/// marked as failing.
#[derive(Debug)]
pub struct MemRowStore {
    rows: Mutex<Vec<StoredRow>>,
    failing_keyspaces: Mutex<HashSet<String>>,
    gate: watch::Sender<bool>,
    blocked: AtomicUsize,
    blocked_changed: Notify,
}

impl Default for MemRowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemRowStore {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            rows: Default::default(),
            failing_keyspaces: Default::default(),
            gate,
            blocked: AtomicUsize::new(0),
            blocked_changed: Notify::new(),
        }
    }

    pub fn rows(&self) -> Vec<StoredRow> {
        self.rows.lock().clone()
    }

    /// Every write to `keyspace` fails from now on.
    pub fn fail_keyspace(&self, keyspace: impl Into<String>) {
        self.failing_keyspaces.lock().insert(keyspace.into());
    }

    /// Block writes until [`release_writes`](Self::release_writes).
    pub fn hold_writes(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_writes(&self) {
        self.gate.send_replace(true);
    }

    /// Wait until at least `n` writes are waiting at the gate.
    pub async fn wait_for_blocked_writes(&self, n: usize) {
        loop {
            let changed = self.blocked_changed.notified();
            if self.blocked.load(Ordering::SeqCst) >= n {
                return;
            }
            changed.await;
        }
    }

    async fn write(
        &self,
        keyspace: &str,
        id: &str,
        timestamp: i64,
        value: StoredValue,
    ) -> Result<(), PersistError> {
        let mut gate = self.gate.subscribe();
        let open = *gate.borrow_and_update();
        if !open {
            self.blocked.fetch_add(1, Ordering::SeqCst);
            self.blocked_changed.notify_waiters();
            // The sender lives as long as `self`.
            let _ = gate.wait_for(|open| *open).await;
            self.blocked.fetch_sub(1, Ordering::SeqCst);
        }

        if self.failing_keyspaces.lock().contains(keyspace) {
            return Err(PersistError::storage(
                keyspace,
                format!("keyspace {keyspace} is unavailable"),
            ));
        }

        self.rows.lock().push(StoredRow {
            keyspace: keyspace.to_string(),
            id: id.to_string(),
            timestamp,
            value,
        });
        Ok(())
    }
}

#[async_trait]
impl RowPersister for MemRowStore {
    async fn insert_number(
        &self,
        keyspace: &str,
        id: &str,
        timestamp: i64,
        value: f64,
    ) -> Result<(), PersistError> {
        self.write(keyspace, id, timestamp, StoredValue::Number(value))
            .await
    }

    async fn insert_text(
        &self,
        keyspace: &str,
        id: &str,
        timestamp: i64,
        text: &str,
    ) -> Result<(), PersistError> {
        self.write(keyspace, id, timestamp, StoredValue::Text(text.to_string()))
            .await
    }
}

/// Search index keeping one document per keyset and series id.
///
/// Like [`MemRowStore`], bulk saves can be held at a gate.
#[derive(Debug)]
pub struct MemMetaIndex {
    documents: Mutex<BTreeMap<String, HashMap<String, MetadataDocument>>>,
    bulks: Mutex<Vec<(String, Vec<MetadataDocument>)>>,
    failing_keysets: HashSet<String>,
    failing_checks: bool,
    check_delay: Option<Duration>,
    save_delay: Option<Duration>,
    checks: AtomicUsize,
    completed_bulks: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    bulk_done: Notify,
    gate: watch::Sender<bool>,
    blocked: AtomicUsize,
    blocked_changed: Notify,
}

impl Default for MemMetaIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl MemMetaIndex {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            documents: Default::default(),
            bulks: Default::default(),
            failing_keysets: Default::default(),
            failing_checks: false,
            check_delay: None,
            save_delay: None,
            checks: AtomicUsize::new(0),
            completed_bulks: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            bulk_done: Notify::new(),
            gate,
            blocked: AtomicUsize::new(0),
            blocked_changed: Notify::new(),
        }
    }

    /// Every `add_documents` call sleeps for `delay` first.
    pub fn with_save_delay(mut self, delay: Duration) -> Self {
        self.save_delay = Some(delay);
        self
    }

    /// Every `check_metadata` call sleeps for `delay` first.
    pub fn with_check_delay(mut self, delay: Duration) -> Self {
        self.check_delay = Some(delay);
        self
    }

    /// `add_documents` for `keyset` is rejected.
    pub fn with_failing_keyset(mut self, keyset: impl Into<String>) -> Self {
        self.failing_keysets.insert(keyset.into());
        self
    }

    /// Every `check_metadata` call fails.
    pub fn with_failing_checks(mut self) -> Self {
        self.failing_checks = true;
        self
    }

    /// Successful `add_documents` calls, in completion order.
    pub fn bulks(&self) -> Vec<(String, Vec<MetadataDocument>)> {
        self.bulks.lock().clone()
    }

    pub fn bulk_count(&self) -> usize {
        self.bulks.lock().len()
    }

    pub fn documents(&self, keyset: &str) -> Vec<MetadataDocument> {
        let mut documents: Vec<_> = self
            .documents
            .lock()
            .get(keyset)
            .map(|d| d.values().cloned().collect())
            .unwrap_or_default();
        documents.sort_unstable_by(|a, b| a.id.cmp(&b.id));
        documents
    }

    pub fn indexed_count(&self, keyset: &str) -> usize {
        self.documents.lock().get(keyset).map_or(0, HashMap::len)
    }

    /// Number of `check_metadata` calls.
    pub fn check_count(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    /// The largest number of `add_documents` calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Block `add_documents` until [`release_saves`](Self::release_saves).
    pub fn hold_saves(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_saves(&self) {
        self.gate.send_replace(true);
    }

    /// Wait until at least `n` saves are waiting at the gate.
    pub async fn wait_for_blocked_saves(&self, n: usize) {
        loop {
            let changed = self.blocked_changed.notified();
            if self.blocked.load(Ordering::SeqCst) >= n {
                return;
            }
            changed.await;
        }
    }

    /// Wait until `n` `add_documents` calls finished, successful or not.
    pub async fn wait_for_bulks(&self, n: usize) {
        loop {
            let done = self.bulk_done.notified();
            if self.completed_bulks.load(Ordering::SeqCst) >= n {
                return;
            }
            done.await;
        }
    }
}

#[async_trait]
impl MetadataIndex for MemMetaIndex {
    async fn check_metadata(
        &self,
        keyset: &str,
        meta_type: MetaType,
        id: &str,
    ) -> Result<bool, IndexError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.check_delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_checks {
            return Err(IndexError::request("search index unavailable"));
        }
        Ok(self
            .documents
            .lock()
            .get(keyset)
            .and_then(|d| d.get(id))
            .is_some_and(|doc| doc.meta_type == meta_type))
    }

    async fn add_documents(
        &self,
        keyset: &str,
        documents: Vec<MetadataDocument>,
    ) -> Result<(), IndexError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let mut gate = self.gate.subscribe();
        let open = *gate.borrow_and_update();
        if !open {
            self.blocked.fetch_add(1, Ordering::SeqCst);
            self.blocked_changed.notify_waiters();
            let _ = gate.wait_for(|open| *open).await;
            self.blocked.fetch_sub(1, Ordering::SeqCst);
        }

        if let Some(delay) = self.save_delay {
            tokio::time::sleep(delay).await;
        }

        let result = if self.failing_keysets.contains(keyset) {
            Err(IndexError::Rejected {
                rejected: documents.len(),
                total: documents.len(),
            })
        } else {
            let mut all = self.documents.lock();
            let indexed = all.entry(keyset.to_string()).or_default();
            for doc in &documents {
                indexed.insert(doc.id.clone(), doc.clone());
            }
            self.bulks.lock().push((keyset.to_string(), documents));
            Ok(())
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed_bulks.fetch_add(1, Ordering::SeqCst);
        self.bulk_done.notify_waiters();
        result
    }
}
