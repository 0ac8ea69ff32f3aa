//! Durable keyed storage of content items.
//!
//! The store holds no business logic beyond the lifecycle table: every
//! write goes through [`ItemStore::compare_and_swap`], which checks the
//! caller's version, validates the state edge, and bumps the version.
//! Dispatchers claim work with it instead of taking locks.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info, trace};

use crate::{ContentItem, ItemEvent, ItemId, ItemState, StoreError};

/// Capacity of the state-change broadcast channel.
const EVENT_CHANNEL_SIZE: usize = 1024;

/// In-place edit applied by a compare-and-swap.
pub type Mutator<'a> = Box<dyn FnOnce(&mut ContentItem) + Send + 'a>;

/// Storage contract shared by all dispatchers.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Insert a new item. Ids are never reused.
    async fn put(&self, item: ContentItem) -> Result<(), StoreError>;

    /// Snapshot of one item.
    async fn get(&self, id: &ItemId) -> Result<ContentItem, StoreError>;

    /// Apply `mutator` if the stored version still equals `expected_version`.
    ///
    /// Returns the written item with its new version.
    async fn compare_and_swap(
        &self,
        id: &ItemId,
        expected_version: u64,
        mutator: Mutator<'_>,
    ) -> Result<ContentItem, StoreError>;

    /// Ids of scheduled items whose time has come, earliest first.
    async fn query_due_for_publish(&self, now: DateTime<Utc>) -> Result<Vec<ItemId>, StoreError>;

    /// Snapshots ordered by creation, optionally restricted to one state.
    async fn list(&self, state: Option<ItemState>) -> Result<Vec<ContentItem>, StoreError>;

    /// Receive every state change made through this store.
    fn subscribe(&self) -> broadcast::Receiver<ItemEvent>;
}

/// In-memory store.
///
/// Each compare-and-swap holds only the entry lock of the item it writes.
pub struct MemoryStore {
    items: DashMap<ItemId, ContentItem>,
    events: broadcast::Sender<ItemEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            items: DashMap::new(),
            events,
        }
    }

    /// Number of items held.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn insert(&self, item: ContentItem) -> Result<(), StoreError> {
        match self.items.entry(item.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(item.id)),
            Entry::Vacant(slot) => {
                trace!(id = %item.id, state = %item.state, "inserted item");
                slot.insert(item);
                Ok(())
            }
        }
    }

    fn fetch(&self, id: &ItemId) -> Result<ContentItem, StoreError> {
        self.items
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn swap(
        &self,
        id: &ItemId,
        expected_version: u64,
        mutator: Mutator<'_>,
    ) -> Result<ContentItem, StoreError> {
        let mut entry = self
            .items
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let current = entry.value();
        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: id.clone(),
                expected: expected_version,
                actual: current.version,
            });
        }

        let mut next = current.clone();
        mutator(&mut next);

        let from = current.state;
        let to = next.state;
        // Terminal items refuse every write except the retry edge
        if (from != to || from.is_terminal()) && !from.can_transition_to(to) {
            return Err(StoreError::IllegalTransition {
                id: id.clone(),
                from,
                to,
            });
        }

        next.id = current.id.clone();
        next.created_at = current.created_at;
        next.version = expected_version + 1;
        next.updated_at = Utc::now();

        *entry.value_mut() = next.clone();

        if from != to {
            debug!(id = %id, %from, %to, version = next.version, "item transitioned");
            // Sent under the entry lock so events for one item stay ordered
            let _ = self.events.send(ItemEvent {
                id: id.clone(),
                from,
                to,
                version: next.version,
            });
        }

        Ok(next)
    }

    fn due(&self, now: DateTime<Utc>) -> Vec<ItemId> {
        let mut due: Vec<(DateTime<Utc>, ItemId)> = self
            .items
            .iter()
            .filter(|entry| entry.is_due(now))
            .filter_map(|entry| entry.scheduled_at.map(|at| (at, entry.id.clone())))
            .collect();
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    fn snapshot(&self, state: Option<ItemState>) -> Vec<ContentItem> {
        let mut items: Vec<ContentItem> = self
            .items
            .iter()
            .filter(|entry| state.is_none_or(|s| entry.state == s))
            .map(|entry| entry.value().clone())
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        items
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn put(&self, item: ContentItem) -> Result<(), StoreError> {
        self.insert(item)
    }

    async fn get(&self, id: &ItemId) -> Result<ContentItem, StoreError> {
        self.fetch(id)
    }

    async fn compare_and_swap(
        &self,
        id: &ItemId,
        expected_version: u64,
        mutator: Mutator<'_>,
    ) -> Result<ContentItem, StoreError> {
        self.swap(id, expected_version, mutator)
    }

    async fn query_due_for_publish(&self, now: DateTime<Utc>) -> Result<Vec<ItemId>, StoreError> {
        Ok(self.due(now))
    }

    async fn list(&self, state: Option<ItemState>) -> Result<Vec<ContentItem>, StoreError> {
        Ok(self.snapshot(state))
    }

    fn subscribe(&self) -> broadcast::Receiver<ItemEvent> {
        self.events.subscribe()
    }
}

/// On-disk format of [`JsonFileStore`].
#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    items: Vec<ContentItem>,
}

/// Memory store mirrored to a JSON file.
///
/// The whole snapshot is rewritten after every write (temp file, then
/// rename). Each write persists the latest state of every item, so a
/// failed write is repaired by the next successful one.
pub struct JsonFileStore {
    path: PathBuf,
    inner: MemoryStore,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open the store at `path`, restoring any items already saved there.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let inner = MemoryStore::new();

        if fs::try_exists(&path).await? {
            let content = fs::read_to_string(&path).await?;
            let file: StoreFile = serde_json::from_str(&content)?;
            for item in file.items {
                inner.insert(item)?;
            }
            info!(path = %path.display(), count = inner.len(), "loaded items from disk");
        }

        Ok(Self {
            path,
            inner,
            write_lock: Mutex::new(()),
        })
    }

    /// Location of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let file = StoreFile {
            version: 1,
            items: self.inner.snapshot(None),
        };
        let content = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }

        // Write to temp file first, then rename for atomicity
        let temp_path = self.path.with_extension("json.tmp");
        let mut out = fs::File::create(&temp_path).await?;
        out.write_all(content.as_bytes()).await?;
        out.sync_all().await?;
        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            error!(path = %self.path.display(), error = %e, "failed to persist item store");
        }
    }
}

#[async_trait]
impl ItemStore for JsonFileStore {
    async fn put(&self, item: ContentItem) -> Result<(), StoreError> {
        self.inner.insert(item)?;
        self.persist().await
    }

    async fn get(&self, id: &ItemId) -> Result<ContentItem, StoreError> {
        self.inner.fetch(id)
    }

    async fn compare_and_swap(
        &self,
        id: &ItemId,
        expected_version: u64,
        mutator: Mutator<'_>,
    ) -> Result<ContentItem, StoreError> {
        let item = self.inner.swap(id, expected_version, mutator)?;
        // The swap already happened; reporting a disk error here would make
        // the caller believe its claim failed
        self.persist_logged().await;
        Ok(item)
    }

    async fn query_due_for_publish(&self, now: DateTime<Utc>) -> Result<Vec<ItemId>, StoreError> {
        Ok(self.inner.due(now))
    }

    async fn list(&self, state: Option<ItemState>) -> Result<Vec<ContentItem>, StoreError> {
        Ok(self.inner.snapshot(state))
    }

    fn subscribe(&self) -> broadcast::Receiver<ItemEvent> {
        self.inner.subscribe()
    }
}
