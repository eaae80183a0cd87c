//! In-memory mirror of remote metadata with on-disk directory snapshots.
//!
//! Entries live in a concurrent map keyed by id. Parent/child membership lives
//! in a separate directory index whose every mutation happens under one write
//! lock, so a reader sees an entry under its old parent or its new parent,
//! never both. Reconciliation against the remote change feed is serialized
//! behind an async mutex; readers only wait on it when they need a refresh.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use drive_core::{AccountCursor, ChangeList, DriveError, DriveItem, RemoteDrive};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, warn};

use super::error::{ErrorClass, classify_drive_error};
use super::snapshot::{PersistedCursor, SnapshotError, SnapshotStore};

/// Alias the remote accepts for the account's root folder.
pub const ROOT_ALIAS: &str = "root";
pub const DEFAULT_SYNC_COOLDOWN: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    /// Known, but a directory whose children have not been loaded.
    Pending,
    Cached,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub mime_type: String,
    pub size: Option<u64>,
    /// Remote modification time, unix seconds.
    pub modified: Option<i64>,
    pub md5: Option<String>,
    pub trashed: bool,
    pub download_url: Option<String>,
    pub status: EntryStatus,
}

impl CacheEntry {
    pub fn from_item(item: &DriveItem, status: EntryStatus) -> Self {
        Self {
            id: item.id.clone(),
            parent_id: item.parent_id().map(str::to_string),
            title: item.title.clone(),
            mime_type: item.mime_type.clone(),
            size: item.file_size,
            modified: item.modified_unix(),
            md5: item.md5_checksum.clone(),
            trashed: item.is_trashed(),
            download_url: item.download_url.clone(),
            status,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.mime_type == drive_core::FOLDER_MIME_TYPE
    }

    /// Rebuilds the remote view of this entry, for handing back to the remote.
    pub fn to_item(&self) -> DriveItem {
        DriveItem {
            id: self.id.clone(),
            title: self.title.clone(),
            mime_type: self.mime_type.clone(),
            file_size: self.size,
            modified_date: self
                .modified
                .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
                .and_then(|at| at.format(&Rfc3339).ok()),
            md5_checksum: self.md5.clone(),
            labels: drive_core::Labels {
                trashed: self.trashed,
            },
            download_url: self.download_url.clone(),
            parents: self
                .parent_id
                .iter()
                .map(|id| drive_core::ParentRef { id: id.clone() })
                .collect(),
        }
    }

    /// True when a local file of `size` bytes last written at `modified`
    /// carries no edits beyond what the remote already has.
    pub fn matches_local(&self, size: u64, modified: i64) -> bool {
        let size_matches = self.size.is_none_or(|remote| remote == size);
        let not_newer = self.modified.is_none_or(|remote| modified <= remote);
        size_matches && not_newer
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unknown,
    NeedsFullResync,
    NeedsIncrementalSync,
    Synced,
}

/// Compares the persisted cursor to the live remote one.
pub fn classify_sync_state(persisted: &PersistedCursor, remote: &AccountCursor) -> SyncState {
    match (&persisted.root_id, persisted.sequence) {
        (Some(root_id), Some(sequence)) if *root_id == remote.root_id => {
            if sequence < remote.sequence {
                SyncState::NeedsIncrementalSync
            } else {
                SyncState::Synced
            }
        }
        _ => SyncState::NeedsFullResync,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataView {
    pub entry: CacheEntry,
    pub children: Option<Vec<CacheEntry>>,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("item no longer exists: {0}")]
    NotFound(String),
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(#[source] DriveError),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

impl CacheError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CacheError::NotFound(_) => ErrorClass::NotFound,
            CacheError::RemoteUnavailable(_) => ErrorClass::RemoteUnavailable,
            CacheError::Snapshot(SnapshotError::Corrupt { .. }) => ErrorClass::CorruptCacheRecord,
            CacheError::Snapshot(_) => ErrorClass::Local,
        }
    }

    fn from_remote(id: &str, err: DriveError) -> Self {
        match classify_drive_error(&err) {
            ErrorClass::NotFound => CacheError::NotFound(id.to_string()),
            _ => CacheError::RemoteUnavailable(err),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Minimum spacing between remote reconciliation passes.
    pub sync_cooldown: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sync_cooldown: DEFAULT_SYNC_COOLDOWN,
        }
    }
}

#[derive(Debug)]
struct ReconcileState {
    state: SyncState,
    cursor: PersistedCursor,
    cursor_loaded: bool,
    /// Every persisted directory has been loaded into memory.
    hydrated: bool,
    last_pass: Option<Instant>,
}

pub struct MetadataCache {
    remote: Arc<dyn RemoteDrive>,
    store: SnapshotStore,
    config: CacheConfig,
    entries: DashMap<String, CacheEntry>,
    index: RwLock<HashMap<String, BTreeSet<String>>>,
    dirty: Mutex<BTreeSet<String>>,
    root_id: RwLock<Option<String>>,
    reconcile: tokio::sync::Mutex<ReconcileState>,
    cooldown_invalidated: AtomicBool,
}

impl MetadataCache {
    pub fn new(remote: Arc<dyn RemoteDrive>, store: SnapshotStore, config: CacheConfig) -> Self {
        Self {
            remote,
            store,
            config,
            entries: DashMap::new(),
            index: RwLock::new(HashMap::new()),
            dirty: Mutex::new(BTreeSet::new()),
            root_id: RwLock::new(None),
            reconcile: tokio::sync::Mutex::new(ReconcileState {
                state: SyncState::Unknown,
                cursor: PersistedCursor::default(),
                cursor_loaded: false,
                hydrated: false,
                last_pass: None,
            }),
            cooldown_invalidated: AtomicBool::new(false),
        }
    }

    /// Mirror-only lookup; never talks to the remote.
    pub fn peek(&self, id: &str) -> Option<CacheEntry> {
        let id = self.resolve_alias(id);
        self.entries.get(&id).map(|entry| entry.clone())
    }

    pub fn children_of(&self, id: &str) -> Vec<CacheEntry> {
        let id = self.resolve_alias(id);
        let index = self.index.read();
        index
            .get(&id)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter_map(|child| self.entries.get(child).map(|entry| entry.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn sync_state(&self) -> SyncState {
        self.reconcile.lock().await.state
    }

    pub fn invalidate_sync_cooldown(&self) {
        self.cooldown_invalidated.store(true, Ordering::SeqCst);
    }

    pub async fn get_metadata(
        &self,
        id: &str,
        include_children: bool,
        force_refresh: bool,
    ) -> Result<MetadataView, CacheError> {
        let mut resolved = self.resolve_alias(id);
        if force_refresh || self.needs_refresh(&resolved, include_children) {
            if let Err(err) = self.reconcile().await {
                debug!(id, error = %err, "serving from mirror after failed reconciliation");
            }
            resolved = self.resolve_alias(id);
            if force_refresh || self.needs_refresh(&resolved, include_children) {
                let loaded = !force_refresh && self.load_snapshot(&resolved).await;
                if !loaded || self.needs_refresh(&resolved, include_children) {
                    resolved = self.fetch_and_seed(&resolved, include_children).await?;
                }
            }
        }
        self.view(&resolved, include_children)
            .ok_or_else(|| CacheError::NotFound(id.to_string()))
    }

    /// Installs remote data the caller already holds. With `children`, the
    /// directory listing replaces whatever the mirror had for `item`.
    pub async fn seed(
        &self,
        item: &DriveItem,
        children: Option<&[DriveItem]>,
    ) -> Result<(), CacheError> {
        self.seed_in_memory(item, children);
        self.flush_dirty().await;
        Ok(())
    }

    /// Drops `id` (and anything filed under it) from the mirror and from disk.
    pub async fn evict(&self, id: &str) -> Result<(), CacheError> {
        let id = self.resolve_alias(id);
        for removed in self.evict_in_memory(&id) {
            self.store.remove(&removed).await?;
        }
        self.flush_dirty().await;
        Ok(())
    }

    /// Clears memory, snapshots and cursor; the next access starts cold.
    pub async fn reset(&self) -> Result<(), CacheError> {
        let mut guard = self.reconcile.lock().await;
        self.clear_in_memory();
        self.store.clear().await?;
        *guard = ReconcileState {
            state: SyncState::Unknown,
            cursor: PersistedCursor::default(),
            cursor_loaded: true,
            hydrated: true,
            last_pass: None,
        };
        *self.root_id.write() = None;
        Ok(())
    }

    /// One reconciliation pass. At most one runs at a time; failures leave
    /// the cursor untouched so the next access retries.
    pub async fn reconcile(&self) -> Result<SyncState, CacheError> {
        let mut guard = self.reconcile.lock().await;
        if !guard.cursor_loaded {
            guard.cursor = self.store.read_cursor().await;
            guard.cursor_loaded = true;
            if let Some(root_id) = guard.cursor.root_id.clone() {
                *self.root_id.write() = Some(root_id);
            }
        }

        let invalidated = self.cooldown_invalidated.swap(false, Ordering::SeqCst);
        let cooling = !invalidated
            && guard
                .last_pass
                .is_some_and(|at| at.elapsed() < self.config.sync_cooldown);
        if guard.state != SyncState::Unknown && cooling {
            return Ok(SyncState::Synced);
        }

        let remote = self.remote.fetch_account_cursor().await.map_err(|err| {
            warn!(error = %err, "failed to read remote change cursor");
            CacheError::RemoteUnavailable(err)
        })?;
        let state = classify_sync_state(&guard.cursor, &remote);
        debug!(?state, remote_sequence = remote.sequence, "reconciliation state");
        guard.state = state;

        match state {
            SyncState::NeedsFullResync => {
                info!(root_id = %remote.root_id, "full resync: clearing metadata cache");
                self.clear_in_memory();
                self.store.clear().await?;
                self.store
                    .write_cursor(&remote.root_id, remote.sequence)
                    .await?;
                guard.cursor = PersistedCursor {
                    root_id: Some(remote.root_id.clone()),
                    sequence: Some(remote.sequence),
                };
                *self.root_id.write() = Some(remote.root_id);
                guard.hydrated = true;
            }
            SyncState::NeedsIncrementalSync => {
                if !guard.hydrated {
                    self.hydrate_from_snapshots().await?;
                    guard.hydrated = true;
                }
                let since = guard.cursor.sequence.unwrap_or_default();
                let changes = self.remote.list_changes(since).await.map_err(|err| {
                    warn!(since, error = %err, "failed to pull change feed");
                    CacheError::RemoteUnavailable(err)
                })?;
                let new_sequence = changes.new_sequence.max(since);
                let applied = self.apply_changes(changes).await;
                self.flush_dirty().await;
                self.store.write_cursor(&remote.root_id, new_sequence).await?;
                guard.cursor.sequence = Some(new_sequence);
                info!(since, new_sequence, applied, "incremental sync applied");
            }
            SyncState::Synced | SyncState::Unknown => {}
        }

        guard.state = SyncState::Synced;
        guard.last_pass = Some(Instant::now());
        Ok(SyncState::Synced)
    }

    /// Loads every persisted directory the memory mirror lacks, so changes
    /// land on what the snapshots claim before the cursor moves past them.
    async fn hydrate_from_snapshots(&self) -> Result<(), CacheError> {
        let mut loaded = 0;
        for id in self.store.list_directories().await? {
            let in_memory = self
                .entries
                .get(&id)
                .is_some_and(|entry| entry.status == EntryStatus::Cached);
            if !in_memory && self.load_snapshot(&id).await {
                loaded += 1;
            }
        }
        debug!(loaded, "mirror hydrated from snapshots");
        Ok(())
    }

    async fn apply_changes(&self, changes: ChangeList) -> usize {
        let mut applied = 0;
        for change in changes.changes {
            if change.is_removal() {
                if self.is_known(&change.file_id) {
                    for removed in self.evict_in_memory(&change.file_id) {
                        if let Err(err) = self.store.remove(&removed).await {
                            warn!(id = %removed, error = %err, "failed to delete snapshot");
                        }
                    }
                    applied += 1;
                }
                continue;
            }
            let Some(item) = change.file else {
                continue;
            };
            let parent_known = item
                .parent_id()
                .is_some_and(|parent| self.entries.contains_key(parent));
            if parent_known {
                let status = self.status_for_upsert(&item);
                self.upsert_in_memory(CacheEntry::from_item(&item, status));
                applied += 1;
            } else if self.is_known(&item.id) {
                // Moved somewhere the mirror does not cover.
                for removed in self.evict_in_memory(&item.id) {
                    if let Err(err) = self.store.remove(&removed).await {
                        warn!(id = %removed, error = %err, "failed to delete snapshot");
                    }
                }
                applied += 1;
            }
        }
        applied
    }

    /// Writes every dirty directory snapshot; directories that are gone or
    /// not fully loaded lose their snapshot instead.
    pub async fn flush_dirty(&self) {
        let dirty = std::mem::take(&mut *self.dirty.lock());
        for id in dirty {
            let entry = self.entries.get(&id).map(|entry| entry.clone());
            let result = match entry {
                Some(entry) if entry.is_folder() && entry.status == EntryStatus::Cached => {
                    let children = self.children_of(&id);
                    self.store.write_directory(&entry, &children).await
                }
                Some(_) => Ok(()),
                None => self.store.remove(&id).await,
            };
            if let Err(err) = result {
                warn!(id = %id, error = %err, "failed to persist directory snapshot");
            }
        }
    }

    fn needs_refresh(&self, id: &str, include_children: bool) -> bool {
        match self.entries.get(id) {
            None => true,
            Some(entry) => {
                entry.status == EntryStatus::Pending && (include_children || !entry.is_folder())
            }
        }
    }

    fn view(&self, id: &str, include_children: bool) -> Option<MetadataView> {
        let entry = self.entries.get(id).map(|entry| entry.clone())?;
        let children = (include_children && entry.is_folder()).then(|| self.children_of(id));
        Some(MetadataView { entry, children })
    }

    async fn load_snapshot(&self, id: &str) -> bool {
        match self.store.read_directory(id).await {
            Ok(Some((mut entry, children))) => {
                entry.status = EntryStatus::Cached;
                let mut index = self.index.write();
                self.file_entry(&mut index, entry);
                for mut child in children {
                    if let Some(existing) = self.entries.get(&child.id) {
                        child.status = existing.status;
                    } else if child.is_folder() {
                        child.status = EntryStatus::Pending;
                    }
                    child.parent_id = Some(id.to_string());
                    self.file_entry(&mut index, child);
                }
                debug!(id, "directory loaded from snapshot");
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(id, error = %err, "discarded directory snapshot");
                false
            }
        }
    }

    async fn fetch_and_seed(
        &self,
        id: &str,
        include_children: bool,
    ) -> Result<String, CacheError> {
        let item = match self.remote.fetch_item(id).await {
            Ok(item) => item,
            Err(err) => {
                let err = CacheError::from_remote(id, err);
                if err.class() == ErrorClass::NotFound {
                    self.evict(id).await?;
                }
                return Err(err);
            }
        };
        if item.is_trashed() {
            self.evict(&item.id).await?;
            return Err(CacheError::NotFound(id.to_string()));
        }
        let children = if include_children && item.is_folder() {
            Some(
                self.remote
                    .list_children(&item.id)
                    .await
                    .map_err(|err| CacheError::from_remote(id, err))?,
            )
        } else {
            None
        };
        self.seed(&item, children.as_deref()).await?;
        Ok(item.id)
    }

    fn seed_in_memory(&self, item: &DriveItem, children: Option<&[DriveItem]>) {
        if item.is_trashed() {
            self.evict_in_memory(&item.id);
            return;
        }
        let status = if children.is_some() {
            EntryStatus::Cached
        } else {
            self.status_for_upsert(item)
        };
        self.upsert_in_memory(CacheEntry::from_item(item, status));

        let Some(children) = children else {
            return;
        };
        let listed: BTreeSet<String> = children
            .iter()
            .filter(|child| !child.is_trashed())
            .map(|child| child.id.clone())
            .collect();
        let stale: Vec<String> = self
            .index
            .read()
            .get(&item.id)
            .map(|bucket| bucket.difference(&listed).cloned().collect())
            .unwrap_or_default();
        for id in stale {
            self.evict_in_memory(&id);
        }
        for child in children.iter().filter(|child| !child.is_trashed()) {
            let status = self.status_for_upsert(child);
            let mut entry = CacheEntry::from_item(child, status);
            entry.parent_id = Some(item.id.clone());
            self.upsert_in_memory(entry);
        }
        self.mark_dirty(&item.id);
    }

    /// Files are complete as soon as they are seen; directories keep whatever
    /// child state the mirror already has.
    fn status_for_upsert(&self, item: &DriveItem) -> EntryStatus {
        if !item.is_folder() {
            return EntryStatus::Cached;
        }
        self.entries
            .get(&item.id)
            .map(|entry| entry.status)
            .unwrap_or(EntryStatus::Pending)
    }

    fn upsert_in_memory(&self, entry: CacheEntry) {
        let id = entry.id.clone();
        let parent = entry.parent_id.clone();
        let is_cached_folder = entry.is_folder() && entry.status == EntryStatus::Cached;
        let previous_parent = {
            let mut index = self.index.write();
            self.file_entry(&mut index, entry)
        };

        if let Some(old) = previous_parent.filter(|old| Some(old) != parent.as_ref()) {
            self.mark_dirty(&old);
        }
        if let Some(parent) = parent {
            self.mark_dirty(&parent);
        }
        if is_cached_folder {
            self.mark_dirty(&id);
        }
    }

    /// Files `entry` under its current parent, moving it out of the previous
    /// parent's bucket. Caller holds the index write lock for the whole move.
    fn file_entry(
        &self,
        index: &mut HashMap<String, BTreeSet<String>>,
        entry: CacheEntry,
    ) -> Option<String> {
        let previous_parent = self
            .entries
            .get(&entry.id)
            .and_then(|existing| existing.parent_id.clone());
        let id = entry.id.clone();
        let parent = entry.parent_id.clone();
        self.entries.insert(id.clone(), entry);
        if previous_parent != parent
            && let Some(old) = &previous_parent
        {
            remove_from_bucket(index, old, &id);
        }
        if let Some(parent) = parent {
            index.entry(parent).or_default().insert(id);
        }
        previous_parent
    }

    /// Returns every id removed, so callers can drop their snapshots.
    fn evict_in_memory(&self, id: &str) -> Vec<String> {
        let mut removed = Vec::new();
        let mut parent = None;
        {
            let mut index = self.index.write();
            let mut pending = vec![id.to_string()];
            while let Some(next) = pending.pop() {
                if let Some((_, entry)) = self.entries.remove(&next) {
                    if next == id {
                        parent = entry.parent_id.clone();
                    }
                    if let Some(entry_parent) = &entry.parent_id {
                        remove_from_bucket(&mut index, entry_parent, &next);
                    }
                }
                if let Some(bucket) = index.remove(&next) {
                    pending.extend(bucket);
                }
                removed.push(next);
            }
        }
        if let Some(parent) = parent {
            self.mark_dirty(&parent);
        }
        debug!(id, removed = removed.len(), "evicted from metadata cache");
        removed
    }

    fn clear_in_memory(&self) {
        let mut index = self.index.write();
        self.entries.clear();
        index.clear();
        self.dirty.lock().clear();
    }

    fn is_known(&self, id: &str) -> bool {
        self.entries.contains_key(id) || self.index.read().contains_key(id)
    }

    fn mark_dirty(&self, id: &str) {
        self.dirty.lock().insert(id.to_string());
    }

    fn resolve_alias(&self, id: &str) -> String {
        if id == ROOT_ALIAS
            && let Some(root_id) = self.root_id.read().clone()
        {
            return root_id;
        }
        id.to_string()
    }

    /// Checks the directory-index invariants; used by tests and diagnostics.
    pub fn check_index_consistency(&self) -> Result<(), String> {
        let index = self.index.read();
        for (parent, bucket) in index.iter() {
            for child in bucket {
                let Some(entry) = self.entries.get(child) else {
                    return Err(format!("bucket {parent} lists missing entry {child}"));
                };
                if entry.parent_id.as_deref() != Some(parent.as_str()) {
                    return Err(format!("entry {child} filed under {parent} but points elsewhere"));
                }
            }
        }
        for entry in self.entries.iter() {
            if let Some(parent) = &entry.parent_id {
                let filed = index.get(parent).is_some_and(|bucket| bucket.contains(&entry.id));
                if !filed {
                    return Err(format!("entry {} missing from bucket {parent}", entry.id));
                }
                let elsewhere = index
                    .iter()
                    .filter(|(other, bucket)| *other != parent && bucket.contains(&entry.id))
                    .count();
                if elsewhere > 0 {
                    return Err(format!("entry {} filed under several parents", entry.id));
                }
            }
        }
        Ok(())
    }
}

fn remove_from_bucket(index: &mut HashMap<String, BTreeSet<String>>, parent: &str, id: &str) {
    if let Some(bucket) = index.get_mut(parent) {
        bucket.remove(id);
        if bucket.is_empty() {
            index.remove(parent);
        }
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
