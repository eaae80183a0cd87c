//! Turns edits to locally cached files into upload transfers.
//!
//! Per path: Idle -> PendingUpload -> Uploading -> Idle. A path whose target
//! is locked, or whose upload failed, is deferred and retried on the poll
//! tick until a bounded horizon runs out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use filetime::FileTime;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cache::MetadataCache;
use super::coordinator::{Coordinator, CoordinatorEvent};
use super::jobs::UploadJob;
use super::locks::LockKind;
use super::paths::{is_partial, item_dir, sanitize_title, split_item_path};
use super::transfer::{Transfer, TransferInfo, TransferKind, TransferStatus};

#[derive(Debug, Clone, Copy)]
pub struct UploadWatcherConfig {
    pub poll_interval: Duration,
    /// How long a deferred path keeps being retried.
    pub retry_horizon: Duration,
}

impl Default for UploadWatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            retry_horizon: Duration::from_secs(300),
        }
    }
}

/// Size and mtime of a local copy when it was last looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSnapshot {
    pub size: u64,
    pub modified: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPhase {
    Idle,
    PendingUpload,
    Uploading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadDecision {
    IgnoredPartial,
    IgnoredOutsideRoot,
    Missing,
    /// No cache entry owns this file.
    Unknown,
    Unchanged,
    AlreadyPending,
    Locked(LockKind),
    Enqueued,
}

struct Watched {
    snapshot: FileSnapshot,
    transfer: Arc<Transfer>,
}

#[derive(Debug, Clone, Copy)]
struct Deferred {
    first_seen: Instant,
}

pub struct UploadWatcher {
    root: PathBuf,
    cache: Arc<MetadataCache>,
    coordinator: Coordinator,
    config: UploadWatcherConfig,
    watched: DashMap<PathBuf, Watched>,
    deferred: DashMap<PathBuf, Deferred>,
}

impl UploadWatcher {
    pub fn new(
        root: PathBuf,
        cache: Arc<MetadataCache>,
        coordinator: Coordinator,
        config: UploadWatcherConfig,
    ) -> Self {
        Self {
            root,
            cache,
            coordinator,
            config,
            watched: DashMap::new(),
            deferred: DashMap::new(),
        }
    }

    pub fn phase(&self, path: &Path) -> WatchPhase {
        match self.watched.get(path) {
            None => WatchPhase::Idle,
            Some(watched) if watched.transfer.status() == TransferStatus::Queued => {
                WatchPhase::PendingUpload
            }
            Some(_) => WatchPhase::Uploading,
        }
    }

    pub fn snapshot_of(&self, path: &Path) -> Option<FileSnapshot> {
        self.watched.get(path).map(|watched| watched.snapshot)
    }

    pub fn deferred_paths(&self) -> Vec<PathBuf> {
        self.deferred.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Handles one change notification for `path`.
    pub async fn handle_change(&self, path: &Path) -> UploadDecision {
        if is_partial(path) {
            return UploadDecision::IgnoredPartial;
        }
        let Some((id, file_name)) = split_item_path(&self.root, path) else {
            return UploadDecision::IgnoredOutsideRoot;
        };
        let snapshot = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => FileSnapshot {
                size: meta.len(),
                modified: FileTime::from_last_modification_time(&meta).unix_seconds(),
            },
            _ => {
                self.deferred.remove(path);
                return UploadDecision::Missing;
            }
        };
        let Some(entry) = self
            .cache
            .peek(&id)
            .filter(|entry| !entry.is_folder() && sanitize_title(&entry.title) == file_name)
        else {
            self.deferred.remove(path);
            return UploadDecision::Unknown;
        };
        if entry.matches_local(snapshot.size, snapshot.modified) {
            self.deferred.remove(path);
            return UploadDecision::Unchanged;
        }
        if self.watched.contains_key(path) {
            return UploadDecision::AlreadyPending;
        }
        let dir = item_dir(&self.root, &id).ok();
        if let Some(kind) = self.coordinator.locks().is_locked(Some(&id), dir.as_deref()) {
            debug!(id = %id, ?kind, "local edit deferred: target locked");
            self.defer(path);
            return UploadDecision::Locked(kind);
        }

        let transfer = Transfer::new(UploadJob::new(&entry, path.to_path_buf()));
        match self.watched.entry(path.to_path_buf()) {
            Entry::Occupied(_) => return UploadDecision::AlreadyPending,
            Entry::Vacant(slot) => {
                slot.insert(Watched {
                    snapshot,
                    transfer: transfer.clone(),
                });
            }
        }
        if !self.coordinator.enqueue(transfer) {
            self.watched.remove(path);
            return UploadDecision::AlreadyPending;
        }
        info!(id = %id, size = snapshot.size, "local edit queued for upload");
        UploadDecision::Enqueued
    }

    /// Reacts to a finished upload: a failure is deferred for retry, a
    /// success re-checks the file for edits made while it was uploading.
    pub async fn on_transfer_finished(&self, info: &TransferInfo) {
        if info.kind != TransferKind::Upload {
            return;
        }
        let paths: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|watched| watched.transfer.seq() == info.seq)
            .map(|watched| watched.key().clone())
            .collect();
        for path in paths {
            match info.status {
                TransferStatus::Failed => {
                    warn!(
                        id = %info.target_id,
                        error = info.failure.as_deref().unwrap_or("unknown"),
                        "upload failed; will retry"
                    );
                    self.defer(&path);
                    self.watched.remove(&path);
                }
                TransferStatus::Completed => {
                    self.watched.remove(&path);
                    self.handle_change(&path).await;
                }
                _ => {
                    self.watched.remove(&path);
                }
            }
        }
    }

    /// Retries every deferred path, dropping those past the retry horizon.
    pub async fn retry_deferred(&self) {
        let due: Vec<(PathBuf, Deferred)> = self
            .deferred
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        for (path, deferred) in due {
            if deferred.first_seen.elapsed() >= self.config.retry_horizon {
                warn!(path = %path.display(), "giving up on deferred upload");
                self.deferred.remove(&path);
                continue;
            }
            let decision = self.handle_change(&path).await;
            debug!(path = %path.display(), ?decision, "retried deferred upload");
        }
    }

    fn defer(&self, path: &Path) {
        self.deferred
            .entry(path.to_path_buf())
            .or_insert_with(|| Deferred {
                first_seen: Instant::now(),
            });
    }

    /// Starts the filesystem watcher and its background tasks.
    pub fn start(self: Arc<Self>) -> notify::Result<UploadWatcherHandle> {
        std::fs::create_dir_all(&self.root).map_err(notify::Error::io)?;
        let (watcher, mut rx) = start_notify_watcher(&self.root)?;

        let events = {
            let this = self.clone();
            tokio::spawn(async move {
                while let Some(path) = rx.recv().await {
                    let decision = this.handle_change(&path).await;
                    debug!(path = %path.display(), ?decision, "local change handled");
                }
            })
        };
        let poll = {
            let this = self.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(this.config.poll_interval);
                loop {
                    tick.tick().await;
                    this.retry_deferred().await;
                }
            })
        };
        let finished = self.clone().listen_finished();
        info!(root = %self.root.display(), "upload watcher started");
        Ok(UploadWatcherHandle {
            _watcher: watcher,
            tasks: vec![events, poll, finished],
        })
    }

    fn listen_finished(self: Arc<Self>) -> JoinHandle<()> {
        let mut events = self.coordinator.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(CoordinatorEvent::Finished(info)) => self.on_transfer_finished(&info).await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "upload watcher missed coordinator events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Owns the OS watcher and the background tasks; dropping it stops both.
pub struct UploadWatcherHandle {
    _watcher: RecommendedWatcher,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for UploadWatcherHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn start_notify_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<PathBuf>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for path in changed_paths(event) {
                let _ = tx.send(path);
            }
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn changed_paths(event: Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
            event.paths.into_iter().last().into_iter().collect()
        }
        EventKind::Create(_)
        | EventKind::Modify(_)
        | EventKind::Access(notify::event::AccessKind::Close(notify::event::AccessMode::Write)) => {
            event.paths
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
#[path = "upload_watcher_tests.rs"]
mod tests;
