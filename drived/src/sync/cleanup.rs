//! Local disk eviction: removes cached copies nobody has touched for a while.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::cache::{CacheEntry, MetadataCache};
use super::coordinator::Coordinator;
use super::error::ErrorClass;
use super::locks::{LockError, LockKind};
use super::paths::sanitize_title;

#[derive(Debug, Clone, Copy)]
pub struct CleanupConfig {
    pub interval: Duration,
    /// A copy is only evicted once created, accessed and modified times are
    /// all at least this old.
    pub idle_timeout: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("unexpected content in {}: {found:?}", dir.display())]
    IntegrityViolation { dir: PathBuf, found: Vec<PathBuf> },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl CleanupError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CleanupError::IntegrityViolation { .. } => ErrorClass::IntegrityViolation,
            CleanupError::Io(_) => ErrorClass::Local,
            CleanupError::Lock(err) => err.class(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Evicted,
    SkippedLocked(LockKind),
    SkippedActive,
    /// The local copy carries edits the remote does not have yet.
    SkippedNewerLocal,
    SkippedRemoteUnavailable,
    Failed(ErrorClass),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub outcomes: Vec<(String, CleanupOutcome)>,
}

impl CleanupReport {
    pub fn evicted(&self) -> usize {
        self.count(CleanupOutcome::Evicted)
    }

    pub fn count(&self, outcome: CleanupOutcome) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, seen)| *seen == outcome)
            .count()
    }

    pub fn outcome(&self, id: &str) -> Option<CleanupOutcome> {
        self.outcomes
            .iter()
            .find(|(seen, _)| seen == id)
            .map(|(_, outcome)| *outcome)
    }
}

pub struct CleanupWatcher {
    root: PathBuf,
    cache: Arc<MetadataCache>,
    coordinator: Coordinator,
    config: CleanupConfig,
}

impl CleanupWatcher {
    pub fn new(
        root: PathBuf,
        cache: Arc<MetadataCache>,
        coordinator: Coordinator,
        config: CleanupConfig,
    ) -> Self {
        Self {
            root,
            cache,
            coordinator,
            config,
        }
    }

    /// One sweep over every top-level directory under the download root.
    pub async fn run_pass(&self) -> Result<CleanupReport, CleanupError> {
        let mut report = CleanupReport::default();
        let mut dirs = match tokio::fs::read_dir(&self.root).await {
            Ok(dirs) => dirs,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(report),
            Err(err) => return Err(err.into()),
        };
        while let Some(dir) = dirs.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }
            let id = dir.file_name().to_string_lossy().into_owned();
            let outcome = match self.clean_dir(&id, &dir.path()).await {
                Ok(outcome) => outcome,
                Err(err @ CleanupError::IntegrityViolation { .. }) => {
                    error!(id = %id, error = %err, "cleanup aborted");
                    CleanupOutcome::Failed(err.class())
                }
                Err(err) => {
                    warn!(id = %id, error = %err, "cleanup failed");
                    CleanupOutcome::Failed(err.class())
                }
            };
            debug!(id = %id, ?outcome, "cleanup checked directory");
            report.outcomes.push((id, outcome));
        }
        Ok(report)
    }

    async fn clean_dir(&self, id: &str, dir: &Path) -> Result<CleanupOutcome, CleanupError> {
        let locks = self.coordinator.locks();
        if let Some(kind) = locks.is_locked(Some(id), Some(dir)) {
            return Ok(CleanupOutcome::SkippedLocked(kind));
        }

        let entry = match self.cache.get_metadata(id, false, false).await {
            Ok(view) => Some(view.entry),
            Err(err) if err.class() == ErrorClass::NotFound => None,
            Err(err) => {
                debug!(id, error = %err, "cleanup cannot resolve entry");
                return Ok(CleanupOutcome::SkippedRemoteUnavailable);
            }
        };

        let _hold = match self.coordinator.hold(id, dir) {
            Ok(hold) => hold,
            Err(LockError::Locked { kind, .. }) => return Ok(CleanupOutcome::SkippedLocked(kind)),
            Err(err) => return Err(err.into()),
        };

        if let Some(target) = self.local_copy(dir, entry.as_ref()).await? {
            let meta = tokio::fs::metadata(&target).await?;
            if !self.is_idle(&meta) {
                return Ok(CleanupOutcome::SkippedActive);
            }
            let local_modified = FileTime::from_last_modification_time(&meta).unix_seconds();
            let newer = match &entry {
                Some(entry) => entry.modified.is_some_and(|remote| local_modified > remote),
                None => edited_after_download(dir, local_modified).await?,
            };
            if newer {
                if entry.is_none() {
                    warn!(id, path = %target.display(), "keeping orphaned copy edited after download");
                }
                return Ok(CleanupOutcome::SkippedNewerLocal);
            }
            tokio::fs::remove_file(&target).await?;
        }

        let leftover = list_dir(dir).await?;
        if !leftover.is_empty() {
            return Err(CleanupError::IntegrityViolation {
                dir: dir.to_path_buf(),
                found: leftover,
            });
        }
        tokio::fs::remove_dir(dir).await?;
        info!(id, orphan = entry.is_none(), "evicted local copy");
        Ok(CleanupOutcome::Evicted)
    }

    /// The file the cache expects in `dir`. When the title is unknown or has
    /// changed remotely, the directory's only file stands in for it.
    async fn local_copy(
        &self,
        dir: &Path,
        entry: Option<&CacheEntry>,
    ) -> Result<Option<PathBuf>, CleanupError> {
        if let Some(entry) = entry {
            let expected = dir.join(sanitize_title(&entry.title));
            if tokio::fs::try_exists(&expected).await? {
                return Ok(Some(expected));
            }
        }
        let mut contents = list_dir(dir).await?;
        if contents.len() != 1 {
            return Ok(None);
        }
        let only = contents.remove(0);
        let is_file = tokio::fs::metadata(&only).await?.is_file();
        Ok(is_file.then_some(only))
    }

    fn is_idle(&self, meta: &std::fs::Metadata) -> bool {
        let latest = [meta.created(), meta.accessed(), meta.modified()]
            .into_iter()
            .filter_map(Result::ok)
            .max();
        let Some(latest) = latest else {
            return true;
        };
        SystemTime::now()
            .duration_since(latest)
            .map_or(self.config.idle_timeout.is_zero(), |idle| {
                idle >= self.config.idle_timeout
            })
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        info!(root = %self.root.display(), interval = ?self.config.interval, "cleanup loop started");
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.config.interval);
            loop {
                tick.tick().await;
                match self.run_pass().await {
                    Ok(report) if !report.outcomes.is_empty() => {
                        debug!(checked = report.outcomes.len(), evicted = report.evicted(), "cleanup pass finished");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "cleanup pass failed"),
                }
            }
        })
    }
}

/// Downloads stamp the remote mtime, which predates the item directory.
/// A copy modified at or after the directory appeared was edited locally.
async fn edited_after_download(dir: &Path, local_modified: i64) -> io::Result<bool> {
    let meta = tokio::fs::metadata(dir).await?;
    let created = meta.created().or_else(|_| meta.modified())?;
    Ok(local_modified >= FileTime::from_system_time(created).unix_seconds())
}

async fn list_dir(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        found.push(entry.path());
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::backoff::Backoff;
    use crate::sync::fake::{self, FakeDrive, file, folder};
    use crate::sync::locks::LockRegistry;
    use tempfile::{TempDir, tempdir};

    const BODY: &[u8] = b"hello world";
    const REMOTE_MTIME: i64 = 1_700_000_100;

    struct Harness {
        _dir: TempDir,
        drive: Arc<FakeDrive>,
        coordinator: Coordinator,
        cleanup: CleanupWatcher,
    }

    impl Harness {
        async fn new(idle_timeout: Duration) -> Self {
            let dir = tempdir().unwrap();
            let drive = Arc::new(FakeDrive::new("root-id", 1));
            drive.put(folder("P", Some("root-id"), "Projects"));
            drive.put_file(file("X", "P", "X.txt", BODY, REMOTE_MTIME), BODY);
            let ctx = fake::context(&drive, dir.path());
            ctx.cache.get_metadata("P", true, false).await.unwrap();
            let coordinator = Coordinator::with_lock_wait(
                ctx.clone(),
                LockRegistry::new(),
                Backoff::new(Duration::from_millis(1), Duration::from_millis(5), false),
            );
            let cleanup = CleanupWatcher::new(
                ctx.download_root.clone(),
                ctx.cache.clone(),
                coordinator.clone(),
                CleanupConfig {
                    interval: Duration::from_millis(10),
                    idle_timeout,
                },
            );
            Self {
                _dir: dir,
                drive,
                coordinator,
                cleanup,
            }
        }

        fn item_dir(&self, id: &str) -> PathBuf {
            self.coordinator.context().download_root.join(id)
        }

        fn write(&self, id: &str, name: &str, content: &[u8], mtime: i64) -> PathBuf {
            let path = self.item_dir(id).join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, content).unwrap();
            filetime::set_file_mtime(&path, FileTime::from_unix_time(mtime, 0)).unwrap();
            path
        }
    }

    #[tokio::test]
    async fn evicts_idle_copy_and_second_pass_is_noop() {
        let h = Harness::new(Duration::ZERO).await;
        h.write("X", "X.txt", BODY, REMOTE_MTIME);

        let report = h.cleanup.run_pass().await.unwrap();
        assert_eq!(report.outcome("X"), Some(CleanupOutcome::Evicted));
        assert!(!h.item_dir("X").exists());

        let again = h.cleanup.run_pass().await.unwrap();
        assert!(again.outcomes.is_empty());
        assert!(h.coordinator.locks().held().is_empty());
    }

    #[tokio::test]
    async fn missing_download_root_is_empty_pass() {
        let h = Harness::new(Duration::ZERO).await;
        assert_eq!(h.cleanup.run_pass().await.unwrap(), CleanupReport::default());
    }

    #[tokio::test]
    async fn recently_used_copy_is_kept() {
        let h = Harness::new(Duration::from_secs(3600)).await;
        let path = h.write("X", "X.txt", BODY, REMOTE_MTIME);

        let report = h.cleanup.run_pass().await.unwrap();
        assert_eq!(report.outcome("X"), Some(CleanupOutcome::SkippedActive));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn locally_edited_copy_is_kept() {
        let h = Harness::new(Duration::ZERO).await;
        let path = h.write("X", "X.txt", b"edited", REMOTE_MTIME + 60);

        let report = h.cleanup.run_pass().await.unwrap();
        assert_eq!(report.outcome("X"), Some(CleanupOutcome::SkippedNewerLocal));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn locked_copy_is_skipped() {
        let h = Harness::new(Duration::ZERO).await;
        let path = h.write("X", "X.txt", BODY, REMOTE_MTIME);
        let hold = h
            .coordinator
            .locks()
            .try_lock(Some("X"), None, LockKind::Transfer)
            .unwrap();

        let report = h.cleanup.run_pass().await.unwrap();
        assert_eq!(
            report.outcome("X"),
            Some(CleanupOutcome::SkippedLocked(LockKind::Transfer))
        );
        assert!(path.exists());

        drop(hold);
        let report = h.cleanup.run_pass().await.unwrap();
        assert_eq!(report.outcome("X"), Some(CleanupOutcome::Evicted));
    }

    #[tokio::test]
    async fn unexpected_sibling_aborts_without_touching_it() {
        let h = Harness::new(Duration::ZERO).await;
        h.write("X", "X.txt", BODY, REMOTE_MTIME);
        let stray = h.write("X", "notes.txt", b"mine", REMOTE_MTIME);

        let report = h.cleanup.run_pass().await.unwrap();
        assert_eq!(
            report.outcome("X"),
            Some(CleanupOutcome::Failed(ErrorClass::IntegrityViolation))
        );
        assert!(stray.exists());
        assert!(h.item_dir("X").exists());
        assert!(h.coordinator.locks().held().is_empty());
    }

    #[tokio::test]
    async fn copy_under_stale_title_is_evicted() {
        let h = Harness::new(Duration::ZERO).await;
        h.write("X", "Before rename.txt", BODY, REMOTE_MTIME);

        let report = h.cleanup.run_pass().await.unwrap();
        assert_eq!(report.outcome("X"), Some(CleanupOutcome::Evicted));
        assert!(!h.item_dir("X").exists());
    }

    #[tokio::test]
    async fn orphaned_copy_is_evicted() {
        let h = Harness::new(Duration::ZERO).await;
        h.write("gone", "Old.txt", b"old", REMOTE_MTIME);

        let report = h.cleanup.run_pass().await.unwrap();
        assert_eq!(report.outcome("gone"), Some(CleanupOutcome::Evicted));
        assert!(!h.item_dir("gone").exists());
    }

    #[tokio::test]
    async fn orphaned_copy_edited_after_download_is_kept() {
        let h = Harness::new(Duration::ZERO).await;
        let edited_at = FileTime::now().unix_seconds() + 60;
        let path = h.write("gone", "Old.txt", b"mine", edited_at);

        let report = h.cleanup.run_pass().await.unwrap();
        assert_eq!(report.outcome("gone"), Some(CleanupOutcome::SkippedNewerLocal));
        assert!(path.exists());
        assert!(h.coordinator.locks().held().is_empty());
    }

    #[tokio::test]
    async fn unresolvable_entry_is_left_alone() {
        let h = Harness::new(Duration::ZERO).await;
        let path = h.write("unknown", "U.txt", b"u", REMOTE_MTIME);
        h.drive.set_offline(true);

        let report = h.cleanup.run_pass().await.unwrap();
        assert_eq!(
            report.outcome("unknown"),
            Some(CleanupOutcome::SkippedRemoteUnavailable)
        );
        assert!(path.exists());
    }
}
