//! Advisory locks over item ids and local paths, optionally backed by an OS
//! file handle opened under a sharing mode.
//!
//! Acquisition never blocks: a conflicting request gets `LockError::Locked`
//! and the caller decides whether to wait, retry later or skip.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fs2::FileExt;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use super::backoff::Backoff;
use super::error::ErrorClass;
use super::paths::lock_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Held directly by a caller or a watcher.
    File,
    /// Held on behalf of an executing transfer.
    Transfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Open,
    Create,
    CreateNew,
    OpenOrCreate,
    Truncate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAccess {
    Read,
    Write,
    ReadWrite,
}

/// What other openers of the same file may still do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileShare {
    None,
    Read,
    ReadWrite,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("{target} is locked ({kind:?})")]
    Locked { target: String, kind: LockKind },
    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LockError::Locked { .. } => ErrorClass::Locked,
            LockError::Open { source, .. } if is_contended(source) => ErrorClass::Locked,
            LockError::Open { .. } => ErrorClass::Local,
        }
    }
}

/// Diagnostic view of one held lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLock {
    pub id: Option<String>,
    pub path: Option<PathBuf>,
    pub kind: LockKind,
    pub has_handle: bool,
}

#[derive(Debug)]
struct LockRecord {
    token: u64,
    id: Option<String>,
    path: Option<PathBuf>,
    path_key: Option<String>,
    kind: LockKind,
    has_handle: bool,
}

#[derive(Debug)]
struct Inner {
    records: Mutex<Vec<LockRecord>>,
    next_token: AtomicU64,
    handle_retry: Backoff,
}

#[derive(Debug, Clone)]
pub struct LockRegistry {
    inner: Arc<Inner>,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::with_backoff(
            Backoff::new(Duration::from_millis(50), Duration::from_millis(800), true)
                .with_attempts(5),
        )
    }
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `backoff` paces the retries of `try_lock_with_handle`.
    pub fn with_backoff(backoff: Backoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                records: Mutex::new(Vec::new()),
                next_token: AtomicU64::new(1),
                handle_retry: backoff,
            }),
        }
    }

    /// Grants an advisory lock unless another lock already covers `id` or,
    /// ignoring case, `path`.
    pub fn try_lock(
        &self,
        id: Option<&str>,
        path: Option<&Path>,
        kind: LockKind,
    ) -> Result<FileLock, LockError> {
        let path_key = path.map(lock_key);
        let mut records = self.inner.records.lock();
        if let Some(existing) = find_conflict(&records, id, path_key.as_deref()) {
            trace!(?id, ?path, held = ?existing.kind, "lock refused");
            return Err(LockError::Locked {
                target: describe(id, path),
                kind: existing.kind,
            });
        }
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        records.push(LockRecord {
            token,
            id: id.map(str::to_string),
            path: path.map(Path::to_path_buf),
            path_key,
            kind,
            has_handle: false,
        });
        debug!(?id, ?path, ?kind, "lock granted");
        Ok(FileLock {
            registry: self.inner.clone(),
            token,
            kind,
            id: id.map(str::to_string),
            path: path.map(Path::to_path_buf),
            file: None,
            released: false,
        })
    }

    /// Like `try_lock`, and also opens `path` with OS-level sharing
    /// restrictions. A busy lock or contended handle is retried with backoff
    /// for a bounded number of attempts.
    pub async fn try_lock_with_handle(
        &self,
        id: Option<&str>,
        path: &Path,
        mode: OpenMode,
        access: FileAccess,
        share: FileShare,
    ) -> Result<FileLock, LockError> {
        let backoff = self.inner.handle_retry;
        let mut last_err = None;
        for attempt in 0..backoff.attempts() {
            match self.try_lock(id, Some(path), LockKind::File) {
                Ok(mut lock) => {
                    let owned = path.to_path_buf();
                    let opened =
                        tokio::task::spawn_blocking(move || open_shared(&owned, mode, access, share))
                            .await
                            .unwrap_or_else(|join| Err(io::Error::other(join)));
                    match opened {
                        Ok(file) => {
                            lock.attach(file);
                            return Ok(lock);
                        }
                        Err(source) if is_contended(&source) => {
                            last_err = Some(LockError::Open {
                                path: path.to_path_buf(),
                                source,
                            });
                        }
                        Err(source) => {
                            return Err(LockError::Open {
                                path: path.to_path_buf(),
                                source,
                            });
                        }
                    }
                }
                Err(err) => last_err = Some(err),
            }
            if attempt + 1 < backoff.attempts() {
                backoff.wait(attempt).await;
            }
        }
        Err(last_err.unwrap_or_else(|| LockError::Locked {
            target: describe(id, Some(path)),
            kind: LockKind::File,
        }))
    }

    /// Releases `lock`; same as dropping it.
    pub fn unlock(&self, mut lock: FileLock) {
        lock.release();
    }

    /// Reports which kind of lock, if any, currently covers `id` or `path`.
    pub fn is_locked(&self, id: Option<&str>, path: Option<&Path>) -> Option<LockKind> {
        let path_key = path.map(lock_key);
        let records = self.inner.records.lock();
        find_conflict(&records, id, path_key.as_deref()).map(|record| record.kind)
    }

    pub fn held(&self) -> Vec<HeldLock> {
        self.inner
            .records
            .lock()
            .iter()
            .map(|record| HeldLock {
                id: record.id.clone(),
                path: record.path.clone(),
                kind: record.kind,
                has_handle: record.has_handle,
            })
            .collect()
    }
}

/// A granted lock. Releasing is idempotent and also happens on drop.
#[derive(Debug)]
pub struct FileLock {
    registry: Arc<Inner>,
    token: u64,
    kind: LockKind,
    id: Option<String>,
    path: Option<PathBuf>,
    file: Option<File>,
    released: bool,
}

impl FileLock {
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(file) = self.file.take() {
            // Closing the descriptor drops the OS lock as well.
            let _ = FileExt::unlock(&file);
        }
        self.registry
            .records
            .lock()
            .retain(|record| record.token != self.token);
        debug!(id = ?self.id, path = ?self.path, "lock released");
    }

    fn attach(&mut self, file: File) {
        self.file = Some(file);
        if let Some(record) = self
            .registry
            .records
            .lock()
            .iter_mut()
            .find(|record| record.token == self.token)
        {
            record.has_handle = true;
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn find_conflict<'a>(
    records: &'a [LockRecord],
    id: Option<&str>,
    path_key: Option<&str>,
) -> Option<&'a LockRecord> {
    records.iter().find(|record| {
        let same_id = id.is_some() && record.id.as_deref() == id;
        let same_path = path_key.is_some() && record.path_key.as_deref() == path_key;
        same_id || same_path
    })
}

fn describe(id: Option<&str>, path: Option<&Path>) -> String {
    match (id, path) {
        (Some(id), _) => id.to_string(),
        (None, Some(path)) => path.display().to_string(),
        (None, None) => "<nothing>".to_string(),
    }
}

fn open_shared(path: &Path, mode: OpenMode, access: FileAccess, share: FileShare) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options
        .read(matches!(access, FileAccess::Read | FileAccess::ReadWrite))
        .write(matches!(access, FileAccess::Write | FileAccess::ReadWrite));
    match mode {
        OpenMode::Open => {}
        OpenMode::Create => {
            options.create(true).truncate(true);
        }
        OpenMode::CreateNew => {
            options.create_new(true);
        }
        OpenMode::OpenOrCreate => {
            options.create(true);
        }
        OpenMode::Truncate => {
            options.truncate(true);
        }
    }
    let file = options.open(path)?;
    match share {
        FileShare::None => FileExt::try_lock_exclusive(&file)?,
        FileShare::Read => FileExt::try_lock_shared(&file)?,
        FileShare::ReadWrite => {}
    }
    Ok(file)
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == fs2::lock_contended_error().kind() || err.kind() == io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn quick_registry() -> LockRegistry {
        LockRegistry::with_backoff(
            Backoff::new(Duration::from_millis(1), Duration::from_millis(2), false).with_attempts(3),
        )
    }

    #[test]
    fn same_id_is_never_granted_twice() {
        let registry = LockRegistry::new();
        let first = registry
            .try_lock(Some("a"), Some(Path::new("/c/a")), LockKind::File)
            .unwrap();
        let second = registry.try_lock(Some("a"), None, LockKind::File);
        assert!(matches!(
            second,
            Err(LockError::Locked {
                kind: LockKind::File,
                ..
            })
        ));
        drop(first);
    }

    #[test]
    fn path_conflicts_ignore_case() {
        let registry = LockRegistry::new();
        let _held = registry
            .try_lock(None, Some(Path::new("/Cache/ABC")), LockKind::Transfer)
            .unwrap();
        let err = registry
            .try_lock(Some("other"), Some(Path::new("/cache/abc")), LockKind::File)
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Locked);
        assert_eq!(
            registry.is_locked(None, Some(Path::new("/CACHE/abc"))),
            Some(LockKind::Transfer)
        );
    }

    #[test]
    fn unlock_then_relock_succeeds() {
        let registry = LockRegistry::new();
        for _ in 0..3 {
            let lock = registry.try_lock(Some("a"), None, LockKind::File).unwrap();
            registry.unlock(lock);
        }
        assert!(registry.held().is_empty());
        assert_eq!(registry.is_locked(Some("a"), None), None);
    }

    #[test]
    fn release_is_idempotent() {
        let registry = LockRegistry::new();
        let mut lock = registry.try_lock(Some("a"), None, LockKind::File).unwrap();
        let _other = registry.try_lock(Some("b"), None, LockKind::File).unwrap();
        lock.release();
        lock.release();
        drop(lock);
        let held = registry.held();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].id.as_deref(), Some("b"));
    }

    #[test]
    fn concurrent_attempts_grant_exactly_one() {
        let registry = LockRegistry::new();
        let granted: Vec<FileLock> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| registry.try_lock(Some("same"), None, LockKind::File).ok()))
                .collect();
            handles
                .into_iter()
                .filter_map(|handle| handle.join().unwrap())
                .collect()
        });
        assert_eq!(granted.len(), 1);
    }

    #[tokio::test]
    async fn handle_lock_excludes_other_openers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("A.txt");
        let registry = quick_registry();

        let lock = registry
            .try_lock_with_handle(
                Some("a"),
                &path,
                OpenMode::OpenOrCreate,
                FileAccess::ReadWrite,
                FileShare::None,
            )
            .await
            .unwrap();
        assert!(lock.file().is_some());
        assert!(registry.held()[0].has_handle);

        let outsider = File::open(&path).unwrap();
        assert!(FileExt::try_lock_shared(&outsider).is_err());

        drop(lock);
        assert!(FileExt::try_lock_shared(&outsider).is_ok());
    }

    #[tokio::test]
    async fn contended_handle_gives_up_after_retries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("A.txt");
        std::fs::write(&path, b"x").unwrap();
        let outsider = File::open(&path).unwrap();
        FileExt::try_lock_exclusive(&outsider).unwrap();

        let registry = quick_registry();
        let err = registry
            .try_lock_with_handle(None, &path, OpenMode::Open, FileAccess::Read, FileShare::Read)
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Locked);
        assert!(registry.held().is_empty());
    }

    #[tokio::test]
    async fn missing_file_is_a_local_error() {
        let dir = tempdir().unwrap();
        let registry = quick_registry();
        let err = registry
            .try_lock_with_handle(
                None,
                &dir.path().join("nope"),
                OpenMode::Open,
                FileAccess::Read,
                FileShare::ReadWrite,
            )
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Local);
    }
}
