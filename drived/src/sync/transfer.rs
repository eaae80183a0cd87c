use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use async_trait::async_trait;
use drive_core::{DriveError, DriveItem, RemoteDrive};
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::cache::{CacheEntry, CacheError, MetadataCache};
use super::error::{ErrorClass, classify_drive_error};
use super::locks::LockError;
use super::paths::{PathError, item_dir};

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Download,
    Upload,
    Insert,
    Move,
    Copy,
    Rename,
    Trash,
    Untrash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    NotStarted,
    Queued,
    Starting,
    Processing,
    /// Cancel requested while processing; settles on the next checkpoint.
    Cancelling,
    Completed,
    Cancelled,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Cancelled | TransferStatus::Failed
        )
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer cancelled")]
    Cancelled,
    #[error(transparent)]
    Locked(#[from] LockError),
    #[error("remote error: {0}")]
    Remote(#[from] DriveError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("invalid local path: {0}")]
    Path(#[from] PathError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("download integrity check failed: expected {expected_md5}, got {actual_md5}")]
    IntegrityMismatch {
        expected_md5: String,
        actual_md5: String,
    },
    #[error("local source missing: {}", .0.display())]
    Missing(PathBuf),
    #[error("{0} is a folder")]
    IsFolder(String),
}

impl TransferError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TransferError::Locked(err) => err.class(),
            TransferError::Remote(err) => classify_drive_error(err),
            TransferError::Cache(err) => err.class(),
            TransferError::IntegrityMismatch { .. } => ErrorClass::IntegrityViolation,
            TransferError::Cancelled
            | TransferError::Path(_)
            | TransferError::Io(_)
            | TransferError::Missing(_)
            | TransferError::IsFolder(_) => ErrorClass::Local,
        }
    }
}

/// The remote item a transfer acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTarget {
    pub id: String,
    pub title: String,
    pub is_folder: bool,
}

impl TransferTarget {
    pub fn new(id: impl Into<String>, title: impl Into<String>, is_folder: bool) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            is_folder,
        }
    }

    pub fn from_entry(entry: &CacheEntry) -> Self {
        Self::new(&entry.id, &entry.title, entry.is_folder())
    }

    pub fn from_item(item: &DriveItem) -> Self {
        Self::new(&item.id, &item.title, item.is_folder())
    }
}

/// Shared collaborators handed to every job.
#[derive(Clone)]
pub struct TransferContext {
    pub remote: Arc<dyn RemoteDrive>,
    pub cache: Arc<MetadataCache>,
    pub download_root: PathBuf,
}

/// One kind of operation. Implementations poll `Progress::checkpoint` between
/// steps so cancellation stays cooperative.
#[async_trait]
pub trait TransferJob: Send + Sync {
    fn kind(&self) -> TransferKind;

    fn target(&self) -> &TransferTarget;

    /// Local directory the job may touch; locked together with the target id.
    fn local_dir(&self, download_root: &Path) -> Option<PathBuf> {
        item_dir(download_root, &self.target().id).ok()
    }

    async fn execute(
        &self,
        ctx: &TransferContext,
        progress: &Progress<'_>,
    ) -> Result<(), TransferError>;
}

#[derive(Debug)]
struct TransferState {
    status: TransferStatus,
    failure: Option<String>,
}

/// Read-only view of a transfer for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferInfo {
    pub seq: u64,
    pub kind: TransferKind,
    pub target_id: String,
    pub title: String,
    pub status: TransferStatus,
    pub percent: u8,
    pub failure: Option<String>,
}

pub struct Transfer {
    seq: u64,
    job: Box<dyn TransferJob>,
    state: Mutex<TransferState>,
    percent: AtomicU8,
    cancel: CancellationToken,
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("seq", &self.seq)
            .field("kind", &self.kind())
            .field("target", self.target())
            .field("status", &self.status())
            .finish()
    }
}

impl Transfer {
    pub fn new(job: impl TransferJob + 'static) -> Arc<Self> {
        Arc::new(Self {
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            job: Box::new(job),
            state: Mutex::new(TransferState {
                status: TransferStatus::NotStarted,
                failure: None,
            }),
            percent: AtomicU8::new(0),
            cancel: CancellationToken::new(),
        })
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn kind(&self) -> TransferKind {
        self.job.kind()
    }

    pub fn target(&self) -> &TransferTarget {
        self.job.target()
    }

    pub fn is_folder(&self) -> bool {
        self.target().is_folder
    }

    pub fn local_dir(&self, download_root: &Path) -> Option<PathBuf> {
        self.job.local_dir(download_root)
    }

    pub fn status(&self) -> TransferStatus {
        self.state.lock().status
    }

    pub fn percent(&self) -> u8 {
        self.percent.load(Ordering::SeqCst)
    }

    pub fn failure(&self) -> Option<String> {
        self.state.lock().failure.clone()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn info(&self) -> TransferInfo {
        let state = self.state.lock();
        TransferInfo {
            seq: self.seq,
            kind: self.kind(),
            target_id: self.target().id.clone(),
            title: self.target().title.clone(),
            status: state.status,
            percent: self.percent(),
            failure: state.failure.clone(),
        }
    }

    /// Requests cancellation. Work that has not started is cancelled
    /// outright; running work settles at its next checkpoint.
    pub fn cancel(&self) -> TransferStatus {
        self.cancel.cancel();
        let mut state = self.state.lock();
        state.status = match state.status {
            TransferStatus::NotStarted | TransferStatus::Queued => TransferStatus::Cancelled,
            TransferStatus::Starting | TransferStatus::Processing => TransferStatus::Cancelling,
            other => other,
        };
        state.status
    }

    /// Moves to `to` only from one of `from`. Terminal states never change.
    pub(crate) fn transition(&self, from: &[TransferStatus], to: TransferStatus) -> bool {
        let mut state = self.state.lock();
        if state.status.is_terminal() || !from.contains(&state.status) {
            return false;
        }
        state.status = to;
        true
    }

    pub(crate) fn fail(&self, message: impl Into<String>) {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return;
        }
        state.status = TransferStatus::Failed;
        state.failure = Some(message.into());
    }

    /// Drives the job from `Starting` to a terminal state. The caller holds
    /// the target lock for the whole call.
    pub(crate) async fn run(&self, ctx: &TransferContext) -> TransferStatus {
        if !self.transition(&[TransferStatus::Starting], TransferStatus::Processing) {
            self.transition(
                &[TransferStatus::Starting, TransferStatus::Cancelling],
                TransferStatus::Cancelled,
            );
            return self.status();
        }
        let target = self.target().clone();
        info!(seq = self.seq, kind = ?self.kind(), id = %target.id, "transfer started");

        let progress = Progress { transfer: self };
        let result = match progress.checkpoint() {
            Ok(()) => self.job.execute(ctx, &progress).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                self.percent.store(100, Ordering::SeqCst);
                self.transition(
                    &[TransferStatus::Processing, TransferStatus::Cancelling],
                    TransferStatus::Completed,
                );
                info!(seq = self.seq, id = %target.id, "transfer completed");
            }
            Err(TransferError::Cancelled) => {
                self.transition(
                    &[TransferStatus::Processing, TransferStatus::Cancelling],
                    TransferStatus::Cancelled,
                );
                info!(seq = self.seq, id = %target.id, "transfer cancelled");
            }
            Err(err) => {
                warn!(seq = self.seq, id = %target.id, class = ?err.class(), error = %err, "transfer failed");
                self.fail(err.to_string());
            }
        }
        self.status()
    }
}

/// Handle a running job uses to report progress and observe cancellation.
pub struct Progress<'a> {
    transfer: &'a Transfer,
}

impl Progress<'_> {
    /// Never moves backwards.
    pub fn report(&self, percent: u8) {
        self.transfer
            .percent
            .fetch_max(percent.min(100), Ordering::SeqCst);
    }

    pub fn report_bytes(&self, done: u64, total: Option<u64>) {
        if let Some(total) = total.filter(|total| *total > 0) {
            let percent = (done.saturating_mul(100) / total).min(99);
            self.report(percent as u8);
        }
    }

    /// Fails with `Cancelled` once a cancel has been requested.
    pub fn checkpoint(&self) -> Result<(), TransferError> {
        if self.transfer.cancel.is_cancelled() {
            self.transfer
                .transition(&[TransferStatus::Processing], TransferStatus::Cancelling);
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }

    pub fn token(&self) -> &CancellationToken {
        &self.transfer.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::fake::{self, FakeDrive};
    use tempfile::tempdir;

    struct Scripted {
        target: TransferTarget,
        outcome: fn(&Progress<'_>) -> Result<(), TransferError>,
    }

    #[async_trait]
    impl TransferJob for Scripted {
        fn kind(&self) -> TransferKind {
            TransferKind::Rename
        }

        fn target(&self) -> &TransferTarget {
            &self.target
        }

        async fn execute(
            &self,
            _ctx: &TransferContext,
            progress: &Progress<'_>,
        ) -> Result<(), TransferError> {
            (self.outcome)(progress)
        }
    }

    fn scripted(outcome: fn(&Progress<'_>) -> Result<(), TransferError>) -> Arc<Transfer> {
        Transfer::new(Scripted {
            target: TransferTarget::new("a", "A.txt", false),
            outcome,
        })
    }

    fn context(dir: &Path) -> TransferContext {
        fake::context(&Arc::new(FakeDrive::new("root-id", 1)), dir)
    }

    fn start(transfer: &Transfer) {
        assert!(transfer.transition(&[TransferStatus::NotStarted], TransferStatus::Queued));
        assert!(transfer.transition(&[TransferStatus::Queued], TransferStatus::Starting));
    }

    #[tokio::test]
    async fn successful_run_completes_at_full_progress() {
        let dir = tempdir().unwrap();
        let transfer = scripted(|progress| {
            progress.report(40);
            progress.report(10);
            Ok(())
        });
        start(&transfer);
        assert_eq!(transfer.run(&context(dir.path())).await, TransferStatus::Completed);
        assert_eq!(transfer.percent(), 100);
        assert_eq!(transfer.failure(), None);
    }

    #[tokio::test]
    async fn failure_records_message() {
        let dir = tempdir().unwrap();
        let transfer = scripted(|_| Err(TransferError::Missing(PathBuf::from("/gone"))));
        start(&transfer);
        assert_eq!(transfer.run(&context(dir.path())).await, TransferStatus::Failed);
        assert!(transfer.failure().unwrap().contains("/gone"));
    }

    #[tokio::test]
    async fn cancel_while_processing_settles_at_checkpoint() {
        let dir = tempdir().unwrap();
        let transfer = scripted(|progress| {
            progress.transfer.cancel();
            assert_eq!(progress.transfer.status(), TransferStatus::Cancelling);
            progress.checkpoint()
        });
        start(&transfer);
        assert_eq!(transfer.run(&context(dir.path())).await, TransferStatus::Cancelled);
    }

    #[test]
    fn cancelling_queued_transfer_is_immediate_and_sticky() {
        let transfer = scripted(|_| Ok(()));
        assert!(transfer.transition(&[TransferStatus::NotStarted], TransferStatus::Queued));
        assert_eq!(transfer.cancel(), TransferStatus::Cancelled);
        assert!(!transfer.transition(&[TransferStatus::Cancelled], TransferStatus::Queued));
        transfer.fail("late");
        assert_eq!(transfer.status(), TransferStatus::Cancelled);
        assert_eq!(transfer.failure(), None);
    }

    #[test]
    fn byte_progress_is_monotonic_and_below_completion() {
        let transfer = scripted(|_| Ok(()));
        let progress = Progress {
            transfer: &transfer,
        };
        progress.report_bytes(50, Some(100));
        progress.report_bytes(20, Some(100));
        assert_eq!(transfer.percent(), 50);
        progress.report_bytes(100, Some(100));
        assert_eq!(transfer.percent(), 99);
        progress.report_bytes(5, None);
        assert_eq!(transfer.percent(), 99);
    }
}
