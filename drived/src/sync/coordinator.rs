//! Serial execution of transfers.
//!
//! The coordinator keeps one active list of queued transfers and bare lock
//! holds. At most one transfer runs at a time: a pump picks the first entry
//! still `Queued`, and every finish triggers exactly one more pump.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::backoff::Backoff;
use super::locks::{FileLock, LockError, LockKind, LockRegistry};
use super::transfer::{Transfer, TransferContext, TransferInfo, TransferStatus};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    Queued(TransferInfo),
    /// The coordinator went from idle to busy.
    FirstStarted,
    Started(TransferInfo),
    Finished(TransferInfo),
    /// The last queued transfer finished.
    Drained,
}

enum QueueEntry {
    Transfer {
        transfer: Arc<Transfer>,
        lock: Option<FileLock>,
    },
    Hold {
        token: u64,
        _lock: FileLock,
    },
}

impl QueueEntry {
    fn transfer(&self) -> Option<&Arc<Transfer>> {
        match self {
            QueueEntry::Transfer { transfer, .. } => Some(transfer),
            QueueEntry::Hold { .. } => None,
        }
    }

    fn is(&self, other: &Arc<Transfer>) -> bool {
        self.transfer()
            .is_some_and(|transfer| Arc::ptr_eq(transfer, other))
    }
}

#[derive(Default)]
struct ActiveList {
    entries: Vec<QueueEntry>,
    running: Option<Arc<Transfer>>,
    busy: bool,
}

struct Inner {
    ctx: TransferContext,
    locks: LockRegistry,
    active: Mutex<ActiveList>,
    events: broadcast::Sender<CoordinatorEvent>,
    lock_wait: Backoff,
    next_hold: AtomicU64,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(ctx: TransferContext, locks: LockRegistry) -> Self {
        Self::with_lock_wait(
            ctx,
            locks,
            Backoff::new(Duration::from_millis(100), Duration::from_secs(2), true).with_attempts(6),
        )
    }

    /// `lock_wait` paces how long a starting transfer waits for its target
    /// lock before failing.
    pub fn with_lock_wait(ctx: TransferContext, locks: LockRegistry, lock_wait: Backoff) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                ctx,
                locks,
                active: Mutex::new(ActiveList::default()),
                events,
                lock_wait,
                next_hold: AtomicU64::new(1),
            }),
        }
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.inner.locks
    }

    pub fn context(&self) -> &TransferContext {
        &self.inner.ctx
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.events.subscribe()
    }

    /// Adds `transfer` unless this exact transfer is already listed, then
    /// tries to start work. Must be called inside a tokio runtime.
    pub fn enqueue(&self, transfer: Arc<Transfer>) -> bool {
        let accepted = {
            let mut active = self.inner.active.lock();
            if active.entries.iter().any(|entry| entry.is(&transfer)) {
                false
            } else if transfer.transition(&[TransferStatus::NotStarted], TransferStatus::Queued)
                || transfer.status() == TransferStatus::Queued
            {
                self.emit(CoordinatorEvent::Queued(transfer.info()));
                debug!(seq = transfer.seq(), id = %transfer.target().id, "transfer queued");
                active.entries.push(QueueEntry::Transfer {
                    transfer,
                    lock: None,
                });
                true
            } else {
                false
            }
        };
        if accepted {
            self.pump();
        }
        accepted
    }

    /// Returns how many transfers were accepted.
    pub fn enqueue_all(&self, transfers: impl IntoIterator<Item = Arc<Transfer>>) -> usize {
        transfers
            .into_iter()
            .filter(|transfer| self.enqueue(transfer.clone()))
            .count()
    }

    /// Removes `transfer` from the active list, releasing its lock, and
    /// starts the next queued one. A transfer that is still running is only
    /// asked to cancel; it finishes itself when it settles.
    pub fn finish(&self, transfer: &Arc<Transfer>) -> bool {
        {
            let mut active = self.inner.active.lock();
            let is_running = active
                .running
                .as_ref()
                .is_some_and(|running| Arc::ptr_eq(running, transfer));
            if is_running && !transfer.status().is_terminal() {
                transfer.cancel();
                return false;
            }
            let Some(position) = active.entries.iter().position(|entry| entry.is(transfer)) else {
                return false;
            };
            let entry = active.entries.remove(position);
            if is_running {
                active.running = None;
            }
            if !transfer.status().is_terminal() {
                transfer.cancel();
            }
            drop(entry);
            self.emit(CoordinatorEvent::Finished(transfer.info()));
        }
        self.pump();
        true
    }

    /// Cancels `transfer`. A queued transfer leaves the list at once; a
    /// running one settles at its next checkpoint.
    pub fn cancel(&self, transfer: &Arc<Transfer>) -> TransferStatus {
        let status = transfer.cancel();
        if status == TransferStatus::Cancelled {
            self.finish(transfer);
        }
        status
    }

    /// Takes an exclusive hold on `id`/`path` outside of any transfer. The
    /// hold lives in the active list until the guard drops.
    pub fn hold(&self, id: &str, path: &Path) -> Result<HoldGuard, LockError> {
        let lock = self.inner.locks.try_lock(Some(id), Some(path), LockKind::File)?;
        let token = self.inner.next_hold.fetch_add(1, Ordering::Relaxed);
        self.inner
            .active
            .lock()
            .entries
            .push(QueueEntry::Hold { token, _lock: lock });
        Ok(HoldGuard {
            coordinator: self.clone(),
            token,
        })
    }

    pub fn snapshot(&self) -> Vec<TransferInfo> {
        self.inner
            .active
            .lock()
            .entries
            .iter()
            .filter_map(QueueEntry::transfer)
            .map(|transfer| transfer.info())
            .collect()
    }

    pub fn is_idle(&self) -> bool {
        let active = self.inner.active.lock();
        active.running.is_none()
            && !active.entries.iter().any(|entry| {
                entry
                    .transfer()
                    .is_some_and(|transfer| transfer.status() == TransferStatus::Queued)
            })
    }

    /// Starts the oldest queued transfer when nothing is running.
    ///
    /// A transfer cancelled while still queued is dropped here and reported
    /// through `Finished`. Observers such as the upload watcher hold on to a
    /// transfer until that event arrives, so it is never dropped silently.
    fn pump(&self) {
        let picked = {
            let mut active = self.inner.active.lock();
            if active.running.is_some() {
                return;
            }
            let picked = loop {
                let position = active.entries.iter().position(|entry| {
                    entry.transfer().is_some_and(|transfer| {
                        matches!(
                            transfer.status(),
                            TransferStatus::Queued | TransferStatus::Cancelled
                        )
                    })
                });
                let Some(position) = position else {
                    break None;
                };
                let Some(transfer) = active.entries[position].transfer().cloned() else {
                    break None;
                };
                if transfer.transition(&[TransferStatus::Queued], TransferStatus::Starting) {
                    break Some(transfer);
                }
                // Cancelled between queueing and starting.
                active.entries.remove(position);
                debug!(seq = transfer.seq(), "discarded cancelled transfer before start");
                self.emit(CoordinatorEvent::Finished(transfer.info()));
            };
            match &picked {
                Some(transfer) => {
                    active.running = Some(transfer.clone());
                    if !active.busy {
                        active.busy = true;
                        self.emit(CoordinatorEvent::FirstStarted);
                    }
                }
                None if active.busy => {
                    active.busy = false;
                    info!("transfer queue drained");
                    self.emit(CoordinatorEvent::Drained);
                }
                None => {}
            }
            picked
        };
        if let Some(transfer) = picked {
            let coordinator = self.clone();
            tokio::spawn(async move { coordinator.run(transfer).await });
        }
    }

    async fn run(self, transfer: Arc<Transfer>) {
        self.emit(CoordinatorEvent::Started(transfer.info()));
        match self.acquire_target_lock(&transfer).await {
            Ok(lock) => {
                self.attach_lock(&transfer, lock);
                transfer.run(&self.inner.ctx).await;
            }
            Err(_) if transfer.is_cancel_requested() => {
                transfer.transition(
                    &[TransferStatus::Starting, TransferStatus::Cancelling],
                    TransferStatus::Cancelled,
                );
            }
            Err(err) => {
                info!(seq = transfer.seq(), id = %transfer.target().id, error = %err, "transfer target stayed locked");
                transfer.fail(format!("target is locked: {err}"));
            }
        }
        self.finish(&transfer);
    }

    async fn acquire_target_lock(&self, transfer: &Transfer) -> Result<FileLock, LockError> {
        let id = transfer.target().id.clone();
        let dir = transfer.local_dir(&self.inner.ctx.download_root);
        let backoff = self.inner.lock_wait;
        let mut last_err = None;
        for attempt in 0..backoff.attempts() {
            if transfer.is_cancel_requested() {
                break;
            }
            match self
                .inner
                .locks
                .try_lock(Some(&id), dir.as_deref(), LockKind::Transfer)
            {
                Ok(lock) => return Ok(lock),
                Err(err) => last_err = Some(err),
            }
            if attempt + 1 < backoff.attempts() {
                backoff.wait(attempt).await;
            }
        }
        Err(last_err.unwrap_or(LockError::Locked {
            target: id,
            kind: LockKind::Transfer,
        }))
    }

    fn attach_lock(&self, transfer: &Arc<Transfer>, granted: FileLock) {
        let mut active = self.inner.active.lock();
        if let Some(QueueEntry::Transfer { lock, .. }) =
            active.entries.iter_mut().find(|entry| entry.is(transfer))
        {
            *lock = Some(granted);
        }
    }

    fn release_hold(&self, token: u64) {
        let removed = {
            let mut active = self.inner.active.lock();
            active
                .entries
                .iter()
                .position(|entry| matches!(entry, QueueEntry::Hold { token: held, .. } if *held == token))
                .map(|position| active.entries.remove(position))
        };
        drop(removed);
    }

    fn emit(&self, event: CoordinatorEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

/// Keeps a coordinator hold alive; dropping it releases the lock.
pub struct HoldGuard {
    coordinator: Coordinator,
    token: u64,
}

impl Drop for HoldGuard {
    fn drop(&mut self) {
        self.coordinator.release_hold(self.token);
    }
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;
