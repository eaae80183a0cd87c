//! In-memory `RemoteDrive` for tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use drive_core::{
    AccountCursor, ByteStream, Change, ChangeList, DriveError, DriveItem, FOLDER_MIME_TYPE, Labels,
    ParentRef, RemoteDrive, StatusCode,
};
use futures_util::StreamExt;
use parking_lot::Mutex;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::cache::{CacheConfig, MetadataCache};
use super::snapshot::{AccountPaths, SnapshotStore};
use super::transfer::TransferContext;

pub(crate) fn rfc3339(secs: i64) -> String {
    OffsetDateTime::from_unix_timestamp(secs)
        .unwrap()
        .format(&Rfc3339)
        .unwrap()
}

pub(crate) fn folder(id: &str, parent: Option<&str>, title: &str) -> DriveItem {
    DriveItem {
        id: id.into(),
        title: title.into(),
        mime_type: FOLDER_MIME_TYPE.into(),
        modified_date: Some(rfc3339(1_700_000_000)),
        parents: parent
            .map(|id| vec![ParentRef { id: id.into() }])
            .unwrap_or_default(),
        ..DriveItem::default()
    }
}

pub(crate) fn file(id: &str, parent: &str, title: &str, content: &[u8], modified: i64) -> DriveItem {
    DriveItem {
        id: id.into(),
        title: title.into(),
        mime_type: "text/plain".into(),
        file_size: Some(content.len() as u64),
        modified_date: Some(rfc3339(modified)),
        md5_checksum: Some(format!("{:x}", md5::compute(content))),
        download_url: Some(format!("https://fake/{id}")),
        parents: vec![ParentRef { id: parent.into() }],
        ..DriveItem::default()
    }
}

#[derive(Debug, Default)]
pub(crate) struct Calls {
    pub fetch_item: AtomicUsize,
    pub list_children: AtomicUsize,
    pub list_changes: AtomicUsize,
    pub account: AtomicUsize,
    pub download: AtomicUsize,
    pub upload: AtomicUsize,
    pub mutations: AtomicUsize,
}

pub(crate) fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

pub(crate) struct FakeDrive {
    items: Mutex<HashMap<String, DriveItem>>,
    contents: Mutex<HashMap<String, Vec<u8>>>,
    changes: Mutex<Vec<(i64, Change)>>,
    cursor: Mutex<AccountCursor>,
    next_id: AtomicUsize,
    offline: AtomicBool,
    chunk_delay: Mutex<Option<Duration>>,
    pub calls: Calls,
}

impl FakeDrive {
    pub fn new(root_id: &str, sequence: i64) -> Self {
        let drive = Self {
            items: Mutex::new(HashMap::new()),
            contents: Mutex::new(HashMap::new()),
            changes: Mutex::new(Vec::new()),
            cursor: Mutex::new(AccountCursor {
                root_id: root_id.into(),
                sequence,
            }),
            next_id: AtomicUsize::new(1),
            offline: AtomicBool::new(false),
            chunk_delay: Mutex::new(None),
            calls: Calls::default(),
        };
        drive.put(folder(root_id, None, "My Drive"));
        drive
    }

    pub fn put(&self, item: DriveItem) {
        self.items.lock().insert(item.id.clone(), item);
    }

    pub fn put_file(&self, item: DriveItem, content: &[u8]) {
        self.contents.lock().insert(item.id.clone(), content.to_vec());
        self.put(item);
    }

    pub fn item(&self, id: &str) -> Option<DriveItem> {
        self.items.lock().get(id).cloned()
    }

    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        self.contents.lock().get(id).cloned()
    }

    /// Records a change at the next sequence number and applies it.
    pub fn push_change(&self, change: Change) -> i64 {
        let mut cursor = self.cursor.lock();
        cursor.sequence += 1;
        if let Some(item) = &change.file {
            self.put(item.clone());
        } else if change.deleted {
            self.items.lock().remove(&change.file_id);
        }
        self.changes.lock().push((cursor.sequence, change));
        cursor.sequence
    }

    pub fn set_sequence(&self, sequence: i64) {
        self.cursor.lock().sequence = sequence;
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_chunk_delay(&self, delay: Option<Duration>) {
        *self.chunk_delay.lock() = delay;
    }

    fn check_online(&self) -> Result<(), DriveError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DriveError::Api {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: "offline".into(),
                retry_after: None,
            });
        }
        Ok(())
    }

    fn existing(&self, id: &str) -> Result<DriveItem, DriveError> {
        self.item(id)
            .ok_or_else(|| DriveError::NotFound(id.to_string()))
    }

    fn update(
        &self,
        id: &str,
        apply: impl FnOnce(&mut DriveItem),
    ) -> Result<DriveItem, DriveError> {
        self.check_online()?;
        self.calls.mutations.fetch_add(1, Ordering::SeqCst);
        let mut items = self.items.lock();
        let item = items
            .get_mut(id)
            .ok_or_else(|| DriveError::NotFound(id.to_string()))?;
        apply(item);
        Ok(item.clone())
    }

    fn fresh_id(&self) -> String {
        format!("new-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl RemoteDrive for FakeDrive {
    async fn fetch_item(&self, id: &str) -> Result<DriveItem, DriveError> {
        self.calls.fetch_item.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let id = if id == "root" {
            self.cursor.lock().root_id.clone()
        } else {
            id.to_string()
        };
        self.existing(&id)
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<DriveItem>, DriveError> {
        self.calls.list_children.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let mut children: Vec<DriveItem> = self
            .items
            .lock()
            .values()
            .filter(|item| item.parent_id() == Some(parent_id) && !item.is_trashed())
            .cloned()
            .collect();
        children.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(children)
    }

    async fn list_changes(&self, since_sequence: i64) -> Result<ChangeList, DriveError> {
        self.calls.list_changes.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let changes = self
            .changes
            .lock()
            .iter()
            .filter(|(sequence, _)| *sequence > since_sequence)
            .map(|(_, change)| change.clone())
            .collect();
        Ok(ChangeList {
            changes,
            new_sequence: self.cursor.lock().sequence,
        })
    }

    async fn fetch_account_cursor(&self) -> Result<AccountCursor, DriveError> {
        self.calls.account.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        Ok(self.cursor.lock().clone())
    }

    async fn download(&self, item: &DriveItem) -> Result<ByteStream, DriveError> {
        self.calls.download.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let content = self
            .content(&item.id)
            .ok_or_else(|| DriveError::NotDownloadable(item.id.clone()))?;
        let delay = *self.chunk_delay.lock();
        let chunks: Vec<Vec<u8>> = content.chunks(4).map(<[u8]>::to_vec).collect();
        let stream = futures_util::stream::iter(chunks).then(move |chunk| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(chunk)
        });
        Ok(Box::pin(stream))
    }

    async fn upload_content(&self, id: &str, source: &Path) -> Result<DriveItem, DriveError> {
        self.calls.upload.fetch_add(1, Ordering::SeqCst);
        let content = tokio::fs::read(source).await?;
        let modified = OffsetDateTime::now_utc().unix_timestamp() + 1;
        let item = self.update(id, |item| {
            item.file_size = Some(content.len() as u64);
            item.md5_checksum = Some(format!("{:x}", md5::compute(&content)));
            item.modified_date = Some(rfc3339(modified));
        })?;
        self.contents.lock().insert(id.to_string(), content);
        Ok(item)
    }

    async fn insert(
        &self,
        parent_id: &str,
        title: &str,
        mime_type: &str,
        source: Option<&Path>,
    ) -> Result<DriveItem, DriveError> {
        self.check_online()?;
        self.existing(parent_id)?;
        self.calls.mutations.fetch_add(1, Ordering::SeqCst);
        let id = self.fresh_id();
        let item = if mime_type == FOLDER_MIME_TYPE {
            folder(&id, Some(parent_id), title)
        } else {
            let content = match source {
                Some(source) => tokio::fs::read(source).await?,
                None => Vec::new(),
            };
            let mut item = file(
                &id,
                parent_id,
                title,
                &content,
                OffsetDateTime::now_utc().unix_timestamp(),
            );
            item.mime_type = mime_type.into();
            self.contents.lock().insert(id.clone(), content);
            item
        };
        self.put(item.clone());
        Ok(item)
    }

    async fn move_item(
        &self,
        id: &str,
        from_parent: &str,
        to_parent: &str,
    ) -> Result<DriveItem, DriveError> {
        self.existing(to_parent)?;
        self.update(id, |item| {
            item.parents.retain(|parent| parent.id != from_parent);
            item.parents.insert(0, ParentRef { id: to_parent.into() });
        })
    }

    async fn copy_item(
        &self,
        id: &str,
        parent_id: &str,
        title: &str,
    ) -> Result<DriveItem, DriveError> {
        self.check_online()?;
        let source = self.existing(id)?;
        self.calls.mutations.fetch_add(1, Ordering::SeqCst);
        let new_id = self.fresh_id();
        let copy = DriveItem {
            id: new_id.clone(),
            title: title.into(),
            download_url: source.download_url.as_ref().map(|_| format!("https://fake/{new_id}")),
            parents: vec![ParentRef { id: parent_id.into() }],
            labels: Labels::default(),
            ..source
        };
        if let Some(content) = self.content(id) {
            self.contents.lock().insert(new_id, content);
        }
        self.put(copy.clone());
        Ok(copy)
    }

    async fn rename(&self, id: &str, title: &str) -> Result<DriveItem, DriveError> {
        self.update(id, |item| item.title = title.into())
    }

    async fn trash(&self, id: &str) -> Result<DriveItem, DriveError> {
        self.update(id, |item| item.labels.trashed = true)
    }

    async fn untrash(&self, id: &str) -> Result<DriveItem, DriveError> {
        self.update(id, |item| item.labels.trashed = false)
    }
}

/// Cache plus transfer context over `drive`, persisting under `dir`.
pub(crate) fn context(drive: &Arc<FakeDrive>, dir: &Path) -> TransferContext {
    let store = SnapshotStore::new(AccountPaths::new(&dir.join("data"), "acct"));
    TransferContext {
        remote: drive.clone(),
        cache: Arc::new(MetadataCache::new(
            drive.clone(),
            store,
            CacheConfig::default(),
        )),
        download_root: dir.join("files"),
    }
}
