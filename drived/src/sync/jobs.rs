//! Concrete transfer bodies, one per operation kind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use drive_core::{DriveItem, FOLDER_MIME_TYPE};
use filetime::FileTime;
use futures_util::StreamExt;
use md5::Context;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::cache::CacheEntry;
use super::paths::{item_path, partial_path};
use super::transfer::{
    Progress, TransferContext, TransferError, TransferJob, TransferKind, TransferTarget,
};

/// Streams the remote content into `<root>/<id>/<title>`.
pub struct DownloadJob {
    target: TransferTarget,
    item: DriveItem,
}

impl DownloadJob {
    pub fn new(entry: &CacheEntry) -> Self {
        Self {
            target: TransferTarget::from_entry(entry),
            item: entry.to_item(),
        }
    }
}

#[async_trait]
impl TransferJob for DownloadJob {
    fn kind(&self) -> TransferKind {
        TransferKind::Download
    }

    fn target(&self) -> &TransferTarget {
        &self.target
    }

    async fn execute(
        &self,
        ctx: &TransferContext,
        progress: &Progress<'_>,
    ) -> Result<(), TransferError> {
        if self.item.is_folder() {
            return Err(TransferError::IsFolder(self.item.id.clone()));
        }
        let target = item_path(&ctx.download_root, &self.item.id, &self.item.title)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(&target);
        if let Err(err) = self.write_partial(ctx, progress, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err);
        }
        tokio::fs::rename(&partial, &target).await?;
        if let Some(modified) = self.item.modified_unix() {
            stamp_mtime(&target, modified)?;
        }
        debug!(id = %self.item.id, path = %target.display(), "download stored");
        Ok(())
    }
}

impl DownloadJob {
    async fn write_partial(
        &self,
        ctx: &TransferContext,
        progress: &Progress<'_>,
        partial: &Path,
    ) -> Result<(), TransferError> {
        let mut stream = ctx.remote.download(&self.item).await?;
        let mut file = tokio::fs::File::create(partial).await?;
        let expected_md5 = self.item.md5_checksum.as_deref();
        let mut md5 = expected_md5.map(|_| Context::new());
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            progress.checkpoint()?;
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            if let Some(ctx) = md5.as_mut() {
                ctx.consume(&chunk);
            }
            written += chunk.len() as u64;
            progress.report_bytes(written, self.item.file_size);
        }

        file.flush().await?;
        file.sync_all().await?;

        if let (Some(expected), Some(ctx)) = (expected_md5, md5) {
            let actual_md5 = format!("{:x}", ctx.compute());
            if actual_md5 != expected.to_ascii_lowercase() {
                return Err(TransferError::IntegrityMismatch {
                    expected_md5: expected.to_ascii_lowercase(),
                    actual_md5,
                });
            }
        }
        Ok(())
    }
}

/// Pushes a locally edited copy back to the remote.
pub struct UploadJob {
    target: TransferTarget,
    source: PathBuf,
}

impl UploadJob {
    pub fn new(entry: &CacheEntry, source: PathBuf) -> Self {
        Self {
            target: TransferTarget::from_entry(entry),
            source,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

#[async_trait]
impl TransferJob for UploadJob {
    fn kind(&self) -> TransferKind {
        TransferKind::Upload
    }

    fn target(&self) -> &TransferTarget {
        &self.target
    }

    async fn execute(
        &self,
        ctx: &TransferContext,
        progress: &Progress<'_>,
    ) -> Result<(), TransferError> {
        if !tokio::fs::try_exists(&self.source).await? {
            return Err(TransferError::Missing(self.source.clone()));
        }
        progress.checkpoint()?;
        let item = ctx
            .remote
            .upload_content(&self.target.id, &self.source)
            .await?;
        ctx.cache.seed(&item, None).await?;
        // The local copy now matches the remote; align mtimes so the upload
        // watcher does not see it as edited again.
        if let Some(modified) = item.modified_unix() {
            stamp_mtime(&self.source, modified)?;
        }
        debug!(id = %item.id, "upload stored");
        Ok(())
    }
}

/// Creates a new file or folder under `parent_id`.
pub struct InsertJob {
    target: TransferTarget,
    parent_id: String,
    mime_type: String,
    source: Option<PathBuf>,
}

impl InsertJob {
    pub fn file(parent_id: &str, title: &str, mime_type: &str, source: Option<PathBuf>) -> Self {
        Self {
            target: TransferTarget::new(parent_id, title, false),
            parent_id: parent_id.to_string(),
            mime_type: mime_type.to_string(),
            source,
        }
    }

    pub fn folder(parent_id: &str, title: &str) -> Self {
        Self {
            target: TransferTarget::new(parent_id, title, true),
            parent_id: parent_id.to_string(),
            mime_type: FOLDER_MIME_TYPE.to_string(),
            source: None,
        }
    }
}

#[async_trait]
impl TransferJob for InsertJob {
    fn kind(&self) -> TransferKind {
        TransferKind::Insert
    }

    fn target(&self) -> &TransferTarget {
        &self.target
    }

    fn local_dir(&self, _download_root: &Path) -> Option<PathBuf> {
        None
    }

    async fn execute(
        &self,
        ctx: &TransferContext,
        progress: &Progress<'_>,
    ) -> Result<(), TransferError> {
        if let Some(source) = &self.source
            && !tokio::fs::try_exists(source).await?
        {
            return Err(TransferError::Missing(source.clone()));
        }
        progress.checkpoint()?;
        let item = ctx
            .remote
            .insert(
                &self.parent_id,
                &self.target.title,
                &self.mime_type,
                self.source.as_deref(),
            )
            .await?;
        ctx.cache.seed(&item, None).await?;
        Ok(())
    }
}

pub struct MoveJob {
    target: TransferTarget,
    from_parent: String,
    to_parent: String,
}

impl MoveJob {
    pub fn new(entry: &CacheEntry, to_parent: &str) -> Self {
        Self {
            target: TransferTarget::from_entry(entry),
            from_parent: entry.parent_id.clone().unwrap_or_default(),
            to_parent: to_parent.to_string(),
        }
    }
}

#[async_trait]
impl TransferJob for MoveJob {
    fn kind(&self) -> TransferKind {
        TransferKind::Move
    }

    fn target(&self) -> &TransferTarget {
        &self.target
    }

    async fn execute(
        &self,
        ctx: &TransferContext,
        progress: &Progress<'_>,
    ) -> Result<(), TransferError> {
        progress.checkpoint()?;
        let item = ctx
            .remote
            .move_item(&self.target.id, &self.from_parent, &self.to_parent)
            .await?;
        ctx.cache.seed(&item, None).await?;
        Ok(())
    }
}

pub struct CopyJob {
    target: TransferTarget,
    parent_id: String,
    title: String,
}

impl CopyJob {
    pub fn new(entry: &CacheEntry, parent_id: &str, title: Option<&str>) -> Self {
        Self {
            target: TransferTarget::from_entry(entry),
            parent_id: parent_id.to_string(),
            title: title.unwrap_or(&entry.title).to_string(),
        }
    }
}

#[async_trait]
impl TransferJob for CopyJob {
    fn kind(&self) -> TransferKind {
        TransferKind::Copy
    }

    fn target(&self) -> &TransferTarget {
        &self.target
    }

    async fn execute(
        &self,
        ctx: &TransferContext,
        progress: &Progress<'_>,
    ) -> Result<(), TransferError> {
        progress.checkpoint()?;
        let item = ctx
            .remote
            .copy_item(&self.target.id, &self.parent_id, &self.title)
            .await?;
        ctx.cache.seed(&item, None).await?;
        Ok(())
    }
}

/// Renames remotely and carries an existing local copy along.
pub struct RenameJob {
    target: TransferTarget,
    new_title: String,
}

impl RenameJob {
    pub fn new(entry: &CacheEntry, new_title: &str) -> Self {
        Self {
            target: TransferTarget::from_entry(entry),
            new_title: new_title.to_string(),
        }
    }
}

#[async_trait]
impl TransferJob for RenameJob {
    fn kind(&self) -> TransferKind {
        TransferKind::Rename
    }

    fn target(&self) -> &TransferTarget {
        &self.target
    }

    async fn execute(
        &self,
        ctx: &TransferContext,
        progress: &Progress<'_>,
    ) -> Result<(), TransferError> {
        progress.checkpoint()?;
        let item = ctx.remote.rename(&self.target.id, &self.new_title).await?;
        ctx.cache.seed(&item, None).await?;

        if !self.target.is_folder {
            let old = item_path(&ctx.download_root, &item.id, &self.target.title)?;
            let new = item_path(&ctx.download_root, &item.id, &item.title)?;
            if old != new && tokio::fs::try_exists(&old).await? {
                tokio::fs::rename(&old, &new).await?;
            }
        }
        Ok(())
    }
}

pub struct TrashJob {
    target: TransferTarget,
}

impl TrashJob {
    pub fn new(entry: &CacheEntry) -> Self {
        Self {
            target: TransferTarget::from_entry(entry),
        }
    }
}

#[async_trait]
impl TransferJob for TrashJob {
    fn kind(&self) -> TransferKind {
        TransferKind::Trash
    }

    fn target(&self) -> &TransferTarget {
        &self.target
    }

    async fn execute(
        &self,
        ctx: &TransferContext,
        progress: &Progress<'_>,
    ) -> Result<(), TransferError> {
        progress.checkpoint()?;
        ctx.remote.trash(&self.target.id).await?;
        // The local copy is left for the cleanup loop, which treats it as an
        // orphan once idle.
        ctx.cache.evict(&self.target.id).await?;
        Ok(())
    }
}

pub struct UntrashJob {
    target: TransferTarget,
}

impl UntrashJob {
    pub fn new(target: TransferTarget) -> Self {
        Self { target }
    }
}

#[async_trait]
impl TransferJob for UntrashJob {
    fn kind(&self) -> TransferKind {
        TransferKind::Untrash
    }

    fn target(&self) -> &TransferTarget {
        &self.target
    }

    async fn execute(
        &self,
        ctx: &TransferContext,
        progress: &Progress<'_>,
    ) -> Result<(), TransferError> {
        progress.checkpoint()?;
        let item = ctx.remote.untrash(&self.target.id).await?;
        ctx.cache.seed(&item, None).await?;
        Ok(())
    }
}

fn stamp_mtime(path: &Path, unix_secs: i64) -> std::io::Result<()> {
    filetime::set_file_mtime(path, FileTime::from_unix_time(unix_secs, 0))
}

#[cfg(test)]
#[path = "jobs_tests.rs"]
mod tests;
