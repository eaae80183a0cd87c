use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::client::DriveError;
use crate::types::{AccountCursor, ChangeList, DriveItem};

/// Chunked body of a download.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, DriveError>> + Send>>;

/// Everything the cache daemon needs from the remote store.
///
/// `DriveClient` implements this over HTTP; tests substitute in-memory fakes.
#[async_trait]
pub trait RemoteDrive: Send + Sync {
    async fn fetch_item(&self, id: &str) -> Result<DriveItem, DriveError>;

    /// All non-trashed children of `parent_id`, across pages.
    async fn list_children(&self, parent_id: &str) -> Result<Vec<DriveItem>, DriveError>;

    /// Changes strictly after `since_sequence`, in feed order.
    async fn list_changes(&self, since_sequence: i64) -> Result<ChangeList, DriveError>;

    async fn fetch_account_cursor(&self) -> Result<AccountCursor, DriveError>;

    async fn download(&self, item: &DriveItem) -> Result<ByteStream, DriveError>;

    async fn upload_content(&self, id: &str, source: &Path) -> Result<DriveItem, DriveError>;

    async fn insert(
        &self,
        parent_id: &str,
        title: &str,
        mime_type: &str,
        source: Option<&Path>,
    ) -> Result<DriveItem, DriveError>;

    async fn move_item(
        &self,
        id: &str,
        from_parent: &str,
        to_parent: &str,
    ) -> Result<DriveItem, DriveError>;

    async fn copy_item(
        &self,
        id: &str,
        parent_id: &str,
        title: &str,
    ) -> Result<DriveItem, DriveError>;

    async fn rename(&self, id: &str, title: &str) -> Result<DriveItem, DriveError>;

    async fn trash(&self, id: &str) -> Result<DriveItem, DriveError>;

    async fn untrash(&self, id: &str) -> Result<DriveItem, DriveError>;
}
