use std::path::Path;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::json;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::remote::{ByteStream, RemoteDrive};
use crate::types::{
    About, AccountCursor, ChangeList, ChangeListPage, DriveItem, FileListPage,
};

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com";
const PAGE_SIZE: u32 = 1000;

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<Duration>,
    },
    #[error("item no longer exists: {0}")]
    NotFound(String),
    #[error("item has no download url: {0}")]
    NotDownloadable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn get_about(&self) -> Result<AccountCursor, DriveError> {
        let url = self.endpoint("/drive/v2/about")?;
        let about: About = Self::handle_response(self.authorized(self.http.get(url)), None).await?;
        Ok(AccountCursor {
            root_id: about.root_folder_id,
            sequence: about.largest_change_id,
        })
    }

    pub async fn get_file(&self, id: &str) -> Result<DriveItem, DriveError> {
        let url = self.endpoint(&format!("/drive/v2/files/{id}"))?;
        Self::handle_response(self.authorized(self.http.get(url)), Some(id)).await
    }

    pub async fn list_children_page(
        &self,
        parent_id: &str,
        page_token: Option<&str>,
    ) -> Result<(Vec<DriveItem>, Option<String>), DriveError> {
        let mut url = self.endpoint("/drive/v2/files")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("q", &format!("'{parent_id}' in parents and trashed = false"));
            query.append_pair("maxResults", &PAGE_SIZE.to_string());
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }
        let page: FileListPage =
            Self::handle_response(self.authorized(self.http.get(url)), Some(parent_id)).await?;
        Ok((page.items, page.next_page_token))
    }

    pub async fn list_changes_all(&self, since_sequence: i64) -> Result<ChangeList, DriveError> {
        let mut changes = Vec::new();
        let mut new_sequence = since_sequence;
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.endpoint("/drive/v2/changes")?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("startChangeId", &(since_sequence + 1).to_string());
                query.append_pair("includeDeleted", "true");
                query.append_pair("maxResults", &PAGE_SIZE.to_string());
                if let Some(token) = page_token.as_deref() {
                    query.append_pair("pageToken", token);
                }
            }
            let page: ChangeListPage =
                Self::handle_response(self.authorized(self.http.get(url)), None).await?;
            if let Some(largest) = page.largest_change_id {
                new_sequence = new_sequence.max(largest);
            }
            changes.extend(page.items);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(ChangeList {
            changes,
            new_sequence,
        })
    }

    pub async fn upload_from_path(&self, id: &str, source: &Path) -> Result<DriveItem, DriveError> {
        let mut url = self.endpoint(&format!("/upload/drive/v2/files/{id}"))?;
        url.query_pairs_mut().append_pair("uploadType", "media");
        let file = tokio::fs::File::open(source).await?;
        let stream = ReaderStream::new(file);
        let body = reqwest::Body::wrap_stream(stream);
        Self::handle_response(self.authorized(self.http.put(url).body(body)), Some(id)).await
    }

    pub async fn patch_file(
        &self,
        id: &str,
        body: serde_json::Value,
        add_parent: Option<&str>,
        remove_parent: Option<&str>,
    ) -> Result<DriveItem, DriveError> {
        let mut url = self.endpoint(&format!("/drive/v2/files/{id}"))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(parent) = add_parent {
                query.append_pair("addParents", parent);
            }
            if let Some(parent) = remove_parent {
                query.append_pair("removeParents", parent);
            }
        }
        Self::handle_response(self.authorized(self.http.patch(url).json(&body)), Some(id)).await
    }

    async fn post_file_action(&self, id: &str, action: &str) -> Result<DriveItem, DriveError> {
        let url = self.endpoint(&format!("/drive/v2/files/{id}/{action}"))?;
        Self::handle_response(self.authorized(self.http.post(url)), Some(id)).await
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, DriveError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        request: RequestBuilder,
        id: Option<&str>,
    ) -> Result<T, DriveError> {
        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(response.json::<T>().await?);
        }
        let status = response.status();
        if status == StatusCode::NOT_FOUND
            && let Some(id) = id
        {
            return Err(DriveError::NotFound(id.to_string()));
        }
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        Err(DriveError::Api {
            status,
            body,
            retry_after,
        })
    }
}

#[async_trait]
impl RemoteDrive for DriveClient {
    async fn fetch_item(&self, id: &str) -> Result<DriveItem, DriveError> {
        self.get_file(id).await
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<DriveItem>, DriveError> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let (page, next) = self
                .list_children_page(parent_id, page_token.as_deref())
                .await?;
            items.extend(page);
            match next {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(items)
    }

    async fn list_changes(&self, since_sequence: i64) -> Result<ChangeList, DriveError> {
        self.list_changes_all(since_sequence).await
    }

    async fn fetch_account_cursor(&self) -> Result<AccountCursor, DriveError> {
        self.get_about().await
    }

    async fn download(&self, item: &DriveItem) -> Result<ByteStream, DriveError> {
        let href = item
            .download_url
            .as_deref()
            .ok_or_else(|| DriveError::NotDownloadable(item.id.clone()))?;
        let url = Url::parse(href)?;
        let response = self.authorized(self.http.get(url)).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(DriveError::NotFound(item.id.clone()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DriveError::Api {
                status,
                body,
                retry_after: None,
            });
        }
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(DriveError::from));
        Ok(Box::pin(stream))
    }

    async fn upload_content(&self, id: &str, source: &Path) -> Result<DriveItem, DriveError> {
        self.upload_from_path(id, source).await
    }

    async fn insert(
        &self,
        parent_id: &str,
        title: &str,
        mime_type: &str,
        source: Option<&Path>,
    ) -> Result<DriveItem, DriveError> {
        let url = self.endpoint("/drive/v2/files")?;
        let body = json!({
            "title": title,
            "mimeType": mime_type,
            "parents": [{ "id": parent_id }],
        });
        let created: DriveItem =
            Self::handle_response(self.authorized(self.http.post(url).json(&body)), None).await?;
        match source {
            Some(source) => self.upload_from_path(&created.id, source).await,
            None => Ok(created),
        }
    }

    async fn move_item(
        &self,
        id: &str,
        from_parent: &str,
        to_parent: &str,
    ) -> Result<DriveItem, DriveError> {
        self.patch_file(id, json!({}), Some(to_parent), Some(from_parent))
            .await
    }

    async fn copy_item(
        &self,
        id: &str,
        parent_id: &str,
        title: &str,
    ) -> Result<DriveItem, DriveError> {
        let url = self.endpoint(&format!("/drive/v2/files/{id}/copy"))?;
        let body = json!({
            "title": title,
            "parents": [{ "id": parent_id }],
        });
        Self::handle_response(self.authorized(self.http.post(url).json(&body)), Some(id)).await
    }

    async fn rename(&self, id: &str, title: &str) -> Result<DriveItem, DriveError> {
        self.patch_file(id, json!({ "title": title }), None, None)
            .await
    }

    async fn trash(&self, id: &str) -> Result<DriveItem, DriveError> {
        self.post_file_action(id, "trash").await
    }

    async fn untrash(&self, id: &str) -> Result<DriveItem, DriveError> {
        self.post_file_action(id, "untrash").await
    }
}

impl DriveError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DriveError::Api { status, .. } => Some(classify_api_status(*status)),
            DriveError::NotFound(_) => Some(ApiErrorClass::Permanent),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            DriveError::Request(_) => true,
            _ => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DriveError::NotFound(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DriveError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(SystemTime::now()).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert_eq!(
            classify_api_status(StatusCode::UNAUTHORIZED),
            ApiErrorClass::Auth
        );
        assert_eq!(
            classify_api_status(StatusCode::TOO_MANY_REQUESTS),
            ApiErrorClass::RateLimit
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_GATEWAY),
            ApiErrorClass::Transient
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_REQUEST),
            ApiErrorClass::Permanent
        );
    }

    #[test]
    fn parses_retry_after_seconds() {
        assert_eq!(parse_retry_after("7"), Some(Duration::from_secs(7)));
        assert_eq!(
            parse_retry_after("Thu, 01 Jan 1970 00:00:00 GMT"),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon"), None);
    }
}
