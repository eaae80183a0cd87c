use drive_core::{DriveClient, DriveError, RemoteDrive};
use futures_util::StreamExt;
use serde_json::json;
use wiremock::matchers::{body_bytes, body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn fetch_account_cursor_reads_root_and_largest_change() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v2/about"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rootFolderId": "root-1",
            "largestChangeId": "14"
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let cursor = client.fetch_account_cursor().await.unwrap();

    assert_eq!(cursor.root_id, "root-1");
    assert_eq!(cursor.sequence, 14);
}

#[tokio::test]
async fn fetch_item_maps_404_to_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v2/files/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client.fetch_item("gone").await.unwrap_err();

    assert!(matches!(err, DriveError::NotFound(id) if id == "gone"));
}

#[tokio::test]
async fn list_children_follows_page_tokens() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v2/files"))
        .and(query_param("pageToken", "next"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{ "id": "b", "title": "B.txt", "parents": [{"id": "p"}] }]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/drive/v2/files"))
        .and(query_param("q", "'p' in parents and trashed = false"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{ "id": "a", "title": "A.txt", "parents": [{"id": "p"}] }],
            "nextPageToken": "next"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let children = client.list_children("p").await.unwrap();

    let ids: Vec<_> = children.iter().map(|item| item.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
}

#[tokio::test]
async fn list_changes_starts_after_sequence_and_reports_largest() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v2/changes"))
        .and(query_param("startChangeId", "11"))
        .and(query_param("includeDeleted", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                { "fileId": "x", "deleted": false, "file": {
                    "id": "x", "title": "X", "labels": { "trashed": true },
                    "parents": [{"id": "p"}]
                }},
                { "fileId": "y", "deleted": true }
            ],
            "largestChangeId": "14"
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let list = client.list_changes(10).await.unwrap();

    assert_eq!(list.new_sequence, 14);
    assert_eq!(list.changes.len(), 2);
    assert!(list.changes.iter().all(|change| change.is_removal()));
}

#[tokio::test]
async fn download_streams_body_from_download_url() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/content/f1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let item = drive_core::DriveItem {
        id: "f1".into(),
        download_url: Some(format!("{}/content/f1", server.uri())),
        ..Default::default()
    };
    let mut stream = client.download(&item).await.unwrap();
    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        body.extend(chunk.unwrap());
    }

    assert_eq!(body, b"hello");
}

#[tokio::test]
async fn download_without_url_is_rejected() {
    let server = MockServer::start().await;
    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let item = drive_core::DriveItem {
        id: "folder".into(),
        ..Default::default()
    };

    let err = client.download(&item).await.err().unwrap();
    assert!(matches!(err, DriveError::NotDownloadable(_)));
}

#[tokio::test]
async fn upload_content_puts_media_body() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/upload/drive/v2/files/f1"))
        .and(query_param("uploadType", "media"))
        .and(body_bytes(b"payload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "f1", "title": "A.txt", "fileSize": "7"
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("A.txt");
    std::fs::write(&source, b"payload").unwrap();

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let item = client.upload_content("f1", &source).await.unwrap();

    assert_eq!(item.file_size, Some(7));
}

#[tokio::test]
async fn rename_patches_title() {
    let server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path("/drive/v2/files/f1"))
        .and(body_json(json!({ "title": "B.txt" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "f1", "title": "B.txt"
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let item = client.rename("f1", "B.txt").await.unwrap();

    assert_eq!(item.title, "B.txt");
}

#[tokio::test]
async fn move_item_swaps_parents() {
    let server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path("/drive/v2/files/f1"))
        .and(query_param("addParents", "new"))
        .and(query_param("removeParents", "old"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "f1", "title": "A.txt", "parents": [{"id": "new"}]
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let item = client.move_item("f1", "old", "new").await.unwrap();

    assert_eq!(item.parent_id(), Some("new"));
}

#[tokio::test]
async fn trash_posts_action_and_surfaces_rate_limit() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/drive/v2/files/f1/trash"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client.trash("f1").await.unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(err.retry_after(), Some(std::time::Duration::from_secs(3)));
}
