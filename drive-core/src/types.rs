use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default, deserialize_with = "de_opt_u64")]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub modified_date: Option<String>,
    #[serde(default)]
    pub md5_checksum: Option<String>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub parents: Vec<ParentRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Labels {
    #[serde(default)]
    pub trashed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ParentRef {
    pub id: String,
}

impl DriveItem {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    pub fn is_trashed(&self) -> bool {
        self.labels.trashed
    }

    /// First listed parent. The cache mirrors a single-parent tree.
    pub fn parent_id(&self) -> Option<&str> {
        self.parents.first().map(|parent| parent.id.as_str())
    }

    /// Remote modification time as unix seconds, if present and well formed.
    pub fn modified_unix(&self) -> Option<i64> {
        let value = self.modified_date.as_deref()?;
        OffsetDateTime::parse(value, &Rfc3339)
            .ok()
            .map(|parsed| parsed.unix_timestamp())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub file_id: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub file: Option<DriveItem>,
}

impl Change {
    /// Deleted outright or moved to the trash.
    pub fn is_removal(&self) -> bool {
        self.deleted || self.file.as_ref().is_none_or(DriveItem::is_trashed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeList {
    pub changes: Vec<Change>,
    pub new_sequence: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountCursor {
    pub root_id: String,
    pub sequence: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct About {
    pub root_folder_id: String,
    #[serde(deserialize_with = "de_i64")]
    pub largest_change_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FileListPage {
    #[serde(default)]
    pub items: Vec<DriveItem>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ChangeListPage {
    #[serde(default)]
    pub items: Vec<Change>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub largest_change_id: Option<i64>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

// The v2 API encodes int64 values as JSON strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum Int64Repr {
    Num(i64),
    Str(String),
}

impl Int64Repr {
    fn value<E: serde::de::Error>(self) -> Result<i64, E> {
        match self {
            Int64Repr::Num(value) => Ok(value),
            Int64Repr::Str(value) => value.trim().parse().map_err(E::custom),
        }
    }
}

fn de_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    Int64Repr::deserialize(deserializer)?.value()
}

fn de_opt_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Option::<Int64Repr>::deserialize(deserializer)?
        .map(Int64Repr::value)
        .transpose()
}

fn de_opt_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    de_opt_i64(deserializer)?
        .map(|value| u64::try_from(value).map_err(serde::de::Error::custom))
        .transpose()
}
