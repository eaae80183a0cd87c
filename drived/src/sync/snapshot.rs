use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::cache::CacheEntry;

const ENTRY_SUFFIX: &str = "entry.json";
const CHILDREN_SUFFIX: &str = "children.json";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("corrupt cache record discarded: {}", path.display())]
    Corrupt { path: PathBuf },
}

/// Per-account persistence layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountPaths {
    pub metadata_dir: PathBuf,
    pub root_id_file: PathBuf,
    pub change_id_file: PathBuf,
}

impl AccountPaths {
    pub fn new(data_dir: &Path, account: &str) -> Self {
        let base = data_dir.join(safe_stem(account));
        Self {
            metadata_dir: base.join("metadata"),
            root_id_file: base.join("root_id"),
            change_id_file: base.join("change_id"),
        }
    }
}

/// The persisted half of the sync cursor. Either field may be missing after a
/// first run or a partial write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedCursor {
    pub root_id: Option<String>,
    pub sequence: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryRecord {
    generation: u64,
    entry: CacheEntry,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChildrenRecord {
    generation: u64,
    parent_id: String,
    children: Vec<CacheEntry>,
}

/// Directory snapshots: one entry record and one children record per cached
/// directory, paired by a shared generation stamp.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    paths: AccountPaths,
}

impl SnapshotStore {
    pub fn new(paths: AccountPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &AccountPaths {
        &self.paths
    }

    pub async fn write_directory(
        &self,
        entry: &CacheEntry,
        children: &[CacheEntry],
    ) -> Result<(), SnapshotError> {
        tokio::fs::create_dir_all(&self.paths.metadata_dir).await?;
        let generation = next_generation();
        let children_record = ChildrenRecord {
            generation,
            parent_id: entry.id.clone(),
            children: children.to_vec(),
        };
        let entry_record = EntryRecord {
            generation,
            entry: entry.clone(),
        };
        write_atomic(
            &self.children_path(&entry.id),
            &serde_json::to_vec(&children_record)?,
        )
        .await?;
        write_atomic(
            &self.entry_path(&entry.id),
            &serde_json::to_vec(&entry_record)?,
        )
        .await?;
        Ok(())
    }

    /// Reads a directory snapshot. `Ok(None)` is a plain miss; a record that
    /// cannot be trusted is deleted and reported as `Corrupt`.
    pub async fn read_directory(
        &self,
        id: &str,
    ) -> Result<Option<(CacheEntry, Vec<CacheEntry>)>, SnapshotError> {
        let entry_path = self.entry_path(id);
        let Some(entry_bytes) = read_optional(&entry_path).await? else {
            return Ok(None);
        };
        let entry: EntryRecord = match serde_json::from_slice(&entry_bytes) {
            Ok(record) => record,
            Err(_) => return Err(self.discard(id, entry_path).await),
        };

        let children_path = self.children_path(id);
        let children: Option<ChildrenRecord> = read_optional(&children_path)
            .await?
            .and_then(|bytes| serde_json::from_slice(&bytes).ok());
        match children {
            Some(children)
                if children.generation == entry.generation
                    && children.parent_id == id
                    && entry.entry.id == id =>
            {
                Ok(Some((entry.entry, children.children)))
            }
            _ => Err(self.discard(id, children_path).await),
        }
    }

    /// Ids of every directory with a persisted entry record.
    pub async fn list_directories(&self) -> Result<Vec<String>, SnapshotError> {
        let mut files = match tokio::fs::read_dir(&self.paths.metadata_dir).await {
            Ok(files) => files,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let suffix = format!(".{ENTRY_SUFFIX}");
        let mut ids = Vec::new();
        while let Some(file) = files.next_entry().await? {
            let name = file.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_suffix(&suffix).and_then(unescape_stem) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub async fn remove(&self, id: &str) -> Result<(), SnapshotError> {
        remove_if_exists(&self.entry_path(id)).await?;
        remove_if_exists(&self.children_path(id)).await?;
        Ok(())
    }

    pub async fn read_cursor(&self) -> PersistedCursor {
        let root_id = read_optional(&self.paths.root_id_file)
            .await
            .ok()
            .flatten()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let sequence = read_optional(&self.paths.change_id_file)
            .await
            .ok()
            .flatten()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|value| value.trim().parse::<i64>().ok());
        PersistedCursor { root_id, sequence }
    }

    pub async fn write_cursor(&self, root_id: &str, sequence: i64) -> Result<(), SnapshotError> {
        write_atomic(&self.paths.root_id_file, root_id.as_bytes()).await?;
        write_atomic(&self.paths.change_id_file, sequence.to_string().as_bytes()).await?;
        Ok(())
    }

    /// Drops every snapshot and both cursor files.
    pub async fn clear(&self) -> Result<(), SnapshotError> {
        match tokio::fs::remove_dir_all(&self.paths.metadata_dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        remove_if_exists(&self.paths.root_id_file).await?;
        remove_if_exists(&self.paths.change_id_file).await?;
        Ok(())
    }

    async fn discard(&self, id: &str, culprit: PathBuf) -> SnapshotError {
        if let Err(err) = self.remove(id).await {
            tracing::warn!(id, error = %err, "failed to delete corrupt snapshot");
        }
        SnapshotError::Corrupt { path: culprit }
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.paths
            .metadata_dir
            .join(format!("{}.{ENTRY_SUFFIX}", safe_stem(id)))
    }

    fn children_path(&self, id: &str) -> PathBuf {
        self.paths
            .metadata_dir
            .join(format!("{}.{CHILDREN_SUFFIX}", safe_stem(id)))
    }
}

/// Escapes anything outside `[A-Za-z0-9_-]` so ids map to unique file names.
fn safe_stem(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn unescape_stem(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut at = 0;
    while at < bytes.len() {
        if bytes[at] == b'%' {
            let hex = stem.get(at + 1..at + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            at += 3;
        } else {
            out.push(bytes[at]);
            at += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn next_generation() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default()
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

async fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
