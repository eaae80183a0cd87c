use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Suffix of files a download is still writing into.
pub const PARTIAL_SUFFIX: &str = "partial";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("item id is empty")]
    Empty,
    #[error("item id contains unsupported component: {0}")]
    UnsupportedComponent(String),
}

/// Directory holding the local copy of item `id`: `<root>/<id>`.
pub fn item_dir(download_root: &Path, id: &str) -> Result<PathBuf, PathError> {
    if id.is_empty() {
        return Err(PathError::Empty);
    }
    let mut components = Path::new(id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(download_root.join(id)),
        _ => Err(PathError::UnsupportedComponent(id.to_string())),
    }
}

/// Local copy of item `id`: `<root>/<id>/<sanitized title>`.
pub fn item_path(download_root: &Path, id: &str, title: &str) -> Result<PathBuf, PathError> {
    Ok(item_dir(download_root, id)?.join(sanitize_title(title)))
}

/// Maps a remote title onto a single safe local file name.
pub fn sanitize_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return "untitled".to_string();
    }
    trimmed.to_string()
}

pub fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}{PARTIAL_SUFFIX}",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

pub fn is_partial(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(PARTIAL_SUFFIX))
}

/// Splits `<root>/<id>/<file>` into `(id, file)`. Anything shallower or deeper
/// is not a cached item file.
pub fn split_item_path(download_root: &Path, path: &Path) -> Option<(String, String)> {
    let relative = path.strip_prefix(download_root).ok()?;
    let mut parts = relative.components();
    let (Some(Component::Normal(id)), Some(Component::Normal(file)), None) =
        (parts.next(), parts.next(), parts.next())
    else {
        return None;
    };
    Some((
        id.to_string_lossy().into_owned(),
        file.to_string_lossy().into_owned(),
    ))
}

/// Case-insensitive key used for advisory path locks.
pub fn lock_key(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/").to_lowercase()
}
