use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RootError {
    #[error("cannot stat attachment root {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("attachment root is not a directory: {0}")]
    NotADirectory(PathBuf),
}

/// A local directory mirrored into the document's attachments under `prefix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRoot {
    path: PathBuf,
    prefix: String,
}

impl AttachmentRoot {
    pub fn new(path: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self, RootError> {
        let path = path.into();
        let meta = std::fs::metadata(&path).map_err(|source| RootError::Stat {
            path: path.clone(),
            source,
        })?;
        if !meta.is_dir() {
            return Err(RootError::NotADirectory(path));
        }
        // notify reports canonical paths on some platforms (/private/var on macOS).
        let path = path.canonicalize().unwrap_or(path);
        Ok(Self {
            path,
            prefix: prefix.into().trim_matches('/').to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Attachment key for a native path under this root, or `None` when the
    /// path is outside the root or hidden.
    pub fn key_for(&self, native: &Path) -> Option<String> {
        let relative = relative_path(&self.path, native)?;
        Some(attachment_key(&self.prefix, &relative))
    }

    /// Every visible file under the root, paired with its attachment key.
    /// Unreadable directories are skipped.
    pub async fn walk(&self) -> Vec<(String, PathBuf)> {
        walk_files(&self.path)
            .await
            .into_iter()
            .filter_map(|path| self.key_for(&path).map(|key| (key, path)))
            .collect()
    }
}

/// Joins a root prefix and a forward-slashed relative path into a document
/// attachment key without a leading slash.
pub fn attachment_key(prefix: &str, relative: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let relative = relative.trim_start_matches('/');
    if prefix.is_empty() {
        relative.to_string()
    } else {
        format!("{prefix}/{relative}")
    }
}

/// Root-relative, forward-slashed form of `path`. Rejects paths outside the
/// root, the root itself, `..` components and dot-prefixed components.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_string_lossy();
                if part.starts_with('.') {
                    return None;
                }
                parts.push(part.into_owned());
            }
            Component::CurDir => continue,
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Recursively lists regular files below `dir`, skipping dot entries and
/// anything that vanishes or cannot be read mid-walk.
pub async fn walk_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&current).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    files
}
