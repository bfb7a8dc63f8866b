use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path} is not valid UTF-8")]
    NotText { path: PathBuf },
}

/// Transforms a loaded file's text before it is stored in the body.
pub type Operator = Box<dyn Fn(String) -> String + Send + Sync>;

/// Loads a directory tree into a JSON object of strings.
///
/// Files are keyed by their name up to the first `.` (`index.html` becomes
/// `index`), directories by their full name. Each operator is applied to file
/// content in order.
pub fn load_files(dir: &Path, operators: &[Operator]) -> Result<Map<String, Value>, LoadError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| LoadError::Io { path, source }
    };

    let mut entries = fs::read_dir(dir)
        .map_err(io_err(dir))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err(dir))?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut out = Map::new();
    for entry in entries {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let meta = fs::metadata(&path).map_err(io_err(&path))?;
        if meta.is_file() {
            let bytes = fs::read(&path).map_err(io_err(&path))?;
            let mut content =
                String::from_utf8(bytes).map_err(|_| LoadError::NotText { path: path.clone() })?;
            for op in operators {
                content = op(content);
            }
            let key = name.split('.').next().unwrap_or(&name).to_string();
            out.insert(key, Value::String(content));
        } else if meta.is_dir() {
            out.insert(name, Value::Object(load_files(&path, operators)?));
        }
    }
    Ok(out)
}
