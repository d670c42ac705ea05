//! On-disk state helpers
//!
//! Every persisted file in the daemon goes through these two functions:
//! atomic write (temp + rename) and load-with-quarantine. A state file that
//! fails to parse is renamed aside with a timestamp suffix and the caller
//! starts fresh; stale daemon state must never block startup.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error at {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Write `value` as JSON to `path` atomically.
///
/// The temp file lives in the same directory as the target so the rename
/// never crosses filesystems.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    let json = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Serde {
        path: path.to_path_buf(),
        source: e,
    })?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| StoreError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
}

/// Load a JSON state file, quarantining it if unreadable.
///
/// Returns `None` when the file does not exist or was quarantined; the
/// caller starts from a fresh default either way.
pub fn load_json_or_quarantine<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to read state file");
            return None;
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            let quarantined = quarantine_path(path, &bytes);
            tracing::error!(
                path = %path.display(),
                quarantined = %quarantined.display(),
                error = %e,
                "state file corrupt; quarantining and starting fresh"
            );
            if let Err(rename_err) = std::fs::rename(path, &quarantined) {
                tracing::error!(
                    path = %path.display(),
                    error = %rename_err,
                    "failed to quarantine corrupt state file"
                );
            }
            None
        }
    }
}

/// Timestamp plus a short content hash, so repeated corruption within one
/// second never overwrites earlier evidence.
fn quarantine_path(path: &Path, bytes: &[u8]) -> PathBuf {
    use sha2::{Digest, Sha256};

    let ts = chrono::Utc::now().format("%Y%m%dT%H%M%S");
    let mut digest = format!("{:x}", Sha256::digest(bytes));
    digest.truncate(8);
    let name = path
        .file_name()
        .map_or_else(|| "state".to_string(), |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!("{name}.corrupt-{ts}-{digest}"))
}
