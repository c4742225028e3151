use crate::{NodeLinkError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tokio::fs;
use tracing::debug;

/// Replace `path` with the pretty-printed JSON of `value`.
///
/// The snapshot is written to a sibling temp file and renamed into place, so
/// readers only ever see a complete document.
pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let contents = serde_json::to_vec_pretty(value)
        .map_err(|e| NodeLinkError::Serialization(format!("Failed to encode JSON: {}", e)))?;

    let file_name = path
        .file_name()
        .ok_or_else(|| NodeLinkError::Other(format!("Invalid output path: {}", path.display())))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    fs::write(&tmp_path, contents).await?;
    fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Read a JSON document, treating a missing or malformed file as absent.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let contents = match fs::read(path).await {
        Ok(contents) => contents,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("Failed to read {}: {}", path.display(), e);
            }
            return None;
        }
    };

    match serde_json::from_slice(&contents) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("Ignoring malformed JSON in {}: {}", path.display(), e);
            None
        }
    }
}
