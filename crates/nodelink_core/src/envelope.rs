use crate::storage::write_json;
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Extracts typed envelopes from session log records and keeps the latest
/// one of each type on disk.
pub struct EnvelopeRouter {
    output_dir: PathBuf,
    marker: String,
}

impl EnvelopeRouter {
    pub fn new(output_dir: impl Into<PathBuf>, marker: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            marker: marker.into(),
        }
    }

    pub fn artifact_path(&self, envelope_type: &str) -> PathBuf {
        artifact_path(&self.output_dir, envelope_type)
    }

    /// Envelopes found in one session record. Malformed input yields nothing.
    pub fn extract(&self, line: &str) -> Vec<JsonValue> {
        let line = line.trim();
        if line.is_empty() {
            return vec![];
        }

        let record: JsonValue = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(_) => return vec![],
        };

        let Some(parts) = record
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(JsonValue::as_array)
        else {
            return vec![];
        };

        parts
            .iter()
            .filter(|part| part.get("type").and_then(JsonValue::as_str) == Some("text"))
            .filter_map(|part| part.get("text").and_then(JsonValue::as_str))
            .filter(|text| text.contains(self.marker.as_str()))
            .filter_map(|text| serde_json::from_str::<JsonValue>(text).ok())
            .filter_map(|mut data| data.get_mut(self.marker.as_str()).map(JsonValue::take))
            .filter(|envelope| envelope.as_object().is_some_and(|o| !o.is_empty()))
            .collect()
    }

    /// Persist every envelope in `line`; returns the types written.
    pub async fn handle_line(&self, line: &str) -> Vec<String> {
        let mut written = Vec::new();

        for envelope in self.extract(line) {
            let envelope_type = envelope_type(&envelope);

            let path = self.artifact_path(&envelope_type);
            match write_json(&path, &envelope).await {
                Ok(()) => {
                    info!("Stored latest '{}' envelope", envelope_type);
                    written.push(envelope_type);
                }
                Err(e) => warn!("Failed to write {}: {}", path.display(), e),
            }
        }

        if written.is_empty() {
            debug!("No envelope in session line");
        }
        written
    }
}

/// String types as-is, other scalars by their JSON text, missing or null
/// as "unknown".
fn envelope_type(envelope: &JsonValue) -> String {
    match envelope.get("type") {
        None | Some(JsonValue::Null) => "unknown".to_string(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// `<dir>/<type>-latest.json`, with the type reduced to a safe file stem.
pub fn artifact_path(dir: &Path, envelope_type: &str) -> PathBuf {
    let stem: String = envelope_type
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = stem.trim_start_matches('.');
    let stem = if stem.is_empty() { "unknown" } else { stem };
    dir.join(format!("{}-latest.json", stem))
}
