use crate::storage::{read_json, write_json};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Unknown,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::Unknown => "unknown",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}

/// Persisted connection record. Missing keys in the file take their defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub device_id: Option<String>,
    pub host: Option<String>,
    pub last_change: Option<String>,
    pub reason: Option<String>,
    pub version: Option<String>,
    pub known_device_ids: BTreeSet<String>,
}

/// One observed transition, as handed to [`ConnectionStateStore::update`].
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub status: ConnectionStatus,
    pub device_id: Option<String>,
    pub host: Option<String>,
    /// ISO-8601 UTC timestamp of the event
    pub timestamp: String,
    pub reason: String,
    pub version: Option<String>,
    /// Record the state without asking for a notification
    pub silent: bool,
}

/// Owner of the single authoritative [`ConnectionState`].
///
/// Every read-modify-write happens under one lock, including the snapshot
/// write, so concurrent watchers observe a total order of updates.
pub struct ConnectionStateStore {
    path: PathBuf,
    state: Mutex<Option<ConnectionState>>,
}

impl ConnectionStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted state without going through a store.
    pub async fn load_from_disk(path: &Path) -> ConnectionState {
        read_json(path).await.unwrap_or_default()
    }

    /// Apply `update`; returns true when the caller should notify.
    pub async fn update(&self, update: StateUpdate) -> bool {
        let mut guard = self.state.lock().await;
        let previous = match guard.take() {
            Some(state) => state,
            None => Self::load_from_disk(&self.path).await,
        };

        let changed =
            update.status != previous.status || update.device_id != previous.device_id;

        let mut known_device_ids = previous.known_device_ids;
        if let Some(device_id) = update.device_id.as_deref().filter(|id| !id.is_empty()) {
            known_device_ids.insert(device_id.to_string());
        }

        let next = ConnectionState {
            status: update.status,
            device_id: update.device_id,
            host: update.host,
            last_change: Some(update.timestamp),
            reason: Some(update.reason),
            version: update.version,
            known_device_ids,
        };

        if changed {
            info!(
                "Connection state {} -> {} (device {:?}, reason {:?})",
                previous.status, next.status, next.device_id, next.reason
            );
        } else {
            debug!("Connection state unchanged ({})", next.status);
        }

        self.persist(&next).await;
        *guard = Some(next);

        changed && !update.silent
    }

    /// Fold `device_ids` into the known-device set.
    pub async fn remember_devices<I>(&self, device_ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut guard = self.state.lock().await;
        let mut state = match guard.take() {
            Some(state) => state,
            None => Self::load_from_disk(&self.path).await,
        };

        let before = state.known_device_ids.len();
        state
            .known_device_ids
            .extend(device_ids.into_iter().filter(|id| !id.is_empty()));
        debug!(
            "Known devices: {} -> {}",
            before,
            state.known_device_ids.len()
        );

        self.persist(&state).await;
        *guard = Some(state);
    }

    pub async fn is_known(&self, device_id: &str) -> bool {
        let mut guard = self.state.lock().await;
        if guard.is_none() {
            *guard = Some(Self::load_from_disk(&self.path).await);
        }
        guard
            .as_ref()
            .is_some_and(|state| state.known_device_ids.contains(device_id))
    }

    pub async fn snapshot(&self) -> ConnectionState {
        let mut guard = self.state.lock().await;
        if guard.is_none() {
            *guard = Some(Self::load_from_disk(&self.path).await);
        }
        guard.clone().unwrap_or_default()
    }

    async fn persist(&self, state: &ConnectionState) {
        if let Err(e) = write_json(&self.path, state).await {
            warn!(
                "Failed to persist connection state to {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn update(status: ConnectionStatus, device_id: Option<&str>) -> StateUpdate {
        StateUpdate {
            status,
            device_id: device_id.map(str::to_string),
            host: Some("MacBook-Pro".to_string()),
            timestamp: "2023-11-14T22:13:20+00:00".to_string(),
            reason: "connect".to_string(),
            version: None,
            silent: false,
        }
    }

    #[tokio::test]
    async fn test_cold_store_starts_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConnectionStateStore::new(dir.path().join("state.json"));

        let state = store.snapshot().await;
        assert_eq!(state.status, ConnectionStatus::Unknown);
        assert!(state.device_id.is_none());
        assert!(state.known_device_ids.is_empty());
        assert!(state.last_change.is_none());
    }

    #[tokio::test]
    async fn test_repeat_update_notifies_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConnectionStateStore::new(dir.path().join("state.json"));

        assert!(store.update(update(ConnectionStatus::Connected, Some("abc"))).await);
        assert!(!store.update(update(ConnectionStatus::Connected, Some("abc"))).await);
        assert!(store.update(update(ConnectionStatus::Connected, Some("def"))).await);
        assert!(store.update(update(ConnectionStatus::Disconnected, Some("def"))).await);
    }

    #[tokio::test]
    async fn test_silent_update_records_but_does_not_notify() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConnectionStateStore::new(dir.path().join("state.json"));

        let mut silent = update(ConnectionStatus::Connected, Some("abc"));
        silent.silent = true;
        assert!(!store.update(silent).await);
        assert_eq!(store.snapshot().await.status, ConnectionStatus::Connected);
        assert!(!store.update(update(ConnectionStatus::Connected, Some("abc"))).await);
    }

    #[tokio::test]
    async fn test_known_devices_never_shrink() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConnectionStateStore::new(dir.path().join("state.json"));

        let sequence = [
            update(ConnectionStatus::Connected, Some("a")),
            update(ConnectionStatus::Disconnected, None),
            update(ConnectionStatus::Connected, Some("b")),
            update(ConnectionStatus::Disconnected, Some("")),
            update(ConnectionStatus::Connected, Some("a")),
        ];

        let mut previous = 0;
        for step in sequence {
            store.update(step).await;
            let known = store.snapshot().await.known_device_ids.len();
            assert!(known >= previous);
            previous = known;
        }

        store.remember_devices(vec!["c".to_string(), String::new()]).await;
        let known = store.snapshot().await.known_device_ids;
        assert_eq!(
            known.into_iter().collect::<Vec<_>>(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = ConnectionStateStore::new(&path);
        store.update(update(ConnectionStatus::Connected, Some("abc"))).await;
        drop(store);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["status"], "connected");
        assert_eq!(raw["deviceId"], "abc");
        assert_eq!(raw["knownDeviceIds"], serde_json::json!(["abc"]));
        assert_eq!(raw["lastChange"], "2023-11-14T22:13:20+00:00");

        let reopened = ConnectionStateStore::new(&path);
        assert!(reopened.is_known("abc").await);
        assert!(!reopened.update(update(ConnectionStatus::Connected, Some("abc"))).await);
    }

    #[tokio::test]
    async fn test_corrupt_state_file_is_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{{{").unwrap();

        let store = ConnectionStateStore::new(&path);
        assert_eq!(store.snapshot().await.status, ConnectionStatus::Unknown);
        assert!(store.update(update(ConnectionStatus::Connected, Some("abc"))).await);
    }

    #[tokio::test]
    async fn test_partial_state_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"status": "disconnected"}"#).unwrap();

        let state = ConnectionStateStore::load_from_disk(&path).await;
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert!(state.known_device_ids.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_updates_notify_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConnectionStateStore::new(dir.path().join("state.json")));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.update(update(ConnectionStatus::Connected, Some("abc"))).await
            }));
        }

        let mut notified = 0;
        for handle in handles {
            if handle.await.unwrap() {
                notified += 1;
            }
        }
        assert_eq!(notified, 1);
    }
}
