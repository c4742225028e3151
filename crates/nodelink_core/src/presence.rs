use crate::notify::{status_message, Locale, Notifier, StatusChange};
use crate::state::{ConnectionStateStore, ConnectionStatus, StateUpdate};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, info};

/// Timestamps above this are milliseconds, below it seconds.
const MILLIS_THRESHOLD: f64 = 10_000_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceReason {
    Connect,
    Disconnect,
    Other,
}

/// A presence entry as found in `payload.presence[]`.
#[derive(Debug, Clone, Default)]
pub struct PresenceEvent {
    pub device_id: Option<String>,
    pub host: Option<String>,
    pub platform: Option<String>,
    pub mode: Option<String>,
    pub reason: Option<String>,
    pub text: Option<String>,
    pub ts: Option<f64>,
    pub version: Option<String>,
}

impl PresenceEvent {
    pub fn from_json(entry: &JsonValue) -> Self {
        let text = |key: &str| {
            entry
                .get(key)
                .and_then(JsonValue::as_str)
                .map(str::to_string)
        };

        Self {
            device_id: text("deviceId"),
            host: text("host"),
            platform: text("platform"),
            mode: text("mode"),
            reason: text("reason"),
            text: text("text"),
            ts: entry.get("ts").and_then(JsonValue::as_f64),
            version: entry.get("version").and_then(|v| match v {
                JsonValue::String(s) => Some(s.clone()),
                JsonValue::Null => None,
                other => Some(other.to_string()),
            }),
        }
    }

    pub fn reason(&self) -> PresenceReason {
        match self.reason.as_deref() {
            Some("connect") => PresenceReason::Connect,
            Some("disconnect") => PresenceReason::Disconnect,
            _ => PresenceReason::Other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PresenceFilter {
    /// Lowercase keywords; empty accepts every origin
    pub host_keywords: Vec<String>,
    /// Lowercase platform substring; empty accepts every platform
    pub target_platform: String,
}

impl PresenceFilter {
    pub fn new(host_keywords: &[String], target_platform: &str) -> Self {
        Self {
            host_keywords: host_keywords
                .iter()
                .map(|kw| kw.trim().to_lowercase())
                .filter(|kw| !kw.is_empty())
                .collect(),
            target_platform: target_platform.trim().to_lowercase(),
        }
    }

    /// Node-class check: a node-mode client on the target platform.
    pub fn is_target_node(&self, event: &PresenceEvent) -> bool {
        if event.mode.as_deref() != Some("node") {
            return false;
        }
        let platform = event.platform.as_deref().unwrap_or("").to_lowercase();
        self.target_platform.is_empty() || platform.contains(&self.target_platform)
    }

    /// Origin check for devices not seen before.
    pub fn host_matches(&self, event: &PresenceEvent) -> bool {
        let combo = format!(
            "{} {}",
            event.host.as_deref().unwrap_or(""),
            event.text.as_deref().unwrap_or("")
        )
        .trim()
        .to_lowercase();

        if combo.is_empty() || self.host_keywords.is_empty() {
            return true;
        }
        self.host_keywords.iter().any(|kw| combo.contains(kw.as_str()))
    }
}

/// Presence timestamps to ISO-8601 UTC; missing or out-of-range values map
/// to now.
pub fn iso_from_ts(ts: Option<f64>) -> String {
    let parsed = ts.filter(|v| v.is_finite()).and_then(|v| {
        if v > MILLIS_THRESHOLD {
            DateTime::<Utc>::from_timestamp_millis(v as i64)
        } else {
            let secs = v.floor();
            let nanos = ((v - secs) * 1_000_000_000.0) as u32;
            DateTime::<Utc>::from_timestamp(secs as i64, nanos)
        }
    });

    format_timestamp(parsed.unwrap_or_else(Utc::now))
}

/// The one timestamp format written to the state file: whole seconds, or six
/// fractional digits when there is a sub-second part.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    let precision = if at.timestamp_subsec_micros() == 0 {
        SecondsFormat::Secs
    } else {
        SecondsFormat::Micros
    };
    at.to_rfc3339_opts(precision, false)
}

/// Turns gateway activity log lines into connection state transitions.
pub struct PresenceReconciler {
    marker: String,
    filter: PresenceFilter,
    store: Arc<ConnectionStateStore>,
    notifier: Arc<dyn Notifier>,
    app_label: String,
    locale: Locale,
}

impl PresenceReconciler {
    pub fn new(
        marker: impl Into<String>,
        filter: PresenceFilter,
        store: Arc<ConnectionStateStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            marker: marker.into(),
            filter,
            store,
            notifier,
            app_label: "Clawsy".to_string(),
            locale: Locale::En,
        }
    }

    pub fn with_message_style(mut self, app_label: impl Into<String>, locale: Locale) -> Self {
        self.app_label = app_label.into();
        self.locale = locale;
        self
    }

    /// Presence entries embedded in one log line.
    pub fn parse_line(&self, line: &str) -> Vec<PresenceEvent> {
        if !line.contains(self.marker.as_str()) {
            return vec![];
        }
        let Some(start) = line.find('{') else {
            return vec![];
        };
        let frame: JsonValue = match serde_json::from_str(&line[start..]) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Skipping unparsable gateway frame: {}", e);
                return vec![];
            }
        };
        if frame.get("event").and_then(JsonValue::as_str) != Some("presence") {
            return vec![];
        }

        frame
            .get("payload")
            .and_then(|p| p.get("presence"))
            .and_then(JsonValue::as_array)
            .map(|entries| entries.iter().map(PresenceEvent::from_json).collect())
            .unwrap_or_default()
    }

    async fn accepts(&self, event: &PresenceEvent) -> bool {
        if !self.filter.is_target_node(event) {
            return false;
        }
        if let Some(device_id) = event.device_id.as_deref() {
            if self.store.is_known(device_id).await {
                return true;
            }
        }
        self.filter.host_matches(event)
    }

    /// Apply every relevant entry of `line`; returns how many reached the store.
    pub async fn handle_line(&self, line: &str) -> usize {
        let mut applied = 0;

        for event in self.parse_line(line) {
            if !self.accepts(&event).await {
                debug!(
                    "Ignoring presence of {:?} ({:?}/{:?})",
                    event.host, event.mode, event.platform
                );
                continue;
            }

            let status = match event.reason() {
                PresenceReason::Connect => ConnectionStatus::Connected,
                PresenceReason::Disconnect => ConnectionStatus::Disconnected,
                PresenceReason::Other => continue,
            };

            let timestamp = iso_from_ts(event.ts);
            let reason = event.reason.clone().unwrap_or_default();
            let notify = self
                .store
                .update(StateUpdate {
                    status,
                    device_id: event.device_id.clone(),
                    host: event.host.clone(),
                    timestamp: timestamp.clone(),
                    reason,
                    version: event.version.clone(),
                    silent: false,
                })
                .await;
            applied += 1;

            if notify {
                let text = status_message(
                    &StatusChange {
                        status,
                        host: event.host.as_deref(),
                        device_id: event.device_id.as_deref(),
                        timestamp: &timestamp,
                    },
                    &self.app_label,
                    self.locale,
                );
                info!("Status change: {}", text);
                self.notifier.notify(&text);
            }
        }

        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MemoryNotifier;
    use serde_json::json;

    const SCENARIO: &str = r#"RAW_IN {"event":"presence","payload":{"presence":[{"mode":"node","platform":"macos","deviceId":"abc123","host":"MacBook-Pro","reason":"connect","ts":1700000000000}]}}"#;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<ConnectionStateStore>,
        notifier: Arc<MemoryNotifier>,
        reconciler: PresenceReconciler,
    }

    fn fixture(keywords: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConnectionStateStore::new(dir.path().join("state.json")));
        let notifier = Arc::new(MemoryNotifier::new());
        let keywords: Vec<String> = keywords.iter().map(|k| k.to_string()).collect();
        let reconciler = PresenceReconciler::new(
            "RAW_IN",
            PresenceFilter::new(&keywords, "macos"),
            Arc::clone(&store),
            notifier.clone(),
        );
        Fixture {
            _dir: dir,
            store,
            notifier,
            reconciler,
        }
    }

    fn presence_line(entry: JsonValue) -> String {
        format!(
            "2024-01-01 12:00:00 RAW_IN: {}",
            json!({"event": "presence", "payload": {"presence": [entry]}})
        )
    }

    #[tokio::test]
    async fn test_connect_scenario_notifies_once() {
        let f = fixture(&["macbook"]);

        assert_eq!(f.reconciler.handle_line(SCENARIO).await, 1);
        let state = f.store.snapshot().await;
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(state.device_id.as_deref(), Some("abc123"));
        assert_eq!(state.host.as_deref(), Some("MacBook-Pro"));
        assert_eq!(state.last_change.as_deref(), Some("2023-11-14T22:13:20+00:00"));

        let messages = f.notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("🟢"));
        assert!(messages[0].contains("MacBook-Pro · abc123"));

        // duplicate delivery
        assert_eq!(f.reconciler.handle_line(SCENARIO).await, 1);
        assert_eq!(f.notifier.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_non_node_mode_is_never_accepted() {
        let f = fixture(&[]);
        let line = presence_line(json!({
            "mode": "cli", "platform": "macos", "deviceId": "abc", "host": "MacBook", "reason": "connect"
        }));
        assert_eq!(f.reconciler.handle_line(&line).await, 0);

        f.store.remember_devices(vec!["abc".to_string()]).await;
        assert_eq!(f.reconciler.handle_line(&line).await, 0);
        assert!(f.notifier.messages().is_empty());
    }

    #[tokio::test]
    async fn test_platform_must_match() {
        let f = fixture(&[]);
        let line = presence_line(json!({
            "mode": "node", "platform": "linux", "deviceId": "abc", "host": "box", "reason": "connect"
        }));
        assert_eq!(f.reconciler.handle_line(&line).await, 0);

        let line = presence_line(json!({
            "mode": "node", "platform": "MacOS 14.1", "deviceId": "abc", "host": "box", "reason": "connect"
        }));
        assert_eq!(f.reconciler.handle_line(&line).await, 1);
    }

    #[tokio::test]
    async fn test_known_device_bypasses_keywords() {
        let f = fixture(&["studio"]);
        let line = presence_line(json!({
            "mode": "node", "platform": "macos", "deviceId": "known-1", "host": "Unrelated", "reason": "connect"
        }));

        assert_eq!(f.reconciler.handle_line(&line).await, 0);
        f.store.remember_devices(vec!["known-1".to_string()]).await;
        assert_eq!(f.reconciler.handle_line(&line).await, 1);
        assert_eq!(f.notifier.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_keyword_matches_text_field() {
        let f = fixture(&["studio"]);
        let line = presence_line(json!({
            "mode": "node", "platform": "macos", "deviceId": "d1", "host": "host-1",
            "text": "Node Mac STUDIO", "reason": "connect"
        }));
        assert_eq!(f.reconciler.handle_line(&line).await, 1);
    }

    #[tokio::test]
    async fn test_empty_keywords_fail_open() {
        let f = fixture(&[]);
        let line = presence_line(json!({
            "mode": "node", "platform": "macos", "deviceId": "d1", "host": "anything", "reason": "connect"
        }));
        assert_eq!(f.reconciler.handle_line(&line).await, 1);
    }

    #[tokio::test]
    async fn test_empty_origin_fails_open() {
        let f = fixture(&["macbook"]);
        let line = presence_line(json!({
            "mode": "node", "platform": "macos", "deviceId": "d1", "reason": "connect"
        }));
        assert_eq!(f.reconciler.handle_line(&line).await, 1);
    }

    #[tokio::test]
    async fn test_other_reasons_and_noise_are_ignored() {
        let f = fixture(&[]);
        let line = presence_line(json!({
            "mode": "node", "platform": "macos", "deviceId": "d1", "host": "h", "reason": "periodic"
        }));
        assert_eq!(f.reconciler.handle_line(&line).await, 0);

        assert_eq!(f.reconciler.handle_line("RAW_IN: not json {").await, 0);
        assert_eq!(f.reconciler.handle_line("no marker {\"event\":\"presence\"}").await, 0);
        assert_eq!(
            f.reconciler
                .handle_line(r#"RAW_IN: {"event":"tick","payload":{}}"#)
                .await,
            0
        );
        assert_eq!(f.store.snapshot().await.status, ConnectionStatus::Unknown);
    }

    #[tokio::test]
    async fn test_disconnect_then_reconnect_notifies_each_change() {
        let f = fixture(&["macbook"]);
        let entry = |reason: &str| {
            presence_line(json!({
                "mode": "node", "platform": "macos", "deviceId": "abc123",
                "host": "MacBook-Pro", "reason": reason, "ts": 1700000000
            }))
        };

        f.reconciler.handle_line(&entry("connect")).await;
        f.reconciler.handle_line(&entry("disconnect")).await;
        f.reconciler.handle_line(&entry("disconnect")).await;
        f.reconciler.handle_line(&entry("connect")).await;

        let messages = f.notifier.messages();
        assert_eq!(messages.len(), 3);
        assert!(messages[1].starts_with("🔴"));
    }

    #[test]
    fn test_iso_from_ts() {
        assert_eq!(iso_from_ts(Some(1700000000000.0)), "2023-11-14T22:13:20+00:00");
        assert_eq!(iso_from_ts(Some(1700000000.0)), "2023-11-14T22:13:20+00:00");
        assert_eq!(
            iso_from_ts(Some(1700000000500.0)),
            "2023-11-14T22:13:20.500000+00:00"
        );
        assert_eq!(
            iso_from_ts(Some(1700000000.25)),
            "2023-11-14T22:13:20.250000+00:00"
        );
        assert!(iso_from_ts(None).ends_with("+00:00"));
        assert!(iso_from_ts(Some(f64::NAN)).ends_with("+00:00"));
    }

    #[test]
    fn test_format_timestamp_fraction_is_micros_or_nothing() {
        let whole = DateTime::<Utc>::from_timestamp(1700000000, 0).unwrap();
        assert_eq!(format_timestamp(whole), "2023-11-14T22:13:20+00:00");

        let nanos = DateTime::<Utc>::from_timestamp(1700000000, 123_456_789).unwrap();
        assert_eq!(format_timestamp(nanos), "2023-11-14T22:13:20.123456+00:00");

        let now = format_timestamp(Utc::now());
        let fraction = now
            .strip_suffix("+00:00")
            .and_then(|rest| rest.split_once('.'))
            .map(|(_, digits)| digits.len());
        assert!(matches!(fraction, None | Some(6)), "{}", now);
    }

    #[test]
    fn test_presence_event_from_json() {
        let event = PresenceEvent::from_json(&json!({
            "deviceId": "d", "host": "h", "platform": "macos", "mode": "node",
            "reason": "disconnect", "ts": 5, "version": 7
        }));
        assert_eq!(event.reason(), PresenceReason::Disconnect);
        assert_eq!(event.version.as_deref(), Some("7"));
        assert_eq!(event.ts, Some(5.0));
    }
}
