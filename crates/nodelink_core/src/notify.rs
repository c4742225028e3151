use crate::state::ConnectionStatus;
use std::sync::Mutex;

/// One-way, fire-and-forget delivery of a status message.
///
/// Implementations must not block the caller and must swallow their own
/// failures.
pub trait Notifier: Send + Sync {
    fn notify(&self, text: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locale {
    En,
    De,
}

impl Locale {
    pub fn parse(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "de" | "de-de" | "german" => Locale::De,
            _ => Locale::En,
        }
    }

    fn verb(self, status: ConnectionStatus) -> &'static str {
        match (self, status) {
            (Locale::En, ConnectionStatus::Connected) => "connected",
            (Locale::En, _) => "disconnected",
            (Locale::De, ConnectionStatus::Connected) => "verbunden",
            (Locale::De, _) => "getrennt",
        }
    }
}

/// A change reported by the state store.
#[derive(Debug, Clone)]
pub struct StatusChange<'a> {
    pub status: ConnectionStatus,
    pub host: Option<&'a str>,
    pub device_id: Option<&'a str>,
    pub timestamp: &'a str,
}

pub fn short_device_id(device_id: Option<&str>) -> &str {
    match device_id {
        Some(id) if !id.is_empty() => id.get(..8).unwrap_or(id),
        _ => "unknown",
    }
}

/// `2023-11-14T22:13:20+00:00` -> `2023-11-14 22:13:20Z`
pub fn display_timestamp(timestamp: &str) -> String {
    timestamp.replace('T', " ").replace("+00:00", "Z")
}

pub fn status_message(change: &StatusChange<'_>, app_label: &str, locale: Locale) -> String {
    let emoji = match change.status {
        ConnectionStatus::Connected => "🟢",
        _ => "🔴",
    };
    let host = change
        .host
        .filter(|h| !h.is_empty())
        .unwrap_or(app_label);

    format!(
        "{} {} {} ({} · {}) - {}",
        emoji,
        app_label,
        locale.verb(change.status),
        host,
        short_device_id(change.device_id),
        display_timestamp(change.timestamp)
    )
}

/// Keeps every message in memory; used where a real sink is unwanted.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    messages: Mutex<Vec<String>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, text: &str) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(text.to_string());
        }
    }
}
