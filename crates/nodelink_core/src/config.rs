use crate::{NodeLinkError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeLinkConfig {
    pub gateway: GatewayConfig,
    pub identity: IdentityConfig,
    pub monitor: MonitorConfig,
    pub notifications: NotificationConfig,
    pub bootstrap: BootstrapConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Websocket endpoint of the gateway
    pub url: String,
    pub token: String,
    pub client_id: String,
    pub client_version: String,
    pub platform: String,
    pub mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,
    pub commands: Vec<String>,
    pub permissions: BTreeMap<String, bool>,
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub challenge_timeout_secs: u64,
    pub result_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Where the signing key seed is kept; `None` means a fresh key per process
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Keywords matched against presence host/text for unknown devices
    pub host_keywords: Vec<String>,
    /// Substring the presence platform must contain
    pub target_platform: String,
    /// Key of the service session inside `sessions.json`
    pub service_session_key: String,
    pub session_dir: PathBuf,
    pub listener_log: PathBuf,
    pub output_dir: PathBuf,
    /// Marker signalling an embedded envelope inside session text parts
    pub envelope_marker: String,
    /// Marker identifying raw inbound gateway traffic in the listener log
    pub raw_inbound_marker: String,
    pub poll_interval_ms: u64,
    pub max_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Notification backend (command, desktop, log)
    pub backend: String,
    /// Argument vector; `{text}` is replaced with the message
    pub command: Vec<String>,
    /// Message language (en, de)
    pub locale: String,
    pub app_label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    pub enabled: bool,
    /// Argument vector of the fleet-status query
    pub command: Vec<String>,
    /// Platform prefix identifying nodes this monitor tracks
    pub platform_prefix: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let mut permissions = BTreeMap::new();
        permissions.insert("clipboard.read".to_string(), true);
        permissions.insert("clipboard.write".to_string(), true);

        Self {
            url: "ws://127.0.0.1:18789".to_string(),
            token: String::new(),
            client_id: "openclaw-macos".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: "macos".to_string(),
            mode: "node".to_string(),
            role: "node".to_string(),
            scopes: vec![],
            caps: vec!["clipboard".to_string(), "screen".to_string()],
            commands: vec![
                "clipboard.read".to_string(),
                "clipboard.write".to_string(),
                "screen.capture".to_string(),
            ],
            permissions,
            min_protocol: 3,
            max_protocol: 3,
            challenge_timeout_secs: 10,
            result_timeout_secs: 10,
        }
    }
}

impl GatewayConfig {
    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_secs(self.challenge_timeout_secs.max(1))
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_secs(self.result_timeout_secs.max(1))
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let data = dirs::data_dir()
            .map(|d| d.join("nodelink"))
            .unwrap_or_else(|| PathBuf::from("nodelink"));

        Self {
            host_keywords: vec!["openclaw".to_string(), "macbook".to_string()],
            target_platform: "macos".to_string(),
            service_session_key: "clawsy-service".to_string(),
            session_dir: home
                .join(".openclaw")
                .join("agents")
                .join("main")
                .join("sessions"),
            listener_log: data.join("listener.log"),
            output_dir: data.join("state"),
            envelope_marker: "clawsy_envelope".to_string(),
            raw_inbound_marker: "RAW_IN".to_string(),
            poll_interval_ms: 200,
            max_wait_ms: 5_000,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms.max(self.poll_interval_ms).max(1))
    }

    pub fn state_path(&self) -> PathBuf {
        self.output_dir.join("connection-state.json")
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            backend: "command".to_string(),
            command: vec![
                "openclaw".to_string(),
                "system".to_string(),
                "event".to_string(),
                "--text".to_string(),
                "{text}".to_string(),
                "--mode".to_string(),
                "now".to_string(),
            ],
            locale: "en".to_string(),
            app_label: "Clawsy".to_string(),
        }
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: vec![
                "openclaw".to_string(),
                "nodes".to_string(),
                "status".to_string(),
                "--json".to_string(),
            ],
            platform_prefix: "mac".to_string(),
        }
    }
}

impl Default for NodeLinkConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            identity: IdentityConfig {
                key_path: NodeLinkConfig::config_dir()
                    .ok()
                    .map(|d| d.join("device.key")),
            },
            monitor: MonitorConfig::default(),
            notifications: NotificationConfig::default(),
            bootstrap: BootstrapConfig::default(),
        }
    }
}

impl NodeLinkConfig {
    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|d| d.join("nodelink"))
            .ok_or_else(|| {
                NodeLinkError::Config("Unable to determine config directory".to_string())
            })
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub async fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            let config = Self::default();
            config.save().await?;
            return Ok(config);
        }

        Self::load_from(&path).await
    }

    pub async fn load_from(path: &std::path::Path) -> Result<Self> {
        let contents = fs::read_to_string(path).await?;
        let config: NodeLinkConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        let config_dir = Self::config_dir()?;
        fs::create_dir_all(&config_dir).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o700);
            std::fs::set_permissions(&config_dir, permissions)?;
        }

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self)
            .map_err(|e| NodeLinkError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(&path, contents).await?;

        // Holds the gateway token
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&path, permissions)?;
        }

        Ok(())
    }

    /// Apply `NODELINK_*` environment overrides. Called once at startup.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(keywords) = lookup("NODELINK_HOST_KEYWORDS") {
            self.monitor.host_keywords = keywords
                .split_whitespace()
                .map(|kw| kw.to_lowercase())
                .collect();
            debug!("Host keywords from environment: {:?}", self.monitor.host_keywords);
        }
        if let Some(platform) = lookup("NODELINK_NODE_PLATFORM") {
            self.monitor.target_platform = platform.to_lowercase();
        }
        if let Some(key) = lookup("NODELINK_SERVICE_KEY") {
            self.monitor.service_session_key = key;
        }
        if let Some(token) = lookup("NODELINK_GATEWAY_TOKEN") {
            self.gateway.token = token;
        }
    }
}
