use async_trait::async_trait;
use chrono::Utc;
use nodelink_core::presence::{format_timestamp, iso_from_ts};
use nodelink_core::{
    BootstrapConfig, ConnectionStateStore, ConnectionStatus, NodeLinkError, Result, StateUpdate,
};
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Fleet status as reported by the gateway CLI.
///
/// Nodes are read field by field: a node with odd values never hides the
/// rest of the fleet.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FleetStatus {
    #[serde(default, deserialize_with = "lenient_nodes")]
    pub nodes: Vec<FleetNode>,
}

fn lenient_nodes<'de, D>(deserializer: D) -> std::result::Result<Vec<FleetNode>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(JsonValue::as_array)
        .map(|nodes| nodes.iter().map(FleetNode::from_json).collect())
        .unwrap_or_default())
}

#[derive(Debug, Clone, Default)]
pub struct FleetNode {
    pub node_id: Option<String>,
    pub platform: Option<String>,
    pub connected: bool,
    pub connected_at_ms: Option<f64>,
    pub display_name: Option<String>,
    pub version: Option<JsonValue>,
}

/// Strings as-is, numbers in their JSON form, anything else absent.
fn text_of(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl FleetNode {
    pub fn from_json(node: &JsonValue) -> Self {
        Self {
            node_id: text_of(node.get("nodeId")),
            platform: text_of(node.get("platform")),
            connected: node
                .get("connected")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false),
            connected_at_ms: node.get("connectedAtMs").and_then(|v| match v {
                JsonValue::String(s) => s.trim().parse().ok(),
                other => other.as_f64(),
            }),
            display_name: text_of(node.get("displayName")),
            version: node.get("version").cloned(),
        }
    }

    fn platform_matches(&self, prefix: &str) -> bool {
        self.platform
            .as_deref()
            .unwrap_or("")
            .to_lowercase()
            .starts_with(prefix)
    }

    fn version_string(&self) -> Option<String> {
        match self.version.as_ref()? {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Null => None,
            other => Some(other.to_string()),
        }
    }
}

#[async_trait]
pub trait FleetStatusSource: Send + Sync {
    async fn query(&self) -> Result<FleetStatus>;
}

/// Runs a status command and parses its JSON output.
pub struct CommandFleetSource {
    argv: Vec<String>,
}

impl CommandFleetSource {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl FleetStatusSource for CommandFleetSource {
    async fn query(&self) -> Result<FleetStatus> {
        let (program, args) = self.argv.split_first().ok_or_else(|| {
            NodeLinkError::ExternalCommand("Status command is empty".to_string())
        })?;

        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                NodeLinkError::ExternalCommand(format!("Failed to run {}: {}", program, e))
            })?;

        if !output.status.success() {
            return Err(NodeLinkError::ExternalCommand(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            NodeLinkError::Serialization(format!("Invalid fleet status from {}: {}", program, e))
        })
    }
}

/// Seeds the connection state from a one-shot fleet query before any log is
/// tailed. Every write is silent.
pub struct BootstrapReconciler {
    source: Box<dyn FleetStatusSource>,
    platform_prefix: String,
}

impl BootstrapReconciler {
    pub fn new(source: Box<dyn FleetStatusSource>, platform_prefix: &str) -> Self {
        Self {
            source,
            platform_prefix: platform_prefix.trim().to_lowercase(),
        }
    }

    pub fn from_config(config: &BootstrapConfig) -> Self {
        Self::new(
            Box::new(CommandFleetSource::new(config.command.clone())),
            &config.platform_prefix,
        )
    }

    pub async fn run(&self, store: &ConnectionStateStore) {
        let status = match self.source.query().await {
            Ok(status) => status,
            Err(e) => {
                warn!("Unable to load node status: {}", e);
                return;
            }
        };

        if status.nodes.is_empty() {
            debug!("Fleet status lists no nodes");
            return;
        }

        let current = status
            .nodes
            .iter()
            .find(|node| node.connected && node.platform_matches(&self.platform_prefix));

        let update = match current {
            Some(node) => {
                info!("Bootstrap: {:?} is connected", node.node_id);
                StateUpdate {
                    status: ConnectionStatus::Connected,
                    device_id: node.node_id.clone(),
                    host: node
                        .display_name
                        .clone()
                        .filter(|name| !name.is_empty())
                        .or_else(|| node.platform.clone()),
                    timestamp: iso_from_ts(node.connected_at_ms),
                    reason: "connect".to_string(),
                    version: node.version_string(),
                    silent: true,
                }
            }
            None => {
                info!("Bootstrap: no matching node connected");
                StateUpdate {
                    status: ConnectionStatus::Disconnected,
                    device_id: None,
                    host: None,
                    timestamp: format_timestamp(Utc::now()),
                    reason: "bootstrap".to_string(),
                    version: None,
                    silent: true,
                }
            }
        };
        store.update(update).await;

        let known = status
            .nodes
            .iter()
            .filter(|node| node.platform_matches(&self.platform_prefix))
            .filter_map(|node| node.node_id.clone())
            .filter(|id| !id.is_empty());
        store.remember_devices(known).await;
    }
}
