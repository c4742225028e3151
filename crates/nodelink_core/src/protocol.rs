// Gateway wire frames used by the node handshake.
//
// Flow:
// 1. Gateway pushes `connect.challenge` with a nonce
// 2. Node answers with a signed `connect` request
// 3. Gateway replies with `{ok: true|false, ...}` correlated by id
// 4. On success the gateway keeps pushing events

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

pub const CHALLENGE_EVENT: &str = "connect.challenge";
pub const CONNECT_METHOD: &str = "connect";
pub const SIGNATURE_VERSION: &str = "v2";

/// Request frame from node to gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame<P> {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub id: String,
    pub method: String,
    pub params: P,
}

impl<P> RequestFrame<P> {
    pub fn new(id: String, method: &str, params: P) -> Self {
        Self {
            frame_type: "req".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,
    pub commands: Vec<String>,
    pub permissions: BTreeMap<String, bool>,
    pub auth: AuthInfo,
    pub device: DeviceProof,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthInfo {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProof {
    pub id: String,
    /// Raw public key, unpadded base64url
    pub public_key: String,
    /// Ed25519 signature over the canonical payload, unpadded base64url
    pub signature: String,
    /// Epoch milliseconds embedded in the signed payload
    pub signed_at: i64,
    pub nonce: String,
}

/// Fields covered by the device signature, in wire order.
#[derive(Debug, Clone)]
pub struct SignaturePayload<'a> {
    pub device_id: &'a str,
    pub client_id: &'a str,
    pub client_mode: &'a str,
    pub role: &'a str,
    pub scopes: &'a [String],
    pub signed_at_ms: i64,
    pub token: &'a str,
    pub nonce: &'a str,
}

impl SignaturePayload<'_> {
    /// `v2|device|client|mode|role|scopes|signedAtMs|token|nonce`, no escaping.
    pub fn canonical(&self) -> String {
        [
            SIGNATURE_VERSION,
            self.device_id,
            self.client_id,
            self.client_mode,
            self.role,
            self.scopes.join(",").as_str(),
            self.signed_at_ms.to_string().as_str(),
            self.token,
            self.nonce,
        ]
        .join("|")
    }
}

/// Extract the nonce from a `connect.challenge` push.
pub fn challenge_nonce(frame: &JsonValue) -> Option<&str> {
    if frame.get("event").and_then(JsonValue::as_str) != Some(CHALLENGE_EVENT) {
        return None;
    }
    frame
        .get("payload")
        .and_then(|p| p.get("nonce"))
        .and_then(JsonValue::as_str)
        .filter(|nonce| !nonce.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_payload_layout() {
        let scopes: Vec<String> = vec![];
        let payload = SignaturePayload {
            device_id: "dev",
            client_id: "openclaw-macos",
            client_mode: "node",
            role: "node",
            scopes: &scopes,
            signed_at_ms: 1700000000000,
            token: "tok",
            nonce: "n1",
        };
        assert_eq!(
            payload.canonical(),
            "v2|dev|openclaw-macos|node|node||1700000000000|tok|n1"
        );

        let scopes = vec!["a".to_string(), "b".to_string()];
        let payload = SignaturePayload {
            scopes: &scopes,
            ..payload
        };
        assert_eq!(
            payload.canonical(),
            "v2|dev|openclaw-macos|node|node|a,b|1700000000000|tok|n1"
        );
    }

    #[test]
    fn test_every_signed_field_is_covered() {
        use crate::identity::{verify_signature, DeviceIdentity};

        let identity = DeviceIdentity::from_seed([3u8; 32]);
        let scopes = vec!["a".to_string()];
        let other_scopes = vec!["a".to_string(), "b".to_string()];
        let base = SignaturePayload {
            device_id: identity.device_id(),
            client_id: "openclaw-macos",
            client_mode: "node",
            role: "node",
            scopes: &scopes,
            signed_at_ms: 1700000000000,
            token: "tok",
            nonce: "n1",
        };
        let signed = base.canonical();
        let signature = identity.sign(signed.as_bytes());
        assert!(verify_signature(identity.public_key_bytes(), signed.as_bytes(), &signature)
            .unwrap());

        let variants = [
            signed.replacen("v2|", "v1|", 1),
            SignaturePayload { device_id: "other-device", ..base.clone() }.canonical(),
            SignaturePayload { client_id: "openclaw-ios", ..base.clone() }.canonical(),
            SignaturePayload { client_mode: "ui", ..base.clone() }.canonical(),
            SignaturePayload { role: "operator", ..base.clone() }.canonical(),
            SignaturePayload { scopes: &other_scopes, ..base.clone() }.canonical(),
            SignaturePayload { signed_at_ms: 1700000000001, ..base.clone() }.canonical(),
            SignaturePayload { token: "tok2", ..base.clone() }.canonical(),
            SignaturePayload { nonce: "n2", ..base.clone() }.canonical(),
        ];
        for variant in &variants {
            assert_ne!(variant, &signed);
            assert!(
                !verify_signature(identity.public_key_bytes(), variant.as_bytes(), &signature)
                    .unwrap(),
                "signature still verifies for {}",
                variant
            );
        }
    }

    #[test]
    fn test_challenge_nonce() {
        let ok = json!({"event": "connect.challenge", "payload": {"nonce": "abc"}});
        assert_eq!(challenge_nonce(&ok), Some("abc"));

        let empty = json!({"event": "connect.challenge", "payload": {"nonce": ""}});
        assert_eq!(challenge_nonce(&empty), None);

        let wrong = json!({"event": "tick", "payload": {"nonce": "abc"}});
        assert_eq!(challenge_nonce(&wrong), None);

        let missing = json!({"event": "connect.challenge"});
        assert_eq!(challenge_nonce(&missing), None);
    }

    #[test]
    fn test_connect_request_wire_names() {
        let frame = RequestFrame::new(
            "1".to_string(),
            CONNECT_METHOD,
            ConnectRequest {
                min_protocol: 3,
                max_protocol: 3,
                client: ClientInfo {
                    id: "c".to_string(),
                    version: "1".to_string(),
                    platform: "macos".to_string(),
                    mode: "node".to_string(),
                },
                role: "node".to_string(),
                scopes: vec![],
                caps: vec!["clipboard".to_string()],
                commands: vec![],
                permissions: BTreeMap::new(),
                auth: AuthInfo {
                    token: "t".to_string(),
                },
                device: DeviceProof {
                    id: "d".to_string(),
                    public_key: "pk".to_string(),
                    signature: "sig".to_string(),
                    signed_at: 42,
                    nonce: "n".to_string(),
                },
            },
        );

        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "req");
        assert_eq!(value["method"], "connect");
        assert_eq!(value["params"]["minProtocol"], 3);
        assert_eq!(value["params"]["device"]["publicKey"], "pk");
        assert_eq!(value["params"]["device"]["signedAt"], 42);
        assert_eq!(value["params"]["auth"]["token"], "t");
    }
}
