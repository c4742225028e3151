use crate::identity::DeviceIdentity;
use crate::protocol::{
    challenge_nonce, AuthInfo, ClientInfo, ConnectRequest, DeviceProof, RequestFrame,
    SignaturePayload, CONNECT_METHOD,
};
use crate::{GatewayConfig, NodeLinkError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Init,
    Connecting,
    AwaitChallenge,
    SignAndSend,
    AwaitResult,
    Connected,
    Failed,
}

/// Stream type of sessions opened by [`HandshakeClient::connect`].
pub type GatewayStream = MaybeTlsStream<TcpStream>;

/// One authentication attempt against the gateway. Not reusable; the caller
/// owns any retry policy.
pub struct HandshakeClient<'a> {
    identity: &'a DeviceIdentity,
    config: &'a GatewayConfig,
    phase: HandshakePhase,
}

impl<'a> HandshakeClient<'a> {
    pub fn new(identity: &'a DeviceIdentity, config: &'a GatewayConfig) -> Self {
        Self {
            identity,
            config,
            phase: HandshakePhase::Init,
        }
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    fn enter(&mut self, phase: HandshakePhase) {
        debug!("Handshake {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// Open the websocket to the configured gateway and authenticate.
    pub async fn connect(mut self) -> Result<GatewaySession<GatewayStream>> {
        self.enter(HandshakePhase::Connecting);
        let url = self.config.url.clone();

        let ws = match connect_async(url.as_str()).await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                self.enter(HandshakePhase::Failed);
                return Err(NodeLinkError::Transport(format!(
                    "Failed to connect to {}: {}",
                    url, e
                )));
            }
        };

        info!("Connected to gateway at {}", url);
        self.handshake(ws).await
    }

    /// Authenticate over an already opened websocket.
    pub async fn handshake<S>(mut self, mut ws: WebSocketStream<S>) -> Result<GatewaySession<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.exchange(&mut ws).await {
            Ok(hello) => {
                self.enter(HandshakePhase::Connected);
                info!("Handshake complete as node {}", self.identity.device_id());
                Ok(GatewaySession { ws, hello })
            }
            Err(e) => {
                self.enter(HandshakePhase::Failed);
                warn!("Handshake failed: {}", e);
                let _ = ws.close(None).await;
                Err(e)
            }
        }
    }

    async fn exchange<S>(&mut self, ws: &mut WebSocketStream<S>) -> Result<JsonValue>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.enter(HandshakePhase::AwaitChallenge);
        let challenge = with_timeout(
            self.config.challenge_timeout(),
            "connect.challenge",
            next_json(ws, "connect.challenge"),
        )
        .await?;

        let nonce = challenge_nonce(&challenge)
            .ok_or_else(|| {
                NodeLinkError::ProtocolViolation(format!(
                    "Expected connect.challenge with a nonce, got {}",
                    challenge
                ))
            })?
            .to_string();
        debug!("Received challenge nonce ({} chars)", nonce.len());

        self.enter(HandshakePhase::SignAndSend);
        let request_id = Uuid::new_v4().to_string();
        let signed_at_ms = chrono::Utc::now().timestamp_millis();
        let params = build_connect_request(self.identity, self.config, &nonce, signed_at_ms);
        let frame = RequestFrame::new(request_id.clone(), CONNECT_METHOD, params);

        let serialized = serde_json::to_string(&frame).map_err(|e| {
            NodeLinkError::Serialization(format!("Failed to encode connect request: {}", e))
        })?;
        ws.send(Message::Text(serialized.into()))
            .await
            .map_err(|e| NodeLinkError::Transport(format!("Failed to send connect: {}", e)))?;

        self.enter(HandshakePhase::AwaitResult);
        let result = with_timeout(
            self.config.result_timeout(),
            "connect result",
            next_json(ws, "connect result"),
        )
        .await?;

        check_connect_result(result, &request_id)
    }
}

/// Build the signed connect parameters for `nonce`.
pub fn build_connect_request(
    identity: &DeviceIdentity,
    config: &GatewayConfig,
    nonce: &str,
    signed_at_ms: i64,
) -> ConnectRequest {
    let payload = SignaturePayload {
        device_id: identity.device_id(),
        client_id: &config.client_id,
        client_mode: &config.mode,
        role: &config.role,
        scopes: &config.scopes,
        signed_at_ms,
        token: &config.token,
        nonce,
    };
    let signature = identity.sign(payload.canonical().as_bytes());

    ConnectRequest {
        min_protocol: config.min_protocol,
        max_protocol: config.max_protocol,
        client: ClientInfo {
            id: config.client_id.clone(),
            version: config.client_version.clone(),
            platform: config.platform.clone(),
            mode: config.mode.clone(),
        },
        role: config.role.clone(),
        scopes: config.scopes.clone(),
        caps: config.caps.clone(),
        commands: config.commands.clone(),
        permissions: config.permissions.clone(),
        auth: AuthInfo {
            token: config.token.clone(),
        },
        device: DeviceProof {
            id: identity.device_id().to_string(),
            public_key: identity.public_key_base64url(),
            signature: URL_SAFE_NO_PAD.encode(signature),
            signed_at: signed_at_ms,
            nonce: nonce.to_string(),
        },
    }
}

fn check_connect_result(result: JsonValue, request_id: &str) -> Result<JsonValue> {
    if !result.is_object() {
        return Err(NodeLinkError::ProtocolViolation(format!(
            "Connect result is not an object: {}",
            result
        )));
    }

    if let Some(id) = result.get("id") {
        if id.as_str() != Some(request_id) {
            return Err(NodeLinkError::ProtocolViolation(format!(
                "Connect result id {} does not match request {}",
                id, request_id
            )));
        }
    }

    if result.get("ok").and_then(JsonValue::as_bool) == Some(true) {
        return Ok(result);
    }

    let reason = result
        .get("error")
        .map(|error| match error.get("message").and_then(JsonValue::as_str) {
            Some(message) => message.to_string(),
            None => error.to_string(),
        })
        .unwrap_or_else(|| "gateway did not acknowledge connect".to_string());
    Err(NodeLinkError::AuthRejected(reason))
}

async fn with_timeout<F>(limit: Duration, what: &str, fut: F) -> Result<JsonValue>
where
    F: std::future::Future<Output = Result<JsonValue>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(NodeLinkError::Timeout(format!(
            "{} after {}s",
            what,
            limit.as_secs()
        ))),
    }
}

/// Next JSON text frame, skipping control frames.
async fn next_json<S>(ws: &mut WebSocketStream<S>, what: &str) -> Result<JsonValue>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str()).map_err(|e| {
                    NodeLinkError::ProtocolViolation(format!("Malformed {}: {}", what, e))
                });
            }
            Some(Ok(Message::Binary(_))) => {
                return Err(NodeLinkError::ProtocolViolation(format!(
                    "Unexpected binary frame while waiting for {}",
                    what
                )));
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(NodeLinkError::Transport(format!(
                    "Connection closed while waiting for {}",
                    what
                )));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(NodeLinkError::Transport(format!(
                    "Connection error while waiting for {}: {}",
                    what, e
                )));
            }
        }
    }
}

/// An authenticated gateway connection.
pub struct GatewaySession<S> {
    ws: WebSocketStream<S>,
    hello: JsonValue,
}

impl<S> GatewaySession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// The gateway's `ok: true` reply to the connect request.
    pub fn hello(&self) -> &JsonValue {
        &self.hello
    }

    /// Next pushed message, or `None` once the gateway closes the connection.
    pub async fn next_push(&mut self) -> Result<Option<JsonValue>> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str(text.as_str()) {
                    Ok(value) => return Ok(Some(value)),
                    Err(e) => {
                        warn!("Skipping malformed gateway push: {}", e);
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!("Gateway closed connection: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(NodeLinkError::Transport(format!(
                        "Gateway connection error: {}",
                        e
                    )));
                }
                None => return Ok(None),
            }
        }
    }

    /// Forward every pushed message into `sender` until the connection ends
    /// or the receiver goes away.
    pub async fn forward(mut self, sender: mpsc::UnboundedSender<JsonValue>) -> Result<()> {
        while let Some(message) = self.next_push().await? {
            if sender.send(message).is_err() {
                debug!("Push receiver dropped, closing gateway session");
                break;
            }
        }
        self.close().await
    }

    pub async fn close(mut self) -> Result<()> {
        match self.ws.close(None).await {
            Ok(()) => Ok(()),
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(NodeLinkError::Transport(format!(
                "Failed to close gateway connection: {}",
                e
            ))),
        }
    }
}
