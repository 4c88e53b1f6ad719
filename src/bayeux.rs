//! Bayeux/CometD long-poll wire client.
//!
//! Implements the handshake / subscribe / connect exchanges over HTTP
//! long-polling. The connector drives this through the `StreamTransport`
//! trait so the state machine can be exercised against a scripted transport
//! in tests.

use crate::config::UpstreamSettings;
use crate::message::{Position, RawEvent};
use crate::{BridgeError, BridgeResult};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Replay position requested on subscribe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayPosition {
    /// Only events published after the subscription (replay -1)
    NewOnly,
    /// All events the upstream still retains (replay -2)
    AllAvailable,
    /// Resume after a stored position token
    Token(String),
}

/// One event frame from a connect response, position token included
#[derive(Debug, Clone)]
pub struct EventFrame {
    pub channel: String,
    pub payload: Value,
    /// Replay token of the frame; absent frames cannot be resumed past
    pub token: Option<String>,
}

impl EventFrame {
    /// Convert into a raw event, assigning the ingestion sequence
    pub fn into_raw_event(self, seq: u64) -> Option<RawEvent> {
        let token = self.token?;
        Some(RawEvent::new(
            self.channel,
            self.payload,
            Position::new(token, seq),
        ))
    }
}

/// Transport seam between the connector state machine and the wire
///
/// Implementations keep whatever session state the protocol needs
/// (client id, access token) and re-establish it lazily: `subscribe` after a
/// connection loss performs a fresh handshake under the hood.
#[async_trait]
pub trait StreamTransport: Send {
    /// Open a session with the upstream, returning the session identifier
    async fn handshake(&mut self) -> BridgeResult<String>;

    /// Subscribe to a channel at the given replay position
    async fn subscribe(&mut self, channel: &str, replay: ReplayPosition) -> BridgeResult<()>;

    /// Issue one blocking long-poll receive, yielding zero or more frames
    async fn connect(&mut self) -> BridgeResult<Vec<EventFrame>>;

    /// Tear down the session
    async fn disconnect(&mut self) -> BridgeResult<()>;
}

/// Bayeux client over HTTP long-polling
pub struct BayeuxClient {
    http: reqwest::Client,
    settings: UpstreamSettings,
    access_token: Option<String>,
    client_id: Option<String>,
    message_id: u64,
}

impl BayeuxClient {
    /// Create a client for the configured upstream
    pub fn new(settings: UpstreamSettings) -> BridgeResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| BridgeError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            settings,
            access_token: None,
            client_id: None,
            message_id: 0,
        })
    }

    fn next_id(&mut self) -> String {
        self.message_id += 1;
        self.message_id.to_string()
    }

    /// Exchange configured credentials for a bearer token
    async fn authenticate(&mut self) -> BridgeResult<()> {
        let auth = match &self.settings.auth {
            Some(auth) => auth,
            None => return Ok(()),
        };

        let params = [
            ("grant_type", "password"),
            ("client_id", auth.client_id.as_str()),
            ("client_secret", auth.client_secret.as_str()),
            ("username", auth.username.as_str()),
            ("password", auth.password.as_str()),
        ];

        let response = self
            .http
            .post(&auth.token_url)
            .form(&params)
            .timeout(Duration::from_millis(self.settings.request_timeout_ms))
            .send()
            .await
            .map_err(|e| BridgeError::transient_with_source("Token request failed", e))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
            || status == reqwest::StatusCode::BAD_REQUEST
        {
            return Err(BridgeError::auth(format!(
                "Token endpoint rejected credentials: {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(BridgeError::transient(format!(
                "Token endpoint returned {}",
                status
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| BridgeError::transient_with_source("Invalid token response", e))?;

        match body.get("access_token").and_then(Value::as_str) {
            Some(token) => {
                self.access_token = Some(token.to_string());
                Ok(())
            }
            None => Err(BridgeError::auth("Token response missing access_token")),
        }
    }

    /// POST a Bayeux message batch and return the parsed response batch
    async fn post(&mut self, messages: Value, timeout: Duration) -> BridgeResult<Vec<Value>> {
        let mut request = self
            .http
            .post(&self.settings.endpoint)
            .json(&messages)
            .timeout(timeout);

        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            // A connect poll outliving its timeout is a missed heartbeat
            self.client_id = None;
            if e.is_timeout() {
                BridgeError::transient("Long-poll request timed out (missed heartbeat)")
            } else {
                BridgeError::transient_with_source("Upstream request failed", e)
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(BridgeError::auth(format!(
                "Upstream rejected session: {}",
                status
            )));
        }
        if !status.is_success() {
            self.client_id = None;
            return Err(BridgeError::transient(format!(
                "Upstream returned {}",
                status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| BridgeError::transient_with_source("Invalid upstream response", e))
    }
}

#[async_trait]
impl StreamTransport for BayeuxClient {
    async fn handshake(&mut self) -> BridgeResult<String> {
        if self.settings.auth.is_some() && self.access_token.is_none() {
            self.authenticate().await?;
        }

        let id = self.next_id();
        let request = json!([{
            "channel": "/meta/handshake",
            "version": "1.0",
            "supportedConnectionTypes": ["long-polling"],
            "id": id,
        }]);

        let timeout = Duration::from_millis(self.settings.request_timeout_ms);
        let response = self.post(request, timeout).await?;

        let ack = meta_message(&response, "/meta/handshake")
            .ok_or_else(|| BridgeError::transient("Handshake response missing ack"))?;

        if !is_successful(ack) {
            let error = error_text(ack);
            if error.starts_with("401") || error.starts_with("403") {
                return Err(BridgeError::auth(format!("Handshake rejected: {}", error)));
            }
            return Err(BridgeError::transient(format!(
                "Handshake failed: {}",
                error
            )));
        }

        let client_id = ack
            .get("clientId")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::transient("Handshake response missing clientId"))?
            .to_string();

        debug!(client_id, "Handshake complete");
        self.client_id = Some(client_id.clone());
        Ok(client_id)
    }

    async fn subscribe(&mut self, channel: &str, replay: ReplayPosition) -> BridgeResult<()> {
        // Re-establish the session lazily after a connection loss
        if self.client_id.is_none() {
            self.handshake().await?;
        }
        let client_id = self.client_id.clone().unwrap();

        let id = self.next_id();
        let request = json!([{
            "channel": "/meta/subscribe",
            "clientId": client_id,
            "subscription": channel,
            "id": id,
            "ext": {"replay": {(channel): replay_value(&replay)}},
        }]);

        let timeout = Duration::from_millis(self.settings.request_timeout_ms);
        let response = self.post(request, timeout).await?;

        let ack = meta_message(&response, "/meta/subscribe")
            .ok_or_else(|| BridgeError::transient("Subscribe response missing ack"))?;

        if !is_successful(ack) {
            let error = error_text(ack);
            if error.starts_with("401") || error.starts_with("403") {
                return Err(BridgeError::auth(format!("Subscribe rejected: {}", error)));
            }
            return Err(BridgeError::transient(format!(
                "Subscribe to {} failed: {}",
                channel, error
            )));
        }

        debug!(channel, ?replay, "Subscribed");
        Ok(())
    }

    async fn connect(&mut self) -> BridgeResult<Vec<EventFrame>> {
        let client_id = self
            .client_id
            .clone()
            .ok_or_else(|| BridgeError::transient("No active session"))?;

        let id = self.next_id();
        let request = json!([{
            "channel": "/meta/connect",
            "clientId": client_id,
            "connectionType": "long-polling",
            "id": id,
        }]);

        let timeout = Duration::from_millis(self.settings.connect_timeout_ms);
        let response = self.post(request, timeout).await?;

        let (ack, frames) = split_connect_response(response);

        match ack {
            Some(ack) if is_successful(&ack) => Ok(frames),
            Some(ack) => {
                // The server may ask for a fresh handshake via advice
                self.client_id = None;
                let advice = ack
                    .get("advice")
                    .and_then(|a| a.get("reconnect"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if advice == "handshake" {
                    Err(BridgeError::transient("Server requested re-handshake"))
                } else {
                    Err(BridgeError::transient(format!(
                        "Connect failed: {}",
                        error_text(&ack)
                    )))
                }
            }
            None => {
                self.client_id = None;
                Err(BridgeError::transient("Connect response missing ack"))
            }
        }
    }

    async fn disconnect(&mut self) -> BridgeResult<()> {
        let client_id = match self.client_id.take() {
            Some(id) => id,
            None => return Ok(()),
        };

        let id = self.next_id();
        let request = json!([{
            "channel": "/meta/disconnect",
            "clientId": client_id,
            "id": id,
        }]);

        let timeout = Duration::from_millis(self.settings.request_timeout_ms);
        if let Err(e) = self.post(request, timeout).await {
            warn!("Disconnect failed: {}", e);
        }
        Ok(())
    }
}

/// Bayeux replay extension value for a replay position
fn replay_value(replay: &ReplayPosition) -> Value {
    match replay {
        ReplayPosition::NewOnly => json!(-1),
        ReplayPosition::AllAvailable => json!(-2),
        // Upstreams that issued a numeric token expect a number back
        ReplayPosition::Token(token) => match token.parse::<i64>() {
            Ok(numeric) => json!(numeric),
            Err(_) => json!(token),
        },
    }
}

/// Find the acknowledgment message for a meta channel in a response batch
fn meta_message<'a>(messages: &'a [Value], channel: &str) -> Option<&'a Value> {
    messages
        .iter()
        .find(|m| m.get("channel").and_then(Value::as_str) == Some(channel))
}

fn is_successful(message: &Value) -> bool {
    message
        .get("successful")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn error_text(message: &Value) -> String {
    message
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string()
}

/// Extract the replay token from an event frame's data
///
/// Checks `data.event.replayId` first (the push-topic envelope), then a
/// top-level `replayId`. Numeric tokens are carried as their decimal string.
fn extract_token(data: &Value) -> Option<String> {
    let raw = data
        .get("event")
        .and_then(|e| e.get("replayId"))
        .or_else(|| data.get("replayId"))?;

    match raw {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Split a connect response batch into the meta ack and the event frames
fn split_connect_response(messages: Vec<Value>) -> (Option<Value>, Vec<EventFrame>) {
    let mut ack = None;
    let mut frames = Vec::new();

    for message in messages {
        let channel = message
            .get("channel")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if channel == "/meta/connect" {
            ack = Some(message);
        } else if !channel.starts_with("/meta/") && !channel.is_empty() {
            let payload = message.get("data").cloned().unwrap_or(Value::Null);
            let token = extract_token(&payload);
            frames.push(EventFrame {
                channel,
                payload,
                token,
            });
        }
    }

    (ack, frames)
}
