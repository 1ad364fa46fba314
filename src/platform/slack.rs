use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::handler::CommandHandler;
use crate::platform::{ChatPlatform, IncomingMessage};

/// Minimal Slack Web API client
pub struct SlackClient {
    http: reqwest::Client,
    base_url: String,
    bot_token: String,
}

impl SlackClient {
    pub fn new(base_url: &str, bot_token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }

    async fn read_response(method: &str, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("Slack API {} error ({}): {}", method, status, error_body);
        }

        let body: Value = response
            .json()
            .await
            .with_context(|| format!("Failed to parse Slack {} response", method))?;

        check_ok(method, body)
    }

    /// Ask for a Socket Mode websocket URL using the app-level token
    pub async fn open_connection(&self, app_token: &str) -> Result<String> {
        let response = self
            .http
            .post(self.url("apps.connections.open"))
            .bearer_auth(app_token)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .send()
            .await
            .context("Failed to send request to Slack apps.connections.open")?;

        let body = Self::read_response("apps.connections.open", response).await?;
        body.get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("Slack apps.connections.open returned no url")
    }
}

/// Turn Slack's `{"ok": false, "error": ...}` envelope into an error
fn check_ok(method: &str, body: Value) -> Result<Value> {
    if body.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(body);
    }
    let error = body
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown_error");
    anyhow::bail!("Slack API {} failed: {}", method, error)
}

#[async_trait]
impl ChatPlatform for SlackClient {
    async fn send_message(&self, channel: &str, text: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url("chat.postMessage"))
            .bearer_auth(&self.bot_token)
            .json(&json!({ "channel": channel, "text": text }))
            .send()
            .await
            .context("Failed to send request to Slack chat.postMessage")?;

        Self::read_response("chat.postMessage", response).await?;
        Ok(())
    }

    async fn user_name(&self, user_id: &str) -> Result<String> {
        let response = self
            .http
            .get(self.url("users.info"))
            .bearer_auth(&self.bot_token)
            .query(&[("user", user_id)])
            .send()
            .await
            .context("Failed to send request to Slack users.info")?;

        let body = Self::read_response("users.info", response).await?;
        body.pointer("/user/name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("Slack users.info returned no user name")
    }
}

/// A Socket Mode frame
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    envelope_id: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    user: String,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    channel_type: String,
    #[serde(default)]
    text: String,
}

impl Envelope {
    /// The plain user message carried by an `events_api` envelope, if any.
    /// Edits, joins and other subtyped messages, as well as bot posts, are skipped.
    fn message(&self) -> Option<IncomingMessage> {
        if self.kind != "events_api" {
            return None;
        }
        let event = self.payload.as_ref()?.get("event")?;
        let event: MessageEvent = serde_json::from_value(event.clone()).ok()?;
        if event.kind != "message" || event.subtype.is_some() || event.bot_id.is_some() {
            return None;
        }
        Some(IncomingMessage {
            user: event.user,
            channel: event.channel,
            channel_type: event.channel_type,
            text: event.text,
        })
    }
}

fn ack_payload(envelope_id: &str) -> String {
    json!({ "envelope_id": envelope_id }).to_string()
}

/// Why a Socket Mode session ended without an error
#[derive(Debug)]
enum SessionEnd {
    Disconnect(Option<String>),
    Closed,
}

/// Run the Socket Mode event loop forever, reconnecting when Slack drops
/// the connection. Failing to obtain the very first connection URL is fatal.
pub async fn run(
    handler: Arc<CommandHandler>,
    client: Arc<SlackClient>,
    app_token: String,
    reconnect_delay: Duration,
) -> Result<()> {
    info!("Starting Slack Socket Mode...");

    let mut url = client
        .open_connection(&app_token)
        .await
        .context("Failed to open Slack Socket Mode connection")?;

    loop {
        let end = run_session(&handler, client.as_ref(), &url).await;
        match &end {
            Ok(SessionEnd::Disconnect(reason)) => {
                info!("Slack requested disconnect ({:?}), reconnecting", reason);
            }
            Ok(SessionEnd::Closed) => {
                warn!("Socket Mode connection closed, reconnecting");
            }
            Err(e) => {
                error!("Socket Mode session error: {:#}", e);
            }
        }

        let delay = delay_before_reconnect(&end, reconnect_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        url = loop {
            match client.open_connection(&app_token).await {
                Ok(url) => break url,
                Err(e) => {
                    error!("Failed to reopen Socket Mode connection: {:#}", e);
                    tokio::time::sleep(reconnect_delay).await;
                }
            }
        };
    }
}

/// Slack sends `disconnect` ahead of a planned connection refresh, so only
/// that case reconnects at once.
fn delay_before_reconnect(end: &Result<SessionEnd>, reconnect_delay: Duration) -> Duration {
    match end {
        Ok(SessionEnd::Disconnect(_)) => Duration::ZERO,
        Ok(SessionEnd::Closed) | Err(_) => reconnect_delay,
    }
}

async fn run_session(
    handler: &CommandHandler,
    platform: &dyn ChatPlatform,
    url: &str,
) -> Result<SessionEnd> {
    let (ws_stream, _) = connect_async(url)
        .await
        .context("Failed to connect Socket Mode websocket")?;
    let (mut write, mut read) = ws_stream.split();

    while let Some(frame) = read.next().await {
        let frame = frame.context("Socket Mode read failed")?;
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(close) => {
                debug!("Socket Mode close frame: {:?}", close);
                return Ok(SessionEnd::Closed);
            }
            // tungstenite answers pings itself
            _ => continue,
        };

        let envelope: Envelope = match serde_json::from_str(text.as_str()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Ignoring unparseable Socket Mode frame: {}", e);
                continue;
            }
        };

        // Slack redelivers anything not acknowledged within a few seconds
        if let Some(envelope_id) = &envelope.envelope_id {
            write
                .send(Message::Text(ack_payload(envelope_id).into()))
                .await
                .context("Failed to acknowledge Socket Mode envelope")?;
        }

        match envelope.kind.as_str() {
            "hello" => info!("Socket Mode connected"),
            "disconnect" => return Ok(SessionEnd::Disconnect(envelope.reason)),
            "events_api" => {
                let Some(msg) = envelope.message() else {
                    continue;
                };
                if !handler.matches(&msg.text) {
                    continue;
                }
                if let Err(e) = handler.handle(platform, &msg).await {
                    error!("Error handling message: {:#}", e);
                }
            }
            other => debug!("Unhandled Socket Mode envelope: {}", other),
        }
    }

    Ok(SessionEnd::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::otp::OtpSource;
    use crate::usage::{Accounting, UsageStore};
    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    struct FixedCode;

    impl OtpSource for FixedCode {
        fn current_code(&self) -> String {
            "482913".to_string()
        }
    }

    /// Records replies; looking up user "broken" fails.
    #[derive(Default)]
    struct RecordingPlatform {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChatPlatform for RecordingPlatform {
        async fn send_message(&self, channel: &str, text: &str) -> Result<()> {
            self.sent
                .lock()
                .await
                .push((channel.to_string(), text.to_string()));
            Ok(())
        }

        async fn user_name(&self, user_id: &str) -> Result<String> {
            if user_id == "broken" {
                anyhow::bail!("user_not_found");
            }
            Ok(format!("name-{}", user_id))
        }
    }

    fn message_frame(envelope_id: &str, user: &str, channel: &str, text: &str) -> String {
        json!({
            "envelope_id": envelope_id,
            "type": "events_api",
            "accepts_response_payload": false,
            "payload": {
                "event": {
                    "type": "message",
                    "user": user,
                    "channel": channel,
                    "channel_type": "im",
                    "text": text
                }
            }
        })
        .to_string()
    }

    fn envelope(raw: &str) -> Envelope {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_events_api_message_extracted() {
        let env = envelope(
            r#"{
                "envelope_id": "e-1",
                "type": "events_api",
                "accepts_response_payload": false,
                "payload": {
                    "team_id": "T1",
                    "event": {
                        "type": "message",
                        "user": "u1",
                        "channel": "D1",
                        "channel_type": "im",
                        "text": "!shopify",
                        "ts": "1700000000.000100"
                    }
                }
            }"#,
        );
        assert_eq!(env.envelope_id.as_deref(), Some("e-1"));
        assert_eq!(
            env.message(),
            Some(IncomingMessage {
                user: "u1".to_string(),
                channel: "D1".to_string(),
                channel_type: "im".to_string(),
                text: "!shopify".to_string(),
            })
        );
    }

    #[test]
    fn test_missing_event_fields_become_empty() {
        let env = envelope(
            r#"{"envelope_id": "e-2", "type": "events_api",
                "payload": {"event": {"type": "message", "text": "!shopify"}}}"#,
        );
        let msg = env.message().unwrap();
        assert!(msg.user.is_empty());
        assert!(msg.channel.is_empty());
        assert!(!msg.is_direct_message());
    }

    #[test]
    fn test_subtyped_and_bot_messages_skipped() {
        let edited = envelope(
            r#"{"type": "events_api", "payload": {"event":
                {"type": "message", "subtype": "message_changed", "channel": "D1"}}}"#,
        );
        assert_eq!(edited.message(), None);

        let from_bot = envelope(
            r#"{"type": "events_api", "payload": {"event":
                {"type": "message", "bot_id": "B1", "text": "Your TOTP code is: 1"}}}"#,
        );
        assert_eq!(from_bot.message(), None);

        let reaction = envelope(
            r#"{"type": "events_api", "payload": {"event": {"type": "reaction_added"}}}"#,
        );
        assert_eq!(reaction.message(), None);
    }

    #[test]
    fn test_control_frames() {
        let hello = envelope(r#"{"type": "hello", "num_connections": 1}"#);
        assert_eq!(hello.kind, "hello");
        assert_eq!(hello.envelope_id, None);
        assert_eq!(hello.message(), None);

        let disconnect = envelope(r#"{"type": "disconnect", "reason": "refresh_requested"}"#);
        assert_eq!(disconnect.kind, "disconnect");
        assert_eq!(disconnect.reason.as_deref(), Some("refresh_requested"));
    }

    #[test]
    fn test_ack_payload() {
        let ack: Value = serde_json::from_str(&ack_payload("e-9")).unwrap();
        assert_eq!(ack, json!({ "envelope_id": "e-9" }));
    }

    #[test]
    fn test_check_ok() {
        let body = check_ok("users.info", json!({"ok": true, "user": {"name": "alice"}})).unwrap();
        assert_eq!(body.pointer("/user/name"), Some(&json!("alice")));

        let err = check_ok("users.info", json!({"ok": false, "error": "user_not_found"}))
            .unwrap_err()
            .to_string();
        assert_eq!(err, "Slack API users.info failed: user_not_found");

        let err = check_ok("chat.postMessage", json!({})).unwrap_err().to_string();
        assert_eq!(err, "Slack API chat.postMessage failed: unknown_error");
    }

    #[test]
    fn test_client_trims_base_url() {
        let client = SlackClient::new("https://slack.com/api/", "xoxb-1");
        assert_eq!(client.url("chat.postMessage"), "https://slack.com/api/chat.postMessage");
    }

    #[test]
    fn test_reconnect_delay() {
        let delay = Duration::from_secs(5);
        assert_eq!(
            delay_before_reconnect(&Ok(SessionEnd::Disconnect(None)), delay),
            Duration::ZERO
        );
        assert_eq!(delay_before_reconnect(&Ok(SessionEnd::Closed), delay), delay);
        assert_eq!(
            delay_before_reconnect(&Err(anyhow::anyhow!("reset")), delay),
            delay
        );
    }

    #[tokio::test]
    async fn test_session_acks_filters_and_survives_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let frames = [
                (None, json!({"type": "hello", "num_connections": 1}).to_string()),
                (Some("e-1"), message_frame("e-1", "u1", "D1", "hello bot")),
                (Some("e-2"), message_frame("e-2", "broken", "D2", "!shopify")),
                (Some("e-3"), message_frame("e-3", "u1", "D1", "!shopify")),
            ];

            let mut acks = Vec::new();
            for (envelope_id, frame) in frames {
                ws.send(Message::Text(frame.into())).await.unwrap();
                if envelope_id.is_some() {
                    let ack = ws.next().await.unwrap().unwrap();
                    let ack: Value = serde_json::from_str(ack.to_text().unwrap()).unwrap();
                    acks.push(ack["envelope_id"].as_str().unwrap().to_string());
                }
            }

            let disconnect = json!({"type": "disconnect", "reason": "refresh_requested"});
            ws.send(Message::Text(disconnect.to_string().into()))
                .await
                .unwrap();
            acks
        });

        let dir = tempfile::tempdir().unwrap();
        let handler = CommandHandler::new(
            "!shopify",
            Arc::new(FixedCode),
            Accounting::enabled(UsageStore::load(&dir.path().join("user_usage.json"))),
        );
        let platform = RecordingPlatform::default();

        let end = run_session(&handler, &platform, &url).await.unwrap();

        assert!(matches!(
            end,
            SessionEnd::Disconnect(Some(ref reason)) if reason == "refresh_requested"
        ));
        assert_eq!(server.await.unwrap(), vec!["e-1", "e-2", "e-3"]);
        assert_eq!(
            *platform.sent.lock().await,
            vec![("D1".to_string(), "Your TOTP code is: 482913".to_string())]
        );
    }
}
