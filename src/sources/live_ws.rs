//! Live feed WebSocket client
//!
//! Registers for one entity and forwards transaction and balance
//! notifications, in delivery order, to an unbounded channel.
//! Reconnects with exponential backoff until shutdown.
//!
//! Accepted frames:
//! - `{"kind": "transaction", "payload": {...}}`
//! - `{"kind": "balanceChanged", "payload": 42}`
//! - `{"event": "userHistoryUpdated", "data": {...}}`
//! - `{"event": "history:updated", "data": {"userId": .., "items": [...]}}`
//! - `{"event": "points:updated", "data": {"userId": .., "points": 42}}`

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::LiveEvent;
use crate::models::RawEvent;

/// Registration message sent after connecting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMessage {
    pub action: String, // "register"
    pub role: String,   // "user"
    #[serde(rename = "userId")]
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
enum CanonicalFrame {
    Transaction(Value),
    BalanceChanged(f64),
}

#[derive(Debug, Deserialize)]
struct EventFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Decode one text frame into zero or more live events for `entity`.
///
/// Control messages and events for other entities decode to nothing.
pub fn decode_frame(text: &str, entity: &str) -> Result<Vec<LiveEvent>> {
    let value: Value = serde_json::from_str(text).context("Frame is not JSON")?;

    if value.get("kind").is_some() {
        let frame: CanonicalFrame =
            serde_json::from_value(value).context("Malformed kind/payload frame")?;
        return Ok(match frame {
            CanonicalFrame::Transaction(payload) => {
                vec![LiveEvent::Transaction(RawEvent::new(payload))]
            }
            CanonicalFrame::BalanceChanged(points) => vec![LiveEvent::BalanceChanged(points)],
        });
    }

    if value.get("event").is_some() {
        let frame: EventFrame = serde_json::from_value(value).context("Malformed event frame")?;
        if !addressed_to(&frame.data, entity) {
            return Ok(Vec::new());
        }
        return Ok(match frame.event.as_str() {
            "userHistoryUpdated" => vec![LiveEvent::Transaction(RawEvent::new(frame.data))],
            "history:updated" => match frame.data.get("items") {
                Some(Value::Array(items)) => items
                    .iter()
                    .cloned()
                    .map(|item| LiveEvent::Transaction(RawEvent::new(item)))
                    .collect(),
                _ => Vec::new(),
            },
            "points:updated" => frame
                .data
                .get("points")
                .and_then(Value::as_f64)
                .map(|points| vec![LiveEvent::BalanceChanged(points)])
                .unwrap_or_default(),
            _ => Vec::new(),
        });
    }

    Ok(Vec::new())
}

/// Frames without a `userId` are assumed to be for the registered entity.
fn addressed_to(data: &Value, entity: &str) -> bool {
    match data.get("userId") {
        Some(Value::String(s)) => s == entity,
        Some(Value::Number(n)) => n.to_string() == entity,
        _ => true,
    }
}

pub struct LiveFeedClient {
    url: String,
    entity: String,
    auth_token: Option<String>,
    max_backoff: Duration,
    event_tx: mpsc::UnboundedSender<LiveEvent>,
}

impl LiveFeedClient {
    /// Returns the client and the receiver its events are delivered to.
    pub fn new(
        url: String,
        entity: String,
        auth_token: Option<String>,
        max_backoff: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<LiveEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let client = Self {
            url,
            entity,
            auth_token,
            max_backoff,
            event_tx,
        };
        (client, event_rx)
    }

    /// Connect and stream until shutdown, reconnecting on failure.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut reconnect_delay = Duration::from_secs(1);

        loop {
            tokio::select! {
                res = self.connect_and_stream() => match res {
                    Ok(StreamEnd::ReceiverGone) => {
                        info!("Live event consumer dropped; stopping feed");
                        return Ok(());
                    }
                    Ok(StreamEnd::Closed) => {
                        info!("Live feed closed gracefully");
                        reconnect_delay = Duration::from_secs(1);
                    }
                    Err(e) => {
                        error!("Live feed error: {:#}", e);
                        warn!("Reconnecting in {:?}...", reconnect_delay);
                        tokio::select! {
                            _ = sleep(reconnect_delay) => {}
                            _ = shutdown.recv() => return Ok(()),
                        }
                        reconnect_delay = (reconnect_delay * 2).min(self.max_backoff);
                    }
                },
                _ = shutdown.recv() => {
                    info!("Live feed shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn connect_and_stream(&self) -> Result<StreamEnd> {
        info!(entity = %self.entity, "🔌 Connecting to live feed...");

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .context("Failed to build websocket request")?;
        if let Some(token) = &self.auth_token {
            request.headers_mut().insert(
                "Authorization",
                token.parse().context("Invalid auth token")?,
            );
        }

        let (ws_stream, response) = connect_async(request)
            .await
            .context("Failed to connect to live feed")?;
        info!("✅ Live feed connected (status: {})", response.status());

        let (mut write, mut read) = ws_stream.split();

        let register = RegisterMessage {
            action: "register".to_string(),
            role: "user".to_string(),
            user_id: self.entity.clone(),
        };
        let register_json =
            serde_json::to_string(&register).context("Failed to serialize register message")?;
        write
            .send(Message::Text(register_json))
            .await
            .context("Failed to send register message")?;

        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Text(text)) => match decode_frame(&text, &self.entity) {
                    Ok(events) => {
                        for event in events {
                            if self.event_tx.send(event).is_err() {
                                return Ok(StreamEnd::ReceiverGone);
                            }
                        }
                    }
                    Err(e) => {
                        let preview: String = text.chars().take(200).collect();
                        warn!("Failed to decode live frame: {:#} | Raw: {}", e, preview);
                    }
                },
                Ok(Message::Ping(ping)) => {
                    write
                        .send(Message::Pong(ping))
                        .await
                        .context("Failed to send pong")?;
                }
                Ok(Message::Close(frame)) => {
                    info!("Live feed closed by server: {:?}", frame);
                    return Ok(StreamEnd::Closed);
                }
                Ok(Message::Binary(data)) => {
                    warn!("Unexpected binary frame: {} bytes", data.len());
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(e).context("Live feed read error");
                }
            }
        }

        debug!("Live feed stream ended");
        Ok(StreamEnd::Closed)
    }
}

enum StreamEnd {
    Closed,
    ReceiverGone,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_frames() {
        let events = decode_frame(
            r#"{"kind": "transaction", "payload": {"_id": "h1", "action": "scan"}}"#,
            "u1",
        )
        .unwrap();
        assert_eq!(
            events,
            vec![LiveEvent::Transaction(RawEvent::new(json!({"_id": "h1", "action": "scan"})))]
        );

        let events = decode_frame(r#"{"kind": "balanceChanged", "payload": 42}"#, "u1").unwrap();
        assert_eq!(events, vec![LiveEvent::BalanceChanged(42.0)]);
    }

    #[test]
    fn test_event_frames() {
        let events = decode_frame(
            r#"{"event": "points:updated", "data": {"userId": "u1", "points": 15}}"#,
            "u1",
        )
        .unwrap();
        assert_eq!(events, vec![LiveEvent::BalanceChanged(15.0)]);

        let events = decode_frame(
            r#"{"event": "history:updated", "data": {"userId": "u1", "items": [{"_id": "a"}, {"_id": "b"}]}}"#,
            "u1",
        )
        .unwrap();
        assert_eq!(events.len(), 2);

        let events = decode_frame(
            r#"{"event": "userHistoryUpdated", "data": {"_id": "a", "action": "scan"}}"#,
            "u1",
        )
        .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_other_entity_is_ignored() {
        let events = decode_frame(
            r#"{"event": "points:updated", "data": {"userId": "u2", "points": 15}}"#,
            "u1",
        )
        .unwrap();
        assert!(events.is_empty());

        let events = decode_frame(
            r#"{"event": "points:updated", "data": {"userId": 7, "points": 15}}"#,
            "7",
        )
        .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_control_and_garbage() {
        assert!(decode_frame(r#"{"status": "registered"}"#, "u1").unwrap().is_empty());
        assert!(decode_frame(r#"{"event": "reward:updated", "data": {}}"#, "u1")
            .unwrap()
            .is_empty());
        assert!(decode_frame("not json", "u1").is_err());
        assert!(decode_frame(r#"{"kind": "balanceChanged", "payload": "lots"}"#, "u1").is_err());
    }

    #[test]
    fn test_register_message_serialization() {
        let msg = RegisterMessage {
            action: "register".to_string(),
            role: "user".to_string(),
            user_id: "u1".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"userId\":\"u1\""));
        assert!(json.contains("register"));
    }
}
