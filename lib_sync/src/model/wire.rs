//! # Realtime Wire Protocol
//!
//! Every frame on the realtime channel is a JSON envelope:
//!
//! ```json
//! { "type": "PRICE_UPDATE", "timestamp": "2024-01-02T15:04:05.000Z", "data": { ... } }
//! ```
//!
//! `SUBSCRIBE`/`UNSUBSCRIBE` flow client→server with `{ "symbols": [...] }`;
//! the remaining kinds flow server→client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::error::{Result, SyncError};

/// The `type` discriminator of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Partial price fields for one symbol.
    PriceUpdate,
    /// Market / session status.
    MarketStatus,
    /// A user-facing notification.
    Alert,
    /// Client asks to receive updates for symbols.
    Subscribe,
    /// Client stops receiving updates for symbols.
    Unsubscribe,
    /// Partial counter fields (views, comments) for one content entity.
    CounterUpdate,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    data: Value,
}

/// `PRICE_UPDATE` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    /// The holding symbol, used directly as the cache key.
    pub symbol: String,
    /// The fields that changed; merged into the cached entity.
    pub price: Map<String, Value>,
}

/// `COUNTER_UPDATE` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterUpdate {
    /// The content entity key, e.g. `post:42`.
    pub key: String,
    /// Authoritative counter values, e.g. `{"viewCount": 20}`.
    pub counters: Map<String, Value>,
}

/// `ALERT` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// The symbol the alert refers to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Human readable text.
    pub message: String,
    /// Free-form severity (`info`, `warning`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SymbolList {
    symbols: Vec<String>,
}

/// A decoded message body.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// Server → client price fields.
    PriceUpdate(PriceUpdate),
    /// Server → client market status object.
    MarketStatus(Map<String, Value>),
    /// Server → client notification.
    Alert(Alert),
    /// Client → server subscription request.
    Subscribe(BTreeSet<String>),
    /// Client → server unsubscription request.
    Unsubscribe(BTreeSet<String>),
    /// Server → client counter fields.
    CounterUpdate(CounterUpdate),
}

impl WireMessage {
    /// The envelope discriminator for this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            WireMessage::PriceUpdate(_) => MessageKind::PriceUpdate,
            WireMessage::MarketStatus(_) => MessageKind::MarketStatus,
            WireMessage::Alert(_) => MessageKind::Alert,
            WireMessage::Subscribe(_) => MessageKind::Subscribe,
            WireMessage::Unsubscribe(_) => MessageKind::Unsubscribe,
            WireMessage::CounterUpdate(_) => MessageKind::CounterUpdate,
        }
    }

    /// Stamps the message with the current time.
    pub fn into_frame(self) -> WireFrame {
        WireFrame { timestamp: Utc::now(), message: self }
    }
}

/// A message together with its envelope timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct WireFrame {
    /// When the sender produced the frame.
    pub timestamp: DateTime<Utc>,
    /// The decoded body.
    pub message: WireMessage,
}

impl WireFrame {
    /// Parses a text frame. Any deviation from the envelope schema is reported
    /// as [`SyncError::MalformedMessage`] and nothing is partially applied.
    pub fn decode(text: &str) -> Result<WireFrame> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| SyncError::MalformedMessage(format!("envelope: {}", e)))?;
        let kind = envelope.kind;
        let malformed = |e: serde_json::Error| SyncError::MalformedMessage(format!("{:?} data: {}", kind, e));

        let message = match kind {
            MessageKind::PriceUpdate => WireMessage::PriceUpdate(serde_json::from_value(envelope.data).map_err(malformed)?),
            MessageKind::CounterUpdate => WireMessage::CounterUpdate(serde_json::from_value(envelope.data).map_err(malformed)?),
            MessageKind::Alert => WireMessage::Alert(serde_json::from_value(envelope.data).map_err(malformed)?),
            MessageKind::MarketStatus => match envelope.data {
                Value::Object(map) => WireMessage::MarketStatus(map),
                other => {
                    return Err(SyncError::MalformedMessage(format!(
                        "MarketStatus data must be an object, got {}",
                        other
                    )))
                }
            },
            MessageKind::Subscribe => {
                let list: SymbolList = serde_json::from_value(envelope.data).map_err(malformed)?;
                WireMessage::Subscribe(list.symbols.into_iter().collect())
            }
            MessageKind::Unsubscribe => {
                let list: SymbolList = serde_json::from_value(envelope.data).map_err(malformed)?;
                WireMessage::Unsubscribe(list.symbols.into_iter().collect())
            }
        };

        Ok(WireFrame { timestamp: envelope.timestamp, message })
    }

    /// Renders the frame as envelope JSON.
    pub fn encode(&self) -> Result<String> {
        let data = match &self.message {
            WireMessage::PriceUpdate(update) => serde_json::to_value(update)?,
            WireMessage::CounterUpdate(update) => serde_json::to_value(update)?,
            WireMessage::Alert(alert) => serde_json::to_value(alert)?,
            WireMessage::MarketStatus(map) => Value::Object(map.clone()),
            WireMessage::Subscribe(symbols) | WireMessage::Unsubscribe(symbols) => {
                serde_json::to_value(SymbolList { symbols: symbols.iter().cloned().collect() })?
            }
        };
        let envelope = Envelope {
            kind: self.message.kind(),
            timestamp: self.timestamp,
            data,
        };
        Ok(serde_json::to_string(&envelope)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_price_update() {
        let text = r#"{"type":"PRICE_UPDATE","timestamp":"2024-03-01T14:30:00.000Z","data":{"symbol":"AAPL","price":{"last":187.2,"change":-0.4}}}"#;
        let frame = WireFrame::decode(text).expect("valid frame");
        match frame.message {
            WireMessage::PriceUpdate(update) => {
                assert_eq!(update.symbol, "AAPL");
                assert_eq!(update.price.get("last"), Some(&json!(187.2)));
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(frame.timestamp.to_rfc3339(), "2024-03-01T14:30:00+00:00");
    }

    #[test]
    fn subscribe_encodes_symbols_sorted() {
        let frame = WireMessage::Subscribe(["B".to_string(), "A".to_string()].into_iter().collect()).into_frame();
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "SUBSCRIBE");
        assert_eq!(value["data"], json!({"symbols": ["A", "B"]}));
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn rejects_unknown_type() {
        let err = WireFrame::decode(r#"{"type":"SURPRISE","data":{}}"#).unwrap_err();
        assert!(matches!(err, SyncError::MalformedMessage(_)));
    }

    #[test]
    fn rejects_price_update_without_symbol() {
        let err = WireFrame::decode(r#"{"type":"PRICE_UPDATE","data":{"price":{"last":1}}}"#).unwrap_err();
        assert!(matches!(err, SyncError::MalformedMessage(_)));
    }

    #[test]
    fn rejects_non_json() {
        assert!(WireFrame::decode("not json at all").is_err());
    }

    #[test]
    fn market_status_must_be_object() {
        assert!(WireFrame::decode(r#"{"type":"MARKET_STATUS","data":"open"}"#).is_err());
        let frame = WireFrame::decode(r#"{"type":"MARKET_STATUS","data":{"status":"OPEN"}}"#).unwrap();
        assert!(matches!(frame.message, WireMessage::MarketStatus(_)));
    }
}
