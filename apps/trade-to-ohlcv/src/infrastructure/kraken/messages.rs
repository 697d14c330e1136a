//! Kraken WebSocket v2 Message Types
//!
//! Wire format types for the public `trade` channel.
//!
//! # Frames
//!
//! - `{"channel":"heartbeat"}`: liveness, ignored
//! - `{"channel":"status", ...}`: exchange status, ignored
//! - `{"method":"subscribe","success":true, ...}`: subscription ack
//! - `{"channel":"trade","type":"update","data":[...]}`: trades
//!
//! # References
//!
//! - [Trade channel](https://docs.kraken.com/api/docs/websocket-v2/trade)

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::domain::market::{Trade, TradeError};

// =============================================================================
// Outbound
// =============================================================================

/// Subscription request for the trade channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscribeRequest {
    /// Always `subscribe`.
    pub method: &'static str,
    /// Channel parameters.
    pub params: SubscribeParams,
}

/// Parameters of a [`SubscribeRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscribeParams {
    /// Always `trade`.
    pub channel: &'static str,
    /// Pairs to subscribe to, e.g. `BTC/USD`.
    pub symbol: Vec<String>,
    /// Whether to replay recent trades on subscribe.
    pub snapshot: bool,
}

impl SubscribeRequest {
    /// Live trades for the given pairs, without a snapshot.
    #[must_use]
    pub const fn trades(symbols: Vec<String>) -> Self {
        Self {
            method: "subscribe",
            params: SubscribeParams {
                channel: "trade",
                symbol: symbols,
                snapshot: false,
            },
        }
    }

    /// Serialize to a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// One trade from a `trade` channel update.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KrakenTrade {
    /// Pair, e.g. `BTC/USD`.
    pub symbol: String,
    /// Execution price.
    pub price: f64,
    /// Executed quantity.
    pub qty: f64,
    /// RFC3339 execution time, e.g. `2024-06-17T09:45:38.494012Z`.
    pub timestamp: String,
    /// Taker side.
    #[serde(default)]
    pub side: Option<String>,
    /// Exchange trade id.
    #[serde(default)]
    pub trade_id: Option<u64>,
}

impl KrakenTrade {
    /// Convert into a domain trade.
    ///
    /// # Errors
    ///
    /// Returns `MessageError` if the timestamp is not RFC3339 or the trade
    /// fails validation.
    pub fn to_trade(&self) -> Result<Trade, MessageError> {
        let timestamp_ms = parse_timestamp_ms(&self.timestamp)?;
        Ok(Trade::new(
            self.symbol.clone(),
            self.price,
            self.qty,
            timestamp_ms,
        )?)
    }
}

/// Parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum KrakenMessage {
    /// Liveness frame.
    Heartbeat,
    /// Exchange status frame.
    Status,
    /// Response to a subscribe request.
    SubscribeAck {
        /// Whether the subscription was accepted.
        success: bool,
        /// Rejection reason.
        error: Option<String>,
    },
    /// Trades from the `trade` channel (snapshot or update).
    Trades(Vec<KrakenTrade>),
    /// Anything else (other channels, pong, unsubscribe acks).
    Other,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// Frame decoding failures.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// Frame was not valid JSON or had an unexpected shape.
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// Timestamp could not be parsed.
    #[error("invalid timestamp '{0}'")]
    Timestamp(String),

    /// Trade failed validation.
    #[error("invalid trade: {0}")]
    Trade(#[from] TradeError),
}

/// Classify one text frame.
///
/// # Errors
///
/// Returns `MessageError::Json` for non-JSON frames or trade frames whose
/// `data` array does not match [`KrakenTrade`].
pub fn parse_frame(text: &str) -> Result<KrakenMessage, MessageError> {
    let raw: RawFrame = serde_json::from_str(text)?;

    if let Some(method) = raw.method.as_deref() {
        return Ok(if method == "subscribe" {
            KrakenMessage::SubscribeAck {
                success: raw.success.unwrap_or(false),
                error: raw.error,
            }
        } else {
            KrakenMessage::Other
        });
    }

    match raw.channel.as_deref() {
        Some("heartbeat") => Ok(KrakenMessage::Heartbeat),
        Some("status") => Ok(KrakenMessage::Status),
        Some("trade") => {
            let trades = match raw.data {
                Some(data) => serde_json::from_value(data)?,
                None => Vec::new(),
            };
            Ok(KrakenMessage::Trades(trades))
        }
        _ => Ok(KrakenMessage::Other),
    }
}

/// Convert an RFC3339 timestamp into Unix milliseconds.
///
/// # Errors
///
/// Returns `MessageError::Timestamp` if the string is not RFC3339.
pub fn parse_timestamp_ms(timestamp: &str) -> Result<i64, MessageError> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| MessageError::Timestamp(timestamp.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_request_wire_format() {
        let json = SubscribeRequest::trades(vec!["BTC/USD".to_string()])
            .to_json()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "method": "subscribe",
                "params": {"channel": "trade", "symbol": ["BTC/USD"], "snapshot": false}
            })
        );
    }

    #[test]
    fn parses_heartbeat_and_status() {
        assert_eq!(
            parse_frame(r#"{"channel":"heartbeat"}"#).unwrap(),
            KrakenMessage::Heartbeat
        );
        assert_eq!(
            parse_frame(
                r#"{"channel":"status","type":"update","data":[{"api_version":"v2","system":"online"}]}"#
            )
            .unwrap(),
            KrakenMessage::Status
        );
    }

    #[test]
    fn parses_subscribe_acks() {
        let ok = parse_frame(
            r#"{"method":"subscribe","result":{"channel":"trade","snapshot":false,"symbol":"BTC/USD"},"success":true,"time_in":"2024-06-17T09:45:37.000000Z","time_out":"2024-06-17T09:45:37.000100Z"}"#,
        )
        .unwrap();
        assert_eq!(
            ok,
            KrakenMessage::SubscribeAck {
                success: true,
                error: None
            }
        );

        let rejected = parse_frame(
            r#"{"error":"Currency pair not supported XXX/USD","method":"subscribe","success":false}"#,
        )
        .unwrap();
        assert!(matches!(
            rejected,
            KrakenMessage::SubscribeAck { success: false, error: Some(_) }
        ));
    }

    #[test]
    fn parses_trade_update() {
        let frame = r#"{"channel":"trade","type":"update","data":[
            {"symbol":"BTC/USD","side":"buy","price":64250.1,"qty":0.0015,"ord_type":"market","trade_id":74036472,"timestamp":"2024-06-17T09:45:38.494012Z"},
            {"symbol":"BTC/USD","side":"sell","price":64249.9,"qty":0.25,"ord_type":"limit","trade_id":74036473,"timestamp":"2024-06-17T09:45:38.501Z"}
        ]}"#;

        let KrakenMessage::Trades(trades) = parse_frame(frame).unwrap() else {
            panic!("expected trades");
        };
        assert_eq!(trades.len(), 2);

        let trade = trades[0].to_trade().unwrap();
        assert_eq!(trade.symbol(), "BTC/USD");
        assert_eq!(trade.price(), 64250.1);
        assert_eq!(trade.quantity(), 0.0015);
        assert_eq!(trade.timestamp_ms(), 1_718_617_538_494);
        assert_eq!(trades[1].trade_id, Some(74_036_473));
    }

    #[test]
    fn timestamp_conversion_truncates_to_millis() {
        assert_eq!(
            parse_timestamp_ms("2024-06-17T09:36:39.467866Z").unwrap(),
            1_718_616_999_467
        );
        assert_eq!(parse_timestamp_ms("1970-01-01T00:00:00Z").unwrap(), 0);
        assert!(matches!(
            parse_timestamp_ms("yesterday"),
            Err(MessageError::Timestamp(_))
        ));
    }

    #[test]
    fn invalid_trade_values_are_reported() {
        let trade = KrakenTrade {
            symbol: "BTC/USD".to_string(),
            price: 0.0,
            qty: 1.0,
            timestamp: "2024-06-17T09:45:38Z".to_string(),
            side: None,
            trade_id: None,
        };
        assert!(matches!(trade.to_trade(), Err(MessageError::Trade(_))));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_frame("not json").is_err());
        assert!(parse_frame(r#"{"channel":"trade","data":[{"symbol":"BTC/USD"}]}"#).is_err());
    }
}
