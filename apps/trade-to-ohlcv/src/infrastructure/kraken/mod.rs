//! Kraken WebSocket Adapter
//!
//! Live trade feed from Kraken's public v2 API.

pub mod client;
pub mod messages;

pub use client::{FeedEvent, FeedStatus, KrakenClient, KrakenClientConfig, KrakenClientError};
pub use messages::{KrakenMessage, KrakenTrade, MessageError, SubscribeRequest, parse_frame};
