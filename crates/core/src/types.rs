//! Core type definitions

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::errors::{CoreError, CoreResult};

/// Literal frame sent to idle sessions
pub const HEARTBEAT_FRAME: &str = "heartbeat";

/// Literal frame sent before closing a connection with a bad filter
pub const INVALID_PARAMETERS_FRAME: &str = "Invalid parameters";

/// Feed channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Book,
    Trades,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Book, Channel::Trades];

    pub fn name(&self) -> &'static str {
        match self {
            Channel::Book => "book",
            Channel::Trades => "trades",
        }
    }

    /// Case-insensitive lookup by query parameter name
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|channel| channel.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Trade aggressor side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// Canonical exchange ids are lowercase (`coinbase`, `kraken`)
pub fn canonical_exchange(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// Canonical symbols are uppercase and hyphenated (`BTC-USD`)
pub fn canonical_symbol(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}

/// Split a canonical symbol into `(base, quote)`
pub fn split_symbol(symbol: &str) -> Option<(&str, &str)> {
    symbol
        .split_once('-')
        .filter(|(base, quote)| !base.is_empty() && !quote.is_empty())
}

/// A single book level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// One side of a book, best level first.
///
/// Serializes as a JSON object of `price -> size`, preserving level order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookSide(Vec<PriceLevel>);

impl BookSide {
    pub fn new(levels: Vec<PriceLevel>) -> Self {
        Self(levels)
    }

    pub fn best(&self) -> Option<&PriceLevel> {
        self.0.first()
    }

    pub fn levels(&self) -> &[PriceLevel] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for BookSide {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for level in &self.0 {
            map.serialize_entry(
                &level.price.normalize().to_string(),
                &level.size.to_f64().unwrap_or_default(),
            )?;
        }
        map.end()
    }
}

/// Depth snapshot, at minimum top-of-book
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BookSnapshot {
    pub bid: BookSide,
    pub ask: BookSide,
}

impl BookSnapshot {
    pub fn new(bid: BookSide, ask: BookSide) -> Self {
        Self { bid, ask }
    }

    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bid.best()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.ask.best()
    }

    pub fn is_empty(&self) -> bool {
        self.bid.is_empty() && self.ask.is_empty()
    }
}

/// A trade print
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Trade {
    pub side: Side,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Channel-dependent payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Book(BookSnapshot),
    Trade(Trade),
}

impl Payload {
    pub fn channel(&self) -> Channel {
        match self {
            Payload::Book(_) => Channel::Book,
            Payload::Trade(_) => Channel::Trades,
        }
    }
}

/// Latest-value-wins key: one slot family per (exchange, symbol, channel)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub exchange: String,
    pub symbol: String,
    pub channel: Channel,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.exchange, self.symbol, self.channel)
    }
}

/// One normalized book or trade update.
///
/// Immutable once built; `exchange` and `symbol` are always populated.
#[derive(Debug, Clone)]
pub struct NormalizedRecord {
    exchange: String,
    symbol: String,
    payload: Payload,
    timestamp: Option<f64>,
    receipt_timestamp: DateTime<Utc>,
    observed_at: Instant,
}

impl NormalizedRecord {
    /// Build a record, canonicalizing exchange and symbol.
    ///
    /// `timestamp` is the exchange-reported event time in seconds since epoch.
    pub fn new(
        exchange: &str,
        symbol: &str,
        payload: Payload,
        timestamp: Option<f64>,
    ) -> CoreResult<Self> {
        let exchange = canonical_exchange(exchange);
        let symbol = canonical_symbol(symbol);

        if exchange.is_empty() {
            return Err(CoreError::InvalidRecord("empty exchange".to_string()));
        }
        if symbol.is_empty() {
            return Err(CoreError::InvalidRecord("empty symbol".to_string()));
        }

        Ok(Self {
            exchange,
            symbol,
            payload,
            timestamp,
            receipt_timestamp: Utc::now(),
            observed_at: Instant::now(),
        })
    }

    pub fn book(
        exchange: &str,
        symbol: &str,
        book: BookSnapshot,
        timestamp: Option<f64>,
    ) -> CoreResult<Self> {
        Self::new(exchange, symbol, Payload::Book(book), timestamp)
    }

    pub fn trade(
        exchange: &str,
        symbol: &str,
        trade: Trade,
        timestamp: Option<f64>,
    ) -> CoreResult<Self> {
        Self::new(exchange, symbol, Payload::Trade(trade), timestamp)
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn channel(&self) -> Channel {
        self.payload.channel()
    }

    pub fn timestamp(&self) -> Option<f64> {
        self.timestamp
    }

    pub fn receipt_timestamp(&self) -> DateTime<Utc> {
        self.receipt_timestamp
    }

    /// Monotonic ingestion instant, used for ordering and latency
    pub fn observed_at(&self) -> Instant {
        self.observed_at
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            exchange: self.exchange.clone(),
            symbol: self.symbol.clone(),
            channel: self.channel(),
        }
    }

    /// Encode as an outbound frame: `{"book": {...}}` or `{"trades": {...}}`
    pub fn to_frame(&self) -> CoreResult<String> {
        let receipt_timestamp = self.receipt_timestamp.timestamp_micros() as f64 / 1_000_000.0;

        let frame = match &self.payload {
            Payload::Book(book) => Frame::Book(BookFrame {
                exchange: &self.exchange,
                symbol: &self.symbol,
                book,
                timestamp: self.timestamp,
                receipt_timestamp,
            }),
            Payload::Trade(trade) => Frame::Trades(TradeFrame {
                exchange: &self.exchange,
                symbol: &self.symbol,
                trade,
                timestamp: self.timestamp,
                receipt_timestamp,
            }),
        };

        serde_json::to_string(&frame).map_err(|e| CoreError::SerializationError(e.to_string()))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
enum Frame<'a> {
    Book(BookFrame<'a>),
    Trades(TradeFrame<'a>),
}

#[derive(Serialize)]
struct BookFrame<'a> {
    exchange: &'a str,
    symbol: &'a str,
    book: &'a BookSnapshot,
    timestamp: Option<f64>,
    receipt_timestamp: f64,
}

#[derive(Serialize)]
struct TradeFrame<'a> {
    exchange: &'a str,
    symbol: &'a str,
    #[serde(flatten)]
    trade: &'a Trade,
    timestamp: Option<f64>,
    receipt_timestamp: f64,
}
