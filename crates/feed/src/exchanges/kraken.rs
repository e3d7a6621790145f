//! Kraken public WebSocket feed (v1)
//!
//! Book channels send a snapshot followed by deltas, folded into a
//! [`LocalBook`] per pair. Kraken names bitcoin `XBT` and dogecoin `XDG`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use aggregator_core::{
    canonical_symbol, Channel, FeedError, FeedResult, NormalizedRecord, PriceLevel, Side, Trade,
};

use super::{get_json, invalid, parse_decimal, run_socket, FeedProtocol};
use crate::book::{BookSideKind, LocalBook};
use crate::connector::{FeedSource, RecordCallback, Subscription};

pub const EXCHANGE: &str = "kraken";
const WS_URL: &str = "wss://ws.kraken.com";
const ASSET_PAIRS_URL: &str = "https://api.kraken.com/0/public/AssetPairs";
const BOOK_DEPTHS: [usize; 5] = [10, 25, 100, 500, 1000];

const ALIASES: [(&str, &str); 2] = [("BTC", "XBT"), ("DOGE", "XDG")];

/// `BTC-USD` -> `XBT/USD`
pub fn to_native(symbol: &str) -> String {
    symbol
        .split('-')
        .map(|part| {
            ALIASES
                .iter()
                .find(|(common, _)| *common == part)
                .map_or(part, |(_, native)| *native)
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// `XBT/USD` -> `BTC-USD`
pub fn from_native(pair: &str) -> String {
    let symbol = pair
        .split('/')
        .map(|part| {
            ALIASES
                .iter()
                .find(|(_, native)| *native == part)
                .map_or(part, |(common, _)| *common)
        })
        .collect::<Vec<_>>()
        .join("-");
    canonical_symbol(&symbol)
}

pub struct KrakenSource {
    http: reqwest::Client,
    ws_url: String,
    asset_pairs_url: String,
}

impl KrakenSource {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_endpoints(http, WS_URL, ASSET_PAIRS_URL)
    }

    pub fn with_endpoints(http: reqwest::Client, ws_url: &str, asset_pairs_url: &str) -> Self {
        Self {
            http,
            ws_url: ws_url.to_string(),
            asset_pairs_url: asset_pairs_url.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AssetPairsResponse {
    #[serde(default)]
    error: Vec<String>,
    #[serde(default)]
    result: HashMap<String, AssetPair>,
}

#[derive(Debug, Deserialize)]
struct AssetPair {
    wsname: Option<String>,
}

#[async_trait]
impl FeedSource for KrakenSource {
    fn exchange(&self) -> &str {
        EXCHANGE
    }

    async fn list_symbols(&self) -> FeedResult<Vec<String>> {
        let response: AssetPairsResponse = get_json(&self.http, &self.asset_pairs_url).await?;
        if !response.error.is_empty() {
            return Err(FeedError::ConnectionFailed(response.error.join("; ")));
        }

        let mut symbols: Vec<String> = response
            .result
            .into_values()
            .filter_map(|pair| pair.wsname)
            .map(|wsname| from_native(&wsname))
            .collect();
        symbols.sort();
        Ok(symbols)
    }

    async fn stream(
        &self,
        subscription: &Subscription,
        on_record: &RecordCallback,
    ) -> FeedResult<()> {
        let protocol = KrakenProtocol::new(&self.ws_url, subscription);
        run_socket(EXCHANGE, protocol, on_record).await
    }
}

enum BookUpdate {
    Snapshot {
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        ts: Option<f64>,
    },
    Delta {
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        ts: Option<f64>,
    },
}

pub(crate) struct KrakenProtocol {
    ws_url: String,
    subscription: Subscription,
    books: HashMap<String, LocalBook>,
}

impl KrakenProtocol {
    pub(crate) fn new(ws_url: &str, subscription: &Subscription) -> Self {
        Self {
            ws_url: ws_url.to_string(),
            subscription: subscription.clone(),
            books: HashMap::new(),
        }
    }

    fn subscribed_depth(&self) -> usize {
        BOOK_DEPTHS
            .into_iter()
            .find(|depth| *depth >= self.subscription.book_depth)
            .unwrap_or(BOOK_DEPTHS[BOOK_DEPTHS.len() - 1])
    }

    fn on_event(&self, event: &Map<String, Value>) -> FeedResult<()> {
        let name = event.get("event").and_then(Value::as_str).unwrap_or_default();
        let status = event.get("status").and_then(Value::as_str).unwrap_or_default();

        if (name == "subscriptionStatus" && status == "error") || name == "error" {
            let message = event
                .get("errorMessage")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            let pair = event.get("pair").and_then(Value::as_str);
            return Err(classify_error(message, pair));
        }
        Ok(())
    }

    fn on_channel_message(
        &mut self,
        items: &[Value],
        out: &mut Vec<NormalizedRecord>,
    ) -> FeedResult<()> {
        if items.len() < 4 {
            return Err(invalid(format!("short channel message ({} items)", items.len())));
        }
        let channel_name = items[items.len() - 2]
            .as_str()
            .ok_or_else(|| invalid("missing channel name"))?;
        let pair = items[items.len() - 1]
            .as_str()
            .ok_or_else(|| invalid("missing pair"))?;
        let payloads = &items[1..items.len() - 2];
        let symbol = from_native(pair);

        if channel_name == "trade" {
            if self.subscription.wants(Channel::Trades) {
                // All or nothing per frame
                let mut trades = vec![];
                for payload in payloads {
                    self.on_trades(&symbol, payload, &mut trades)?;
                }
                out.extend(trades);
            }
            Ok(())
        } else if channel_name.starts_with("book") {
            if self.subscription.wants(Channel::Book) {
                self.on_book(&symbol, payloads, out)?;
            }
            Ok(())
        } else {
            Ok(())
        }
    }

    fn on_trades(
        &self,
        symbol: &str,
        payload: &Value,
        out: &mut Vec<NormalizedRecord>,
    ) -> FeedResult<()> {
        let trades = payload
            .as_array()
            .ok_or_else(|| invalid("trade payload is not an array"))?;

        for entry in trades {
            let fields = entry
                .as_array()
                .filter(|f| f.len() >= 4)
                .ok_or_else(|| invalid("short trade entry"))?;

            let side = match fields[3].as_str() {
                Some("b") => Side::Buy,
                Some("s") => Side::Sell,
                other => return Err(invalid(format!("unknown side {:?}", other))),
            };
            let trade = Trade {
                side,
                price: parse_decimal(str_field(&fields[0])?)?,
                amount: parse_decimal(str_field(&fields[1])?)?,
                id: None,
            };
            let timestamp = str_field(&fields[2])?.parse::<f64>().ok();

            let record = NormalizedRecord::trade(EXCHANGE, symbol, trade, timestamp)
                .map_err(|e| invalid(e.to_string()))?;
            out.push(record);
        }
        Ok(())
    }

    fn on_book(
        &mut self,
        symbol: &str,
        payloads: &[Value],
        out: &mut Vec<NormalizedRecord>,
    ) -> FeedResult<()> {
        // Parse the whole frame before touching the book
        let mut updates = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let sides = payload
                .as_object()
                .ok_or_else(|| invalid("book payload is not an object"))?;

            if sides.contains_key("as") || sides.contains_key("bs") {
                let (bids, bid_ts) = parse_levels(sides.get("bs"))?;
                let (asks, ask_ts) = parse_levels(sides.get("as"))?;
                updates.push(BookUpdate::Snapshot {
                    bids,
                    asks,
                    ts: max_ts(bid_ts, ask_ts),
                });
            } else {
                let (bids, bid_ts) = parse_levels(sides.get("b"))?;
                let (asks, ask_ts) = parse_levels(sides.get("a"))?;
                updates.push(BookUpdate::Delta {
                    bids,
                    asks,
                    ts: max_ts(bid_ts, ask_ts),
                });
            }
        }

        let depth = self.subscription.book_depth;
        let retained = self.subscribed_depth();
        let book = self
            .books
            .entry(symbol.to_string())
            .or_insert_with(|| LocalBook::with_retained(depth, retained));

        let mut latest: Option<f64> = None;
        for update in updates {
            match update {
                BookUpdate::Snapshot { bids, asks, ts } => {
                    book.apply_snapshot(&bids, &asks);
                    latest = max_ts(latest, ts);
                }
                BookUpdate::Delta { bids, asks, ts } => {
                    for level in bids {
                        book.apply_update(BookSideKind::Bid, level.price, level.size);
                    }
                    for level in asks {
                        book.apply_update(BookSideKind::Ask, level.price, level.size);
                    }
                    latest = max_ts(latest, ts);
                }
            }
        }

        let snapshot = book.snapshot();
        if snapshot.is_empty() {
            return Ok(());
        }
        let record = NormalizedRecord::book(EXCHANGE, symbol, snapshot, latest)
            .map_err(|e| invalid(e.to_string()))?;
        out.push(record);
        Ok(())
    }
}

impl FeedProtocol for KrakenProtocol {
    fn url(&self) -> String {
        self.ws_url.clone()
    }

    fn subscribe_messages(&self) -> Vec<String> {
        let pairs: Vec<String> = self.subscription.symbols.iter().map(|s| to_native(s)).collect();
        let mut messages = vec![];

        if self.subscription.wants(Channel::Book) {
            messages.push(
                json!({
                    "event": "subscribe",
                    "pair": pairs,
                    "subscription": {"name": "book", "depth": self.subscribed_depth()},
                })
                .to_string(),
            );
        }
        if self.subscription.wants(Channel::Trades) {
            messages.push(
                json!({
                    "event": "subscribe",
                    "pair": pairs,
                    "subscription": {"name": "trade"},
                })
                .to_string(),
            );
        }
        messages
    }

    fn idle_timeout(&self) -> Duration {
        // Kraken heartbeats every second when idle
        Duration::from_secs(30)
    }

    fn handle_text(&mut self, text: &str, out: &mut Vec<NormalizedRecord>) -> FeedResult<()> {
        let value: Value = serde_json::from_str(text).map_err(|e| invalid(e.to_string()))?;

        match value {
            Value::Object(event) => self.on_event(&event),
            Value::Array(items) => self.on_channel_message(&items, out),
            _ => Err(invalid("unexpected frame type")),
        }
    }
}

fn str_field(value: &Value) -> FeedResult<&str> {
    value
        .as_str()
        .ok_or_else(|| invalid(format!("expected string, got {}", value)))
}

/// Levels are `[price, volume, timestamp, ...]`
fn parse_levels(levels: Option<&Value>) -> FeedResult<(Vec<PriceLevel>, Option<f64>)> {
    let Some(levels) = levels else {
        return Ok((vec![], None));
    };
    let levels = levels
        .as_array()
        .ok_or_else(|| invalid("book levels are not an array"))?;

    let mut parsed = Vec::with_capacity(levels.len());
    let mut latest = None;
    for level in levels {
        let fields = level
            .as_array()
            .filter(|f| f.len() >= 3)
            .ok_or_else(|| invalid("short book level"))?;
        parsed.push(PriceLevel::new(
            parse_decimal(str_field(&fields[0])?)?,
            parse_decimal(str_field(&fields[1])?)?,
        ));
        latest = max_ts(latest, str_field(&fields[2])?.parse::<f64>().ok());
    }
    Ok((parsed, latest))
}

fn max_ts(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn classify_error(message: &str, pair: Option<&str>) -> FeedError {
    let lower = message.to_lowercase();

    if lower.contains("permission") || lower.contains("auth") {
        return FeedError::AuthenticationFailed(message.to_string());
    }
    if lower.contains("pair") && (lower.contains("not supported") || lower.contains("invalid")) {
        return FeedError::UnknownSymbol {
            exchange: EXCHANGE.to_string(),
            symbol: pair.map(from_native).unwrap_or_default(),
        };
    }
    FeedError::ConnectionFailed(message.to_string())
}
