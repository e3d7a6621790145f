//! Coinbase Exchange public feed
//!
//! Top-of-book comes from the `ticker` channel, trades from `matches`.
//! `heartbeat` is always subscribed so quiet products don't trip the idle
//! timeout.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use aggregator_core::{
    canonical_symbol, BookSide, BookSnapshot, Channel, FeedError, FeedResult, NormalizedRecord,
    PriceLevel, Side, Trade,
};

use super::{get_json, invalid, parse_decimal, parse_rfc3339_seconds, run_socket, FeedProtocol};
use crate::book::SequenceGuard;
use crate::connector::{FeedSource, RecordCallback, Subscription};

pub const EXCHANGE: &str = "coinbase";
const WS_URL: &str = "wss://ws-feed.exchange.coinbase.com";
const PRODUCTS_URL: &str = "https://api.exchange.coinbase.com/products";

pub struct CoinbaseSource {
    http: reqwest::Client,
    ws_url: String,
    products_url: String,
}

impl CoinbaseSource {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_endpoints(http, WS_URL, PRODUCTS_URL)
    }

    pub fn with_endpoints(http: reqwest::Client, ws_url: &str, products_url: &str) -> Self {
        Self {
            http,
            ws_url: ws_url.to_string(),
            products_url: products_url.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Product {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    trading_disabled: bool,
}

#[async_trait]
impl FeedSource for CoinbaseSource {
    fn exchange(&self) -> &str {
        EXCHANGE
    }

    async fn list_symbols(&self) -> FeedResult<Vec<String>> {
        let products: Vec<Product> = get_json(&self.http, &self.products_url).await?;

        Ok(products
            .into_iter()
            .filter(|p| p.status == "online" && !p.trading_disabled)
            .map(|p| canonical_symbol(&p.id))
            .collect())
    }

    async fn stream(
        &self,
        subscription: &Subscription,
        on_record: &RecordCallback,
    ) -> FeedResult<()> {
        let protocol = CoinbaseProtocol::new(&self.ws_url, subscription);
        run_socket(EXCHANGE, protocol, on_record).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CoinbaseMessage {
    Error {
        message: String,
        #[serde(default)]
        reason: Option<String>,
    },
    Ticker(Ticker),
    Match(Match),
    LastMatch(Match),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Ticker {
    product_id: String,
    sequence: Option<u64>,
    best_bid: Option<String>,
    best_bid_size: Option<String>,
    best_ask: Option<String>,
    best_ask_size: Option<String>,
    time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Match {
    trade_id: u64,
    product_id: String,
    size: String,
    price: String,
    /// Maker side
    side: String,
    time: Option<String>,
}

pub(crate) struct CoinbaseProtocol {
    ws_url: String,
    subscription: Subscription,
    sequences: SequenceGuard,
}

impl CoinbaseProtocol {
    pub(crate) fn new(ws_url: &str, subscription: &Subscription) -> Self {
        Self {
            ws_url: ws_url.to_string(),
            subscription: subscription.clone(),
            sequences: SequenceGuard::new(),
        }
    }

    fn on_ticker(&mut self, ticker: Ticker, out: &mut Vec<NormalizedRecord>) -> FeedResult<()> {
        if !self.subscription.wants(Channel::Book) {
            return Ok(());
        }
        let symbol = canonical_symbol(&ticker.product_id);
        if let Some(sequence) = ticker.sequence {
            if !self.sequences.accept(&symbol, Channel::Book, sequence) {
                return Ok(());
            }
        }

        let bid = top_level(ticker.best_bid.as_deref(), ticker.best_bid_size.as_deref())?;
        let ask = top_level(ticker.best_ask.as_deref(), ticker.best_ask_size.as_deref())?;
        let book = BookSnapshot::new(BookSide::new(bid), BookSide::new(ask));
        if book.is_empty() {
            return Ok(());
        }

        let timestamp = ticker.time.as_deref().and_then(parse_rfc3339_seconds);
        let record = NormalizedRecord::book(EXCHANGE, &symbol, book, timestamp)
            .map_err(|e| invalid(e.to_string()))?;
        out.push(record);
        Ok(())
    }

    fn on_match(&mut self, m: Match, out: &mut Vec<NormalizedRecord>) -> FeedResult<()> {
        if !self.subscription.wants(Channel::Trades) {
            return Ok(());
        }
        let symbol = canonical_symbol(&m.product_id);
        if !self.sequences.accept(&symbol, Channel::Trades, m.trade_id) {
            return Ok(());
        }

        // The reported side is the maker's; the aggressor is the opposite
        let side = match m.side.as_str() {
            "buy" => Side::Sell,
            "sell" => Side::Buy,
            other => return Err(invalid(format!("unknown side {:?}", other))),
        };
        let trade = Trade {
            side,
            amount: parse_decimal(&m.size)?,
            price: parse_decimal(&m.price)?,
            id: Some(m.trade_id.to_string()),
        };

        let timestamp = m.time.as_deref().and_then(parse_rfc3339_seconds);
        let record = NormalizedRecord::trade(EXCHANGE, &symbol, trade, timestamp)
            .map_err(|e| invalid(e.to_string()))?;
        out.push(record);
        Ok(())
    }
}

impl FeedProtocol for CoinbaseProtocol {
    fn url(&self) -> String {
        self.ws_url.clone()
    }

    fn subscribe_messages(&self) -> Vec<String> {
        let mut channels = vec!["heartbeat"];
        if self.subscription.wants(Channel::Book) {
            channels.push("ticker");
        }
        if self.subscription.wants(Channel::Trades) {
            channels.push("matches");
        }

        vec![json!({
            "type": "subscribe",
            "product_ids": self.subscription.symbols,
            "channels": channels,
        })
        .to_string()]
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn handle_text(&mut self, text: &str, out: &mut Vec<NormalizedRecord>) -> FeedResult<()> {
        let message: CoinbaseMessage =
            serde_json::from_str(text).map_err(|e| invalid(e.to_string()))?;

        match message {
            CoinbaseMessage::Error { message, reason } => {
                Err(classify_error(&message, reason.as_deref().unwrap_or_default()))
            }
            CoinbaseMessage::Ticker(ticker) => self.on_ticker(ticker, out),
            CoinbaseMessage::Match(m) | CoinbaseMessage::LastMatch(m) => self.on_match(m, out),
            CoinbaseMessage::Other => Ok(()),
        }
    }
}

fn top_level(price: Option<&str>, size: Option<&str>) -> FeedResult<Vec<PriceLevel>> {
    match (price, size) {
        (Some(price), Some(size)) => Ok(vec![PriceLevel::new(
            parse_decimal(price)?,
            parse_decimal(size)?,
        )]),
        _ => Ok(vec![]),
    }
}

fn classify_error(message: &str, reason: &str) -> FeedError {
    let text = format!("{} {}", message, reason).to_lowercase();

    if text.contains("auth") || text.contains("signature") || text.contains("unauthorized") {
        return FeedError::AuthenticationFailed(format!("{}: {}", message, reason));
    }
    if text.contains("not a valid product") {
        let symbol = reason.split_whitespace().next().unwrap_or_default();
        return FeedError::UnknownSymbol {
            exchange: EXCHANGE.to_string(),
            symbol: symbol.to_string(),
        };
    }
    FeedError::ConnectionFailed(format!("{}: {}", message, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn protocol(channels: Vec<Channel>) -> CoinbaseProtocol {
        let subscription = Subscription {
            symbols: vec!["BTC-USD".into(), "ETH-USD".into()],
            channels,
            book_depth: 10,
        };
        CoinbaseProtocol::new(WS_URL, &subscription)
    }

    #[test]
    fn test_subscribe_message() {
        let protocol = protocol(Channel::ALL.to_vec());
        let messages = protocol.subscribe_messages();
        let msg: serde_json::Value = serde_json::from_str(&messages[0]).unwrap();

        assert_eq!(msg["type"], "subscribe");
        assert_eq!(msg["product_ids"][1], "ETH-USD");
        assert_eq!(msg["channels"], json!(["heartbeat", "ticker", "matches"]));
    }

    #[test]
    fn test_ticker_becomes_top_of_book() {
        let mut protocol = protocol(Channel::ALL.to_vec());
        let mut out = vec![];
        protocol
            .handle_text(
                r#"{"type":"ticker","sequence":5,"product_id":"BTC-USD","price":"50000.01",
                    "best_bid":"50000.00","best_bid_size":"0.5","best_ask":"50000.02",
                    "best_ask_size":"1.25","time":"2024-01-01T00:00:00.000000Z"}"#,
                &mut out,
            )
            .unwrap();

        assert_eq!(out.len(), 1);
        let record = &out[0];
        assert_eq!(record.channel(), Channel::Book);
        assert_eq!(record.exchange(), "coinbase");
        match record.payload() {
            aggregator_core::Payload::Book(book) => {
                assert_eq!(book.best_bid().unwrap().price, dec!(50000.00));
                assert_eq!(book.best_ask().unwrap().size, dec!(1.25));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_match_flips_maker_side_and_drops_duplicates() {
        let mut protocol = protocol(vec![Channel::Trades]);
        let text = r#"{"type":"match","trade_id":10,"sequence":50,"product_id":"BTC-USD",
            "size":"0.1","price":"50000","side":"buy","time":"2024-01-01T00:00:00Z"}"#;

        let mut out = vec![];
        protocol.handle_text(text, &mut out).unwrap();
        protocol.handle_text(text, &mut out).unwrap();

        assert_eq!(out.len(), 1);
        match out[0].payload() {
            aggregator_core::Payload::Trade(trade) => {
                assert_eq!(trade.side, Side::Sell);
                assert_eq!(trade.price, dec!(50000));
                assert_eq!(trade.amount, dec!(0.1));
                assert_eq!(trade.id.as_deref(), Some("10"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_unsubscribed_channel_ignored() {
        let mut protocol = protocol(vec![Channel::Trades]);
        let mut out = vec![];
        protocol
            .handle_text(
                r#"{"type":"ticker","product_id":"BTC-USD","best_bid":"1","best_bid_size":"1"}"#,
                &mut out,
            )
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_control_messages_ignored() {
        let mut protocol = protocol(Channel::ALL.to_vec());
        let mut out = vec![];
        protocol
            .handle_text(r#"{"type":"subscriptions","channels":[]}"#, &mut out)
            .unwrap();
        protocol
            .handle_text(
                r#"{"type":"heartbeat","sequence":1,"last_trade_id":2,"product_id":"BTC-USD"}"#,
                &mut out,
            )
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_malformed_frame_is_invalid_message() {
        let mut protocol = protocol(Channel::ALL.to_vec());
        let mut out = vec![];

        let err = protocol.handle_text("not json", &mut out).unwrap_err();
        assert!(matches!(err, FeedError::InvalidMessage(_)));

        let err = protocol
            .handle_text(
                r#"{"type":"match","trade_id":1,"product_id":"BTC-USD","size":"x","price":"1","side":"buy"}"#,
                &mut out,
            )
            .unwrap_err();
        assert!(matches!(err, FeedError::InvalidMessage(_)));
    }

    #[test]
    fn test_error_classification() {
        let mut protocol = protocol(Channel::ALL.to_vec());
        let mut out = vec![];

        let err = protocol
            .handle_text(
                r#"{"type":"error","message":"Failed to subscribe","reason":"FOO-BAR is not a valid product"}"#,
                &mut out,
            )
            .unwrap_err();
        assert_eq!(
            err,
            FeedError::UnknownSymbol {
                exchange: "coinbase".into(),
                symbol: "FOO-BAR".into()
            }
        );

        let err = protocol
            .handle_text(
                r#"{"type":"error","message":"Authentication Failed","reason":"invalid signature"}"#,
                &mut out,
            )
            .unwrap_err();
        assert!(err.is_fatal());

        let err = protocol
            .handle_text(r#"{"type":"error","message":"slow down"}"#, &mut out)
            .unwrap_err();
        assert!(!err.is_fatal());
    }
}
