//! Binance spot combined-stream feed
//!
//! Subscriptions are encoded in the URL, so nothing is sent after the
//! handshake. Large subscriptions are spread over several connections to stay
//! under the per-connection stream limit. Books come from the partial depth
//! streams, which are already full top-N snapshots.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::select_all;
use serde::Deserialize;
use tracing::debug;

use aggregator_core::{
    canonical_symbol, BookSide, BookSnapshot, Channel, FeedResult, NormalizedRecord, PriceLevel,
    Side, Trade,
};

use super::{get_json, invalid, parse_decimal, run_socket, FeedProtocol};
use crate::book::SequenceGuard;
use crate::connector::{FeedSource, RecordCallback, Subscription};

pub const EXCHANGE: &str = "binance";
const WS_BASE_URL: &str = "wss://stream.binance.com:9443";
const EXCHANGE_INFO_URL: &str = "https://api.binance.com/api/v3/exchangeInfo";
const DEPTH_LEVELS: [usize; 3] = [5, 10, 20];
/// Binance accepts up to 1024; fewer keeps the URL a sane length
const MAX_STREAMS_PER_CONNECTION: usize = 200;

/// `BTC-USDT` -> `btcusdt`
pub fn to_native(symbol: &str) -> String {
    symbol.replace('-', "").to_lowercase()
}

pub struct BinanceSource {
    http: reqwest::Client,
    ws_base_url: String,
    exchange_info_url: String,
}

impl BinanceSource {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_endpoints(http, WS_BASE_URL, EXCHANGE_INFO_URL)
    }

    pub fn with_endpoints(http: reqwest::Client, ws_base_url: &str, exchange_info_url: &str) -> Self {
        Self {
            http,
            ws_base_url: ws_base_url.trim_end_matches('/').to_string(),
            exchange_info_url: exchange_info_url.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    status: String,
    base_asset: String,
    quote_asset: String,
}

#[async_trait]
impl FeedSource for BinanceSource {
    fn exchange(&self) -> &str {
        EXCHANGE
    }

    async fn list_symbols(&self) -> FeedResult<Vec<String>> {
        let info: ExchangeInfo = get_json(&self.http, &self.exchange_info_url).await?;

        let mut symbols: Vec<String> = info
            .symbols
            .into_iter()
            .filter(|s| s.status == "TRADING")
            .map(|s| canonical_symbol(&format!("{}-{}", s.base_asset, s.quote_asset)))
            .collect();
        symbols.sort();
        Ok(symbols)
    }

    async fn stream(
        &self,
        subscription: &Subscription,
        on_record: &RecordCallback,
    ) -> FeedResult<()> {
        let parts = split_subscription(subscription);
        if parts.len() == 1 {
            let protocol = BinanceProtocol::new(&self.ws_base_url, subscription);
            return run_socket(EXCHANGE, protocol, on_record).await;
        }

        let sockets = parts.iter().map(|part| {
            let protocol = BinanceProtocol::new(&self.ws_base_url, part);
            Box::pin(run_socket(EXCHANGE, protocol, on_record))
        });

        // Any connection ending tears down the rest so the connector
        // reconnects the whole subscription together
        let (outcome, index, _) = select_all(sockets).await;
        debug!(
            "Binance connection {} of {} ended: {:?}",
            index + 1,
            parts.len(),
            outcome
        );
        outcome
    }
}

/// Split a subscription so no connection carries more than
/// `MAX_STREAMS_PER_CONNECTION` streams. Always returns at least one part.
fn split_subscription(subscription: &Subscription) -> Vec<Subscription> {
    let streams_per_symbol = Channel::ALL
        .iter()
        .filter(|channel| subscription.wants(**channel))
        .count()
        .max(1);
    let symbols_per_connection = (MAX_STREAMS_PER_CONNECTION / streams_per_symbol).max(1);

    if subscription.symbols.len() <= symbols_per_connection {
        return vec![subscription.clone()];
    }

    subscription
        .symbols
        .chunks(symbols_per_connection)
        .map(|symbols| Subscription {
            symbols: symbols.to_vec(),
            ..subscription.clone()
        })
        .collect()
}

/// Combined stream envelope
#[derive(Debug, Deserialize)]
struct StreamFrame {
    stream: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TradeEvent {
    #[serde(rename = "t")]
    trade_id: u64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    trade_time: u64,
    /// Buyer was the maker, so the aggressor sold
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartialDepth {
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

pub(crate) struct BinanceProtocol {
    ws_base_url: String,
    subscription: Subscription,
    canonical: HashMap<String, String>,
    sequences: SequenceGuard,
}

impl BinanceProtocol {
    pub(crate) fn new(ws_base_url: &str, subscription: &Subscription) -> Self {
        let canonical = subscription
            .symbols
            .iter()
            .map(|symbol| (to_native(symbol), symbol.clone()))
            .collect();

        Self {
            ws_base_url: ws_base_url.to_string(),
            subscription: subscription.clone(),
            canonical,
            sequences: SequenceGuard::new(),
        }
    }

    fn depth_level(&self) -> usize {
        DEPTH_LEVELS
            .into_iter()
            .find(|level| *level >= self.subscription.book_depth)
            .unwrap_or(DEPTH_LEVELS[DEPTH_LEVELS.len() - 1])
    }

    fn stream_names(&self) -> Vec<String> {
        let depth = self.depth_level();
        let mut names = vec![];
        for native in self.subscription.symbols.iter().map(|s| to_native(s)) {
            if self.subscription.wants(Channel::Trades) {
                names.push(format!("{}@trade", native));
            }
            if self.subscription.wants(Channel::Book) {
                names.push(format!("{}@depth{}@100ms", native, depth));
            }
        }
        names
    }

    fn on_trade(
        &mut self,
        symbol: &str,
        data: serde_json::Value,
        out: &mut Vec<NormalizedRecord>,
    ) -> FeedResult<()> {
        let event: TradeEvent = serde_json::from_value(data).map_err(|e| invalid(e.to_string()))?;
        if !self.sequences.accept(symbol, Channel::Trades, event.trade_id) {
            return Ok(());
        }

        let trade = Trade {
            side: if event.buyer_is_maker { Side::Sell } else { Side::Buy },
            amount: parse_decimal(&event.quantity)?,
            price: parse_decimal(&event.price)?,
            id: Some(event.trade_id.to_string()),
        };
        let timestamp = Some(event.trade_time as f64 / 1_000.0);

        let record = NormalizedRecord::trade(EXCHANGE, symbol, trade, timestamp)
            .map_err(|e| invalid(e.to_string()))?;
        out.push(record);
        Ok(())
    }

    fn on_depth(
        &mut self,
        symbol: &str,
        data: serde_json::Value,
        out: &mut Vec<NormalizedRecord>,
    ) -> FeedResult<()> {
        let depth: PartialDepth = serde_json::from_value(data).map_err(|e| invalid(e.to_string()))?;
        if !self.sequences.accept(symbol, Channel::Book, depth.last_update_id) {
            return Ok(());
        }

        let limit = self.subscription.book_depth;
        let bid = parse_side(&depth.bids, limit)?;
        let ask = parse_side(&depth.asks, limit)?;

        let record =
            NormalizedRecord::book(EXCHANGE, symbol, BookSnapshot::new(bid, ask), None)
                .map_err(|e| invalid(e.to_string()))?;
        out.push(record);
        Ok(())
    }
}

impl FeedProtocol for BinanceProtocol {
    fn url(&self) -> String {
        format!("{}/stream?streams={}", self.ws_base_url, self.stream_names().join("/"))
    }

    fn subscribe_messages(&self) -> Vec<String> {
        vec![]
    }

    fn idle_timeout(&self) -> Duration {
        // No application heartbeat; illiquid pairs can be quiet for a while
        Duration::from_secs(600)
    }

    fn handle_text(&mut self, text: &str, out: &mut Vec<NormalizedRecord>) -> FeedResult<()> {
        let frame: StreamFrame = serde_json::from_str(text).map_err(|e| invalid(e.to_string()))?;

        let (native, kind) = frame
            .stream
            .split_once('@')
            .ok_or_else(|| invalid(format!("bad stream name {}", frame.stream)))?;
        let Some(symbol) = self.canonical.get(native).cloned() else {
            return Err(invalid(format!("unsubscribed stream {}", frame.stream)));
        };

        if kind == "trade" {
            self.on_trade(&symbol, frame.data, out)
        } else if kind.starts_with("depth") {
            self.on_depth(&symbol, frame.data, out)
        } else {
            Ok(())
        }
    }
}

fn parse_side(levels: &[[String; 2]], limit: usize) -> FeedResult<BookSide> {
    let levels = levels
        .iter()
        .take(limit)
        .map(|[price, size]| Ok(PriceLevel::new(parse_decimal(price)?, parse_decimal(size)?)))
        .collect::<FeedResult<Vec<_>>>()?;
    Ok(BookSide::new(levels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggregator_core::{FeedError, Payload};
    use rust_decimal_macros::dec;

    fn protocol(channels: Vec<Channel>, depth: usize) -> BinanceProtocol {
        let subscription = Subscription {
            symbols: vec!["BTC-USDT".into(), "ETH-USDT".into()],
            channels,
            book_depth: depth,
        };
        BinanceProtocol::new(WS_BASE_URL, &subscription)
    }

    #[test]
    fn test_stream_url() {
        let protocol = protocol(Channel::ALL.to_vec(), 8);
        assert_eq!(
            protocol.url(),
            "wss://stream.binance.com:9443/stream?streams=\
             btcusdt@trade/btcusdt@depth10@100ms/ethusdt@trade/ethusdt@depth10@100ms"
        );
        assert!(protocol.subscribe_messages().is_empty());

        let trades_only = self::protocol(vec![Channel::Trades], 10);
        assert!(!trades_only.url().contains("depth"));
    }

    #[test]
    fn test_large_subscription_spread_over_connections() {
        let subscription = Subscription {
            symbols: (0..700).map(|i| format!("C{}-USDT", i)).collect(),
            channels: Channel::ALL.to_vec(),
            book_depth: 10,
        };

        let parts = split_subscription(&subscription);
        assert_eq!(parts.len(), 7);

        let mut covered = vec![];
        for part in &parts {
            let protocol = BinanceProtocol::new(WS_BASE_URL, part);
            let streams = protocol.stream_names();
            assert!(streams.len() <= MAX_STREAMS_PER_CONNECTION);
            assert!(protocol.url().len() < 8_192);
            covered.extend(part.symbols.iter().cloned());
        }
        assert_eq!(covered, subscription.symbols);

        // Small subscriptions stay on one connection
        let small = Subscription {
            symbols: vec!["BTC-USDT".into()],
            channels: vec![Channel::Trades],
            book_depth: 10,
        };
        assert_eq!(split_subscription(&small), vec![small.clone()]);
    }

    #[test]
    fn test_trade_side_from_maker_flag() {
        let mut protocol = protocol(vec![Channel::Trades], 10);
        let mut out = vec![];

        protocol
            .handle_text(
                r#"{"stream":"btcusdt@trade","data":{"e":"trade","E":1,"s":"BTCUSDT","t":7,"p":"42000.10","q":"0.5","T":1700000000123,"m":true,"M":true}}"#,
                &mut out,
            )
            .unwrap();
        protocol
            .handle_text(
                r#"{"stream":"btcusdt@trade","data":{"e":"trade","E":1,"s":"BTCUSDT","t":8,"p":"42000.20","q":"0.1","T":1700000000200,"m":false,"M":true}}"#,
                &mut out,
            )
            .unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].symbol(), "BTC-USDT");
        assert_eq!(out[0].timestamp(), Some(1_700_000_000.123));
        match (out[0].payload(), out[1].payload()) {
            (Payload::Trade(first), Payload::Trade(second)) => {
                assert_eq!(first.side, Side::Sell);
                assert_eq!(first.price, dec!(42000.10));
                assert_eq!(second.side, Side::Buy);
            }
            other => panic!("unexpected payloads {:?}", other),
        }
    }

    #[test]
    fn test_depth_snapshot_and_stale_update() {
        let mut protocol = protocol(vec![Channel::Book], 2);
        let mut out = vec![];
        let frame = |id: u64| {
            format!(
                r#"{{"stream":"ethusdt@depth5@100ms","data":{{"lastUpdateId":{},"bids":[["2000.1","1"],["2000.0","2"],["1999.9","3"]],"asks":[["2000.2","1"]]}}}}"#,
                id
            )
        };

        protocol.handle_text(&frame(10), &mut out).unwrap();
        protocol.handle_text(&frame(9), &mut out).unwrap();

        assert_eq!(out.len(), 1);
        match out[0].payload() {
            Payload::Book(book) => {
                assert_eq!(book.bid.len(), 2);
                assert_eq!(book.best_bid().unwrap().price, dec!(2000.1));
                assert_eq!(book.best_ask().unwrap().price, dec!(2000.2));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_unknown_stream_is_malformed() {
        let mut protocol = protocol(vec![Channel::Trades], 10);
        let mut out = vec![];

        let err = protocol
            .handle_text(r#"{"stream":"dogeusdt@trade","data":{}}"#, &mut out)
            .unwrap_err();
        assert!(matches!(err, FeedError::InvalidMessage(_)));
    }
}
