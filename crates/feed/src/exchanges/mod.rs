//! Exchange adapters
//!
//! Each adapter implements [`FeedSource`] on top of a per-connection
//! [`FeedProtocol`]: the protocol value is rebuilt on every connect, so local
//! books and sequence guards never leak across reconnects.

pub mod binance;
pub mod coinbase;
pub mod kraken;

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use aggregator_core::{canonical_exchange, FeedError, FeedResult, NormalizedRecord};

use crate::connector::{FeedSource, RecordCallback};

pub use binance::BinanceSource;
pub use coinbase::CoinbaseSource;
pub use kraken::KrakenSource;

/// Wire protocol state for one upstream connection
pub(crate) trait FeedProtocol: Send {
    fn url(&self) -> String;

    /// Sent right after the handshake
    fn subscribe_messages(&self) -> Vec<String>;

    /// Silence longer than this is treated as a dead connection
    fn idle_timeout(&self) -> Duration;

    /// Normalize one text frame into `out`.
    ///
    /// `InvalidMessage` drops the frame; any other error ends the connection.
    fn handle_text(&mut self, text: &str, out: &mut Vec<NormalizedRecord>) -> FeedResult<()>;
}

/// Drive one upstream WebSocket connection until it closes or fails
pub(crate) async fn run_socket<P: FeedProtocol>(
    exchange: &str,
    mut protocol: P,
    on_record: &RecordCallback,
) -> FeedResult<()> {
    let url = protocol.url();
    debug!("Connecting to {} at {}", exchange, url);

    let (ws_stream, _) = connect_async(url.as_str()).await.map_err(map_ws_error)?;
    let (mut write, mut read) = ws_stream.split();
    info!("Connected to {}", exchange);

    for msg in protocol.subscribe_messages() {
        write.send(Message::Text(msg)).await.map_err(map_ws_error)?;
    }

    let idle_timeout = protocol.idle_timeout();
    let mut records = Vec::new();
    let mut malformed = 0u64;

    loop {
        let next = tokio::time::timeout(idle_timeout, read.next())
            .await
            .map_err(|_| FeedError::Timeout)?;

        match next {
            Some(Ok(Message::Text(text))) => {
                match protocol.handle_text(&text, &mut records) {
                    Ok(()) => {}
                    Err(FeedError::InvalidMessage(reason)) => {
                        malformed += 1;
                        if malformed == 1 || malformed % 100 == 0 {
                            warn!(
                                "Dropping malformed {} frame ({} so far): {}",
                                exchange, malformed, reason
                            );
                        }
                    }
                    Err(e) => return Err(e),
                }

                for record in records.drain(..) {
                    on_record(record);
                }
            }
            Some(Ok(Message::Ping(data))) => {
                write.send(Message::Pong(data)).await.map_err(map_ws_error)?;
            }
            Some(Ok(Message::Close(_))) | None => {
                info!("WebSocket closed by {}", exchange);
                return Ok(());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(map_ws_error(e)),
        }
    }
}

pub(crate) fn map_ws_error(error: WsError) -> FeedError {
    match error {
        WsError::Http(response) => match response.status().as_u16() {
            401 | 403 => FeedError::AuthenticationFailed(format!("HTTP {}", response.status())),
            418 | 429 => FeedError::RateLimited,
            status => FeedError::ConnectionFailed(format!("HTTP {}", status)),
        },
        WsError::ConnectionClosed | WsError::AlreadyClosed => FeedError::Disconnected,
        other => FeedError::ConnectionFailed(other.to_string()),
    }
}

/// GET a public REST endpoint and decode the JSON body
pub(crate) async fn get_json<T: DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
) -> FeedResult<T> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| FeedError::ConnectionFailed(e.to_string()))?;

    let status = response.status();
    match status.as_u16() {
        401 | 403 => return Err(FeedError::AuthenticationFailed(format!("HTTP {}", status))),
        418 | 429 => return Err(FeedError::RateLimited),
        _ if !status.is_success() => {
            return Err(FeedError::ConnectionFailed(format!("{} returned {}", url, status)))
        }
        _ => {}
    }

    response
        .json::<T>()
        .await
        .map_err(|e| FeedError::InvalidMessage(e.to_string()))
}

pub(crate) fn parse_decimal(value: &str) -> FeedResult<Decimal> {
    Decimal::from_str(value)
        .map_err(|e| FeedError::InvalidMessage(format!("bad decimal {:?}: {}", value, e)))
}

/// RFC 3339 timestamp to seconds since epoch
pub(crate) fn parse_rfc3339_seconds(value: &str) -> Option<f64> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.timestamp_micros() as f64 / 1_000_000.0)
}

pub(crate) fn invalid(reason: impl Into<String>) -> FeedError {
    FeedError::InvalidMessage(reason.into())
}

/// Build the adapter for a canonical exchange id
pub fn build_source(exchange: &str, http: &reqwest::Client) -> FeedResult<Arc<dyn FeedSource>> {
    match canonical_exchange(exchange).as_str() {
        coinbase::EXCHANGE => Ok(Arc::new(CoinbaseSource::new(http.clone()))),
        kraken::EXCHANGE => Ok(Arc::new(KrakenSource::new(http.clone()))),
        binance::EXCHANGE => Ok(Arc::new(BinanceSource::new(http.clone()))),
        other => Err(FeedError::UnknownExchange(other.to_string())),
    }
}

/// Feed sources by canonical exchange id
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<String, Arc<dyn FeedSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build adapters for every configured exchange
    pub fn for_exchanges<I>(exchanges: I, http: &reqwest::Client) -> FeedResult<Self>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut registry = Self::new();
        for exchange in exchanges {
            registry.insert(build_source(exchange.as_ref(), http)?);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, source: Arc<dyn FeedSource>) {
        self.sources
            .insert(canonical_exchange(source.exchange()), source);
    }

    pub fn get(&self, exchange: &str) -> FeedResult<Arc<dyn FeedSource>> {
        self.sources
            .get(exchange)
            .cloned()
            .ok_or_else(|| FeedError::UnknownExchange(exchange.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn FeedSource>)> {
        self.sources.iter()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_known_sources() {
        let http = reqwest::Client::new();
        let registry = SourceRegistry::for_exchanges(["Coinbase", "kraken", "BINANCE"], &http).unwrap();

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get("kraken").unwrap().exchange(), "kraken");
        assert!(matches!(
            registry.get("bitmex"),
            Err(FeedError::UnknownExchange(_))
        ));
    }

    #[test]
    fn test_unknown_exchange_is_fatal() {
        let http = reqwest::Client::new();
        let err = SourceRegistry::for_exchanges(["ftx"], &http).err().unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_decimal("0.10").unwrap().to_string(), "0.10");
        assert!(matches!(parse_decimal("abc"), Err(FeedError::InvalidMessage(_))));

        let secs = parse_rfc3339_seconds("2024-01-01T00:00:01.500000Z").unwrap();
        assert!((secs - 1_704_067_201.5).abs() < 1e-6);
        assert_eq!(parse_rfc3339_seconds("yesterday"), None);
    }
}
