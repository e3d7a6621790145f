//! Client subscription filters
//!
//! A client states what it wants in the request target of the WebSocket
//! handshake, e.g. `/?exchange=coinbase,kraken?book=BTC-USD?trades=BTC-USD,ETH-USD`.
//! Parameters are separated by `?` or `&`, list values by `,`. The path is
//! ignored. Values are not percent-decoded; exchange names and symbols never
//! need escaping.

use std::collections::BTreeSet;
use std::fmt;

use crate::errors::{FilterError, FilterResult};
use crate::types::{canonical_exchange, canonical_symbol, Channel, NormalizedRecord};

/// Validated subscription: at least one exchange and at least one channel
/// with at least one symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFilter {
    exchanges: BTreeSet<String>,
    book_symbols: BTreeSet<String>,
    trade_symbols: BTreeSet<String>,
}

impl SubscriptionFilter {
    pub fn new<E, B, T>(exchanges: E, book_symbols: B, trade_symbols: T) -> FilterResult<Self>
    where
        E: IntoIterator,
        E::Item: AsRef<str>,
        B: IntoIterator,
        B::Item: AsRef<str>,
        T: IntoIterator,
        T::Item: AsRef<str>,
    {
        let exchanges = collect_values(exchanges, canonical_exchange);
        let book_symbols = collect_values(book_symbols, canonical_symbol);
        let trade_symbols = collect_values(trade_symbols, canonical_symbol);

        if exchanges.is_empty() {
            return Err(FilterError::MissingExchange);
        }
        if book_symbols.is_empty() && trade_symbols.is_empty() {
            return Err(FilterError::MissingChannel);
        }

        Ok(Self {
            exchanges,
            book_symbols,
            trade_symbols,
        })
    }

    /// Parse a handshake request target into a filter
    pub fn parse(target: &str) -> FilterResult<Self> {
        let query = target.split_once('?').map_or("", |(_, query)| query);

        let mut exchanges = Vec::new();
        let mut book_symbols = Vec::new();
        let mut trade_symbols = Vec::new();

        for param in query.split(['?', '&']).filter(|p| !p.is_empty()) {
            let (name, value) = param
                .split_once('=')
                .ok_or_else(|| FilterError::MalformedParameter(param.to_string()))?;

            let values = value.split(',').map(str::to_string);

            if name.eq_ignore_ascii_case("exchange") {
                exchanges.extend(values);
                continue;
            }

            match Channel::parse(name) {
                Some(Channel::Book) => book_symbols.extend(values),
                Some(Channel::Trades) => trade_symbols.extend(values),
                // Unknown parameters are ignored
                None => {}
            }
        }

        Self::new(exchanges, book_symbols, trade_symbols)
    }

    pub fn exchanges(&self) -> &BTreeSet<String> {
        &self.exchanges
    }

    pub fn book_symbols(&self) -> &BTreeSet<String> {
        &self.book_symbols
    }

    pub fn trade_symbols(&self) -> &BTreeSet<String> {
        &self.trade_symbols
    }

    pub fn symbols_for(&self, channel: Channel) -> &BTreeSet<String> {
        match channel {
            Channel::Book => &self.book_symbols,
            Channel::Trades => &self.trade_symbols,
        }
    }

    /// Expects canonical exchange and symbol
    pub fn accepts(&self, exchange: &str, symbol: &str, channel: Channel) -> bool {
        self.exchanges.contains(exchange) && self.symbols_for(channel).contains(symbol)
    }

    pub fn matches(&self, record: &NormalizedRecord) -> bool {
        self.accepts(record.exchange(), record.symbol(), record.channel())
    }
}

impl fmt::Display for SubscriptionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |set: &BTreeSet<String>| set.iter().cloned().collect::<Vec<_>>().join(",");
        write!(
            f,
            "exchange={} book={} trades={}",
            join(&self.exchanges),
            join(&self.book_symbols),
            join(&self.trade_symbols)
        )
    }
}

fn collect_values<I>(values: I, canonical: fn(&str) -> String) -> BTreeSet<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    values
        .into_iter()
        .map(|v| canonical(v.as_ref()))
        .filter(|v| !v.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Side, Trade};
    use rust_decimal_macros::dec;

    fn trade(exchange: &str, symbol: &str) -> NormalizedRecord {
        let trade = Trade {
            side: Side::Sell,
            amount: dec!(1),
            price: dec!(10),
            id: None,
        };
        NormalizedRecord::trade(exchange, symbol, trade, None).unwrap()
    }

    #[test]
    fn test_parse_legacy_separators() {
        let filter = SubscriptionFilter::parse("/?exchange=coinbase?trades=BTC-USD").unwrap();

        assert!(filter.exchanges().contains("coinbase"));
        assert!(filter.trade_symbols().contains("BTC-USD"));
        assert!(filter.book_symbols().is_empty());
    }

    #[test]
    fn test_parse_standard_query_and_lists() {
        let filter =
            SubscriptionFilter::parse("/?exchange=KRAKEN,coinbase&book=btc-usd,eth-usd&trades=sol-usd")
                .unwrap();

        assert_eq!(filter.exchanges().len(), 2);
        assert!(filter.exchanges().contains("kraken"));
        assert!(filter.book_symbols().contains("BTC-USD"));
        assert!(filter.book_symbols().contains("ETH-USD"));
        assert!(filter.trade_symbols().contains("SOL-USD"));
    }

    #[test]
    fn test_parse_without_leading_slash() {
        let filter = SubscriptionFilter::parse("?exchange=kraken?book=XBT-USD").unwrap();
        assert!(filter.book_symbols().contains("XBT-USD"));
    }

    #[test]
    fn test_parse_ignores_path() {
        let filter = SubscriptionFilter::parse("/stream?exchange=coinbase&trades=BTC-USD").unwrap();
        assert!(filter.exchanges().contains("coinbase"));
        assert!(filter.trade_symbols().contains("BTC-USD"));

        assert_eq!(
            SubscriptionFilter::parse("/exchange=coinbase"),
            Err(FilterError::MissingExchange)
        );
    }

    #[test]
    fn test_missing_exchange_rejected() {
        assert_eq!(
            SubscriptionFilter::parse("/?trades=BTC-USD"),
            Err(FilterError::MissingExchange)
        );
        assert_eq!(
            SubscriptionFilter::parse("/?exchange=?trades=BTC-USD"),
            Err(FilterError::MissingExchange)
        );
    }

    #[test]
    fn test_missing_channel_rejected() {
        assert_eq!(
            SubscriptionFilter::parse("/?exchange=coinbase"),
            Err(FilterError::MissingChannel)
        );
        assert_eq!(
            SubscriptionFilter::parse("/?exchange=coinbase?book=?trades=,"),
            Err(FilterError::MissingChannel)
        );
        assert_eq!(SubscriptionFilter::parse("/"), Err(FilterError::MissingExchange));
    }

    #[test]
    fn test_malformed_parameter_rejected() {
        assert!(matches!(
            SubscriptionFilter::parse("/?exchange?trades=BTC-USD"),
            Err(FilterError::MalformedParameter(_))
        ));
    }

    #[test]
    fn test_unknown_parameters_ignored() {
        let filter =
            SubscriptionFilter::parse("/?exchange=coinbase?candles=1m?trades=BTC-USD").unwrap();
        assert_eq!(filter.trade_symbols().len(), 1);
    }

    #[test]
    fn test_matches_by_channel() {
        let filter = SubscriptionFilter::new(["coinbase"], ["ETH-USD"], ["BTC-USD"]).unwrap();

        assert!(filter.matches(&trade("coinbase", "BTC-USD")));
        assert!(!filter.matches(&trade("coinbase", "ETH-USD")));
        assert!(!filter.matches(&trade("kraken", "BTC-USD")));
        assert!(filter.accepts("coinbase", "ETH-USD", Channel::Book));
    }
}
