//! Symbol universe filtering and shard planning

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use aggregator_core::{canonical_symbol, split_symbol, MarketSettings};

/// Exchange id -> canonical symbols
pub type Markets = BTreeMap<String, Vec<String>>;

/// Synthetic index products, never tradable pairs
const EXCLUDED_MARKER: &str = "PINDEX";

/// A fixed subset of (exchange, symbol) pairs owned by one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolShard {
    pub id: usize,
    pub markets: Markets,
}

impl SymbolShard {
    /// Number of (exchange, symbol) pairs
    pub fn len(&self) -> usize {
        self.markets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn exchanges(&self) -> impl Iterator<Item = &str> {
        self.markets.keys().map(String::as_str)
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.markets.iter().flat_map(|(exchange, symbols)| {
            symbols
                .iter()
                .map(move |symbol| (exchange.as_str(), symbol.as_str()))
        })
    }
}

impl fmt::Display for SymbolShard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard-{} [", self.id)?;
        for (i, (exchange, symbols)) in self.markets.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", exchange, symbols.len())?;
        }
        write!(f, "]")
    }
}

/// Apply the market filters to a listed universe.
///
/// Drops index products, keeps only pairs quoted in `ref_currency` and in the
/// `pairs` allow-list when those are set. Exchanges left with nothing are
/// removed.
pub fn filter_markets(universe: Markets, settings: &MarketSettings) -> Markets {
    let allow: BTreeSet<String> = settings.pairs.iter().map(|p| canonical_symbol(p)).collect();
    let ref_currency = settings.ref_currency.as_deref().map(canonical_symbol);

    universe
        .into_iter()
        .filter_map(|(exchange, symbols)| {
            let kept: BTreeSet<String> = symbols
                .iter()
                .map(|s| canonical_symbol(s))
                .filter(|s| !s.contains(EXCLUDED_MARKER))
                .filter(|s| match &ref_currency {
                    Some(currency) => {
                        split_symbol(s).is_some_and(|(_, quote)| quote == currency)
                    }
                    None => true,
                })
                .filter(|s| allow.is_empty() || allow.contains(s))
                .collect();

            (!kept.is_empty()).then(|| (exchange, kept.into_iter().collect()))
        })
        .collect()
}

/// Split the universe into at most `workers` shards of `ceil(total / workers)`
/// pairs each. Every pair lands in exactly one shard.
pub fn partition(markets: &Markets, workers: usize) -> Vec<SymbolShard> {
    let pairs: Vec<(&String, &String)> = markets
        .iter()
        .flat_map(|(exchange, symbols)| symbols.iter().map(move |symbol| (exchange, symbol)))
        .collect();

    if pairs.is_empty() {
        return vec![];
    }

    let workers = workers.max(1);
    let chunk = pairs.len().div_ceil(workers);

    pairs
        .chunks(chunk)
        .enumerate()
        .map(|(id, chunk)| {
            let mut markets = Markets::new();
            for (exchange, symbol) in chunk {
                markets
                    .entry((*exchange).clone())
                    .or_default()
                    .push((*symbol).clone());
            }
            SymbolShard { id, markets }
        })
        .collect()
}
