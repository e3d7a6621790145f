//! Local L2 book maintenance and upstream sequence guards
//!
//! Exchanges that publish a snapshot followed by deltas are folded into a
//! [`LocalBook`] so downstream only ever sees depth-limited snapshots.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;

use aggregator_core::{BookSide, BookSnapshot, Channel, PriceLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSideKind {
    Bid,
    Ask,
}

/// Price-ordered book for one symbol
#[derive(Debug, Clone)]
pub struct LocalBook {
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    /// Levels per side in emitted snapshots
    depth: usize,
    /// Levels per side kept locally; at least `depth`
    retained: usize,
}

impl LocalBook {
    pub fn new(depth: usize) -> Self {
        Self::with_retained(depth, depth)
    }

    /// Keep `retained` levels per side but emit only `depth`. Use the
    /// upstream subscription depth for `retained` when the exchange does not
    /// resend deeper levels after a top level is removed.
    pub fn with_retained(depth: usize, retained: usize) -> Self {
        let depth = depth.max(1);
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            depth,
            retained: retained.max(depth),
        }
    }

    /// Replace the whole book
    pub fn apply_snapshot(&mut self, bids: &[PriceLevel], asks: &[PriceLevel]) {
        self.bids.clear();
        self.asks.clear();
        for level in bids {
            self.apply_update(BookSideKind::Bid, level.price, level.size);
        }
        for level in asks {
            self.apply_update(BookSideKind::Ask, level.price, level.size);
        }
    }

    /// Set one level; a zero size removes it
    pub fn apply_update(&mut self, side: BookSideKind, price: Decimal, size: Decimal) {
        match side {
            BookSideKind::Bid if size.is_zero() => {
                self.bids.remove(&Reverse(price));
            }
            BookSideKind::Bid => {
                self.bids.insert(Reverse(price), size);
                if self.bids.len() > self.retained {
                    self.bids.pop_last();
                }
            }
            BookSideKind::Ask if size.is_zero() => {
                self.asks.remove(&price);
            }
            BookSideKind::Ask => {
                self.asks.insert(price, size);
                if self.asks.len() > self.retained {
                    self.asks.pop_last();
                }
            }
        }
    }

    /// Depth-limited snapshot, best levels first on both sides
    pub fn snapshot(&self) -> BookSnapshot {
        let bid = self
            .bids
            .iter()
            .take(self.depth)
            .map(|(Reverse(price), size)| PriceLevel::new(*price, *size))
            .collect();
        let ask = self
            .asks
            .iter()
            .take(self.depth)
            .map(|(price, size)| PriceLevel::new(*price, *size))
            .collect();

        BookSnapshot::new(BookSide::new(bid), BookSide::new(ask))
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

/// Drops upstream events whose sequence is not newer than the last one
/// accepted for the same (symbol, channel)
#[derive(Debug, Default)]
pub struct SequenceGuard {
    last: HashMap<(String, Channel), u64>,
}

impl SequenceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, symbol: &str, channel: Channel, sequence: u64) -> bool {
        match self.last.get_mut(&(symbol.to_string(), channel)) {
            Some(last) if sequence <= *last => false,
            Some(last) => {
                *last = sequence;
                true
            }
            None => {
                self.last.insert((symbol.to_string(), channel), sequence);
                true
            }
        }
    }

    /// Forget everything, e.g. after a reconnect
    pub fn reset(&mut self) {
        self.last.clear();
    }
}
