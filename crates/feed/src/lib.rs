//! Exchange feed ingestion
//!
//! Features:
//! - One WebSocket connector per exchange per shard, with bounded backoff
//! - Coinbase, Kraken and Binance adapters behind the `FeedSource` trait
//! - Local L2 books and duplicate/out-of-order suppression
//! - Latest-value-wins shared queue towards the distribution server
//! - Shard planning and per-shard worker threads

pub mod book;
pub mod connector;
pub mod exchanges;
pub mod queue;
pub mod shard;
pub mod worker;

pub use connector::{Backoff, ConnectorStats, ExchangeFeedConnector, FeedSource, RecordCallback, Subscription};
pub use exchanges::{build_source, SourceRegistry};
pub use queue::{QueueStats, SharedRecordQueue};
pub use shard::{filter_markets, partition, Markets, SymbolShard};
pub use worker::ShardedFeedWorker;
