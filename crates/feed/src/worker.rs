//! Shard workers
//!
//! A [`ShardedFeedWorker`] owns one [`SymbolShard`] and runs one
//! [`ExchangeFeedConnector`] per exchange in it, all on a dedicated OS thread
//! with its own current-thread runtime. A busy or failing shard therefore
//! never shares an executor with another shard or with client delivery.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use aggregator_core::{BackoffSettings, Channel, FeedError, MarketSettings, NormalizedRecord, WorkerError};

use crate::connector::{Backoff, ExchangeFeedConnector, RecordCallback, Subscription};
use crate::exchanges::SourceRegistry;
use crate::queue::SharedRecordQueue;
use crate::shard::SymbolShard;

pub struct ShardedFeedWorker {
    shard: SymbolShard,
    sources: SourceRegistry,
    queue: Arc<SharedRecordQueue>,
    channels: Vec<Channel>,
    book_depth: usize,
    backoff: BackoffSettings,
}

impl ShardedFeedWorker {
    pub fn new(
        shard: SymbolShard,
        sources: SourceRegistry,
        queue: Arc<SharedRecordQueue>,
        markets: &MarketSettings,
        backoff: &BackoffSettings,
    ) -> Self {
        Self {
            shard,
            sources,
            queue,
            channels: markets.channels.clone(),
            book_depth: markets.book_depth,
            backoff: backoff.clone(),
        }
    }

    pub fn shard(&self) -> &SymbolShard {
        &self.shard
    }

    /// Ingest until shutdown is signalled or a connector fails fatally.
    ///
    /// Transient upstream failures are absorbed by the connectors, so under
    /// normal operation this only returns on shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        let shard_id = self.shard.id;
        let mut connectors = JoinSet::new();

        for (exchange, symbols) in &self.shard.markets {
            let source = self.sources.get(exchange)?;
            let subscription = Subscription {
                symbols: symbols.clone(),
                channels: self.channels.clone(),
                book_depth: self.book_depth,
            };
            let connector = ExchangeFeedConnector::new(
                source,
                subscription,
                Backoff::from_settings(&self.backoff),
            );

            let queue = Arc::clone(&self.queue);
            let on_record: RecordCallback = Arc::new(move |record: NormalizedRecord| {
                queue.put(record);
            });

            info!("Shard {} starting {} connector for {} symbols", shard_id, exchange, symbols.len());
            connectors.spawn(connector.run(on_record));
        }

        let result = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender also means stop
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shard {} shutting down", shard_id);
                        break Ok(());
                    }
                }
                Some(joined) = connectors.join_next() => {
                    break Err(match joined {
                        Ok(fatal) => WorkerError::Connector(fatal),
                        Err(e) if e.is_panic() => WorkerError::Panicked(panic_message(e.into_panic())),
                        Err(e) => WorkerError::Connector(FeedError::ConnectionFailed(e.to_string())),
                    });
                }
            }
        };

        connectors.shutdown().await;
        result
    }

    /// Build a current-thread runtime and run the worker on it
    pub fn run_blocking(self, shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| WorkerError::Runtime(e.to_string()))?;

        runtime.block_on(self.run(shutdown))
    }

    /// Run on a dedicated named thread. `on_exit` receives the shard id and
    /// the outcome, including panics that escaped the runtime.
    pub fn spawn<F>(self, shutdown: watch::Receiver<bool>, on_exit: F) -> std::io::Result<JoinHandle<()>>
    where
        F: FnOnce(usize, Result<(), WorkerError>) + Send + 'static,
    {
        let shard_id = self.shard.id;

        thread::Builder::new()
            .name(format!("shard-{}", shard_id))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_blocking(shutdown)))
                    .unwrap_or_else(|payload| Err(WorkerError::Panicked(panic_message(payload))));

                if let Err(e) = &outcome {
                    error!("Shard {} worker exited: {}", shard_id, e);
                }
                on_exit(shard_id, outcome);
            })
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::FeedSource;
    use aggregator_core::{FeedResult, Side, Trade};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::mpsc;
    use std::time::Duration;

    enum Behaviour {
        Stream,
        Fatal,
        Panic,
    }

    struct MockSource {
        exchange: &'static str,
        behaviour: Behaviour,
    }

    #[async_trait]
    impl FeedSource for MockSource {
        fn exchange(&self) -> &str {
            self.exchange
        }

        async fn list_symbols(&self) -> FeedResult<Vec<String>> {
            Ok(vec![])
        }

        async fn stream(
            &self,
            subscription: &Subscription,
            on_record: &RecordCallback,
        ) -> FeedResult<()> {
            match self.behaviour {
                Behaviour::Fatal => {
                    return Err(FeedError::AuthenticationFailed("revoked".into()));
                }
                Behaviour::Panic => panic!("adapter bug"),
                Behaviour::Stream => {}
            }

            for symbol in &subscription.symbols {
                let trade = Trade {
                    side: Side::Sell,
                    amount: dec!(0.5),
                    price: dec!(100),
                    id: None,
                };
                on_record(NormalizedRecord::trade(self.exchange, symbol, trade, None).unwrap());
            }
            std::future::pending().await
        }
    }

    fn worker(sources: SourceRegistry, markets: &[(&str, &[&str])]) -> (ShardedFeedWorker, Arc<SharedRecordQueue>) {
        let shard = SymbolShard {
            id: 7,
            markets: markets
                .iter()
                .map(|(e, symbols)| (e.to_string(), symbols.iter().map(|s| s.to_string()).collect()))
                .collect(),
        };
        let queue = Arc::new(SharedRecordQueue::new(128, 8));
        let backoff = BackoffSettings {
            base_ms: 10,
            max_ms: 100,
            jitter: false,
        };
        let worker = ShardedFeedWorker::new(
            shard,
            sources,
            Arc::clone(&queue),
            &MarketSettings::default(),
            &backoff,
        );
        (worker, queue)
    }

    fn registry(sources: Vec<MockSource>) -> SourceRegistry {
        let mut registry = SourceRegistry::new();
        for source in sources {
            registry.insert(Arc::new(source));
        }
        registry
    }

    #[tokio::test]
    async fn test_forwards_records_until_shutdown() {
        let sources = registry(vec![
            MockSource { exchange: "coinbase", behaviour: Behaviour::Stream },
            MockSource { exchange: "kraken", behaviour: Behaviour::Stream },
        ]);
        let (worker, queue) = worker(
            sources,
            &[("coinbase", &["BTC-USD", "ETH-USD"]), ("kraken", &["BTC-EUR"])],
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx));

        while queue.len() < 3 {
            queue.wait().await;
            tokio::task::yield_now().await;
        }
        let mut seen: Vec<String> = queue
            .drain()
            .iter()
            .map(|r| format!("{}:{}", r.exchange(), r.symbol()))
            .collect();
        seen.sort();
        assert_eq!(seen, vec!["coinbase:BTC-USD", "coinbase:ETH-USD", "kraken:BTC-EUR"]);

        tx.send(true).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_fatal_connector_error_escalates() {
        let sources = registry(vec![MockSource { exchange: "coinbase", behaviour: Behaviour::Fatal }]);
        let (worker, _) = worker(sources, &[("coinbase", &["BTC-USD"])]);

        let (_tx, rx) = watch::channel(false);
        let err = worker.run(rx).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Connector(FeedError::AuthenticationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_exchange_in_shard() {
        let (worker, _) = worker(SourceRegistry::new(), &[("bitmex", &["XBT-USD"])]);

        let (_tx, rx) = watch::channel(false);
        let err = worker.run(rx).await.unwrap_err();
        assert!(matches!(err, WorkerError::Connector(FeedError::UnknownExchange(_))));
    }

    #[tokio::test]
    async fn test_connector_panic_is_reported() {
        let sources = registry(vec![MockSource { exchange: "coinbase", behaviour: Behaviour::Panic }]);
        let (worker, _) = worker(sources, &[("coinbase", &["BTC-USD"])]);

        let (_tx, rx) = watch::channel(false);
        match worker.run(rx).await {
            Err(WorkerError::Panicked(message)) => assert_eq!(message, "adapter bug"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_spawned_worker_reports_exit() {
        let sources = registry(vec![MockSource { exchange: "coinbase", behaviour: Behaviour::Fatal }]);
        let (worker, _) = worker(sources, &[("coinbase", &["BTC-USD"])]);

        let (_tx, rx) = watch::channel(false);
        let (exit_tx, exit_rx) = mpsc::channel();
        let handle = worker
            .spawn(rx, move |shard, outcome| {
                let _ = exit_tx.send((shard, outcome.is_err()));
            })
            .unwrap();

        let (shard, failed) = exit_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(shard, 7);
        assert!(failed);
        handle.join().unwrap();
    }

    #[test]
    fn test_spawned_worker_stops_on_shutdown() {
        let sources = registry(vec![MockSource { exchange: "coinbase", behaviour: Behaviour::Stream }]);
        let (worker, queue) = worker(sources, &[("coinbase", &["BTC-USD"])]);

        let (tx, rx) = watch::channel(false);
        let (exit_tx, exit_rx) = mpsc::channel();
        let handle = worker
            .spawn(rx, move |_, outcome| {
                let _ = exit_tx.send(outcome.is_ok());
            })
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while queue.is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(queue.len(), 1);

        tx.send(true).unwrap();
        assert!(exit_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        handle.join().unwrap();
    }
}
