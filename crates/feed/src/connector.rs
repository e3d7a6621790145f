//! Exchange feed connectors
//!
//! A [`FeedSource`] knows how to talk to one exchange. An
//! [`ExchangeFeedConnector`] owns one subscription against a source and keeps
//! it alive: transient failures are retried forever with bounded exponential
//! backoff, fatal ones end the connector and are handed back to the worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{error, info, warn};

use aggregator_core::{BackoffSettings, Channel, FeedError, FeedResult, NormalizedRecord};

/// Callback invoked once per normalized upstream event
pub type RecordCallback = Arc<dyn Fn(NormalizedRecord) + Send + Sync>;

/// What a connector subscribes to on one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Canonical symbols, e.g. `BTC-USD`
    pub symbols: Vec<String>,
    pub channels: Vec<Channel>,
    pub book_depth: usize,
}

impl Subscription {
    pub fn wants(&self, channel: Channel) -> bool {
        self.channels.contains(&channel)
    }
}

/// Capability offered by an exchange integration
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Canonical exchange id
    fn exchange(&self) -> &str;

    /// Canonical symbols currently listed on the exchange
    async fn list_symbols(&self) -> FeedResult<Vec<String>>;

    /// Open one upstream connection and deliver records until it ends.
    ///
    /// `Ok(())` means the upstream closed the connection cleanly.
    async fn stream(&self, subscription: &Subscription, on_record: &RecordCallback)
        -> FeedResult<()>;
}

/// Reconnect delay: doubles per attempt from `base`, capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter,
            attempt: 0,
        }
    }

    pub fn from_settings(settings: &BackoffSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.base_ms),
            Duration::from_millis(settings.max_ms),
            settings.jitter,
        )
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter {
            // Up to 25% shaved off, never above the cap
            let spread = (delay.as_millis() / 4) as u64;
            let shave = rand::thread_rng().gen_range(0..=spread);
            delay.saturating_sub(Duration::from_millis(shave))
        } else {
            delay
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failed attempts since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Connector counters
#[derive(Debug, Default)]
pub struct ConnectorStats {
    records: AtomicU64,
    reconnects: AtomicU64,
}

impl ConnectorStats {
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

/// Keeps one exchange subscription alive
pub struct ExchangeFeedConnector {
    source: Arc<dyn FeedSource>,
    subscription: Subscription,
    backoff: Backoff,
    stats: Arc<ConnectorStats>,
}

impl ExchangeFeedConnector {
    pub fn new(source: Arc<dyn FeedSource>, subscription: Subscription, backoff: Backoff) -> Self {
        Self {
            source,
            subscription,
            backoff,
            stats: Arc::new(ConnectorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ConnectorStats> {
        Arc::clone(&self.stats)
    }

    pub fn exchange(&self) -> &str {
        self.source.exchange()
    }

    /// Run until a fatal error, which is returned. Never gives up on
    /// transient failures.
    pub async fn run(mut self, on_record: RecordCallback) -> FeedError {
        let exchange = self.source.exchange().to_string();

        let counting: RecordCallback = {
            let stats = Arc::clone(&self.stats);
            Arc::new(move |record: NormalizedRecord| {
                stats.records.fetch_add(1, Ordering::Relaxed);
                on_record(record);
            })
        };

        loop {
            info!(
                "Connecting {} feed ({} symbols, channels {:?})",
                exchange,
                self.subscription.symbols.len(),
                self.subscription.channels
            );

            let delivered_before = self.stats.records();
            let result = self.source.stream(&self.subscription, &counting).await;

            // A session that produced data counts as a successful connect
            if self.stats.records() > delivered_before {
                self.backoff.reset();
            }

            match result {
                Err(e) if e.is_fatal() => {
                    error!("Feed {} fatal error: {}", exchange, e);
                    return e;
                }
                Err(e) => warn!("Feed {} error: {}", exchange, e),
                Ok(()) => warn!("Feed {} closed by upstream", exchange),
            }

            let delay = self.backoff.next_delay();
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Reconnecting {} in {:?} (attempt {})",
                exchange,
                delay,
                self.backoff.attempt()
            );

            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggregator_core::{Side, Trade};
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    /// Fails the first `failures` connects, then emits one trade and idles
    struct FlakySource {
        failures: usize,
        fatal: Option<FeedError>,
        connects: Mutex<Vec<Instant>>,
    }

    impl FlakySource {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                fatal: None,
                connects: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl FeedSource for FlakySource {
        fn exchange(&self) -> &str {
            "coinbase"
        }

        async fn list_symbols(&self) -> FeedResult<Vec<String>> {
            Ok(vec!["BTC-USD".to_string()])
        }

        async fn stream(
            &self,
            subscription: &Subscription,
            on_record: &RecordCallback,
        ) -> FeedResult<()> {
            let attempt = {
                let mut connects = self.connects.lock();
                connects.push(Instant::now());
                connects.len()
            };

            if let Some(fatal) = &self.fatal {
                return Err(fatal.clone());
            }
            if attempt <= self.failures {
                return Err(FeedError::Disconnected);
            }

            let trade = Trade {
                side: Side::Buy,
                amount: dec!(1),
                price: dec!(100),
                id: Some(attempt.to_string()),
            };
            let record =
                NormalizedRecord::trade("coinbase", &subscription.symbols[0], trade, None).unwrap();
            on_record(record);

            std::future::pending().await
        }
    }

    fn subscription() -> Subscription {
        Subscription {
            symbols: vec!["BTC-USD".to_string()],
            channels: vec![Channel::Trades],
            book_depth: 10,
        }
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1_000), false);
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_millis() as u64).collect();

        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(backoff.attempt(), 6);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_jitter_stays_within_bounds() {
        let mut backoff = Backoff::new(Duration::from_millis(400), Duration::from_millis(400), true);
        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(400));
            assert!(delay >= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_backoff_survives_many_attempts() {
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_secs(30), false);
        for _ in 0..200 {
            assert!(backoff.next_delay() <= Duration::from_secs(30));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_with_increasing_delays_then_resumes() {
        let source = Arc::new(FlakySource::new(4));
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10), false);
        let connector = ExchangeFeedConnector::new(source.clone(), subscription(), backoff);
        let stats = connector.stats();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(connector.run(Arc::new(move |record: NormalizedRecord| {
            let _ = tx.send(record);
        })));

        let record = rx.recv().await.unwrap();
        assert_eq!(record.symbol(), "BTC-USD");
        assert_eq!(stats.records(), 1);
        assert_eq!(stats.reconnects(), 4);

        let connects = source.connects.lock().clone();
        assert_eq!(connects.len(), 5);
        let gaps: Vec<Duration> = connects.windows(2).map(|w| w[1] - w[0]).collect();
        for pair in gaps.windows(2) {
            assert!(pair[0] < pair[1], "delays must strictly increase: {:?}", gaps);
        }
        assert_eq!(gaps[0], Duration::from_millis(100));

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_ends_connector() {
        let mut source = FlakySource::new(0);
        source.fatal = Some(FeedError::AuthenticationFailed("invalid key".into()));
        let source = Arc::new(source);

        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), false);
        let connector = ExchangeFeedConnector::new(source.clone(), subscription(), backoff);

        let error = connector.run(Arc::new(|_: NormalizedRecord| {})).await;
        assert_eq!(error, FeedError::AuthenticationFailed("invalid key".into()));
        assert_eq!(source.connects.lock().len(), 1);
    }
}
