//! Aggregator supervisor
//!
//! Discovers markets, plans shards, runs one worker thread per shard plus the
//! distribution server, and restarts workers that die. A shard that keeps
//! dying right after start is left down; the process only gives up when
//! every shard is down or `exit_on_crash_loop` is set.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use crossbeam::channel::{self, Receiver, Sender};
use tokio::sync::watch;
use tracing::{error, info, warn};

use aggregator_core::{AggregatorSettings, WorkerError};
use aggregator_feed::{
    filter_markets, partition, Backoff, Markets, ShardedFeedWorker, SharedRecordQueue,
    SourceRegistry, SymbolShard,
};

use crate::server::DistributionServer;
use crate::session::SessionRegistry;

/// Poll interval when no restart is scheduled
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// What to do with a shard whose worker just failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { delay: Duration },
    GiveUp { failures: u32 },
}

/// Counts consecutive immediate failures per shard
#[derive(Debug)]
pub struct CrashTracker {
    max_restarts: u32,
    crash_window: Duration,
    base: Duration,
    max: Duration,
    shards: HashMap<usize, (u32, Backoff)>,
}

impl CrashTracker {
    pub fn new(max_restarts: u32, crash_window: Duration, base: Duration, max: Duration) -> Self {
        Self {
            max_restarts,
            crash_window,
            base,
            max,
            shards: HashMap::new(),
        }
    }

    pub fn from_settings(settings: &AggregatorSettings) -> Self {
        Self::new(
            settings.supervisor.max_restarts,
            settings.supervisor.crash_window(),
            Duration::from_millis(settings.backoff.base_ms),
            Duration::from_millis(settings.backoff.max_ms),
        )
    }

    /// Record a failure after `uptime` and decide what happens next
    pub fn on_failure(&mut self, shard: usize, uptime: Duration) -> RestartDecision {
        let (base, max) = (self.base, self.max);
        let (failures, backoff) = self
            .shards
            .entry(shard)
            .or_insert_with(|| (0, Backoff::new(base, max, false)));

        // A worker that ran for a while was healthy; start counting afresh
        if uptime >= self.crash_window {
            *failures = 0;
            backoff.reset();
            return RestartDecision::Restart {
                delay: backoff.next_delay(),
            };
        }
        *failures += 1;

        if *failures > self.max_restarts {
            RestartDecision::GiveUp {
                failures: *failures,
            }
        } else {
            RestartDecision::Restart {
                delay: backoff.next_delay(),
            }
        }
    }

    /// Consecutive immediate failures recorded for a shard
    pub fn failures(&self, shard: usize) -> u32 {
        self.shards.get(&shard).map_or(0, |(failures, _)| *failures)
    }
}

/// Reported by a worker thread as it exits
#[derive(Debug)]
struct WorkerExit {
    shard: usize,
    outcome: Result<(), WorkerError>,
}

enum PoolEvent {
    Exit(WorkerExit),
    Stop,
    Tick,
}

struct RunningWorker {
    started_at: Instant,
    handle: JoinHandle<()>,
}

/// Owns the worker threads of every shard
struct WorkerPool {
    shards: BTreeMap<usize, SymbolShard>,
    settings: AggregatorSettings,
    sources: SourceRegistry,
    queue: Arc<SharedRecordQueue>,
    stop: Arc<watch::Sender<bool>>,

    exits_tx: Sender<WorkerExit>,
    exits_rx: Receiver<WorkerExit>,
    running: HashMap<usize, RunningWorker>,
    scheduled: Vec<(Instant, usize)>,
    down: BTreeSet<usize>,
    tracker: CrashTracker,
}

impl WorkerPool {
    fn new(
        shards: Vec<SymbolShard>,
        settings: AggregatorSettings,
        sources: SourceRegistry,
        queue: Arc<SharedRecordQueue>,
        stop: Arc<watch::Sender<bool>>,
    ) -> Self {
        let (exits_tx, exits_rx) = channel::unbounded();
        let tracker = CrashTracker::from_settings(&settings);

        Self {
            shards: shards.into_iter().map(|s| (s.id, s)).collect(),
            settings,
            sources,
            queue,
            stop,
            exits_tx,
            exits_rx,
            running: HashMap::new(),
            scheduled: vec![],
            down: BTreeSet::new(),
            tracker,
        }
    }

    fn start_all(&mut self) -> anyhow::Result<()> {
        let ids: Vec<usize> = self.shards.keys().copied().collect();
        for id in ids {
            self.start(id)?;
        }
        Ok(())
    }

    fn start(&mut self, id: usize) -> anyhow::Result<()> {
        let shard = self
            .shards
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown shard {}", id))?;
        info!("Starting worker for {}", shard);

        let worker = ShardedFeedWorker::new(
            shard,
            self.sources.clone(),
            Arc::clone(&self.queue),
            &self.settings.markets,
            &self.settings.backoff,
        );

        let exits = self.exits_tx.clone();
        let handle = worker
            .spawn(self.stop.subscribe(), move |shard, outcome| {
                let _ = exits.send(WorkerExit { shard, outcome });
            })
            .with_context(|| format!("failed to spawn worker thread for shard {}", id))?;

        self.running.insert(
            id,
            RunningWorker {
                started_at: Instant::now(),
                handle,
            },
        );
        Ok(())
    }

    /// Watch worker exits and restart failed shards until `stop` fires.
    ///
    /// Returns an error when the crash-loop policy says the process should
    /// exit. Either way every worker is stopped and joined before returning.
    fn supervise(mut self, stop: Receiver<()>) -> anyhow::Result<()> {
        let result = loop {
            let wait = self
                .scheduled
                .iter()
                .map(|(at, _)| at.saturating_duration_since(Instant::now()))
                .min()
                .unwrap_or(IDLE_WAIT);

            let event = channel::select! {
                recv(self.exits_rx) -> exit => exit.map_or(PoolEvent::Tick, PoolEvent::Exit),
                recv(stop) -> _ => PoolEvent::Stop,
                default(wait) => PoolEvent::Tick,
            };

            let step = match event {
                PoolEvent::Stop => break Ok(()),
                PoolEvent::Exit(exit) => self.on_exit(exit).and_then(|()| self.start_due()),
                PoolEvent::Tick => self.start_due(),
            };
            if let Err(e) = step {
                break Err(e);
            }
        };

        self.stop.send_replace(true);
        self.join_all();
        result
    }

    fn on_exit(&mut self, exit: WorkerExit) -> anyhow::Result<()> {
        let Some(worker) = self.running.remove(&exit.shard) else {
            return Ok(());
        };
        let uptime = worker.started_at.elapsed();
        let _ = worker.handle.join();

        let error = match exit.outcome {
            Ok(()) => {
                info!("Shard {} worker stopped", exit.shard);
                return Ok(());
            }
            Err(e) if *self.stop.borrow() => {
                warn!("Shard {} worker failed during shutdown: {}", exit.shard, e);
                return Ok(());
            }
            Err(e) => e,
        };

        match self.tracker.on_failure(exit.shard, uptime) {
            RestartDecision::Restart { delay } => {
                warn!(
                    "Shard {} worker failed after {:?}: {}; restarting in {:?}",
                    exit.shard, uptime, error, delay
                );
                self.scheduled.push((Instant::now() + delay, exit.shard));
                Ok(())
            }
            RestartDecision::GiveUp { failures } => {
                error!(
                    "Shard {} is crash-looping ({} immediate failures, last: {}); leaving it down",
                    exit.shard, failures, error
                );
                self.down.insert(exit.shard);

                if self.settings.supervisor.exit_on_crash_loop {
                    bail!("shard {} is crash-looping: {}", exit.shard, error);
                }
                if self.down.len() == self.shards.len() {
                    bail!("every shard is down, last error: {}", error);
                }
                Ok(())
            }
        }
    }

    fn start_due(&mut self) -> anyhow::Result<()> {
        let now = Instant::now();
        let (due, later): (Vec<_>, Vec<_>) = self.scheduled.drain(..).partition(|(at, _)| *at <= now);
        self.scheduled = later;

        for (_, id) in due {
            self.start(id)?;
        }
        Ok(())
    }

    fn join_all(&mut self) {
        for (id, worker) in self.running.drain() {
            if worker.handle.join().is_err() {
                warn!("Shard {} worker thread panicked while stopping", id);
            }
        }
    }
}

/// Top-level orchestrator
pub struct AggregatorSupervisor {
    settings: AggregatorSettings,
    sources: SourceRegistry,
    registry: Arc<SessionRegistry>,
    queue: Arc<SharedRecordQueue>,
}

impl AggregatorSupervisor {
    pub fn new(settings: AggregatorSettings, sources: SourceRegistry) -> Self {
        let queue = Arc::new(SharedRecordQueue::from_settings(&settings.queue));
        Self {
            settings,
            sources,
            registry: Arc::new(SessionRegistry::new()),
            queue,
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn queue(&self) -> Arc<SharedRecordQueue> {
        Arc::clone(&self.queue)
    }

    /// List every configured exchange and apply the market filters.
    ///
    /// An exchange whose listing fails transiently is skipped with a warning;
    /// fatal errors abort start-up.
    pub async fn discover_markets(&self) -> anyhow::Result<Markets> {
        let mut universe = Markets::new();

        for exchange in &self.settings.markets.exchanges {
            let source = self.sources.get(exchange)?;
            match source.list_symbols().await {
                Ok(symbols) => {
                    info!("{} lists {} symbols", exchange, symbols.len());
                    universe.insert(exchange.clone(), symbols);
                }
                Err(e) if e.is_fatal() => {
                    return Err(e).with_context(|| format!("failed to list {} symbols", exchange));
                }
                Err(e) => warn!("Skipping {}: failed to list symbols: {}", exchange, e),
            }
        }

        let markets = filter_markets(universe, &self.settings.markets);
        if markets.is_empty() {
            bail!("no markets left after filtering");
        }
        Ok(markets)
    }

    pub fn plan_shards(&self, markets: &Markets) -> Vec<SymbolShard> {
        partition(markets, self.settings.workers.worker_count())
    }

    /// Run discovery, workers and the server until `shutdown` fires or the
    /// crash-loop policy gives up
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let markets = self.discover_markets().await?;
        self.run_with_markets(markets, shutdown).await
    }

    /// Same as [`run`](Self::run) with an already discovered universe
    pub async fn run_with_markets(
        self,
        markets: Markets,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let shards = self.plan_shards(&markets);
        let pairs: usize = shards.iter().map(SymbolShard::len).sum();
        info!(
            "Aggregating {} pairs on {} exchanges across {} workers",
            pairs,
            markets.len(),
            shards.len()
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);

        let server = DistributionServer::bind(
            &self.settings.server,
            Arc::clone(&self.registry),
            Arc::clone(&self.queue),
        )
        .await?;
        let mut server_task = tokio::spawn(server.serve(stop_rx));

        let mut pool = WorkerPool::new(
            shards,
            self.settings.clone(),
            self.sources.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&stop_tx),
        );
        if let Err(e) = pool.start_all() {
            stop_tx.send_replace(true);
            return Err(e);
        }

        let (monitor_stop_tx, monitor_stop_rx) = channel::bounded(1);
        let mut monitor = tokio::task::spawn_blocking(move || pool.supervise(monitor_stop_rx));

        let result = tokio::select! {
            joined = &mut monitor => {
                // The pool already stopped the workers and the server
                let _ = (&mut server_task).await;
                return joined.context("supervisor thread failed")?;
            }
            joined = &mut server_task => match joined {
                Ok(Ok(())) => Err(anyhow!("distribution server stopped unexpectedly")),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow!(e).context("distribution server task failed")),
            },
            _ = wait_for_stop(&mut shutdown) => Ok(()),
        };

        info!("Stopping workers and distribution server");
        stop_tx.send_replace(true);
        let _ = monitor_stop_tx.send(());

        monitor.await.context("supervisor thread failed")??;
        if !server_task.is_finished() {
            server_task.await.context("distribution server task failed")??;
        }
        result
    }
}

async fn wait_for_stop(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max_restarts: u32) -> CrashTracker {
        CrashTracker::new(
            max_restarts,
            Duration::from_secs(30),
            Duration::from_millis(100),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_immediate_failures_back_off_then_give_up() {
        let mut tracker = tracker(3);
        let quick = Duration::from_secs(1);

        assert_eq!(
            tracker.on_failure(0, quick),
            RestartDecision::Restart { delay: Duration::from_millis(100) }
        );
        assert_eq!(
            tracker.on_failure(0, quick),
            RestartDecision::Restart { delay: Duration::from_millis(200) }
        );
        assert_eq!(
            tracker.on_failure(0, quick),
            RestartDecision::Restart { delay: Duration::from_millis(400) }
        );
        assert_eq!(tracker.on_failure(0, quick), RestartDecision::GiveUp { failures: 4 });
    }

    #[test]
    fn test_healthy_uptime_resets_the_count() {
        let mut tracker = tracker(1);
        let quick = Duration::from_secs(1);

        assert!(matches!(tracker.on_failure(3, quick), RestartDecision::Restart { .. }));
        assert_eq!(tracker.failures(3), 1);

        // Ran past the crash window before failing again
        assert_eq!(
            tracker.on_failure(3, Duration::from_secs(60)),
            RestartDecision::Restart { delay: Duration::from_millis(100) }
        );
        assert_eq!(tracker.failures(3), 0);

        assert!(matches!(tracker.on_failure(3, quick), RestartDecision::Restart { .. }));
        assert_eq!(tracker.on_failure(3, quick), RestartDecision::GiveUp { failures: 2 });
    }

    #[test]
    fn test_shards_are_tracked_independently() {
        let mut tracker = tracker(0);

        assert_eq!(
            tracker.on_failure(0, Duration::ZERO),
            RestartDecision::GiveUp { failures: 1 }
        );
        assert_eq!(tracker.failures(1), 0);

        // Not an immediate failure, so even a zero budget restarts it
        assert!(matches!(
            tracker.on_failure(1, Duration::from_secs(31)),
            RestartDecision::Restart { .. }
        ));
    }
}
