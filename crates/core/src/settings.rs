//! Configuration types
//!
//! Loaded from defaults, an optional `aggregator.toml`, then `AGGREGATOR__*`
//! environment variables (e.g. `AGGREGATOR__SERVER__PORT=9000`).

use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::errors::{CoreError, CoreResult};
use crate::types::{canonical_exchange, canonical_symbol, Channel};

/// Environment variable naming an alternative config file
pub const CONFIG_PATH_ENV: &str = "AGGREGATOR_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "aggregator.toml";

/// Distribution server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub heartbeat_interval_ms: u64,
    /// Max pending frames per session before per-key eviction kicks in
    pub session_backlog: usize,
    pub send_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8768,
            heartbeat_interval_ms: 1_000,
            session_backlog: 1_024,
            send_timeout_ms: 10_000,
        }
    }
}

impl ServerSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Which markets to aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketSettings {
    pub exchanges: Vec<String>,
    /// Allow-list of canonical pairs; empty means every listed pair
    pub pairs: Vec<String>,
    /// Keep only pairs quoted in this currency
    pub ref_currency: Option<String>,
    pub channels: Vec<Channel>,
    pub book_depth: usize,
}

impl Default for MarketSettings {
    fn default() -> Self {
        Self {
            exchanges: vec!["coinbase".to_string()],
            pairs: vec![],
            ref_currency: None,
            channels: Channel::ALL.to_vec(),
            book_depth: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Overrides `max(1, cpu_count - 1)`
    pub max_workers: Option<usize>,
}

impl WorkerSettings {
    pub fn worker_count(&self) -> usize {
        match self.max_workers {
            Some(n) => n.max(1),
            None => {
                let cpus = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                cpus.saturating_sub(1).max(1)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub capacity: usize,
    pub max_per_key: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            max_per_key: 64,
        }
    }
}

/// Reconnect backoff: `base_ms * 2^attempt`, capped at `max_ms`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter: bool,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_ms: 500,
            max_ms: 30_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub max_restarts: u32,
    /// A worker that dies sooner than this after starting counts as an
    /// immediate failure
    pub crash_window_secs: u64,
    pub exit_on_crash_loop: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            crash_window_secs: 30,
            exit_on_crash_loop: false,
        }
    }
}

impl SupervisorSettings {
    pub fn crash_window(&self) -> Duration {
        Duration::from_secs(self.crash_window_secs)
    }
}

/// Complete aggregator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorSettings {
    pub server: ServerSettings,
    pub markets: MarketSettings,
    pub workers: WorkerSettings,
    pub queue: QueueSettings,
    pub backoff: BackoffSettings,
    pub supervisor: SupervisorSettings,
}

impl AggregatorSettings {
    /// Load from file and environment, then validate
    pub fn load() -> CoreResult<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let settings: Self = Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix("AGGREGATOR")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("markets.exchanges")
                    .with_list_parse_key("markets.pairs")
                    .with_list_parse_key("markets.channels")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validated()
    }

    /// Canonicalize identifiers and reject unusable values
    pub fn validated(mut self) -> CoreResult<Self> {
        self.markets.exchanges = self
            .markets
            .exchanges
            .iter()
            .map(|e| canonical_exchange(e))
            .filter(|e| !e.is_empty())
            .collect();
        self.markets.pairs = self
            .markets
            .pairs
            .iter()
            .map(|p| canonical_symbol(p))
            .filter(|p| !p.is_empty())
            .collect();
        self.markets.ref_currency = self
            .markets
            .ref_currency
            .as_deref()
            .map(canonical_symbol)
            .filter(|c| !c.is_empty());

        if self.markets.exchanges.is_empty() {
            return Err(CoreError::InvalidConfig("no exchanges configured".into()));
        }
        if self.markets.channels.is_empty() {
            return Err(CoreError::InvalidConfig("no channels configured".into()));
        }
        if self.markets.book_depth == 0 {
            return Err(CoreError::InvalidConfig("book_depth must be > 0".into()));
        }
        if self.queue.capacity == 0 || self.queue.max_per_key == 0 {
            return Err(CoreError::InvalidConfig("queue limits must be > 0".into()));
        }
        if self.server.session_backlog == 0 {
            return Err(CoreError::InvalidConfig("session_backlog must be > 0".into()));
        }
        if self.server.heartbeat_interval_ms == 0 || self.server.send_timeout_ms == 0 {
            return Err(CoreError::InvalidConfig("server intervals must be > 0".into()));
        }
        if self.backoff.base_ms == 0 || self.backoff.base_ms > self.backoff.max_ms {
            return Err(CoreError::InvalidConfig(format!(
                "backoff base_ms ({}) must be in 1..=max_ms ({})",
                self.backoff.base_ms, self.backoff.max_ms
            )));
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = AggregatorSettings::default().validated().unwrap();

        assert_eq!(settings.server.port, 8768);
        assert_eq!(settings.server.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(settings.markets.channels, vec![Channel::Book, Channel::Trades]);
        assert!(settings.workers.worker_count() >= 1);
    }

    #[test]
    fn test_identifiers_canonicalized() {
        let mut settings = AggregatorSettings::default();
        settings.markets.exchanges = vec!["KRAKEN".into(), " ".into()];
        settings.markets.pairs = vec!["btc-usd".into()];
        settings.markets.ref_currency = Some("usd".into());

        let settings = settings.validated().unwrap();
        assert_eq!(settings.markets.exchanges, vec!["kraken".to_string()]);
        assert_eq!(settings.markets.pairs, vec!["BTC-USD".to_string()]);
        assert_eq!(settings.markets.ref_currency.as_deref(), Some("USD"));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut settings = AggregatorSettings::default();
        settings.markets.exchanges.clear();
        assert!(settings.validated().is_err());

        let mut settings = AggregatorSettings::default();
        settings.backoff.base_ms = 60_000;
        assert!(settings.validated().is_err());

        let mut settings = AggregatorSettings::default();
        settings.queue.capacity = 0;
        assert!(settings.validated().is_err());
    }

    #[test]
    fn test_worker_override() {
        let settings = WorkerSettings {
            max_workers: Some(0),
        };
        assert_eq!(settings.worker_count(), 1);

        let settings = WorkerSettings {
            max_workers: Some(4),
        };
        assert_eq!(settings.worker_count(), 4);
    }
}
