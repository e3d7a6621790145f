//! Market data distribution
//!
//! Fans normalized exchange records out to WebSocket clients according to
//! per-client subscription filters, and supervises the shard workers that
//! produce them.

pub mod server;
pub mod session;
pub mod supervisor;

pub use server::{DispatchStats, DistributionServer};
pub use session::{ClientSession, Outbox, SessionGuard, SessionId, SessionRegistry};
pub use supervisor::{AggregatorSupervisor, CrashTracker, RestartDecision};
