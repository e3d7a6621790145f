//! Core types and utilities for the market data aggregator
//!
//! This crate provides shared types used across all components:
//! - Normalized book and trade records
//! - Client subscription filters
//! - The keyed latest-value-wins backlog
//! - Settings and error types

pub mod types;
pub mod filter;
pub mod backlog;
pub mod settings;
pub mod errors;

pub use types::*;
pub use filter::*;
pub use backlog::*;
pub use settings::*;
pub use errors::*;
