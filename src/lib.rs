//! Intraday Options Decision Engine
//!
//! Turns one-minute index candles into option entries: PS/VS crossover
//! detection, a short-circuiting entry filter chain, and a single-position
//! lifecycle with a broker-side stop-loss placed on every fill.

pub mod audit;
pub mod config;
pub mod crossover;
pub mod data;
pub mod engine;
pub mod error;
pub mod filters;
pub mod indicators;
pub mod oms;
pub mod pnl;
pub mod regime;
pub mod signal;
pub mod stop_loss;
pub mod types;

pub use config::Config;
pub use error::{EngineError, EngineResult};
pub use types::*;
