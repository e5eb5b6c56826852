//! Broker-facing seams
//!
//! The engine never talks to a broker directly. Live adapters and the paper
//! gateway both implement these traits.

use async_trait::async_trait;

use super::types::{Contract, OrderHandle, OrderStatus};
use crate::error::EngineResult;

/// Order placement and status for option contracts.
///
/// All orders are single-leg. Entries are market buys; exits are market
/// sells; stop-losses are stop-limit sells.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_entry(&self, contract: &Contract, quantity: u32) -> EngineResult<OrderHandle>;

    async fn place_stop_loss(
        &self,
        contract: &Contract,
        trigger: f64,
        limit: f64,
        quantity: u32,
    ) -> EngineResult<OrderHandle>;

    async fn place_exit(&self, contract: &Contract, quantity: u32) -> EngineResult<OrderHandle>;

    /// Idempotent; may be polled any number of times
    async fn get_status(&self, handle: &OrderHandle) -> EngineResult<OrderStatus>;

    async fn cancel(&self, handle: &OrderHandle) -> EngineResult<()>;
}

/// Live premium quotes
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn current_premium(&self, contract: &Contract) -> EngineResult<f64>;
}
