//! Order Management System (OMS)
//!
//! Owns the single position slot and everything that talks to the broker:
//! - Position lifecycle FLAT → ENTRY_PENDING → OPEN → EXITING → CLOSED → FLAT
//! - Stop-loss placement with a fail-safe exit when protection cannot be placed
//! - Premium tracking with P&L recomputed from entry on every update
//! - A paper gateway for replay and tests

pub mod gateway;
pub mod paper;
pub mod position_manager;
pub mod types;

// Re-export core types
pub use gateway::{OrderGateway, QuoteSource};
pub use paper::{PaperGateway, PaperGatewayConfig, PaperOrderCounts};
pub use position_manager::{EntryOutcome, ExitOutcome, ManagerSettings, PositionManager};
pub use types::{
    Contract, ExitReason, OrderHandle, OrderStatus, Position, PositionId, PositionState,
};
