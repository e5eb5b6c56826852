//! Core OMS types
//!
//! Position lifecycle states, the position record and the order-status
//! vocabulary shared with the broker gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pnl;
use crate::OptionType;

/// Position id, unique per session
pub type PositionId = u64;

/// Position lifecycle
///
/// ```text
/// FLAT -> ENTRY_PENDING -> OPEN -> EXITING -> CLOSED -> FLAT
///              |    \______________^
///              v     (stop-loss placement failed)
///            FLAT (entry rejected / not filled)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    Flat,
    EntryPending,
    Open,
    Exiting,
    Closed,
}

impl PositionState {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: PositionState) -> bool {
        use PositionState::*;
        matches!(
            (self, next),
            (Flat, EntryPending)
                | (EntryPending, Flat)
                | (EntryPending, Open)
                | (EntryPending, Exiting)
                | (Open, Exiting)
                | (Exiting, Closed)
                | (Closed, Flat)
        )
    }

    /// States in which a position exists and exposure may be held
    pub fn is_active(self) -> bool {
        matches!(
            self,
            PositionState::EntryPending | PositionState::Open | PositionState::Exiting
        )
    }
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PositionState::Flat => "FLAT",
            PositionState::EntryPending => "ENTRY_PENDING",
            PositionState::Open => "OPEN",
            PositionState::Exiting => "EXITING",
            PositionState::Closed => "CLOSED",
        };
        write!(f, "{s}")
    }
}

/// Why a position left the OPEN state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Protective order triggered
    StopLoss,
    /// Operator requested exit
    Manual,
    /// Protection could not be placed or was lost; flattened immediately
    ProtectionFailed,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "stop_loss"),
            ExitReason::Manual => write!(f, "manual"),
            ExitReason::ProtectionFailed => write!(f, "protection_failed"),
        }
    }
}

/// Tradable option contract
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub option_type: OptionType,
    pub strike: f64,
}

impl std::fmt::Display for Contract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.0}{}", self.strike, self.option_type)
    }
}

/// Broker-side order reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderHandle(pub String);

impl std::fmt::Display for OrderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order status as reported by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Filled { average_price: f64 },
    Rejected { reason: String },
    /// Stop order triggered, fill not yet reported
    Triggered,
}

/// A long option position.
///
/// Premium fields are mutated only by the position manager; everything
/// outside gets cloned snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub contract: Contract,
    pub quantity: u32,
    pub lot_size: u32,
    pub lot_count: u32,
    pub entry_premium: f64,
    pub entry_timestamp: DateTime<Utc>,
    pub stop_loss_points: f64,
    pub stop_loss_price: f64,
    pub status: PositionState,
    pub current_premium: f64,
    pub pnl_points: f64,
    pub pnl_value: f64,
    pub exit_premium: Option<f64>,
    pub exit_reason: Option<ExitReason>,
    pub exit_timestamp: Option<DateTime<Utc>>,
}

impl Position {
    /// Record a new premium observation. P&L is derived from entry and
    /// current premium only.
    pub fn update_premium(&mut self, premium: f64) {
        self.current_premium = premium;
        let pnl = pnl::calculate(self.entry_premium, premium, self.lot_size, self.lot_count);
        self.pnl_points = pnl.points;
        self.pnl_value = pnl.value;
    }
}
