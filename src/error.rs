//! Engine error taxonomy
//!
//! - `Configuration`: contradictory or malformed regime bounds. Fatal at load.
//! - `DataQuality`: missing/zero volume, short history, NaN readings. Recovered
//!   by marking the reading indeterminate; dependent filters fail closed.
//! - `OrderGateway`: rejection or timeout from the broker side. Recovered by
//!   reverting the pending transition.
//! - `InvariantViolation`: the position book reached a state the transition
//!   guard should make impossible. Treated as a defect.

use thiserror::Error;

use crate::oms::PositionState;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("data quality error: {0}")]
    DataQuality(String),

    #[error("order gateway error: {0}")]
    OrderGateway(String),

    #[error("invariant violation: {message} (state={state:?})")]
    InvariantViolation {
        state: PositionState,
        message: String,
    },
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn gateway(msg: impl Into<String>) -> Self {
        Self::OrderGateway(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::InvariantViolation { .. }
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
