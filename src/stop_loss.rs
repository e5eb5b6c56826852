//! Stop-loss calculation
//!
//! The policy kind comes from the regime configuration. Both kinds produce a
//! whole-currency stop price that is fixed at entry, plus the trigger/limit
//! pair for the protective sell order.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// How a regime derives its protective exit price
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopLossPolicy {
    /// Fixed distance in premium points below entry
    FixedPoints { points: f64 },
    /// Fraction of the entry premium (0.25 = 25%)
    Percentage { pct: f64 },
}

impl StopLossPolicy {
    pub fn validate(&self) -> EngineResult<()> {
        match *self {
            StopLossPolicy::FixedPoints { points } if !(points > 0.0) => Err(
                EngineError::config(format!("stop_loss.points must be > 0, got {points}")),
            ),
            StopLossPolicy::Percentage { pct } if !(pct > 0.0 && pct < 1.0) => Err(
                EngineError::config(format!("stop_loss.pct must be within (0, 1), got {pct}")),
            ),
            _ => Ok(()),
        }
    }

    /// Compute stop levels for a long option position entered at `entry_premium`
    pub fn levels(&self, entry_premium: f64) -> EngineResult<StopLevels> {
        if !entry_premium.is_finite() || entry_premium <= 0.0 {
            return Err(EngineError::DataQuality(format!(
                "invalid entry premium {entry_premium}"
            )));
        }

        let stop_loss_points = match *self {
            StopLossPolicy::FixedPoints { points } => points,
            StopLossPolicy::Percentage { pct } => entry_premium * pct,
        };
        let stop_loss_price = (entry_premium - stop_loss_points).round();

        if stop_loss_price < 1.0 {
            return Err(EngineError::DataQuality(format!(
                "entry premium {entry_premium:.2} leaves no room for a stop ({stop_loss_price})"
            )));
        }

        let trigger = stop_loss_price;
        Ok(StopLevels {
            stop_loss_points,
            stop_loss_price,
            trigger,
            limit: (trigger + 1.0).round(),
        })
    }
}

/// Protective levels computed once at entry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StopLevels {
    /// Configured distance below entry, before rounding the stop price
    pub stop_loss_points: f64,
    pub stop_loss_price: f64,
    /// Protective order trigger price
    pub trigger: f64,
    /// Protective order limit price
    pub limit: f64,
}
