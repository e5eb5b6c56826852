//! Profit and loss for a bought option
//!
//! Always recomputed from the entry and current premium. There is no running
//! total anywhere, so repeated premium updates cannot accumulate drift.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PnL {
    pub points: f64,
    pub value: f64,
}

/// Same sign convention for CE and PE since both are long
pub fn calculate(entry_premium: f64, current_premium: f64, lot_size: u32, lot_count: u32) -> PnL {
    let points = current_premium - entry_premium;
    PnL {
        points,
        value: points * f64::from(lot_size) * f64::from(lot_count),
    }
}
