//! Regime capabilities
//!
//! Everything that varies between trading regimes sits behind [`Regime`].
//! The position manager and signal engine only see this trait, so a new
//! regime is a new implementation, never a branch inside the engine.

use crate::config::RegimePolicy;
use crate::error::EngineResult;
use crate::stop_loss::StopLevels;

pub trait Regime: Send + Sync {
    fn name(&self) -> &str;

    /// Protective levels for a position entered at `entry_premium`
    fn compute_stop_loss(&self, entry_premium: f64) -> EngineResult<StopLevels>;

    fn allowed_concurrent_positions(&self) -> usize;

    /// Thresholds read by the entry filter chain
    fn filter_thresholds(&self) -> &RegimePolicy;
}

impl Regime for RegimePolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn compute_stop_loss(&self, entry_premium: f64) -> EngineResult<StopLevels> {
        self.stop_loss.levels(entry_premium)
    }

    fn allowed_concurrent_positions(&self) -> usize {
        self.max_concurrent_positions
    }

    fn filter_thresholds(&self) -> &RegimePolicy {
        self
    }
}
