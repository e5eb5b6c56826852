//! Entry filter chain
//!
//! Filters run in a fixed order and the chain stops at the first failure.
//! Every filter evaluated, including the failing one, leaves a
//! [`FilterOutcome`] in the trail. Filters are pure: they read the entry
//! reading, the optional short-timeframe readings and the regime policy, and
//! never touch shared state.

pub mod rsi;
pub mod session;
pub mod strength_gap;
pub mod timeframe;
pub mod volatility;
pub mod volume;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::config::RegimePolicy;
use crate::indicators::IndicatorSet;
use crate::Direction;

pub use rsi::RsiExtremeFilter;
pub use session::TimeSessionFilter;
pub use strength_gap::StrengthGapFilter;
pub use timeframe::{AlignmentFilter, DivergenceFilter, MomentumFilter};
pub use volatility::AtrVolatilityFilter;
pub use volume::VolumeConfirmationFilter;

/// Result of one filter evaluation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterOutcome {
    pub filter_name: String,
    pub passed: bool,
    pub reason: String,
    pub measured_value: Option<f64>,
}

impl FilterOutcome {
    pub fn pass(name: &str, measured: Option<f64>, reason: impl Into<String>) -> Self {
        Self {
            filter_name: name.to_string(),
            passed: true,
            reason: reason.into(),
            measured_value: measured,
        }
    }

    pub fn fail(name: &str, measured: Option<f64>, reason: impl Into<String>) -> Self {
        Self {
            filter_name: name.to_string(),
            passed: false,
            reason: reason.into(),
            measured_value: measured,
        }
    }
}

/// Inputs shared by every filter for one evaluation attempt
#[derive(Debug, Clone, Copy)]
pub struct FilterContext<'a> {
    pub direction: Direction,
    /// Exchange-local time of the entry candle
    pub local_time: NaiveTime,
    /// Reading at the entry index (crossover index + 1)
    pub entry: &'a IndicatorSet,
    /// Finer-grained readings up to the entry time, oldest first
    pub short: Option<&'a [IndicatorSet]>,
}

impl<'a> FilterContext<'a> {
    /// Most recent short-timeframe reading, if it is usable
    pub fn short_latest(&self) -> Option<&'a IndicatorSet> {
        self.short
            .and_then(|s| s.last())
            .filter(|set| set.is_valid())
    }
}

/// A single pass/fail gate
pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&self, ctx: &FilterContext<'_>, policy: &RegimePolicy) -> FilterOutcome;
}

/// Outcome of running the chain once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainResult {
    pub passed: bool,
    /// Trail in evaluation order; ends at the first failure
    pub outcomes: Vec<FilterOutcome>,
}

impl ChainResult {
    pub fn failing(&self) -> Option<&FilterOutcome> {
        self.outcomes.iter().find(|o| !o.passed)
    }
}

/// Ordered, short-circuiting filter chain
pub struct FilterChain {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Box<dyn Filter>>) -> Self {
        Self { filters }
    }

    /// Canonical order. Multi-timeframe and volume stages are included only
    /// when the regime enables them; the strength-gap stage always runs last.
    pub fn for_policy(policy: &RegimePolicy) -> Self {
        let mut filters: Vec<Box<dyn Filter>> = vec![
            Box::new(TimeSessionFilter),
            Box::new(AtrVolatilityFilter),
            Box::new(RsiExtremeFilter),
        ];

        if policy.multi_timeframe.enabled {
            filters.push(Box::new(AlignmentFilter));
            filters.push(Box::new(MomentumFilter));
            filters.push(Box::new(DivergenceFilter));
        }

        if policy.volume.enabled {
            filters.push(Box::new(VolumeConfirmationFilter));
        }

        filters.push(Box::new(StrengthGapFilter));

        Self::new(filters)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    pub fn evaluate(&self, ctx: &FilterContext<'_>, policy: &RegimePolicy) -> ChainResult {
        let mut outcomes = Vec::with_capacity(self.filters.len());

        for filter in &self.filters {
            let outcome = filter.evaluate(ctx, policy);
            let passed = outcome.passed;

            tracing::debug!(
                filter = filter.name(),
                passed,
                measured = ?outcome.measured_value,
                reason = %outcome.reason,
                "Filter evaluated"
            );

            outcomes.push(outcome);
            if !passed {
                return ChainResult {
                    passed: false,
                    outcomes,
                };
            }
        }

        ChainResult {
            passed: true,
            outcomes,
        }
    }
}

/// Shared fail-closed check for filters that read PS/VS-derived values
pub(crate) fn indeterminate_outcome(name: &str, set: &IndicatorSet) -> Option<FilterOutcome> {
    set.indeterminate.map(|issue| {
        FilterOutcome::fail(name, None, format!("indeterminate reading: {issue}"))
    })
}
