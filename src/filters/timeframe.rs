//! Multi-timeframe confirmation
//!
//! Compares the entry reading with readings from a finer candle interval.
//! All three filters fail closed when the finer feed is missing or its
//! latest reading is indeterminate.

use super::{indeterminate_outcome, Filter, FilterContext, FilterOutcome};
use crate::config::RegimePolicy;
use crate::indicators::IndicatorSet;
use crate::Direction;

pub const ALIGNMENT: &str = "multi-timeframe alignment";
pub const MOMENTUM: &str = "momentum";
pub const DIVERGENCE: &str = "divergence";

const NO_SHORT_FEED: &str = "short-timeframe reading unavailable";

/// Whether the finer timeframe's PS/VS ordering agrees with `direction`
pub fn is_aligned(direction: Direction, short: &IndicatorSet) -> bool {
    if !short.is_valid() {
        return false;
    }
    match direction {
        Direction::Up => short.ps > short.vs,
        Direction::Down => short.ps < short.vs,
    }
}

/// Alignment as seen from a filter context. Missing data means not aligned.
pub fn context_aligned(ctx: &FilterContext<'_>) -> bool {
    ctx.short_latest()
        .is_some_and(|short| is_aligned(ctx.direction, short))
}

/// Average change of the PS-VS gap per candle across the last `window`
/// short readings. `None` without `window + 1` valid readings.
pub fn momentum(short: &[IndicatorSet], window: usize) -> Option<f64> {
    if window == 0 || short.len() < window + 1 {
        return None;
    }
    let tail = &short[short.len() - window - 1..];
    if tail.iter().any(|s| !s.is_valid()) {
        return None;
    }
    let first = tail.first()?.gap();
    let last = tail.last()?.gap();
    Some((last - first) / window as f64)
}

/// Relative disagreement between the two gaps, in percent (0..=200)
pub fn divergence_pct(entry: &IndicatorSet, short: &IndicatorSet) -> f64 {
    let (a, b) = (entry.gap(), short.gap());
    let denom = a.abs().max(b.abs());
    if denom == 0.0 {
        return 0.0;
    }
    (a - b).abs() / denom * 100.0
}

pub struct AlignmentFilter;

impl Filter for AlignmentFilter {
    fn name(&self) -> &'static str {
        ALIGNMENT
    }

    fn evaluate(&self, ctx: &FilterContext<'_>, _policy: &RegimePolicy) -> FilterOutcome {
        let Some(short) = ctx.short_latest() else {
            return FilterOutcome::fail(ALIGNMENT, None, NO_SHORT_FEED);
        };

        let gap = short.gap();
        if is_aligned(ctx.direction, short) {
            FilterOutcome::pass(
                ALIGNMENT,
                Some(gap),
                format!("short PS-VS {gap:+.2} agrees with {}", ctx.direction),
            )
        } else {
            FilterOutcome::fail(
                ALIGNMENT,
                Some(gap),
                format!("short PS-VS {gap:+.2} disagrees with {}", ctx.direction),
            )
        }
    }
}

pub struct MomentumFilter;

impl Filter for MomentumFilter {
    fn name(&self) -> &'static str {
        MOMENTUM
    }

    fn evaluate(&self, ctx: &FilterContext<'_>, policy: &RegimePolicy) -> FilterOutcome {
        let window = policy.multi_timeframe.momentum_window;
        let threshold = policy.multi_timeframe.momentum_threshold;

        let Some(value) = ctx.short.and_then(|s| momentum(s, window)) else {
            return FilterOutcome::fail(
                MOMENTUM,
                None,
                format!("need {} valid short readings", window + 1),
            );
        };

        let magnitude = value.abs();
        if magnitude >= threshold {
            FilterOutcome::pass(
                MOMENTUM,
                Some(magnitude),
                format!("momentum {magnitude:.2} >= {threshold:.2}"),
            )
        } else {
            FilterOutcome::fail(
                MOMENTUM,
                Some(magnitude),
                format!("momentum {magnitude:.2} below {threshold:.2}"),
            )
        }
    }
}

pub struct DivergenceFilter;

impl Filter for DivergenceFilter {
    fn name(&self) -> &'static str {
        DIVERGENCE
    }

    fn evaluate(&self, ctx: &FilterContext<'_>, policy: &RegimePolicy) -> FilterOutcome {
        if let Some(outcome) = indeterminate_outcome(DIVERGENCE, ctx.entry) {
            return outcome;
        }
        let Some(short) = ctx.short_latest() else {
            return FilterOutcome::fail(DIVERGENCE, None, NO_SHORT_FEED);
        };

        let threshold = policy.multi_timeframe.divergence_threshold_pct;
        let div = divergence_pct(ctx.entry, short);
        if div < threshold {
            FilterOutcome::pass(
                DIVERGENCE,
                Some(div),
                format!("divergence {div:.1}% < {threshold:.1}%"),
            )
        } else {
            FilterOutcome::fail(
                DIVERGENCE,
                Some(div),
                format!("divergence {div:.1}% >= {threshold:.1}%"),
            )
        }
    }
}
