//! ATR ratio gate
//!
//! The buy regime only needs a lower bound (expanding volatility); bounded
//! regimes also cap it. A missing ratio fails closed.

use super::{Filter, FilterContext, FilterOutcome};
use crate::config::RegimePolicy;

pub const NAME: &str = "ATR volatility";

pub struct AtrVolatilityFilter;

impl Filter for AtrVolatilityFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn evaluate(&self, ctx: &FilterContext<'_>, policy: &RegimePolicy) -> FilterOutcome {
        let Some(ratio) = ctx.entry.atr_ratio.filter(|r| r.is_finite()) else {
            return FilterOutcome::fail(NAME, None, "ATR ratio indeterminate");
        };

        let min = policy.atr.min_multiplier;
        if ratio < min {
            return FilterOutcome::fail(
                NAME,
                Some(ratio),
                format!("ATR ratio {ratio:.2} below minimum {min:.2}"),
            );
        }

        match policy.atr.max_multiplier {
            Some(max) if ratio > max => FilterOutcome::fail(
                NAME,
                Some(ratio),
                format!("ATR ratio {ratio:.2} above maximum {max:.2}"),
            ),
            Some(max) => FilterOutcome::pass(
                NAME,
                Some(ratio),
                format!("ATR ratio {ratio:.2} within [{min:.2}, {max:.2}]"),
            ),
            None => FilterOutcome::pass(
                NAME,
                Some(ratio),
                format!("ATR ratio {ratio:.2} >= {min:.2}"),
            ),
        }
    }
}
