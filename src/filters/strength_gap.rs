//! PS/VS strength-gap gate with alignment-dependent band
//!
//! Below the band the crossover is too weak to trade; above it the move is
//! already extended and the entry would be late.

use super::timeframe::context_aligned;
use super::{indeterminate_outcome, Filter, FilterContext, FilterOutcome};
use crate::config::{Band, RegimePolicy};

pub const NAME: &str = "strength-gap";

/// Band in force for one evaluation. Pure in `aligned`; recomputed every time.
pub fn effective_band(policy: &RegimePolicy, aligned: bool) -> Band {
    match &policy.strength_gap.dynamic {
        Some(dynamic) if aligned => dynamic.tight,
        Some(dynamic) => dynamic.wide,
        None => policy.strength_gap.static_band(),
    }
}

pub struct StrengthGapFilter;

impl Filter for StrengthGapFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn evaluate(&self, ctx: &FilterContext<'_>, policy: &RegimePolicy) -> FilterOutcome {
        if let Some(outcome) = indeterminate_outcome(NAME, ctx.entry) {
            return outcome;
        }

        let diff = ctx.entry.ps_vs_diff_pct;
        if !diff.is_finite() {
            return FilterOutcome::fail(NAME, None, "strength gap indeterminate");
        }

        let aligned = context_aligned(ctx);
        let band = effective_band(policy, aligned);
        let label = match (&policy.strength_gap.dynamic, aligned) {
            (None, _) => "static",
            (Some(_), true) => "tight",
            (Some(_), false) => "wide",
        };

        if diff < band.min {
            FilterOutcome::fail(
                NAME,
                Some(diff),
                format!("too weak: {diff:.2}% < {:.2}% ({label} band)", band.min),
            )
        } else if diff > band.max {
            FilterOutcome::fail(
                NAME,
                Some(diff),
                format!("too extreme/late: {diff:.2}% > {:.2}% ({label} band)", band.max),
            )
        } else {
            FilterOutcome::pass(
                NAME,
                Some(diff),
                format!(
                    "{diff:.2}% within [{:.2}, {:.2}] ({label} band)",
                    band.min, band.max
                ),
            )
        }
    }
}
