//! RSI extremity gate, direction specific.
//! Calls are blocked when overbought, puts when oversold.

use super::{Filter, FilterContext, FilterOutcome};
use crate::config::RegimePolicy;
use crate::Direction;

pub const NAME: &str = "RSI extreme";

pub struct RsiExtremeFilter;

impl Filter for RsiExtremeFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn evaluate(&self, ctx: &FilterContext<'_>, policy: &RegimePolicy) -> FilterOutcome {
        let Some(rsi) = ctx.entry.rsi.filter(|r| r.is_finite()) else {
            return FilterOutcome::fail(NAME, None, "RSI indeterminate");
        };

        match ctx.direction {
            Direction::Up => {
                let bound = policy.rsi.ce_max;
                if rsi <= bound {
                    FilterOutcome::pass(NAME, Some(rsi), format!("CE: RSI {rsi:.1} <= {bound:.1}"))
                } else {
                    FilterOutcome::fail(
                        NAME,
                        Some(rsi),
                        format!("CE blocked: RSI {rsi:.1} above bound {bound:.1}"),
                    )
                }
            }
            Direction::Down => {
                let bound = policy.rsi.pe_min;
                if rsi >= bound {
                    FilterOutcome::pass(NAME, Some(rsi), format!("PE: RSI {rsi:.1} >= {bound:.1}"))
                } else {
                    FilterOutcome::fail(
                        NAME,
                        Some(rsi),
                        format!("PE blocked: RSI {rsi:.1} below bound {bound:.1}"),
                    )
                }
            }
        }
    }
}
