//! Volume spike confirmation against thin-volume false signals.
//!
//! Uses the latest short-timeframe candle when that feed exists, otherwise
//! the entry candle itself.

use super::{Filter, FilterContext, FilterOutcome};
use crate::config::RegimePolicy;

pub const NAME: &str = "volume confirmation";

pub struct VolumeConfirmationFilter;

impl Filter for VolumeConfirmationFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn evaluate(&self, ctx: &FilterContext<'_>, policy: &RegimePolicy) -> FilterOutcome {
        let source = match ctx.short {
            Some(short) => match ctx.short_latest() {
                Some(set) => set,
                None if short.is_empty() => {
                    return FilterOutcome::fail(NAME, None, "short-timeframe feed empty")
                }
                None => {
                    return FilterOutcome::fail(NAME, None, "short-timeframe reading indeterminate")
                }
            },
            None => ctx.entry,
        };

        let Some(avg) = source.volume_avg.filter(|v| *v > 0.0) else {
            return FilterOutcome::fail(NAME, Some(source.volume), "no trailing volume average");
        };

        let spike = policy.volume.spike_threshold;
        let ratio = source.volume / avg;
        if ratio >= spike {
            FilterOutcome::pass(
                NAME,
                Some(ratio),
                format!("volume {:.0} is {ratio:.2}x average (>= {spike:.2}x)", source.volume),
            )
        } else {
            FilterOutcome::fail(
                NAME,
                Some(ratio),
                format!("volume {:.0} only {ratio:.2}x average (< {spike:.2}x)", source.volume),
            )
        }
    }
}
