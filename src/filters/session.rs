//! Time-of-day gate. Independent of volatility.

use super::{Filter, FilterContext, FilterOutcome};
use crate::config::RegimePolicy;

pub const NAME: &str = "time session";

pub struct TimeSessionFilter;

impl Filter for TimeSessionFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn evaluate(&self, ctx: &FilterContext<'_>, policy: &RegimePolicy) -> FilterOutcome {
        let window = &policy.session;
        if window.contains(ctx.local_time) {
            FilterOutcome::pass(
                NAME,
                None,
                format!("{} within [{}, {})", ctx.local_time, window.start, window.end),
            )
        } else {
            FilterOutcome::fail(
                NAME,
                None,
                format!("{} outside [{}, {})", ctx.local_time, window.start, window.end),
            )
        }
    }
}
