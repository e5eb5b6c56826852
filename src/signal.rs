//! Signal aggregation
//!
//! Turns a confirmed crossover plus the filter trail into one [`Signal`].
//! A crossover detected on candle `i` is only ever evaluated on candle `i+1`;
//! [`SignalAggregator::evaluate`] takes the entry index and looks the
//! crossover up itself, so the lag cannot be skipped by a caller.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, RegimePolicy};
use crate::crossover::{self, CrossoverEvent};
use crate::error::{EngineError, EngineResult};
use crate::filters::{FilterChain, FilterContext, FilterOutcome};
use crate::indicators::{self, IndicatorSet};
use crate::regime::Regime;
use crate::{Candle, Direction, OptionType};

/// Candles kept per feed. Older candles only matter for indicator warm-up.
const MAX_HISTORY: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalType {
    #[serde(rename = "BUY_CE")]
    BuyCe,
    #[serde(rename = "BUY_PE")]
    BuyPe,
    #[serde(rename = "NONE")]
    None,
}

impl SignalType {
    fn for_direction(direction: Direction) -> Self {
        match direction {
            Direction::Up => SignalType::BuyCe,
            Direction::Down => SignalType::BuyPe,
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SignalType::BuyCe => "BUY_CE",
            SignalType::BuyPe => "BUY_PE",
            SignalType::None => "NONE",
        };
        write!(f, "{s}")
    }
}

/// Contract and size to buy for an actionable signal
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntryRequest {
    pub option_type: OptionType,
    pub strike: f64,
    pub quantity: u32,
}

/// Outcome of one entry evaluation, with its full audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub signal_type: SignalType,
    /// Timestamp of the entry candle
    pub timestamp: DateTime<Utc>,
    pub crossover: CrossoverEvent,
    pub entry_index: usize,
    /// Underlying close at the entry candle
    pub underlying_price: f64,
    pub outcomes: Vec<FilterOutcome>,
    /// Present only when every filter passed
    pub entry: Option<EntryRequest>,
}

impl Signal {
    pub fn is_actionable(&self) -> bool {
        self.signal_type != SignalType::None
    }

    pub fn failing(&self) -> Option<&FilterOutcome> {
        self.outcomes.iter().find(|o| !o.passed)
    }
}

/// Nearest listed strike to `spot`
pub fn atm_strike(spot: f64, strike_step: f64) -> f64 {
    (spot / strike_step).round() * strike_step
}

pub struct SignalAggregator {
    chain: FilterChain,
    offset: FixedOffset,
    strike_step: f64,
    quantity: u32,
}

impl SignalAggregator {
    pub fn new(policy: &RegimePolicy, engine: &EngineConfig) -> EngineResult<Self> {
        let offset = engine.session_offset().ok_or_else(|| {
            EngineError::config(format!(
                "invalid utc_offset_minutes {}",
                engine.utc_offset_minutes
            ))
        })?;

        Ok(Self {
            chain: FilterChain::for_policy(policy),
            offset,
            strike_step: engine.strike_step,
            quantity: engine.quantity(),
        })
    }

    /// Evaluate the crossover pending for `entry_index`, if any.
    ///
    /// Returns `None` when no crossover was detected on the previous candle.
    pub fn evaluate(
        &self,
        sets: &[IndicatorSet],
        entry_index: usize,
        short: Option<&[IndicatorSet]>,
        policy: &RegimePolicy,
    ) -> Option<Signal> {
        let crossover = crossover::pending_for_entry(sets, entry_index)?;
        let entry = &sets[entry_index];

        let ctx = FilterContext {
            direction: crossover.direction,
            local_time: entry.timestamp.with_timezone(&self.offset).time(),
            entry,
            short,
        };
        let result = self.chain.evaluate(&ctx, policy);

        let (signal_type, request) = if result.passed {
            let option_type = crossover.direction.option_type();
            (
                SignalType::for_direction(crossover.direction),
                Some(EntryRequest {
                    option_type,
                    strike: atm_strike(entry.close, self.strike_step),
                    quantity: self.quantity,
                }),
            )
        } else {
            (SignalType::None, None)
        };

        Some(Signal {
            signal_type,
            timestamp: entry.timestamp,
            crossover,
            entry_index,
            underlying_price: entry.close,
            outcomes: result.outcomes,
            entry: request,
        })
    }
}

/// Candle-driven signal producer.
///
/// Holds the primary and short-timeframe candle history and evaluates once
/// per closed primary candle.
pub struct SignalEngine {
    regime: Arc<dyn Regime>,
    aggregator: SignalAggregator,
    use_short: bool,
    candles: Vec<Candle>,
    short_candles: Vec<Candle>,
}

impl SignalEngine {
    pub fn new(regime: Arc<dyn Regime>, engine: &EngineConfig) -> EngineResult<Self> {
        let aggregator = SignalAggregator::new(regime.filter_thresholds(), engine)?;
        Ok(Self {
            regime,
            aggregator,
            use_short: engine.short_interval.is_some(),
            candles: Vec::new(),
            short_candles: Vec::new(),
        })
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.candles.last().map(|c| c.datetime)
    }

    pub fn last_short_timestamp(&self) -> Option<DateTime<Utc>> {
        self.short_candles.last().map(|c| c.datetime)
    }

    /// Append a finer-interval candle. Never evaluates anything.
    pub fn on_short_candle(&mut self, candle: Candle) {
        if accept(&self.short_candles, &candle, "short") {
            push_bounded(&mut self.short_candles, candle);
        }
    }

    /// Append a closed primary candle and evaluate the crossover pending
    /// for it.
    pub fn on_candle(&mut self, candle: Candle) -> Option<Signal> {
        if !accept(&self.candles, &candle, "primary") {
            return None;
        }
        push_bounded(&mut self.candles, candle);

        let policy = self.regime.filter_thresholds();
        let sets = indicators::compute(&self.candles, &policy.periods);
        let entry_index = sets.len().checked_sub(1)?;

        let short_sets = if self.use_short {
            Some(indicators::compute(&self.short_candles, &policy.periods))
        } else {
            None
        };

        let signal =
            self.aggregator
                .evaluate(&sets, entry_index, short_sets.as_deref(), policy)?;

        match signal.failing() {
            None => info!(
                signal = %signal.signal_type,
                strike = signal.entry.map(|e| e.strike),
                close = signal.underlying_price,
                detected_index = signal.crossover.detected_index,
                "Entry signal"
            ),
            Some(failed) => debug!(
                direction = %signal.crossover.direction,
                filter = %failed.filter_name,
                reason = %failed.reason,
                "Crossover rejected"
            ),
        }

        Some(signal)
    }
}

fn accept(history: &[Candle], candle: &Candle, feed: &str) -> bool {
    if let Err(e) = candle.validate() {
        warn!(feed, datetime = %candle.datetime, error = %e, "Skipping invalid candle");
        return false;
    }
    if let Some(last) = history.last() {
        if candle.datetime <= last.datetime {
            warn!(
                feed,
                datetime = %candle.datetime,
                last = %last.datetime,
                "Skipping out-of-order or duplicate candle"
            );
            return false;
        }
    }
    true
}

fn push_bounded(history: &mut Vec<Candle>, candle: Candle) {
    history.push(candle);
    if history.len() > MAX_HISTORY {
        let excess = history.len() - MAX_HISTORY;
        history.drain(..excess);
    }
}
