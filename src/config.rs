//! Configuration management
//!
//! Handles loading and validation of the JSON configuration file. The regime
//! policy is loaded once per session and passed by reference everywhere it is
//! needed; nothing here is global.

use anyhow::{Context, Result};
use chrono::{FixedOffset, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{EngineError, EngineResult};
use crate::stop_loss::StopLossPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub regime: RegimePolicy,
}

impl Config {
    /// Load configuration from JSON file and validate it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        config.validate()?;
        Ok(config)
    }

    /// Reject contradictory bounds before anything trades on them
    pub fn validate(&self) -> EngineResult<()> {
        self.engine.validate()?;
        self.regime.validate()?;

        if self.regime.multi_timeframe.enabled && self.engine.short_interval.is_none() {
            return Err(EngineError::config(format!(
                "regime '{}' enables multi_timeframe but engine.short_interval is not set",
                self.regime.name
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Engine Settings
// =============================================================================

/// Instrument, sizing and timing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Underlying instrument (e.g. "NSE:NIFTY 50")
    pub instrument: String,
    /// Distance between listed strikes
    pub strike_step: f64,
    /// Contracts per lot
    pub lot_size: u32,
    /// Lots traded per entry
    pub lot_count: u32,
    /// Primary candle interval (e.g. "1m", "5m")
    pub candle_interval: String,
    /// Finer interval for multi-timeframe checks
    pub short_interval: Option<String>,
    /// How often the candle feed is checked for newly closed candles
    pub candle_poll_secs: u64,
    /// Premium-poll cadence, independent of candle boundaries
    pub premium_poll_secs: u64,
    /// Order status polling cadence while waiting for fills
    pub order_poll_millis: u64,
    /// Entry orders that do not fill within this window are cancelled
    pub entry_fill_timeout_secs: u64,
    /// Exit fills are awaited this long per attempt
    pub exit_fill_timeout_secs: u64,
    /// Exchange local time offset from UTC, used for the session window
    pub utc_offset_minutes: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            instrument: "NSE:NIFTY 50".to_string(),
            strike_step: 50.0,
            lot_size: 75,
            lot_count: 1,
            candle_interval: "5m".to_string(),
            short_interval: Some("1m".to_string()),
            candle_poll_secs: 5,
            premium_poll_secs: 5,
            order_poll_millis: 500,
            entry_fill_timeout_secs: 30,
            exit_fill_timeout_secs: 30,
            utc_offset_minutes: 330, // IST
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.instrument.trim().is_empty() {
            return Err(EngineError::config("engine.instrument must not be empty"));
        }
        if !(self.strike_step > 0.0) {
            return Err(EngineError::config(format!(
                "engine.strike_step must be > 0, got {}",
                self.strike_step
            )));
        }
        if self.lot_size == 0 || self.lot_count == 0 {
            return Err(EngineError::config(
                "engine.lot_size and engine.lot_count must be > 0",
            ));
        }
        let Some(primary) = crate::data::parse_interval(&self.candle_interval) else {
            return Err(EngineError::config(format!(
                "engine.candle_interval '{}' is not a minute/hour interval",
                self.candle_interval
            )));
        };
        if let Some(short) = &self.short_interval {
            match crate::data::parse_interval(short) {
                None => {
                    return Err(EngineError::config(format!(
                        "engine.short_interval '{short}' is not a minute/hour interval"
                    )));
                }
                Some(step) if step >= primary => {
                    return Err(EngineError::config(format!(
                        "engine.short_interval '{short}' must be finer than '{}'",
                        self.candle_interval
                    )));
                }
                Some(_) => {}
            }
        }
        if self.candle_poll_secs == 0 || self.premium_poll_secs == 0 || self.order_poll_millis == 0 {
            return Err(EngineError::config("poll intervals must be > 0"));
        }
        if self.entry_fill_timeout_secs == 0 || self.exit_fill_timeout_secs == 0 {
            return Err(EngineError::config("fill timeouts must be > 0"));
        }
        if self.session_offset().is_none() {
            return Err(EngineError::config(format!(
                "engine.utc_offset_minutes out of range: {}",
                self.utc_offset_minutes
            )));
        }
        Ok(())
    }

    /// Order quantity for one entry
    pub fn quantity(&self) -> u32 {
        self.lot_size * self.lot_count
    }

    pub fn session_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
    }
}

// =============================================================================
// Regime Policy
// =============================================================================

/// Which family of thresholds a regime belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegimeKind {
    /// Option buying: needs expanding volatility, upper ATR bound optional
    Buy,
    /// Volatility must stay inside both ATR bounds
    Bounded,
}

/// Inclusive `[min, max]` range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub min: f64,
    pub max: f64,
}

impl Band {
    pub const fn new(min: f64, max: f64) -> Self {
        Band { min, max }
    }

    fn validate(&self, what: &str) -> EngineResult<()> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(EngineError::config(format!("{what}: bounds must be finite")));
        }
        if self.min > self.max {
            return Err(EngineError::config(format!(
                "{what}: min ({}) > max ({})",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Indicator window lengths
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorPeriods {
    pub ps_period: usize,
    pub vs_period: usize,
    pub atr_period: usize,
    pub rsi_period: usize,
    pub atr_ratio_window: usize,
    pub volume_avg_window: usize,
}

impl Default for IndicatorPeriods {
    fn default() -> Self {
        IndicatorPeriods {
            ps_period: 3,
            vs_period: 6,
            atr_period: 14,
            rsi_period: 9,
            atr_ratio_window: 20,
            volume_avg_window: 20,
        }
    }
}

impl IndicatorPeriods {
    /// Candles needed before PS and VS are both defined
    pub fn min_history(&self) -> usize {
        self.ps_period.max(self.vs_period)
    }
}

/// Trading window in exchange-local time, `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl SessionWindow {
    pub fn contains(&self, t: NaiveTime) -> bool {
        t >= self.start && t < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AtrBounds {
    pub min_multiplier: f64,
    /// `None` leaves the upper side unbounded
    #[serde(default)]
    pub max_multiplier: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RsiBounds {
    /// Calls are blocked above this RSI
    pub ce_max: f64,
    /// Puts are blocked below this RSI
    pub pe_min: f64,
}

/// Tight/wide strength-gap bands selected by multi-timeframe alignment
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DynamicGapBands {
    pub tight: Band,
    pub wide: Band,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrengthGapBounds {
    pub min: f64,
    pub max: f64,
    /// When present, replaces the static band per evaluation
    #[serde(default)]
    pub dynamic: Option<DynamicGapBands>,
}

impl StrengthGapBounds {
    pub fn static_band(&self) -> Band {
        Band::new(self.min, self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MultiTimeframeThresholds {
    pub enabled: bool,
    /// Minimum |Δgap| per short candle
    pub momentum_threshold: f64,
    /// Short candles spanned by the momentum measurement
    pub momentum_window: usize,
    /// Maximum relative disagreement between the two gaps, in percent
    pub divergence_threshold_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeThresholds {
    pub enabled: bool,
    pub spike_threshold: f64,
}

/// Per-regime thresholds, immutable for a trading session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimePolicy {
    pub name: String,
    pub kind: RegimeKind,
    pub periods: IndicatorPeriods,
    pub session: SessionWindow,
    pub atr: AtrBounds,
    pub rsi: RsiBounds,
    pub strength_gap: StrengthGapBounds,
    pub multi_timeframe: MultiTimeframeThresholds,
    pub volume: VolumeThresholds,
    pub stop_loss: StopLossPolicy,
    pub max_concurrent_positions: usize,
}

impl Default for RegimePolicy {
    fn default() -> Self {
        RegimePolicy {
            name: "buy".to_string(),
            kind: RegimeKind::Buy,
            periods: IndicatorPeriods::default(),
            session: SessionWindow {
                start: NaiveTime::from_hms_opt(10, 0, 0).unwrap_or_default(),
                end: NaiveTime::from_hms_opt(14, 30, 0).unwrap_or_default(),
            },
            atr: AtrBounds {
                min_multiplier: 1.0,
                max_multiplier: None,
            },
            rsi: RsiBounds {
                ce_max: 75.0,
                pe_min: 25.0,
            },
            strength_gap: StrengthGapBounds {
                min: 2.0,
                max: 5.0,
                dynamic: Some(DynamicGapBands {
                    tight: Band::new(2.0, 3.0),
                    wide: Band::new(3.0, 20.0),
                }),
            },
            multi_timeframe: MultiTimeframeThresholds {
                enabled: true,
                momentum_threshold: 0.5,
                momentum_window: 3,
                divergence_threshold_pct: 50.0,
            },
            volume: VolumeThresholds {
                enabled: true,
                spike_threshold: 1.5,
            },
            stop_loss: StopLossPolicy::FixedPoints { points: 30.0 },
            max_concurrent_positions: 1,
        }
    }
}

impl RegimePolicy {
    pub fn validate(&self) -> EngineResult<()> {
        let p = &self.periods;
        if p.ps_period == 0
            || p.vs_period == 0
            || p.atr_period == 0
            || p.rsi_period == 0
            || p.atr_ratio_window == 0
            || p.volume_avg_window == 0
        {
            return Err(EngineError::config("indicator periods must be > 0"));
        }

        if self.session.start >= self.session.end {
            return Err(EngineError::config(format!(
                "session: start ({}) must be before end ({})",
                self.session.start, self.session.end
            )));
        }

        if !(self.atr.min_multiplier >= 0.0) {
            return Err(EngineError::config("atr.min_multiplier must be >= 0"));
        }
        match (self.kind, self.atr.max_multiplier) {
            (_, Some(max)) if max < self.atr.min_multiplier => {
                return Err(EngineError::config(format!(
                    "atr: min_multiplier ({}) > max_multiplier ({})",
                    self.atr.min_multiplier, max
                )));
            }
            (RegimeKind::Bounded, None) => {
                return Err(EngineError::config(
                    "bounded regime requires atr.max_multiplier",
                ));
            }
            _ => {}
        }

        for (label, v) in [("rsi.ce_max", self.rsi.ce_max), ("rsi.pe_min", self.rsi.pe_min)] {
            if !(0.0..=100.0).contains(&v) {
                return Err(EngineError::config(format!("{label} must be within 0..=100")));
            }
        }

        self.strength_gap.static_band().validate("strength_gap")?;
        if let Some(dynamic) = &self.strength_gap.dynamic {
            dynamic.tight.validate("strength_gap.dynamic.tight")?;
            dynamic.wide.validate("strength_gap.dynamic.wide")?;
        }
        if self.strength_gap.min < 0.0 {
            return Err(EngineError::config("strength_gap.min must be >= 0"));
        }

        let mtf = &self.multi_timeframe;
        if mtf.momentum_window == 0 {
            return Err(EngineError::config("multi_timeframe.momentum_window must be > 0"));
        }
        if mtf.momentum_threshold < 0.0 || mtf.divergence_threshold_pct < 0.0 {
            return Err(EngineError::config("multi_timeframe thresholds must be >= 0"));
        }

        if !(self.volume.spike_threshold > 0.0) {
            return Err(EngineError::config("volume.spike_threshold must be > 0"));
        }

        self.stop_loss.validate()?;

        if self.max_concurrent_positions != 1 {
            return Err(EngineError::config(format!(
                "max_concurrent_positions must be 1 for a single regime instance, got {}",
                self.max_concurrent_positions
            )));
        }

        Ok(())
    }
}
