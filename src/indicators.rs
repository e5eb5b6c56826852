//! Indicator calculation
//!
//! Derives one [`IndicatorSet`] per candle:
//! - Price Strength (PS): EMA of the close location value
//! - Volume Strength (VS): volume-weighted WMA of the close location value
//! - ATR (Wilder) and the ATR ratio against its trailing mean
//! - RSI (Wilder)
//!
//! Readings that cannot be trusted (short history, zero volume, non-finite
//! values) are returned as indeterminate rather than as zeros. Downstream
//! filters fail closed on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ta::indicators::ExponentialMovingAverage;
use ta::Next;

use crate::config::IndicatorPeriods;
use crate::Candle;

// =============================================================================
// Indicator Set
// =============================================================================

/// Why a reading is indeterminate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DataQualityIssue {
    /// Not enough candles for the PS/VS windows yet
    InsufficientHistory { have: usize, need: usize },
    /// A candle inside the VS window carried no volume
    ZeroVolume { index: usize },
    /// PS or VS came out NaN/infinite
    NonFinite,
}

impl std::fmt::Display for DataQualityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientHistory { have, need } => {
                write!(f, "insufficient history ({have}/{need} candles)")
            }
            Self::ZeroVolume { index } => write!(f, "zero volume at candle {index}"),
            Self::NonFinite => write!(f, "non-finite indicator value"),
        }
    }
}

/// Indicator readings at one candle index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    pub close: f64,
    pub ps: f64,
    pub vs: f64,
    /// `None` until the ATR window fills
    pub atr: Option<f64>,
    /// `None` when ATR is unavailable or its trailing mean is zero
    pub atr_ratio: Option<f64>,
    /// `None` until the RSI window fills
    pub rsi: Option<f64>,
    pub ps_vs_diff_pct: f64,
    pub volume: f64,
    /// Mean volume of the preceding candles
    pub volume_avg: Option<f64>,
    /// `Some` when PS/VS cannot be trusted at this index
    pub indeterminate: Option<DataQualityIssue>,
}

impl IndicatorSet {
    pub fn is_valid(&self) -> bool {
        self.indeterminate.is_none()
    }

    /// Signed PS minus VS
    pub fn gap(&self) -> f64 {
        self.ps - self.vs
    }
}

/// `|ps - vs| / max(|ps|, |vs|) * 100`, always within `[0, 100]`
pub fn strength_gap_pct(ps: f64, vs: f64) -> f64 {
    let denom = ps.abs().max(vs.abs());
    if denom == 0.0 {
        return 0.0;
    }
    ((ps - vs).abs() / denom * 100.0).min(100.0)
}

/// Compute indicator readings for every candle in `candles`.
///
/// The output has the same length as the input so indices line up with the
/// candle sequence; entries before the PS/VS window are indeterminate.
pub fn compute(candles: &[Candle], periods: &IndicatorPeriods) -> Vec<IndicatorSet> {
    if candles.is_empty() {
        return vec![];
    }

    let high: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let low: Vec<f64> = candles.iter().map(|c| c.low).collect();
    let close: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volume: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    let clv: Vec<f64> = candles.iter().map(Candle::close_location).collect();

    let ps = ema(&clv, periods.ps_period);
    let vs = volume_weighted_wma(&clv, &volume, periods.vs_period);
    let atr_values = atr(&high, &low, &close, periods.atr_period);
    let atr_ratios = atr_ratio(&atr_values, periods.atr_ratio_window);
    let rsi_values = rsi(&close, periods.rsi_period);
    let volume_avgs = trailing_mean(&volume, periods.volume_avg_window);

    let need = periods.min_history();

    candles
        .iter()
        .enumerate()
        .map(|(i, candle)| {
            let (ps_i, vs_i, issue) = match (ps[i], vs[i]) {
                _ if i + 1 < need => (
                    f64::NAN,
                    f64::NAN,
                    Some(DataQualityIssue::InsufficientHistory { have: i + 1, need }),
                ),
                (_, Err(issue)) => (ps[i].unwrap_or(f64::NAN), f64::NAN, Some(issue)),
                (Some(p), Ok(v)) if p.is_finite() && v.is_finite() => (p, v, None),
                (p, Ok(v)) => (p.unwrap_or(f64::NAN), v, Some(DataQualityIssue::NonFinite)),
            };

            let diff = if issue.is_none() {
                strength_gap_pct(ps_i, vs_i)
            } else {
                f64::NAN
            };

            IndicatorSet {
                index: i,
                timestamp: candle.datetime,
                close: candle.close,
                ps: ps_i,
                vs: vs_i,
                atr: atr_values[i],
                atr_ratio: atr_ratios[i],
                rsi: rsi_values[i],
                ps_vs_diff_pct: diff,
                volume: candle.volume,
                volume_avg: volume_avgs[i],
                indeterminate: issue,
            }
        })
        .collect()
}

// =============================================================================
// Moving Averages
// =============================================================================

/// Calculate Exponential Moving Average
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match ExponentialMovingAverage::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    let mut result = Vec::with_capacity(values.len());

    for (i, &value) in values.iter().enumerate() {
        let ema_val = indicator.next(value);
        if i + 1 >= period {
            result.push(Some(ema_val));
        } else {
            result.push(None);
        }
    }

    result
}

/// Linearly weighted average of `values`, additionally weighted by `volume`.
///
/// Weight `i` (1-based) favours the most recent candle. Any zero or
/// non-finite volume inside the window makes that reading indeterminate.
pub fn volume_weighted_wma(
    values: &[f64],
    volume: &[f64],
    period: usize,
) -> Vec<Result<f64, DataQualityIssue>> {
    if values.is_empty() || period == 0 || values.len() != volume.len() {
        return vec![];
    }

    let mut result = Vec::with_capacity(values.len());

    for i in 0..values.len() {
        if i + 1 < period {
            result.push(Err(DataQualityIssue::InsufficientHistory {
                have: i + 1,
                need: period,
            }));
            continue;
        }

        let start = i + 1 - period;
        if let Some(offset) = volume[start..=i]
            .iter()
            .position(|v| !v.is_finite() || *v <= 0.0)
        {
            result.push(Err(DataQualityIssue::ZeroVolume {
                index: start + offset,
            }));
            continue;
        }

        let (num, den) = values[start..=i]
            .iter()
            .zip(&volume[start..=i])
            .enumerate()
            .fold((0.0, 0.0), |(num, den), (j, (&x, &v))| {
                let w = (j + 1) as f64 * v;
                (num + w * x, den + w)
            });

        result.push(Ok(num / den));
    }

    result
}

/// Mean of up to `window` values preceding each index
pub fn trailing_mean(values: &[f64], window: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            if i == 0 || window == 0 {
                return None;
            }
            let start = i.saturating_sub(window);
            let slice = &values[start..i];
            Some(slice.iter().sum::<f64>() / slice.len() as f64)
        })
        .collect()
}

// =============================================================================
// Volatility Indicators
// =============================================================================

/// Calculate True Range
pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    let mut tr = Vec::with_capacity(high.len());

    for i in 0..high.len() {
        let tr_value = if i == 0 {
            high[i] - low[i]
        } else {
            let hl = high[i] - low[i];
            let hc = (high[i] - close[i - 1]).abs();
            let lc = (low[i] - close[i - 1]).abs();
            hl.max(hc).max(lc)
        };
        tr.push(tr_value);
    }

    tr
}

/// Calculate Average True Range (ATR) using Wilder's smoothing
///
/// ATR = (prev_ATR * (period - 1) + current_TR) / period, seeded with the
/// SMA of the first `period` true ranges.
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    if high.is_empty() || period == 0 || high.len() != low.len() || high.len() != close.len() {
        return vec![];
    }

    let tr = true_range(high, low, close);
    let mut result = Vec::with_capacity(high.len());
    let mut atr_value: Option<f64> = None;

    for i in 0..tr.len() {
        if i + 1 < period {
            result.push(None);
        } else if i + 1 == period {
            let sum: f64 = tr[0..period].iter().sum();
            atr_value = Some(sum / period as f64);
            result.push(atr_value);
        } else if let Some(prev_atr) = atr_value {
            let new_atr = (prev_atr * (period - 1) as f64 + tr[i]) / period as f64;
            atr_value = Some(new_atr);
            result.push(atr_value);
        } else {
            result.push(None);
        }
    }

    result
}

/// Current ATR divided by the mean of the trailing ATR values (current
/// included, up to `window` of them). A zero mean is indeterminate.
pub fn atr_ratio(atr_values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    (0..atr_values.len())
        .map(|i| {
            let current = atr_values[i]?;
            let start = (i + 1).saturating_sub(window.max(1));
            let trailing: Vec<f64> = atr_values[start..=i].iter().flatten().copied().collect();
            let mean = trailing.iter().sum::<f64>() / trailing.len() as f64;
            if mean > 0.0 && mean.is_finite() {
                Some(current / mean)
            } else {
                None
            }
        })
        .collect()
}

// =============================================================================
// Momentum Indicators
// =============================================================================

/// Calculate RSI with Wilder's smoothing.
///
/// First value appears at index `period` (needs `period` price changes).
/// A series with no losses reads 100, one with no movement reads 50.
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut result = vec![None; values.len()];
    if values.len() <= period {
        return result;
    }

    let changes: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();

    let mut avg_gain = changes[..period].iter().map(|c| c.max(0.0)).sum::<f64>() / period as f64;
    let mut avg_loss = changes[..period].iter().map(|c| (-c).max(0.0)).sum::<f64>() / period as f64;
    result[period] = Some(rsi_from_averages(avg_gain, avg_loss));

    for (offset, &change) in changes[period..].iter().enumerate() {
        avg_gain = (avg_gain * (period - 1) as f64 + change.max(0.0)) / period as f64;
        avg_loss = (avg_loss * (period - 1) as f64 + (-change).max(0.0)) / period as f64;
        result[period + offset + 1] = Some(rsi_from_averages(avg_gain, avg_loss));
    }

    result
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        if avg_gain == 0.0 {
            50.0
        } else {
            100.0
        }
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

// =============================================================================
// Tests
// =============================================================================
