//! Market data loading
//!
//! CSV candle files and the [`MarketDataSource`] seam the trading loop pulls
//! closed candles through.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::Candle;

/// Supplies closed candles for an instrument, per interval
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Closed candles for `interval` strictly after `after`, oldest first
    async fn candles_after(
        &self,
        interval: &str,
        after: Option<DateTime<Utc>>,
    ) -> EngineResult<Vec<Candle>>;
}

/// Parse an interval label ("1m", "5m", "1h") into a duration
pub fn parse_interval(interval: &str) -> Option<Duration> {
    let split = interval.find(|c: char| !c.is_ascii_digit())?;
    let (count, unit) = interval.split_at(split);
    let count: i64 = count.parse().ok().filter(|n| *n > 0)?;
    match unit {
        "m" => Some(Duration::minutes(count)),
        "h" => Some(Duration::hours(count)),
        _ => None,
    }
}

/// Gaps larger than one interval, as `(previous, next)` timestamp pairs.
/// Overnight breaks show up here too; callers decide what is acceptable.
pub fn find_gaps(candles: &[Candle], step: Duration) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    candles
        .windows(2)
        .filter(|w| w[1].datetime - w[0].datetime > step)
        .map(|w| (w[0].datetime, w[1].datetime))
        .collect()
}

// =============================================================================
// CSV Data Loading
// =============================================================================

/// Load OHLCV data from a CSV file with validation.
///
/// Columns: datetime, open, high, low, close, volume. Invalid, duplicate
/// and out-of-order rows are skipped with a warning.
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open CSV file {}", path.display()))?;

    let mut candles: Vec<Candle> = Vec::new();
    let mut skipped = 0;

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("Failed to read row {}", row_idx + 1))?;

        let dt_str = record.get(0).context("Missing datetime column")?;
        let datetime = parse_datetime(dt_str)
            .with_context(|| format!("Failed to parse datetime: {dt_str}"))?;

        let field = |idx: usize, name: &str| -> Result<f64> {
            record
                .get(idx)
                .with_context(|| format!("Missing {name} column"))?
                .trim()
                .parse()
                .with_context(|| format!("Failed to parse {name} at row {}", row_idx + 2))
        };
        let open = field(1, "open")?;
        let high = field(2, "high")?;
        let low = field(3, "low")?;
        let close = field(4, "close")?;
        let volume = field(5, "volume")?;

        let candle = match Candle::new(datetime, open, high, low, close, volume) {
            Ok(candle) => candle,
            Err(e) => {
                skipped += 1;
                warn!(row = row_idx + 2, file = %path.display(), error = %e, "Skipping invalid candle");
                continue;
            }
        };

        if let Some(last) = candles.last() {
            if candle.datetime <= last.datetime {
                skipped += 1;
                warn!(row = row_idx + 2, file = %path.display(), datetime = %candle.datetime, "Skipping out-of-order candle");
                continue;
            }
        }
        candles.push(candle);
    }

    if skipped > 0 {
        warn!(
            skipped,
            total = skipped + candles.len(),
            file = %path.display(),
            "Skipped candles while loading"
        );
    }

    Ok(candles)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = s.parse::<DateTime<Utc>>() {
        return Ok(dt);
    }
    // Without an offset the timestamp is taken as UTC
    let naive = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")?;
    Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

// =============================================================================
// CSV-backed source
// =============================================================================

/// In-memory candle feeds keyed by interval
#[derive(Debug, Default, Clone)]
pub struct CsvMarketData {
    feeds: HashMap<String, Vec<Candle>>,
}

impl CsvMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `path` as the feed for `interval`
    pub fn load(mut self, interval: &str, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let candles = load_csv(path)?;
        info!(interval, candles = candles.len(), file = %path.display(), "Loaded candle feed");

        if let Some(step) = parse_interval(interval) {
            let gaps = find_gaps(&candles, step);
            if !gaps.is_empty() {
                warn!(interval, gaps = gaps.len(), "Candle feed has gaps");
            }
        }

        self.feeds.insert(interval.to_string(), candles);
        Ok(self)
    }

    pub fn with_candles(mut self, interval: &str, candles: Vec<Candle>) -> Self {
        self.feeds.insert(interval.to_string(), candles);
        self
    }

    pub fn candles(&self, interval: &str) -> &[Candle] {
        self.feeds.get(interval).map(Vec::as_slice).unwrap_or_default()
    }
}

#[async_trait]
impl MarketDataSource for CsvMarketData {
    async fn candles_after(
        &self,
        interval: &str,
        after: Option<DateTime<Utc>>,
    ) -> EngineResult<Vec<Candle>> {
        let feed = self
            .feeds
            .get(interval)
            .ok_or_else(|| EngineError::DataQuality(format!("no candle feed for interval {interval}")))?;

        Ok(feed
            .iter()
            .filter(|c| after.is_none_or(|t| c.datetime > t))
            .cloned()
            .collect())
    }
}
