//! Trading engine
//!
//! Wires the signal engine, the position manager and the data/quote seams
//! together. Two cadences drive it: closed candles (signal path) and the
//! premium poll (P&L and order status). The premium path never evaluates
//! filters and the candle path never touches premiums.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::iter::Peekable;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::audit::AuditSink;
use crate::config::{Config, EngineConfig};
use crate::data::{self, MarketDataSource};
use crate::error::{EngineError, EngineResult};
use crate::oms::{
    EntryOutcome, ManagerSettings, OrderGateway, Position, PositionManager, QuoteSource,
};
use crate::regime::Regime;
use crate::signal::{Signal, SignalEngine, SignalType};
use crate::Candle;

/// Signal counts for one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SignalStats {
    /// Crossovers that reached the filter chain
    pub evaluated: usize,
    pub buy_ce: usize,
    pub buy_pe: usize,
    pub rejected: usize,
}

impl SignalStats {
    fn record(&mut self, signal: &Signal) {
        self.evaluated += 1;
        match signal.signal_type {
            SignalType::BuyCe => self.buy_ce += 1,
            SignalType::BuyPe => self.buy_pe += 1,
            SignalType::None => self.rejected += 1,
        }
    }
}

/// End-of-session report
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub signals: SignalStats,
    pub trades: usize,
    pub winners: usize,
    pub losers: usize,
    pub total_pnl_points: f64,
    pub total_pnl_value: f64,
    pub open_position: Option<Position>,
}

impl SessionSummary {
    fn from_parts(signals: SignalStats, closed: &[Position], open: Option<Position>) -> Self {
        Self {
            signals,
            trades: closed.len(),
            winners: closed.iter().filter(|p| p.pnl_value > 0.0).count(),
            losers: closed.iter().filter(|p| p.pnl_value < 0.0).count(),
            total_pnl_points: closed.iter().map(|p| p.pnl_points).sum(),
            total_pnl_value: closed.iter().map(|p| p.pnl_value).sum(),
            open_position: open,
        }
    }
}

impl std::fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rule = "=".repeat(60);
        writeln!(f, "{rule}")?;
        writeln!(f, "SESSION SUMMARY")?;
        writeln!(f, "{rule}")?;
        writeln!(f, "Crossovers Evaluated: {}", self.signals.evaluated)?;
        writeln!(f, "BUY_CE Signals:       {}", self.signals.buy_ce)?;
        writeln!(f, "BUY_PE Signals:       {}", self.signals.buy_pe)?;
        writeln!(f, "Filtered Out:         {}", self.signals.rejected)?;
        writeln!(f, "Closed Trades:        {}", self.trades)?;
        writeln!(f, "Winning Trades:       {}", self.winners)?;
        writeln!(f, "Losing Trades:        {}", self.losers)?;
        writeln!(f, "Total P&L (points):   {:.2}", self.total_pnl_points)?;
        writeln!(f, "Total P&L:            ₹{:.2}", self.total_pnl_value)?;
        if let Some(open) = &self.open_position {
            writeln!(
                f,
                "Open Position:        {} @ {:.2} ({})",
                open.contract, open.entry_premium, open.status
            )?;
        }
        write!(f, "{rule}")
    }
}

pub struct TradingEngine {
    config: EngineConfig,
    primary_step: chrono::Duration,
    signals: Mutex<SignalEngine>,
    stats: Mutex<SignalStats>,
    manager: Arc<PositionManager>,
    market: Arc<dyn MarketDataSource>,
    quotes: Arc<dyn QuoteSource>,
    audit: Arc<dyn AuditSink>,
}

impl TradingEngine {
    pub fn new(
        config: &Config,
        gateway: Arc<dyn OrderGateway>,
        quotes: Arc<dyn QuoteSource>,
        market: Arc<dyn MarketDataSource>,
        audit: Arc<dyn AuditSink>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let primary_step = data::parse_interval(&config.engine.candle_interval).ok_or_else(|| {
            EngineError::config(format!(
                "unsupported candle interval '{}'",
                config.engine.candle_interval
            ))
        })?;

        let regime: Arc<dyn Regime> = Arc::new(config.regime.clone());
        let signals = SignalEngine::new(regime.clone(), &config.engine)?;
        let manager = PositionManager::new(
            regime,
            gateway,
            audit.clone(),
            ManagerSettings::from_config(&config.engine),
        )?;

        Ok(Self {
            config: config.engine.clone(),
            primary_step,
            signals: Mutex::new(signals),
            stats: Mutex::new(SignalStats::default()),
            manager: Arc::new(manager),
            market,
            quotes,
            audit,
        })
    }

    pub fn manager(&self) -> &Arc<PositionManager> {
        &self.manager
    }

    // =========================================================================
    // Candle path
    // =========================================================================

    /// Feed one closed primary candle. Returns the signal evaluated on it,
    /// if a crossover was pending.
    pub async fn process_candle(&self, candle: Candle) -> EngineResult<Option<Signal>> {
        let signal = self.signals.lock().on_candle(candle);
        let Some(signal) = signal else {
            return Ok(None);
        };

        self.stats.lock().record(&signal);
        self.audit.record_signal(&signal);

        if signal.is_actionable() {
            match self.manager.on_signal(&signal).await? {
                EntryOutcome::Opened(position) => {
                    debug!(position_id = position.id, "Entry complete")
                }
                EntryOutcome::Busy(state) => {
                    info!(signal = %signal.signal_type, state = %state, "Signal skipped, position active")
                }
                EntryOutcome::Aborted {
                    position_id,
                    reason,
                } => warn!(position_id, reason = %reason, "Entry did not complete"),
                EntryOutcome::ProtectionFailed(position) => {
                    error!(position_id = position.id, status = %position.status, "Entry unwound after protection failure")
                }
                EntryOutcome::NotActionable => {}
            }
        }

        Ok(Some(signal))
    }

    pub fn process_short_candle(&self, candle: Candle) {
        self.signals.lock().on_short_candle(candle);
    }

    /// Close time of a primary candle
    pub fn primary_close_time(&self, candle: &Candle) -> DateTime<Utc> {
        candle.datetime + self.primary_step
    }

    /// Feed short candles that opened before `close_time`. Anything later
    /// stays in the iterator so the primary evaluation never sees finer
    /// candles from its future.
    pub fn feed_short_until<I>(&self, short: &mut Peekable<I>, close_time: DateTime<Utc>)
    where
        I: Iterator<Item = Candle>,
    {
        while let Some(candle) = short.next_if(|c| c.datetime < close_time) {
            self.process_short_candle(candle);
        }
    }

    /// Pull newly closed candles from the market data source and process
    /// them in time order across both feeds.
    pub async fn sync_candles(&self) -> EngineResult<usize> {
        let short = match &self.config.short_interval {
            Some(short_interval) => {
                let after = self.signals.lock().last_short_timestamp();
                self.market.candles_after(short_interval, after).await?
            }
            None => Vec::new(),
        };
        let mut short = short.into_iter().peekable();

        let after = self.signals.lock().last_timestamp();
        let candles = self
            .market
            .candles_after(&self.config.candle_interval, after)
            .await?;
        let count = candles.len();
        for candle in candles {
            let close_time = self.primary_close_time(&candle);
            self.feed_short_until(&mut short, close_time);
            self.process_candle(candle).await?;
        }
        short.for_each(|candle| self.process_short_candle(candle));

        Ok(count)
    }

    // =========================================================================
    // Premium path
    // =========================================================================

    /// Refresh the active position's premium, then advance any working
    /// protective or exit order. Returns the position if it closed.
    pub async fn poll_premium(&self) -> EngineResult<Option<Position>> {
        if let Some(position) = self.manager.position() {
            match self.quotes.current_premium(&position.contract).await {
                Ok(premium) => match self.manager.on_premium(premium) {
                    Ok(Some(updated)) => debug!(
                        position_id = updated.id,
                        premium,
                        pnl_points = updated.pnl_points,
                        pnl_value = updated.pnl_value,
                        "Premium update"
                    ),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Ignoring premium update"),
                },
                Err(e) => warn!(contract = %position.contract, error = %e, "Premium quote failed"),
            }
        }

        self.manager.poll_orders().await
    }

    // =========================================================================
    // Session
    // =========================================================================

    pub fn summary(&self) -> SessionSummary {
        SessionSummary::from_parts(
            *self.stats.lock(),
            &self.manager.closed_positions(),
            self.manager.position(),
        )
    }

    /// Run both cadences until `shutdown` flips to true or a fatal error
    /// occurs. Non-fatal errors are logged and the loop continues.
    ///
    /// The candle and premium paths share one `select!`, so they are
    /// serialized: while a candle tick waits on an entry or exit fill (up to
    /// the configured fill timeouts), premium polls and the shutdown signal
    /// are not serviced until that tick returns.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> EngineResult<SessionSummary> {
        let mut candle_tick = interval(Duration::from_secs(self.config.candle_poll_secs));
        let mut premium_tick = interval(Duration::from_secs(self.config.premium_poll_secs));
        candle_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        premium_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            instrument = %self.config.instrument,
            interval = %self.config.candle_interval,
            short_interval = ?self.config.short_interval,
            "Starting trading loop"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received");
                        break;
                    }
                }
                _ = candle_tick.tick() => {
                    if let Err(e) = self.sync_candles().await {
                        if e.is_fatal() {
                            error!(error = %e, "Fatal error on candle path");
                            return Err(e);
                        }
                        warn!(error = %e, "Candle sync failed");
                    }
                }
                _ = premium_tick.tick() => {
                    if let Err(e) = self.poll_premium().await {
                        if e.is_fatal() {
                            error!(error = %e, "Fatal error on premium path");
                            return Err(e);
                        }
                        warn!(error = %e, "Premium poll failed");
                    }
                }
            }
        }

        let summary = self.summary();
        info!(
            evaluated = summary.signals.evaluated,
            trades = summary.trades,
            pnl_points = summary.total_pnl_points,
            pnl_value = summary.total_pnl_value,
            "Session finished"
        );
        if let Some(open) = &summary.open_position {
            warn!(
                position_id = open.id,
                status = %open.status,
                "Session ended with an active position"
            );
        }
        Ok(summary)
    }
}
