//! Replay command implementation
//!
//! Drives the engine candle by candle over CSV data. Fills come from the
//! paper gateway; the option premium is synthesized from the underlying move
//! since entry, scaled by a fixed delta.

use anyhow::{Context, Result};
use intraday_options::audit::{AuditSink, FanoutAuditSink, JsonlAuditSink, TracingAuditSink};
use intraday_options::data::CsvMarketData;
use intraday_options::engine::TradingEngine;
use intraday_options::oms::{PaperGateway, PaperGatewayConfig, Position, PositionState};
use intraday_options::{Config, OptionType};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Lowest premium the synthetic model quotes
const PREMIUM_FLOOR: f64 = 0.05;

pub struct ReplayArgs {
    pub config: String,
    pub data: PathBuf,
    pub short_data: Option<PathBuf>,
    pub audit: Option<PathBuf>,
    pub base_premium: f64,
    pub premium_delta: f64,
    pub fail_stop_loss: bool,
}

/// Premium as a linear function of the underlying move since entry
struct SyntheticPremium {
    base: f64,
    delta: f64,
    anchor: f64,
}

impl SyntheticPremium {
    fn quote(&mut self, position: Option<&Position>, spot: f64) -> f64 {
        match position {
            None => {
                // Flat: the next entry fills at base, anchored to this spot
                self.anchor = spot;
                self.base
            }
            Some(position) => {
                let sign = match position.contract.option_type {
                    OptionType::CE => 1.0,
                    OptionType::PE => -1.0,
                };
                (self.base + self.delta * (spot - self.anchor) * sign).max(PREMIUM_FLOOR)
            }
        }
    }
}

pub fn run(args: ReplayArgs) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(args))
}

async fn run_async(args: ReplayArgs) -> Result<()> {
    info!("Starting replay");

    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;
    info!("Loaded configuration from: {}", args.config);
    info!(
        regime = %config.regime.name,
        instrument = %config.engine.instrument,
        interval = %config.engine.candle_interval,
        "Regime loaded"
    );

    let mut market = CsvMarketData::new().load(&config.engine.candle_interval, &args.data)?;
    match (&args.short_data, &config.engine.short_interval) {
        (Some(path), Some(interval)) => market = market.load(interval, path)?,
        (Some(_), None) => {
            anyhow::bail!("--short-data given but engine.short_interval is not configured")
        }
        (None, Some(interval)) => warn!(
            interval = %interval,
            "No short-interval data; multi-timeframe filters will fail closed"
        ),
        (None, None) => {}
    }

    let primary = market.candles(&config.engine.candle_interval).to_vec();
    let short = config
        .engine
        .short_interval
        .as_deref()
        .map(|interval| market.candles(interval).to_vec())
        .unwrap_or_default();
    info!(
        primary = primary.len(),
        short = short.len(),
        "Candles ready for replay"
    );

    let mut sinks: Vec<Arc<dyn AuditSink>> = vec![Arc::new(TracingAuditSink)];
    if let Some(path) = &args.audit {
        let sink = JsonlAuditSink::create(path)
            .with_context(|| format!("Failed to open audit file {}", path.display()))?;
        info!("Audit trail: {}", path.display());
        sinks.push(Arc::new(sink));
    }
    let audit: Arc<dyn AuditSink> = Arc::new(FanoutAuditSink::new(sinks));

    let gateway = Arc::new(PaperGateway::new(
        PaperGatewayConfig {
            fail_stop_loss: args.fail_stop_loss,
            ..Default::default()
        },
        args.base_premium,
    ));
    let engine = TradingEngine::new(
        &config,
        gateway.clone(),
        gateway.clone(),
        Arc::new(market),
        audit,
    )?;

    let mut premium = SyntheticPremium {
        base: args.base_premium,
        delta: args.premium_delta,
        anchor: 0.0,
    };
    let mut short = short.into_iter().peekable();

    for candle in primary {
        // The premium poll sees this candle's move before any new entry
        let quote = premium.quote(engine.manager().position().as_ref(), candle.close);
        gateway.set_premium(quote);
        engine.poll_premium().await?;

        let close_time = engine.primary_close_time(&candle);
        engine.feed_short_until(&mut short, close_time);
        if engine.manager().state() == PositionState::Flat {
            // A stop may have closed the position on this very poll
            gateway.set_premium(premium.quote(None, candle.close));
        }
        engine.process_candle(candle).await?;
    }

    // Flatten whatever is left at the end of the data
    match engine.manager().state() {
        PositionState::Open => {
            info!("End of data, exiting open position");
            engine.manager().request_exit().await?;
        }
        PositionState::Exiting => {
            engine.poll_premium().await?;
        }
        _ => {}
    }

    let summary = engine.summary();
    println!("\n{summary}");

    for position in engine.manager().closed_positions() {
        println!(
            "#{:<3} {:<9} entry {:>8.2} exit {:>8.2} pnl {:>8.2} pts ₹{:>10.2} ({})",
            position.id,
            position.contract.to_string(),
            position.entry_premium,
            position.exit_premium.unwrap_or(position.current_premium),
            position.pnl_points,
            position.pnl_value,
            position
                .exit_reason
                .map(|r| r.to_string())
                .unwrap_or_default(),
        );
    }

    info!("Replay completed");
    Ok(())
}
