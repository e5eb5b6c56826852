//! Check-config command implementation

use anyhow::{Context, Result};
use intraday_options::filters::{strength_gap, FilterChain};
use intraday_options::regime::Regime;
use intraday_options::Config;
use tracing::info;

pub fn run(config_path: &str) -> Result<()> {
    let config = Config::from_file(config_path)
        .with_context(|| format!("Invalid configuration in {config_path}"))?;
    info!("Loaded configuration from: {}", config_path);

    let regime = &config.regime;
    let chain = FilterChain::for_policy(regime);

    println!("\n{}", "=".repeat(60));
    println!("CONFIGURATION OK");
    println!("{}", "=".repeat(60));
    println!("Instrument:         {}", config.engine.instrument);
    println!(
        "Candles:            {} (short: {})",
        config.engine.candle_interval,
        config.engine.short_interval.as_deref().unwrap_or("none")
    );
    println!(
        "Order Size:         {} x {} = {}",
        config.engine.lot_count,
        config.engine.lot_size,
        config.engine.quantity()
    );
    println!("Regime:             {} ({:?})", regime.name(), regime.kind);
    println!(
        "Session:            {} - {}",
        regime.session.start, regime.session.end
    );
    println!("Filter Chain:       {}", chain.names().join(" -> "));

    let tight = strength_gap::effective_band(regime, true);
    let wide = strength_gap::effective_band(regime, false);
    println!(
        "Strength Gap:       aligned [{:.1}, {:.1}]  otherwise [{:.1}, {:.1}]",
        tight.min, tight.max, wide.min, wide.max
    );

    match regime.compute_stop_loss(100.0) {
        Ok(levels) => println!(
            "Stop @ entry 100:   {:.0} (trigger {:.0}, limit {:.0})",
            levels.stop_loss_price, levels.trigger, levels.limit
        ),
        Err(e) => println!("Stop @ entry 100:   not placeable ({e})"),
    }
    println!("{}", "=".repeat(60));

    Ok(())
}
