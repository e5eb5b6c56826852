//! Intraday options engine - main entry point
//!
//! This binary provides two subcommands:
//! - replay: Run the full decision engine over historical candles against
//!   the paper gateway
//! - check-config: Validate a regime configuration and print what it enables

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

const DEFAULT_CONFIG: &str = "configs/buy_regime.json";

#[derive(Parser, Debug)]
#[command(name = "intraday-options")]
#[command(about = "Intraday index options engine with crossover signals, entry filters and stop-loss protection", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay historical candles through the engine with paper fills
    Replay {
        /// Path to configuration file
        #[arg(short, long, env = "INTRADAY_OPTIONS_CONFIG", default_value = DEFAULT_CONFIG)]
        config: String,

        /// Primary-interval candle CSV
        #[arg(short, long)]
        data: PathBuf,

        /// Short-interval candle CSV for multi-timeframe filters
        #[arg(long)]
        short_data: Option<PathBuf>,

        /// Append the decision audit trail to this JSONL file
        #[arg(long)]
        audit: Option<PathBuf>,

        /// Premium at which entries fill
        #[arg(long, default_value = "100")]
        base_premium: f64,

        /// Premium change per point of underlying move
        #[arg(long, default_value = "0.5")]
        premium_delta: f64,

        /// Make every stop-loss placement fail (exercises the fail-safe exit)
        #[arg(long)]
        fail_stop_loss: bool,
    },

    /// Validate a configuration file
    CheckConfig {
        /// Path to configuration file
        #[arg(short, long, env = "INTRADAY_OPTIONS_CONFIG", default_value = DEFAULT_CONFIG)]
        config: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    // Create logs directory
    std::fs::create_dir_all("logs")?;

    // Create log file with naming pattern: {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    // File layer - same format but without ANSI colors
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());

    Ok(())
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Replay { .. } => "replay",
        Commands::CheckConfig { .. } => "check_config",
    };
    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Replay {
            config,
            data,
            short_data,
            audit,
            base_premium,
            premium_delta,
            fail_stop_loss,
        } => commands::replay::run(commands::replay::ReplayArgs {
            config,
            data,
            short_data,
            audit,
            base_premium,
            premium_delta,
            fail_stop_loss,
        }),

        Commands::CheckConfig { config } => commands::check_config::run(&config),
    }
}
