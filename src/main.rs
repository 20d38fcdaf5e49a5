//! Pyramiding Position Tracker
//!
//! Keeps a per-user, per-symbol ledger of pyramided stock positions, derives
//! the next buy, stop-loss and profit prices, and scans live prices for
//! positions that crossed one of them.

mod api;
mod clock;
mod db;
mod error;
mod models;
mod monitor;
mod notify;
mod portfolio;
mod trading;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{AlphaVantageClient, CacheConfig, PriceCache, PriceFeed};
use crate::clock::{Clock, SystemClock};
use crate::db::Database;
use crate::models::TradeAction;
use crate::monitor::{MonitorConfig, PriceMonitor};
use crate::notify::LogNotifier;
use crate::portfolio::{PortfolioService, TransactionOutcome};
use crate::trading::{PyramidConfig, TargetCalculator};

/// Pyramiding position tracker CLI.
#[derive(Parser)]
#[command(name = "pyramid")]
#[command(about = "Track pyramided stock positions and their price targets", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(
        short,
        long,
        env = "PYRAMID_DATABASE",
        default_value = "sqlite:./pyramid.db?mode=rwc"
    )]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// JSON file with a custom pyramid ladder
    #[arg(long, env = "PYRAMID_CONFIG")]
    pyramid_config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a buy
    Buy {
        user: String,
        symbol: String,
        price: Decimal,
        shares: Decimal,

        /// Trade time (RFC 3339 or YYYY-MM-DD), defaults to now
        #[arg(long)]
        at: Option<String>,
    },

    /// Record a sell
    Sell {
        user: String,
        symbol: String,
        price: Decimal,
        shares: Decimal,

        /// Trade time (RFC 3339 or YYYY-MM-DD), defaults to now
        #[arg(long)]
        at: Option<String>,
    },

    /// Show one position in detail
    Show { user: String, symbol: String },

    /// List a user's open positions
    List { user: String },

    /// Check every open position against the current price
    Scan {
        /// Alpha Vantage API key
        #[arg(long, env = "ALPHA_VANTAGE_API_KEY")]
        api_key: String,

        /// Delay between positions in milliseconds
        #[arg(long, default_value = "1000")]
        delay_ms: u64,

        /// Price lookup timeout in seconds
        #[arg(long, default_value = "30")]
        timeout_secs: u64,

        /// Repeat the scan every N seconds until Ctrl+C
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Look up the current price of a symbol
    Quote {
        symbol: String,

        /// Alpha Vantage API key
        #[arg(long, env = "ALPHA_VANTAGE_API_KEY")]
        api_key: String,
    },

    /// Show the pyramid configuration
    Config {
        /// Base price for the example ladder
        #[arg(long, default_value = "100")]
        base_price: Decimal,

        /// Base shares for the example ladder
        #[arg(long, default_value = "10")]
        base_shares: Decimal,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &cli.pyramid_config {
        Some(path) => PyramidConfig::load(path)?,
        None => PyramidConfig::default(),
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Commands that need no database
    match &cli.command {
        Commands::Config {
            base_price,
            base_shares,
        } => {
            print_config(&config, *base_price, *base_shares);
            return Ok(());
        }

        Commands::Quote { symbol, api_key } => {
            let client = AlphaVantageClient::new(api_key.clone())?;
            let cache = PriceCache::new(client, clock.clone(), CacheConfig::default());
            let quote = cache
                .get_price(&symbol.to_uppercase())
                .await
                .with_context(|| format!("Failed to get a price for {}", symbol))?;

            println!("\n{} @ {}", quote.symbol, quote.price);
            println!("Change:   {} ({}%)", quote.change, quote.change_pct.round_dp(2));
            println!("As of:    {}", quote.as_of.format("%Y-%m-%d"));
            return Ok(());
        }

        _ => {}
    }

    // Initialize database
    let db = Arc::new(
        Database::new(&cli.database, config.model.clone())
            .await
            .context("Failed to open position database")?,
    );
    let service = PortfolioService::new(db.clone(), config.clone(), clock.clone());

    match cli.command {
        Commands::Buy {
            user,
            symbol,
            price,
            shares,
            at,
        } => {
            let outcome = service
                .apply_transaction(&user, &symbol, TradeAction::Buy.as_str(), price, shares, at.as_deref())
                .await?;
            print_outcome(&config, &outcome);
        }

        Commands::Sell {
            user,
            symbol,
            price,
            shares,
            at,
        } => {
            let outcome = service
                .apply_transaction(&user, &symbol, TradeAction::Sell.as_str(), price, shares, at.as_deref())
                .await?;
            print_outcome(&config, &outcome);
        }

        Commands::Show { user, symbol } => {
            let ledger = service.get_position(&user, &symbol).await?;

            println!("\n=== {} / {} ===", ledger.user, ledger.symbol);
            println!("Total Shares:   {}", ledger.total_shares);
            println!("Updated:        {}", ledger.updated_at.format("%Y-%m-%d %H:%M:%S"));

            if !ledger.phase_targets.is_empty() {
                println!("\n--- Pyramid ---");
                println!("{:<14} {:>12} {:>12} {:>12}", "PHASE", "PRICE", "SHARES", "STOP");
                for (i, t) in ledger.phase_targets.iter().enumerate() {
                    println!(
                        "{:<14} {:>12} {:>12} {:>12}",
                        config.model.name_of(i).unwrap_or("?"),
                        t.price.round_dp(2),
                        t.shares.round_dp(2),
                        t.stop_loss_price.round_dp(2)
                    );
                }
            }

            print_outcome(
                &config,
                &TransactionOutcome {
                    holdings: ledger.holdings.clone(),
                    next_target: ledger.targets,
                    transactions: ledger.recent_transactions(),
                },
            );
        }

        Commands::List { user } => {
            let positions = service.user_positions(&user).await?;

            if positions.is_empty() {
                println!("No open positions for {}. Use 'pyramid buy' to open one.", user);
                return Ok(());
            }

            println!(
                "\n{:<10} {:>10} {:<14} {:>12} {:>12} {:>12}",
                "SYMBOL", "SHARES", "PHASE", "NEXT BUY", "STOP", "PROFIT"
            );
            println!("{}", "-".repeat(76));

            for p in positions {
                println!(
                    "{:<10} {:>10} {:<14} {:>12} {:>12} {:>12}",
                    truncate(&p.symbol, 10),
                    p.total_shares,
                    p.phase,
                    p.next_price_target.round_dp(2),
                    p.stop_loss_price.round_dp(2),
                    p.profit_price.round_dp(2)
                );
            }
        }

        Commands::Scan {
            api_key,
            delay_ms,
            timeout_secs,
            interval,
        } => {
            let client = AlphaVantageClient::new(api_key)?;
            let cache = Arc::new(PriceCache::new(client, clock, CacheConfig::default()));

            let cancel = CancellationToken::new();
            let refresh = cache.spawn_refresh(cancel.child_token());

            // Register shutdown handler
            let shutdown = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutdown signal received");
                shutdown.cancel();
            });

            let monitor = PriceMonitor::new(
                db,
                cache,
                Arc::new(LogNotifier),
                TargetCalculator::new(config),
                MonitorConfig {
                    pacing: Duration::from_millis(delay_ms),
                    price_timeout: Duration::from_secs(timeout_secs),
                },
            );

            let result = loop {
                let report = match monitor.scan(&cancel).await {
                    Ok(report) => report,
                    Err(e) => break Err(e),
                };
                println!("\n=== Scan Report ===");
                println!("{}", report);

                let Some(secs) = interval else {
                    break Ok(());
                };
                if report.cancelled {
                    break Ok(());
                }

                tokio::select! {
                    _ = cancel.cancelled() => break Ok(()),
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                }
            };

            refresh.shutdown().await;
            if let Err(e) = &result {
                warn!(error = %e, "Scan aborted");
            }
            result?;
        }

        Commands::Config { .. } | Commands::Quote { .. } => {}
    }

    Ok(())
}

fn print_outcome(config: &PyramidConfig, outcome: &TransactionOutcome) {
    println!("\n--- Holdings ---");
    if outcome.holdings.is_empty() {
        println!("  (flat)");
    }
    for h in &outcome.holdings {
        println!(
            "  {:<14} {:>10} @ {}",
            config.model.name_of(h.phase).unwrap_or("?"),
            h.shares,
            h.price
        );
    }

    let t = &outcome.next_target;
    println!("\n--- Targets ---");
    match t.current_phase.and_then(|i| config.model.name_of(i)) {
        Some(phase) => {
            println!("Current Phase:  {}", phase);
            if t.next_buy_price > Decimal::ZERO {
                println!(
                    "Next Buy:       {} shares @ {}",
                    t.next_buy_shares.round_dp(2),
                    t.next_buy_price.round_dp(2)
                );
            } else {
                println!("Next Buy:       (top of pyramid)");
            }
            println!("Stop Loss:      {}", t.stop_loss_price.round_dp(2));
            println!("Take Profit:    {}", t.profit_price.round_dp(2));
        }
        None => println!("  (none)"),
    }

    println!("\n--- Transactions ({}) ---", outcome.transactions.len());
    for tx in &outcome.transactions {
        println!(
            "  {} {:<4} {:>10} @ {}",
            tx.timestamp.format("%Y-%m-%d %H:%M"),
            tx.action.as_str(),
            tx.shares,
            tx.price
        );
    }
}

fn print_config(config: &PyramidConfig, base_price: Decimal, base_shares: Decimal) {
    println!("\n=== Pyramid Configuration ===\n");
    println!("Buy Tolerance:        {}", config.buy_tolerance);
    println!("Max Profit Level:     {}", config.max_profit_level);

    println!(
        "\n{:<14} {:>12} {:>12} {:>10}",
        "PHASE", "SHARES x", "PRICE x", "CUT LOSS"
    );
    println!("{}", "-".repeat(52));
    for phase in config.model.phases() {
        println!(
            "{:<14} {:>12} {:>12} {:>10}",
            phase.name,
            phase.shares_incremental_ratio.round_dp(4),
            phase.price_incremental_ratio.round_dp(4),
            phase.cut_loss_ratio
        );
    }

    println!("\nExample ladder from {} shares @ {}:", base_shares, base_price);
    let Some(ladder) = config.model.phase_targets(base_price, base_shares) else {
        println!("  (out of range)");
        return;
    };
    for (i, t) in ladder.iter().enumerate() {
        println!(
            "  {:<14} {:>10} @ {:<10} stop {}",
            config.model.name_of(i).unwrap_or("?"),
            t.shares.round_dp(2),
            t.price.round_dp(2),
            t.stop_loss_price.round_dp(2)
        );
    }
    if let Some(profit) = base_price.checked_mul(config.max_profit_level) {
        println!("  Take profit at {}", profit.round_dp(2));
    }
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
