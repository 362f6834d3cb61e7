//! Mean-reversion trading bot for MetaTrader 5.
//!
//! Opens positions on Bollinger-band crossings, ratchets their stops up a
//! profit ladder and records every trade and stop change in a SQLite ledger.

mod api;
mod bot;
mod db;
mod models;
mod trading;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{Broker, Mt5Client};
use crate::bot::Bot;
use crate::db::{Database, TradeLedger};
use crate::models::{SymbolInfo, Tick, TradeSide};
use crate::trading::{
    liquidation_price, lots_to_usd, plan_entry, pnl_at_price, price_at_pnl, PlanOutcome,
    StrategyConfig,
};

/// Mean-reversion trading bot CLI.
#[derive(Parser)]
#[command(name = "mrbot")]
#[command(about = "Trade Bollinger-band reversals on MT5 with a trailing-stop ladder", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite:./mrbot.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// MT5 bridge base URL
    #[arg(long, env = "MT5_API_URL", default_value = "http://localhost:5000")]
    mt5_url: String,

    /// MT5 bridge API key
    #[arg(long, env = "MT5_API_KEY", hide_env_values = true)]
    mt5_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bot
    Run {
        /// Price and log entries without sending orders
        #[arg(long)]
        dry_run: bool,
    },

    /// Run one reconciliation cycle
    Reconcile,

    /// Run one trailing-stop cycle
    Trail,

    /// Run one entry scan
    Enter {
        #[arg(long)]
        dry_run: bool,
    },

    /// List ledger trades
    Trades {
        /// Only trades that are still open
        #[arg(long)]
        open: bool,
    },

    /// Show a trade with its stop history and broker records
    Show {
        /// Broker position ticket
        ticket: u64,
    },

    /// Price a hypothetical entry
    Calc {
        symbol: String,

        /// BUY or SELL
        side: TradeSide,

        /// Entry price
        price: Decimal,

        /// Capital per trade (defaults to the configured value)
        #[arg(short, long)]
        capital: Option<Decimal>,

        /// Leverage (defaults to the configured value)
        #[arg(long)]
        leverage: Option<Decimal>,

        #[arg(long, default_value = "100000")]
        contract_size: Decimal,

        #[arg(long, default_value = "0.01")]
        volume_step: Decimal,

        #[arg(long, default_value = "0.01")]
        volume_min: Decimal,

        /// Quoted price precision
        #[arg(long, default_value = "5")]
        digits: u32,
    },

    /// Show current configuration
    Config,
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

    let config = StrategyConfig::from_env().context("Invalid strategy configuration")?;

    match cli.command {
        Commands::Run { dry_run } => {
            let mut bot = connect(&cli.database, &cli.mt5_url, cli.mt5_key.as_deref(), &config, dry_run).await?;

            println!("\n=== Mean-Reversion Bot ===");
            println!("Bridge:    {}", cli.mt5_url);
            println!("Pairs:     {}", config.pairs.join(", "));
            println!("Timeframe: {}", config.timeframe);
            println!("Mode:      {}", if dry_run { "DRY RUN (no real orders)" } else { "LIVE TRADING" });
            println!("\nPress Ctrl+C to stop.\n");

            if let Err(e) = bot.run().await {
                tracing::error!(error = %e, "Bot error");
            }

            println!("\n{}", bot.stats());
        }

        Commands::Reconcile => {
            let mut bot = connect(&cli.database, &cli.mt5_url, cli.mt5_key.as_deref(), &config, true).await?;
            let seeded = bot.recover().await?;
            match bot.reconcile_once().await {
                Some(r) => {
                    println!("Loaded {} open trades, {} positions open at the broker", seeded, r.open);
                    println!("  Closed:         {}", r.closed);
                    println!("  Already closed: {}", r.already_closed);
                    println!("  Orphaned:       {}", r.orphaned);
                    println!("  Retained:       {}", r.retained);
                }
                None => anyhow::bail!("Reconciliation cycle did not complete"),
            }
        }

        Commands::Trail => {
            let mut bot = connect(&cli.database, &cli.mt5_url, cli.mt5_key.as_deref(), &config, true).await?;
            match bot.trail_once().await {
                Some(r) => {
                    println!("Evaluated {} positions", r.evaluated);
                    println!("  Ratcheted: {}", r.ratcheted);
                    println!("  Skipped:   {}", r.skipped);
                    println!("  Failed:    {}", r.failed);
                }
                None => anyhow::bail!("Trailing cycle did not complete"),
            }
        }

        Commands::Enter { dry_run } => {
            let mut bot = connect(&cli.database, &cli.mt5_url, cli.mt5_key.as_deref(), &config, dry_run).await?;
            match bot.enter_once().await {
                Some(r) => {
                    println!("Scanned {} symbols{}", r.scanned, if dry_run { " (dry run)" } else { "" });
                    println!("  Signals:   {}", r.signals);
                    println!("  Submitted: {}", r.submitted);
                    println!("  Opened:    {}", r.opened);
                    println!("  Skipped:   {}", r.skipped);
                    println!("  Failed:    {}", r.failed);
                }
                None => anyhow::bail!("Entry cycle did not complete"),
            }
        }

        Commands::Trades { open } => {
            let db = Database::new(&cli.database).await?;
            let trades = db.list_trades(open).await?;

            if trades.is_empty() {
                println!("No trades recorded.");
                return Ok(());
            }

            println!(
                "\n{:<12} {:<8} {:<5} {:<20} {:>12} {:>12} {:>10} {:<6}",
                "TICKET", "SYMBOL", "SIDE", "OPENED", "ENTRY", "CLOSE", "NET P&L", "REASON"
            );
            println!("{}", "-".repeat(92));

            for t in trades {
                let (close_price, pnl_net, reason) = match &t.close {
                    Some(c) => (c.close_price.to_string(), format!("{:.2}", c.pnl_net), c.reason.as_str()),
                    None => ("-".to_string(), "-".to_string(), "OPEN"),
                };
                println!(
                    "{:<12} {:<8} {:<5} {:<20} {:>12} {:>12} {:>10} {:<6}",
                    t.ticket,
                    t.symbol,
                    t.side.as_str(),
                    t.entry_time.format("%Y-%m-%d %H:%M:%S").to_string(),
                    t.entry_price,
                    close_price,
                    pnl_net,
                    reason
                );
            }
        }

        Commands::Show { ticket } => {
            let db = Database::new(&cli.database).await?;
            let record = db
                .get_trade_with_mutations(ticket)
                .await?
                .ok_or_else(|| anyhow::anyhow!("No trade with ticket {}", ticket))?;
            let t = &record.trade;

            println!("\n=== Trade {} ===", t.ticket);
            println!("Symbol:        {} ({}, {})", t.symbol, t.market_type, t.timeframe);
            println!("Side:          {}", t.side);
            println!("Opened:        {}", t.entry_time);
            println!("Entry Price:   {}", t.entry_price);
            println!("Position Size: {}", t.position_size);
            println!("Capital:       {} x{}", t.capital, t.leverage);
            println!("Commission:    {}", t.commission);
            println!("Break-even:    {}", t.break_even_price);
            println!("Liquidation:   {}", t.liquidation_price);
            println!("Strategy:      {} @ {}", t.strategy, t.broker);

            match &t.close {
                Some(c) => {
                    println!("\n--- Close ---");
                    println!("Closed:        {}", c.close_time);
                    println!("Close Price:   {}", c.close_price);
                    println!("P&L:           {:.2} (net {:.2})", c.pnl, c.pnl_net);
                    println!("Reason:        {}", c.reason);
                }
                None => println!("\nStatus:        OPEN"),
            }

            println!("\n--- Stop History ({}) ---", record.mutations.len());
            for m in &record.mutations {
                println!(
                    "  {}  at {}  SL {} ({:.2})  TP {}",
                    m.mutation_time.format("%Y-%m-%d %H:%M:%S"),
                    m.mutation_price,
                    m.new_sl_price,
                    m.pnl_at_new_sl,
                    m.new_tp_price.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
                );
            }

            let broker = Mt5Client::new(&cli.mt5_url, cli.mt5_key.as_deref())?;
            match broker.order_history(ticket).await {
                Ok(Some(order)) => {
                    println!("\n--- Broker Order ---");
                    println!(
                        "  {} {} {} @ {}  SL {}  TP {}  ({})",
                        order.time_setup.format("%Y-%m-%d %H:%M:%S"),
                        order.side.map(|s| s.as_str()).unwrap_or("?"),
                        order.volume_initial,
                        order.price_open,
                        order.stop_loss.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                        order.take_profit.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                        order.comment
                    );
                }
                Ok(None) => println!("\nNo broker order found."),
                Err(e) => warn!(ticket, error = %e, "Order history unavailable"),
            }

            let to = t.close.as_ref().map(|c| c.close_time).unwrap_or_else(Utc::now);
            match broker
                .deal_history(t.entry_time - Duration::minutes(1), to + Duration::minutes(1), ticket)
                .await
            {
                Ok(deals) => {
                    println!("\n--- Broker Deals ({}) ---", deals.len());
                    for d in &deals {
                        println!(
                            "  {}  {:?}  {:?}  {} @ {}  profit {}  commission {}  fee {}",
                            d.time.format("%Y-%m-%d %H:%M:%S"),
                            d.entry,
                            d.reason,
                            d.volume,
                            d.price,
                            d.profit,
                            d.commission,
                            d.fee
                        );
                    }
                }
                Err(e) => warn!(ticket, error = %e, "Deal history unavailable"),
            }
        }

        Commands::Calc {
            symbol,
            side,
            price,
            capital,
            leverage,
            contract_size,
            volume_step,
            volume_min,
            digits,
        } => {
            let symbol = symbol.to_uppercase();
            let config = StrategyConfig {
                capital_per_trade: capital.unwrap_or(config.capital_per_trade),
                leverage: leverage.unwrap_or(config.leverage),
                ..config
            };
            let info = SymbolInfo {
                symbol: symbol.clone(),
                contract_size,
                volume_step,
                volume_min,
                digits,
            };
            let tick = Tick {
                time: Utc::now(),
                bid: price,
                ask: price,
            };

            println!("\n=== {} {} @ {} ===", side, symbol, price);
            println!("Capital:       {} x{}", config.capital_per_trade, config.leverage);

            match plan_entry(&config, &symbol, side, &tick, &info)? {
                PlanOutcome::Ready(plan) => {
                    let size = plan.position_size;
                    let lev = config.leverage;
                    let break_even =
                        price_at_pnl(Decimal::ZERO, plan.price, size, lev, side, plan.commission)?;
                    let sl_pnl =
                        pnl_at_price(plan.stop_loss, plan.price, size, lev, side, plan.commission)?;

                    println!("Position Size: {}", size);
                    println!("Commission:    {}", plan.commission);
                    println!(
                        "Lots:          {} (notional {:.2})",
                        plan.lots,
                        lots_to_usd(&info, plan.lots, plan.price)
                    );
                    println!("Break-even:    {}", break_even.with_commission.round_dp(digits));
                    println!(
                        "Liquidation:   {}",
                        liquidation_price(plan.price, lev, side)?.round_dp(digits)
                    );
                    println!(
                        "Stop Loss:     {} ({:.2}, net {:.2})",
                        plan.stop_loss, sl_pnl.gross, sl_pnl.net
                    );
                    if let Some(tp) = plan.take_profit {
                        let tp_pnl = pnl_at_price(tp, plan.price, size, lev, side, plan.commission)?;
                        println!("Take Profit:   {} ({:.2})", tp, tp_pnl.gross);
                    }
                }
                PlanOutcome::BelowMinimum(lots) => {
                    println!("Volume {} is below the minimum of {}", lots, volume_min);
                }
                PlanOutcome::StopCrossesMarket { stop, market } => {
                    println!("Stop {} is already beyond the market at {}", stop, market);
                }
            }
        }

        Commands::Config => {
            println!("\n=== Strategy Configuration ===\n");
            println!("Entry:");
            println!("  Pairs:                {}", config.pairs.join(", "));
            println!("  Timeframe:            {}", config.timeframe);
            println!("  Bars:                 {}", config.bars);
            println!("  Capital per Trade:    {}", config.capital_per_trade);
            println!("  Leverage:             {}", config.leverage);
            println!("  SL Multiplier:        {}", config.sl_multiplier);
            println!(
                "  TP Multiplier:        {}",
                config.tp_multiplier.map(|m| m.to_string()).unwrap_or_else(|| "off".to_string())
            );
            println!("  Deviation:            {} points", config.deviation);
            println!("  Magic:                {}", config.magic);
            println!("  Max Quote Age:        {}s", config.max_tick_age_secs);

            println!("\nSchedule:");
            println!("  Reconcile Every:      {}s", config.reconcile_interval_secs);
            println!("  Trail Every:          {}s", config.trailing_interval_secs);
            println!("  Scan Every:           {}s", config.entry_interval_secs);
            println!("  Cycle Timeout:        {}s", config.cycle_timeout_secs);
            println!("  Settlement Delay:     {}s", config.settlement_delay_secs);

            println!("\nTrailing Ladder (epsilon {}):", config.epsilon);
            println!("  {:>10} {:>10}", "TRIGGER", "NEW SL");
            for step in &config.ladder {
                println!("  {:>10} {:>10}", step.trigger, step.new_sl);
            }
            if !config.ladder_is_descending() {
                println!("  (ladder is not in descending trigger order)");
            }
        }
    }

    Ok(())
}

/// Open the ledger and the bridge client and build a bot over them.
async fn connect(
    database_url: &str,
    mt5_url: &str,
    mt5_key: Option<&str>,
    config: &StrategyConfig,
    dry_run: bool,
) -> Result<Bot> {
    let db = Database::new(database_url).await?;
    let broker = Mt5Client::new(mt5_url, mt5_key)?;
    info!(bridge = %broker.base_url(), "MT5 client initialized");

    let broker: Arc<dyn Broker> = Arc::new(broker);
    let ledger: Arc<dyn TradeLedger> = Arc::new(db);
    Ok(Bot::new(broker, ledger, config.clone(), dry_run))
}
