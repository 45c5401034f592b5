//! Sentiment Trader
//!
//! Trades one leveraged BTCUSDT futures position from scored social-media
//! posts. Every position is protected by a fixed stop sized to a constant
//! share of margin and a trailing stop whose callback tightens with
//! sentiment intensity.

mod api;
mod bot;
mod db;
mod error;
mod feed;
mod models;
mod notify;
mod trading;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::RetryPolicy;
use crate::bot::{Bot, BotConfig};
use crate::db::Database;
use crate::models::{CloseSummary, Position, Score};
use crate::trading::{CommandReply, OperatorCommand, RiskCalculator, SignalPolicy, TradingConfig};

/// Sentiment-driven futures trader CLI.
#[derive(Parser)]
#[command(name = "sentrader")]
#[command(about = "Trade a single protected futures position from sentiment scores", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./sentrader.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Futures symbol
    #[arg(long, env = "TRADING_SYMBOL", default_value = "BTCUSDT")]
    symbol: String,

    /// Use the in-memory paper exchange instead of Binance
    #[arg(long, global = true)]
    dry_run: bool,

    /// Paper exchange wallet balance (USDT)
    #[arg(long, global = true, default_value = "1000")]
    paper_balance: Decimal,

    /// Paper exchange mark price
    #[arg(long, global = true, default_value = "60000")]
    paper_price: Decimal,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start trading from an NDJSON event stream
    Run {
        /// Event source path, `-` for stdin
        #[arg(short, long, default_value = "-")]
        events: String,

        /// Handling of signals while a position is open
        #[arg(long, value_enum, default_value_t = SignalPolicy::SkipWhileOpen)]
        policy: SignalPolicy,

        /// Seconds between reconciliation passes
        #[arg(long, default_value = "60")]
        reconcile_interval: u64,
    },

    /// Reconcile from the exchange and show the current position
    Status,

    /// Cancel all orders and close the position at market
    CloseNow,

    /// Check exchange and Telegram connectivity
    Check,

    /// Show the risk table and trading configuration
    Config,

    /// Show recent transition records
    History {
        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = BotConfig {
        trading: TradingConfig {
            symbol: cli.symbol.clone(),
            ..Default::default()
        },
        retry: RetryPolicy::default(),
        dry_run: cli.dry_run,
        paper_balance: cli.paper_balance,
        paper_mark_price: cli.paper_price,
        database_url: cli.database.clone(),
        ..Default::default()
    };

    match cli.command {
        Commands::Run {
            events,
            policy,
            reconcile_interval,
        } => {
            config.input = events;
            config.trading.signal_policy = policy;
            config.trading.reconcile_interval_secs = reconcile_interval;

            println!("\n=== Sentiment Trader ===");
            println!("Symbol:     {}", config.trading.symbol);
            println!(
                "Mode:       {}",
                if config.dry_run { "DRY RUN (paper exchange)" } else { "LIVE TRADING" }
            );
            println!("Policy:     {}", config.trading.signal_policy);
            println!("Events:     {}", config.input);
            println!("\nPress Ctrl+C to stop.\n");

            let bot = Bot::new(config).await?;
            bot.run().await?;
        }

        Commands::Status => {
            let bot = Bot::new(config).await?;
            let reply = bot.command(OperatorCommand::Status).await?;
            let mark = bot.gateway().mark_price().await?;
            let balance = bot.gateway().balance().await?;

            println!("\n=== Status ===");
            println!("Mark price: {}", mark);
            println!("Balance:    {} USDT ({} available)", balance.total, balance.available);
            match reply {
                CommandReply::Status(Some(pos)) => print_position(&pos, Some(mark)),
                CommandReply::Status(None) => println!("Position:   none"),
                other => println!("Unexpected reply: {:?}", other),
            }
        }

        Commands::CloseNow => {
            info!("Closing position on operator request");
            let bot = Bot::new(config).await?;
            match bot.command(OperatorCommand::CloseNow).await? {
                CommandReply::Closed(Some(pos)) => {
                    println!("Closed:");
                    print_position(&pos, None);
                }
                CommandReply::Closed(None) => println!("No tracked position; exchange is flat."),
                CommandReply::Failed(e) => {
                    println!("Close FAILED: {}", e);
                    std::process::exit(1);
                }
                other => println!("Unexpected reply: {:?}", other),
            }
        }

        Commands::Check => {
            let bot = Bot::new(config).await?;
            bot.check().await?;
        }

        Commands::Config => {
            let trading = &config.trading;
            let calc = RiskCalculator::new(trading.max_account_loss_pct);

            println!("\n=== Risk Table ===\n");
            println!(
                "{:>7} {:>6} {:>9} {:>12} {:>10}",
                "SCORE", "SIDE", "LEVERAGE", "STOP DIST %", "TRAIL %"
            );
            println!("{}", "-".repeat(48));
            for value in 0..=10 {
                let score = Score::new(value)?;
                match (RiskCalculator::side_for(score), calc.derive(score)) {
                    (Some(side), Some(profile)) => println!(
                        "{:>7} {:>6} {:>8}x {:>12} {:>10}",
                        value,
                        side,
                        profile.leverage,
                        (profile.stop_distance() * Decimal::from(100)).round_dp(4),
                        profile.trailing_callback_pct
                    ),
                    _ => println!("{:>7} {:>6} {:>9} {:>12} {:>10}", value, "-", "-", "-", "-"),
                }
            }

            println!("\n=== Trading Configuration ===\n");
            println!("  Symbol:               {}", trading.symbol);
            println!("  Max Loss at Stop:     {}% of margin", trading.max_account_loss_pct);
            println!("  Signal Policy:        {}", trading.signal_policy);
            println!("  Stop Attempts:        {}", trading.stop_retry.max_attempts);
            println!("  Gateway Attempts:     {}", config.retry.max_attempts);
            println!("  Call Timeout:         {:?}", config.retry.call_timeout);
            println!("  Reconcile Interval:   {}s", trading.reconcile_interval_secs);
            println!("  Dedupe Window:        {} events", trading.dedupe_capacity);
        }

        Commands::History { limit } => {
            let db = Database::new(&cli.database).await?;
            let rows = db.history(limit).await?;
            if rows.is_empty() {
                println!("No transitions recorded yet.");
                return Ok(());
            }

            println!(
                "\n{:<26} {:<20} {:<16} {:<40}",
                "TIME", "EVENT", "ACTION", "POSITION / ERROR"
            );
            println!("{}", "-".repeat(104));
            for row in rows {
                let close = row
                    .close
                    .as_deref()
                    .and_then(|json| serde_json::from_str::<CloseSummary>(json).ok());
                let detail = match (&row.error, &close, &row.position) {
                    (Some(e), _, _) => format!("ERR {}", e),
                    (None, Some(close), _) => close.to_string(),
                    (None, None, Some(json)) => serde_json::from_str::<Position>(json)
                        .map(|p| p.to_string())
                        .unwrap_or_else(|_| json.clone()),
                    (None, None, None) => "-".to_string(),
                };
                println!(
                    "{:<26} {:<20} {:<16} {:<40}",
                    truncate(&row.timestamp, 25),
                    truncate(&row.event_id, 19),
                    row.action,
                    truncate(&detail, 60)
                );
            }
        }
    }

    Ok(())
}

fn print_position(pos: &Position, mark: Option<Decimal>) {
    println!("Position:   {} {} {}x [{}]", pos.side, pos.quantity, pos.leverage, pos.status);
    println!("Entry:      {}", pos.entry_price);
    if let Some(price) = pos.fixed_stop_price {
        println!("Fixed stop: {} (order {})", price, pos.fixed_stop_order_id.as_deref().unwrap_or("-"));
    }
    if let Some(callback) = pos.trailing_callback_pct {
        println!(
            "Trailing:   {}% (order {})",
            callback,
            pos.trailing_stop_order_id.as_deref().unwrap_or("-")
        );
    }
    if let Some(mark) = mark {
        println!(
            "PnL:        {} USDT ({}% ROE)",
            pos.unrealized_pnl(mark).round_dp(2),
            (pos.roe(mark) * Decimal::from(100)).round_dp(2)
        );
    }
    if let Some(source) = &pos.source_event_id {
        println!("Source:     {}", source);
    }
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
