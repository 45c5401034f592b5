//! Bot runner: wires the exchange, persistence, notifications and input
//! stream around the trading engine.
//!
//! Handles:
//! - Choosing the live Binance gateway or the paper exchange
//! - Seeding replay protection from the transition history
//! - A reconciliation pass before the first event is accepted
//! - Periodic reconciliation ticks on the engine's input channel
//! - Graceful shutdown on Ctrl+C

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::{
    BinanceClient, BinanceConfig, DynGateway, PaperExchange, RetryPolicy, RetryingGateway,
};
use crate::db::{spawn_record_writer, Database};
use crate::feed;
use crate::notify::{
    spawn_dispatcher, LogNotifier, NotificationKind, Notifier, TelegramConfig, TelegramNotifier,
};
use crate::trading::{
    CommandReply, EngineInput, OperatorCommand, PositionState, Sinks, TradingConfig,
    TradingEngine,
};

/// Capacity of the engine input channel.
const INPUT_BUFFER: usize = 256;

/// Bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub trading: TradingConfig,

    /// Retry policy for every exchange call
    pub retry: RetryPolicy,

    /// Trade against the in-memory paper exchange
    pub dry_run: bool,

    /// Paper exchange wallet balance in USDT
    pub paper_balance: Decimal,

    /// Paper exchange mark price
    pub paper_mark_price: Decimal,

    pub database_url: String,

    /// NDJSON input path, `-` for stdin
    pub input: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            trading: TradingConfig::default(),
            retry: RetryPolicy::default(),
            dry_run: true,
            paper_balance: dec!(1000),
            paper_mark_price: dec!(60000),
            database_url: "sqlite:sentrader.db?mode=rwc".to_string(),
            input: "-".to_string(),
        }
    }
}

/// Main bot runner.
pub struct Bot {
    config: BotConfig,
    db: Database,
    gateway: DynGateway,
    notifier: Arc<dyn Notifier>,
}

/// Background tasks draining the engine's outputs.
struct Outputs {
    sinks: Sinks,
    dispatcher: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Outputs {
    /// Drop our sender halves and wait for both queues to drain.
    async fn finish(self) {
        drop(self.sinks);
        if let Err(e) = self.dispatcher.await {
            warn!(error = %e, "Notification dispatcher ended abnormally");
        }
        if let Err(e) = self.writer.await {
            warn!(error = %e, "Record writer ended abnormally");
        }
    }
}

impl Bot {
    /// Create a new bot instance.
    pub async fn new(config: BotConfig) -> Result<Self> {
        let db = Database::new(&config.database_url).await?;
        let gateway = build_gateway(&config)?;
        let notifier = build_notifier();

        Ok(Self {
            config,
            db,
            gateway,
            notifier,
        })
    }

    pub fn gateway(&self) -> &DynGateway {
        &self.gateway
    }

    fn spawn_outputs(&self) -> Outputs {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (record_tx, record_rx) = mpsc::unbounded_channel();
        Outputs {
            sinks: Sinks::new(notify_tx, record_tx),
            dispatcher: spawn_dispatcher(self.notifier.clone(), notify_rx),
            writer: spawn_record_writer(self.db.clone(), record_rx),
        }
    }

    /// Build the engine, seed it and run the startup reconciliation.
    async fn prepare_engine(&self, sinks: Sinks) -> Result<TradingEngine> {
        let state = Arc::new(PositionState::new());
        let mut engine = TradingEngine::new(
            self.gateway.clone(),
            state,
            self.config.trading.clone(),
            sinks,
        );

        let limit = self.config.trading.dedupe_capacity as i64;
        let seen = self
            .db
            .recent_event_ids(limit)
            .await
            .context("Failed to load processed event ids")?;
        engine.seed_processed(seen);

        // no event is accepted until local state matches the exchange
        match engine.reconciler().run_pass().await {
            Ok(outcome) => info!(?outcome, "Startup reconciliation complete"),
            Err(e) => warn!(error = %e, "Startup reconciliation failed, periodic passes will retry"),
        }
        Ok(engine)
    }

    /// Run until Ctrl+C.
    pub async fn run(self) -> Result<()> {
        info!(
            symbol = %self.config.trading.symbol,
            dry_run = self.config.dry_run,
            policy = %self.config.trading.signal_policy,
            input = %self.config.input,
            "Starting sentiment trader"
        );

        let outputs = self.spawn_outputs();
        let engine = self.prepare_engine(outputs.sinks.clone()).await?;
        outputs.sinks.notify(
            NotificationKind::Info,
            format!(
                "Sentiment trader started on {} ({})",
                self.config.trading.symbol,
                if self.config.dry_run { "paper" } else { "live" }
            ),
        );

        let (tx, rx) = mpsc::channel(INPUT_BUFFER);
        let source = feed::open_source(&self.config.input).await?;
        let reader = feed::spawn_reader(source, tx.clone());
        let reader_abort = reader.abort_handle();
        let ticker = spawn_reconcile_ticker(self.config.trading.reconcile_interval(), tx);
        let engine_task = tokio::spawn(engine.run(rx));

        let reader_watch = tokio::spawn(async move {
            match reader.await {
                Ok(Ok(())) => debug!("Input reader finished"),
                Ok(Err(e)) => error!(error = %format!("{:#}", e), "Input reader failed"),
                Err(e) => error!(error = %e, "Input reader panicked"),
            }
        });

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Shutdown requested, stopping inputs");

        // dropping the producers closes the channel; the engine finishes
        // whatever it is doing and exits
        ticker.abort();
        reader_abort.abort();
        reader_watch.abort();
        if let Err(e) = engine_task.await {
            error!(error = %e, "Trading engine task failed");
        }

        outputs.sinks.notify(NotificationKind::Info, "Sentiment trader stopped");
        outputs.finish().await;
        info!("Bot shutdown complete");
        Ok(())
    }

    /// Run one operator command outside the event loop.
    pub async fn command(&self, command: OperatorCommand) -> Result<CommandReply> {
        let outputs = self.spawn_outputs();
        let mut engine = self.prepare_engine(outputs.sinks.clone()).await?;
        let reply = engine.handle_command(command).await;
        drop(engine);
        outputs.finish().await;
        Ok(reply)
    }

    /// Check exchange and notifier connectivity.
    pub async fn check(&self) -> Result<()> {
        let mark = self
            .gateway
            .mark_price()
            .await
            .context("Mark price request failed")?;
        let balance = self.gateway.balance().await.context("Balance request failed")?;
        println!("Exchange OK: mark {} | available {} USDT", mark, balance.available);

        match TelegramConfig::from_env() {
            Some(config) => {
                TelegramNotifier::new(config)?.test_connection().await?;
                println!("Telegram OK");
            }
            None => println!("Telegram not configured, notifications go to the log"),
        }
        Ok(())
    }
}

fn build_gateway(config: &BotConfig) -> Result<DynGateway> {
    let inner: DynGateway = if config.dry_run {
        info!(
            balance = %config.paper_balance,
            mark = %config.paper_mark_price,
            "DRY RUN: using paper exchange"
        );
        Arc::new(PaperExchange::new(
            config.paper_balance,
            config.paper_mark_price,
        ))
    } else {
        let mut binance = BinanceConfig::from_env()?;
        binance.symbol = config.trading.symbol.clone();
        let client = BinanceClient::new(binance)?;
        info!(symbol = %client.symbol(), "Binance futures client initialized");
        Arc::new(client)
    };
    Ok(Arc::new(RetryingGateway::new(inner, config.retry.clone())))
}

fn build_notifier() -> Arc<dyn Notifier> {
    match TelegramConfig::from_env().map(TelegramNotifier::new) {
        Some(Ok(notifier)) => {
            info!("Telegram notifications enabled");
            Arc::new(notifier)
        }
        Some(Err(e)) => {
            warn!(error = %e, "Telegram notifier unavailable, logging notifications");
            Arc::new(LogNotifier)
        }
        None => Arc::new(LogNotifier),
    }
}

/// Push a reconcile tick every `period`. The first tick is skipped since
/// startup already ran a pass.
fn spawn_reconcile_ticker(period: Duration, tx: mpsc::Sender<EngineInput>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if tx.send(EngineInput::ReconcileTick).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticker_sends_after_first_period() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = spawn_reconcile_ticker(Duration::from_secs(60), tx);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(matches!(rx.recv().await, Some(EngineInput::ReconcileTick)));

        handle.abort();
    }

    #[tokio::test]
    async fn test_dry_run_command_round_trip() {
        let path = std::env::temp_dir().join(format!("sentrader-{}.db", uuid::Uuid::new_v4()));
        let config = BotConfig {
            database_url: format!("sqlite:{}?mode=rwc", path.display()),
            ..Default::default()
        };
        let bot = Bot::new(config).await.unwrap();

        let reply = bot.command(OperatorCommand::Status).await.unwrap();
        assert_eq!(reply, CommandReply::Status(None));

        let reply = bot.command(OperatorCommand::CloseNow).await.unwrap();
        assert_eq!(reply, CommandReply::Closed(None));

        let _ = std::fs::remove_file(path);
    }
}
