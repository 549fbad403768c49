mod config;
mod database;
mod engine;
mod error;
mod events;
mod exchange;
mod indicators;
mod market_data;
mod notifications;
mod portfolio;
mod reconcile;
mod risk;
mod session;
mod strategies;
mod types;
mod web;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::{Config, TradingMode};
use database::Database;
use engine::{BacktestConfig, BacktestEngine, BacktestGuardrails, LiveRuntime, SignalExecutor};
use events::{EventLog, EventType};
use exchange::{
    classify_protective_orders, DryRunExchange, EventStream, Exchange, HyperliquidClient,
    VenueEvent, HYPERLIQUID_API, HYPERLIQUID_TESTNET_API, HYPERLIQUID_TESTNET_WS, HYPERLIQUID_WS,
};
use market_data::{CandleIngestor, CandleSource, CandleStreamer, PriceCache};
use notifications::NotificationManager;
use portfolio::PositionBook;
use reconcile::Reconciler;
use session::{Session, SessionCounters};
use strategies::create_strategy;
use types::{CandleInterval, Position};
use web::{start_server, AppState};

#[derive(Parser)]
#[command(name = "perp-trading-bot")]
#[command(version = "0.1.0")]
#[command(about = "Automated perpetual-futures trading bot for Hyperliquid", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trading daemon in the configured mode
    Run,
    /// Backtest a strategy on recent venue candles
    Backtest {
        /// Strategy name (breakout, trend)
        #[arg(short, long, default_value = "breakout")]
        strategy: String,
        /// Symbol to test
        #[arg(long, default_value = "ETH")]
        coin: String,
        /// Candle interval
        #[arg(short, long, default_value = "15m")]
        interval: String,
        /// Number of candles to fetch
        #[arg(short, long, default_value = "3000")]
        bars: usize,
        /// Initial capital in USD
        #[arg(long, default_value = "10000")]
        capital: f64,
    },
    /// Validate the configuration file and print a summary
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run => run_daemon(&cli.config).await,
        Commands::Backtest {
            strategy,
            coin,
            interval,
            bars,
            capital,
        } => run_backtest(&cli.config, &strategy, &coin, &interval, bars, capital).await,
        Commands::CheckConfig => {
            let config = Config::load(&cli.config)?;
            println!("config OK: mode={}, {} symbols", config.mode, config.symbols.len());
            for symbol in &config.symbols {
                println!(
                    "  {} ({}x {:?}), {} strategies",
                    symbol.coin,
                    symbol.leverage,
                    symbol.margin_type,
                    symbol.strategies.len()
                );
            }
            Ok(())
        }
    }
}

fn api_urls(mode: TradingMode) -> (&'static str, &'static str) {
    match mode {
        TradingMode::Testnet => (HYPERLIQUID_TESTNET_API, HYPERLIQUID_TESTNET_WS),
        _ => (HYPERLIQUID_API, HYPERLIQUID_WS),
    }
}

async fn run_daemon(config_path: &str) -> Result<()> {
    let config = Config::load(config_path)?;
    info!("starting daemon in {} mode", config.mode);

    let events = Arc::new(EventLog::new(&config.runtime.event_log_path));
    let db = Arc::new(Database::new(&config.runtime.db_path).await?);
    let book = Arc::new(PositionBook::new());
    let prices = Arc::new(PriceCache::default());
    let notifications = Arc::new(NotificationManager::new(events.clone(), true));

    let midnight = Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc();
    let trades_today = db.count_accepted_signals_since(midnight).await? as u32;
    let session = Arc::new(Session::new(SessionCounters::seeded(
        Utc::now(),
        trades_today,
    )));

    let (api_url, ws_url) = api_urls(config.mode);
    let coins: Vec<String> = config.symbols.iter().map(|s| s.coin.clone()).collect();

    // Market data always comes from the public venue API; only order flow
    // switches between the real and simulated venue.
    let market_data: Arc<HyperliquidClient> = Arc::new(HyperliquidClient::new(
        api_url,
        String::new(),
        String::new(),
    ));

    let exchange: Arc<dyn Exchange> = match config.mode {
        TradingMode::DryRun => Arc::new(DryRunExchange::new(10_000.0, &coins)),
        TradingMode::Testnet | TradingMode::Live => {
            let wallet = std::env::var("HL_WALLET")
                .context("HL_WALLET must be set for testnet/live mode")?;
            let secret = std::env::var("HL_API_SECRET")
                .context("HL_API_SECRET must be set for testnet/live mode")?;
            Arc::new(HyperliquidClient::new(api_url, wallet, secret))
        }
    };
    exchange.connect().await.map_err(|e| anyhow!("{}", e))?;

    let executor = Arc::new(SignalExecutor::new(
        exchange.clone(),
        book.clone(),
        db.clone(),
        events.clone(),
        notifications.clone(),
        session.clone(),
        config.guardrails,
        config.sizing,
        config.mode,
        config.symbols.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        exchange.clone(),
        book.clone(),
        db.clone(),
        events.clone(),
        notifications.clone(),
        session.clone(),
    ));

    recover_positions(&*exchange, &book).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (candle_feed, _) = broadcast::channel(256);

    // Venue event stream (order updates and fills) drained through the
    // reconciler; each batch is processed under the symbol lock.
    let wallet = std::env::var("HL_WALLET").unwrap_or_default();
    if config.mode != TradingMode::DryRun {
        let (venue_tx, mut venue_rx) = mpsc::channel::<VenueEvent>(256);
        EventStream::new(ws_url, &wallet).spawn(venue_tx);
        let reconciler = reconciler.clone();
        tokio::spawn(async move {
            while let Some(event) = venue_rx.recv().await {
                match event {
                    VenueEvent::OrderUpdates(updates) => {
                        reconciler.apply_order_updates(&updates).await;
                        if let Err(e) = reconciler.run_once().await {
                            warn!("event-driven reconcile failed: {}", e);
                        }
                    }
                    VenueEvent::Fills(fills) => reconciler.apply_fills(&fills).await,
                    VenueEvent::Disconnected => warn!("venue event stream disconnected"),
                }
            }
        });
    }

    // One candle pipeline per (symbol, strategy binding).
    for symbol in &config.symbols {
        for binding in &symbol.strategies {
            let Some(interval) = binding.interval() else {
                warn!("{}: skipping unknown interval {}", symbol.coin, binding.interval);
                continue;
            };
            let Some(strategy) = create_strategy(&binding.name) else {
                warn!("{}: unknown strategy {}", symbol.coin, binding.name);
                continue;
            };

            let mut runtime = LiveRuntime::new(
                &symbol.coin,
                interval,
                strategy,
                binding.auto_trading_enabled,
                executor.clone(),
                book.clone(),
                exchange.clone(),
                session.clone(),
                prices.clone(),
                candle_feed.clone(),
                config.runtime.candle_buffer_bars,
                config.runtime.on_candle_budget_ms,
            );

            let mut ingestor = CandleIngestor::new(
                &symbol.coin,
                interval,
                market_data.clone() as Arc<dyn CandleSource>,
                config.runtime.candle_buffer_bars.max(binding.warmup_bars) + 8,
            );
            match ingestor.warmup(binding.warmup_bars).await {
                Ok(kept) => info!("{} {}: warmed up with {} candles", symbol.coin, interval, kept),
                Err(e) => warn!("{} {}: warmup failed: {}", symbol.coin, interval, e),
            }
            runtime.seed(ingestor.snapshot());

            let (candle_tx, candle_rx) = mpsc::channel(256);
            CandleStreamer::new(ws_url, &symbol.coin, interval).spawn(candle_tx);
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                runtime.run(candle_rx, shutdown).await;
            });
        }
    }

    reconciler.clone().spawn_ticker(
        config.runtime.reconcile_interval_secs,
        shutdown_rx.clone(),
    );
    spawn_equity_snapshots(
        exchange.clone(),
        book.clone(),
        db.clone(),
        session.clone(),
        config.runtime.equity_snapshot_secs,
        shutdown_rx.clone(),
    );

    let app_state = AppState::new(
        book.clone(),
        db.clone(),
        prices.clone(),
        executor.clone(),
        candle_feed.clone(),
        &config,
    );
    let port = config.runtime.http_port;
    tokio::spawn(async move {
        if let Err(e) = start_server(app_state, port).await {
            error!("http server failed: {}", e);
        }
    });

    events
        .emit(
            EventType::DaemonStarted,
            json!({
                "mode": config.mode.as_str(),
                "symbols": coins,
            }),
        )
        .await;
    info!("daemon running; ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown_tx.send(true).ok();
    // let tasks reach their next suspension point; open positions stay with
    // the exchange
    tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
    Ok(())
}

/// Rebuilds the local book from venue state on startup, classifying resting
/// reduce-only orders into stop/trailing/take-profit protection.
async fn recover_positions(exchange: &dyn Exchange, book: &PositionBook) {
    let positions = match exchange.get_positions().await {
        Ok(positions) => positions,
        Err(e) => {
            warn!("position recovery skipped: {}", e);
            return;
        }
    };
    if positions.is_empty() {
        return;
    }
    let open_orders = exchange.get_open_orders().await.unwrap_or_default();

    for venue_position in positions {
        let orders: Vec<_> = open_orders
            .iter()
            .filter(|o| o.coin == venue_position.coin)
            .cloned()
            .collect();
        let protection = classify_protective_orders(
            &orders,
            venue_position.size,
            Some(venue_position.direction),
        );

        let mut position = Position::new(
            &venue_position.coin,
            venue_position.direction,
            venue_position.entry_price,
            venue_position.size,
            protection.stop_loss.unwrap_or(0.0),
            protection.take_profits,
        );
        position.trailing_stop_loss = protection.trailing_stop;
        position.liquidation_price = venue_position.liquidation_price;
        position.venue_incomplete = protection.stop_loss.is_none();

        info!(
            "recovered {} {} size {} @ {} (sl {:?}, trail {:?})",
            position.coin,
            position.direction,
            position.size,
            position.entry_price,
            protection.stop_loss,
            position.trailing_stop_loss,
        );
        if let Err(e) = book.open(position).await {
            error!("recovery failed to record position: {}", e);
        }
    }
}

fn spawn_equity_snapshots(
    exchange: Arc<dyn Exchange>,
    book: Arc<PositionBook>,
    db: Arc<Database>,
    session: Arc<Session>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(tokio::time::Duration::from_secs(interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let equity = match exchange.get_account_equity().await {
                        Ok(equity) => equity,
                        Err(e) => {
                            warn!("equity snapshot skipped: {}", e);
                            continue;
                        }
                    };
                    let positions = book.get_all().await;
                    let unrealized: f64 = positions.iter().map(|p| p.unrealized_pnl).sum();
                    let realized = session.counters.lock().await.realized_total();
                    let snapshot = database::EquitySnapshot {
                        timestamp: Utc::now(),
                        equity,
                        unrealized_pnl: unrealized,
                        realized_pnl: realized,
                        open_positions: positions.len() as i64,
                    };
                    if let Err(e) = db.insert_equity_snapshot(&snapshot).await {
                        error!("equity snapshot persist failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });
}

async fn run_backtest(
    config_path: &str,
    strategy_name: &str,
    coin: &str,
    interval: &str,
    bars: usize,
    capital: f64,
) -> Result<()> {
    let config = Config::load(config_path).unwrap_or_else(|e| {
        warn!("config not loaded ({}), using defaults", e);
        Config {
            mode: TradingMode::DryRun,
            symbols: vec![],
            guardrails: Default::default(),
            sizing: Default::default(),
            execution: Default::default(),
            runtime: Default::default(),
        }
    });
    let interval = CandleInterval::from_str(interval)
        .ok_or_else(|| anyhow!("unknown interval {}", interval))?;
    let strategy =
        create_strategy(strategy_name).ok_or_else(|| anyhow!("unknown strategy {}", strategy_name))?;

    info!("fetching {} {} candles for {}", bars, interval, coin);
    let market_data = HyperliquidClient::new(HYPERLIQUID_API, String::new(), String::new());
    let end = Utc::now().timestamp_millis();
    let start = end - bars as i64 * interval.to_millis();
    let candles = market_data
        .fetch_candles(coin, interval, start, end)
        .await
        .map_err(|e| anyhow!("{}", e))?;
    let candles: Vec<_> = candles.into_iter().filter(|c| c.is_valid()).collect();
    info!("running backtest over {} candles", candles.len());

    let engine = BacktestEngine::new(BacktestConfig {
        initial_capital: capital,
        sizing: config.sizing,
        execution: config.execution,
        guardrails: BacktestGuardrails::default(),
        source_interval: interval,
    });
    let report = engine.run(&candles, strategy.as_ref());

    let m = &report.metrics;
    println!("== {} on {} {} ==", strategy_name, coin, interval);
    println!("trades:        {}", m.num_trades);
    println!("total pnl:     {:.2}", m.total_pnl);
    println!("win rate:      {:.1}%", m.win_rate * 100.0);
    println!("profit factor: {:.2}", m.profit_factor);
    println!("max drawdown:  {:.2}%", m.max_drawdown_pct * 100.0);
    println!("avg R:         {:.2}", m.avg_r);
    println!("discarded:     {}", report.discarded_signals);
    if !report.completed {
        println!("(partial run, cancelled)");
    }
    for (reason, stats) in &report.analysis.by_exit_reason {
        println!("  {:>14}: {} trades, pnl {:.2}", reason, stats.count, stats.total_pnl);
    }
    Ok(())
}
