use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::exchange::Exchange;
use crate::indicators::{aggregate, compute_min_warmup};
use crate::market_data::{CandleEvent, PriceCache};
use crate::portfolio::PositionBook;
use crate::session::Session;
use crate::strategies::{PositionView, RiskCounters, Strategy, StrategyContext};
use crate::types::{Candle, CandleBuffer, CandleInterval, UpsertOutcome};

use super::SignalExecutor;

/// Drives one strategy against one `(symbol, interval)` live stream. The
/// strategy only ever sees closed bars unless it declares itself
/// tick-sensitive, which is what keeps live behavior identical to the
/// backtest.
pub struct LiveRuntime {
    coin: String,
    interval: CandleInterval,
    strategy: Box<dyn Strategy>,
    auto_trading: bool,
    executor: Arc<SignalExecutor>,
    book: Arc<PositionBook>,
    exchange: Arc<dyn Exchange>,
    session: Arc<Session>,
    prices: Arc<PriceCache>,
    candle_feed: broadcast::Sender<CandleEvent>,
    buffer: CandleBuffer,
    min_warmup: usize,
    budget: Duration,
    degraded_bars: u64,
    bars_since_last_exit: Option<u64>,
    had_position: bool,
}

impl LiveRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coin: &str,
        interval: CandleInterval,
        strategy: Box<dyn Strategy>,
        auto_trading: bool,
        executor: Arc<SignalExecutor>,
        book: Arc<PositionBook>,
        exchange: Arc<dyn Exchange>,
        session: Arc<Session>,
        prices: Arc<PriceCache>,
        candle_feed: broadcast::Sender<CandleEvent>,
        buffer_bars: usize,
        budget_ms: u64,
    ) -> Self {
        let min_warmup = compute_min_warmup(&strategy.warmup(), interval);
        let capacity = min_warmup.max(buffer_bars);
        info!(
            "{} {} [{}]: warmup {} bars, buffer {}",
            coin,
            interval,
            strategy.name(),
            min_warmup,
            capacity
        );
        Self {
            coin: coin.to_string(),
            interval,
            strategy,
            auto_trading,
            executor,
            book,
            exchange,
            session,
            prices,
            candle_feed,
            buffer: CandleBuffer::new(capacity),
            min_warmup,
            budget: Duration::from_millis(budget_ms.max(1)),
            degraded_bars: 0,
            bars_since_last_exit: None,
            had_position: false,
        }
    }

    /// Seed the rolling buffer from warmup history.
    pub fn seed(&mut self, candles: Vec<Candle>) {
        for candle in candles {
            self.buffer.upsert(candle);
        }
        info!(
            "{} {} [{}]: seeded {} bars",
            self.coin,
            self.interval,
            self.strategy.name(),
            self.buffer.len()
        );
    }

    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<CandleEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(event) => self.on_event(event).await,
                        None => {
                            warn!("{} {}: candle stream channel closed", self.coin, self.interval);
                            return;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(
                            "{} {} [{}]: runtime stopping ({} degraded bars)",
                            self.coin, self.interval, self.strategy.name(), self.degraded_bars
                        );
                        return;
                    }
                }
            }
        }
    }

    async fn on_event(&mut self, event: CandleEvent) {
        if event.coin != self.coin || event.interval != self.interval {
            return;
        }

        // Mark-to-market on every update, closed or not.
        self.prices.set(&self.coin, event.candle.close).await;
        self.book.update_price(&self.coin, event.candle.close).await;
        self.exchange
            .note_mark(&self.coin, event.candle.close)
            .await;
        let _ = self.candle_feed.send(event.clone());

        if event.is_closed {
            if self.buffer.upsert(event.candle) == UpsertOutcome::RejectedOutOfOrder {
                return;
            }
            self.on_closed_bar(event.candle).await;
        } else {
            self.buffer.upsert(event.candle);
            if self.strategy.tick_sensitive() {
                self.evaluate(event.candle, false).await;
            }
        }
    }

    async fn on_closed_bar(&mut self, candle: Candle) {
        if let Some(bars) = self.bars_since_last_exit.as_mut() {
            *bars += 1;
        }
        if self.buffer.len() < self.min_warmup {
            debug!(
                "{} {}: warming up {}/{}",
                self.coin,
                self.interval,
                self.buffer.len(),
                self.min_warmup
            );
            return;
        }
        self.evaluate(candle, true).await;
    }

    async fn evaluate(&mut self, candle: Candle, closed_bar: bool) {
        // Re-aggregate the declared higher timeframes from the buffer.
        let mut htf: HashMap<CandleInterval, Vec<Candle>> = HashMap::new();
        for iv in self.strategy.required_timeframes() {
            htf.insert(iv, aggregate(&self.buffer.candles, self.interval, iv));
        }

        let position = self.book.get(&self.coin).await;
        let position_open = position.is_some();
        if self.had_position && !position_open {
            // closed elsewhere (reconciler / protective fill)
            self.bars_since_last_exit = Some(0);
        }
        self.had_position = position_open;

        let (trades_today, daily_loss_usd) = self
            .session
            .counters
            .lock()
            .await
            .snapshot(chrono::Utc::now());
        let counters = RiskCounters {
            daily_pnl_r: -daily_loss_usd,
            trades_today,
            global_trades_today: trades_today,
            bars_since_last_exit: self.bars_since_last_exit,
            consecutive_losses: 0,
        };

        let index = self.buffer.len() - 1;
        let view = position.as_ref().map(|p| PositionView {
            direction: p.direction,
            entry_price: p.entry_price,
            entry_bar: 0,
        });
        let ctx = StrategyContext {
            candles: &self.buffer.candles,
            index,
            htf: &htf,
            position: view,
            counters,
        };

        // Callbacks are pure and synchronous; a slow one marks the bar
        // degraded but is never cancelled.
        let started = Instant::now();
        let decision = if position_open {
            self.strategy.should_exit(&ctx).map(ExitOrEnter::Exit)
        } else {
            self.strategy.on_candle(&ctx).map(ExitOrEnter::Enter)
        };
        let elapsed = started.elapsed();
        if elapsed > self.budget {
            self.degraded_bars += 1;
            warn!(
                "{} {} [{}]: bar t={} degraded, callback took {:?} (budget {:?})",
                self.coin,
                self.interval,
                self.strategy.name(),
                candle.time,
                elapsed,
                self.budget
            );
        }

        match decision {
            Some(ExitOrEnter::Exit(exit)) => {
                info!(
                    "{} [{}]: strategy exit: {}",
                    self.coin,
                    self.strategy.name(),
                    exit.reason
                );
                if let Err(e) = self.executor.close_position(&self.coin, &exit.reason).await {
                    warn!("{}: close failed: {}", self.coin, e);
                }
                self.bars_since_last_exit = Some(0);
                self.had_position = false;
            }
            Some(ExitOrEnter::Enter(mut signal)) => {
                if !closed_bar && !self.strategy.tick_sensitive() {
                    return;
                }
                signal.source = self.strategy.name().to_string();
                if !self.auto_trading {
                    info!(
                        "{} [{}]: signal suppressed, auto-trading disabled",
                        self.coin,
                        self.strategy.name()
                    );
                    return;
                }
                match self
                    .executor
                    .handle_signal(&self.coin, &signal, candle.close, candle.time)
                    .await
                {
                    Ok(outcome) => {
                        debug!("{}: signal outcome {:?}", self.coin, outcome);
                        self.had_position = self.book.get(&self.coin).await.is_some();
                    }
                    Err(e) => warn!("{}: signal handling failed: {}", self.coin, e),
                }
            }
            None => {}
        }
    }
}

enum ExitOrEnter {
    Exit(crate::strategies::ExitDecision),
    Enter(crate::types::Signal),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Guardrails, MarginType, Sizing, SymbolConfig, TradingMode};
    use crate::database::Database;
    use crate::events::EventLog;
    use crate::exchange::DryRunExchange;
    use crate::indicators::WarmupSpec;
    use crate::notifications::NotificationManager;
    use crate::strategies::ParamSpec;
    use crate::types::{Direction, Signal, TakeProfit};

    /// Goes long whenever flat and the bar index is past warmup.
    struct AlwaysEnter;

    impl Strategy for AlwaysEnter {
        fn name(&self) -> &str {
            "always_enter"
        }
        fn params(&self) -> Vec<(String, ParamSpec)> {
            Vec::new()
        }
        fn warmup(&self) -> WarmupSpec {
            WarmupSpec {
                source: 3,
                higher: Vec::new(),
            }
        }
        fn on_candle(&self, ctx: &StrategyContext) -> Option<Signal> {
            Some(Signal {
                direction: Direction::Long,
                entry_price: None,
                stop_loss: ctx.close() * 0.95,
                take_profits: vec![TakeProfit {
                    price: ctx.close() * 1.1,
                    pct_of_position: 1.0,
                }],
                comment: String::new(),
                alert_id: None,
                source: String::new(),
            })
        }
    }

    fn candle(time: i64, close: f64) -> Candle {
        Candle {
            time,
            open: close,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume: 1.0,
            trades: 1,
        }
    }

    async fn runtime() -> (LiveRuntime, Arc<PositionBook>) {
        let exchange: Arc<DryRunExchange> =
            Arc::new(DryRunExchange::new(100_000.0, &["ETH".to_string()]));
        let book = Arc::new(PositionBook::new());
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        let events = Arc::new(EventLog::new(
            std::env::temp_dir().join(format!("rt-{}.ndjson", uuid::Uuid::new_v4())),
        ));
        let notifications = Arc::new(NotificationManager::new(events.clone(), false));
        let session = Arc::new(Session::default());
        let executor = Arc::new(SignalExecutor::new(
            exchange.clone(),
            book.clone(),
            db,
            events,
            notifications,
            session.clone(),
            Guardrails {
                max_notional_usd: 1_000_000.0,
                max_leverage: 50.0,
                ..Guardrails::default()
            },
            Sizing::Risk {
                risk_per_trade_usd: 10.0,
            },
            TradingMode::DryRun,
            vec![SymbolConfig {
                coin: "ETH".to_string(),
                leverage: 3,
                margin_type: MarginType::Cross,
                data_source: "hyperliquid".to_string(),
                strategies: vec![],
            }],
        ));
        let (feed, _) = broadcast::channel(16);
        let rt = LiveRuntime::new(
            "ETH",
            CandleInterval::M1,
            Box::new(AlwaysEnter),
            true,
            executor,
            book.clone(),
            exchange,
            session,
            Arc::new(PriceCache::default()),
            feed,
            10,
            250,
        );
        (rt, book)
    }

    #[tokio::test]
    async fn closed_bars_past_warmup_trigger_entries() {
        let (mut rt, book) = runtime().await;
        for i in 0..5i64 {
            rt.on_event(CandleEvent {
                coin: "ETH".to_string(),
                interval: CandleInterval::M1,
                candle: candle(i * 60_000, 100.0),
                is_closed: true,
            })
            .await;
        }
        // warmup is 3 bars; an entry must exist afterwards
        assert!(book.get("ETH").await.is_some());
    }

    #[tokio::test]
    async fn in_progress_bars_do_not_trigger_bar_close_strategies() {
        let (mut rt, book) = runtime().await;
        for i in 0..5i64 {
            rt.on_event(CandleEvent {
                coin: "ETH".to_string(),
                interval: CandleInterval::M1,
                candle: candle(i * 60_000, 100.0),
                is_closed: false,
            })
            .await;
        }
        assert!(book.get("ETH").await.is_none());
    }

    #[tokio::test]
    async fn events_for_other_symbols_are_ignored() {
        let (mut rt, book) = runtime().await;
        for i in 0..5i64 {
            rt.on_event(CandleEvent {
                coin: "BTC".to_string(),
                interval: CandleInterval::M1,
                candle: candle(i * 60_000, 100.0),
                is_closed: true,
            })
            .await;
        }
        assert!(book.get("ETH").await.is_none());
        assert!(rt.buffer.is_empty());
    }
}
