use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::{Guardrails, Sizing, SymbolConfig, TradingMode};
use crate::database::Database;
use crate::error::TradingError;
use crate::events::{EventLog, EventType};
use crate::exchange::{truncate_size, Exchange, OrderResult};
use crate::notifications::NotificationManager;
use crate::portfolio::PositionBook;
use crate::risk::{translate, AccountState, RiskGate};
use crate::session::Session;
use crate::types::{
    Fill, OrderRecord, OrderStatus, OrderTag, OrderType, Position, Signal, TakeProfit,
};

/// What a signal submission resolved to; also the HTTP answer shape.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Executed { alert_id: String },
    Rejected { alert_id: String, reason: String },
}

/// One persisted signal outcome, broadcast to live subscribers (the WS
/// surface pushes these as `signals` frames). Duplicates resolve to their
/// prior row and are not re-broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct SignalUpdate {
    pub alert_id: String,
    pub asset: String,
    pub side: String,
    pub source: String,
    pub risk_check_passed: bool,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The signal handler: translates, risk-checks, places orders and records
/// the position. This is the escalation boundary for venue errors: a partial
/// placement is never rolled back silently; the position is recorded with a
/// zero stop and flagged so the reconciler keeps surfacing it.
pub struct SignalExecutor {
    exchange: Arc<dyn Exchange>,
    book: Arc<PositionBook>,
    db: Arc<Database>,
    events: Arc<EventLog>,
    notifications: Arc<NotificationManager>,
    session: Arc<Session>,
    gate: RiskGate,
    sizing: Sizing,
    mode: TradingMode,
    symbols: HashMap<String, SymbolConfig>,
    signal_feed: broadcast::Sender<SignalUpdate>,
}

impl SignalExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn Exchange>,
        book: Arc<PositionBook>,
        db: Arc<Database>,
        events: Arc<EventLog>,
        notifications: Arc<NotificationManager>,
        session: Arc<Session>,
        guardrails: Guardrails,
        sizing: Sizing,
        mode: TradingMode,
        symbols: Vec<SymbolConfig>,
    ) -> Self {
        let (signal_feed, _) = broadcast::channel(64);
        Self {
            exchange,
            book,
            db,
            events,
            notifications,
            session,
            gate: RiskGate::new(guardrails),
            sizing,
            mode,
            symbols: symbols.into_iter().map(|s| (s.coin.clone(), s)).collect(),
            signal_feed,
        }
    }

    /// Live feed of signal outcomes, one update per newly persisted signal.
    pub fn subscribe_signals(&self) -> broadcast::Receiver<SignalUpdate> {
        self.signal_feed.subscribe()
    }

    fn publish_signal(&self, coin: &str, signal: &Signal, alert_id: &str, passed: bool, reason: Option<&str>) {
        let _ = self.signal_feed.send(SignalUpdate {
            alert_id: alert_id.to_string(),
            asset: coin.to_string(),
            side: signal.direction.as_str().to_string(),
            source: signal.source.clone(),
            risk_check_passed: passed,
            reason: reason.map(str::to_string),
            created_at: Utc::now(),
        });
    }

    /// Full signal pipeline. `bar_time` anchors the derived alert id so the
    /// same bar cannot fire twice.
    pub async fn handle_signal(
        &self,
        coin: &str,
        signal: &Signal,
        current_price: f64,
        bar_time: i64,
    ) -> Result<ExecutionOutcome> {
        let alert_id = signal.effective_alert_id(coin, bar_time);
        self.events
            .emit(
                EventType::SignalReceived,
                json!({
                    "alert_id": alert_id,
                    "coin": coin,
                    "direction": signal.direction.as_str(),
                    "source": signal.source,
                }),
            )
            .await;

        // Idempotency: a known alert id resolves to its recorded outcome and
        // places nothing.
        if let Some(prior) = self.db.find_signal(&alert_id).await? {
            info!("{}: duplicate alert_id {}, not re-executing", coin, alert_id);
            return Ok(ExecutionOutcome::Rejected {
                alert_id,
                reason: format!(
                    "Duplicate alert_id (prior outcome: {})",
                    if prior.risk_check_passed {
                        "executed"
                    } else {
                        "rejected"
                    }
                ),
            });
        }

        // Translate, then gate; both failure modes persist the signal with
        // its rejection reason.
        let intent = match translate(signal, current_price, coin, &self.sizing) {
            Ok(intent) => intent,
            Err(e) => {
                return self
                    .reject(coin, signal, &alert_id, e.to_string())
                    .await
            }
        };

        let account_equity = self.exchange.get_account_equity().await.unwrap_or(0.0);
        let (trades_today, daily_loss_usd) =
            self.session.counters.lock().await.snapshot(Utc::now());
        let state = AccountState {
            open_positions: self.book.count().await,
            daily_loss_usd,
            trades_today,
            account_equity,
        };
        if let Err(e) = self.gate.evaluate(&intent, &state, current_price) {
            let reason = match e {
                TradingError::RiskRejected(msg) => msg,
                other => other.to_string(),
            };
            return self.reject(coin, signal, &alert_id, reason).await;
        }

        if self.book.get(coin).await.is_some() {
            return self
                .reject(coin, signal, &alert_id, format!("Position already open for {}", coin))
                .await;
        }

        self.persist_signal(coin, signal, &alert_id, true, None).await?;
        self.publish_signal(coin, signal, &alert_id, true, None);
        self.events
            .emit(
                EventType::RiskCheckPassed,
                json!({"alert_id": alert_id, "coin": coin, "notional": intent.notional_usd}),
            )
            .await;

        self.place_orders(coin, signal, &alert_id, intent).await?;
        Ok(ExecutionOutcome::Executed { alert_id })
    }

    async fn reject(
        &self,
        coin: &str,
        signal: &Signal,
        alert_id: &str,
        reason: String,
    ) -> Result<ExecutionOutcome> {
        warn!("{}: signal rejected: {}", coin, reason);
        self.persist_signal(coin, signal, alert_id, false, Some(&reason))
            .await?;
        self.publish_signal(coin, signal, alert_id, false, Some(&reason));
        self.events
            .emit(
                EventType::RiskCheckFailed,
                json!({"alert_id": alert_id, "coin": coin, "reason": reason}),
            )
            .await;
        Ok(ExecutionOutcome::Rejected {
            alert_id: alert_id.to_string(),
            reason,
        })
    }

    async fn persist_signal(
        &self,
        coin: &str,
        signal: &Signal,
        alert_id: &str,
        passed: bool,
        reason: Option<&str>,
    ) -> Result<()> {
        let tp_json = serde_json::to_string(&signal.take_profits)?;
        self.db
            .insert_signal(
                alert_id,
                &signal.source,
                coin,
                signal.direction.as_str(),
                signal.entry_price,
                signal.stop_loss,
                &tp_json,
                passed,
                reason,
            )
            .await?;
        Ok(())
    }

    /// Idempotent per session: leverage is set once per symbol.
    async fn ensure_leverage(&self, coin: &str) -> Result<(), TradingError> {
        {
            let cache = self.session.leverage_set.lock().await;
            if cache.contains(coin) {
                return Ok(());
            }
        }
        let config = self.symbols.get(coin).ok_or_else(|| {
            TradingError::Validation(format!("no symbol config for {}", coin))
        })?;
        self.exchange
            .set_leverage(coin, config.leverage, config.margin_type)
            .await?;
        self.session
            .leverage_set
            .lock()
            .await
            .insert(coin.to_string());
        Ok(())
    }

    async fn sz_decimals(&self, coin: &str) -> u32 {
        if let Some(d) = self.session.sz_decimals.read().await.get(coin) {
            return *d;
        }
        match self.exchange.get_symbol_meta().await {
            Ok(meta) => {
                let mut cache = self.session.sz_decimals.write().await;
                for m in &meta {
                    cache.insert(m.coin.clone(), m.sz_decimals);
                }
                cache.get(coin).copied().unwrap_or(4)
            }
            Err(e) => {
                warn!("symbol meta unavailable ({}), defaulting precision", e);
                4
            }
        }
    }

    async fn record_order(
        &self,
        order: &OrderRecord,
        result: &OrderResult,
    ) {
        let mut order = order.clone();
        order.venue_order_id = Some(result.order_id);
        if !result.resting {
            order.status = OrderStatus::Filled;
            order.filled_at = Some(Utc::now());
        }
        if let Err(e) = self.db.insert_order(&order).await {
            error!("persisting order failed: {}", e);
        }
        if let (false, Some(price)) = (result.resting, result.avg_price) {
            let fill = Fill {
                order_id: order.id.clone(),
                price,
                size: result.filled_size,
                fee: 0.0,
                timestamp: Utc::now(),
            };
            if let Err(e) = self.db.insert_fill(&fill).await {
                error!("persisting fill failed: {}", e);
            }
        }
        self.events
            .emit(
                EventType::OrderPlaced,
                json!({
                    "order_id": order.id,
                    "venue_order_id": result.order_id,
                    "coin": order.coin,
                    "tag": order.tag.to_label(),
                    "side": order.side.as_str(),
                    "size": order.size,
                }),
            )
            .await;
    }

    /// Places entry, stop-loss and take-profits, then records the position.
    /// Venue calls happen outside the book lock.
    async fn place_orders(
        &self,
        coin: &str,
        signal: &Signal,
        alert_id: &str,
        intent: crate::types::OrderIntent,
    ) -> Result<()> {
        self.ensure_leverage(coin).await.map_err(anyhow::Error::from)?;

        let sz_decimals = self.sz_decimals(coin).await;
        let size = truncate_size(intent.size, sz_decimals);
        if size <= 0.0 {
            return Err(anyhow::anyhow!(
                "size {} truncates to zero at {} decimals",
                intent.size,
                sz_decimals
            ));
        }

        // 1. entry as a market order
        let entry_result = self
            .exchange
            .place_market(coin, intent.side.is_buy(), size)
            .await
            .map_err(anyhow::Error::from)?;
        let entry_record = OrderRecord::new(
            coin,
            intent.side,
            size,
            OrderType::Market,
            OrderTag::Entry,
            self.mode.as_str(),
        )
        .with_signal(alert_id);
        self.record_order(&entry_record, &entry_result).await;
        self.session.counters.lock().await.note_trade(Utc::now());

        let entry_price = entry_result.avg_price.unwrap_or(intent.entry_price);
        let exit_side = intent.direction.exit_side();

        // 2. protective stop, reduce-only trigger on the opposite side
        let mut stop_loss = intent.stop_loss;
        let mut venue_incomplete = false;
        match self
            .exchange
            .place_stop_trigger(coin, exit_side.is_buy(), size, intent.stop_loss, true)
            .await
        {
            Ok(result) => {
                let record = OrderRecord::new(
                    coin,
                    exit_side,
                    size,
                    OrderType::Stop {
                        trigger: intent.stop_loss,
                    },
                    OrderTag::StopLoss,
                    self.mode.as_str(),
                )
                .with_signal(alert_id);
                self.record_order(&record, &result).await;
            }
            Err(e) => {
                // Escalation boundary: the entry is live, so never unwind
                // silently. Record the hole and let the reconciler surface it.
                error!("{}: stop-loss placement failed: {}", coin, e);
                stop_loss = 0.0;
                venue_incomplete = true;
            }
        }

        // 3. take-profits, reduce-only limits sized by their fraction
        let mut placed_tps: Vec<TakeProfit> = Vec::new();
        for (i, tp) in intent.take_profits.iter().enumerate() {
            let leg_size = truncate_size(tp.pct_of_position * size, sz_decimals);
            if leg_size <= 0.0 {
                continue;
            }
            match self
                .exchange
                .place_limit(coin, exit_side.is_buy(), leg_size, tp.price, true)
                .await
            {
                Ok(result) => {
                    let record = OrderRecord::new(
                        coin,
                        exit_side,
                        leg_size,
                        OrderType::Limit { price: tp.price },
                        OrderTag::TakeProfit(i as u8 + 1),
                        self.mode.as_str(),
                    )
                    .with_signal(alert_id);
                    self.record_order(&record, &result).await;
                    placed_tps.push(*tp);
                }
                Err(e) => {
                    error!("{}: take-profit {} placement failed: {}", coin, i + 1, e);
                    venue_incomplete = true;
                }
            }
        }

        // 4. record the position and announce it
        let mut position = Position::new(
            coin,
            intent.direction,
            entry_price,
            size,
            stop_loss,
            placed_tps,
        );
        position.venue_incomplete = venue_incomplete;

        {
            let lock = self.book.symbol_lock(coin).await;
            let _guard = lock.lock().await;
            if let Err(e) = self.book.open(position).await {
                // Should be unreachable given the earlier check; the venue
                // position is real either way, so surface loudly.
                error!("{}: book refused position: {}", coin, e);
                return Err(anyhow::Error::from(e));
            }
        }

        self.events
            .emit(
                EventType::PositionOpened,
                json!({
                    "coin": coin,
                    "alert_id": alert_id,
                    "direction": intent.direction.as_str(),
                    "size": size,
                    "entry_price": entry_price,
                    "stop_loss": stop_loss,
                    "venue_incomplete": venue_incomplete,
                    "comment": signal.comment,
                }),
            )
            .await;
        self.notifications
            .position_opened(coin, intent.direction.as_str(), size, entry_price)
            .await;

        info!(
            "{}: opened {} {} @ {:.4} (sl {:.4}, {} tps){}",
            coin,
            intent.direction,
            size,
            entry_price,
            stop_loss,
            intent.take_profits.len(),
            if venue_incomplete { " [INCOMPLETE]" } else { "" }
        );
        Ok(())
    }

    /// Strategy-driven exit: market out of the whole position, cancel the
    /// remaining protective orders, release the book entry.
    pub async fn close_position(&self, coin: &str, reason: &str) -> Result<()> {
        let Some(position) = self.book.get(coin).await else {
            return Ok(());
        };

        let exit_side = position.direction.exit_side();
        let result = self
            .exchange
            .place_market(coin, exit_side.is_buy(), position.size)
            .await
            .map_err(anyhow::Error::from)?;
        let record = OrderRecord::new(
            coin,
            exit_side,
            position.size,
            OrderType::Market,
            OrderTag::Entry,
            self.mode.as_str(),
        );
        self.record_order(&record, &result).await;

        // Cancel whatever protection is still resting.
        match self.exchange.get_open_orders().await {
            Ok(open) => {
                for order in open.iter().filter(|o| o.coin == coin && o.reduce_only) {
                    if let Err(e) = self.exchange.cancel(coin, order.order_id).await {
                        warn!("{}: cancel of order {} failed: {}", coin, order.order_id, e);
                    }
                }
            }
            Err(e) => warn!("{}: could not list open orders for cleanup: {}", coin, e),
        }

        let closed = {
            let lock = self.book.symbol_lock(coin).await;
            let _guard = lock.lock().await;
            self.book.close(coin).await
        };
        if let Some(closed) = closed {
            let exit_price = result.avg_price.unwrap_or(closed.current_price);
            let pnl =
                (exit_price - closed.entry_price) * closed.size * closed.direction.sign();
            self.session
                .counters
                .lock()
                .await
                .note_realized(pnl, Utc::now());
            self.events
                .emit(
                    EventType::PositionClosed,
                    json!({
                        "coin": coin,
                        "reason": reason,
                        "pnl": pnl,
                        "size": closed.size,
                    }),
                )
                .await;
            self.notifications.position_closed(coin, pnl, reason).await;
            info!("{}: closed by strategy ({}), pnl {:.2}", coin, reason, pnl);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MarginType;
    use crate::exchange::DryRunExchange;
    use crate::types::Direction;

    async fn executor(guardrails: Guardrails) -> (SignalExecutor, Arc<PositionBook>, Arc<Database>) {
        let exchange = Arc::new(DryRunExchange::new(10_000.0, &["ETH".to_string()]));
        exchange.set_mark("ETH", 100.0).await;
        let book = Arc::new(PositionBook::new());
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        let events = Arc::new(EventLog::new(
            std::env::temp_dir().join(format!("exec-{}.ndjson", uuid::Uuid::new_v4())),
        ));
        let notifications = Arc::new(NotificationManager::new(events.clone(), false));
        let session = Arc::new(Session::default());
        let symbols = vec![SymbolConfig {
            coin: "ETH".to_string(),
            leverage: 5,
            margin_type: MarginType::Cross,
            data_source: "hyperliquid".to_string(),
            strategies: vec![],
        }];
        let executor = SignalExecutor::new(
            exchange,
            book.clone(),
            db.clone(),
            events,
            notifications,
            session,
            guardrails,
            Sizing::Risk {
                risk_per_trade_usd: 10.0,
            },
            TradingMode::DryRun,
            symbols,
        );
        (executor, book, db)
    }

    fn signal() -> Signal {
        Signal {
            direction: Direction::Long,
            entry_price: None,
            stop_loss: 95.0,
            take_profits: vec![TakeProfit {
                price: 110.0,
                pct_of_position: 1.0,
            }],
            comment: String::new(),
            alert_id: Some("alert-1".to_string()),
            source: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn accepted_signal_opens_position_and_orders() {
        let (executor, book, db) = executor(Guardrails::default()).await;
        let outcome = executor
            .handle_signal("ETH", &signal(), 100.0, 0)
            .await
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Executed { .. }));

        let position = book.get("ETH").await.unwrap();
        assert_eq!(position.direction, Direction::Long);
        assert!((position.size - 2.0).abs() < 1e-9);
        assert!(!position.venue_incomplete);

        // entry + stop + one take-profit
        let orders = db.recent_orders(10).await.unwrap();
        assert_eq!(orders.len(), 3);
        let row = db.find_signal("alert-1").await.unwrap().unwrap();
        assert!(row.risk_check_passed);
    }

    #[tokio::test]
    async fn duplicate_alert_id_places_once() {
        let (executor, book, db) = executor(Guardrails::default()).await;
        let first = executor
            .handle_signal("ETH", &signal(), 100.0, 0)
            .await
            .unwrap();
        assert!(matches!(first, ExecutionOutcome::Executed { .. }));
        // a second submission with the same id must not place anything
        book.close("ETH").await;
        let second = executor
            .handle_signal("ETH", &signal(), 100.0, 0)
            .await
            .unwrap();
        match second {
            ExecutionOutcome::Rejected { reason, .. } => {
                assert!(reason.contains("Duplicate alert_id"), "got: {reason}");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(db.recent_orders(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn notional_rejection_persists_reason() {
        let (executor, book, db) = executor(Guardrails {
            max_notional_usd: 100.0,
            ..Guardrails::default()
        })
        .await;
        let outcome = executor
            .handle_signal("ETH", &signal(), 100.0, 0)
            .await
            .unwrap();
        match outcome {
            ExecutionOutcome::Rejected { reason, .. } => {
                assert!(reason.starts_with("Notional"), "got: {reason}");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert!(book.is_flat().await);
        assert!(db.recent_orders(10).await.unwrap().is_empty());
        let row = db.find_signal("alert-1").await.unwrap().unwrap();
        assert!(!row.risk_check_passed);
        assert!(row.risk_check_reason.unwrap().starts_with("Notional"));
    }

    #[tokio::test]
    async fn second_signal_on_open_symbol_is_rejected() {
        let (executor, _book, _db) = executor(Guardrails::default()).await;
        executor
            .handle_signal("ETH", &signal(), 100.0, 0)
            .await
            .unwrap();
        let mut other = signal();
        other.alert_id = Some("alert-2".to_string());
        let outcome = executor
            .handle_signal("ETH", &other, 100.0, 0)
            .await
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn signal_outcomes_are_broadcast() {
        let (executor, _book, _db) = executor(Guardrails::default()).await;
        let mut feed = executor.subscribe_signals();
        executor
            .handle_signal("ETH", &signal(), 100.0, 0)
            .await
            .unwrap();
        let update = feed.try_recv().unwrap();
        assert_eq!(update.alert_id, "alert-1");
        assert_eq!(update.asset, "ETH");
        assert!(update.risk_check_passed);
        assert!(update.reason.is_none());

        // duplicates resolve to the prior row and are not re-broadcast
        executor
            .handle_signal("ETH", &signal(), 100.0, 0)
            .await
            .unwrap();
        assert!(feed.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejections_are_broadcast_with_reason() {
        let (executor, _book, _db) = executor(Guardrails {
            max_notional_usd: 100.0,
            ..Guardrails::default()
        })
        .await;
        let mut feed = executor.subscribe_signals();
        executor
            .handle_signal("ETH", &signal(), 100.0, 0)
            .await
            .unwrap();
        let update = feed.try_recv().unwrap();
        assert!(!update.risk_check_passed);
        assert!(update.reason.unwrap().starts_with("Notional"));
    }

    #[tokio::test]
    async fn trades_today_counter_increments() {
        let (executor, book, _db) = executor(Guardrails {
            max_trades_per_day: 1,
            ..Guardrails::default()
        })
        .await;
        executor
            .handle_signal("ETH", &signal(), 100.0, 0)
            .await
            .unwrap();
        book.close("ETH").await;

        let mut next = signal();
        next.alert_id = Some("alert-2".to_string());
        let outcome = executor
            .handle_signal("ETH", &next, 100.0, 0)
            .await
            .unwrap();
        match outcome {
            ExecutionOutcome::Rejected { reason, .. } => {
                assert!(reason.contains("trade limit"), "got: {reason}");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }
}
