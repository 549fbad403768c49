use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::database::Database;
use crate::events::{EventLog, EventType};
use crate::exchange::{Exchange, VenueFill, VenuePosition};
use crate::notifications::NotificationManager;
use crate::portfolio::PositionBook;
use crate::session::Session;
use crate::types::{map_venue_status, OrderStatus, OrderTag, Position};

/// Relative size difference above which a shared symbol counts as drifted.
pub const SIZE_DRIFT_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq)]
pub enum Drift {
    LocalOnly { coin: String },
    RemoteOnly { coin: String },
    SizeMismatch { coin: String, local: f64, remote: f64 },
}

impl Drift {
    pub fn coin(&self) -> &str {
        match self {
            Drift::LocalOnly { coin } => coin,
            Drift::RemoteOnly { coin } => coin,
            Drift::SizeMismatch { coin, .. } => coin,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Drift::LocalOnly { coin } => {
                format!("{}: local position exists but not on venue", coin)
            }
            Drift::RemoteOnly { coin } => {
                format!("{}: venue position exists but not tracked locally", coin)
            }
            Drift::SizeMismatch { coin, local, remote } => {
                format!("{}: size drift, local {} vs venue {}", coin, local, remote)
            }
        }
    }
}

/// Pure comparison of the local book against the venue's authoritative state.
pub fn detect_drift(local: &[Position], remote: &[VenuePosition]) -> Vec<Drift> {
    let mut drifts = Vec::new();

    for position in local {
        match remote.iter().find(|r| r.coin == position.coin) {
            None => drifts.push(Drift::LocalOnly {
                coin: position.coin.clone(),
            }),
            Some(r) => {
                if (position.size - r.size).abs() > position.size * SIZE_DRIFT_TOLERANCE {
                    drifts.push(Drift::SizeMismatch {
                        coin: position.coin.clone(),
                        local: position.size,
                        remote: r.size,
                    });
                }
            }
        }
    }

    for venue_position in remote {
        if !local.iter().any(|p| p.coin == venue_position.coin) {
            drifts.push(Drift::RemoteOnly {
                coin: venue_position.coin.clone(),
            });
        }
    }

    drifts
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileSummary {
    pub drifts: usize,
    pub resolved_orders: usize,
}

/// Verifies local state against the venue on a periodic tick and on every
/// order-stream event. Detection only: drift is logged and event-emitted,
/// never auto-remediated.
pub struct Reconciler {
    exchange: Arc<dyn Exchange>,
    book: Arc<PositionBook>,
    db: Arc<Database>,
    events: Arc<EventLog>,
    notifications: Arc<NotificationManager>,
    session: Arc<Session>,
}

impl Reconciler {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        book: Arc<PositionBook>,
        db: Arc<Database>,
        events: Arc<EventLog>,
        notifications: Arc<NotificationManager>,
        session: Arc<Session>,
    ) -> Self {
        Self {
            exchange,
            book,
            db,
            events,
            notifications,
            session,
        }
    }

    pub async fn run_once(&self) -> Result<ReconcileSummary> {
        let drifts = self.reconcile_positions().await?;
        let resolved_orders = self.resolve_pending_orders().await?;
        Ok(ReconcileSummary {
            drifts,
            resolved_orders,
        })
    }

    async fn reconcile_positions(&self) -> Result<usize> {
        let remote = self.exchange.get_positions().await?;
        let local = self.book.get_all().await;
        let drifts = detect_drift(&local, &remote);

        if drifts.is_empty() {
            debug!("reconcile: {} positions consistent", local.len());
            self.events
                .emit(EventType::ReconcileOk, json!({"positions": local.len()}))
                .await;
        } else {
            for drift in &drifts {
                warn!("reconcile drift: {}", drift.message());
                self.events
                    .emit(
                        EventType::ReconcileDrift,
                        json!({"coin": drift.coin(), "message": drift.message()}),
                    )
                    .await;
                self.notifications
                    .drift_detected(drift.coin(), &drift.message())
                    .await;
            }
        }

        // A position flagged venue_incomplete keeps surfacing until its
        // protective orders exist.
        for position in &local {
            if position.venue_incomplete {
                warn!(
                    "{}: position has incomplete protective orders on venue",
                    position.coin
                );
            }
        }

        Ok(drifts.len())
    }

    /// Resolves local pending orders against the venue's historical record.
    async fn resolve_pending_orders(&self) -> Result<usize> {
        let pending = self.db.pending_orders().await?;
        if pending.is_empty() {
            return Ok(0);
        }
        let history = self.exchange.get_historical_orders().await?;

        let mut resolved = 0usize;
        for order in pending {
            let venue_id = match order.venue_order_id {
                Some(id) => id,
                None => continue,
            };
            let lock = self.book.symbol_lock(&order.coin).await;
            let _guard = lock.lock().await;

            let has_position = self.book.get(&order.coin).await.is_some();
            let raw_status = history
                .iter()
                .find(|h| h.order.order_id == venue_id)
                .map(|h| h.status.as_str());

            let mapped = match raw_status {
                Some(raw) => map_venue_status(raw, has_position),
                // Absent from the venue: gone orders with no position behind
                // them are cancelled; with a live position we assume the
                // history is just not caught up yet.
                None => {
                    if has_position {
                        None
                    } else {
                        Some(OrderStatus::Cancelled)
                    }
                }
            };

            let Some(status) = mapped else { continue };
            if !status.is_terminal() || status == order.status {
                continue;
            }

            info!(
                "{}: order {} ({}) resolved to {}",
                order.coin,
                order.id,
                order.tag.to_label(),
                status.as_str()
            );
            let filled_at = (status == OrderStatus::Filled).then(Utc::now);
            self.db
                .update_order_status(&order.id, status, filled_at)
                .await?;
            resolved += 1;

            if status == OrderStatus::Filled {
                self.apply_protective_fill(&order.coin, order.tag, order.size, None)
                    .await;
            }
        }
        Ok(resolved)
    }

    /// Applies an order-update batch from the event stream: terminal venue
    /// statuses resolve local pending orders, and filled protective orders
    /// move the position.
    pub async fn apply_order_updates(&self, updates: &[crate::exchange::OrderUpdate]) {
        for update in updates {
            let order = match self.db.find_order_by_venue_id(update.order_id).await {
                Ok(Some(order)) => order,
                Ok(None) => continue,
                Err(e) => {
                    error!("order-update lookup failed: {}", e);
                    continue;
                }
            };
            let lock = self.book.symbol_lock(&order.coin).await;
            let _guard = lock.lock().await;

            if order.status.is_terminal() {
                continue;
            }
            let has_position = self.book.get(&order.coin).await.is_some();
            let Some(status) = map_venue_status(&update.status, has_position) else {
                continue;
            };
            if !status.is_terminal() {
                continue;
            }

            let filled_at = (status == OrderStatus::Filled).then(Utc::now);
            if let Err(e) = self.db.update_order_status(&order.id, status, filled_at).await {
                error!("order status update failed: {}", e);
                continue;
            }
            if status == OrderStatus::Filled && order.tag != OrderTag::Entry {
                self.apply_protective_fill(&order.coin, order.tag, update.size, update.price)
                    .await;
            }
        }
    }

    /// Applies a fill batch from the event stream. Re-deliveries are
    /// idempotent: a fill against an order already marked filled is ignored.
    pub async fn apply_fills(&self, fills: &[VenueFill]) {
        for fill in fills {
            let order = match self.db.find_order_by_venue_id(fill.order_id).await {
                Ok(Some(order)) => order,
                Ok(None) => {
                    debug!("fill for unknown venue order {}", fill.order_id);
                    continue;
                }
                Err(e) => {
                    error!("fill lookup failed: {}", e);
                    continue;
                }
            };

            let lock = self.book.symbol_lock(&order.coin).await;
            let _guard = lock.lock().await;

            if order.status == OrderStatus::Filled {
                continue;
            }

            let record = crate::types::Fill {
                order_id: order.id.clone(),
                price: fill.price,
                size: fill.size,
                fee: fill.fee,
                timestamp: Utc::now(),
            };
            if let Err(e) = self.db.insert_fill(&record).await {
                error!("persisting fill failed: {}", e);
            }
            if let Err(e) = self
                .db
                .update_order_status(&order.id, OrderStatus::Filled, Some(Utc::now()))
                .await
            {
                error!("order status update failed: {}", e);
            }

            if order.tag != OrderTag::Entry {
                self.apply_protective_fill(&order.coin, order.tag, fill.size, Some(fill.price))
                    .await;
            }
        }
    }

    /// A filled protective order shrinks or closes the local position.
    /// Callers hold the symbol lock.
    async fn apply_protective_fill(
        &self,
        coin: &str,
        tag: OrderTag,
        filled_size: f64,
        fill_price: Option<f64>,
    ) {
        let Some(position) = self.book.get(coin).await else {
            return;
        };

        let fully_closes = match tag {
            OrderTag::StopLoss | OrderTag::Trail => true,
            OrderTag::TakeProfit(_) => filled_size >= position.size * (1.0 - 1e-9),
            OrderTag::Entry => false,
        };

        if fully_closes {
            if let Some(closed) = self.book.close(coin).await {
                let pnl = fill_price
                    .map(|p| (p - closed.entry_price) * closed.size * closed.direction.sign())
                    .unwrap_or(closed.unrealized_pnl);
                info!("{}: position closed by {} fill, pnl {:.2}", coin, tag.to_label(), pnl);
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
                            "reason": tag.to_label(),
                            "pnl": pnl,
                            "size": closed.size,
                        }),
                    )
                    .await;
                self.notifications
                    .position_closed(coin, pnl, &tag.to_label())
                    .await;
            }
        } else if matches!(tag, OrderTag::TakeProfit(_)) {
            self.book
                .modify(coin, |p| {
                    p.size = (p.size - filled_size).max(0.0);
                })
                .await;
            info!(
                "{}: partial close of {} via {}",
                coin,
                filled_size,
                tag.to_label()
            );
        }
    }

    /// Periodic tick until shutdown flips.
    pub fn spawn_ticker(self: Arc<Self>, interval_secs: u64, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(tokio::time::Duration::from_secs(interval_secs.max(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            error!("reconcile cycle failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("reconciler stopping");
                            return;
                        }
                    }
                }
            }
        });
    }
}
