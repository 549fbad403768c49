use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::{TradingError, TradingResult};
use crate::types::Position;

/// In-memory book of live positions, keyed by symbol. The book is the single
/// owner of position state; every mutation goes through it and multi-step
/// order sequences serialize on the per-symbol mutex. Lock holders must not
/// perform network I/O.
#[derive(Default)]
pub struct PositionBook {
    inner: RwLock<HashMap<String, Position>>,
    symbol_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialization point for multi-step flows touching one symbol (place
    /// entry + protections, drain an event batch, reconcile).
    pub async fn symbol_lock(&self, coin: &str) -> Arc<Mutex<()>> {
        let mut locks = self.symbol_locks.lock().await;
        locks
            .entry(coin.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Fails without touching the book when the symbol already has a
    /// position.
    pub async fn open(&self, position: Position) -> TradingResult<()> {
        let mut inner = self.inner.write().await;
        if inner.contains_key(&position.coin) {
            return Err(TradingError::Internal(format!(
                "position already open for {}",
                position.coin
            )));
        }
        debug!(
            "book: open {} {} size {} @ {}",
            position.coin, position.direction, position.size, position.entry_price
        );
        inner.insert(position.coin.clone(), position);
        Ok(())
    }

    /// Removes and returns the position, if any.
    pub async fn close(&self, coin: &str) -> Option<Position> {
        let removed = self.inner.write().await.remove(coin);
        if let Some(p) = &removed {
            debug!("book: closed {} (pnl {:.2})", p.coin, p.unrealized_pnl);
        }
        removed
    }

    /// Updates the mark and the derived unrealized PnL. Non-finite or
    /// non-positive prices are ignored.
    pub async fn update_price(&self, coin: &str, price: f64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        if let Some(position) = self.inner.write().await.get_mut(coin) {
            position.update_price(price);
        }
    }

    /// Applies an arbitrary mutation to the position; returns false when no
    /// position exists for the symbol.
    pub async fn modify(&self, coin: &str, f: impl FnOnce(&mut Position)) -> bool {
        match self.inner.write().await.get_mut(coin) {
            Some(position) => {
                f(position);
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, coin: &str) -> Option<Position> {
        self.inner.read().await.get(coin).cloned()
    }

    pub async fn get_all(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.inner.read().await.values().cloned().collect();
        positions.sort_by(|a, b| a.coin.cmp(&b.coin));
        positions
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_flat(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
