use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::TradingError;

use super::{Direction, Side};

/// One take-profit leg: price level and the fraction of the position it
/// closes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TakeProfit {
    pub price: f64,
    pub pct_of_position: f64,
}

/// Entry intent produced by a strategy (or received over HTTP).
/// `entry_price = None` means market at the current close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub direction: Direction,
    pub entry_price: Option<f64>,
    pub stop_loss: f64,
    pub take_profits: Vec<TakeProfit>,
    #[serde(default)]
    pub comment: String,
    /// Idempotency key. Derived deterministically when absent.
    #[serde(default)]
    pub alert_id: Option<String>,
    /// Producing strategy (or "webhook" for external submissions).
    #[serde(default)]
    pub source: String,
}

impl Signal {
    /// Checks level geometry against the effective entry price: for a long,
    /// `stop < entry < every TP`; symmetric for a short. TP fractions must
    /// sum to at most 1.
    pub fn validate(&self, current_price: f64) -> Result<(), TradingError> {
        let entry = match self.entry_price {
            Some(p) => p,
            None => current_price,
        };
        if !entry.is_finite() || entry <= 0.0 {
            return Err(TradingError::Validation(format!(
                "entry price {} is not a positive finite number",
                entry
            )));
        }
        if !self.stop_loss.is_finite() || self.stop_loss <= 0.0 {
            return Err(TradingError::Validation(format!(
                "stop loss {} is not a positive finite number",
                self.stop_loss
            )));
        }

        match self.direction {
            Direction::Long if self.stop_loss >= entry => {
                return Err(TradingError::Validation(format!(
                    "long stop loss {} must be below entry {}",
                    self.stop_loss, entry
                )));
            }
            Direction::Short if self.stop_loss <= entry => {
                return Err(TradingError::Validation(format!(
                    "short stop loss {} must be above entry {}",
                    self.stop_loss, entry
                )));
            }
            _ => {}
        }

        let mut total_pct = 0.0;
        for tp in &self.take_profits {
            if !tp.price.is_finite() || tp.price <= 0.0 {
                return Err(TradingError::Validation(format!(
                    "take profit price {} is not a positive finite number",
                    tp.price
                )));
            }
            if !tp.pct_of_position.is_finite() || tp.pct_of_position <= 0.0 {
                return Err(TradingError::Validation(
                    "take profit fraction must be positive".to_string(),
                ));
            }
            let wrong_side = match self.direction {
                Direction::Long => tp.price <= entry,
                Direction::Short => tp.price >= entry,
            };
            if wrong_side {
                return Err(TradingError::Validation(format!(
                    "{} take profit {} is on the wrong side of entry {}",
                    self.direction, tp.price, entry
                )));
            }
            total_pct += tp.pct_of_position;
        }
        if total_pct > 1.0 + 1e-9 {
            return Err(TradingError::Validation(format!(
                "take profit fractions sum to {:.4}, above 1",
                total_pct
            )));
        }

        Ok(())
    }

    /// Idempotency key for this signal: the supplied `alert_id` when present,
    /// otherwise derived from `(symbol, strategy, bar timestamp, direction)`.
    pub fn effective_alert_id(&self, coin: &str, bar_time: i64) -> String {
        match &self.alert_id {
            Some(id) => id.clone(),
            None => derive_alert_id(coin, &self.source, bar_time, self.direction),
        }
    }
}

/// Stable alert id so that re-delivery of the same bar/strategy/direction
/// dedupes downstream.
pub fn derive_alert_id(coin: &str, strategy: &str, bar_time: i64, direction: Direction) -> String {
    let mut hasher = Sha256::new();
    hasher.update(coin.as_bytes());
    hasher.update(b":");
    hasher.update(strategy.as_bytes());
    hasher.update(b":");
    hasher.update(bar_time.to_be_bytes());
    hasher.update(b":");
    hasher.update(direction.as_str().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Sized order intent derived from a signal by the translator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub coin: String,
    pub side: Side,
    pub direction: Direction,
    pub size: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profits: Vec<TakeProfit>,
    pub notional_usd: f64,
}

impl OrderIntent {
    /// Implied leverage given the account equity backing the trade.
    pub fn leverage(&self, account_equity: f64) -> f64 {
        if account_equity <= 0.0 {
            return f64::INFINITY;
        }
        self.notional_usd / account_equity
    }
}
