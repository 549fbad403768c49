use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::signal::TakeProfit;
use super::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    /// Side of the entry order for this direction.
    pub fn entry_side(&self) -> Side {
        match self {
            Direction::Long => Side::Buy,
            Direction::Short => Side::Sell,
        }
    }

    /// Side of reduce-only (protective) orders for this direction.
    pub fn exit_side(&self) -> Side {
        self.entry_side().opposite()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Open exposure on one symbol. At most one position per symbol exists at any
/// time; `size > 0` while open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub coin: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub size: f64,
    pub stop_loss: f64,
    pub take_profits: Vec<TakeProfit>,
    pub trailing_stop_loss: Option<f64>,
    pub liquidation_price: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    /// Set when the entry was placed but a protective order could not be;
    /// surfaced by the reconciler until resolved.
    #[serde(default)]
    pub venue_incomplete: bool,
}

impl Position {
    pub fn new(
        coin: &str,
        direction: Direction,
        entry_price: f64,
        size: f64,
        stop_loss: f64,
        take_profits: Vec<TakeProfit>,
    ) -> Self {
        Self {
            coin: coin.to_string(),
            direction,
            entry_price,
            size,
            stop_loss,
            take_profits,
            trailing_stop_loss: None,
            liquidation_price: None,
            opened_at: Utc::now(),
            current_price: entry_price,
            unrealized_pnl: 0.0,
            venue_incomplete: false,
        }
    }

    pub fn update_price(&mut self, price: f64) {
        self.current_price = price;
        self.unrealized_pnl = (price - self.entry_price) * self.size * self.direction.sign();
    }

    pub fn notional_usd(&self) -> f64 {
        self.current_price * self.size
    }

    /// Stop distance the position was opened with; the denominator of the
    /// R-multiple.
    pub fn initial_risk(&self) -> f64 {
        (self.entry_price - self.stop_loss).abs() * self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    Signal,
    EndOfData,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::Signal => "signal",
            ExitReason::EndOfData => "end_of_data",
        }
    }
}

/// Immutable record produced when a position fully closes. PnL is net of
/// commissions on both legs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedTrade {
    pub coin: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub net_pnl: f64,
    pub pnl_pct: f64,
    pub r_multiple: f64,
    pub bars_held: u64,
    pub exit_reason: ExitReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub strategy: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrealized_pnl_respects_direction() {
        let mut long = Position::new("ETH", Direction::Long, 100.0, 2.0, 95.0, vec![]);
        long.update_price(105.0);
        assert!((long.unrealized_pnl - 10.0).abs() < 1e-9);

        let mut short = Position::new("ETH", Direction::Short, 100.0, 2.0, 105.0, vec![]);
        short.update_price(105.0);
        assert!((short.unrealized_pnl + 10.0).abs() < 1e-9);
    }

    #[test]
    fn initial_risk_is_stop_distance_times_size() {
        let p = Position::new("BTC", Direction::Long, 100.0, 3.0, 95.0, vec![]);
        assert!((p.initial_risk() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn protective_sides() {
        assert_eq!(Direction::Long.entry_side(), Side::Buy);
        assert_eq!(Direction::Long.exit_side(), Side::Sell);
        assert_eq!(Direction::Short.entry_side(), Side::Sell);
        assert_eq!(Direction::Short.exit_side(), Side::Buy);
    }
}
