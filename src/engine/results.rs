use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{CompletedTrade, Direction};

/// One equity observation per processed bar. Drawdown is relative to the
/// running peak and therefore never positive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: i64,
    pub equity: f64,
    pub drawdown_pct: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Metrics {
    pub total_pnl: f64,
    pub num_trades: usize,
    pub profit_factor: f64,
    pub max_drawdown_pct: f64,
    pub win_rate: f64,
    pub avg_r: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ReasonStats {
    pub count: usize,
    pub total_pnl: f64,
}

/// Post-run breakdown of the trade list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeAnalysis {
    pub by_exit_reason: BTreeMap<String, ReasonStats>,
    pub long_trades: usize,
    pub short_trades: usize,
    pub long_pnl: f64,
    pub short_pnl: f64,
    pub best_trade_pnl: f64,
    pub worst_trade_pnl: f64,
    pub max_consecutive_wins: u32,
    pub max_consecutive_losses: u32,
    pub avg_bars_held: f64,
}

/// Everything a backtest run produces. `completed = false` means the run was
/// cancelled and the report covers bars up to the last completed one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub metrics: Metrics,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<CompletedTrade>,
    pub analysis: TradeAnalysis,
    pub discarded_signals: u64,
    pub completed: bool,
}

pub struct MetricsCalculator;

impl MetricsCalculator {
    pub fn calculate(trades: &[CompletedTrade], equity_curve: &[EquityPoint]) -> Metrics {
        let total_pnl: f64 = trades.iter().map(|t| t.net_pnl).sum();
        let wins = trades.iter().filter(|t| t.net_pnl > 0.0).count();

        let gross_profit: f64 = trades.iter().map(|t| t.net_pnl.max(0.0)).sum();
        let gross_loss: f64 = trades.iter().map(|t| (-t.net_pnl).max(0.0)).sum();
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let max_drawdown_pct = equity_curve
            .iter()
            .map(|p| p.drawdown_pct)
            .fold(0.0_f64, f64::min);

        let win_rate = if trades.is_empty() {
            0.0
        } else {
            wins as f64 / trades.len() as f64
        };

        let avg_r = if trades.is_empty() {
            0.0
        } else {
            trades.iter().map(|t| t.r_multiple).sum::<f64>() / trades.len() as f64
        };

        Metrics {
            total_pnl,
            num_trades: trades.len(),
            profit_factor,
            max_drawdown_pct,
            win_rate,
            avg_r,
        }
    }

    pub fn analyze(trades: &[CompletedTrade]) -> TradeAnalysis {
        let mut by_exit_reason: BTreeMap<String, ReasonStats> = BTreeMap::new();
        let mut long_trades = 0;
        let mut short_trades = 0;
        let mut long_pnl = 0.0;
        let mut short_pnl = 0.0;
        let mut best = f64::NEG_INFINITY;
        let mut worst = f64::INFINITY;
        let mut consec_wins = 0u32;
        let mut consec_losses = 0u32;
        let mut max_wins = 0u32;
        let mut max_losses = 0u32;
        let mut total_bars = 0u64;

        for trade in trades {
            let stats = by_exit_reason
                .entry(trade.exit_reason.as_str().to_string())
                .or_default();
            stats.count += 1;
            stats.total_pnl += trade.net_pnl;

            match trade.direction {
                Direction::Long => {
                    long_trades += 1;
                    long_pnl += trade.net_pnl;
                }
                Direction::Short => {
                    short_trades += 1;
                    short_pnl += trade.net_pnl;
                }
            }

            best = best.max(trade.net_pnl);
            worst = worst.min(trade.net_pnl);
            total_bars += trade.bars_held;

            if trade.net_pnl > 0.0 {
                consec_wins += 1;
                consec_losses = 0;
            } else {
                consec_losses += 1;
                consec_wins = 0;
            }
            max_wins = max_wins.max(consec_wins);
            max_losses = max_losses.max(consec_losses);
        }

        TradeAnalysis {
            by_exit_reason,
            long_trades,
            short_trades,
            long_pnl,
            short_pnl,
            best_trade_pnl: if trades.is_empty() { 0.0 } else { best },
            worst_trade_pnl: if trades.is_empty() { 0.0 } else { worst },
            max_consecutive_wins: max_wins,
            max_consecutive_losses: max_losses,
            avg_bars_held: if trades.is_empty() {
                0.0
            } else {
                total_bars as f64 / trades.len() as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExitReason;
    use chrono::Utc;

    fn trade(pnl: f64, r: f64, reason: ExitReason, direction: Direction) -> CompletedTrade {
        CompletedTrade {
            coin: "ETH".to_string(),
            direction,
            entry_price: 100.0,
            exit_price: 100.0 + pnl,
            size: 1.0,
            net_pnl: pnl,
            pnl_pct: pnl,
            r_multiple: r,
            bars_held: 4,
            exit_reason: reason,
            opened_at: Utc::now(),
            closed_at: Utc::now(),
            strategy: "test".to_string(),
        }
    }

    #[test]
    fn metrics_basics() {
        let trades = vec![
            trade(10.0, 2.0, ExitReason::TakeProfit, Direction::Long),
            trade(-5.0, -1.0, ExitReason::StopLoss, Direction::Long),
        ];
        let curve = vec![
            EquityPoint { time: 0, equity: 1000.0, drawdown_pct: 0.0 },
            EquityPoint { time: 1, equity: 995.0, drawdown_pct: -0.005 },
            EquityPoint { time: 2, equity: 1005.0, drawdown_pct: 0.0 },
        ];
        let m = MetricsCalculator::calculate(&trades, &curve);
        assert!((m.total_pnl - 5.0).abs() < 1e-9);
        assert_eq!(m.num_trades, 2);
        assert!((m.profit_factor - 2.0).abs() < 1e-9);
        assert!((m.win_rate - 0.5).abs() < 1e-9);
        assert!((m.avg_r - 0.5).abs() < 1e-9);
        assert!(m.max_drawdown_pct <= 0.0);
        assert!((m.max_drawdown_pct + 0.005).abs() < 1e-9);
    }

    #[test]
    fn profit_factor_with_no_losses() {
        let trades = vec![trade(10.0, 2.0, ExitReason::TakeProfit, Direction::Long)];
        let m = MetricsCalculator::calculate(&trades, &[]);
        assert!(m.profit_factor.is_infinite());
    }

    #[test]
    fn empty_run_is_all_zeroes() {
        let m = MetricsCalculator::calculate(&[], &[]);
        assert_eq!(m.num_trades, 0);
        assert_eq!(m.total_pnl, 0.0);
        assert_eq!(m.win_rate, 0.0);
        assert_eq!(m.max_drawdown_pct, 0.0);
    }

    #[test]
    fn analysis_breaks_down_by_reason_and_direction() {
        let trades = vec![
            trade(10.0, 2.0, ExitReason::TakeProfit, Direction::Long),
            trade(-5.0, -1.0, ExitReason::StopLoss, Direction::Short),
            trade(-3.0, -0.6, ExitReason::StopLoss, Direction::Long),
        ];
        let a = MetricsCalculator::analyze(&trades);
        assert_eq!(a.by_exit_reason["stop_loss"].count, 2);
        assert_eq!(a.by_exit_reason["take_profit"].count, 1);
        assert_eq!(a.long_trades, 2);
        assert_eq!(a.short_trades, 1);
        assert_eq!(a.max_consecutive_losses, 2);
        assert_eq!(a.best_trade_pnl, 10.0);
        assert_eq!(a.worst_trade_pnl, -5.0);
    }
}
