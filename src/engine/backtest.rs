use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{ExecutionConfig, Sizing};
use crate::indicators::aggregate;
use crate::strategies::{PositionView, RiskCounters, Strategy, StrategyContext};
use crate::types::{
    Candle, CandleInterval, CompletedTrade, Direction, ExitReason, Side, TakeProfit,
};

use super::results::{BacktestReport, EquityPoint, MetricsCalculator};

/// Slippage moves the fill against the taker: buys fill higher, sells lower.
pub fn apply_slippage(price: f64, side: Side, bps: f64) -> f64 {
    match side {
        Side::Buy => price * (1.0 + bps / 10_000.0),
        Side::Sell => price * (1.0 - bps / 10_000.0),
    }
}

pub fn commission(price: f64, size: f64, pct: f64) -> f64 {
    (price * size).abs() * (pct / 100.0)
}

/// Trade-frequency guardrails evaluated before each signal.
#[derive(Debug, Clone, Copy)]
pub struct BacktestGuardrails {
    pub cooldown_bars: u32,
    pub max_consecutive_losses: u32,
    /// Daily realized loss limit in R units; 0 disables the check.
    pub max_daily_loss_r: f64,
    pub max_trades_per_day: u32,
    pub max_global_trades_day: u32,
}

impl Default for BacktestGuardrails {
    fn default() -> Self {
        Self {
            cooldown_bars: 0,
            max_consecutive_losses: 0,
            max_daily_loss_r: 0.0,
            max_trades_per_day: u32::MAX,
            max_global_trades_day: u32::MAX,
        }
    }
}

impl BacktestGuardrails {
    pub fn can_trade(&self, counters: &RiskCounters) -> bool {
        if let Some(bars) = counters.bars_since_last_exit {
            if bars < self.cooldown_bars as u64 {
                return false;
            }
        }
        if self.max_consecutive_losses > 0
            && counters.consecutive_losses >= self.max_consecutive_losses
        {
            return false;
        }
        if self.max_daily_loss_r > 0.0 && counters.daily_pnl_r <= -self.max_daily_loss_r {
            return false;
        }
        if counters.trades_today >= self.max_trades_per_day {
            return false;
        }
        if counters.global_trades_today >= self.max_global_trades_day {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub initial_capital: f64,
    pub sizing: Sizing,
    pub execution: ExecutionConfig,
    pub guardrails: BacktestGuardrails,
    pub source_interval: CandleInterval,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: 10_000.0,
            sizing: Sizing::Risk {
                risk_per_trade_usd: 10.0,
            },
            execution: ExecutionConfig::default(),
            guardrails: BacktestGuardrails::default(),
            source_interval: CandleInterval::M15,
        }
    }
}

/// Simulated open position, tracked with the remaining take-profit legs.
#[derive(Debug, Clone)]
struct OpenPosition {
    direction: Direction,
    entry_price: f64,
    size: f64,
    initial_size: f64,
    stop_loss: f64,
    take_profits: Vec<TakeProfit>,
    trailing_stop: Option<f64>,
    entry_bar: usize,
    opened_at: i64,
    initial_risk: f64,
    /// Net PnL banked by partial take-profits.
    realized: f64,
    entry_commission: f64,
    strategy: String,
}

enum ExitFill {
    None,
    /// Full close at a price, with or without exit slippage.
    Full {
        price: f64,
        slip: bool,
        reason: ExitReason,
    },
    /// Partial take-profit legs that filled this bar (in trigger order).
    Partial(Vec<TakeProfit>),
}

/// Drives a strategy bar-by-bar over a finite candle sequence with fixed
/// execution semantics. Entries fill at the signal bar's close (buy-side
/// slippage applied); the live executor matches this by sending market orders
/// on bar close.
pub struct BacktestEngine {
    config: BacktestConfig,
    cancel: Arc<AtomicBool>,
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig) -> Self {
        Self {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag that aborts the run at the next bar boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn run(&self, candles: &[Candle], strategy: &dyn Strategy) -> BacktestReport {
        let exec = self.config.execution;
        let src = self.config.source_interval;
        let src_ms = src.to_millis();

        // Pre-aggregate each declared higher timeframe once; per bar we only
        // reveal buckets whose end falls at or before the current bar close.
        let htf_full: Vec<(CandleInterval, Vec<Candle>)> = strategy
            .required_timeframes()
            .into_iter()
            .map(|iv| (iv, aggregate(candles, src, iv)))
            .collect();
        let mut htf_views: HashMap<CandleInterval, Vec<Candle>> =
            htf_full.iter().map(|(iv, _)| (*iv, Vec::new())).collect();
        let mut htf_cursors: Vec<usize> = vec![0; htf_full.len()];

        let mut position: Option<OpenPosition> = None;
        let mut trades: Vec<CompletedTrade> = Vec::new();
        let mut equity_curve: Vec<EquityPoint> = Vec::new();
        let mut counters = RiskCounters::default();
        let mut realized_total = 0.0;
        let mut peak = self.config.initial_capital;
        let mut discarded_signals = 0u64;
        let mut current_day: Option<i64> = None;
        let mut completed = true;
        let mut last_index = 0usize;

        for (i, candle) in candles.iter().enumerate() {
            if self.cancel.load(Ordering::Relaxed) {
                info!("backtest cancelled at bar {}", i);
                completed = false;
                break;
            }
            last_index = i;

            // Day boundary in UTC resets the daily counters.
            let day = candle.time.div_euclid(86_400_000);
            if current_day != Some(day) {
                if current_day.is_some() {
                    counters.trades_today = 0;
                    counters.global_trades_today = 0;
                    counters.daily_pnl_r = 0.0;
                }
                current_day = Some(day);
            }

            // Reveal newly completed HTF buckets.
            for (idx, (iv, full)) in htf_full.iter().enumerate() {
                let iv_ms = iv.to_millis();
                let cursor = &mut htf_cursors[idx];
                let view = htf_views.get_mut(iv).unwrap();
                while *cursor < full.len() && full[*cursor].time + iv_ms <= candle.time + src_ms {
                    view.push(full[*cursor]);
                    *cursor += 1;
                }
            }

            // Protective exits first, worst case within the bar: the stop wins
            // any tie against a take-profit.
            if let Some(pos) = position.as_mut() {
                match resolve_bar_exit(pos, candle) {
                    ExitFill::Full { price, slip, reason } => {
                        let fill = if slip {
                            apply_slippage(price, pos.direction.exit_side(), exec.slippage_bps)
                        } else {
                            price
                        };
                        let pos = position.take().unwrap();
                        let trade =
                            close_full(&pos, fill, reason, i, candle.time, exec.commission_pct);
                        realized_total += trade.net_pnl;
                        update_counters_on_close(&mut counters, &trade, pos.initial_risk);
                        trades.push(trade);
                    }
                    ExitFill::Partial(legs) => {
                        let last_leg_price = legs.last().map(|l| l.price).unwrap_or(candle.close);
                        for leg in &legs {
                            let leg_size = (leg.pct_of_position * pos.initial_size).min(pos.size);
                            if leg_size <= 0.0 {
                                continue;
                            }
                            let gross = (leg.price - pos.entry_price)
                                * leg_size
                                * pos.direction.sign();
                            pos.realized +=
                                gross - commission(leg.price, leg_size, exec.commission_pct);
                            pos.size -= leg_size;
                        }
                        pos.take_profits
                            .retain(|tp| !tp_hit(pos.direction, tp, candle));
                        if pos.size <= pos.initial_size * 1e-9 {
                            let pos = position.take().unwrap();
                            let trade = close_full(
                                &pos,
                                last_leg_price,
                                ExitReason::TakeProfit,
                                i,
                                candle.time,
                                exec.commission_pct,
                            );
                            realized_total += trade.net_pnl;
                            update_counters_on_close(&mut counters, &trade, pos.initial_risk);
                            trades.push(trade);
                        }
                    }
                    ExitFill::None => {}
                }
            }

            // Strategy-driven exit at bar close.
            if let Some(pos) = position.as_ref() {
                let ctx = StrategyContext {
                    candles: &candles[..=i],
                    index: i,
                    htf: &htf_views,
                    position: Some(PositionView {
                        direction: pos.direction,
                        entry_price: pos.entry_price,
                        entry_bar: pos.entry_bar,
                    }),
                    counters,
                };
                if let Some(exit) = strategy.should_exit(&ctx) {
                    debug!("strategy exit at bar {}: {}", i, exit.reason);
                    let fill = apply_slippage(
                        candle.close,
                        pos.direction.exit_side(),
                        exec.slippage_bps,
                    );
                    let pos = position.take().unwrap();
                    let trade = close_full(
                        &pos,
                        fill,
                        ExitReason::Signal,
                        i,
                        candle.time,
                        exec.commission_pct,
                    );
                    realized_total += trade.net_pnl;
                    update_counters_on_close(&mut counters, &trade, pos.initial_risk);
                    trades.push(trade);
                }
            }

            // Entry evaluation, gated by the risk counters.
            if position.is_none() && self.config.guardrails.can_trade(&counters) {
                let ctx = StrategyContext {
                    candles: &candles[..=i],
                    index: i,
                    htf: &htf_views,
                    position: None,
                    counters,
                };
                if let Some(signal) = strategy.on_candle(&ctx) {
                    match self.try_open(&signal, candle, i, strategy.name()) {
                        Some(pos) => {
                            counters.trades_today += 1;
                            counters.global_trades_today += 1;
                            position = Some(pos);
                        }
                        None => discarded_signals += 1,
                    }
                }
            }

            if let Some(bars) = counters.bars_since_last_exit.as_mut() {
                *bars += 1;
            }

            // Equity observation at bar close.
            let open_component = position
                .as_ref()
                .map(|p| {
                    p.realized - p.entry_commission
                        + (candle.close - p.entry_price) * p.size * p.direction.sign()
                })
                .unwrap_or(0.0);
            let equity = self.config.initial_capital + realized_total + open_component;
            peak = peak.max(equity);
            let drawdown_pct = if peak > 0.0 { (equity - peak) / peak } else { 0.0 };
            equity_curve.push(EquityPoint {
                time: candle.time,
                equity,
                drawdown_pct,
            });
        }

        // Whatever is still open closes at the last processed bar so the
        // equity accounting identity holds for partial runs too.
        if let Some(pos) = position.take() {
            if let Some(candle) = candles.get(last_index) {
                let fill =
                    apply_slippage(candle.close, pos.direction.exit_side(), exec.slippage_bps);
                let trade = close_full(
                    &pos,
                    fill,
                    ExitReason::EndOfData,
                    last_index,
                    candle.time,
                    exec.commission_pct,
                );
                realized_total += trade.net_pnl;
                trades.push(trade);
                let equity = self.config.initial_capital + realized_total;
                peak = peak.max(equity);
                if let Some(last) = equity_curve.last_mut() {
                    last.equity = equity;
                    last.drawdown_pct = if peak > 0.0 { (equity - peak) / peak } else { 0.0 };
                }
            }
        }

        let metrics = MetricsCalculator::calculate(&trades, &equity_curve);
        let analysis = MetricsCalculator::analyze(&trades);
        BacktestReport {
            metrics,
            equity_curve,
            trades,
            analysis,
            discarded_signals,
            completed,
        }
    }

    /// Validates and sizes a signal; any defect discards it silently.
    fn try_open(
        &self,
        signal: &crate::types::Signal,
        candle: &Candle,
        bar: usize,
        strategy_name: &str,
    ) -> Option<OpenPosition> {
        if signal.validate(candle.close).is_err() {
            debug!("discarding invalid signal at bar {}", bar);
            return None;
        }
        let entry = signal.entry_price.unwrap_or(candle.close);
        let size = self.config.sizing.compute_size(entry, signal.stop_loss);
        if size <= 0.0 || !size.is_finite() {
            debug!("discarding unsizeable signal at bar {}", bar);
            return None;
        }

        let side = signal.direction.entry_side();
        let entry_exec = apply_slippage(entry, side, self.config.execution.slippage_bps);
        let entry_commission = commission(entry_exec, size, self.config.execution.commission_pct);
        let initial_risk = (entry_exec - signal.stop_loss).abs() * size;
        if initial_risk <= 0.0 {
            return None;
        }

        let mut take_profits = signal.take_profits.clone();
        // Trigger order: nearest leg first.
        match signal.direction {
            Direction::Long => {
                take_profits.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap())
            }
            Direction::Short => {
                take_profits.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap())
            }
        }

        Some(OpenPosition {
            direction: signal.direction,
            entry_price: entry_exec,
            size,
            initial_size: size,
            stop_loss: signal.stop_loss,
            take_profits,
            trailing_stop: None,
            entry_bar: bar,
            opened_at: candle.time,
            initial_risk,
            realized: 0.0,
            entry_commission,
            strategy: strategy_name.to_string(),
        })
    }
}

fn tp_hit(direction: Direction, tp: &TakeProfit, candle: &Candle) -> bool {
    match direction {
        Direction::Long => candle.high >= tp.price,
        Direction::Short => candle.low <= tp.price,
    }
}

/// Decides what fills within this bar's range for an open position.
fn resolve_bar_exit(pos: &OpenPosition, candle: &Candle) -> ExitFill {
    let (stop_level, stop_is_trailing) = match pos.direction {
        Direction::Long => match pos.trailing_stop {
            Some(t) if t > pos.stop_loss => (t, true),
            _ => (pos.stop_loss, false),
        },
        Direction::Short => match pos.trailing_stop {
            Some(t) if t < pos.stop_loss => (t, true),
            _ => (pos.stop_loss, false),
        },
    };
    let stop_hit = match pos.direction {
        Direction::Long => candle.low <= stop_level,
        Direction::Short => candle.high >= stop_level,
    };
    if stop_hit {
        return ExitFill::Full {
            price: stop_level,
            slip: true,
            reason: if stop_is_trailing {
                ExitReason::TrailingStop
            } else {
                ExitReason::StopLoss
            },
        };
    }

    let hit: Vec<TakeProfit> = pos
        .take_profits
        .iter()
        .copied()
        .filter(|tp| tp_hit(pos.direction, tp, candle))
        .collect();
    if hit.is_empty() {
        ExitFill::None
    } else {
        ExitFill::Partial(hit)
    }
}

fn close_full(
    pos: &OpenPosition,
    fill_price: f64,
    reason: ExitReason,
    bar: usize,
    bar_time: i64,
    commission_pct: f64,
) -> CompletedTrade {
    let gross = (fill_price - pos.entry_price) * pos.size * pos.direction.sign();
    let exit_commission = commission(fill_price, pos.size, commission_pct);
    let net_pnl = pos.realized + gross - exit_commission - pos.entry_commission;
    let entry_value = pos.entry_price * pos.initial_size;
    let pnl_pct = if entry_value > 0.0 {
        net_pnl / entry_value * 100.0
    } else {
        0.0
    };
    let r_multiple = if pos.initial_risk > 0.0 {
        net_pnl / pos.initial_risk
    } else {
        0.0
    };

    CompletedTrade {
        coin: String::new(),
        direction: pos.direction,
        entry_price: pos.entry_price,
        exit_price: fill_price,
        size: pos.initial_size,
        net_pnl,
        pnl_pct,
        r_multiple,
        bars_held: (bar - pos.entry_bar) as u64,
        exit_reason: reason,
        opened_at: millis_to_datetime(pos.opened_at),
        closed_at: millis_to_datetime(bar_time),
        strategy: pos.strategy.clone(),
    }
}

fn update_counters_on_close(
    counters: &mut RiskCounters,
    trade: &CompletedTrade,
    initial_risk: f64,
) {
    if initial_risk > 0.0 {
        counters.daily_pnl_r += trade.net_pnl / initial_risk;
    }
    if trade.net_pnl < 0.0 {
        counters.consecutive_losses += 1;
    } else {
        counters.consecutive_losses = 0;
    }
    counters.bars_since_last_exit = Some(0);
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
