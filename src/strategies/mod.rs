pub mod breakout;
pub mod trend;

pub use breakout::*;
pub use trend::*;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::indicators::WarmupSpec;
use crate::types::{Candle, CandleInterval, Direction, Signal};

/// One entry in a strategy's named parameter table. The bounds and step exist
/// for the external optimizer; the engine only reads `value`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ParamSpec {
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub optimizable: bool,
}

impl ParamSpec {
    pub fn new(value: f64, min: f64, max: f64, step: f64) -> Self {
        Self {
            value,
            min,
            max,
            step,
            optimizable: true,
        }
    }

    pub fn fixed(value: f64) -> Self {
        Self {
            value,
            min: value,
            max: value,
            step: 0.0,
            optimizable: false,
        }
    }
}

/// What a strategy is allowed to know about the open position.
#[derive(Debug, Clone, Copy)]
pub struct PositionView {
    pub direction: Direction,
    pub entry_price: f64,
    pub entry_bar: usize,
}

/// Risk-state counters carried into every bar; in live mode they are rebuilt
/// from persisted trade history.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskCounters {
    /// Realized PnL today, in R units (losses negative).
    pub daily_pnl_r: f64,
    pub trades_today: u32,
    pub global_trades_today: u32,
    /// None until the first exit has happened.
    pub bars_since_last_exit: Option<u64>,
    pub consecutive_losses: u32,
}

/// Per-bar snapshot handed to strategy callbacks. Strategies hold no mutable
/// state across bars; everything they need is here or in their parameters.
pub struct StrategyContext<'a> {
    /// Full base candle sequence up to and including the current bar.
    pub candles: &'a [Candle],
    /// Index of the current bar within `candles`.
    pub index: usize,
    /// Aggregated sequences for each declared higher timeframe, complete
    /// buckets only.
    pub htf: &'a HashMap<CandleInterval, Vec<Candle>>,
    pub position: Option<PositionView>,
    pub counters: RiskCounters,
}

impl<'a> StrategyContext<'a> {
    pub fn current(&self) -> &Candle {
        &self.candles[self.index]
    }

    pub fn close(&self) -> f64 {
        self.candles[self.index].close
    }

    pub fn htf_candles(&self, interval: CandleInterval) -> &[Candle] {
        self.htf.get(&interval).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

#[derive(Debug, Clone)]
pub struct ExitDecision {
    pub reason: String,
}

/// The strategy contract. `on_candle` and `should_exit` are pure with respect
/// to the receiver: the same context always produces the same answer, which
/// is what keeps backtest and live behavior identical.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Named parameter table with optimizer metadata.
    fn params(&self) -> Vec<(String, ParamSpec)>;

    /// Higher timeframes this strategy aggregates into its context.
    fn required_timeframes(&self) -> Vec<CandleInterval> {
        Vec::new()
    }

    /// Per-timeframe warmup requirement.
    fn warmup(&self) -> WarmupSpec;

    /// Entry intent for the current bar, or None.
    fn on_candle(&self, ctx: &StrategyContext) -> Option<Signal>;

    /// Optional exit check while a position is open.
    fn should_exit(&self, _ctx: &StrategyContext) -> Option<ExitDecision> {
        None
    }

    /// Whether the strategy also wants in-progress candle updates. Bar-close
    /// strategies keep the default so live behavior matches the backtest.
    fn tick_sensitive(&self) -> bool {
        false
    }
}

/// Factory used by config bindings and the CLI.
pub fn create_strategy(name: &str) -> Option<Box<dyn Strategy>> {
    match name {
        "breakout" => Some(Box::new(BreakoutStrategy::default())),
        "trend" => Some(Box::new(TrendStrategy::default())),
        _ => None,
    }
}
