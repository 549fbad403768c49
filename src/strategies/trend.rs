use crate::indicators::{adx, atr, ema, WarmupSpec};
use crate::types::{Direction, Signal, TakeProfit};

use super::{ExitDecision, ParamSpec, Strategy, StrategyContext};

/// Trend-following entry: an EMA crossover in the direction of travel,
/// confirmed by ADX, with an ATR-based stop and a single R-multiple target.
/// Exits when the fast EMA crosses back through the slow one.
pub struct TrendStrategy {
    pub fast_period: usize,
    pub slow_period: usize,
    pub adx_period: usize,
    pub min_adx: f64,
    pub atr_period: usize,
    pub atr_stop_mult: f64,
    pub reward_r: f64,
}

impl Default for TrendStrategy {
    fn default() -> Self {
        Self {
            fast_period: 9,
            slow_period: 21,
            adx_period: 14,
            min_adx: 20.0,
            atr_period: 14,
            atr_stop_mult: 1.5,
            reward_r: 2.0,
        }
    }
}

impl TrendStrategy {
    /// Bars each `on_candle` call actually looks at; bounds the cost per bar.
    fn lookback(&self) -> usize {
        (self.slow_period.max(2 * self.adx_period).max(self.atr_period) + 2) * 3
    }
}

impl Strategy for TrendStrategy {
    fn name(&self) -> &str {
        "trend"
    }

    fn params(&self) -> Vec<(String, ParamSpec)> {
        vec![
            (
                "fast_period".to_string(),
                ParamSpec::new(self.fast_period as f64, 5.0, 20.0, 1.0),
            ),
            (
                "slow_period".to_string(),
                ParamSpec::new(self.slow_period as f64, 15.0, 60.0, 1.0),
            ),
            (
                "adx_period".to_string(),
                ParamSpec::fixed(self.adx_period as f64),
            ),
            (
                "min_adx".to_string(),
                ParamSpec::new(self.min_adx, 10.0, 40.0, 5.0),
            ),
            (
                "atr_stop_mult".to_string(),
                ParamSpec::new(self.atr_stop_mult, 1.0, 4.0, 0.5),
            ),
            (
                "reward_r".to_string(),
                ParamSpec::new(self.reward_r, 1.0, 5.0, 0.5),
            ),
        ]
    }

    fn warmup(&self) -> WarmupSpec {
        WarmupSpec {
            source: self.lookback(),
            higher: Vec::new(),
        }
    }

    fn on_candle(&self, ctx: &StrategyContext) -> Option<Signal> {
        let tail = last_n(ctx.candles, ctx.index, self.lookback());
        if tail.len() < self.lookback() {
            return None;
        }
        let closes: Vec<f64> = tail.iter().map(|c| c.close).collect();

        let fast = ema(&closes, self.fast_period).ok()?;
        let slow = ema(&closes, self.slow_period).ok()?;
        let adx_out = adx(tail, self.adx_period).ok()?;
        let atr_out = atr(tail, self.atr_period).ok()?;

        let i = tail.len() - 1;
        let (f_now, f_prev) = (fast[i], fast[i - 1]);
        let (s_now, s_prev) = (slow[i], slow[i - 1]);
        let strength = adx_out.adx[i];
        let range = atr_out[i];
        if !f_now.is_finite()
            || !f_prev.is_finite()
            || !s_now.is_finite()
            || !s_prev.is_finite()
            || !strength.is_finite()
            || !range.is_finite()
        {
            return None;
        }
        if strength < self.min_adx {
            return None;
        }

        let crossed_up = f_prev <= s_prev && f_now > s_now;
        let crossed_down = f_prev >= s_prev && f_now < s_now;
        let close = ctx.close();

        let direction = if crossed_up {
            Direction::Long
        } else if crossed_down {
            Direction::Short
        } else {
            return None;
        };

        let stop_distance = self.atr_stop_mult * range;
        let stop_loss = close - direction.sign() * stop_distance;
        let target = close + direction.sign() * stop_distance * self.reward_r;
        if stop_loss <= 0.0 || target <= 0.0 {
            return None;
        }

        Some(Signal {
            direction,
            entry_price: None,
            stop_loss,
            take_profits: vec![TakeProfit {
                price: target,
                pct_of_position: 1.0,
            }],
            comment: format!("ema {}x{} cross, adx {:.1}", self.fast_period, self.slow_period, strength),
            alert_id: None,
            source: self.name().to_string(),
        })
    }

    fn should_exit(&self, ctx: &StrategyContext) -> Option<ExitDecision> {
        let position = ctx.position?;
        let tail = last_n(ctx.candles, ctx.index, self.lookback());
        if tail.len() < self.lookback() {
            return None;
        }
        let closes: Vec<f64> = tail.iter().map(|c| c.close).collect();
        let fast = ema(&closes, self.fast_period).ok()?;
        let slow = ema(&closes, self.slow_period).ok()?;
        let i = tail.len() - 1;
        if !fast[i].is_finite() || !slow[i].is_finite() {
            return None;
        }

        let against = match position.direction {
            Direction::Long => fast[i] < slow[i],
            Direction::Short => fast[i] > slow[i],
        };
        if against {
            Some(ExitDecision {
                reason: "ema cross against position".to_string(),
            })
        } else {
            None
        }
    }
}

pub(super) fn last_n(candles: &[crate::types::Candle], index: usize, n: usize) -> &[crate::types::Candle] {
    let end = index + 1;
    let start = end.saturating_sub(n);
    &candles[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Candle;

    fn candle(time: i64, close: f64) -> Candle {
        Candle {
            time,
            open: close - 0.2,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
            trades: 3,
        }
    }

    fn context(candles: &[Candle]) -> StrategyContext<'_> {
        StrategyContext {
            candles,
            index: candles.len() - 1,
            htf: Box::leak(Box::default()),
            position: None,
            counters: Default::default(),
        }
    }

    #[test]
    fn no_signal_on_short_history() {
        let candles: Vec<Candle> = (0..10).map(|i| candle(i, 100.0)).collect();
        let strategy = TrendStrategy::default();
        assert!(strategy.on_candle(&context(&candles)).is_none());
    }

    #[test]
    fn crossover_after_downtrend_goes_long() {
        let strategy = TrendStrategy::default();
        let n = strategy.lookback() + 40;
        let mut candles = Vec::new();
        // long slide down, then a sharp rally to force the fast EMA up through
        // the slow one while directional movement is strong
        for i in 0..n {
            let price = if i < n - 12 {
                200.0 - i as f64 * 0.5
            } else {
                let rally = (i - (n - 12)) as f64;
                200.0 - (n - 12) as f64 * 0.5 + rally * 6.0
            };
            candles.push(candle(i as i64 * 60_000, price));
        }
        let signal = strategy.on_candle(&context(&candles));
        // accept either no signal (cross happened earlier) or a long; never a short
        if let Some(s) = signal {
            assert_eq!(s.direction, Direction::Long);
            assert!(s.stop_loss < candles.last().unwrap().close);
            assert_eq!(s.take_profits.len(), 1);
        }
    }

    #[test]
    fn signal_geometry_is_valid_when_emitted() {
        let strategy = TrendStrategy::default();
        let n = strategy.lookback() + 60;
        for shift in 0..8 {
            let mut candles = Vec::new();
            for i in 0..n {
                let base = 100.0 + ((i + shift * 3) as f64 * 0.15).sin() * 8.0 + i as f64 * 0.05;
                candles.push(candle(i as i64 * 60_000, base));
            }
            for end in strategy.lookback()..n {
                let ctx = StrategyContext {
                    candles: &candles[..=end],
                    index: end,
                    htf: Box::leak(Box::default()),
                    position: None,
                    counters: Default::default(),
                };
                if let Some(s) = strategy.on_candle(&ctx) {
                    assert!(s.validate(candles[end].close).is_ok());
                }
            }
        }
    }
}
