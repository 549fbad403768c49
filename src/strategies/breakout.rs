use crate::indicators::{atr, donchian, ema, keltner, WarmupSpec};
use crate::types::{CandleInterval, Direction, Signal, TakeProfit};

use super::trend::last_n;
use super::{ExitDecision, ParamSpec, Strategy, StrategyContext};

/// Channel breakout: enter when the close escapes the prior Donchian channel
/// while the hourly EMA agrees with the direction and the Keltner channel is
/// wide enough to mean the move is not noise. Stop is ATR-based, targets are
/// laddered at 1.5R and 3R.
pub struct BreakoutStrategy {
    pub channel_period: usize,
    pub keltner_ema: usize,
    pub keltner_tr: usize,
    pub keltner_mult: f64,
    pub min_channel_pct: f64,
    pub atr_period: usize,
    pub atr_stop_mult: f64,
    pub htf_interval: CandleInterval,
    pub htf_ema_period: usize,
    pub tp1_r: f64,
    pub tp2_r: f64,
}

impl Default for BreakoutStrategy {
    fn default() -> Self {
        Self {
            channel_period: 20,
            keltner_ema: 20,
            keltner_tr: 10,
            keltner_mult: 2.0,
            min_channel_pct: 0.15,
            atr_period: 14,
            atr_stop_mult: 2.0,
            htf_interval: CandleInterval::H1,
            htf_ema_period: 50,
            tp1_r: 1.5,
            tp2_r: 3.0,
        }
    }
}

impl BreakoutStrategy {
    fn lookback(&self) -> usize {
        (self
            .channel_period
            .max(self.keltner_ema)
            .max(self.keltner_tr)
            .max(self.atr_period)
            + 2)
            * 3
    }

    /// Higher-timeframe bias from the hourly EMA: above → long only, below →
    /// short only. None while the HTF history is too short.
    fn htf_bias(&self, ctx: &StrategyContext) -> Option<Direction> {
        let htf = ctx.htf_candles(self.htf_interval);
        if htf.len() < self.htf_ema_period + 1 {
            return None;
        }
        let closes: Vec<f64> = htf.iter().map(|c| c.close).collect();
        let trend = ema(&closes, self.htf_ema_period).ok()?;
        let last = *trend.last()?;
        let price = closes.last()?;
        if !last.is_finite() {
            return None;
        }
        if *price > last {
            Some(Direction::Long)
        } else {
            Some(Direction::Short)
        }
    }
}

impl Strategy for BreakoutStrategy {
    fn name(&self) -> &str {
        "breakout"
    }

    fn params(&self) -> Vec<(String, ParamSpec)> {
        vec![
            (
                "channel_period".to_string(),
                ParamSpec::new(self.channel_period as f64, 10.0, 60.0, 5.0),
            ),
            (
                "keltner_ema".to_string(),
                ParamSpec::new(self.keltner_ema as f64, 10.0, 40.0, 5.0),
            ),
            (
                "keltner_tr".to_string(),
                ParamSpec::fixed(self.keltner_tr as f64),
            ),
            (
                "keltner_mult".to_string(),
                ParamSpec::new(self.keltner_mult, 1.0, 3.0, 0.25),
            ),
            (
                "min_channel_pct".to_string(),
                ParamSpec::new(self.min_channel_pct, 0.05, 1.0, 0.05),
            ),
            (
                "atr_stop_mult".to_string(),
                ParamSpec::new(self.atr_stop_mult, 1.0, 4.0, 0.5),
            ),
            (
                "htf_ema_period".to_string(),
                ParamSpec::new(self.htf_ema_period as f64, 20.0, 100.0, 10.0),
            ),
            ("tp1_r".to_string(), ParamSpec::new(self.tp1_r, 1.0, 3.0, 0.5)),
            ("tp2_r".to_string(), ParamSpec::new(self.tp2_r, 2.0, 6.0, 0.5)),
        ]
    }

    fn required_timeframes(&self) -> Vec<CandleInterval> {
        vec![self.htf_interval]
    }

    fn warmup(&self) -> WarmupSpec {
        WarmupSpec {
            source: self.lookback(),
            higher: vec![(self.htf_interval, self.htf_ema_period + 5)],
        }
    }

    fn on_candle(&self, ctx: &StrategyContext) -> Option<Signal> {
        let tail = last_n(ctx.candles, ctx.index, self.lookback());
        if tail.len() < self.lookback() {
            return None;
        }

        let channel = donchian(tail, self.channel_period).ok()?;
        let bands = keltner(tail, self.keltner_ema, self.keltner_tr, self.keltner_mult).ok()?;
        let atr_out = atr(tail, self.atr_period).ok()?;

        let i = tail.len() - 1;
        // Channel levels from the prior bar so the current bar can break them.
        let upper = channel.upper[i - 1];
        let lower = channel.lower[i - 1];
        let band_up = bands.upper[i];
        let band_down = bands.lower[i];
        let range = atr_out[i];
        if !upper.is_finite()
            || !lower.is_finite()
            || !band_up.is_finite()
            || !band_down.is_finite()
            || !range.is_finite()
        {
            return None;
        }

        let close = ctx.close();
        // A channel narrower than the floor means chop, not a base.
        if (upper - lower) / close * 100.0 < self.min_channel_pct {
            return None;
        }

        let bias = self.htf_bias(ctx)?;
        let direction = if close > upper && bias == Direction::Long {
            Direction::Long
        } else if close < lower && bias == Direction::Short {
            Direction::Short
        } else {
            return None;
        };

        let stop_distance = self.atr_stop_mult * range;
        let stop_loss = close - direction.sign() * stop_distance;
        if stop_loss <= 0.0 {
            return None;
        }
        let tp1 = close + direction.sign() * stop_distance * self.tp1_r;
        let tp2 = close + direction.sign() * stop_distance * self.tp2_r;
        if tp1 <= 0.0 || tp2 <= 0.0 {
            return None;
        }

        Some(Signal {
            direction,
            entry_price: None,
            stop_loss,
            take_profits: vec![
                TakeProfit {
                    price: tp1,
                    pct_of_position: 0.5,
                },
                TakeProfit {
                    price: tp2,
                    pct_of_position: 0.5,
                },
            ],
            comment: format!(
                "{}-bar channel break at {:.4}",
                self.channel_period,
                if direction == Direction::Long { upper } else { lower }
            ),
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
        let channel = donchian(tail, self.channel_period).ok()?;
        let mid = channel.mid[tail.len() - 1];
        if !mid.is_finite() {
            return None;
        }

        let close = ctx.close();
        let failed = match position.direction {
            Direction::Long => close < mid,
            Direction::Short => close > mid,
        };
        if failed {
            Some(ExitDecision {
                reason: "close back through channel mid".to_string(),
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::aggregate;
    use crate::types::Candle;
    use std::collections::HashMap;

    fn candle(time: i64, close: f64, spread: f64) -> Candle {
        Candle {
            time,
            open: close - 0.1,
            high: close + spread,
            low: close - spread,
            close,
            volume: 10.0,
            trades: 3,
        }
    }

    /// A long quiet base followed by an upside breakout bar.
    fn breakout_series(strategy: &BreakoutStrategy) -> Vec<Candle> {
        let n = strategy.lookback() + 400;
        let mut candles = Vec::new();
        for i in 0..n {
            let t = i as i64 * 900_000;
            let price = if i < n - 1 {
                // gentle uptrend keeps the hourly EMA below price
                100.0 + i as f64 * 0.01 + ((i % 7) as f64 - 3.0) * 0.05
            } else {
                100.0 + i as f64 * 0.01 + 8.0
            };
            candles.push(candle(t, price, 0.4));
        }
        candles
    }

    fn htf_for(candles: &[Candle], strategy: &BreakoutStrategy) -> HashMap<CandleInterval, Vec<Candle>> {
        let mut htf = HashMap::new();
        htf.insert(
            strategy.htf_interval,
            aggregate(candles, CandleInterval::M15, strategy.htf_interval),
        );
        htf
    }

    #[test]
    fn breakout_bar_emits_long_with_laddered_targets() {
        let strategy = BreakoutStrategy::default();
        let candles = breakout_series(&strategy);
        let htf = htf_for(&candles, &strategy);
        let ctx = StrategyContext {
            candles: &candles,
            index: candles.len() - 1,
            htf: &htf,
            position: None,
            counters: Default::default(),
        };
        let signal = strategy.on_candle(&ctx).expect("breakout bar should signal");
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.take_profits.len(), 2);
        assert!(signal.validate(candles.last().unwrap().close).is_ok());
        let total: f64 = signal.take_profits.iter().map(|t| t.pct_of_position).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn quiet_bar_stays_silent() {
        let strategy = BreakoutStrategy::default();
        let mut candles = breakout_series(&strategy);
        // flatten the final bar back into the base
        let len = candles.len();
        candles[len - 1] = candle((len - 1) as i64 * 900_000, 100.0 + (len - 1) as f64 * 0.01, 0.4);
        let htf = htf_for(&candles, &strategy);
        let ctx = StrategyContext {
            candles: &candles,
            index: len - 1,
            htf: &htf,
            position: None,
            counters: Default::default(),
        };
        assert!(strategy.on_candle(&ctx).is_none());
    }

    #[test]
    fn no_signal_without_htf_history() {
        let strategy = BreakoutStrategy::default();
        let candles = breakout_series(&strategy);
        let htf = HashMap::new();
        let ctx = StrategyContext {
            candles: &candles,
            index: candles.len() - 1,
            htf: &htf,
            position: None,
            counters: Default::default(),
        };
        assert!(strategy.on_candle(&ctx).is_none());
    }

    #[test]
    fn long_exit_when_close_falls_through_mid() {
        let strategy = BreakoutStrategy::default();
        let mut candles = breakout_series(&strategy);
        let len = candles.len();
        // collapse the last bar far below the channel mid
        candles[len - 1] = candle((len - 1) as i64 * 900_000, 60.0, 0.4);
        let htf = htf_for(&candles, &strategy);
        let ctx = StrategyContext {
            candles: &candles,
            index: len - 1,
            htf: &htf,
            position: Some(super::super::PositionView {
                direction: Direction::Long,
                entry_price: 100.0,
                entry_bar: len - 10,
            }),
            counters: Default::default(),
        };
        assert!(strategy.should_exit(&ctx).is_some());
    }
}
