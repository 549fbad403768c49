pub mod adx;
pub mod aggregate;
pub mod atr;
pub mod donchian;
pub mod ema;
pub mod keltner;
pub mod rsi;

pub use adx::*;
pub use aggregate::*;
pub use atr::*;
pub use donchian::*;
pub use ema::*;
pub use keltner::*;
pub use rsi::*;

use thiserror::Error;

use crate::types::Candle;

/// All indicators return an array of the same length as their input, with the
/// first `warmup` elements set to NaN. Deterministic, allocation-per-call,
/// no hidden state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndicatorError {
    #[error("invalid period: {0}")]
    InvalidPeriod(usize),
}

pub type IndicatorResult = Result<Vec<f64>, IndicatorError>;

/// Simple moving average over a window of `period` ending at each index.
/// Warmup: `period - 1`.
pub fn sma(values: &[f64], period: usize) -> IndicatorResult {
    if period < 1 {
        return Err(IndicatorError::InvalidPeriod(period));
    }
    let mut out = vec![f64::NAN; values.len()];
    let mut window_sum = 0.0;
    for i in 0..values.len() {
        window_sum += values[i];
        if i >= period {
            window_sum -= values[i - period];
        }
        if i + 1 >= period {
            out[i] = window_sum / period as f64;
        }
    }
    Ok(out)
}

/// True range of a bar given the previous close; without one it degrades to
/// the plain high-low range.
pub fn true_range(candle: &Candle, prev_close: Option<f64>) -> f64 {
    let hl = candle.high - candle.low;
    match prev_close {
        Some(pc) => hl
            .max((candle.high - pc).abs())
            .max((candle.low - pc).abs()),
        None => hl,
    }
}

/// True-range series for a candle slice; element 0 has no previous close.
pub fn true_ranges(candles: &[Candle]) -> Vec<f64> {
    candles
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let prev = if i > 0 { Some(candles[i - 1].close) } else { None };
            true_range(c, prev)
        })
        .collect()
}

#[cfg(test)]
pub(crate) fn test_candle(time: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
    Candle {
        time,
        open,
        high,
        low,
        close,
        volume: 100.0,
        trades: 10,
    }
}
