use super::{IndicatorError, IndicatorResult};

/// Relative strength index with Wilder smoothing of average gain and loss.
/// First valid output at index `period`; a window of pure gains reads 100,
/// pure losses 0, and a flat window 50.
pub fn rsi(values: &[f64], period: usize) -> IndicatorResult {
    if period < 1 {
        return Err(IndicatorError::InvalidPeriod(period));
    }
    let mut out = vec![f64::NAN; values.len()];
    if values.len() <= period {
        return Ok(out);
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let delta = values[i] - values[i - 1];
        if delta > 0.0 {
            avg_gain += delta;
        } else {
            avg_loss += -delta;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;
    out[period] = rsi_value(avg_gain, avg_loss);

    let p = period as f64;
    for i in (period + 1)..values.len() {
        let delta = values[i] - values[i - 1];
        let (gain, loss) = if delta > 0.0 {
            (delta, 0.0)
        } else {
            (0.0, -delta)
        };
        avg_gain = (avg_gain * (p - 1.0) + gain) / p;
        avg_loss = (avg_loss * (p - 1.0) + loss) / p;
        out[i] = rsi_value(avg_gain, avg_loss);
    }
    Ok(out)
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else if avg_gain == 0.0 {
        0.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_all_up_is_100() {
        let v: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let out = rsi(&v, 14).unwrap();
        assert!((out[19] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_all_down_is_0() {
        let v: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        let out = rsi(&v, 14).unwrap();
        assert!(out[19].abs() < 1e-9);
    }

    #[test]
    fn rsi_flat_is_50() {
        let v = vec![100.0; 20];
        let out = rsi(&v, 14).unwrap();
        assert!((out[19] - 50.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_warmup_and_bounds() {
        let v: Vec<f64> = (0..60)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0)
            .collect();
        let out = rsi(&v, 14).unwrap();
        assert_eq!(out.len(), v.len());
        for x in &out[..14] {
            assert!(x.is_nan());
        }
        for x in &out[14..] {
            assert!(*x >= 0.0 && *x <= 100.0);
        }
    }

    #[test]
    fn rsi_rejects_zero_period() {
        assert_eq!(rsi(&[1.0, 2.0], 0), Err(IndicatorError::InvalidPeriod(0)));
    }
}
