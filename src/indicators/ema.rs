use super::{IndicatorError, IndicatorResult};

/// Exponential moving average, `alpha = 2 / (period + 1)`, seeded with the
/// first value. The recursion runs from index 0 but the first `period - 1`
/// outputs are masked NaN because the average is not yet stable there.
pub fn ema(values: &[f64], period: usize) -> IndicatorResult {
    if period < 1 {
        return Err(IndicatorError::InvalidPeriod(period));
    }
    let mut out = vec![f64::NAN; values.len()];
    if values.is_empty() {
        return Ok(out);
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let mut current = values[0];
    for (i, &v) in values.iter().enumerate() {
        if i > 0 {
            current = alpha * v + (1.0 - alpha) * current;
        }
        if i + 1 >= period {
            out[i] = current;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_period_one_is_identity() {
        let v = [5.0, 7.0, 6.0];
        assert_eq!(ema(&v, 1).unwrap(), v.to_vec());
    }

    #[test]
    fn ema_warmup_and_length() {
        let v: Vec<f64> = (1..=10).map(|i| i as f64).collect();
        let out = ema(&v, 4).unwrap();
        assert_eq!(out.len(), v.len());
        for x in &out[..3] {
            assert!(x.is_nan());
        }
        for x in &out[3..] {
            assert!(x.is_finite());
        }
    }

    #[test]
    fn ema_recursion_from_first_value_seed() {
        // alpha = 0.5 for period 3; seed 2.0
        // i1: 0.5*4 + 0.5*2 = 3.0; i2: 0.5*6 + 0.5*3 = 4.5
        let out = ema(&[2.0, 4.0, 6.0], 3).unwrap();
        assert!(out[0].is_nan());
        assert!(out[1].is_nan());
        assert!((out[2] - 4.5).abs() < 1e-12);
    }

    #[test]
    fn ema_converges_toward_constant_input() {
        let v = vec![10.0; 50];
        let out = ema(&v, 5).unwrap();
        assert!((out[49] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn ema_rejects_zero_period() {
        assert_eq!(ema(&[1.0], 0), Err(IndicatorError::InvalidPeriod(0)));
    }
}
