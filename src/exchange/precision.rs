use rust_decimal::prelude::*;
use rust_decimal::Decimal;

/// Floor-truncates a size to the symbol's `sz_decimals`. Never rounds up: an
/// over-precise size would be rejected by the venue, an inflated one would
/// overspend.
pub fn truncate_size(size: f64, sz_decimals: u32) -> f64 {
    match Decimal::from_f64(size) {
        Some(d) => d.trunc_with_scale(sz_decimals).to_f64().unwrap_or(0.0),
        None => 0.0,
    }
}

/// Rounds a price to 5 significant figures for the wire.
pub fn round_price(price: f64) -> f64 {
    match Decimal::from_f64(price).and_then(|d| d.round_sf(5)) {
        Some(d) => d.to_f64().unwrap_or(price),
        None => price,
    }
}

/// Wire formatting: trailing zeroes trimmed, as the venue expects.
pub fn format_size(size: f64, sz_decimals: u32) -> String {
    match Decimal::from_f64(size) {
        Some(d) => d.trunc_with_scale(sz_decimals).normalize().to_string(),
        None => "0".to_string(),
    }
}

pub fn format_price(price: f64) -> String {
    match Decimal::from_f64(price).and_then(|d| d.round_sf(5)) {
        Some(d) => d.normalize().to_string(),
        None => price.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_truncation_floors() {
        assert_eq!(truncate_size(1.23456, 2), 1.23);
        assert_eq!(truncate_size(1.239999, 2), 1.23);
        assert_eq!(truncate_size(0.0001, 3), 0.0);
        assert_eq!(truncate_size(5.0, 0), 5.0);
    }

    #[test]
    fn price_rounds_to_five_significant_figures() {
        assert_eq!(round_price(12345.678), 12346.0);
        assert_eq!(round_price(1.2345678), 1.2346);
        assert_eq!(round_price(0.00123456), 0.0012346);
        assert_eq!(round_price(2000.0), 2000.0);
    }

    #[test]
    fn wire_formats_trim_zeroes() {
        assert_eq!(format_size(1.2300, 4), "1.23");
        assert_eq!(format_price(2000.0), "2000");
        assert_eq!(format_size(0.5, 1), "0.5");
    }
}
