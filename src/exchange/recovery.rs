use tracing::warn;

use crate::types::{Direction, TakeProfit};

use super::VenueOrder;

/// Protective orders recovered from the venue after a restart.
#[derive(Debug, Clone, Default)]
pub struct RecoveredProtection {
    pub stop_loss: Option<f64>,
    pub trailing_stop: Option<f64>,
    pub take_profits: Vec<TakeProfit>,
}

/// Classifies the reduce-only orders resting against a position.
///
/// Trigger orders: a single one is the stop-loss; with two and a known
/// direction, the one further from danger is the trailing stop (for a long
/// the lower trigger is the fixed stop and the higher one trails; mirrored
/// for a short). Without a direction the first trigger is taken as the stop
/// and no trailing stop is inferred. Plain reduce-only limits are
/// take-profits, sized as their fraction of the position.
pub fn classify_protective_orders(
    open_orders: &[VenueOrder],
    position_size: f64,
    direction: Option<Direction>,
) -> RecoveredProtection {
    let mut recovered = RecoveredProtection::default();

    let triggers: Vec<&VenueOrder> = open_orders
        .iter()
        .filter(|o| o.reduce_only && o.trigger_price.is_some())
        .collect();
    let limits: Vec<&VenueOrder> = open_orders
        .iter()
        .filter(|o| o.reduce_only && o.trigger_price.is_none() && o.limit_price.is_some())
        .collect();

    match (triggers.as_slice(), direction) {
        ([], _) => {}
        ([only], _) => {
            recovered.stop_loss = only.trigger_price;
        }
        ([a, b], Some(dir)) => {
            let (pa, pb) = (a.trigger_price.unwrap(), b.trigger_price.unwrap());
            let (fixed, trailing) = match dir {
                Direction::Long => (pa.min(pb), pa.max(pb)),
                Direction::Short => (pa.max(pb), pa.min(pb)),
            };
            recovered.stop_loss = Some(fixed);
            recovered.trailing_stop = Some(trailing);
        }
        (many, _) => {
            if many.len() > 2 {
                warn!(
                    "found {} reduce-only triggers; keeping the first as stop-loss",
                    many.len()
                );
            }
            // unknown direction (or too many triggers): first trigger is the
            // stop, nothing is inferred as trailing
            recovered.stop_loss = many.first().and_then(|o| o.trigger_price);
        }
    }

    if position_size > 0.0 {
        for order in limits {
            let price = order.limit_price.unwrap();
            recovered.take_profits.push(TakeProfit {
                price,
                pct_of_position: (order.size / position_size).min(1.0),
            });
        }
    }

    recovered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn trigger(oid: u64, price: f64) -> VenueOrder {
        VenueOrder {
            order_id: oid,
            coin: "ETH".to_string(),
            side: Side::Sell,
            size: 2.0,
            limit_price: Some(price),
            trigger_price: Some(price),
            reduce_only: true,
        }
    }

    fn limit(oid: u64, price: f64, size: f64) -> VenueOrder {
        VenueOrder {
            order_id: oid,
            coin: "ETH".to_string(),
            side: Side::Sell,
            size,
            limit_price: Some(price),
            trigger_price: None,
            reduce_only: true,
        }
    }

    #[test]
    fn single_trigger_is_stop_loss() {
        let orders = vec![trigger(1, 1900.0)];
        let recovered = classify_protective_orders(&orders, 2.0, Some(Direction::Long));
        assert_eq!(recovered.stop_loss, Some(1900.0));
        assert_eq!(recovered.trailing_stop, None);
    }

    #[test]
    fn two_triggers_split_fixed_and_trailing_for_long() {
        let orders = vec![trigger(1, 1950.0), trigger(2, 1900.0)];
        let recovered = classify_protective_orders(&orders, 2.0, Some(Direction::Long));
        assert_eq!(recovered.stop_loss, Some(1900.0));
        assert_eq!(recovered.trailing_stop, Some(1950.0));
    }

    #[test]
    fn two_triggers_mirror_for_short() {
        let orders = vec![trigger(1, 2050.0), trigger(2, 2100.0)];
        let recovered = classify_protective_orders(&orders, 2.0, Some(Direction::Short));
        assert_eq!(recovered.stop_loss, Some(2100.0));
        assert_eq!(recovered.trailing_stop, Some(2050.0));
    }

    #[test]
    fn unknown_direction_takes_first_trigger_only() {
        let orders = vec![trigger(1, 1950.0), trigger(2, 1900.0)];
        let recovered = classify_protective_orders(&orders, 2.0, None);
        assert_eq!(recovered.stop_loss, Some(1950.0));
        assert_eq!(recovered.trailing_stop, None);
    }

    #[test]
    fn reduce_only_limits_become_take_profits() {
        let orders = vec![
            trigger(1, 1900.0),
            limit(2, 2100.0, 1.0),
            limit(3, 2200.0, 1.0),
        ];
        let recovered = classify_protective_orders(&orders, 2.0, Some(Direction::Long));
        assert_eq!(recovered.take_profits.len(), 2);
        assert_eq!(recovered.take_profits[0].pct_of_position, 0.5);
    }

    #[test]
    fn non_reduce_only_orders_are_ignored() {
        let mut entry = limit(5, 2000.0, 2.0);
        entry.reduce_only = false;
        let recovered = classify_protective_orders(&[entry], 2.0, Some(Direction::Long));
        assert!(recovered.stop_loss.is_none());
        assert!(recovered.take_profits.is_empty());
    }
}
