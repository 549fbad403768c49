use tracing::debug;

use crate::config::{Guardrails, Sizing};
use crate::error::{TradingError, TradingResult};
use crate::types::{OrderIntent, Signal};

/// Hard ceiling applied to every intent regardless of configuration.
pub const ABSOLUTE_NOTIONAL_CAP_USD: f64 = 100_000.0;

/// Maximum tolerated distance between an intent's entry and the live market.
pub const MAX_PRICE_DEVIATION: f64 = 0.05;

/// Converts a validated signal into a sized order intent. Fails when the
/// sizing policy cannot produce a positive finite size.
pub fn translate(
    signal: &Signal,
    current_price: f64,
    coin: &str,
    sizing: &Sizing,
) -> TradingResult<OrderIntent> {
    signal.validate(current_price)?;

    let entry_price = signal.entry_price.unwrap_or(current_price);
    let size = sizing.compute_size(entry_price, signal.stop_loss);
    if size <= 0.0 || !size.is_finite() {
        return Err(TradingError::Validation(format!(
            "computed size {} for {} is not positive",
            size, coin
        )));
    }

    Ok(OrderIntent {
        coin: coin.to_string(),
        side: signal.direction.entry_side(),
        direction: signal.direction,
        size,
        entry_price,
        stop_loss: signal.stop_loss,
        take_profits: signal.take_profits.clone(),
        notional_usd: size * entry_price,
    })
}

/// Account-level inputs the gate needs besides the intent itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccountState {
    pub open_positions: usize,
    pub daily_loss_usd: f64,
    pub trades_today: u32,
    pub account_equity: f64,
}

/// The risk gate. Checks run in a fixed priority order and the first failure
/// is returned; a passing intent is returned untouched.
#[derive(Debug, Clone, Copy)]
pub struct RiskGate {
    pub guardrails: Guardrails,
}

impl RiskGate {
    pub fn new(guardrails: Guardrails) -> Self {
        Self { guardrails }
    }

    pub fn evaluate(
        &self,
        intent: &OrderIntent,
        state: &AccountState,
        current_price: f64,
    ) -> TradingResult<()> {
        let g = &self.guardrails;

        if intent.notional_usd > g.max_notional_usd {
            return Self::reject(format!(
                "Notional exceeds max: {:.2} > {:.2}",
                intent.notional_usd, g.max_notional_usd
            ));
        }

        let leverage = intent.leverage(state.account_equity);
        if leverage > g.max_leverage {
            return Self::reject(format!(
                "Leverage {:.2}x exceeds max {:.2}x",
                leverage, g.max_leverage
            ));
        }

        if state.open_positions >= g.max_open_positions {
            return Self::reject(format!(
                "Open positions at limit: {} >= {}",
                state.open_positions, g.max_open_positions
            ));
        }

        if state.daily_loss_usd >= g.max_daily_loss_usd {
            return Self::reject(format!(
                "Daily loss limit reached: {:.2} >= {:.2}",
                state.daily_loss_usd, g.max_daily_loss_usd
            ));
        }

        if state.trades_today >= g.max_trades_per_day {
            return Self::reject(if g.max_trades_per_day == 0 {
                "Trading disabled (kill switch)".to_string()
            } else {
                format!(
                    "Daily trade limit reached: {} >= {}",
                    state.trades_today, g.max_trades_per_day
                )
            });
        }

        if intent.notional_usd >= ABSOLUTE_NOTIONAL_CAP_USD {
            return Self::reject(format!(
                "Notional {:.2} breaches the absolute cap of {:.0}",
                intent.notional_usd, ABSOLUTE_NOTIONAL_CAP_USD
            ));
        }

        if current_price > 0.0 {
            let deviation = (intent.entry_price - current_price).abs() / current_price;
            if deviation > MAX_PRICE_DEVIATION {
                return Self::reject(format!(
                    "Entry {:.4} deviates from market {:.4} by {:.1}%",
                    intent.entry_price,
                    current_price,
                    deviation * 100.0
                ));
            }
        }

        debug!(
            "risk gate passed for {}: notional {:.2}, leverage {:.2}x",
            intent.coin, intent.notional_usd, leverage
        );
        Ok(())
    }

    fn reject(reason: String) -> TradingResult<()> {
        debug!("risk gate rejected: {}", reason);
        Err(TradingError::RiskRejected(reason))
    }
}
