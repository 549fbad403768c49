use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::types::CandleInterval;

/// Deployment mode. Dry-run simulates order placement end-to-end; testnet and
/// live differ only in the venue endpoints and signing credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TradingMode {
    DryRun,
    Testnet,
    Live,
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingMode::DryRun => "dry-run",
            TradingMode::Testnet => "testnet",
            TradingMode::Live => "live",
        }
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginType {
    Cross,
    Isolated,
}

/// A strategy bound to a symbol in the deployment document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyBinding {
    pub name: String,
    pub interval: String,
    #[serde(default = "default_warmup_bars")]
    pub warmup_bars: usize,
    #[serde(default)]
    pub auto_trading_enabled: bool,
}

fn default_warmup_bars() -> usize {
    200
}

impl StrategyBinding {
    pub fn interval(&self) -> Option<CandleInterval> {
        CandleInterval::from_str(&self.interval)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub coin: String,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default = "default_margin_type")]
    pub margin_type: MarginType,
    #[serde(default = "default_data_source")]
    pub data_source: String,
    #[serde(default)]
    pub strategies: Vec<StrategyBinding>,
}

fn default_leverage() -> u32 {
    3
}

fn default_margin_type() -> MarginType {
    MarginType::Cross
}

fn default_data_source() -> String {
    "hyperliquid".to_string()
}

/// Hard limits enforced by the risk gate, in check order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Guardrails {
    pub max_notional_usd: f64,
    pub max_leverage: f64,
    pub max_open_positions: usize,
    pub max_daily_loss_usd: f64,
    /// 0 acts as a kill switch: every intent is rejected.
    pub max_trades_per_day: u32,
}

impl Default for Guardrails {
    fn default() -> Self {
        Self {
            max_notional_usd: 10_000.0,
            max_leverage: 5.0,
            max_open_positions: 3,
            max_daily_loss_usd: 500.0,
            max_trades_per_day: 10,
        }
    }
}

/// Position sizing policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Sizing {
    /// Size so that hitting the stop loses `risk_per_trade_usd`.
    Risk { risk_per_trade_usd: f64 },
    /// Fixed notional per trade.
    Cash { cash_per_trade: f64 },
}

impl Default for Sizing {
    fn default() -> Self {
        Sizing::Risk {
            risk_per_trade_usd: 50.0,
        }
    }
}

impl Sizing {
    /// Computed size in coins, or 0 when the inputs make sizing impossible.
    pub fn compute_size(&self, entry_price: f64, stop_loss: f64) -> f64 {
        match self {
            Sizing::Risk { risk_per_trade_usd } => {
                let stop_distance = (entry_price - stop_loss).abs();
                if stop_distance <= 0.0 || !stop_distance.is_finite() {
                    0.0
                } else {
                    risk_per_trade_usd / stop_distance
                }
            }
            Sizing::Cash { cash_per_trade } => {
                if entry_price <= 0.0 || !entry_price.is_finite() {
                    0.0
                } else {
                    cash_per_trade / entry_price
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: f64,
    #[serde(default = "default_commission_pct")]
    pub commission_pct: f64,
}

fn default_slippage_bps() -> f64 {
    2.0
}

fn default_commission_pct() -> f64 {
    0.045
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            slippage_bps: default_slippage_bps(),
            commission_pct: default_commission_pct(),
        }
    }
}

/// Operational knobs that are not trading policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    #[serde(default = "default_buffer_bars")]
    pub candle_buffer_bars: usize,
    #[serde(default = "default_budget_ms")]
    pub on_candle_budget_ms: u64,
    #[serde(default = "default_reconcile_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_snapshot_secs")]
    pub equity_snapshot_secs: u64,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_event_log")]
    pub event_log_path: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_buffer_bars() -> usize {
    500
}

fn default_budget_ms() -> u64 {
    250
}

fn default_reconcile_secs() -> u64 {
    30
}

fn default_snapshot_secs() -> u64 {
    60
}

fn default_db_path() -> String {
    "sqlite://trading.db".to_string()
}

fn default_event_log() -> String {
    "events.ndjson".to_string()
}

fn default_http_port() -> u16 {
    3000
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            candle_buffer_bars: default_buffer_bars(),
            on_candle_budget_ms: default_budget_ms(),
            reconcile_interval_secs: default_reconcile_secs(),
            equity_snapshot_secs: default_snapshot_secs(),
            db_path: default_db_path(),
            event_log_path: default_event_log(),
            http_port: default_http_port(),
        }
    }
}

/// The single deployment document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mode: TradingMode,
    #[serde(default)]
    pub symbols: Vec<SymbolConfig>,
    #[serde(default)]
    pub guardrails: Guardrails,
    #[serde(default)]
    pub sizing: Sizing,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub runtime: RuntimeSettings,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        if let Err(errors) = config.validate() {
            anyhow::bail!("invalid config {}: {}", path.display(), errors.join("; "));
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.symbols.is_empty() {
            errors.push("at least one symbol must be configured".to_string());
        }
        for symbol in &self.symbols {
            if symbol.coin.is_empty() {
                errors.push("symbol coin must not be empty".to_string());
            }
            if symbol.leverage == 0 {
                errors.push(format!("{}: leverage must be > 0", symbol.coin));
            }
            for binding in &symbol.strategies {
                if binding.interval().is_none() {
                    errors.push(format!(
                        "{}: unknown interval '{}' for strategy {}",
                        symbol.coin, binding.interval, binding.name
                    ));
                }
            }
        }

        if self.guardrails.max_notional_usd <= 0.0 {
            errors.push("guardrails.max_notional_usd must be > 0".to_string());
        }
        if self.guardrails.max_leverage <= 0.0 {
            errors.push("guardrails.max_leverage must be > 0".to_string());
        }
        if self.guardrails.max_open_positions == 0 {
            errors.push("guardrails.max_open_positions must be > 0".to_string());
        }
        if self.guardrails.max_daily_loss_usd <= 0.0 {
            errors.push("guardrails.max_daily_loss_usd must be > 0".to_string());
        }

        match self.sizing {
            Sizing::Risk { risk_per_trade_usd } if risk_per_trade_usd <= 0.0 => {
                errors.push("sizing.risk_per_trade_usd must be > 0".to_string());
            }
            Sizing::Cash { cash_per_trade } if cash_per_trade <= 0.0 => {
                errors.push("sizing.cash_per_trade must be > 0".to_string());
            }
            _ => {}
        }

        if self.execution.slippage_bps < 0.0 {
            errors.push("execution.slippage_bps must be >= 0".to_string());
        }
        if self.execution.commission_pct < 0.0 {
            errors.push("execution.commission_pct must be >= 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
mode = "dry-run"

[[symbols]]
coin = "ETH"
leverage = 5
margin_type = "cross"

[[symbols.strategies]]
name = "breakout"
interval = "15m"
warmup_bars = 423
auto_trading_enabled = true

[guardrails]
max_notional_usd = 5000.0
max_leverage = 5.0
max_open_positions = 2
max_daily_loss_usd = 250.0
max_trades_per_day = 6

[sizing]
mode = "risk"
risk_per_trade_usd = 25.0

[execution]
slippage_bps = 2.0
commission_pct = 0.045
"#;

    #[test]
    fn parses_sample_document() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.mode, TradingMode::DryRun);
        assert_eq!(config.symbols.len(), 1);
        assert_eq!(config.symbols[0].coin, "ETH");
        assert_eq!(
            config.symbols[0].strategies[0].interval(),
            Some(CandleInterval::M15)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn sizing_variants_parse() {
        let risk: Sizing = toml::from_str("mode = \"risk\"\nrisk_per_trade_usd = 10.0").unwrap();
        assert_eq!(
            risk,
            Sizing::Risk {
                risk_per_trade_usd: 10.0
            }
        );
        let cash: Sizing = toml::from_str("mode = \"cash\"\ncash_per_trade = 200.0").unwrap();
        assert_eq!(
            cash,
            Sizing::Cash {
                cash_per_trade: 200.0
            }
        );
    }

    #[test]
    fn risk_sizing_divides_by_stop_distance() {
        let sizing = Sizing::Risk {
            risk_per_trade_usd: 10.0,
        };
        assert!((sizing.compute_size(100.0, 95.0) - 2.0).abs() < 1e-9);
        assert_eq!(sizing.compute_size(100.0, 100.0), 0.0);
    }

    #[test]
    fn cash_sizing_divides_by_entry() {
        let sizing = Sizing::Cash {
            cash_per_trade: 200.0,
        };
        assert!((sizing.compute_size(100.0, 95.0) - 2.0).abs() < 1e-9);
        assert_eq!(sizing.compute_size(0.0, 95.0), 0.0);
    }

    #[test]
    fn validation_rejects_bad_guardrails() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.guardrails.max_open_positions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn execution_defaults() {
        let exec = ExecutionConfig::default();
        assert_eq!(exec.slippage_bps, 2.0);
        assert_eq!(exec.commission_pct, 0.045);
    }
}
