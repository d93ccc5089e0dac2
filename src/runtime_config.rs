// =============================================================================
// Trade Configuration — parameters for a single buy/sell cycle
// =============================================================================
//
// Resolved once at startup: JSON file first, then environment overrides, then
// validation. Nothing reads the configuration after the cycle has started.
//
// All fields carry `#[serde(default)]` so a partial (or empty) file is valid.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::TradeError;
use crate::exit::monitor::MonitorSettings;
use crate::market_data::FeedSettings;
use crate::position_engine::{ExitTargets, STOP_DISABLED};
use crate::types::SellType;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "QUICKFLIP_CONFIG";

/// Config file used when `QUICKFLIP_CONFIG` is not set.
pub const DEFAULT_CONFIG_PATH: &str = "quickflip.json";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_quote_coin() -> String {
    "BTC".to_string()
}

fn default_buy_pct() -> f64 {
    100.0
}

fn default_profit_pct() -> f64 {
    10.0
}

fn default_stop_pct() -> f64 {
    STOP_DISABLED
}

fn default_orders_cap() -> u32 {
    91
}

fn default_fill_poll_ms() -> u64 {
    2000
}

fn default_max_stream_reconnects() -> u32 {
    5
}

fn default_stream_reconnect_delay_ms() -> u64 {
    1000
}

fn default_rest_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_ws_url() -> String {
    "wss://stream.binance.com:9443".to_string()
}

// =============================================================================
// TradeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeConfig {
    // --- What to trade -------------------------------------------------------

    /// Asset spent on the buy.
    #[serde(default = "default_quote_coin")]
    pub quote_coin: String,

    /// Asset bought; read from stdin when absent.
    #[serde(default)]
    pub base_coin: Option<String>,

    /// Share of the free quote balance to spend, in percent.
    #[serde(default = "default_buy_pct")]
    pub buy_pct: f64,

    /// Fixed amount to spend, in USD. Takes precedence over `buy_pct`.
    #[serde(default)]
    pub usd_value: Option<f64>,

    // --- How to sell ---------------------------------------------------------

    #[serde(default = "default_profit_pct")]
    pub profit_pct: f64,

    /// Stop level relative to entry; -100 disables the stop.
    #[serde(default = "default_stop_pct")]
    pub stop_pct: f64,

    /// Lowest gain a capped LIMIT sell may settle for.
    #[serde(default)]
    pub min_profit_pct: f64,

    #[serde(default)]
    pub sell_type: SellType,

    /// Market-sell everything on the first Ctrl-C.
    #[serde(default = "default_true")]
    pub bailout: bool,

    // --- Engine limits -------------------------------------------------------

    /// Total orders per cycle, the buy included.
    #[serde(default = "default_orders_cap")]
    pub orders_cap: u32,

    #[serde(default = "default_fill_poll_ms")]
    pub fill_poll_ms: u64,

    #[serde(default = "default_max_stream_reconnects")]
    pub max_stream_reconnects: u32,

    #[serde(default = "default_stream_reconnect_delay_ms")]
    pub stream_reconnect_delay_ms: u64,

    // --- Endpoints -----------------------------------------------------------

    #[serde(default = "default_rest_url")]
    pub rest_url: String,

    #[serde(default = "default_ws_url")]
    pub ws_url: String,
}

impl Default for TradeConfig {
    fn default() -> Self {
        Self {
            quote_coin: default_quote_coin(),
            base_coin: None,
            buy_pct: default_buy_pct(),
            usd_value: None,
            profit_pct: default_profit_pct(),
            stop_pct: default_stop_pct(),
            min_profit_pct: 0.0,
            sell_type: SellType::default(),
            bailout: true,
            orders_cap: default_orders_cap(),
            fill_poll_ms: default_fill_poll_ms(),
            max_stream_reconnects: default_max_stream_reconnects(),
            stream_reconnect_delay_ms: default_stream_reconnect_delay_ms(),
            rest_url: default_rest_url(),
            ws_url: default_ws_url(),
        }
    }
}

impl TradeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read trade config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse trade config from {}", path.display()))?;

        info!(
            path = %path.display(),
            quote_coin = %config.quote_coin,
            sell_type = %config.sell_type,
            "trade config loaded"
        );

        Ok(config)
    }

    /// Apply `QUICKFLIP_*` overrides. `lookup` is `std::env::var` in
    /// production.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("QUICKFLIP_QUOTE_COIN") {
            self.quote_coin = v.to_uppercase();
        }
        if let Some(v) = get("QUICKFLIP_BASE_COIN") {
            self.base_coin = Some(v.to_uppercase());
        }
        if let Some(v) = get("QUICKFLIP_BUY_PCT") {
            self.buy_pct = parse_env("QUICKFLIP_BUY_PCT", &v)?;
        }
        if let Some(v) = get("QUICKFLIP_USD_VALUE") {
            self.usd_value = Some(parse_env("QUICKFLIP_USD_VALUE", &v)?);
        }
        if let Some(v) = get("QUICKFLIP_PROFIT_PCT") {
            self.profit_pct = parse_env("QUICKFLIP_PROFIT_PCT", &v)?;
        }
        if let Some(v) = get("QUICKFLIP_STOP_PCT") {
            self.stop_pct = parse_env("QUICKFLIP_STOP_PCT", &v)?;
        }
        if let Some(v) = get("QUICKFLIP_MIN_PROFIT_PCT") {
            self.min_profit_pct = parse_env("QUICKFLIP_MIN_PROFIT_PCT", &v)?;
        }
        if let Some(v) = get("QUICKFLIP_SELL_TYPE") {
            self.sell_type = v
                .parse()
                .map_err(|e: String| anyhow::anyhow!("QUICKFLIP_SELL_TYPE: {e}"))?;
        }
        if let Some(v) = get("QUICKFLIP_BAILOUT") {
            self.bailout = match v.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => anyhow::bail!("QUICKFLIP_BAILOUT: expected a boolean, got '{other}'"),
            };
        }
        Ok(())
    }

    /// Reject configurations the engine cannot run with. Nothing has been
    /// sent to the exchange when this fails.
    pub fn validate(&self) -> Result<(), TradeError> {
        let invalid = |msg: String| Err(TradeError::InvalidConfiguration(msg));

        if self.quote_coin.trim().is_empty() {
            return invalid("quote coin is empty".into());
        }
        if !(STOP_DISABLED..self.profit_pct).contains(&self.stop_pct) {
            return invalid(format!(
                "stop level {}% must be in [-100, profit target {}%)",
                self.stop_pct, self.profit_pct
            ));
        }
        if !(self.buy_pct > 0.0 && self.buy_pct <= 100.0) {
            return invalid(format!("buy percentage {} must be in (0, 100]", self.buy_pct));
        }
        if let Some(usd) = self.usd_value {
            if usd < 0.0 || !usd.is_finite() {
                return invalid(format!("USD value {usd} must not be negative"));
            }
        }
        if self.min_profit_pct > self.profit_pct {
            return invalid(format!(
                "minimum profit {}% exceeds the profit target {}%",
                self.min_profit_pct, self.profit_pct
            ));
        }
        if self.orders_cap < 2 {
            return invalid(format!(
                "orders cap {} leaves no room for a sell after the buy",
                self.orders_cap
            ));
        }
        Ok(())
    }

    pub fn exit_targets(&self) -> ExitTargets {
        ExitTargets {
            sell_type: self.sell_type,
            profit_pct: self.profit_pct,
            stop_pct: self.stop_pct,
            min_profit_pct: self.min_profit_pct,
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            orders_cap: self.orders_cap,
            fill_poll_interval: Duration::from_millis(self.fill_poll_ms),
        }
    }

    pub fn feed_settings(&self) -> FeedSettings {
        FeedSettings {
            max_reconnects: self.max_stream_reconnects,
            reconnect_delay: Duration::from_millis(self.stream_reconnect_delay_ms),
        }
    }
}

fn parse_env(key: &str, value: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .with_context(|| format!("{key}: '{value}' is not a number"))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config_has_expected_values() {
        let cfg = TradeConfig::default();
        assert_eq!(cfg.quote_coin, "BTC");
        assert_eq!(cfg.buy_pct, 100.0);
        assert_eq!(cfg.profit_pct, 10.0);
        assert_eq!(cfg.stop_pct, -100.0);
        assert_eq!(cfg.sell_type, SellType::Limit);
        assert!(cfg.bailout);
        assert_eq!(cfg.orders_cap, 91);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: TradeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.quote_coin, "BTC");
        assert_eq!(cfg.fill_poll_ms, 2000);
        assert_eq!(cfg.max_stream_reconnects, 5);
        assert!(cfg.base_coin.is_none());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "quote_coin": "USDT", "sell_type": "MARKET", "stop_pct": -5 }"#;
        let cfg: TradeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.quote_coin, "USDT");
        assert_eq!(cfg.sell_type, SellType::Market);
        assert_eq!(cfg.stop_pct, -5.0);
        assert_eq!(cfg.profit_pct, 10.0);
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut cfg = TradeConfig::default();
        cfg.apply_env_overrides(env(&[
            ("QUICKFLIP_BASE_COIN", " abc "),
            ("QUICKFLIP_PROFIT_PCT", "25"),
            ("QUICKFLIP_SELL_TYPE", "market"),
            ("QUICKFLIP_BAILOUT", "no"),
            ("QUICKFLIP_USD_VALUE", ""),
        ]))
        .unwrap();

        assert_eq!(cfg.base_coin.as_deref(), Some("ABC"));
        assert_eq!(cfg.profit_pct, 25.0);
        assert_eq!(cfg.sell_type, SellType::Market);
        assert!(!cfg.bailout);
        assert!(cfg.usd_value.is_none());
    }

    #[test]
    fn malformed_env_override_is_an_error() {
        let mut cfg = TradeConfig::default();
        assert!(cfg
            .apply_env_overrides(env(&[("QUICKFLIP_STOP_PCT", "ten")]))
            .is_err());
        assert!(cfg
            .apply_env_overrides(env(&[("QUICKFLIP_SELL_TYPE", "HYBRID")]))
            .is_err());
    }

    #[test]
    fn validation_rejects_bad_amounts_and_cap() {
        let mut cfg = TradeConfig::default();
        cfg.buy_pct = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = TradeConfig::default();
        cfg.usd_value = Some(-1.0);
        assert!(cfg.validate().is_err());

        let mut cfg = TradeConfig::default();
        cfg.orders_cap = 1;
        assert!(cfg.validate().is_err());

        let mut cfg = TradeConfig::default();
        cfg.stop_pct = -100.5;
        assert!(cfg.validate().is_err());
    }

    proptest! {
        #[test]
        fn stop_below_profit_is_always_valid(
            profit in -50.0f64..500.0,
            gap in 0.001f64..100.0,
        ) {
            let mut cfg = TradeConfig::default();
            cfg.profit_pct = profit;
            cfg.stop_pct = (profit - gap).max(-100.0);
            cfg.min_profit_pct = profit.min(0.0);
            prop_assume!(cfg.stop_pct < cfg.profit_pct);
            prop_assert!(cfg.validate().is_ok());
        }

        #[test]
        fn stop_at_or_above_profit_is_always_rejected(
            profit in -50.0f64..500.0,
            excess in 0.0f64..100.0,
        ) {
            let mut cfg = TradeConfig::default();
            cfg.profit_pct = profit;
            cfg.stop_pct = profit + excess;
            let rejected = matches!(cfg.validate(), Err(TradeError::InvalidConfiguration(_)));
            prop_assert!(rejected);
        }
    }
}
