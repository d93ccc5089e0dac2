// =============================================================================
// exchangeInfo parsing — symbol metadata and trading filters
// =============================================================================
//
// Binance encodes every numeric filter value as a decimal string and uses
// "0.00000000" to mean "no limit". Percent-price bands are relative to the
// 5-minute average price, so they are folded into the absolute price bounds
// at fetch time with a 5% safety margin on each side.
// =============================================================================

use serde::{Deserialize, Deserializer};

use crate::limits::{LotSize, SymbolRules};

/// Safety margin applied to percent-price multipliers.
const PERCENT_PRICE_MARGIN: f64 = 0.05;

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfo {
    #[serde(default)]
    pub symbols: Vec<SymbolInfo>,
}

/// One entry of `exchangeInfo.symbols`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
    #[serde(default)]
    pub oco_allowed: bool,
    #[serde(default)]
    pub is_spot_trading_allowed: bool,
    #[serde(default)]
    pub quote_order_qty_market_allowed: bool,
    #[serde(default)]
    pub filters: Vec<SymbolFilter>,
}

/// The subset of symbol filters that constrain a sell.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "filterType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SymbolFilter {
    #[serde(rename_all = "camelCase")]
    PriceFilter {
        #[serde(deserialize_with = "de_f64")]
        min_price: f64,
        #[serde(deserialize_with = "de_f64")]
        max_price: f64,
        #[serde(deserialize_with = "de_f64")]
        tick_size: f64,
    },
    #[serde(rename_all = "camelCase")]
    PercentPrice {
        #[serde(deserialize_with = "de_f64")]
        multiplier_up: f64,
        #[serde(deserialize_with = "de_f64")]
        multiplier_down: f64,
    },
    #[serde(rename_all = "camelCase")]
    PercentPriceBySide {
        #[serde(deserialize_with = "de_f64")]
        ask_multiplier_up: f64,
        #[serde(deserialize_with = "de_f64")]
        ask_multiplier_down: f64,
    },
    #[serde(rename_all = "camelCase")]
    LotSize {
        #[serde(deserialize_with = "de_f64")]
        min_qty: f64,
        #[serde(deserialize_with = "de_f64")]
        max_qty: f64,
        #[serde(deserialize_with = "de_f64")]
        step_size: f64,
    },
    #[serde(rename_all = "camelCase")]
    MarketLotSize {
        #[serde(deserialize_with = "de_f64")]
        min_qty: f64,
        #[serde(deserialize_with = "de_f64")]
        max_qty: f64,
        #[serde(deserialize_with = "de_f64")]
        step_size: f64,
    },
    #[serde(rename_all = "camelCase")]
    MinNotional {
        #[serde(deserialize_with = "de_f64")]
        min_notional: f64,
        #[serde(default)]
        apply_to_market: bool,
    },
    #[serde(rename_all = "camelCase")]
    Notional {
        #[serde(deserialize_with = "de_f64")]
        min_notional: f64,
        #[serde(default)]
        apply_min_to_market: bool,
    },
    #[serde(other)]
    Other,
}

impl SymbolInfo {
    /// Whether the pair can be market-bought with a quote amount for `quote`.
    pub fn is_tradable_against(&self, quote: &str) -> bool {
        self.status == "TRADING"
            && self.is_spot_trading_allowed
            && self.quote_order_qty_market_allowed
            && self.quote_asset == quote
    }

    /// Build sell rules, folding percent-price bands around `avg_price`.
    pub fn to_rules(&self, avg_price: Option<f64>) -> SymbolRules {
        let mut rules =
            SymbolRules::unrestricted(&self.symbol, &self.base_asset, &self.quote_asset);
        rules.oco_allowed = self.oco_allowed;

        let mut band: Option<(f64, f64)> = None;

        for filter in &self.filters {
            match *filter {
                SymbolFilter::PriceFilter {
                    min_price,
                    max_price,
                    tick_size,
                } => {
                    rules.min_price = min_price;
                    rules.max_price = unlimited_if_zero(max_price);
                    rules.tick_size = tick_size;
                }
                SymbolFilter::PercentPrice {
                    multiplier_up,
                    multiplier_down,
                } => {
                    if band.is_none() {
                        band = Some((multiplier_down, multiplier_up));
                    }
                }
                // Sells rest on the ask side; the by-side band wins.
                SymbolFilter::PercentPriceBySide {
                    ask_multiplier_up,
                    ask_multiplier_down,
                } => {
                    band = Some((ask_multiplier_down, ask_multiplier_up));
                }
                SymbolFilter::LotSize {
                    min_qty,
                    max_qty,
                    step_size,
                } => {
                    rules.lot = LotSize {
                        min_qty,
                        max_qty: unlimited_if_zero(max_qty),
                        step_size,
                    };
                }
                SymbolFilter::MarketLotSize {
                    min_qty,
                    max_qty,
                    step_size,
                } => {
                    // Binance reports a zero step when market orders follow LOT_SIZE.
                    if step_size > 0.0 || min_qty > 0.0 {
                        rules.market_lot = Some(LotSize {
                            min_qty,
                            max_qty: unlimited_if_zero(max_qty),
                            step_size,
                        });
                    }
                }
                SymbolFilter::MinNotional {
                    min_notional,
                    apply_to_market,
                } => {
                    rules.min_notional = min_notional;
                    rules.notional_applies_to_market = apply_to_market;
                }
                SymbolFilter::Notional {
                    min_notional,
                    apply_min_to_market,
                } => {
                    rules.min_notional = min_notional;
                    rules.notional_applies_to_market = apply_min_to_market;
                }
                SymbolFilter::Other => {}
            }
        }

        if let (Some(avg), Some((down, up))) = (avg_price, band) {
            if avg > 0.0 {
                rules.min_price = rules
                    .min_price
                    .max(avg * down * (1.0 + PERCENT_PRICE_MARGIN));
                rules.max_price = rules.max_price.min(avg * up * (1.0 - PERCENT_PRICE_MARGIN));
            }
        }

        rules
    }
}

fn unlimited_if_zero(value: f64) -> f64 {
    if value > 0.0 {
        value
    } else {
        f64::INFINITY
    }
}

/// Deserialize a decimal that Binance may send as a string or a number.
fn de_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StrOrNum {
        Str(String),
        Num(f64),
    }

    match StrOrNum::deserialize(deserializer)? {
        StrOrNum::Str(s) => s.parse::<f64>().map_err(serde::de::Error::custom),
        StrOrNum::Num(n) => Ok(n),
    }
}
