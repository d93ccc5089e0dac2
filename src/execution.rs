// =============================================================================
// Execution Engine — pre-trade checks and the opening market buy
// =============================================================================
//
// Everything that happens before a position exists: confirming the pair can
// be bought with a quote amount, deciding how much quote to spend, and sending
// the market buy. A failure here means no order reached the exchange, except
// for a rejected buy which is reported verbatim.
// =============================================================================

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{GatewayError, TradeError};
use crate::gateway::ExchangeGateway;
use crate::position_engine::{ExitTargets, Position};
use crate::runtime_config::TradeConfig;
use crate::types::{fmt_decimal, Fill};

/// USD-pegged quote assets used to value a fixed USD amount.
const USD_QUOTES: [&str; 2] = ["USDT", "BUSD"];

/// The pair chosen for the cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradingPair {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
}

impl TradingPair {
    pub fn new(base: &str, quote: &str) -> Self {
        let base_asset = base.trim().to_uppercase();
        let quote_asset = quote.trim().to_uppercase();
        Self {
            symbol: format!("{base_asset}{quote_asset}"),
            base_asset,
            quote_asset,
        }
    }
}

impl std::fmt::Display for TradingPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.base_asset, self.quote_asset)
    }
}

pub struct ExecutionEngine {
    gateway: Arc<dyn ExchangeGateway>,
}

impl ExecutionEngine {
    pub fn new(gateway: Arc<dyn ExchangeGateway>) -> Self {
        Self { gateway }
    }

    /// Confirm `base` can be market-bought with a quote amount of `quote`.
    pub async fn select_pair(&self, base: &str, quote: &str) -> Result<TradingPair, TradeError> {
        let pair = TradingPair::new(base, quote);
        let bases = self.gateway.tradable_bases(&pair.quote_asset).await?;
        if bases.is_empty() {
            return Err(TradeError::InvalidPair(format!(
                "no tradable pairs quoted in {}",
                pair.quote_asset
            )));
        }
        if !bases.contains(&pair.base_asset) {
            return Err(TradeError::InvalidPair(format!(
                "{pair} is not available for quote-amount market buys"
            )));
        }
        debug!(pair = %pair, "trading pair confirmed");
        Ok(pair)
    }

    /// How much of the quote asset the buy spends.
    pub async fn resolve_quote_amount(&self, config: &TradeConfig) -> Result<f64, TradeError> {
        let quote = config.quote_coin.to_uppercase();
        let free = self.gateway.free_balance(&quote).await?;
        info!(asset = %quote, free = %fmt_decimal(free, 8), "free quote balance");

        let amount = match config.usd_value.filter(|usd| *usd > 0.0) {
            Some(usd) => {
                let price = self.quote_usd_price(&quote).await?;
                let amount = usd / price;
                info!(usd, price, amount = %fmt_decimal(amount, 8), "USD value converted to quote amount");
                amount
            }
            None => config.buy_pct / 100.0 * free,
        };

        if amount <= 0.0 || !amount.is_finite() {
            return Err(TradeError::InvalidConfiguration(format!(
                "cannot spend a non-positive amount of {quote}"
            )));
        }
        if amount > free {
            return Err(TradeError::InsufficientBalance {
                asset: quote,
                required: amount,
                available: free,
            });
        }
        Ok(amount)
    }

    /// Price of one unit of `quote` in USD.
    async fn quote_usd_price(&self, quote: &str) -> Result<f64, TradeError> {
        if USD_QUOTES.contains(&quote) {
            return Ok(1.0);
        }
        for usd in USD_QUOTES {
            let symbol = format!("{quote}{usd}");
            match self.gateway.last_price(&symbol).await {
                Ok(price) if price > 0.0 => return Ok(price),
                Ok(_) => {}
                Err(GatewayError::Rejected { .. }) => {
                    debug!(symbol = %symbol, "no USD pair, trying next");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(TradeError::InvalidConfiguration(format!(
            "no USDT or BUSD pair to value {quote} in USD"
        )))
    }

    /// Market-buy `pair` for `quote_amount` and open the position.
    pub async fn buy(
        &self,
        pair: &TradingPair,
        quote_amount: f64,
        targets: ExitTargets,
    ) -> Result<Position, TradeError> {
        info!(
            pair = %pair,
            quote_amount = %fmt_decimal(quote_amount, 8),
            "sending market buy"
        );
        let fill: Fill = self.gateway.market_buy(&pair.symbol, quote_amount).await?;
        if fill.quantity <= 0.0 {
            return Err(TradeError::ExchangeRejected(format!(
                "market buy of {pair} executed nothing"
            )));
        }

        info!(
            pair = %pair,
            quantity = %fmt_decimal(fill.quantity, 8),
            spent = %fmt_decimal(fill.quote_quantity, 8),
            avg_price = %fmt_decimal(fill.avg_price, 8),
            "market buy filled"
        );
        if fill.quote_quantity + 1e-12 < quote_amount {
            warn!(
                requested = quote_amount,
                spent = fill.quote_quantity,
                "market buy spent less than requested"
            );
        }

        Ok(Position::open(
            &pair.symbol,
            &pair.base_asset,
            &pair.quote_asset,
            &fill,
            targets,
        ))
    }
}
