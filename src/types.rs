// =============================================================================
// Shared types used across the quickflip trading cycle
// =============================================================================

use serde::{Deserialize, Serialize};

/// How the bought position is liquidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SellType {
    /// Watch the trade stream and market-sell once profit or stop is hit.
    Market,
    /// Rest a limit (or OCO) order on the book right after the buy.
    Limit,
}

impl Default for SellType {
    fn default() -> Self {
        Self::Limit
    }
}

impl std::fmt::Display for SellType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
        }
    }
}

impl std::str::FromStr for SellType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "MARKET" => Ok(Self::Market),
            "LIMIT" => Ok(Self::Limit),
            other => Err(format!("unknown sell type '{other}' (expected LIMIT or MARKET)")),
        }
    }
}

/// Result of a market order that reached the book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    /// Executed base quantity.
    pub quantity: f64,
    /// Quote quantity spent (buy) or received (sell).
    pub quote_quantity: f64,
    /// Volume-weighted average fill price.
    pub avg_price: f64,
}

/// Which cancel/query endpoint a resting order belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Limit,
    Oco,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limit => write!(f, "LIMIT"),
            Self::Oco => write!(f, "OCO"),
        }
    }
}

/// A limit or OCO sell accepted by the exchange and not yet filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestingOrder {
    /// `orderId` for plain limits, `orderListId` for OCO lists.
    pub id: u64,
    pub kind: OrderKind,
}

impl std::fmt::Display for RestingOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} #{}", self.kind, self.id)
    }
}

/// A single last-traded price observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub price: f64,
    /// Exchange trade time in milliseconds.
    pub trade_time_ms: i64,
}

/// Events delivered by the price feed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PriceEvent {
    Tick(PriceTick),
    /// The feed lost its connection and is resubscribing.
    Disrupted { attempt: u32 },
}

/// Format a float with up to `decimals` places and trailing zeros stripped,
/// the way Binance expects numeric query parameters.
pub fn fmt_decimal(value: f64, decimals: usize) -> String {
    let s = format!("{value:.decimals$}");
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    }
}
