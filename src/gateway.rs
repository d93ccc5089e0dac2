// =============================================================================
// Exchange Gateway — the port between the sell engine and an exchange
// =============================================================================
//
// The engine only talks to the exchange through this trait. `BinanceGateway`
// implements it against the live REST + WebSocket APIs; tests use an
// in-memory stub with scripted responses.
//
// Every call either succeeds or returns a `GatewayError`. Implementations do
// not retry rejected orders.
// =============================================================================

use std::collections::BTreeSet;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::GatewayError;
use crate::limits::{StopLeg, SymbolRules};
use crate::types::{Fill, PriceEvent, RestingOrder};

/// Result of cancelling a resting order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CancelOutcome {
    /// The order was cancelled after `Execution` had already filled.
    Cancelled(Execution),
    /// The exchange no longer knows the order: it already filled.
    AlreadyFilled,
}

/// Base and quote amounts executed against a resting order so far.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Execution {
    pub executed_qty: f64,
    pub quote_qty: f64,
}

impl std::ops::AddAssign for Execution {
    fn add_assign(&mut self, rhs: Self) {
        self.executed_qty += rhs.executed_qty;
        self.quote_qty += rhs.quote_qty;
    }
}

/// Exchange-side state of a resting order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderStatus {
    /// Still on the book, possibly partially filled.
    Open(Execution),
    /// Completely filled.
    Filled(Execution),
    /// Cancelled, expired or rejected outside of this engine.
    Closed(Execution),
}

impl OrderStatus {
    pub fn execution(&self) -> Execution {
        match *self {
            Self::Open(exec) | Self::Filled(exec) | Self::Closed(exec) => exec,
        }
    }
}

#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Market-buy `symbol` spending `quote_amount` of the quote asset.
    async fn market_buy(&self, symbol: &str, quote_amount: f64) -> Result<Fill, GatewayError>;

    /// Market-sell `quantity` of the base asset.
    async fn market_sell(&self, symbol: &str, quantity: f64) -> Result<Fill, GatewayError>;

    /// Rest a GTC limit sell, returning the order id.
    async fn place_limit_sell(
        &self,
        symbol: &str,
        price: f64,
        quantity: f64,
    ) -> Result<RestingOrder, GatewayError>;

    /// Rest an OCO sell (take-profit limit + stop-limit), returning the list id.
    async fn place_oco_sell(
        &self,
        symbol: &str,
        price: f64,
        stop: StopLeg,
        quantity: f64,
    ) -> Result<RestingOrder, GatewayError>;

    async fn cancel_order(
        &self,
        symbol: &str,
        order: RestingOrder,
    ) -> Result<CancelOutcome, GatewayError>;

    async fn order_status(
        &self,
        symbol: &str,
        order: RestingOrder,
    ) -> Result<OrderStatus, GatewayError>;

    /// Trading rules for `symbol`, with percent-price bands resolved against
    /// the current average price.
    async fn symbol_rules(&self, symbol: &str) -> Result<SymbolRules, GatewayError>;

    /// Base assets that can be market-bought with `quote`.
    async fn tradable_bases(&self, quote: &str) -> Result<BTreeSet<String>, GatewayError>;

    async fn free_balance(&self, asset: &str) -> Result<f64, GatewayError>;

    async fn last_price(&self, symbol: &str) -> Result<f64, GatewayError>;

    /// Subscribe to last-traded prices. The receiver closes when the feed
    /// gives up resubscribing.
    async fn subscribe_price(
        &self,
        symbol: &str,
    ) -> Result<mpsc::Receiver<PriceEvent>, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_is_reported_for_every_status() {
        let exec = Execution {
            executed_qty: 2.0,
            quote_qty: 0.5,
        };
        assert_eq!(OrderStatus::Open(exec).execution(), exec);
        assert_eq!(OrderStatus::Filled(exec).execution(), exec);
        assert_eq!(OrderStatus::Closed(exec).execution(), exec);
    }

    #[test]
    fn executions_accumulate() {
        let mut total = Execution::default();
        total += Execution {
            executed_qty: 1.0,
            quote_qty: 2.0,
        };
        total += Execution {
            executed_qty: 0.5,
            quote_qty: 1.5,
        };
        assert_eq!(total.executed_qty, 1.5);
        assert_eq!(total.quote_qty, 3.5);
    }
}
