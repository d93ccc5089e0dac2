// =============================================================================
// Position Engine — the single position bought at the start of a cycle
// =============================================================================
//
// Life-cycle:
//   Open  ->  Resting (limit/OCO on the book)  ->  Closed
//   Open  ->  Closed (market sells reduce remaining to zero, or dust write-off)
//
// The position is owned by the monitor alone. Remaining quantity only ever
// goes down, and the position closes the moment it reaches zero.
//
// orders_used counts every order the cycle has sent, starting at 1 for the
// market buy that opened the position.
// =============================================================================

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{Fill, RestingOrder, SellType};

/// Sentinel stop level meaning "no stop-loss".
pub const STOP_DISABLED: f64 = -100.0;

/// Quantity below which a position counts as fully sold.
const QTY_EPSILON: f64 = 1e-12;

// ---------------------------------------------------------------------------
// Exit targets
// ---------------------------------------------------------------------------

/// How and where the position should be sold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitTargets {
    pub sell_type: SellType,
    /// Target gain over entry, in percent.
    pub profit_pct: f64,
    /// Stop level relative to entry, in percent; `STOP_DISABLED` turns it off.
    pub stop_pct: f64,
    /// Lowest gain a LIMIT sell may settle for after exchange capping.
    pub min_profit_pct: f64,
}

impl ExitTargets {
    pub fn stop_enabled(&self) -> bool {
        self.stop_pct > STOP_DISABLED
    }
}

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

/// Current status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Resting,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Resting => write!(f, "Resting"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    /// Volume-weighted average fill price of the buy.
    pub entry_price: f64,
    pub total_quantity: f64,
    pub quote_spent: f64,
    remaining_quantity: f64,
    pub targets: ExitTargets,
    resting_order: Option<RestingOrder>,
    orders_used: u32,
    /// Quote received from sells so far.
    pub realized_quote: f64,
    /// Quantity abandoned below the exchange's smallest sellable step.
    pub dust_quantity: f64,
    pub status: PositionStatus,
    pub opened_at: String,
    #[serde(default)]
    pub closed_at: Option<String>,
}

impl Position {
    /// Open a position from the market buy that filled.
    pub fn open(
        symbol: impl Into<String>,
        base_asset: impl Into<String>,
        quote_asset: impl Into<String>,
        buy: &Fill,
        targets: ExitTargets,
    ) -> Self {
        let pos = Self {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            base_asset: base_asset.into(),
            quote_asset: quote_asset.into(),
            entry_price: buy.avg_price,
            total_quantity: buy.quantity,
            quote_spent: buy.quote_quantity,
            remaining_quantity: buy.quantity,
            targets,
            resting_order: None,
            orders_used: 1,
            realized_quote: 0.0,
            dust_quantity: 0.0,
            status: PositionStatus::Open,
            opened_at: Utc::now().to_rfc3339(),
            closed_at: None,
        };

        info!(
            id = %pos.id,
            symbol = %pos.symbol,
            entry_price = pos.entry_price,
            quantity = pos.total_quantity,
            sell_type = %targets.sell_type,
            profit_pct = targets.profit_pct,
            stop_pct = targets.stop_pct,
            "position opened"
        );
        pos
    }

    // -------------------------------------------------------------------------
    // Derived prices
    // -------------------------------------------------------------------------

    pub fn profit_price(&self) -> f64 {
        self.entry_price * (1.0 + self.targets.profit_pct / 100.0)
    }

    pub fn stop_trigger_price(&self) -> f64 {
        self.entry_price * (1.0 + self.targets.stop_pct / 100.0)
    }

    pub fn min_acceptable_price(&self) -> f64 {
        self.entry_price * (1.0 + self.targets.min_profit_pct / 100.0)
    }

    /// Gain in percent if everything left were sold at `price`.
    pub fn unrealized_pct(&self, price: f64) -> f64 {
        if self.entry_price > 0.0 {
            (price - self.entry_price) / self.entry_price * 100.0
        } else {
            0.0
        }
    }

    /// Gain in percent of the sells executed so far against their cost basis.
    pub fn realized_pct(&self) -> Option<f64> {
        let sold = self.sold_quantity();
        if sold <= QTY_EPSILON || self.entry_price <= 0.0 {
            return None;
        }
        let cost = sold * self.entry_price;
        Some((self.realized_quote - cost) / cost * 100.0)
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn remaining_quantity(&self) -> f64 {
        self.remaining_quantity
    }

    pub fn sold_quantity(&self) -> f64 {
        self.total_quantity - self.remaining_quantity - self.dust_quantity
    }

    pub fn orders_used(&self) -> u32 {
        self.orders_used
    }

    pub fn resting_order(&self) -> Option<RestingOrder> {
        self.resting_order
    }

    pub fn is_terminal(&self) -> bool {
        self.status == PositionStatus::Closed
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Count an order sent to the exchange.
    pub fn record_order(&mut self) {
        self.orders_used += 1;
    }

    /// Apply an executed sell. Quantities beyond what is left are clamped.
    pub fn record_sell(&mut self, quantity: f64, quote_quantity: f64) {
        let applied = quantity.clamp(0.0, self.remaining_quantity);
        if applied < quantity {
            warn!(
                id = %self.id,
                reported = quantity,
                remaining = self.remaining_quantity,
                "sell larger than remaining quantity, clamped"
            );
        }
        self.remaining_quantity -= applied;
        self.realized_quote += quote_quantity.max(0.0);

        if self.remaining_quantity <= QTY_EPSILON {
            self.remaining_quantity = 0.0;
            self.close("sold");
        }
    }

    /// Track the single resting sell, handing back any order it replaces.
    pub fn set_resting(&mut self, order: RestingOrder) -> Option<RestingOrder> {
        let replaced = self.resting_order.replace(order);
        self.status = PositionStatus::Resting;
        replaced
    }

    /// Forget the resting order once it was filled or cancelled.
    pub fn clear_resting(&mut self) -> Option<RestingOrder> {
        let order = self.resting_order.take();
        if self.status == PositionStatus::Resting {
            self.status = PositionStatus::Open;
        }
        order
    }

    /// Give up on a remainder too small to sell.
    pub fn write_off_dust(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.dust_quantity += self.remaining_quantity;
        info!(id = %self.id, dust = self.remaining_quantity, "remaining quantity written off as dust");
        self.remaining_quantity = 0.0;
        self.close("dust");
    }

    fn close(&mut self, reason: &str) {
        self.resting_order = None;
        self.status = PositionStatus::Closed;
        self.closed_at = Some(Utc::now().to_rfc3339());
        info!(
            id = %self.id,
            reason,
            realized_quote = self.realized_quote,
            realized_pct = self.realized_pct().unwrap_or_default(),
            "position closed"
        );
    }
}
