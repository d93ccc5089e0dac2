// =============================================================================
// Sell Planner — decide the next action for the open position
// =============================================================================
//
// A pure function of its inputs: no I/O, no logging, no clock.
//
// Decision order:
//   1. Orders cap:  orders_used >= cap - 1  ->  MarketSell(remaining).
//   2. MARKET:      price >= profit price   ->  MarketSell(remaining)
//                   price <= stop trigger   ->  MarketSell(remaining)
//                   otherwise / no price    ->  Hold
//   3. LIMIT:       limit (or OCO when a stop is set and the pair allows it)
//                   at the profit price, run through the limit adjuster.
//                   An adjusted price under the minimum acceptable price
//                   fails the cycle.
// =============================================================================

use crate::error::{LimitError, TradeError};
use crate::limits::{self, StopLeg, SymbolRules};
use crate::position_engine::{ExitTargets, Position};
use crate::types::SellType;

/// Limit price of the OCO stop leg, relative to its trigger.
pub const STOP_LIMIT_FACTOR: f64 = 0.95;

/// Tolerance when comparing an adjusted price to the acceptable minimum.
const PRICE_EPSILON: f64 = 1e-12;

/// Everything the planner looks at.
#[derive(Debug, Clone, Copy)]
pub struct PlanInput<'a> {
    pub targets: ExitTargets,
    pub entry_price: f64,
    pub current_price: Option<f64>,
    pub remaining: f64,
    pub orders_used: u32,
    pub orders_cap: u32,
    pub rules: &'a SymbolRules,
}

impl<'a> PlanInput<'a> {
    pub fn for_position(
        position: &Position,
        current_price: Option<f64>,
        orders_cap: u32,
        rules: &'a SymbolRules,
    ) -> Self {
        Self {
            targets: position.targets,
            entry_price: position.entry_price,
            current_price,
            remaining: position.remaining_quantity(),
            orders_used: position.orders_used(),
            orders_cap,
            rules,
        }
    }

    fn profit_price(&self) -> f64 {
        self.entry_price * (1.0 + self.targets.profit_pct / 100.0)
    }

    fn stop_trigger_price(&self) -> f64 {
        self.entry_price * (1.0 + self.targets.stop_pct / 100.0)
    }
}

/// Why the planner refused to produce an order.
#[derive(Debug, Clone, PartialEq)]
pub enum FailReason {
    Limits(LimitError),
    BelowMinimumAcceptable {
        target_price: f64,
        achievable_price: f64,
        minimum_price: f64,
    },
}

impl From<FailReason> for TradeError {
    fn from(reason: FailReason) -> Self {
        match reason {
            FailReason::Limits(e) => TradeError::Limits(e),
            FailReason::BelowMinimumAcceptable {
                target_price,
                achievable_price,
                minimum_price,
            } => TradeError::BelowMinimumAcceptable {
                target_price,
                achievable_price,
                minimum_price,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SellDecision {
    Hold,
    MarketSell {
        quantity: f64,
    },
    /// Adjusted limit sell; `stop` is set for an OCO pair.
    LimitSell {
        price: f64,
        stop: Option<StopLeg>,
        quantity: f64,
    },
    Fail(FailReason),
}

impl std::fmt::Display for SellDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hold => write!(f, "Hold"),
            Self::MarketSell { quantity } => write!(f, "MarketSell({quantity})"),
            Self::LimitSell {
                price,
                stop: Some(stop),
                quantity,
            } => write!(
                f,
                "OcoSell({quantity} @ {price}, stop {} / {})",
                stop.trigger_price, stop.limit_price
            ),
            Self::LimitSell {
                price,
                stop: None,
                quantity,
            } => write!(f, "LimitSell({quantity} @ {price})"),
            Self::Fail(reason) => write!(f, "Fail({reason:?})"),
        }
    }
}

/// Decide what to do with the position given the latest price.
pub fn plan(input: &PlanInput<'_>) -> SellDecision {
    if input.orders_used >= input.orders_cap.saturating_sub(1) {
        return SellDecision::MarketSell {
            quantity: input.remaining,
        };
    }

    match input.targets.sell_type {
        SellType::Market => plan_market(input),
        SellType::Limit => plan_limit(input),
    }
}

fn plan_market(input: &PlanInput<'_>) -> SellDecision {
    let Some(price) = input.current_price else {
        return SellDecision::Hold;
    };

    // Profit is checked first.
    if price >= input.profit_price() {
        return SellDecision::MarketSell {
            quantity: input.remaining,
        };
    }
    if input.targets.stop_enabled() && price <= input.stop_trigger_price() {
        return SellDecision::MarketSell {
            quantity: input.remaining,
        };
    }
    SellDecision::Hold
}

fn plan_limit(input: &PlanInput<'_>) -> SellDecision {
    let target_price = input.profit_price();

    let stop = (input.targets.stop_enabled() && input.rules.oco_allowed).then(|| {
        let trigger_price = input.stop_trigger_price();
        StopLeg {
            trigger_price,
            limit_price: trigger_price * STOP_LIMIT_FACTOR,
        }
    });

    let adjusted = match limits::adjust(input.rules, Some(target_price), stop, input.remaining) {
        Ok(adjusted) => adjusted,
        Err(e) => return SellDecision::Fail(FailReason::Limits(e)),
    };
    let achievable_price = adjusted.price.unwrap_or(target_price);

    let minimum_price = input.entry_price * (1.0 + input.targets.min_profit_pct / 100.0);
    if achievable_price + PRICE_EPSILON < minimum_price {
        return SellDecision::Fail(FailReason::BelowMinimumAcceptable {
            target_price,
            achievable_price,
            minimum_price,
        });
    }

    SellDecision::LimitSell {
        price: achievable_price,
        stop: adjusted.stop,
        quantity: adjusted.quantity,
    }
}
