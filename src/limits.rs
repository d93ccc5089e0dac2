// =============================================================================
// Limit Adjuster — fit order prices and quantities to exchange filters
// =============================================================================
//
// Rules applied to every sell request:
//   - Quantity is floored to the lot step, capped at the lot maximum, and
//     rejected when the floored value is below the lot minimum.
//   - Prices are capped at the exchange ceiling, floored to the tick, and
//     raised to the floor price when they would fall below it.
//   - price x quantity of the lowest-priced leg must reach the minimum
//     notional.
//
// All rounding goes through `round_dp` at the step's own precision, so running
// the adjuster on its own output returns the same values.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::LimitError;

/// Tolerance for float division before flooring/ceiling to a step.
const STEP_EPSILON: f64 = 1e-9;

/// Decimal places used when a filter has no step (step size of zero).
const DEFAULT_DECIMALS: usize = 8;

/// Grid used when a filter has no step: the finest Binance precision.
const DEFAULT_STEP: f64 = 1e-8;

/// Margin added around the notional-derived minimum quantity.
const NOTIONAL_SAFETY: f64 = 1.05;

/// Fraction of a quantity bound considered "near" the limit.
const NEAR_LIMIT_FRACTION: f64 = 0.10;

// =============================================================================
// SymbolRules
// =============================================================================

/// Quantity bounds from a `LOT_SIZE` or `MARKET_LOT_SIZE` filter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LotSize {
    pub min_qty: f64,
    pub max_qty: f64,
    /// Zero when the exchange imposes no step.
    pub step_size: f64,
}

impl Default for LotSize {
    fn default() -> Self {
        Self {
            min_qty: 0.0,
            max_qty: f64::INFINITY,
            step_size: 0.0,
        }
    }
}

/// Exchange-imposed order constraints for one trading pair.
///
/// Fetched once after the buy fills and never mutated afterwards. The price
/// bounds already include any percent-price band derived from the average
/// price at fetch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolRules {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub min_price: f64,
    pub max_price: f64,
    /// Zero when the exchange imposes no tick.
    pub tick_size: f64,
    pub lot: LotSize,
    /// Separate bounds for market orders, when the pair defines them.
    pub market_lot: Option<LotSize>,
    pub min_notional: f64,
    /// Whether the minimum notional also binds market orders.
    pub notional_applies_to_market: bool,
    pub oco_allowed: bool,
}

impl SymbolRules {
    /// Rules with no constraints beyond the pair identity.
    pub fn unrestricted(
        symbol: impl Into<String>,
        base_asset: impl Into<String>,
        quote_asset: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            base_asset: base_asset.into(),
            quote_asset: quote_asset.into(),
            min_price: 0.0,
            max_price: f64::INFINITY,
            tick_size: 0.0,
            lot: LotSize::default(),
            market_lot: None,
            min_notional: 0.0,
            notional_applies_to_market: false,
            oco_allowed: true,
        }
    }

    /// Quantity bounds that apply to market orders.
    pub fn market_lot(&self) -> &LotSize {
        self.market_lot.as_ref().unwrap_or(&self.lot)
    }

    /// Fit a sell price into `[min_price, max_price]` on the tick grid.
    pub fn adjust_price(&self, price: f64) -> f64 {
        let capped = floor_to_step(price.min(self.max_price), self.tick_size);
        if capped < self.min_price {
            ceil_to_step(self.min_price, self.tick_size)
        } else {
            capped
        }
    }

    /// Lower and upper sellable quantity at `price`, folding the minimum
    /// notional into the lower bound.
    pub fn quantity_bounds(&self, price: f64, market: bool) -> (f64, f64) {
        let lot = if market { self.market_lot() } else { &self.lot };
        let notional_applies = !market || self.notional_applies_to_market;
        let notional_min = if notional_applies && price > 0.0 {
            self.min_notional / price * NOTIONAL_SAFETY
        } else {
            0.0
        };
        (lot.min_qty.max(notional_min), lot.max_qty)
    }

    /// True when `quantity` sits within 10% of either quantity bound, where
    /// price moves may make the sell impossible.
    pub fn is_near_quantity_limits(&self, quantity: f64, price: f64, market: bool) -> bool {
        let (low, high) = self.quantity_bounds(price, market);
        quantity < low * (1.0 + NEAR_LIMIT_FRACTION) || quantity > high * (1.0 - NEAR_LIMIT_FRACTION)
    }
}

// =============================================================================
// Adjusted order parameters
// =============================================================================

/// Stop-loss leg of an OCO sell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StopLeg {
    /// Price at which the stop order triggers.
    pub trigger_price: f64,
    /// Limit price of the order placed once triggered.
    pub limit_price: f64,
}

/// Order parameters that satisfy the symbol's filters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdjustedOrder {
    pub price: Option<f64>,
    pub stop: Option<StopLeg>,
    pub quantity: f64,
}

/// Adjust a limit/OCO sell request to the symbol's filters.
pub fn adjust(
    rules: &SymbolRules,
    price: Option<f64>,
    stop: Option<StopLeg>,
    quantity: f64,
) -> Result<AdjustedOrder, LimitError> {
    let quantity = adjust_quantity(&rules.lot, quantity)?;
    let price = price.map(|p| rules.adjust_price(p));
    let stop = stop.map(|leg| StopLeg {
        trigger_price: rules.adjust_price(leg.trigger_price),
        limit_price: rules.adjust_price(leg.limit_price),
    });

    // Each leg is its own order on the exchange; the cheapest one decides.
    let lowest = price
        .into_iter()
        .chain(stop.map(|leg| leg.limit_price))
        .fold(f64::INFINITY, f64::min);
    if lowest.is_finite() {
        check_notional(rules.min_notional, lowest, quantity)?;
    }

    Ok(AdjustedOrder {
        price,
        stop,
        quantity,
    })
}

/// Adjust a market sell quantity. `reference_price` is the last traded price,
/// used for the notional check when the exchange applies it to market orders.
pub fn adjust_market(
    rules: &SymbolRules,
    reference_price: f64,
    quantity: f64,
) -> Result<f64, LimitError> {
    let quantity = adjust_quantity(rules.market_lot(), quantity)?;
    if rules.notional_applies_to_market && reference_price > 0.0 {
        check_notional(rules.min_notional, reference_price, quantity)?;
    }
    Ok(quantity)
}

fn adjust_quantity(lot: &LotSize, quantity: f64) -> Result<f64, LimitError> {
    let floored = floor_to_step(quantity, lot.step_size);
    if floored <= 0.0 || floored + 1e-12 < lot.min_qty {
        return Err(LimitError::QuantityTooSmall {
            quantity,
            min_quantity: lot.min_qty,
        });
    }
    Ok(floored.min(floor_to_step(lot.max_qty, lot.step_size)))
}

fn check_notional(min_notional: f64, price: f64, quantity: f64) -> Result<(), LimitError> {
    let notional = price * quantity;
    if notional + 1e-12 < min_notional {
        return Err(LimitError::NotionalTooSmall {
            notional,
            min_notional,
        });
    }
    Ok(())
}

// =============================================================================
// Step arithmetic
// =============================================================================

/// Number of decimal places needed to express `step` exactly.
pub fn step_decimals(step: f64) -> usize {
    if step <= 0.0 || !step.is_finite() {
        return DEFAULT_DECIMALS;
    }
    let mut scaled = step;
    let mut decimals = 0;
    while decimals < 12 && (scaled - scaled.round()).abs() > STEP_EPSILON {
        scaled *= 10.0;
        decimals += 1;
    }
    decimals
}

fn round_dp(value: f64, decimals: usize) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Largest multiple of `step` not above `value`.
pub fn floor_to_step(value: f64, step: f64) -> f64 {
    if !value.is_finite() {
        return value;
    }
    if step <= 0.0 {
        return floor_to_step(value, DEFAULT_STEP);
    }
    let steps = (value / step + STEP_EPSILON).floor();
    round_dp(steps * step, step_decimals(step))
}

/// Smallest multiple of `step` not below `value`.
pub fn ceil_to_step(value: f64, step: f64) -> f64 {
    if !value.is_finite() {
        return value;
    }
    if step <= 0.0 {
        return ceil_to_step(value, DEFAULT_STEP);
    }
    let steps = (value / step - STEP_EPSILON).ceil();
    round_dp(steps * step, step_decimals(step))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rules() -> SymbolRules {
        let mut rules = SymbolRules::unrestricted("ABCBTC", "ABC", "BTC");
        rules.min_price = 0.01;
        rules.max_price = 140.0;
        rules.tick_size = 0.01;
        rules.lot = LotSize {
            min_qty: 0.01,
            max_qty: 1000.0,
            step_size: 0.001,
        };
        rules.min_notional = 0.0001;
        rules
    }

    #[test]
    fn quantity_is_floored_to_step() {
        let adjusted = adjust(&rules(), None, None, 0.0157).unwrap();
        assert_eq!(adjusted.quantity, 0.015);
    }

    #[test]
    fn stepless_quantity_is_floored_at_eight_decimals() {
        let rules = SymbolRules::unrestricted("ABCBTC", "ABC", "BTC");
        let adjusted = adjust(&rules, None, None, 1.123_456_789).unwrap();
        assert_eq!(adjusted.quantity, 1.123_456_78);
        assert_eq!(adjust_market(&rules, 0.0, 1.123_456_789).unwrap(), 1.123_456_78);
        assert_eq!(ceil_to_step(1.123_456_781, 0.0), 1.123_456_79);
    }

    #[test]
    fn quantity_below_minimum_is_rejected() {
        let err = adjust(&rules(), None, None, 0.005).unwrap_err();
        assert!(matches!(err, LimitError::QuantityTooSmall { .. }));
    }

    #[test]
    fn quantity_above_maximum_is_capped() {
        let adjusted = adjust(&rules(), None, None, 2500.123_4).unwrap();
        assert_eq!(adjusted.quantity, 1000.0);
    }

    #[test]
    fn price_above_ceiling_is_capped() {
        let adjusted = adjust(&rules(), Some(150.0), None, 1.0).unwrap();
        assert_eq!(adjusted.price, Some(140.0));
    }

    #[test]
    fn price_is_floored_to_tick() {
        let adjusted = adjust(&rules(), Some(101.239), None, 1.0).unwrap();
        assert_eq!(adjusted.price, Some(101.23));
    }

    #[test]
    fn price_below_floor_is_raised() {
        let mut rules = rules();
        rules.min_price = 0.5;
        let adjusted = adjust(&rules, Some(0.123), None, 1.0).unwrap();
        assert_eq!(adjusted.price, Some(0.5));
    }

    #[test]
    fn stop_leg_is_adjusted_and_checked_for_notional() {
        let mut rules = rules();
        rules.min_notional = 10.0;
        let stop = StopLeg {
            trigger_price: 90.004,
            limit_price: 85.509,
        };
        let adjusted = adjust(&rules, Some(140.0), Some(stop), 0.2).unwrap();
        let leg = adjusted.stop.unwrap();
        assert_eq!(leg.trigger_price, 90.0);
        assert_eq!(leg.limit_price, 85.5);

        // 0.1 * 85.5 = 8.55 < 10 even though 0.1 * 140 = 14 would pass.
        let err = adjust(&rules, Some(140.0), Some(stop), 0.1).unwrap_err();
        assert!(matches!(err, LimitError::NotionalTooSmall { .. }));
    }

    #[test]
    fn notional_below_minimum_is_rejected() {
        let mut rules = rules();
        rules.min_notional = 10.0;
        let err = adjust(&rules, Some(5.0), None, 1.0).unwrap_err();
        assert!(matches!(err, LimitError::NotionalTooSmall { .. }));
    }

    #[test]
    fn market_quantity_uses_market_lot() {
        let mut rules = rules();
        rules.market_lot = Some(LotSize {
            min_qty: 1.0,
            max_qty: 50.0,
            step_size: 1.0,
        });
        assert_eq!(adjust_market(&rules, 100.0, 75.9).unwrap(), 50.0);
        assert!(adjust_market(&rules, 100.0, 0.9).is_err());
    }

    #[test]
    fn market_notional_only_when_applied_to_market() {
        let mut rules = rules();
        rules.min_notional = 10.0;
        assert_eq!(adjust_market(&rules, 1.0, 0.5).unwrap(), 0.5);
        rules.notional_applies_to_market = true;
        assert!(matches!(
            adjust_market(&rules, 1.0, 0.5),
            Err(LimitError::NotionalTooSmall { .. })
        ));
    }

    #[test]
    fn near_limit_detection() {
        let rules = rules();
        assert!(rules.is_near_quantity_limits(0.0105, 100.0, false));
        assert!(rules.is_near_quantity_limits(950.0, 100.0, false));
        assert!(!rules.is_near_quantity_limits(5.0, 100.0, false));
    }

    #[test]
    fn step_decimals_matches_step() {
        assert_eq!(step_decimals(0.001), 3);
        assert_eq!(step_decimals(1.0), 0);
        assert_eq!(step_decimals(0.000_001), 6);
        assert_eq!(step_decimals(0.0), DEFAULT_DECIMALS);
    }

    fn arb_rules() -> impl Strategy<Value = SymbolRules> {
        (
            prop::sample::select(vec![0.0, 0.000_01, 0.01, 0.5]),
            prop::sample::select(vec![0.0, 0.001, 0.01, 1.0]),
            1u32..50,
            100u32..5000,
            0.0f64..5.0,
        )
            .prop_map(|(tick, step, min_mult, max_mult, min_notional)| {
                let mut rules = SymbolRules::unrestricted("XY", "X", "Y");
                let tick_unit = if tick > 0.0 { tick } else { 0.01 };
                rules.tick_size = tick;
                rules.min_price = floor_to_step(tick_unit * f64::from(min_mult), tick_unit);
                rules.max_price = floor_to_step(tick_unit * f64::from(max_mult), tick_unit);
                let step_unit = if step > 0.0 { step } else { 0.001 };
                rules.lot = LotSize {
                    min_qty: floor_to_step(step_unit * 2.0, step_unit),
                    max_qty: floor_to_step(step_unit * 100_000.0, step_unit),
                    step_size: step,
                };
                rules.min_notional = min_notional;
                rules
            })
    }

    proptest! {
        #[test]
        fn adjust_is_idempotent(
            rules in arb_rules(),
            price in 0.0f64..1_000.0,
            stop_frac in 0.1f64..0.99,
            quantity in 0.0f64..500.0,
            with_stop in any::<bool>(),
        ) {
            let stop = with_stop.then(|| StopLeg {
                trigger_price: price * stop_frac,
                limit_price: price * stop_frac * 0.95,
            });
            if let Ok(first) = adjust(&rules, Some(price), stop, quantity) {
                let second = adjust(&rules, first.price, first.stop, first.quantity);
                prop_assert_eq!(second, Ok(first));
            }
        }

        #[test]
        fn adjusted_quantity_never_exceeds_request(
            rules in arb_rules(),
            quantity in 0.0f64..500.0,
        ) {
            if let Ok(adjusted) = adjust(&rules, None, None, quantity) {
                prop_assert!(adjusted.quantity <= quantity + 1e-9);
                prop_assert!(adjusted.quantity >= rules.lot.min_qty);
            }
        }
    }
}
