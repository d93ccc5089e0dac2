// =============================================================================
// Error taxonomy for a trading cycle
// =============================================================================
//
// Every error that can end a run is a `TradeError`. Order-sizing failures come
// from the limit adjuster as `LimitError`; exchange failures come from the
// gateway as `GatewayError`. An exchange rejection of a submitted order is
// surfaced verbatim as `ExchangeRejected`.
// =============================================================================

use thiserror::Error;

/// The limit adjuster could not produce an order the exchange would accept.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LimitError {
    #[error("quantity {quantity} is below the exchange minimum {min_quantity}")]
    QuantityTooSmall { quantity: f64, min_quantity: f64 },

    #[error("order value {notional} is below the exchange minimum notional {min_notional}")]
    NotionalTooSmall { notional: f64, min_notional: f64 },
}

/// Failures reported by an exchange gateway.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The exchange answered and refused the request.
    #[error("exchange rejected request (code {code:?}): {message}")]
    Rejected { code: Option<i64>, message: String },

    /// The request never got a usable answer.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The exchange answered with something we could not interpret.
    #[error("unexpected exchange response: {0}")]
    Decode(String),
}

/// Fatal outcomes of a trading cycle.
#[derive(Debug, Error)]
pub enum TradeError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid trading pair: {0}")]
    InvalidPair(String),

    #[error("insufficient {asset} balance: need {required}, have {available}")]
    InsufficientBalance {
        asset: String,
        required: f64,
        available: f64,
    },

    #[error(transparent)]
    Limits(#[from] LimitError),

    #[error("exchange rejected order: {0}")]
    ExchangeRejected(String),

    #[error(
        "limit sell at target {target_price} is capped to {achievable_price}, below the minimum acceptable {minimum_price}"
    )]
    BelowMinimumAcceptable {
        target_price: f64,
        achievable_price: f64,
        minimum_price: f64,
    },

    #[error("price stream disrupted: {0}")]
    StreamDisrupted(String),

    #[error("resting order {0} was closed on the exchange before it filled")]
    RestingOrderClosed(String),

    #[error("interrupted before any order was sent")]
    Interrupted,

    #[error("orders cap of {cap} reached with {remaining} left unsold")]
    OrdersCapReached { cap: u32, remaining: f64 },

    #[error("exchange gateway failure: {0}")]
    Gateway(GatewayError),
}

impl From<GatewayError> for TradeError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Rejected { message, code } => match code {
                Some(code) => Self::ExchangeRejected(format!("{message} (code {code})")),
                None => Self::ExchangeRejected(message),
            },
            other => Self::Gateway(other),
        }
    }
}
