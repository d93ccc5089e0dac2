// =============================================================================
// In-memory exchange for engine tests
// =============================================================================
//
// `StubGateway` answers every `ExchangeGateway` call from scripted state and
// records the calls it received. Prices reach the monitor through the sender
// returned by `StubGateway::new`.
// =============================================================================

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::gateway::{CancelOutcome, Execution, ExchangeGateway, OrderStatus};
use crate::limits::{LotSize, StopLeg, SymbolRules};
use crate::types::{Fill, OrderKind, PriceEvent, PriceTick, RestingOrder};

/// One recorded gateway call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    MarketBuy { symbol: String, quote_amount: f64 },
    MarketSell { quantity: f64 },
    PlaceLimit { price: f64, quantity: f64 },
    PlaceOco { price: f64, stop: StopLeg, quantity: f64 },
    Cancel(RestingOrder),
    Status(RestingOrder),
}

pub struct StubState {
    pub rules: SymbolRules,
    /// Price market orders fill at.
    pub fill_price: f64,
    /// Fraction of a market sell that executes.
    pub sell_fill_ratio: f64,
    pub reject_market_sell: Option<GatewayError>,
    /// Prices pushed onto the feed while a market sell is being executed.
    pub ticks_during_market_sell: Vec<f64>,
    pub reject_market_buy: Option<GatewayError>,
    pub reject_placement: Option<GatewayError>,
    pub cancel_result: Result<CancelOutcome, GatewayError>,
    /// Statuses returned by successive polls; `Open` once exhausted.
    pub statuses: VecDeque<OrderStatus>,
    pub balances: HashMap<String, f64>,
    pub last_prices: HashMap<String, f64>,
    pub tradable: BTreeSet<String>,
    pub calls: Vec<Call>,
    next_order_id: u64,
}

pub struct StubGateway {
    pub state: Mutex<StubState>,
    feed: Mutex<Option<mpsc::Receiver<PriceEvent>>>,
    /// Weak so the feed still closes once the test drops its sender.
    feed_tx: mpsc::WeakSender<PriceEvent>,
}

impl StubGateway {
    /// A stub with `rules` and a price feed of `capacity` slots.
    pub fn new(rules: SymbolRules, capacity: usize) -> (Arc<Self>, mpsc::Sender<PriceEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let gateway = Self {
            state: Mutex::new(StubState {
                rules,
                fill_price: 100.0,
                sell_fill_ratio: 1.0,
                reject_market_sell: None,
                ticks_during_market_sell: Vec::new(),
                reject_market_buy: None,
                reject_placement: None,
                cancel_result: Ok(CancelOutcome::Cancelled(Execution::default())),
                statuses: VecDeque::new(),
                balances: HashMap::new(),
                last_prices: HashMap::new(),
                tradable: BTreeSet::new(),
                calls: Vec::new(),
                next_order_id: 1000,
            }),
            feed: Mutex::new(Some(rx)),
            feed_tx: tx.downgrade(),
        };
        (Arc::new(gateway), tx)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    fn next_order(&self, kind: OrderKind, call: Call) -> Result<RestingOrder, GatewayError> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if let Some(err) = state.reject_placement.clone() {
            return Err(err);
        }
        state.next_order_id += 1;
        Ok(RestingOrder {
            id: state.next_order_id,
            kind,
        })
    }
}

#[async_trait]
impl ExchangeGateway for StubGateway {
    async fn market_buy(&self, symbol: &str, quote_amount: f64) -> Result<Fill, GatewayError> {
        let mut state = self.state.lock();
        state.calls.push(Call::MarketBuy {
            symbol: symbol.to_string(),
            quote_amount,
        });
        if let Some(err) = state.reject_market_buy.clone() {
            return Err(err);
        }
        Ok(Fill {
            quantity: quote_amount / state.fill_price,
            quote_quantity: quote_amount,
            avg_price: state.fill_price,
        })
    }

    async fn market_sell(&self, _symbol: &str, quantity: f64) -> Result<Fill, GatewayError> {
        let mut state = self.state.lock();
        state.calls.push(Call::MarketSell { quantity });
        if let Some(tx) = self.feed_tx.upgrade() {
            for price in state.ticks_during_market_sell.drain(..) {
                let _ = tx.try_send(tick(price));
            }
        }
        if let Some(err) = state.reject_market_sell.clone() {
            return Err(err);
        }
        let executed = quantity * state.sell_fill_ratio;
        Ok(Fill {
            quantity: executed,
            quote_quantity: executed * state.fill_price,
            avg_price: state.fill_price,
        })
    }

    async fn place_limit_sell(
        &self,
        _symbol: &str,
        price: f64,
        quantity: f64,
    ) -> Result<RestingOrder, GatewayError> {
        self.next_order(OrderKind::Limit, Call::PlaceLimit { price, quantity })
    }

    async fn place_oco_sell(
        &self,
        _symbol: &str,
        price: f64,
        stop: StopLeg,
        quantity: f64,
    ) -> Result<RestingOrder, GatewayError> {
        self.next_order(
            OrderKind::Oco,
            Call::PlaceOco {
                price,
                stop,
                quantity,
            },
        )
    }

    async fn cancel_order(
        &self,
        _symbol: &str,
        order: RestingOrder,
    ) -> Result<CancelOutcome, GatewayError> {
        let mut state = self.state.lock();
        state.calls.push(Call::Cancel(order));
        state.cancel_result.clone()
    }

    async fn order_status(
        &self,
        _symbol: &str,
        order: RestingOrder,
    ) -> Result<OrderStatus, GatewayError> {
        let mut state = self.state.lock();
        state.calls.push(Call::Status(order));
        Ok(state
            .statuses
            .pop_front()
            .unwrap_or(OrderStatus::Open(Execution::default())))
    }

    async fn symbol_rules(&self, _symbol: &str) -> Result<SymbolRules, GatewayError> {
        Ok(self.state.lock().rules.clone())
    }

    async fn tradable_bases(&self, _quote: &str) -> Result<BTreeSet<String>, GatewayError> {
        Ok(self.state.lock().tradable.clone())
    }

    async fn free_balance(&self, asset: &str) -> Result<f64, GatewayError> {
        Ok(self.state.lock().balances.get(asset).copied().unwrap_or_default())
    }

    async fn last_price(&self, symbol: &str) -> Result<f64, GatewayError> {
        self.state
            .lock()
            .last_prices
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::Rejected {
                code: Some(-1121),
                message: "Invalid symbol.".into(),
            })
    }

    async fn subscribe_price(
        &self,
        _symbol: &str,
    ) -> Result<mpsc::Receiver<PriceEvent>, GatewayError> {
        self.feed
            .lock()
            .take()
            .ok_or_else(|| GatewayError::Transport("price feed already taken".into()))
    }
}

/// Rules with a 0.01 tick, 0.001 step and 0.01 minimum quantity.
pub fn test_rules() -> SymbolRules {
    let mut rules = SymbolRules::unrestricted("ABCBTC", "ABC", "BTC");
    rules.min_price = 0.01;
    rules.max_price = 1000.0;
    rules.tick_size = 0.01;
    rules.lot = LotSize {
        min_qty: 0.01,
        max_qty: 10_000.0,
        step_size: 0.001,
    };
    rules
}

pub fn tick(price: f64) -> PriceEvent {
    PriceEvent::Tick(PriceTick {
        price,
        trade_time_ms: 0,
    })
}

/// Feed `prices` in a loop until the monitor drops its receiver.
pub fn spawn_ticker(tx: mpsc::Sender<PriceEvent>, prices: Vec<f64>) {
    tokio::spawn(async move {
        for price in prices.iter().cycle() {
            if tx.send(tick(*price)).await.is_err() {
                break;
            }
        }
    });
}

/// Cancel `token` as soon as a limit or OCO sell has been placed.
pub fn cancel_once_resting(gateway: Arc<StubGateway>, token: CancellationToken) {
    tokio::spawn(async move {
        loop {
            let placed = gateway
                .calls()
                .iter()
                .any(|c| matches!(c, Call::PlaceLimit { .. } | Call::PlaceOco { .. }));
            if placed {
                token.cancel();
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });
}
