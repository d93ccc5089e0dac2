// =============================================================================
// Position Monitor — drives the open position until it is sold or fails
// =============================================================================
//
// State machine:
//
//   AwaitingPrice --tick--> Evaluating --Hold--> AwaitingPrice
//                                      --Market/LimitSell--> OrderPending
//                                      --Fail--> Failed
//   OrderPending  --market fill, qty left--> AwaitingPrice
//                 --market fill, all sold--> Terminal
//                 --limit/OCO accepted-----> Resting
//                 --rejected---------------> Failed
//   Resting       --poll says filled-------> Terminal
//
// Interrupts are observed only while waiting for the next price event; an
// order call in flight always completes first. Ticks that arrive while an
// order is pending are discarded.
//
// The bailout path cancels the resting order (if any) and market-sells the
// remainder, ignoring the planner and the orders cap.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{LimitError, TradeError};
use crate::exit::planner::{plan, PlanInput, SellDecision};
use crate::gateway::{CancelOutcome, ExchangeGateway, OrderStatus};
use crate::limits::{self, SymbolRules};
use crate::position_engine::Position;
use crate::types::{Fill, PriceEvent, RestingOrder, SellType};

/// Monitor tuning taken from the trade configuration.
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    /// Total orders per cycle, the market buy included.
    pub orders_cap: u32,
    /// Minimum time between two status polls of a resting order.
    pub fill_poll_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    AwaitingPrice,
    Evaluating,
    OrderPending,
    Resting,
    Terminal,
    Failed,
}

impl std::fmt::Display for MonitorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwaitingPrice => write!(f, "AwaitingPrice"),
            Self::Evaluating => write!(f, "Evaluating"),
            Self::OrderPending => write!(f, "OrderPending"),
            Self::Resting => write!(f, "Resting"),
            Self::Terminal => write!(f, "Terminal"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// How the monitor finished without a fatal error.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorOutcome {
    /// Market sells liquidated the position.
    Sold,
    /// The resting limit/OCO order filled.
    LimitFilled,
    /// Interrupted with bailout enabled; `error` is set when the forced sell
    /// did not go through.
    BailedOut { error: Option<String> },
    /// Interrupted with bailout disabled; the position was left as is.
    Aborted,
}

impl std::fmt::Display for MonitorOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sold => write!(f, "Sold"),
            Self::LimitFilled => write!(f, "LimitFilled"),
            Self::BailedOut { error: None } => write!(f, "BailedOut"),
            Self::BailedOut { error: Some(e) } => write!(f, "BailedOut (forced sell failed: {e})"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorReport {
    pub outcome: MonitorOutcome,
    pub final_state: MonitorState,
    pub position: Position,
}

pub struct PositionMonitor {
    position: Position,
    rules: SymbolRules,
    gateway: Arc<dyn ExchangeGateway>,
    settings: MonitorSettings,
    bailout: CancellationToken,
    abort: CancellationToken,
    state: MonitorState,
    last_price: Option<f64>,
    /// Limit price of the resting order, used if its fill cannot be queried.
    resting_price: Option<f64>,
    last_poll: Option<Instant>,
}

type Step = Result<Option<MonitorOutcome>, TradeError>;

impl PositionMonitor {
    pub fn new(
        position: Position,
        rules: SymbolRules,
        gateway: Arc<dyn ExchangeGateway>,
        settings: MonitorSettings,
        bailout: CancellationToken,
        abort: CancellationToken,
    ) -> Self {
        Self {
            position,
            rules,
            gateway,
            settings,
            bailout,
            abort,
            state: MonitorState::AwaitingPrice,
            last_price: None,
            resting_price: None,
            last_poll: None,
        }
    }

    /// Run until the position is terminal, failed or interrupted.
    pub async fn run(mut self) -> Result<MonitorReport, TradeError> {
        let symbol = self.position.symbol.clone();
        let mut feed = self.gateway.subscribe_price(&symbol).await?;

        info!(
            symbol = %symbol,
            sell_type = %self.position.targets.sell_type,
            entry_price = self.position.entry_price,
            profit_price = self.position.profit_price(),
            min_acceptable_price = self.position.min_acceptable_price(),
            quantity = self.position.remaining_quantity(),
            "position monitor started"
        );

        // LIMIT sells go on the book straight away, unless an interrupt is
        // already pending.
        if self.position.targets.sell_type == SellType::Limit && !self.interrupted() {
            if self.position.targets.stop_enabled() && !self.rules.oco_allowed {
                warn!(symbol = %symbol, "OCO not allowed for this pair, placing a plain limit sell without stop");
            }
            self.state = MonitorState::Evaluating;
            if let Some(outcome) = self.evaluate(&mut feed).await? {
                return Ok(self.finish(outcome));
            }
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = self.bailout.cancelled() => {
                    let outcome = self.bail_out().await;
                    return Ok(self.finish(outcome));
                }
                _ = self.abort.cancelled() => {
                    warn!(symbol = %symbol, state = %self.state, "interrupted, leaving position as is");
                    return Ok(self.finish(MonitorOutcome::Aborted));
                }
                event = feed.recv() => event,
            };

            let step = match event {
                None => {
                    self.state = MonitorState::Failed;
                    Err(TradeError::StreamDisrupted(format!(
                        "price feed for {symbol} closed"
                    )))
                }
                Some(PriceEvent::Disrupted { attempt }) => {
                    warn!(symbol = %symbol, attempt, "price feed disrupted, holding");
                    Ok(None)
                }
                Some(PriceEvent::Tick(tick)) => {
                    self.last_price = Some(tick.price);
                    info!(
                        symbol = %symbol,
                        price = tick.price,
                        estimated_profit_pct = format!("{:.2}", self.position.unrealized_pct(tick.price)),
                        "price update"
                    );
                    if self.state == MonitorState::Resting {
                        self.poll_resting().await
                    } else {
                        self.state = MonitorState::Evaluating;
                        self.evaluate(&mut feed).await
                    }
                }
            };

            match step {
                Ok(Some(outcome)) => return Ok(self.finish(outcome)),
                Ok(None) => {}
                Err(e) => {
                    self.state = MonitorState::Failed;
                    error!(
                        symbol = %symbol,
                        error = %e,
                        remaining = self.position.remaining_quantity(),
                        "position monitor failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Evaluating / OrderPending
    // -------------------------------------------------------------------------

    async fn evaluate(&mut self, feed: &mut mpsc::Receiver<PriceEvent>) -> Step {
        let input = PlanInput::for_position(
            &self.position,
            self.last_price,
            self.settings.orders_cap,
            &self.rules,
        );
        let decision = plan(&input);
        debug!(decision = %decision, orders_used = self.position.orders_used(), "sell plan");

        match decision {
            SellDecision::Hold => {
                self.state = MonitorState::AwaitingPrice;
                Ok(None)
            }
            SellDecision::Fail(reason) => {
                self.state = MonitorState::Failed;
                Err(reason.into())
            }
            SellDecision::MarketSell { quantity } => {
                let quantity = limits::adjust_market(
                    &self.rules,
                    self.last_price.unwrap_or_default(),
                    quantity,
                )?;
                self.state = MonitorState::OrderPending;
                let result = self
                    .gateway
                    .market_sell(&self.position.symbol, quantity)
                    .await;
                drain(feed);

                let fill = result?;
                self.position.record_order();
                self.record_market_fill(&fill);
                self.after_sell(MonitorOutcome::Sold)
            }
            SellDecision::LimitSell {
                price,
                stop,
                quantity,
            } => {
                self.state = MonitorState::OrderPending;
                let symbol = self.position.symbol.clone();
                let result = match stop {
                    Some(stop) => {
                        self.gateway
                            .place_oco_sell(&symbol, price, stop, quantity)
                            .await
                    }
                    None => self.gateway.place_limit_sell(&symbol, price, quantity).await,
                };
                drain(feed);

                let order = result?;
                self.position.record_order();
                if let Some(stale) = self.position.set_resting(order) {
                    warn!(symbol = %symbol, stale = %stale, "replaced a resting order that was still tracked");
                }
                self.resting_price = Some(price);
                self.last_poll = None;
                self.state = MonitorState::Resting;
                info!(
                    symbol = %symbol,
                    order = %order,
                    price,
                    quantity,
                    expected_profit_pct = format!("{:.2}", self.position.unrealized_pct(price)),
                    "sell order resting"
                );
                Ok(None)
            }
        }
    }

    fn record_market_fill(&mut self, fill: &Fill) {
        self.position.record_sell(fill.quantity, fill.quote_quantity);
        info!(
            symbol = %self.position.symbol,
            quantity = fill.quantity,
            avg_price = fill.avg_price,
            received = fill.quote_quantity,
            profit_pct = format!("{:.2}", self.position.unrealized_pct(fill.avg_price)),
            remaining = self.position.remaining_quantity(),
            "market sell filled"
        );
    }

    /// Settle the state after a sell executed.
    fn after_sell(&mut self, done: MonitorOutcome) -> Step {
        if !self.position.is_terminal() && self.is_dust() {
            self.position.write_off_dust();
        }
        if self.position.is_terminal() {
            self.state = MonitorState::Terminal;
            return Ok(Some(done));
        }
        if self.position.orders_used() >= self.settings.orders_cap {
            self.state = MonitorState::Failed;
            return Err(TradeError::OrdersCapReached {
                cap: self.settings.orders_cap,
                remaining: self.position.remaining_quantity(),
            });
        }
        self.state = MonitorState::AwaitingPrice;
        Ok(None)
    }

    /// Whether what is left cannot be expressed as a market order at all.
    fn is_dust(&self) -> bool {
        matches!(
            limits::adjust_market(&self.rules, 0.0, self.position.remaining_quantity()),
            Err(LimitError::QuantityTooSmall { .. })
        )
    }

    // -------------------------------------------------------------------------
    // Resting
    // -------------------------------------------------------------------------

    async fn poll_resting(&mut self) -> Step {
        let Some(order) = self.position.resting_order() else {
            self.state = MonitorState::AwaitingPrice;
            return Ok(None);
        };

        if let Some(at) = self.last_poll {
            if at.elapsed() < self.settings.fill_poll_interval {
                return Ok(None);
            }
        }
        self.last_poll = Some(Instant::now());

        let status = match self
            .gateway
            .order_status(&self.position.symbol, order)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                warn!(order = %order, error = %e, "order status poll failed");
                return Ok(None);
            }
        };

        match status {
            OrderStatus::Open(exec) => {
                debug!(order = %order, executed = exec.executed_qty, "sell order still resting");
                Ok(None)
            }
            OrderStatus::Filled(exec) => {
                self.position.clear_resting();
                self.position.record_sell(exec.executed_qty, exec.quote_qty);
                info!(
                    symbol = %self.position.symbol,
                    order = %order,
                    quantity = exec.executed_qty,
                    received = exec.quote_qty,
                    profit_pct = format!("{:.2}", self.position.realized_pct().unwrap_or_default()),
                    "sell order filled"
                );
                self.after_sell(MonitorOutcome::LimitFilled)
            }
            OrderStatus::Closed(exec) => {
                self.position.clear_resting();
                if exec.executed_qty > 0.0 {
                    self.position.record_sell(exec.executed_qty, exec.quote_qty);
                }
                self.state = MonitorState::Failed;
                Err(TradeError::RestingOrderClosed(order.to_string()))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Bailout
    // -------------------------------------------------------------------------

    async fn bail_out(&mut self) -> MonitorOutcome {
        let symbol = self.position.symbol.clone();
        warn!(
            symbol = %symbol,
            state = %self.state,
            remaining = self.position.remaining_quantity(),
            "bailout requested, liquidating position"
        );

        let mut filled_before_cancel = false;
        if let Some(order) = self.position.resting_order() {
            self.state = MonitorState::OrderPending;
            match self.gateway.cancel_order(&symbol, order).await {
                Ok(CancelOutcome::Cancelled(exec)) => {
                    self.position.clear_resting();
                    if exec.executed_qty > 0.0 {
                        self.position.record_sell(exec.executed_qty, exec.quote_qty);
                    }
                    info!(order = %order, executed = exec.executed_qty, "resting order cancelled");
                }
                Ok(CancelOutcome::AlreadyFilled) => {
                    self.settle_filled_resting(order).await;
                    filled_before_cancel = true;
                }
                Err(e) => {
                    self.position.clear_resting();
                    error!(order = %order, error = %e, "failed to cancel resting order, selling anyway");
                }
            }
        }

        if !self.position.is_terminal() && self.is_dust() {
            self.position.write_off_dust();
        }
        if self.position.is_terminal() {
            self.state = MonitorState::Terminal;
            return if filled_before_cancel {
                MonitorOutcome::LimitFilled
            } else {
                MonitorOutcome::BailedOut { error: None }
            };
        }

        self.state = MonitorState::OrderPending;
        let remaining = self.position.remaining_quantity();
        let result = match limits::adjust_market(
            &self.rules,
            self.last_price.unwrap_or_default(),
            remaining,
        ) {
            Ok(quantity) => self
                .gateway
                .market_sell(&symbol, quantity)
                .await
                .map_err(TradeError::from),
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(fill) => {
                self.position.record_order();
                self.record_market_fill(&fill);
                if !self.position.is_terminal() && self.is_dust() {
                    self.position.write_off_dust();
                }
                self.state = if self.position.is_terminal() {
                    MonitorState::Terminal
                } else {
                    MonitorState::Failed
                };
                MonitorOutcome::BailedOut { error: None }
            }
            Err(e) => {
                error!(symbol = %symbol, error = %e, remaining, "forced market sell failed");
                self.state = MonitorState::Failed;
                MonitorOutcome::BailedOut {
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn interrupted(&self) -> bool {
        self.bailout.is_cancelled() || self.abort.is_cancelled()
    }

    /// The resting order filled before it could be cancelled.
    async fn settle_filled_resting(&mut self, order: RestingOrder) {
        self.position.clear_resting();
        let remaining = self.position.remaining_quantity();
        match self.gateway.order_status(&self.position.symbol, order).await {
            Ok(status) => {
                let exec = status.execution();
                self.position.record_sell(exec.executed_qty, exec.quote_qty);
            }
            Err(e) => {
                let price = self.resting_price.unwrap_or(self.position.entry_price);
                warn!(order = %order, error = %e, price, "fill details unavailable, booking at limit price");
                self.position.record_sell(remaining, remaining * price);
            }
        }
        info!(order = %order, "resting order had already filled");
    }

    fn finish(self, outcome: MonitorOutcome) -> MonitorReport {
        info!(
            symbol = %self.position.symbol,
            outcome = %outcome,
            state = %self.state,
            remaining = self.position.remaining_quantity(),
            realized_quote = self.position.realized_quote,
            "position monitor finished"
        );
        MonitorReport {
            outcome,
            final_state: self.state,
            position: self.position,
        }
    }
}

/// Discard ticks that queued up during an order call.
fn drain(feed: &mut mpsc::Receiver<PriceEvent>) {
    let mut dropped = 0usize;
    while feed.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        debug!(dropped, "discarded price events received while an order was pending");
    }
}
