// =============================================================================
// Trade Cycle — one buy followed by one managed sell-out
// =============================================================================
//
//   validate config -> choose pair -> size quote amount -> market buy
//     -> fetch symbol rules -> position monitor -> CycleReport
//
// The configuration is checked before the exchange is contacted, so an invalid
// stop/profit combination never results in an order.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

use crate::error::TradeError;
use crate::execution::{ExecutionEngine, TradingPair};
use crate::exit::bailout::InterruptController;
use crate::exit::monitor::{MonitorOutcome, MonitorReport, PositionMonitor};
use crate::gateway::ExchangeGateway;
use crate::runtime_config::TradeConfig;
use crate::types::SellType;

/// Summary of a finished cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub symbol: String,
    pub outcome: String,
    pub entry_price: f64,
    pub quantity_bought: f64,
    pub quote_spent: f64,
    pub quantity_sold: f64,
    pub quote_received: f64,
    pub dust: f64,
    pub profit_pct: Option<f64>,
    pub orders_used: u32,
    pub opened_at: String,
    pub closed_at: Option<String>,
}

impl CycleReport {
    fn from_monitor(report: &MonitorReport) -> Self {
        let pos = &report.position;
        Self {
            symbol: pos.symbol.clone(),
            outcome: report.outcome.to_string(),
            entry_price: pos.entry_price,
            quantity_bought: pos.total_quantity,
            quote_spent: pos.quote_spent,
            quantity_sold: pos.sold_quantity(),
            quote_received: pos.realized_quote,
            dust: pos.dust_quantity,
            profit_pct: pos.realized_pct(),
            orders_used: pos.orders_used(),
            opened_at: pos.opened_at.clone(),
            closed_at: pos.closed_at.clone(),
        }
    }
}

pub struct TradeCycle {
    config: TradeConfig,
    gateway: Arc<dyn ExchangeGateway>,
    interrupts: Arc<InterruptController>,
    engine: ExecutionEngine,
}

impl TradeCycle {
    /// Fails with `InvalidConfiguration` before anything is sent.
    pub fn new(
        config: TradeConfig,
        gateway: Arc<dyn ExchangeGateway>,
        interrupts: Arc<InterruptController>,
    ) -> Result<Self, TradeError> {
        config.validate()?;
        if config.profit_pct <= 0.0 {
            warn!(profit_pct = config.profit_pct, "non-positive profit target, this cycle may net a loss");
        }
        Ok(Self {
            engine: ExecutionEngine::new(gateway.clone()),
            config,
            gateway,
            interrupts,
        })
    }

    /// The configured base coin, or the first tradable one read from `input`.
    pub async fn choose_pair<R>(&self, input: R) -> Result<TradingPair, TradeError>
    where
        R: AsyncBufRead + Unpin,
    {
        let quote = &self.config.quote_coin;
        if self.interrupts.is_interrupted() {
            return Err(TradeError::Interrupted);
        }
        if let Some(base) = &self.config.base_coin {
            return self.engine.select_pair(base, quote).await;
        }

        info!(quote = %quote, "enter the base coin to buy");
        let mut lines = input.lines();
        loop {
            let line = tokio::select! {
                biased;
                _ = self.interrupts.interrupted() => return Err(TradeError::Interrupted),
                line = lines.next_line() => line,
            };
            let line =
                line.map_err(|e| TradeError::InvalidPair(format!("failed to read base coin: {e}")))?;
            let Some(line) = line else {
                return Err(TradeError::InvalidPair("no base coin given".into()));
            };
            let base = line.trim();
            if base.is_empty() {
                continue;
            }
            match self.engine.select_pair(base, quote).await {
                Ok(pair) => return Ok(pair),
                Err(TradeError::InvalidPair(reason)) => {
                    warn!(reason = %reason, "try another coin");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Buy `pair` and manage the sell until the position is closed.
    pub async fn run(&self, pair: &TradingPair) -> Result<CycleReport, TradeError> {
        self.ensure_not_interrupted()?;
        let amount = self.engine.resolve_quote_amount(&self.config).await?;

        info!(
            pair = %pair,
            quote_amount = amount,
            sell_type = %self.config.sell_type,
            profit_pct = self.config.profit_pct,
            stop_pct = self.config.stop_pct,
            bailout = self.config.bailout,
            "starting cycle"
        );

        self.ensure_not_interrupted()?;
        let position = self
            .engine
            .buy(pair, amount, self.config.exit_targets())
            .await?;
        let rules = self.gateway.symbol_rules(&pair.symbol).await?;

        let market = self.config.sell_type == SellType::Market;
        let (low, high) = rules.quantity_bounds(position.entry_price, market);
        if rules.is_near_quantity_limits(position.total_quantity, position.entry_price, market) {
            warn!(
                quantity = position.total_quantity,
                min = low,
                max = high,
                "bought quantity is close to the exchange limits, a price move may make it unsellable"
            );
        }

        let monitor = PositionMonitor::new(
            position,
            rules,
            self.gateway.clone(),
            self.config.monitor_settings(),
            self.interrupts.bailout_token(),
            self.interrupts.abort_token(),
        );
        let report = monitor.run().await?;
        let cycle = CycleReport::from_monitor(&report);

        match &report.outcome {
            MonitorOutcome::Aborted => warn!(
                symbol = %cycle.symbol,
                remaining = report.position.remaining_quantity(),
                "cycle aborted, remaining quantity left unsold"
            ),
            _ => info!(
                symbol = %cycle.symbol,
                outcome = %cycle.outcome,
                sold = cycle.quantity_sold,
                received = cycle.quote_received,
                profit_pct = format!("{:.2}", cycle.profit_pct.unwrap_or_default()),
                orders = cycle.orders_used,
                "cycle finished"
            ),
        }
        Ok(cycle)
    }

    /// Nothing has been bought yet, so an interrupt simply ends the run.
    fn ensure_not_interrupted(&self) -> Result<(), TradeError> {
        if self.interrupts.is_interrupted() {
            warn!("interrupted before buying, nothing was traded");
            return Err(TradeError::Interrupted);
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{spawn_ticker, test_rules, Call, StubGateway};
    use crate::gateway::{Execution, OrderStatus};

    fn stub() -> (Arc<StubGateway>, tokio::sync::mpsc::Sender<crate::types::PriceEvent>) {
        let (gateway, tx) = StubGateway::new(test_rules(), 1);
        {
            let mut state = gateway.state.lock();
            state.balances.insert("BTC".into(), 2.0);
            state.tradable.insert("ABC".into());
        }
        (gateway, tx)
    }

    fn cycle(config: TradeConfig, gateway: &Arc<StubGateway>) -> Result<TradeCycle, TradeError> {
        let interrupts = Arc::new(InterruptController::new(true));
        TradeCycle::new(config, gateway.clone(), interrupts)
    }

    #[tokio::test]
    async fn invalid_configuration_sends_nothing() {
        let (gateway, _tx) = stub();
        let mut config = TradeConfig::default();
        config.stop_pct = 10.0;
        config.profit_pct = 10.0;
        assert!(matches!(
            cycle(config, &gateway),
            Err(TradeError::InvalidConfiguration(_))
        ));
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn base_coin_read_until_tradable() {
        let (gateway, _tx) = stub();
        let cycle = cycle(TradeConfig::default(), &gateway).unwrap();
        let pair = cycle.choose_pair(&b"\nxyz\nabc\n"[..]).await.unwrap();
        assert_eq!(pair.symbol, "ABCBTC");

        let err = cycle.choose_pair(&b"xyz\n"[..]).await.unwrap_err();
        assert!(matches!(err, TradeError::InvalidPair(_)));
    }

    #[tokio::test]
    async fn configured_base_coin_skips_input() {
        let (gateway, _tx) = stub();
        let mut config = TradeConfig::default();
        config.base_coin = Some("ABC".into());
        let cycle = cycle(config, &gateway).unwrap();
        let pair = cycle.choose_pair(&b""[..]).await.unwrap();
        assert_eq!(pair.base_asset, "ABC");
    }

    #[tokio::test]
    async fn interrupt_before_buying_sends_nothing() {
        for bailout_enabled in [true, false] {
            let (gateway, _tx) = stub();
            let interrupts = Arc::new(InterruptController::new(bailout_enabled));
            let cycle =
                TradeCycle::new(TradeConfig::default(), gateway.clone(), interrupts.clone()).unwrap();
            interrupts.on_interrupt();

            let err = cycle.run(&TradingPair::new("ABC", "BTC")).await.unwrap_err();
            assert!(matches!(err, TradeError::Interrupted));
            assert!(gateway.calls().is_empty());
        }
    }

    #[tokio::test]
    async fn interrupt_while_choosing_coin_stops_the_prompt() {
        let (gateway, _tx) = stub();
        let interrupts = Arc::new(InterruptController::new(false));
        let cycle =
            TradeCycle::new(TradeConfig::default(), gateway.clone(), interrupts.clone()).unwrap();

        // A reader that never produces a line.
        let (_writer, reader) = tokio::io::duplex(64);
        let input = tokio::io::BufReader::new(reader);
        let trigger = interrupts.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            trigger.on_interrupt();
        });

        let err = cycle.choose_pair(input).await.unwrap_err();
        assert!(matches!(err, TradeError::Interrupted));
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn market_cycle_buys_and_sells_everything() {
        let (gateway, tx) = stub();
        gateway.state.lock().fill_price = 100.0;
        spawn_ticker(tx, vec![100.5, 101.5]);

        let mut config = TradeConfig::default();
        config.sell_type = SellType::Market;
        config.profit_pct = 1.0;
        config.stop_pct = -2.0;
        let cycle = cycle(config, &gateway).unwrap();

        let report = cycle.run(&TradingPair::new("ABC", "BTC")).await.unwrap();
        assert_eq!(report.outcome, "Sold");
        assert_eq!(report.quantity_bought, 0.02);
        assert_eq!(report.quantity_sold, 0.02);
        assert_eq!(report.orders_used, 2);
        assert_eq!(
            gateway.calls(),
            vec![
                Call::MarketBuy {
                    symbol: "ABCBTC".into(),
                    quote_amount: 2.0
                },
                Call::MarketSell { quantity: 0.02 },
            ]
        );
    }

    #[tokio::test]
    async fn limit_cycle_reports_fill() {
        let (gateway, tx) = stub();
        gateway
            .state
            .lock()
            .statuses
            .push_back(OrderStatus::Filled(Execution {
                executed_qty: 0.02,
                quote_qty: 2.2,
            }));
        spawn_ticker(tx, vec![105.0, 106.0]);

        let mut config = TradeConfig::default();
        config.fill_poll_ms = 0;
        let cycle = cycle(config, &gateway).unwrap();

        let report = cycle.run(&TradingPair::new("ABC", "BTC")).await.unwrap();
        assert_eq!(report.outcome, "LimitFilled");
        assert!((report.profit_pct.unwrap() - 10.0).abs() < 1e-6);
        assert!(report.closed_at.is_some());
    }
}
