// =============================================================================
// BinanceGateway — ExchangeGateway over the Binance spot REST + WS APIs
// =============================================================================
//
// Translates the engine's order vocabulary into Binance parameters and the
// JSON answers back into typed results. Quantities and prices are sent with
// at most 8 decimals and no trailing zeros; the limit adjuster has already
// placed them on the symbol's step grid.
// =============================================================================

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::binance::client::{parse_str_f64, ApiError, BinanceClient};
use crate::error::GatewayError;
use crate::gateway::{CancelOutcome, Execution, ExchangeGateway, OrderStatus};
use crate::limits::{StopLeg, SymbolRules};
use crate::market_data::{spawn_price_feed, FeedSettings};
use crate::types::{fmt_decimal, Fill, OrderKind, PriceEvent, RestingOrder};

/// Decimal places used for every numeric order parameter.
const PARAM_DECIMALS: usize = 8;

/// "Unknown order sent.": the order is gone, which for a sell means filled.
const UNKNOWN_ORDER: i64 = -2011;

pub struct BinanceGateway {
    client: BinanceClient,
    ws_base: String,
    feed: FeedSettings,
}

impl BinanceGateway {
    pub fn new(client: BinanceClient, ws_base: impl Into<String>, feed: FeedSettings) -> Self {
        Self {
            client,
            ws_base: ws_base.into(),
            feed,
        }
    }

    async fn submit_market(&self, symbol: &str, params: String) -> Result<Fill, GatewayError> {
        let body = self.client.place_order(&params).await.map_err(map_err)?;
        let fill = parse_fill(&body)?;
        debug!(symbol, quantity = fill.quantity, avg_price = fill.avg_price, "market order filled");
        Ok(fill)
    }

    async fn single_order_status(
        &self,
        symbol: &str,
        order_id: u64,
    ) -> Result<(String, Execution), GatewayError> {
        let body = self.client.get_order(symbol, order_id).await.map_err(map_err)?;
        let status = body["status"]
            .as_str()
            .ok_or_else(|| GatewayError::Decode(format!("order #{order_id} has no status")))?
            .to_string();
        Ok((status, parse_execution(&body)?))
    }
}

#[async_trait]
impl ExchangeGateway for BinanceGateway {
    async fn market_buy(&self, symbol: &str, quote_amount: f64) -> Result<Fill, GatewayError> {
        let params = format!(
            "symbol={symbol}&side=BUY&type=MARKET&quoteOrderQty={}&newOrderRespType=FULL",
            fmt_decimal(quote_amount, PARAM_DECIMALS)
        );
        self.submit_market(symbol, params).await
    }

    async fn market_sell(&self, symbol: &str, quantity: f64) -> Result<Fill, GatewayError> {
        let params = format!(
            "symbol={symbol}&side=SELL&type=MARKET&quantity={}&newOrderRespType=FULL",
            fmt_decimal(quantity, PARAM_DECIMALS)
        );
        self.submit_market(symbol, params).await
    }

    async fn place_limit_sell(
        &self,
        symbol: &str,
        price: f64,
        quantity: f64,
    ) -> Result<RestingOrder, GatewayError> {
        let params = format!(
            "symbol={symbol}&side=SELL&type=LIMIT&timeInForce=GTC&quantity={}&price={}",
            fmt_decimal(quantity, PARAM_DECIMALS),
            fmt_decimal(price, PARAM_DECIMALS)
        );
        let body = self.client.place_order(&params).await.map_err(map_err)?;
        let id = body["orderId"]
            .as_u64()
            .ok_or_else(|| GatewayError::Decode("limit order response has no orderId".into()))?;
        info!(symbol, id, price, quantity, "limit sell resting");
        Ok(RestingOrder {
            id,
            kind: OrderKind::Limit,
        })
    }

    async fn place_oco_sell(
        &self,
        symbol: &str,
        price: f64,
        stop: StopLeg,
        quantity: f64,
    ) -> Result<RestingOrder, GatewayError> {
        let params = format!(
            "symbol={symbol}&side=SELL&quantity={}&price={}&stopPrice={}&stopLimitPrice={}&stopLimitTimeInForce=GTC",
            fmt_decimal(quantity, PARAM_DECIMALS),
            fmt_decimal(price, PARAM_DECIMALS),
            fmt_decimal(stop.trigger_price, PARAM_DECIMALS),
            fmt_decimal(stop.limit_price, PARAM_DECIMALS)
        );
        let body = self.client.place_oco(&params).await.map_err(map_err)?;
        let id = body["orderListId"]
            .as_u64()
            .ok_or_else(|| GatewayError::Decode("OCO response has no orderListId".into()))?;
        info!(
            symbol,
            id,
            price,
            stop = stop.trigger_price,
            stop_limit = stop.limit_price,
            quantity,
            "OCO sell resting"
        );
        Ok(RestingOrder {
            id,
            kind: OrderKind::Oco,
        })
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order: RestingOrder,
    ) -> Result<CancelOutcome, GatewayError> {
        let result = match order.kind {
            OrderKind::Limit => self.client.cancel_order(symbol, order.id).await,
            OrderKind::Oco => self.client.cancel_order_list(symbol, order.id).await,
        };

        let body = match result {
            Ok(body) => body,
            Err(e) => {
                if let Some(api) = e.downcast_ref::<ApiError>() {
                    if api.code == Some(UNKNOWN_ORDER) {
                        info!(symbol, order = %order, "order already gone, treating as filled");
                        return Ok(CancelOutcome::AlreadyFilled);
                    }
                }
                return Err(map_err(e));
            }
        };

        let execution = match order.kind {
            OrderKind::Limit => parse_execution(&body)?,
            OrderKind::Oco => {
                let mut total = Execution::default();
                for report in body["orderReports"].as_array().into_iter().flatten() {
                    total += parse_execution(report)?;
                }
                total
            }
        };
        Ok(CancelOutcome::Cancelled(execution))
    }

    async fn order_status(
        &self,
        symbol: &str,
        order: RestingOrder,
    ) -> Result<OrderStatus, GatewayError> {
        match order.kind {
            OrderKind::Limit => {
                let (status, execution) = self.single_order_status(symbol, order.id).await?;
                Ok(classify_status(&status, execution))
            }
            OrderKind::Oco => {
                let list = self.client.get_order_list(order.id).await.map_err(map_err)?;
                let list_status = list["listOrderStatus"].as_str().unwrap_or_default().to_string();

                let mut total = Execution::default();
                let mut any_filled = false;
                for leg in list["orders"].as_array().into_iter().flatten() {
                    let Some(id) = leg["orderId"].as_u64() else {
                        continue;
                    };
                    let (status, execution) = self.single_order_status(symbol, id).await?;
                    total += execution;
                    any_filled |= status == "FILLED";
                }

                Ok(if any_filled {
                    OrderStatus::Filled(total)
                } else if list_status == "EXECUTING" {
                    OrderStatus::Open(total)
                } else {
                    OrderStatus::Closed(total)
                })
            }
        }
    }

    async fn symbol_rules(&self, symbol: &str) -> Result<SymbolRules, GatewayError> {
        let info = self
            .client
            .exchange_info(Some(symbol))
            .await
            .map_err(map_err)?;
        let entry = info
            .symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| GatewayError::Decode(format!("{symbol} missing from exchangeInfo")))?;

        let avg = match self.client.avg_price(symbol).await {
            Ok(avg) => Some(avg),
            Err(e) => {
                warn!(symbol, error = %e, "average price unavailable, percent bands ignored");
                None
            }
        };
        Ok(entry.to_rules(avg))
    }

    async fn tradable_bases(&self, quote: &str) -> Result<BTreeSet<String>, GatewayError> {
        let info = self.client.exchange_info(None).await.map_err(map_err)?;
        Ok(info
            .symbols
            .iter()
            .filter(|s| s.is_tradable_against(quote))
            .map(|s| s.base_asset.clone())
            .collect())
    }

    async fn free_balance(&self, asset: &str) -> Result<f64, GatewayError> {
        self.client.get_balance(asset).await.map_err(map_err)
    }

    async fn last_price(&self, symbol: &str) -> Result<f64, GatewayError> {
        self.client.ticker_price(symbol).await.map_err(map_err)
    }

    async fn subscribe_price(
        &self,
        symbol: &str,
    ) -> Result<mpsc::Receiver<PriceEvent>, GatewayError> {
        Ok(spawn_price_feed(&self.ws_base, symbol, self.feed))
    }
}

// -----------------------------------------------------------------------------
// Response decoding
// -----------------------------------------------------------------------------

/// Split an anyhow chain into exchange refusals, bad payloads and transport.
fn map_err(err: anyhow::Error) -> GatewayError {
    if let Some(api) = err.downcast_ref::<ApiError>() {
        return GatewayError::Rejected {
            code: api.code,
            message: api.msg.clone(),
        };
    }
    if err.chain().any(|cause| cause.is::<serde_json::Error>()) {
        return GatewayError::Decode(format!("{err:#}"));
    }
    GatewayError::Transport(format!("{err:#}"))
}

fn decode_f64(val: &Value) -> Result<f64, GatewayError> {
    parse_str_f64(val).map_err(|e| GatewayError::Decode(format!("{e:#}")))
}

fn parse_execution(body: &Value) -> Result<Execution, GatewayError> {
    Ok(Execution {
        executed_qty: decode_f64(&body["executedQty"])?,
        quote_qty: decode_f64(&body["cummulativeQuoteQty"])?,
    })
}

fn classify_status(status: &str, execution: Execution) -> OrderStatus {
    match status {
        "NEW" | "PARTIALLY_FILLED" | "PENDING_NEW" => OrderStatus::Open(execution),
        "FILLED" => OrderStatus::Filled(execution),
        _ => OrderStatus::Closed(execution),
    }
}

/// Build a `Fill` from a FULL order response; the average price is weighted
/// over the individual fills.
fn parse_fill(body: &Value) -> Result<Fill, GatewayError> {
    let quantity = decode_f64(&body["executedQty"])?;
    let quote_quantity = decode_f64(&body["cummulativeQuoteQty"])?;

    let (mut notional, mut filled) = (0.0, 0.0);
    for fill in body["fills"].as_array().into_iter().flatten() {
        let price = decode_f64(&fill["price"])?;
        let qty = decode_f64(&fill["qty"])?;
        notional += price * qty;
        filled += qty;
    }

    let avg_price = if filled > 0.0 {
        notional / filled
    } else if quantity > 0.0 {
        quote_quantity / quantity
    } else {
        0.0
    };

    Ok(Fill {
        quantity,
        quote_quantity,
        avg_price,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fill_average_is_volume_weighted() {
        let body = json!({
            "executedQty": "3.00000000",
            "cummulativeQuoteQty": "0.00000400",
            "fills": [
                {"price": "1.00000000", "qty": "1.00000000"},
                {"price": "2.00000000", "qty": "2.00000000"}
            ]
        });
        let fill = parse_fill(&body).unwrap();
        assert_eq!(fill.quantity, 3.0);
        assert!((fill.avg_price - 5.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn fill_without_fills_falls_back_to_quote_ratio() {
        let body = json!({"executedQty": "4", "cummulativeQuoteQty": "2"});
        assert_eq!(parse_fill(&body).unwrap().avg_price, 0.5);
    }

    #[test]
    fn api_errors_map_to_rejections() {
        let api = ApiError {
            method: "POST".into(),
            path: "/api/v3/order".into(),
            status: 400,
            code: Some(-1013),
            msg: "Filter failure: NOTIONAL".into(),
        };
        match map_err(anyhow::Error::new(api).context("placing order")) {
            GatewayError::Rejected { code, message } => {
                assert_eq!(code, Some(-1013));
                assert_eq!(message, "Filter failure: NOTIONAL");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn other_errors_map_to_transport() {
        let err = map_err(anyhow::anyhow!("connection reset"));
        assert!(matches!(err, GatewayError::Transport(_)));
    }

    #[test]
    fn order_statuses_classify() {
        let exec = Execution {
            executed_qty: 1.0,
            quote_qty: 0.25,
        };
        assert_eq!(classify_status("PARTIALLY_FILLED", exec), OrderStatus::Open(exec));
        assert_eq!(classify_status("FILLED", exec), OrderStatus::Filled(exec));
        assert_eq!(classify_status("EXPIRED", exec), OrderStatus::Closed(exec));
    }

    #[test]
    fn execution_reads_cumulative_quote() {
        let body = json!({"executedQty": "10.0", "cummulativeQuoteQty": "0.0015"});
        let exec = parse_execution(&body).unwrap();
        assert_eq!(exec.executed_qty, 10.0);
        assert_eq!(exec.quote_qty, 0.0015);
    }
}
