// =============================================================================
// Trade Stream — last-traded price feed from the Binance aggTrade stream
// =============================================================================
//
// One spawned task per subscription. It connects to `<ws>/ws/<symbol>@aggTrade`,
// forwards every price change as a `PriceEvent::Tick`, and reconnects with a
// fixed delay when the socket drops. After `max_reconnects` consecutive failed
// attempts the channel is closed, which the monitor reads as a dead feed.
//
// The channel is bounded and never awaited on: when the consumer is busy the
// tick is dropped rather than queued.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::types::{PriceEvent, PriceTick};

/// Capacity of the tick channel handed to the monitor.
const FEED_CAPACITY: usize = 64;

/// Reconnect policy for a price feed.
#[derive(Debug, Clone, Copy)]
pub struct FeedSettings {
    pub max_reconnects: u32,
    pub reconnect_delay: Duration,
}

/// Why a single connection ended.
enum StreamEnd {
    /// The socket closed or errored; worth reconnecting.
    Dropped { delivered: bool },
    /// Nobody is listening any more.
    ReceiverGone,
}

/// Spawn the aggTrade feed for `symbol` and return its receiving end.
pub fn spawn_price_feed(
    ws_base: &str,
    symbol: &str,
    settings: FeedSettings,
) -> mpsc::Receiver<PriceEvent> {
    let (tx, rx) = mpsc::channel(FEED_CAPACITY);
    let url = format!(
        "{}/ws/{}@aggTrade",
        ws_base.trim_end_matches('/'),
        symbol.to_lowercase()
    );
    let symbol = symbol.to_string();

    tokio::spawn(async move {
        let mut failures: u32 = 0;
        let mut last_price: Option<f64> = None;

        loop {
            match run_trade_stream(&url, &symbol, &tx, &mut last_price).await {
                Ok(StreamEnd::ReceiverGone) => {
                    debug!(symbol = %symbol, "price feed receiver dropped, stopping");
                    return;
                }
                Ok(StreamEnd::Dropped { delivered }) => {
                    failures = if delivered { 1 } else { failures + 1 };
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "trade stream connection failed");
                    failures += 1;
                }
            }

            if failures > settings.max_reconnects {
                error!(
                    symbol = %symbol,
                    attempts = failures,
                    "trade stream could not be re-established, closing price feed"
                );
                return;
            }

            if tx.send(PriceEvent::Disrupted { attempt: failures }).await.is_err() {
                return;
            }
            tokio::time::sleep(settings.reconnect_delay).await;
        }
    });

    rx
}

/// Stream one connection's worth of trades into `tx`.
async fn run_trade_stream(
    url: &str,
    symbol: &str,
    tx: &mpsc::Sender<PriceEvent>,
    last_price: &mut Option<f64>,
) -> Result<StreamEnd> {
    info!(url = %url, symbol = %symbol, "connecting to trade WebSocket");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to trade WebSocket")?;

    info!(symbol = %symbol, "trade WebSocket connected");
    let (_write, mut read) = ws_stream.split();
    let mut delivered = false;

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                let tick = match parse_agg_trade(&text) {
                    Ok(tick) => tick,
                    Err(e) => {
                        warn!(error = %e, "failed to parse aggTrade message");
                        continue;
                    }
                };
                if *last_price == Some(tick.price) {
                    continue;
                }
                *last_price = Some(tick.price);

                match tx.try_send(PriceEvent::Tick(tick)) {
                    Ok(()) => delivered = true,
                    Err(TrySendError::Full(_)) => {
                        debug!(symbol = %symbol, price = tick.price, "monitor busy, tick dropped");
                    }
                    Err(TrySendError::Closed(_)) => return Ok(StreamEnd::ReceiverGone),
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "trade WebSocket read error");
                return Ok(StreamEnd::Dropped { delivered });
            }
            None => {
                warn!(symbol = %symbol, "trade WebSocket stream ended");
                return Ok(StreamEnd::Dropped { delivered });
            }
        }
    }
}

/// Parse a Binance aggTrade message.
///
/// Expected shape:
/// ```json
/// { "e": "aggTrade", "s": "ABCBTC", "p": "0.00012300", "q": "12", "T": 1700000000000 }
/// ```
fn parse_agg_trade(text: &str) -> Result<PriceTick> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse aggTrade JSON")?;

    let price: f64 = root["p"]
        .as_str()
        .context("missing field p")?
        .parse()
        .context("failed to parse price")?;

    let trade_time_ms = root["T"].as_i64().unwrap_or_default();

    Ok(PriceTick {
        price,
        trade_time_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_agg_trade_price_and_time() {
        let msg = r#"{"e":"aggTrade","E":1700000000001,"s":"ABCBTC","a":5,"p":"0.00012300","q":"12.0","f":1,"l":2,"T":1700000000000,"m":true,"M":true}"#;
        let tick = parse_agg_trade(msg).unwrap();
        assert_eq!(tick.price, 0.000_123);
        assert_eq!(tick.trade_time_ms, 1_700_000_000_000);
    }

    #[test]
    fn rejects_message_without_price() {
        assert!(parse_agg_trade(r#"{"e":"aggTrade","q":"1"}"#).is_err());
        assert!(parse_agg_trade("not json").is_err());
    }

    #[tokio::test]
    async fn unreachable_feed_closes_after_max_reconnects() {
        let settings = FeedSettings {
            max_reconnects: 2,
            reconnect_delay: Duration::from_millis(1),
        };
        // Nothing listens on port 9 locally; every connect fails fast.
        let mut rx = spawn_price_feed("ws://127.0.0.1:9", "ABCBTC", settings);

        let mut disruptions = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                PriceEvent::Disrupted { attempt } => disruptions.push(attempt),
                PriceEvent::Tick(_) => panic!("unexpected tick"),
            }
        }
        assert_eq!(disruptions, vec![1, 2]);
    }
}
