// =============================================================================
// Quickflip — Main Entry Point
// =============================================================================
//
// One cycle per run: buy the chosen coin at market, then sell it under the
// configured profit and stop targets. Ctrl-C bails out (or aborts when the
// bailout is disabled); a second Ctrl-C exits immediately.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod binance;
mod cycle;
mod error;
mod execution;
mod exit;
mod gateway;
mod limits;
mod market_data;
mod position_engine;
mod runtime_config;
mod types;

#[cfg(test)]
mod testkit;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::binance::{BinanceClient, BinanceGateway};
use crate::cycle::TradeCycle;
use crate::error::TradeError;
use crate::exit::bailout::InterruptController;
use crate::runtime_config::{TradeConfig, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("quickflip starting");

    let config_path =
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = TradeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        TradeConfig::default()
    });
    config.apply_env_overrides(|key| std::env::var(key).ok())?;

    // ── 2. Exchange access ───────────────────────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").context("BINANCE_API_KEY is not set")?;
    let api_secret =
        std::env::var("BINANCE_API_SECRET").context("BINANCE_API_SECRET is not set")?;

    let client = BinanceClient::new(api_key, api_secret, config.rest_url.clone())?;
    let gateway = Arc::new(BinanceGateway::new(
        client,
        config.ws_url.clone(),
        config.feed_settings(),
    ));

    // ── 3. Interrupt handling ────────────────────────────────────────────
    let interrupts = Arc::new(InterruptController::new(config.bailout));
    tokio::spawn(interrupts.clone().run());

    // ── 4. Run the cycle ─────────────────────────────────────────────────
    let cycle = TradeCycle::new(config, gateway, interrupts)?;
    let input = tokio::io::BufReader::new(tokio::io::stdin());

    let result = match cycle.choose_pair(input).await {
        Ok(pair) => cycle.run(&pair).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(report) => {
            match serde_json::to_string(&report) {
                Ok(json) => info!(report = %json, "cycle report"),
                Err(e) => warn!(error = %e, "failed to serialize cycle report"),
            }
            Ok(())
        }
        Err(TradeError::Interrupted) => {
            warn!("interrupted before any order, exiting");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "cycle failed");
            Err(e.into())
        }
    }
}
