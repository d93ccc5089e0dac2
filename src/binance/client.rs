// =============================================================================
// Binance REST API Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the bot and Binance servers.
//
// Non-2xx answers become an `ApiError` inside the returned `anyhow::Error`, so
// callers can tell an exchange refusal from a transport failure by
// downcasting.
// =============================================================================

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::Method;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::binance::filters::ExchangeInfo;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Error body returned by Binance for a refused request.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Binance {method} {path} returned {status}: {msg} (code {code:?})")]
pub struct ApiError {
    pub method: String,
    pub path: String,
    pub status: u16,
    /// Binance error code, e.g. -2010 for insufficient balance.
    pub code: Option<i64>,
    pub msg: String,
}

impl ApiError {
    fn from_body(method: &Method, path: &str, status: u16, body: &Value, retry_after: Option<&str>) -> Self {
        let mut msg = body["msg"]
            .as_str()
            .map(str::to_owned)
            .unwrap_or_else(|| body.to_string());
        match (status, retry_after) {
            (418, Some(secs)) => msg = format!("IP banned for {secs} seconds: {msg}"),
            (429, Some(secs)) => msg = format!("rate limited for {secs} seconds: {msg}"),
            _ => {}
        }
        Self {
            method: method.to_string(),
            path: path.to_string(),
            status,
            code: body["code"].as_i64(),
            msg,
        }
    }
}

/// Binance REST API client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BinanceClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `BinanceClient`.
    ///
    /// # Arguments
    /// * `api_key`  — Binance API key (sent as a header, never in query params).
    /// * `secret`   — Binance secret key used exclusively for HMAC signing.
    /// * `base_url` — REST root, e.g. `https://api.binance.com`.
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self> {
        let api_key = api_key.into();
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut default_headers = HeaderMap::new();
        // The API key header is required for all signed endpoints.
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }
        default_headers.insert("Accept", HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build reqwest client")?;

        debug!(base_url = %base_url, "BinanceClient initialised");

        Ok(Self {
            secret: secret.into(),
            base_url,
            client,
        })
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    pub fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Account / balance
    // -------------------------------------------------------------------------

    /// GET /api/v3/account (signed).
    #[instrument(skip(self), name = "binance::get_account")]
    pub async fn get_account(&self) -> Result<Value> {
        self.request(Method::GET, "/api/v3/account", "", true).await
    }

    /// Convenience: extract the free balance for a single `asset`.
    #[instrument(skip(self), name = "binance::get_balance")]
    pub async fn get_balance(&self, asset: &str) -> Result<f64> {
        let account = self.get_account().await?;

        let balances = account["balances"]
            .as_array()
            .context("account response missing 'balances' array")?;

        for b in balances {
            if b["asset"].as_str() == Some(asset) {
                let free = parse_str_f64(&b["free"])?;
                debug!(asset, free, "balance retrieved");
                return Ok(free);
            }
        }

        warn!(asset, "asset not found in balances, returning 0.0");
        Ok(0.0)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /api/v3/order (signed) — submit a new order.
    ///
    /// `params` carries everything except the signature fields, e.g.
    /// `symbol=ABCBTC&side=SELL&type=MARKET&quantity=12`.
    #[instrument(skip(self), name = "binance::place_order")]
    pub async fn place_order(&self, params: &str) -> Result<Value> {
        let body = self.request(Method::POST, "/api/v3/order", params, true).await?;
        debug!(order_id = %body["orderId"], status = %body["status"], "order placed");
        Ok(body)
    }

    /// POST /api/v3/order/oco (signed) — submit a one-cancels-the-other pair.
    #[instrument(skip(self), name = "binance::place_oco")]
    pub async fn place_oco(&self, params: &str) -> Result<Value> {
        let body = self
            .request(Method::POST, "/api/v3/order/oco", params, true)
            .await?;
        debug!(order_list_id = %body["orderListId"], status = %body["listOrderStatus"], "OCO placed");
        Ok(body)
    }

    /// DELETE /api/v3/order (signed) — cancel an existing order.
    #[instrument(skip(self), name = "binance::cancel_order")]
    pub async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<Value> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        self.request(Method::DELETE, "/api/v3/order", &params, true)
            .await
    }

    /// DELETE /api/v3/orderList (signed) — cancel an OCO list.
    #[instrument(skip(self), name = "binance::cancel_order_list")]
    pub async fn cancel_order_list(&self, symbol: &str, order_list_id: u64) -> Result<Value> {
        let params = format!("symbol={symbol}&orderListId={order_list_id}");
        self.request(Method::DELETE, "/api/v3/orderList", &params, true)
            .await
    }

    /// GET /api/v3/order (signed) — query a single order.
    #[instrument(skip(self), name = "binance::get_order")]
    pub async fn get_order(&self, symbol: &str, order_id: u64) -> Result<Value> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        self.request(Method::GET, "/api/v3/order", &params, true).await
    }

    /// GET /api/v3/orderList (signed) — query an OCO list.
    #[instrument(skip(self), name = "binance::get_order_list")]
    pub async fn get_order_list(&self, order_list_id: u64) -> Result<Value> {
        let params = format!("orderListId={order_list_id}");
        self.request(Method::GET, "/api/v3/orderList", &params, true)
            .await
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /api/v3/exchangeInfo, for one symbol or the whole exchange.
    #[instrument(skip(self), name = "binance::exchange_info")]
    pub async fn exchange_info(&self, symbol: Option<&str>) -> Result<ExchangeInfo> {
        let params = symbol.map(|s| format!("symbol={s}")).unwrap_or_default();
        let body = self
            .request(Method::GET, "/api/v3/exchangeInfo", &params, false)
            .await?;
        let info: ExchangeInfo =
            serde_json::from_value(body).context("failed to decode exchangeInfo symbols")?;
        debug!(count = info.symbols.len(), "exchange info retrieved");
        Ok(info)
    }

    /// GET /api/v3/avgPrice — the 5-minute average price.
    #[instrument(skip(self), name = "binance::avg_price")]
    pub async fn avg_price(&self, symbol: &str) -> Result<f64> {
        let params = format!("symbol={symbol}");
        let body = self
            .request(Method::GET, "/api/v3/avgPrice", &params, false)
            .await?;
        parse_str_f64(&body["price"])
    }

    /// GET /api/v3/ticker/price — the last traded price.
    #[instrument(skip(self), name = "binance::ticker_price")]
    pub async fn ticker_price(&self, symbol: &str) -> Result<f64> {
        let params = format!("symbol={symbol}");
        let body = self
            .request(Method::GET, "/api/v3/ticker/price", &params, false)
            .await?;
        parse_str_f64(&body["price"])
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    async fn request(&self, method: Method, path: &str, params: &str, signed: bool) -> Result<Value> {
        let qs = if signed {
            self.signed_query(params)
        } else {
            params.to_string()
        };
        let url = if qs.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, qs)
        };

        let resp = self
            .client
            .request(method.clone(), &url)
            .send()
            .await
            .with_context(|| format!("{method} {path} request failed"))?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            let err = ApiError::from_body(&method, path, status.as_u16(), &body, retry_after.as_deref());
            warn!(error = %err, "Binance request refused");
            return Err(err.into());
        }

        Ok(body)
    }
}

/// Parse a JSON value that may be either a string or a number into `f64`.
pub fn parse_str_f64(val: &Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
