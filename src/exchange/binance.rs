//! Binance USDT-M futures adapter for the exchange capability.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use crate::config::ExchangeConfig;

use super::rate_limit::RateLimiter;
use super::traits::Exchange;
use super::types::{
    AccountBalance, CancelOrder, MarginInfo, MarginType, NewOrder, OrderResponse, Position,
    PositionSide, SymbolRiskLimit,
};

const FUTURES_BASE_URL: &str = "https://fapi.binance.com";
const FUTURES_TESTNET_URL: &str = "https://testnet.binancefuture.com";

const MAX_ATTEMPTS: u32 = 4;
const BACKOFF_BASE_MS: u64 = 500;

/// Binance futures API client.
pub struct BinanceFuturesClient {
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
    limiter: RateLimiter,
}

impl BinanceFuturesClient {
    /// Create a new client from configuration.
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = if config.testnet {
            FUTURES_TESTNET_URL.to_string()
        } else {
            FUTURES_BASE_URL.to_string()
        };

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            base_url,
            limiter: RateLimiter::default_tiers(),
        })
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current timestamp in milliseconds.
    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis() as u64
    }

    /// Backoff with deterministic sub-quarter-second jitter.
    fn backoff(attempt: u32) -> Duration {
        let base = BACKOFF_BASE_MS * (1u64 << attempt.min(4));
        let jitter = (SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0) as u64)
            % 250;
        Duration::from_millis(base + jitter)
    }

    fn is_retryable_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    /// Issue one request with rate limiting and retry on 429/5xx/timeouts.
    /// Signed requests re-sign with a fresh timestamp on each attempt.
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<T> {
        let mut last_err = None;

        for attempt in 0..MAX_ATTEMPTS {
            self.limiter.acquire().await;

            let mut query: String = params
                .iter()
                .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&");

            if signed {
                if !query.is_empty() {
                    query.push('&');
                }
                query.push_str(&format!("timestamp={}", Self::timestamp()));
                let signature = self.sign(&query);
                query.push_str(&format!("&signature={}", signature));
            }

            let url = if query.is_empty() {
                format!("{}{}", self.base_url, path)
            } else {
                format!("{}{}?{}", self.base_url, path, query)
            };

            let mut req = self.http.request(method.clone(), &url);
            if signed {
                req = req.header("X-MBX-APIKEY", &self.api_key);
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<T>()
                            .await
                            .with_context(|| format!("Failed to parse response from {}", path));
                    }

                    let body = response.text().await.unwrap_or_default();
                    if Self::is_retryable_status(status) && attempt + 1 < MAX_ATTEMPTS {
                        let wait = Self::backoff(attempt);
                        warn!(
                            %path,
                            status = status.as_u16(),
                            attempt,
                            wait_ms = wait.as_millis() as u64,
                            "Retryable venue error"
                        );
                        tokio::time::sleep(wait).await;
                        last_err = Some(anyhow!("{} returned {}: {}", path, status, body));
                        continue;
                    }
                    return Err(anyhow!("{} returned {}: {}", path, status, body));
                }
                Err(e) if e.is_timeout() && attempt + 1 < MAX_ATTEMPTS => {
                    let wait = Self::backoff(attempt);
                    warn!(%path, attempt, "Venue request timed out, retrying");
                    tokio::time::sleep(wait).await;
                    last_err = Some(e.into());
                }
                Err(e) => return Err(anyhow::Error::from(e).context(format!("Request to {} failed", path))),
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("request retries exhausted for {}", path)))
    }
}

// ==================== Wire types ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBalance {
    asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    available_balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    cross_un_pnl: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePositionRisk {
    symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    position_amt: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    entry_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    mark_price: Decimal,
    #[serde(rename = "unRealizedProfit", with = "rust_decimal::serde::str")]
    unrealized_profit: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    leverage: Decimal,
    margin_type: String,
    update_time: i64,
}

impl WirePositionRisk {
    fn into_position(self) -> Position {
        let side = PositionSide::from_size(self.position_amt);
        let margin_type = if self.margin_type.eq_ignore_ascii_case("isolated") {
            MarginType::Isolated
        } else {
            MarginType::Cross
        };
        Position {
            symbol: self.symbol,
            side,
            size: self.position_amt,
            entry_price: self.entry_price,
            mark_price: self.mark_price,
            unrealized_pnl: self.unrealized_profit,
            realized_pnl: Decimal::ZERO,
            leverage: self.leverage.to_u8().unwrap_or(1).max(1),
            margin_type,
            updated_at: Utc
                .timestamp_millis_opt(self.update_time)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePremiumIndex {
    #[allow(dead_code)]
    symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    mark_price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLeverageBracket {
    symbol: String,
    brackets: Vec<WireBracket>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBracket {
    initial_leverage: u8,
    #[serde(with = "rust_decimal::serde::str")]
    notional_cap: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    maint_margin_ratio: Decimal,
}

#[async_trait]
impl Exchange for BinanceFuturesClient {
    #[instrument(skip(self))]
    async fn get_account_balances(&self) -> Result<Vec<AccountBalance>> {
        let wire: Vec<WireBalance> = self
            .request(Method::GET, "/fapi/v2/balance", &[], true)
            .await
            .context("Failed to fetch account balances")?;

        Ok(wire
            .into_iter()
            .map(|b| AccountBalance {
                asset: b.asset,
                total: b.balance,
                available: b.available_balance,
                locked: b.balance - b.available_balance,
                unrealized_pnl: b.cross_un_pnl,
                realized_pnl: Decimal::ZERO,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn get_position(&self, symbol: &str) -> Result<Option<Position>> {
        let wire: Vec<WirePositionRisk> = self
            .request(
                Method::GET,
                "/fapi/v2/positionRisk",
                &[("symbol", symbol.to_string())],
                true,
            )
            .await
            .context("Failed to fetch position")?;

        Ok(wire
            .into_iter()
            .map(WirePositionRisk::into_position)
            .find(|p| p.is_open()))
    }

    #[instrument(skip(self))]
    async fn get_positions(&self) -> Result<Vec<Position>> {
        let wire: Vec<WirePositionRisk> = self
            .request(Method::GET, "/fapi/v2/positionRisk", &[], true)
            .await
            .context("Failed to fetch positions")?;

        Ok(wire
            .into_iter()
            .map(WirePositionRisk::into_position)
            .filter(Position::is_open)
            .collect())
    }

    #[instrument(skip(self))]
    async fn get_symbol_price(&self, symbol: &str) -> Result<Decimal> {
        let wire: WirePremiumIndex = self
            .request(
                Method::GET,
                "/fapi/v1/premiumIndex",
                &[("symbol", symbol.to_string())],
                false,
            )
            .await
            .context("Failed to fetch mark price")?;
        Ok(wire.mark_price)
    }

    #[instrument(skip(self, order), fields(symbol = %order.symbol))]
    async fn place_order(&self, order: NewOrder) -> Result<OrderResponse> {
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", order.symbol.clone()),
            ("side", format!("{:?}", order.side).to_uppercase()),
            (
                "type",
                match order.order_type {
                    super::types::OrderType::Limit => "LIMIT".to_string(),
                    super::types::OrderType::Market => "MARKET".to_string(),
                    super::types::OrderType::StopMarket => "STOP_MARKET".to_string(),
                    super::types::OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET".to_string(),
                },
            ),
            ("quantity", order.quantity.to_string()),
        ];
        if order.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        if let Some(price) = order.price {
            params.push(("price", price.to_string()));
        }
        if let Some(tif) = order.time_in_force {
            params.push(("timeInForce", format!("{:?}", tif).to_uppercase()));
        }
        if let Some(id) = &order.new_client_order_id {
            params.push(("newClientOrderId", id.clone()));
        }

        self.request(Method::POST, "/fapi/v1/order", &params, true)
            .await
            .context("Failed to place order")
    }

    #[instrument(skip(self, cancel), fields(symbol = %cancel.symbol))]
    async fn cancel_order(&self, cancel: CancelOrder) -> Result<()> {
        let mut params: Vec<(&str, String)> = vec![("symbol", cancel.symbol.clone())];
        if let Some(id) = cancel.order_id {
            params.push(("orderId", id.to_string()));
        }
        if let Some(id) = &cancel.orig_client_order_id {
            params.push(("origClientOrderId", id.clone()));
        }

        let _: serde_json::Value = self
            .request(Method::DELETE, "/fapi/v1/order", &params, true)
            .await
            .context("Failed to cancel order")?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        let _: serde_json::Value = self
            .request(
                Method::DELETE,
                "/fapi/v1/allOpenOrders",
                &[("symbol", symbol.to_string())],
                true,
            )
            .await
            .context("Failed to cancel all orders")?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OrderResponse>> {
        self.request(
            Method::GET,
            "/fapi/v1/openOrders",
            &[("symbol", symbol.to_string())],
            true,
        )
        .await
        .context("Failed to fetch open orders")
    }

    #[instrument(skip(self))]
    async fn set_leverage(&self, symbol: &str, leverage: u8) -> Result<()> {
        let _: serde_json::Value = self
            .request(
                Method::POST,
                "/fapi/v1/leverage",
                &[
                    ("symbol", symbol.to_string()),
                    ("leverage", leverage.to_string()),
                ],
                true,
            )
            .await
            .context("Failed to set leverage")?;
        debug!(%symbol, leverage, "Leverage updated");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_margin_type(&self, symbol: &str, margin_type: MarginType) -> Result<()> {
        let margin = match margin_type {
            MarginType::Cross => "CROSSED",
            MarginType::Isolated => "ISOLATED",
        };
        let _: serde_json::Value = self
            .request(
                Method::POST,
                "/fapi/v1/marginType",
                &[
                    ("symbol", symbol.to_string()),
                    ("marginType", margin.to_string()),
                ],
                true,
            )
            .await
            .context("Failed to set margin type")?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_margin_info(&self) -> Result<MarginInfo> {
        self.request(Method::GET, "/fapi/v2/account", &[], true)
            .await
            .context("Failed to fetch margin info")
    }

    #[instrument(skip(self))]
    async fn get_risk_limits(&self, symbol: &str) -> Result<SymbolRiskLimit> {
        let wire: Vec<WireLeverageBracket> = self
            .request(
                Method::GET,
                "/fapi/v1/leverageBracket",
                &[("symbol", symbol.to_string())],
                true,
            )
            .await
            .context("Failed to fetch leverage brackets")?;

        let bracket = wire
            .into_iter()
            .find(|b| b.symbol == symbol)
            .and_then(|b| b.brackets.into_iter().next())
            .ok_or_else(|| anyhow!("no leverage bracket for {}", symbol))?;

        Ok(SymbolRiskLimit {
            symbol: symbol.to_string(),
            max_leverage: bracket.initial_leverage,
            max_notional: bracket.notional_cap,
            maint_margin_rate: bracket.maint_margin_ratio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(base_url: String) -> BinanceFuturesClient {
        BinanceFuturesClient::new(&ExchangeConfig {
            api_key: "key".to_string(),
            secret_key: "secret".to_string(),
            testnet: true,
            paper: false,
        })
        .unwrap()
        .with_base_url(base_url)
    }

    #[tokio::test]
    async fn test_get_symbol_price() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/premiumIndex"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "symbol": "BTCUSDT",
                "markPrice": "20123.45"
            })))
            .mount(&server)
            .await;

        let client = test_client(server.uri());
        let price = client.get_symbol_price("BTCUSDT").await.unwrap();
        assert_eq!(price.to_string(), "20123.45");
    }

    #[tokio::test]
    async fn test_retries_on_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/premiumIndex"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/premiumIndex"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "symbol": "BTCUSDT",
                "markPrice": "100.0"
            })))
            .mount(&server)
            .await;

        let client = test_client(server.uri());
        let price = client.get_symbol_price("BTCUSDT").await.unwrap();
        assert_eq!(price.to_string(), "100.0");
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/premiumIndex"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(server.uri());
        assert!(client.get_symbol_price("BTCUSDT").await.is_err());
    }

    #[tokio::test]
    async fn test_position_mapping_skips_flat() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v2/positionRisk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "symbol": "BTCUSDT",
                    "positionAmt": "-0.5",
                    "entryPrice": "20000",
                    "markPrice": "19000",
                    "unRealizedProfit": "500",
                    "leverage": "10",
                    "marginType": "cross",
                    "updateTime": 1700000000000i64
                },
                {
                    "symbol": "ETHUSDT",
                    "positionAmt": "0",
                    "entryPrice": "0",
                    "markPrice": "3000",
                    "unRealizedProfit": "0",
                    "leverage": "5",
                    "marginType": "cross",
                    "updateTime": 1700000000000i64
                }
            ])))
            .mount(&server)
            .await;

        let client = test_client(server.uri());
        let positions = client.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "BTCUSDT");
        assert_eq!(positions[0].side, PositionSide::Short);
        assert_eq!(positions[0].leverage, 10);
    }
}
