//! Live connector for the exchange gateway (REST + WebSocket)
//!
//! Reads are wrapped in the bounded retry policy. Mutations are sent exactly
//! once; a failure is returned to the caller as-is.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::retry::{retry_read, RetryPolicy};
use super::signing::RequestSigner;
use super::stream::MarketStream;
use super::traits::{ExchangeConnector, StreamCallback, StreamChannel};
use crate::config::ExchangeConfig;
use crate::domain::{
    AccountBalance, CancelOutcome, Candle, ExchangePosition, OrderAck, OrderRequest,
    OrderStatusReport, Orderbook, Ticker,
};
use crate::error::{PerpError, Result};

#[derive(Debug, Deserialize)]
struct InstrumentInfo {
    #[serde(default = "default_tradable")]
    tradable: bool,
    min_order_size: Decimal,
}

fn default_tradable() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct CancelResponse {
    outcome: CancelOutcome,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct Empty {}

pub struct GatewayExchange {
    http: Client,
    base_url: String,
    signer: RequestSigner,
    retry: RetryPolicy,
    stream: Arc<MarketStream>,
}

impl GatewayExchange {
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| PerpError::Validation("exchange.api_key is required".to_string()))?;
        let api_secret = config
            .api_secret
            .clone()
            .ok_or_else(|| PerpError::Validation("exchange.api_secret is required".to_string()))?;

        let http = Client::builder()
            .user_agent(concat!("perpctl/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| PerpError::Internal(format!("failed to build HTTP client: {}", e)))?;

        let stream = Arc::new(MarketStream::new(
            config.ws_url.clone(),
            Duration::from_millis(config.connect_timeout_ms),
            Duration::from_millis(config.reconnect_base_ms),
            Duration::from_secs(config.reconnect_max_secs),
        ));

        info!(rest = %config.rest_url, ws = %config.ws_url, "Gateway connector configured");

        Ok(Self {
            http,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            signer: RequestSigner::new(api_key, api_secret),
            retry: RetryPolicy::from_config(config),
            stream,
        })
    }

    pub fn stream(&self) -> &Arc<MarketStream> {
        &self.stream
    }

    async fn request<T, B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, path);
        let body_text = match body {
            Some(b) => serde_json::to_string(b)?,
            None => String::new(),
        };

        let headers = self.signer.headers(method.as_str(), path, &body_text)?;
        let mut req = self.http.request(method.clone(), &url).headers(headers);
        if body.is_some() {
            req = req.header(CONTENT_TYPE, "application/json").body(body_text);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(classify_failure(&method, path, status, &text));
        }

        serde_json::from_str(&text).map_err(|e| {
            PerpError::terminal(format!("invalid gateway response for {} {}: {}", method, path, e))
        })
    }

    async fn get<T: DeserializeOwned>(&self, op: &str, path: String) -> Result<T> {
        retry_read(&self.retry, op, || {
            self.request::<T, Empty>(Method::GET, &path, None)
        })
        .await
    }
}

fn classify_failure(method: &Method, path: &str, status: StatusCode, text: &str) -> PerpError {
    let detail = serde_json::from_str::<ErrorBody>(text)
        .ok()
        .and_then(|b| match (b.code, b.message) {
            (Some(c), Some(m)) => Some(format!("{}: {}", c, m)),
            (None, Some(m)) => Some(m),
            (Some(c), None) => Some(c),
            (None, None) => None,
        })
        .unwrap_or_else(|| text.to_string());
    let message = format!("{} {} failed: status={} {}", method, path, status, detail);

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        PerpError::retryable(message)
    } else {
        PerpError::terminal(message)
    }
}

#[async_trait]
impl ExchangeConnector for GatewayExchange {
    fn name(&self) -> &'static str {
        "gateway"
    }

    fn is_paper(&self) -> bool {
        false
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        self.get("get_ticker", format!("/v1/ticker/{}", symbol)).await
    }

    async fn get_orderbook(&self, symbol: &str, depth: usize) -> Result<Orderbook> {
        self.get(
            "get_orderbook",
            format!("/v1/orderbook/{}?depth={}", symbol, depth),
        )
        .await
    }

    async fn get_candles(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>> {
        self.get("get_candles", format!("/v1/candles/{}?limit={}", symbol, limit))
            .await
    }

    async fn get_account_balance(&self) -> Result<AccountBalance> {
        self.get("get_account_balance", "/v1/account".to_string()).await
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>> {
        self.get("get_positions", "/v1/positions".to_string()).await
    }

    async fn is_valid_symbol(&self, symbol: &str) -> Result<bool> {
        let path = format!("/v1/instruments/{}", symbol);
        match self.get::<InstrumentInfo>("is_valid_symbol", path).await {
            Ok(info) => Ok(info.tradable),
            Err(PerpError::Exchange { message, .. }) if message.contains("status=404") => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_minimum_order_size(&self, symbol: &str) -> Result<Decimal> {
        let info: InstrumentInfo = self
            .get("get_minimum_order_size", format!("/v1/instruments/{}", symbol))
            .await?;
        Ok(info.min_order_size)
    }

    async fn get_order_status(&self, exchange_order_id: &str) -> Result<OrderStatusReport> {
        self.get("get_order_status", format!("/v1/orders/{}", exchange_order_id))
            .await
    }

    #[instrument(skip(self, request), fields(symbol = %request.symbol, client_id = %request.client_order_id))]
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        if request.order_type.is_trigger() {
            return Err(PerpError::Validation(
                "trigger orders go through place_stop_order".to_string(),
            ));
        }
        let ack: OrderAck = self
            .request(Method::POST, "/v1/orders", Some(request))
            .await?;
        debug!(exchange_order_id = %ack.exchange_order_id, status = %ack.status, "order accepted");
        Ok(ack)
    }

    #[instrument(skip(self, request), fields(symbol = %request.symbol, client_id = %request.client_order_id))]
    async fn place_stop_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        if !request.order_type.is_trigger() || request.stop_price.is_none() {
            return Err(PerpError::Validation(
                "stop orders need a trigger type and stop price".to_string(),
            ));
        }
        self.request(Method::POST, "/v1/orders", Some(request)).await
    }

    async fn cancel_order(&self, exchange_order_id: &str) -> Result<CancelOutcome> {
        let path = format!("/v1/orders/{}", exchange_order_id);
        let resp: CancelResponse = self.request::<_, Empty>(Method::DELETE, &path, None).await?;
        Ok(resp.outcome)
    }

    async fn subscribe(
        &self,
        channel: StreamChannel,
        symbols: &[String],
        callback: StreamCallback,
    ) -> Result<()> {
        self.stream.subscribe(channel, symbols, callback).await
    }

    async fn ping(&self) -> Result<()> {
        #[derive(Deserialize)]
        struct Pong {}
        let _: Pong = self
            .request::<_, Empty>(Method::GET, "/v1/ping", None)
            .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.stream.is_connected() {
            warn!("disconnect requested while stream is already down");
        }
        self.stream.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_retryable() {
        let err = classify_failure(
            &Method::GET,
            "/v1/ticker/BTC-PERP",
            StatusCode::BAD_GATEWAY,
            "upstream down",
        );
        assert!(err.is_retryable());
        let err = classify_failure(
            &Method::GET,
            "/v1/account",
            StatusCode::TOO_MANY_REQUESTS,
            "",
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_client_errors_are_terminal_and_keep_detail() {
        let err = classify_failure(
            &Method::POST,
            "/v1/orders",
            StatusCode::BAD_REQUEST,
            r#"{"code":"INSUFFICIENT_MARGIN","message":"not enough margin"}"#,
        );
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("INSUFFICIENT_MARGIN"));
    }

    #[test]
    fn test_requires_credentials() {
        let cfg = ExchangeConfig::default();
        assert!(GatewayExchange::new(&cfg).is_err());

        let cfg = ExchangeConfig {
            api_key: Some("k".into()),
            api_secret: Some("s".into()),
            ..ExchangeConfig::default()
        };
        let gw = GatewayExchange::new(&cfg).unwrap();
        assert_eq!(gw.name(), "gateway");
        assert!(!gw.is_paper());
    }
}
