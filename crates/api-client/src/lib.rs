use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use configuration::VenueConfig;
use core_types::{Kline, ProposedAction};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest_middleware::ClientWithMiddleware;
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::sign_request;
use crate::circuit::VenueCircuit;
use crate::error::ApiError;

mod auth;
pub mod circuit;
pub mod error;
pub mod http_client;
pub mod live_connector;
pub mod responses;

pub use live_connector::LiveConnector;
pub use responses::{
    AmendRequest, ApiErrorResponse, BalanceResponse, FundingInfo, MarketSnapshot, OrderResponse,
    PlaceAck, PositionResponse, VenueEvent,
};

/// The abstract interface for the exchange the Engine Runtime trades
/// against. Exchange wire codecs, credential signing, and rate-limit
/// arithmetic are this trait's concern alone; nothing above it knows it is
/// talking to Binance.
#[async_trait]
pub trait Venue: Send + Sync {
    async fn market_snapshot(&self, symbol: &str) -> Result<MarketSnapshot, ApiError>;
    async fn funding(&self, symbol: &str) -> Result<FundingInfo, ApiError>;
    async fn balances(&self) -> Result<Vec<BalanceResponse>, ApiError>;
    async fn positions(&self) -> Result<Vec<PositionResponse>, ApiError>;
    async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderResponse>, ApiError>;

    /// Idempotent by `action.client_id`: submitting the same `client_id`
    /// twice MUST NOT create two venue orders.
    async fn place(&self, action: &ProposedAction) -> Result<PlaceAck, ApiError>;
    async fn amend(&self, client_id: Uuid, amendment: AmendRequest) -> Result<(), ApiError>;
    async fn cancel(&self, client_id: Uuid) -> Result<(), ApiError>;
    async fn cancel_all(&self, symbol: Option<&str>) -> Result<(), ApiError>;

    async fn history(&self, symbol: &str, since: DateTime<Utc>) -> Result<Vec<OrderResponse>, ApiError>;

    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Vec<Kline>, ApiError>;

    async fn set_leverage(&self, symbol: &str, leverage: u8) -> Result<(), ApiError>;

    /// Subscription stream of order/position/balance updates and disconnect
    /// notifications.
    fn subscribe(&self) -> Result<mpsc::Receiver<VenueEvent>, ApiError>;
}

/// Credentials sourced from the environment (`BINANCE_API_KEY`,
/// `BINANCE_API_SECRET`), never logged or `Debug`-derived.
pub struct VenueCredentials {
    pub api_key: String,
    pub api_secret: String,
}

/// The concrete `Venue` implementor for Binance USD-M futures + spot.
pub struct BinanceClient {
    client: ClientWithMiddleware,
    base_url: String,
    ws: LiveConnector,
    api_secret: String,
    circuit: VenueCircuit,
    listen_key: std::sync::Mutex<Option<String>>,
}

impl BinanceClient {
    pub fn new(live_mode: bool, venue: &VenueConfig, credentials: VenueCredentials) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-MBX-APIKEY",
            HeaderValue::from_str(&credentials.api_key).expect("invalid API key header value"),
        );

        Self {
            client: http_client::build_http_client(headers),
            base_url: venue.rest_base_url.clone(),
            ws: LiveConnector::new(live_mode),
            api_secret: credentials.api_secret,
            circuit: VenueCircuit::new(),
            listen_key: std::sync::Mutex::new(None),
        }
    }

    /// Obtains (or renews) the `listenKey` the user-data stream is keyed on.
    /// Unlike every other authenticated endpoint this one is not
    /// HMAC-signed, only API-key-headered, per Binance's own listenKey
    /// contract.
    pub async fn refresh_listen_key(&self) -> Result<(), ApiError> {
        #[derive(Deserialize)]
        struct ListenKeyResponse {
            #[serde(rename = "listenKey")]
            listen_key: String,
        }

        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        self.guard_circuit()?;
        let result: Result<ListenKeyResponse, ApiError> = async {
            self.client
                .post(&url)
                .send()
                .await?
                .json::<ListenKeyResponse>()
                .await
                .map_err(ApiError::from)
        }
        .await;
        self.record_outcome(&result);
        let response = result?;

        *self.listen_key.lock().expect("listen_key mutex poisoned") = Some(response.listen_key);
        Ok(())
    }

    fn guard_circuit(&self) -> Result<(), ApiError> {
        if let Some(retry_after_secs) = self.circuit.check() {
            return Err(ApiError::CircuitOpen { retry_after_secs });
        }
        Ok(())
    }

    fn record_outcome<T>(&self, result: &Result<T, ApiError>) {
        match result {
            Ok(_) => self.circuit.record_success(),
            Err(e) if e.is_retryable() => self.circuit.record_failure(),
            Err(_) => {}
        }
    }

    async fn _get_signed<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &mut BTreeMap<&str, String>,
    ) -> Result<T, ApiError> {
        self.guard_circuit()?;
        let result = self.signed_request(reqwest::Method::GET, path, params).await;
        self.record_outcome(&result);
        result
    }

    async fn _post_signed<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &mut BTreeMap<&str, String>,
    ) -> Result<T, ApiError> {
        self.guard_circuit()?;
        let result = self
            .signed_request(reqwest::Method::POST, path, params)
            .await;
        self.record_outcome(&result);
        result
    }

    async fn signed_request<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &mut BTreeMap<&str, String>,
    ) -> Result<T, ApiError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis();
        params.insert("timestamp", timestamp.to_string());

        let query_string = serde_qs::to_string(params)
            .map_err(|e| ApiError::InvalidData(format!("failed to encode query string: {e}")))?;
        let signature = sign_request(&self.api_secret, &query_string);

        let url = format!(
            "{}{}?{}&signature={}",
            self.base_url, path, query_string, signature
        );

        let response = match method {
            reqwest::Method::GET => self.client.get(&url).send().await?,
            reqwest::Method::POST => self.client.post(&url).send().await?,
            reqwest::Method::DELETE => self.client.delete(&url).send().await?,
            _ => unreachable!("signed_request only used for GET/POST/DELETE"),
        };
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str::<T>(&text).map_err(|e| ApiError::Deserialization(e.to_string()))
        } else {
            let api_error: ApiErrorResponse = serde_json::from_str(&text).map_err(|e| {
                ApiError::Deserialization(format!(
                    "failed to deserialize error response: {e}. original text: {text}"
                ))
            })?;
            Err(ApiError::BinanceError {
                code: api_error.code,
                msg: api_error.msg,
            })
        }
    }
}

// Intermediate struct for deserializing klines from Binance API.
#[derive(Deserialize)]
struct RawKline(i64, String, String, String, String, String, i64, String, i64, String, String, String);

#[async_trait]
impl Venue for BinanceClient {
    async fn market_snapshot(&self, symbol: &str) -> Result<MarketSnapshot, ApiError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RawTicker {
            last_price: String,
            mark_price: String,
            index_price: String,
            bid_price: String,
            ask_price: String,
        }

        let url = format!("{}/fapi/v1/premiumIndex", self.base_url);
        self.guard_circuit()?;
        let result: Result<RawTicker, ApiError> = async {
            self.client
                .get(&url)
                .query(&[("symbol", symbol)])
                .send()
                .await?
                .json::<RawTicker>()
                .await
                .map_err(ApiError::from)
        }
        .await;
        self.record_outcome(&result);
        let raw = result?;

        Ok(MarketSnapshot {
            last: Decimal::from_str(&raw.last_price)
                .map_err(|e| ApiError::Deserialization(e.to_string()))?,
            mark: Decimal::from_str(&raw.mark_price)
                .map_err(|e| ApiError::Deserialization(e.to_string()))?,
            index: Decimal::from_str(&raw.index_price)
                .map_err(|e| ApiError::Deserialization(e.to_string()))?,
            bid: Decimal::from_str(&raw.bid_price)
                .map_err(|e| ApiError::Deserialization(e.to_string()))?,
            ask: Decimal::from_str(&raw.ask_price)
                .map_err(|e| ApiError::Deserialization(e.to_string()))?,
            ts: Utc::now(),
        })
    }

    async fn funding(&self, symbol: &str) -> Result<FundingInfo, ApiError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RawFunding {
            last_funding_rate: String,
            next_funding_time: i64,
        }

        let url = format!("{}/fapi/v1/premiumIndex", self.base_url);
        self.guard_circuit()?;
        let result: Result<RawFunding, ApiError> = async {
            self.client
                .get(&url)
                .query(&[("symbol", symbol)])
                .send()
                .await?
                .json::<RawFunding>()
                .await
                .map_err(ApiError::from)
        }
        .await;
        self.record_outcome(&result);
        let raw = result?;

        Ok(FundingInfo {
            rate: Decimal::from_str(&raw.last_funding_rate)
                .map_err(|e| ApiError::Deserialization(e.to_string()))?,
            next_funding_ts: Utc
                .timestamp_millis_opt(raw.next_funding_time)
                .single()
                .ok_or_else(|| ApiError::InvalidData("invalid next_funding_time".into()))?,
        })
    }

    async fn balances(&self) -> Result<Vec<BalanceResponse>, ApiError> {
        let mut params = BTreeMap::new();
        self._get_signed("/fapi/v2/balance", &mut params).await
    }

    async fn positions(&self) -> Result<Vec<PositionResponse>, ApiError> {
        let mut params = BTreeMap::new();
        self._get_signed("/fapi/v2/positionRisk", &mut params).await
    }

    async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderResponse>, ApiError> {
        let mut params = BTreeMap::new();
        if let Some(symbol) = symbol {
            params.insert("symbol", symbol.to_string());
        }
        self._get_signed("/fapi/v1/openOrders", &mut params).await
    }

    async fn place(&self, action: &ProposedAction) -> Result<PlaceAck, ApiError> {
        let mut params = BTreeMap::new();
        params.insert("symbol", action.symbol.clone());
        params.insert("side", format!("{:?}", action.side).to_uppercase());
        params.insert("type", format!("{:?}", action.kind).to_uppercase());
        params.insert("quantity", action.qty.to_string());
        params.insert("newClientOrderId", action.client_id.to_string());
        if let Some(price) = action.limit_price {
            params.insert("price", price.to_string());
        }
        if let Some(stop) = action.stop_price {
            params.insert("stopPrice", stop.to_string());
        }
        if action.reduce_only {
            params.insert("reduceOnly", "true".to_string());
        }

        let response: OrderResponse = self._post_signed("/fapi/v1/order", &mut params).await?;
        Ok(PlaceAck {
            client_id: action.client_id,
            venue_id: Some(response.order_id.to_string()),
        })
    }

    async fn amend(&self, client_id: Uuid, amendment: AmendRequest) -> Result<(), ApiError> {
        let mut params = BTreeMap::new();
        params.insert("origClientOrderId", client_id.to_string());
        if let Some(price) = amendment.price {
            params.insert("price", price.to_string());
        }
        if let Some(qty) = amendment.qty {
            params.insert("quantity", qty.to_string());
        }
        if let Some(trigger) = amendment.trigger {
            params.insert("stopPrice", trigger.to_string());
        }
        self._post_signed::<serde_json::Value>("/fapi/v1/order", &mut params)
            .await?;
        Ok(())
    }

    async fn cancel(&self, client_id: Uuid) -> Result<(), ApiError> {
        let mut params = BTreeMap::new();
        params.insert("origClientOrderId", client_id.to_string());
        self.guard_circuit()?;
        let result = self
            .signed_request::<serde_json::Value>(reqwest::Method::DELETE, "/fapi/v1/order", &mut params)
            .await;
        self.record_outcome(&result);
        result.map(|_| ())
    }

    async fn cancel_all(&self, symbol: Option<&str>) -> Result<(), ApiError> {
        let mut params = BTreeMap::new();
        if let Some(symbol) = symbol {
            params.insert("symbol", symbol.to_string());
        }
        self._post_signed::<serde_json::Value>("/fapi/v1/allOpenOrders", &mut params)
            .await?;
        Ok(())
    }

    async fn history(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<OrderResponse>, ApiError> {
        let mut params = BTreeMap::new();
        params.insert("symbol", symbol.to_string());
        params.insert("startTime", since.timestamp_millis().to_string());
        self._get_signed("/fapi/v1/allOrders", &mut params).await
    }

    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Vec<Kline>, ApiError> {
        let url = format!("{}/fapi/v1/klines", self.base_url);

        self.guard_circuit()?;
        let result: Result<Vec<RawKline>, ApiError> = async {
            self.client
                .get(&url)
                .query(&[
                    ("symbol", symbol),
                    ("interval", interval),
                    ("startTime", &start_time.timestamp_millis().to_string()),
                    ("endTime", &end_time.timestamp_millis().to_string()),
                    ("limit", "1000"),
                ])
                .send()
                .await?
                .json::<Vec<RawKline>>()
                .await
                .map_err(ApiError::from)
        }
        .await;
        self.record_outcome(&result);
        let response = result?;

        response
            .into_iter()
            .map(|raw| {
                Ok(Kline {
                    symbol: symbol.to_string(),
                    open_time: Utc
                        .timestamp_millis_opt(raw.0)
                        .single()
                        .ok_or_else(|| ApiError::InvalidData(format!("invalid open_time: {}", raw.0)))?,
                    open: Decimal::from_str(&raw.1).map_err(|e| ApiError::Deserialization(e.to_string()))?,
                    high: Decimal::from_str(&raw.2).map_err(|e| ApiError::Deserialization(e.to_string()))?,
                    low: Decimal::from_str(&raw.3).map_err(|e| ApiError::Deserialization(e.to_string()))?,
                    close: Decimal::from_str(&raw.4).map_err(|e| ApiError::Deserialization(e.to_string()))?,
                    volume: Decimal::from_str(&raw.5).map_err(|e| ApiError::Deserialization(e.to_string()))?,
                    close_time: Utc
                        .timestamp_millis_opt(raw.6)
                        .single()
                        .ok_or_else(|| ApiError::InvalidData(format!("invalid close_time: {}", raw.6)))?,
                    interval: interval.to_string(),
                })
            })
            .collect()
    }

    async fn set_leverage(&self, symbol: &str, leverage: u8) -> Result<(), ApiError> {
        let mut params = BTreeMap::new();
        params.insert("symbol", symbol.to_string());
        params.insert("leverage", leverage.to_string());

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct LeverageResponse {
            #[allow(dead_code)]
            leverage: u8,
            #[allow(dead_code)]
            symbol: String,
        }
        self._post_signed::<LeverageResponse>("/fapi/v1/leverage", &mut params)
            .await?;
        Ok(())
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<VenueEvent>, ApiError> {
        let listen_key = self
            .listen_key
            .lock()
            .expect("listen_key mutex poisoned")
            .clone()
            .ok_or_else(|| {
                ApiError::InvalidData(
                    "no listen_key obtained yet; call refresh_listen_key first".into(),
                )
            })?;
        self.ws.subscribe_user_stream(listen_key)
    }
}
