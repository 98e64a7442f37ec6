use std::str::FromStr;

use chrono::{TimeZone, Utc};
use core_types::Kline;
use futures_util::stream::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;
use uuid::Uuid;

use crate::error::ApiError;
use crate::responses::VenueEvent;

// --- WebSocket Deserialization Structs ---
#[derive(Debug, Deserialize)]
struct WsStreamWrapper<T> {
    #[allow(dead_code)]
    stream: String,
    data: T,
}
#[derive(Debug, Deserialize)]
struct WsKlineEvent {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: WsKline,
}
#[derive(Debug, Deserialize)]
struct WsKline {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    is_closed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
enum WsUserEvent {
    #[serde(rename = "ORDER_TRADE_UPDATE")]
    OrderTradeUpdate {
        #[serde(rename = "o")]
        order: WsOrderUpdate,
    },
    #[serde(rename = "ACCOUNT_UPDATE")]
    AccountUpdate { a: WsAccountUpdateBody },
}

#[derive(Debug, Deserialize)]
struct WsOrderUpdate {
    #[serde(rename = "c")]
    client_order_id: String,
    #[serde(rename = "i")]
    order_id: i64,
    #[serde(rename = "X")]
    status: String,
    #[serde(rename = "z")]
    filled_qty: String,
    #[serde(rename = "ap")]
    avg_price: String,
}

#[derive(Debug, Deserialize)]
struct WsAccountUpdateBody {
    #[serde(rename = "P")]
    positions: Vec<WsPositionUpdate>,
    #[serde(rename = "B")]
    balances: Vec<WsBalanceUpdate>,
}

#[derive(Debug, Deserialize)]
struct WsPositionUpdate {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "pa")]
    position_amt: String,
    #[serde(rename = "ep")]
    entry_price: String,
}

#[derive(Debug, Deserialize)]
struct WsBalanceUpdate {
    #[serde(rename = "a")]
    asset: String,
    #[serde(rename = "wb")]
    wallet_balance: String,
}

/// Handles connection to the Binance WebSocket API and manages data stream
/// subscriptions. Reconnect-with-backoff loop: same shape for the public
/// kline stream and the authenticated user-data stream.
pub struct LiveConnector {
    base_url: Url,
}

impl LiveConnector {
    pub fn new(live_mode: bool) -> Self {
        let base_url = if live_mode {
            "wss://fstream.binance.com"
        } else {
            "wss://stream.binancefuture.com"
        };
        Self {
            base_url: Url::parse(base_url).expect("Failed to parse WebSocket base URL"),
        }
    }

    /// Subscribes to kline streams and returns a channel Receiver for
    /// `(symbol, Kline)` data. Only closed bars are forwarded.
    pub fn subscribe_to_klines(
        &self,
        symbols: &[String],
        interval: &str,
    ) -> Result<mpsc::Receiver<(String, Kline)>, ApiError> {
        let (tx, rx) = mpsc::channel(1024);

        let streams = symbols
            .iter()
            .map(|s| format!("{}@kline_{}", s.to_lowercase(), interval))
            .collect::<Vec<_>>()
            .join("/");

        let mut url = self.base_url.clone();
        url.set_path("/stream");
        url.set_query(Some(&format!("streams={}", streams)));
        let interval = interval.to_string();

        tokio::spawn(async move {
            loop {
                tracing::info!("connecting to kline stream");
                match connect_async(url.clone()).await {
                    Ok((mut stream, _)) => {
                        tracing::info!("kline stream connection established");
                        while let Some(msg) = stream.next().await {
                            let Ok(Message::Text(text)) = msg else {
                                continue;
                            };
                            let Ok(wrapper) =
                                serde_json::from_str::<WsStreamWrapper<WsKlineEvent>>(&text)
                            else {
                                continue;
                            };
                            if wrapper.data.event_type != "kline" || !wrapper.data.kline.is_closed {
                                continue;
                            }
                            let k = wrapper.data.kline;
                            let kline = match parse_kline(&wrapper.data.symbol, &k, &interval) {
                                Ok(kline) => kline,
                                Err(e) => {
                                    tracing::error!(error = %e, "failed to parse kline update");
                                    continue;
                                }
                            };
                            if tx.send((wrapper.data.symbol.clone(), kline)).await.is_err() {
                                tracing::error!("receiver dropped, closing kline stream");
                                return;
                            }
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "kline stream connection error"),
                }
                tracing::warn!("kline stream disconnected, reconnecting in 5 seconds");
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });

        Ok(rx)
    }

    /// Subscribes to the authenticated user-data stream (order/position/
    /// balance updates) via a `listen_key` obtained out of band. Emits
    /// `VenueEvent::Disconnect` whenever the socket drops, so the Engine
    /// Runtime can treat it as a suspension point rather than silently
    /// stalling.
    pub fn subscribe_user_stream(
        &self,
        listen_key: String,
    ) -> Result<mpsc::Receiver<VenueEvent>, ApiError> {
        let (tx, rx) = mpsc::channel(1024);
        let mut url = self.base_url.clone();
        url.set_path(&format!("/ws/{}", listen_key));

        tokio::spawn(async move {
            loop {
                tracing::info!("connecting to user data stream");
                match connect_async(url.clone()).await {
                    Ok((mut stream, _)) => {
                        tracing::info!("user data stream connection established");
                        while let Some(msg) = stream.next().await {
                            let Ok(Message::Text(text)) = msg else {
                                continue;
                            };
                            let Ok(event) = serde_json::from_str::<WsUserEvent>(&text) else {
                                continue;
                            };
                            for venue_event in translate_user_event(event) {
                                if tx.send(venue_event).await.is_err() {
                                    tracing::error!("receiver dropped, closing user stream");
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "user data stream connection error"),
                }
                let _ = tx.send(VenueEvent::Disconnect).await;
                tracing::warn!("user data stream disconnected, reconnecting in 5 seconds");
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });

        Ok(rx)
    }
}

fn parse_kline(symbol: &str, k: &WsKline, interval: &str) -> Result<Kline, ApiError> {
    Ok(Kline {
        symbol: symbol.to_string(),
        open_time: Utc
            .timestamp_millis_opt(k.open_time)
            .single()
            .ok_or_else(|| ApiError::InvalidData(format!("invalid open_time: {}", k.open_time)))?,
        open: Decimal::from_str(&k.open).map_err(|e| ApiError::Deserialization(e.to_string()))?,
        high: Decimal::from_str(&k.high).map_err(|e| ApiError::Deserialization(e.to_string()))?,
        low: Decimal::from_str(&k.low).map_err(|e| ApiError::Deserialization(e.to_string()))?,
        close: Decimal::from_str(&k.close).map_err(|e| ApiError::Deserialization(e.to_string()))?,
        volume: Decimal::from_str(&k.volume)
            .map_err(|e| ApiError::Deserialization(e.to_string()))?,
        close_time: Utc
            .timestamp_millis_opt(k.close_time)
            .single()
            .ok_or_else(|| {
                ApiError::InvalidData(format!("invalid close_time: {}", k.close_time))
            })?,
        interval: interval.to_string(),
    })
}

fn translate_user_event(event: WsUserEvent) -> Vec<VenueEvent> {
    match event {
        WsUserEvent::OrderTradeUpdate { order } => {
            vec![VenueEvent::OrderUpdate {
                client_id: Uuid::parse_str(&order.client_order_id).ok(),
                venue_id: order.order_id.to_string(),
                status: order.status,
                filled_qty: Decimal::from_str(&order.filled_qty).unwrap_or_default(),
                avg_fill_price: Decimal::from_str(&order.avg_price).unwrap_or_default(),
            }]
        }
        WsUserEvent::AccountUpdate { a } => {
            let mut events: Vec<VenueEvent> = a
                .positions
                .into_iter()
                .map(|p| VenueEvent::PositionUpdate {
                    symbol: p.symbol,
                    size: Decimal::from_str(&p.position_amt).unwrap_or_default(),
                    entry_price: Decimal::from_str(&p.entry_price).unwrap_or_default(),
                })
                .collect();
            events.extend(a.balances.into_iter().map(|b| VenueEvent::BalanceUpdate {
                asset: b.asset,
                available: Decimal::from_str(&b.wallet_balance).unwrap_or_default(),
            }));
            events
        }
    }
}
