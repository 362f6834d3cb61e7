//! HTTP client for the MetaTrader 5 bridge.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::models::{
    Bar, Deal, HistoricalOrder, OrderFill, OrderRequest, Position, StopModification, SymbolInfo,
    Tick, Timeframe,
};

use super::types::*;
use super::{Broker, BrokerError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the MT5 bridge REST API.
pub struct Mt5Client {
    client: Client,
    base_url: String,
}

impl Mt5Client {
    pub fn new(base_url: &str, api_key: Option<&str>) -> Result<Self> {
        Self::with_timeout(base_url, api_key, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, api_key: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", key))
                .context("MT5 API key is not a valid header value")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET returning `None` on 404.
    async fn get_optional<T, Q>(&self, path: &str, query: &Q) -> Result<Option<T>, BrokerError>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "GET");

        let response = self.client.get(&url).query(query).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = Self::check(response).await?;
        let body = response.json().await?;
        Ok(Some(body))
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, BrokerError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "POST");

        let response = self.client.post(&url).json(body).send().await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    /// Map non-success statuses: 400 with an error body is a broker refusal.
    async fn check(response: Response) -> Result<Response, BrokerError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST {
            if let Ok(err) = serde_json::from_str::<ErrorBody>(&body) {
                return Err(BrokerError::Rejected(err.describe()));
            }
        }

        Err(BrokerError::Http {
            status: status.as_u16(),
            body,
        })
    }

    fn iso(t: DateTime<Utc>) -> String {
        t.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

#[async_trait]
impl Broker for Mt5Client {
    async fn open_positions(&self) -> Result<Vec<Position>, BrokerError> {
        let payload: PositionsPayload = self
            .get_optional("/get_positions", &[] as &[(&str, &str)])
            .await?
            .ok_or_else(|| BrokerError::Http {
                status: 404,
                body: "positions endpoint not found".to_string(),
            })?;

        let positions = payload
            .into_entries()
            .into_iter()
            .filter_map(|entry| {
                let parsed = serde_json::from_value::<PositionWire>(entry.clone())
                    .map_err(|e| BrokerError::Malformed(e.to_string()))
                    .and_then(Position::try_from);

                match parsed {
                    Ok(position) => Some(position),
                    Err(e) => {
                        warn!(error = %e, entry = %entry, "Skipping malformed position");
                        None
                    }
                }
            })
            .collect();

        Ok(positions)
    }

    async fn deal_history(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        position: u64,
    ) -> Result<Vec<Deal>, BrokerError> {
        let query = [
            ("from_date", Self::iso(from)),
            ("to_date", Self::iso(to)),
            ("position", position.to_string()),
        ];

        let Some(wires) = self
            .get_optional::<Vec<DealWire>, _>("/history_deals_get", &query)
            .await?
        else {
            return Ok(Vec::new());
        };

        wires.into_iter().map(Deal::try_from).collect()
    }

    async fn order_history(&self, ticket: u64) -> Result<Option<HistoricalOrder>, BrokerError> {
        let query = [("ticket", ticket.to_string())];

        let orders = self
            .get_optional::<Vec<HistoricalOrderWire>, _>("/history_orders_get", &query)
            .await?
            .unwrap_or_default();

        orders
            .into_iter()
            .next()
            .map(HistoricalOrder::try_from)
            .transpose()
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderFill, BrokerError> {
        let body = MarketOrderBody {
            symbol: request.symbol.clone(),
            volume: request.volume,
            kind: request.side.as_mt5_type(),
            sl: request.stop_loss,
            tp: request.take_profit,
            deviation: request.deviation,
            magic: request.magic,
            comment: request.comment.clone(),
            type_filling: request.filling.as_mt5_code(),
        };

        let response: OrderResponse = self.post("/send_market_order", &body).await?;
        OrderFill::try_from(response.result)
    }

    async fn modify_stop(&self, request: &StopModification) -> Result<(), BrokerError> {
        let body = ModifyStopBody {
            position: request.ticket,
            symbol: request.symbol.clone(),
            sl: request.stop_loss,
            tp: request.take_profit,
        };

        let _: serde_json::Value = self.post("/modify_sl_tp", &body).await?;
        Ok(())
    }

    async fn symbol_tick(&self, symbol: &str) -> Result<Option<Tick>, BrokerError> {
        let path = format!("/symbol_info_tick/{}", symbol);
        self.get_optional::<TickWire, _>(&path, &[] as &[(&str, &str)])
            .await?
            .map(Tick::try_from)
            .transpose()
    }

    async fn symbol_info(&self, symbol: &str) -> Result<Option<SymbolInfo>, BrokerError> {
        let path = format!("/symbol_info/{}", symbol);
        self.get_optional::<SymbolInfoWire, _>(&path, &[] as &[(&str, &str)])
            .await?
            .map(|w| w.into_info(symbol))
            .transpose()
    }

    async fn bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Bar>, BrokerError> {
        let query = [
            ("symbol", symbol.to_string()),
            ("timeframe", timeframe.as_broker_str().to_string()),
            ("num_bars", count.to_string()),
        ];

        let wires = self
            .get_optional::<Vec<BarWire>, _>("/fetch_data_pos", &query)
            .await?
            .unwrap_or_default();

        let mut bars = wires
            .into_iter()
            .map(Bar::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        bars.sort_by_key(|b| b.time);
        Ok(bars)
    }
}
