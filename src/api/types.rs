//! Wire types of the MT5 bridge and their conversion into domain models.
//!
//! The bridge serializes MetaTrader structures as-is, so prices arrive as
//! floats, sides as integer codes and an unset stop as `0.0`. Conversions
//! below normalize those quirks and reject entries that cannot be trusted.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{
    Bar, Deal, DealEntry, DealReason, HistoricalOrder, OrderFill, Position, SymbolInfo, Tick,
    TradeSide,
};

use super::BrokerError;

fn epoch(secs: i64, what: &str) -> Result<DateTime<Utc>, BrokerError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| BrokerError::Malformed(format!("{what}: bad timestamp {secs}")))
}

/// MT5 reports "no stop" as 0.
fn non_zero(price: Decimal) -> Option<Decimal> {
    (!price.is_zero()).then_some(price)
}

/// Side of an order type code; pending types alternate buy/sell.
fn side_of_order_type(code: i64) -> Option<TradeSide> {
    match code {
        0..=7 => TradeSide::from_mt5_type(code % 2).ok(),
        _ => None,
    }
}

/// `/get_positions` returns either a bare list or `{"positions": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum PositionsPayload {
    List(Vec<serde_json::Value>),
    Wrapped { positions: Vec<serde_json::Value> },
}

impl PositionsPayload {
    pub fn into_entries(self) -> Vec<serde_json::Value> {
        match self {
            PositionsPayload::List(v) | PositionsPayload::Wrapped { positions: v } => v,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionWire {
    pub ticket: u64,
    pub symbol: String,
    #[serde(rename = "type")]
    pub kind: i64,
    pub volume: Decimal,
    pub price_open: Decimal,
    #[serde(default)]
    pub sl: Decimal,
    #[serde(default)]
    pub tp: Decimal,
    pub price_current: Decimal,
    #[serde(default)]
    pub profit: Decimal,
    pub time: i64,
}

impl TryFrom<PositionWire> for Position {
    type Error = BrokerError;

    fn try_from(w: PositionWire) -> Result<Self, Self::Error> {
        let side = TradeSide::from_mt5_type(w.kind)
            .map_err(|e| BrokerError::Malformed(format!("position {}: {e}", w.ticket)))?;
        if w.price_open <= Decimal::ZERO {
            return Err(BrokerError::Malformed(format!(
                "position {}: open price {}",
                w.ticket, w.price_open
            )));
        }

        Ok(Position {
            ticket: w.ticket,
            symbol: w.symbol,
            side,
            volume: w.volume,
            open_price: w.price_open,
            stop_loss: non_zero(w.sl),
            take_profit: non_zero(w.tp),
            current_price: w.price_current,
            profit: w.profit,
            open_time: epoch(w.time, "position open time")?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DealWire {
    pub ticket: u64,
    #[serde(default)]
    pub order: u64,
    pub position_id: u64,
    pub time: i64,
    #[serde(rename = "type")]
    pub kind: i64,
    #[serde(default)]
    pub entry: i64,
    #[serde(default)]
    pub reason: i64,
    pub volume: Decimal,
    pub price: Decimal,
    #[serde(default)]
    pub commission: Decimal,
    #[serde(default)]
    pub swap: Decimal,
    #[serde(default)]
    pub fee: Decimal,
    #[serde(default)]
    pub profit: Decimal,
    pub symbol: String,
    #[serde(default)]
    pub comment: String,
}

impl TryFrom<DealWire> for Deal {
    type Error = BrokerError;

    fn try_from(w: DealWire) -> Result<Self, Self::Error> {
        Ok(Deal {
            ticket: w.ticket,
            order: w.order,
            position_id: w.position_id,
            time: epoch(w.time, "deal time")?,
            side: TradeSide::from_mt5_type(w.kind).ok(),
            entry: DealEntry::from_code(w.entry),
            reason: DealReason::from_code(w.reason),
            volume: w.volume,
            price: w.price,
            commission: w.commission,
            swap: w.swap,
            fee: w.fee,
            profit: w.profit,
            symbol: w.symbol,
            comment: w.comment,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoricalOrderWire {
    pub ticket: u64,
    #[serde(default)]
    pub position_id: u64,
    pub time_setup: i64,
    #[serde(rename = "type")]
    pub kind: i64,
    #[serde(default)]
    pub volume_initial: Decimal,
    #[serde(default)]
    pub price_open: Decimal,
    #[serde(default)]
    pub sl: Decimal,
    #[serde(default)]
    pub tp: Decimal,
    pub symbol: String,
    #[serde(default)]
    pub comment: String,
}

impl TryFrom<HistoricalOrderWire> for HistoricalOrder {
    type Error = BrokerError;

    fn try_from(w: HistoricalOrderWire) -> Result<Self, Self::Error> {
        Ok(HistoricalOrder {
            ticket: w.ticket,
            position_id: w.position_id,
            time_setup: epoch(w.time_setup, "order setup time")?,
            side: side_of_order_type(w.kind),
            volume_initial: w.volume_initial,
            price_open: w.price_open,
            stop_loss: non_zero(w.sl),
            take_profit: non_zero(w.tp),
            symbol: w.symbol,
            comment: w.comment,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TickWire {
    pub time: i64,
    pub bid: Decimal,
    pub ask: Decimal,
}

impl TryFrom<TickWire> for Tick {
    type Error = BrokerError;

    fn try_from(w: TickWire) -> Result<Self, Self::Error> {
        Ok(Tick {
            time: epoch(w.time, "tick time")?,
            bid: w.bid,
            ask: w.ask,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolInfoWire {
    #[serde(default)]
    pub name: String,
    pub trade_contract_size: Decimal,
    pub volume_step: Decimal,
    pub volume_min: Decimal,
    pub digits: u32,
}

impl SymbolInfoWire {
    pub fn into_info(self, requested: &str) -> Result<SymbolInfo, BrokerError> {
        if self.trade_contract_size <= Decimal::ZERO || self.volume_step <= Decimal::ZERO {
            return Err(BrokerError::Malformed(format!(
                "symbol {requested}: contract size {} / volume step {}",
                self.trade_contract_size, self.volume_step
            )));
        }

        Ok(SymbolInfo {
            symbol: if self.name.is_empty() {
                requested.to_string()
            } else {
                self.name
            },
            contract_size: self.trade_contract_size,
            volume_step: self.volume_step,
            volume_min: self.volume_min,
            digits: self.digits,
        })
    }
}

/// Bar timestamps come as epoch seconds or as formatted dates, depending on bridge version.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireTime {
    Epoch(i64),
    Text(String),
}

impl WireTime {
    pub fn to_utc(&self) -> Result<DateTime<Utc>, BrokerError> {
        match self {
            WireTime::Epoch(secs) => epoch(*secs, "bar time"),
            WireTime::Text(s) => DateTime::parse_from_rfc3339(s)
                .or_else(|_| DateTime::parse_from_rfc2822(s))
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| BrokerError::Malformed(format!("bar time: {s:?}"))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BarWire {
    pub time: WireTime,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    #[serde(default)]
    pub tick_volume: Decimal,
}

impl TryFrom<BarWire> for Bar {
    type Error = BrokerError;

    fn try_from(w: BarWire) -> Result<Self, Self::Error> {
        Ok(Bar {
            time: w.time.to_utc()?,
            open: w.open,
            high: w.high,
            low: w.low,
            close: w.close,
            volume: w.tick_volume,
        })
    }
}

/// Body of `POST /send_market_order`.
#[derive(Debug, Clone, Serialize)]
pub struct MarketOrderBody {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub volume: Decimal,
    #[serde(rename = "type")]
    pub kind: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub sl: Decimal,
    #[serde(
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub tp: Option<Decimal>,
    pub deviation: u32,
    pub magic: u64,
    pub comment: String,
    pub type_filling: i64,
}

/// Body of `POST /modify_sl_tp`.
#[derive(Debug, Clone, Serialize)]
pub struct ModifyStopBody {
    pub position: u64,
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub sl: Decimal,
    #[serde(
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub tp: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderResultWire {
    pub retcode: i64,
    #[serde(default)]
    pub order: u64,
    #[serde(default)]
    pub deal: u64,
    #[serde(default)]
    pub volume: Decimal,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    pub result: OrderResultWire,
}

impl TryFrom<OrderResultWire> for OrderFill {
    type Error = BrokerError;

    fn try_from(w: OrderResultWire) -> Result<Self, Self::Error> {
        if w.order == 0 || w.price <= Decimal::ZERO {
            return Err(BrokerError::Malformed(format!(
                "order result without ticket or price (retcode {})",
                w.retcode
            )));
        }

        Ok(OrderFill {
            retcode: w.retcode,
            order: w.order,
            deal: w.deal,
            volume: w.volume,
            price: w.price,
            comment: w.comment,
        })
    }
}

/// Error body returned with 4xx/5xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default)]
    pub mt5_error: Option<String>,
}

impl ErrorBody {
    pub fn describe(&self) -> String {
        match &self.mt5_error {
            Some(detail) => format!("{} ({})", self.error, detail),
            None => self.error.clone(),
        }
    }
}
