//! Trade model: the persisted record of one broker position from fill to close.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::trading::PricingError;

use super::MarketType;
use super::market::Timeframe;

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }

    /// MT5 order/position type code (0 = buy, 1 = sell).
    pub fn as_mt5_type(&self) -> i64 {
        match self {
            TradeSide::Buy => 0,
            TradeSide::Sell => 1,
        }
    }

    pub fn from_mt5_type(code: i64) -> Result<Self, PricingError> {
        match code {
            0 => Ok(TradeSide::Buy),
            1 => Ok(TradeSide::Sell),
            other => Err(PricingError::InvalidSide(other.to_string())),
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> Decimal {
        match self {
            TradeSide::Buy => Decimal::ONE,
            TradeSide::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl FromStr for TradeSide {
    type Err = PricingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Ok(TradeSide::Buy),
            "SELL" => Ok(TradeSide::Sell),
            _ => Err(PricingError::InvalidSide(s.to_string())),
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a trade was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClosingReason {
    #[serde(rename = "TP")]
    TakeProfit,
    #[serde(rename = "SL")]
    StopLoss,
    #[serde(rename = "MANUAL")]
    Manual,
    #[serde(rename = "LIQUIDATION")]
    Liquidation,
    #[serde(rename = "OTHER")]
    Other,
}

impl ClosingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClosingReason::TakeProfit => "TP",
            ClosingReason::StopLoss => "SL",
            ClosingReason::Manual => "MANUAL",
            ClosingReason::Liquidation => "LIQUIDATION",
            ClosingReason::Other => "OTHER",
        }
    }
}

impl FromStr for ClosingReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TP" => Ok(ClosingReason::TakeProfit),
            "SL" => Ok(ClosingReason::StopLoss),
            "MANUAL" => Ok(ClosingReason::Manual),
            "LIQUIDATION" => Ok(ClosingReason::Liquidation),
            "OTHER" => Ok(ClosingReason::Other),
            other => anyhow::bail!("Unknown closing reason: {}", other),
        }
    }
}

impl fmt::Display for ClosingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Close-side fields of a trade. Either all of them are known or none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeClose {
    pub close_time: DateTime<Utc>,
    pub close_price: Decimal,

    /// Realized P&L as reported by the broker
    pub pnl: Decimal,

    /// Realized P&L after commissions and fees
    pub pnl_net: Decimal,

    pub reason: ClosingReason,
}

/// A trade as stored in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,

    /// Broker position ticket (`transaction_broker_id`)
    pub ticket: u64,

    pub symbol: String,
    pub side: TradeSide,
    pub entry_time: DateTime<Utc>,
    pub entry_price: Decimal,

    /// Notional exposure in quote currency (capital * leverage)
    pub position_size: Decimal,

    /// Cash committed before leverage
    pub capital: Decimal,

    pub leverage: Decimal,

    /// Volume sent to the broker, in lots
    pub order_volume: Option<Decimal>,

    /// Round-trip commission charged for the position
    pub commission: Decimal,

    pub break_even_price: Decimal,
    pub liquidation_price: Decimal,

    /// `None` while the trade is open
    pub close: Option<TradeClose>,

    pub strategy: String,
    pub broker: String,
    pub market_type: MarketType,
    pub timeframe: Timeframe,
}

impl Trade {
    pub fn is_open(&self) -> bool {
        self.close.is_none()
    }
}

/// Fields required to open a trade record.
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub ticket: u64,
    pub symbol: String,
    pub side: TradeSide,
    pub entry_time: DateTime<Utc>,
    pub entry_price: Decimal,
    pub position_size: Decimal,
    pub capital: Decimal,
    pub leverage: Decimal,
    pub order_volume: Option<Decimal>,
    pub commission: Decimal,
    pub break_even_price: Decimal,
    pub liquidation_price: Decimal,
    pub strategy: String,
    pub broker: String,
    pub market_type: MarketType,
    pub timeframe: Timeframe,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    /// EURUSD trade: capital 100 at 200x, commission 5.
    pub fn new_trade(ticket: u64, side: TradeSide, entry_price: Decimal) -> NewTrade {
        NewTrade {
            ticket,
            symbol: "EURUSD".to_string(),
            side,
            entry_time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            entry_price,
            position_size: dec!(20000),
            capital: dec!(100),
            leverage: dec!(200),
            order_volume: Some(dec!(0.18)),
            commission: dec!(5),
            break_even_price: entry_price,
            liquidation_price: entry_price,
            strategy: "MEAN REVERSION".to_string(),
            broker: "Alpari".to_string(),
            market_type: MarketType::Forex,
            timeframe: Timeframe::M15,
        }
    }
}
