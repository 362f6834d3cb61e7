//! Deal history models and the aggregation that turns a position's deals into close fields.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::trade::{ClosingReason, TradeClose, TradeSide};

/// What initiated a deal (MT5 `DEAL_REASON_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DealReason {
    Client,
    Mobile,
    Web,
    Expert,
    StopLoss,
    TakeProfit,
    StopOut,
    Other(i64),
}

impl DealReason {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => DealReason::Client,
            1 => DealReason::Mobile,
            2 => DealReason::Web,
            3 => DealReason::Expert,
            4 => DealReason::StopLoss,
            5 => DealReason::TakeProfit,
            6 => DealReason::StopOut,
            other => DealReason::Other(other),
        }
    }

    pub fn closing_reason(&self) -> ClosingReason {
        match self {
            DealReason::StopLoss => ClosingReason::StopLoss,
            DealReason::TakeProfit => ClosingReason::TakeProfit,
            DealReason::StopOut => ClosingReason::Liquidation,
            DealReason::Client | DealReason::Mobile | DealReason::Web => ClosingReason::Manual,
            DealReason::Expert | DealReason::Other(_) => ClosingReason::Other,
        }
    }
}

/// Direction of a deal relative to its position (MT5 `DEAL_ENTRY_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DealEntry {
    In,
    Out,
    InOut,
    OutBy,
    Other(i64),
}

impl DealEntry {
    /// Whether the deal reduces or closes the position.
    pub fn is_exit(&self) -> bool {
        matches!(self, DealEntry::Out | DealEntry::InOut | DealEntry::OutBy)
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            0 => DealEntry::In,
            1 => DealEntry::Out,
            2 => DealEntry::InOut,
            3 => DealEntry::OutBy,
            other => DealEntry::Other(other),
        }
    }
}

/// One executed deal from the broker's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub ticket: u64,
    pub order: u64,
    pub position_id: u64,
    pub time: DateTime<Utc>,

    /// `None` for non-trading deals (balance, credit, ...)
    pub side: Option<TradeSide>,

    pub entry: DealEntry,
    pub reason: DealReason,
    pub volume: Decimal,
    pub price: Decimal,

    /// Costs are reported as negative numbers
    pub commission: Decimal,
    pub swap: Decimal,
    pub fee: Decimal,

    pub profit: Decimal,
    pub symbol: String,
    pub comment: String,
}

/// Order as recorded in the broker's order history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalOrder {
    pub ticket: u64,
    pub position_id: u64,
    pub time_setup: DateTime<Utc>,
    pub side: Option<TradeSide>,
    pub volume_initial: Decimal,
    pub price_open: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub symbol: String,
    pub comment: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum DealSummaryError {
    #[error("no deals for position {0}")]
    Empty(u64),

    #[error("deals for position {ticket} span several symbols: {symbols:?}")]
    InconsistentSymbols { ticket: u64, symbols: Vec<String> },

    #[error("no exit deal for position {0} yet")]
    NoExit(u64),
}

/// Close-side figures aggregated from all deals of one position.
#[derive(Debug, Clone, PartialEq)]
pub struct DealSummary {
    pub ticket: u64,
    pub symbol: String,
    pub close_time: DateTime<Utc>,
    pub close_price: Decimal,

    /// Sum of deal profits
    pub gross_pnl: Decimal,

    /// Gross plus commissions and fees
    pub net_pnl: Decimal,

    pub reason: ClosingReason,
}

impl DealSummary {
    pub fn from_deals(ticket: u64, deals: &[Deal]) -> Result<Self, DealSummaryError> {
        let first = deals.first().ok_or(DealSummaryError::Empty(ticket))?;

        if deals.iter().any(|d| d.symbol != first.symbol) {
            let mut symbols: Vec<String> = deals.iter().map(|d| d.symbol.clone()).collect();
            symbols.sort();
            symbols.dedup();
            return Err(DealSummaryError::InconsistentSymbols { ticket, symbols });
        }

        // Later position in the batch wins a timestamp tie.
        let latest = deals
            .iter()
            .enumerate()
            .filter(|(_, d)| d.entry.is_exit())
            .max_by_key(|(i, d)| (d.time, *i))
            .map(|(_, d)| d)
            .ok_or(DealSummaryError::NoExit(ticket))?;

        let gross_pnl: Decimal = deals.iter().map(|d| d.profit).sum();
        let costs: Decimal = deals.iter().map(|d| d.commission + d.fee).sum();

        Ok(Self {
            ticket,
            symbol: first.symbol.clone(),
            close_time: latest.time,
            close_price: latest.price,
            gross_pnl,
            net_pnl: gross_pnl + costs,
            reason: latest.reason.closing_reason(),
        })
    }

    pub fn to_close(&self) -> TradeClose {
        TradeClose {
            close_time: self.close_time,
            close_price: self.close_price,
            pnl: self.gross_pnl,
            pnl_net: self.net_pnl,
            reason: self.reason,
        }
    }
}
