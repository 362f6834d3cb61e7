//! Position model: a normalized snapshot of one open broker position.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::trade::TradeSide;

/// Open position as reported by the broker. Read-only mirror, refreshed every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Broker-assigned position ticket
    pub ticket: u64,

    pub symbol: String,
    pub side: TradeSide,

    /// Volume in lots
    pub volume: Decimal,

    pub open_price: Decimal,

    /// Current stop-loss, `None` when the broker reports no stop
    pub stop_loss: Option<Decimal>,

    /// Current take-profit, `None` when the broker reports none
    pub take_profit: Option<Decimal>,

    pub current_price: Decimal,

    /// Unrealized P&L in account currency (before commission)
    pub profit: Decimal,

    pub open_time: DateTime<Utc>,
}

impl Position {
    /// Whether `candidate` is a strictly better stop than the current one by more than `epsilon`.
    ///
    /// Better means higher for buys and lower for sells. A position without a stop
    /// accepts any candidate.
    pub fn stop_improves(&self, candidate: Decimal, epsilon: Decimal) -> bool {
        let Some(current) = self.stop_loss else {
            return true;
        };

        match self.side {
            TradeSide::Buy => candidate > current + epsilon,
            TradeSide::Sell => candidate < current - epsilon,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub fn position(ticket: u64, side: TradeSide, open_price: Decimal) -> Position {
        Position {
            ticket,
            symbol: "EURUSD".to_string(),
            side,
            volume: Decimal::ONE,
            open_price,
            stop_loss: None,
            take_profit: None,
            current_price: open_price,
            profit: Decimal::ZERO,
            open_time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        }
    }
}
