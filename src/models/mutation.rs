//! Stop mutation model: append-only audit trail of stop-loss / take-profit changes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::trade::Trade;

/// One recorded change of a trade's exit prices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopMutation {
    pub id: i64,
    pub trade_id: i64,
    pub mutation_time: DateTime<Utc>,

    /// Market price when the change was made
    pub mutation_price: Decimal,

    pub new_sl_price: Decimal,
    pub new_tp_price: Option<Decimal>,

    /// Gross P&L if the position closes at the new stop
    pub pnl_at_new_sl: Decimal,

    /// Gross P&L if the position closes at the new take-profit
    pub pnl_at_new_tp: Option<Decimal>,
}

/// Fields for appending a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStopMutation {
    pub mutation_time: DateTime<Utc>,
    pub mutation_price: Decimal,
    pub new_sl_price: Decimal,
    pub new_tp_price: Option<Decimal>,
    pub pnl_at_new_sl: Decimal,
    pub pnl_at_new_tp: Option<Decimal>,
}

/// A trade together with its mutation history, oldest first.
#[derive(Debug, Clone)]
pub struct TradeWithMutations {
    pub trade: Trade,
    pub mutations: Vec<StopMutation>,
}

impl TradeWithMutations {
    /// The most recently recorded stop-loss, if any mutation exists.
    pub fn last_stop(&self) -> Option<Decimal> {
        self.mutations.last().map(|m| m.new_sl_price)
    }
}
