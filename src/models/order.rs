//! Order requests sent to the broker and the fills it reports back.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::trade::TradeSide;

/// MT5 order filling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FillPolicy {
    /// Fill the whole volume or cancel
    #[default]
    FillOrKill,
    /// Fill what is available, cancel the rest
    ImmediateOrCancel,
    Return,
}

impl FillPolicy {
    /// MT5 `ORDER_FILLING_*` code.
    pub fn as_mt5_code(&self) -> i64 {
        match self {
            FillPolicy::FillOrKill => 0,
            FillPolicy::ImmediateOrCancel => 1,
            FillPolicy::Return => 2,
        }
    }
}

/// Market order to open a position.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: TradeSide,

    /// Volume in lots
    pub volume: Decimal,

    pub stop_loss: Decimal,
    pub take_profit: Option<Decimal>,

    /// Max slippage in points
    pub deviation: u32,

    pub magic: u64,
    pub comment: String,
    pub filling: FillPolicy,
}

/// Result of an accepted market order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderFill {
    pub retcode: i64,

    /// Order ticket, which MT5 also uses as the position ticket
    pub order: u64,

    pub deal: u64,
    pub volume: Decimal,
    pub price: Decimal,
    pub comment: String,
}

/// Request to move the exit prices of an open position.
#[derive(Debug, Clone, PartialEq)]
pub struct StopModification {
    pub ticket: u64,
    pub symbol: String,
    pub stop_loss: Decimal,
    pub take_profit: Option<Decimal>,
}
