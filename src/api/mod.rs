//! Broker access: the `Broker` seam and its MetaTrader 5 HTTP bridge implementation.

mod mt5_client;
mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{
    Bar, Deal, HistoricalOrder, OrderFill, OrderRequest, Position, StopModification, SymbolInfo,
    Tick, Timeframe,
};

pub use mt5_client::Mt5Client;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker request timed out")]
    Timeout,

    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("broker rejected request: {0}")]
    Rejected(String),

    #[error("malformed broker response: {0}")]
    Malformed(String),
}

impl BrokerError {
    /// Worth retrying on a later cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            BrokerError::Timeout | BrokerError::Unavailable(_) => true,
            BrokerError::Http { status, .. } => *status >= 500,
            BrokerError::Rejected(_) | BrokerError::Malformed(_) => false,
        }
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BrokerError::Timeout
        } else if e.is_decode() {
            BrokerError::Malformed(e.to_string())
        } else {
            BrokerError::Unavailable(e.to_string())
        }
    }
}

/// Everything the engines need from a broker.
///
/// `Ok(None)` and empty vectors mean "not available", never a failure.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn open_positions(&self) -> Result<Vec<Position>, BrokerError>;

    async fn deal_history(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        position: u64,
    ) -> Result<Vec<Deal>, BrokerError>;

    async fn order_history(&self, ticket: u64) -> Result<Option<HistoricalOrder>, BrokerError>;

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderFill, BrokerError>;

    async fn modify_stop(&self, request: &StopModification) -> Result<(), BrokerError>;

    async fn symbol_tick(&self, symbol: &str) -> Result<Option<Tick>, BrokerError>;

    async fn symbol_info(&self, symbol: &str) -> Result<Option<SymbolInfo>, BrokerError>;

    async fn bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Bar>, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BrokerError::Timeout.is_transient());
        assert!(BrokerError::Unavailable("refused".into()).is_transient());
        assert!(BrokerError::Http { status: 502, body: String::new() }.is_transient());
        assert!(!BrokerError::Http { status: 422, body: String::new() }.is_transient());
        assert!(!BrokerError::Rejected("market closed".into()).is_transient());
        assert!(!BrokerError::Malformed("bad json".into()).is_transient());
    }
}
