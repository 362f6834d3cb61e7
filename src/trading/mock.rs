//! In-memory broker and failing ledger used by the engine tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::api::{Broker, BrokerError};
use crate::db::{CloseOutcome, TradeLedger};
use crate::models::{
    Bar, Deal, HistoricalOrder, NewStopMutation, NewTrade, OrderFill, OrderRequest, Position,
    StopModification, StopMutation, SymbolInfo, Tick, Timeframe, Trade, TradeClose,
    TradeWithMutations,
};

/// Scriptable broker. Every call is recorded.
#[derive(Default)]
pub struct MockBroker {
    /// `None` makes `open_positions` fail
    pub positions: Mutex<Option<Vec<Position>>>,
    pub deals: Mutex<HashMap<u64, Vec<Deal>>>,
    /// Tickets whose deal lookup times out
    pub deal_failures: Mutex<HashSet<u64>>,
    pub deal_calls: Mutex<Vec<u64>>,
    /// Tickets whose deal lookup never returns
    pub stalled_deals: Mutex<HashSet<u64>>,

    pub reject_modifications: Mutex<bool>,
    pub modifications: Mutex<Vec<StopModification>>,

    /// `None` rejects every order
    pub fill_price: Mutex<Option<Decimal>>,
    pub next_ticket: Mutex<u64>,
    pub orders: Mutex<Vec<OrderRequest>>,

    pub ticks: Mutex<HashMap<String, Tick>>,
    pub infos: Mutex<HashMap<String, SymbolInfo>>,
    pub bars: Mutex<HashMap<String, Vec<Bar>>>,
    pub history: Mutex<HashMap<u64, HistoricalOrder>>,
}

impl MockBroker {
    pub fn with_positions(positions: Vec<Position>) -> Self {
        let broker = Self::default();
        broker.set_positions(positions);
        broker
    }

    pub fn set_positions(&self, positions: Vec<Position>) {
        *self.positions.lock().unwrap() = Some(positions);
    }

    pub fn fail_positions(&self) {
        *self.positions.lock().unwrap() = None;
    }

    pub fn modifications(&self) -> Vec<StopModification> {
        self.modifications.lock().unwrap().clone()
    }

    pub fn orders(&self) -> Vec<OrderRequest> {
        self.orders.lock().unwrap().clone()
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn open_positions(&self) -> Result<Vec<Position>, BrokerError> {
        self.positions
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BrokerError::Unavailable("connection refused".to_string()))
    }

    async fn deal_history(
        &self,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
        position: u64,
    ) -> Result<Vec<Deal>, BrokerError> {
        self.deal_calls.lock().unwrap().push(position);
        if self.deal_failures.lock().unwrap().contains(&position) {
            return Err(BrokerError::Timeout);
        }
        let stalled = self.stalled_deals.lock().unwrap().contains(&position);
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(self.deals.lock().unwrap().get(&position).cloned().unwrap_or_default())
    }

    async fn order_history(&self, ticket: u64) -> Result<Option<HistoricalOrder>, BrokerError> {
        Ok(self.history.lock().unwrap().get(&ticket).cloned())
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderFill, BrokerError> {
        self.orders.lock().unwrap().push(request.clone());

        let Some(price) = *self.fill_price.lock().unwrap() else {
            return Err(BrokerError::Rejected("Order failed: No money".to_string()));
        };

        let mut ticket = self.next_ticket.lock().unwrap();
        *ticket += 1;
        Ok(OrderFill {
            retcode: 10009,
            order: *ticket,
            deal: *ticket + 1000,
            volume: request.volume,
            price,
            comment: "Request executed".to_string(),
        })
    }

    async fn modify_stop(&self, request: &StopModification) -> Result<(), BrokerError> {
        self.modifications.lock().unwrap().push(request.clone());
        if *self.reject_modifications.lock().unwrap() {
            return Err(BrokerError::Rejected("Invalid stops".to_string()));
        }
        Ok(())
    }

    async fn symbol_tick(&self, symbol: &str) -> Result<Option<Tick>, BrokerError> {
        Ok(self.ticks.lock().unwrap().get(symbol).cloned())
    }

    async fn symbol_info(&self, symbol: &str) -> Result<Option<SymbolInfo>, BrokerError> {
        Ok(self.infos.lock().unwrap().get(symbol).cloned())
    }

    async fn bars(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
        _count: usize,
    ) -> Result<Vec<Bar>, BrokerError> {
        Ok(self.bars.lock().unwrap().get(symbol).cloned().unwrap_or_default())
    }
}

/// Ledger whose every call fails, as when the database file is locked.
pub struct FailingLedger;

#[async_trait]
impl TradeLedger for FailingLedger {
    async fn create_trade(
        &self,
        _trade: NewTrade,
        _initial_stop: NewStopMutation,
    ) -> Result<(Trade, StopMutation)> {
        anyhow::bail!("database is locked")
    }

    async fn append_mutation(
        &self,
        _trade_id: i64,
        _mutation: NewStopMutation,
    ) -> Result<StopMutation> {
        anyhow::bail!("database is locked")
    }

    async fn close_trade(&self, _ticket: u64, _close: TradeClose) -> Result<CloseOutcome> {
        anyhow::bail!("database is locked")
    }

    async fn get_trade_with_mutations(&self, _ticket: u64) -> Result<Option<TradeWithMutations>> {
        anyhow::bail!("database is locked")
    }

    async fn list_trades(&self, _open_only: bool) -> Result<Vec<Trade>> {
        anyhow::bail!("database is locked")
    }
}
