//! Reconciliation: detect positions that disappeared from the broker and close their trades.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::api::{Broker, BrokerError};
use crate::db::{CloseOutcome, TradeLedger};
use crate::models::{DealSummary, Position, Trade};

/// Deal history is searched this many minutes around the position's lifetime.
const DEAL_WINDOW_MARGIN_MINUTES: i64 = 1;

/// Last seen broker positions, keyed by ticket.
#[derive(Debug, Default)]
pub struct PositionCache {
    positions: HashMap<u64, Position>,
}

impl PositionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn contains(&self, ticket: u64) -> bool {
        self.positions.contains_key(&ticket)
    }

    pub fn tickets(&self) -> Vec<u64> {
        let mut tickets: Vec<u64> = self.positions.keys().copied().collect();
        tickets.sort_unstable();
        tickets
    }
}

/// Counts from one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Positions currently open at the broker
    pub open: usize,
    pub closed: usize,
    pub already_closed: usize,
    /// Closed positions with no trade in the ledger
    pub orphaned: usize,
    /// Closed positions kept for another attempt
    pub retained: usize,
}

enum Resolution {
    Closed,
    AlreadyClosed,
    Orphaned,
    Retained,
}

pub struct ReconciliationEngine {
    broker: Arc<dyn Broker>,
    ledger: Arc<dyn TradeLedger>,
    settlement_delay: Duration,
}

impl ReconciliationEngine {
    pub fn new(
        broker: Arc<dyn Broker>,
        ledger: Arc<dyn TradeLedger>,
        settlement_delay: Duration,
    ) -> Self {
        Self {
            broker,
            ledger,
            settlement_delay,
        }
    }

    /// Add every open ledger trade missing from `cache`.
    ///
    /// After a restart the cache is empty, so positions closed while the bot was down
    /// would never be seen disappearing. Seeded entries that are still open at the
    /// broker are replaced by the broker's view on the next cycle.
    pub async fn seed_from_ledger(&self, cache: &mut PositionCache) -> anyhow::Result<usize> {
        let open = self.ledger.list_trades(true).await?;
        let mut seeded = 0;

        for trade in &open {
            if !cache.contains(trade.ticket) {
                cache.positions.insert(trade.ticket, position_from_trade(trade));
                seeded += 1;
            }
        }

        if seeded > 0 {
            info!(seeded, "Seeded position cache from open ledger trades");
        }
        Ok(seeded)
    }

    /// Run one cycle against `cache`.
    ///
    /// A failed position fetch returns the error and leaves the cache untouched.
    pub async fn run_cycle(
        &self,
        cache: &mut PositionCache,
    ) -> Result<ReconcileReport, BrokerError> {
        let current: HashMap<u64, Position> = self
            .broker
            .open_positions()
            .await?
            .into_iter()
            .map(|p| (p.ticket, p))
            .collect();

        let mut closed: Vec<Position> = cache
            .positions
            .values()
            .filter(|p| !current.contains_key(&p.ticket))
            .cloned()
            .collect();
        closed.sort_by_key(|p| p.ticket);

        let mut report = ReconcileReport {
            open: current.len(),
            ..Default::default()
        };

        // Open positions go in first and resolved tickets leave one by one, so a
        // cycle cut short by a timeout still keeps what it finished.
        cache.positions.extend(current);

        if !closed.is_empty() && !self.settlement_delay.is_zero() {
            tokio::time::sleep(self.settlement_delay).await;
        }

        for position in &closed {
            match self.close_position(position).await {
                Resolution::Closed => report.closed += 1,
                Resolution::AlreadyClosed => report.already_closed += 1,
                Resolution::Orphaned => report.orphaned += 1,
                Resolution::Retained => {
                    report.retained += 1;
                    continue;
                }
            }
            cache.positions.remove(&position.ticket);
        }

        debug!(
            open = report.open,
            closed = report.closed,
            retained = report.retained,
            "Reconciliation cycle complete"
        );

        Ok(report)
    }

    async fn close_position(&self, position: &Position) -> Resolution {
        let ticket = position.ticket;

        let margin = chrono::Duration::minutes(DEAL_WINDOW_MARGIN_MINUTES);
        let from = position.open_time - margin;
        let to = Utc::now() + margin;

        let deals = match self.broker.deal_history(from, to, ticket).await {
            Ok(deals) => deals,
            Err(e) => {
                warn!(ticket, error = %e, "Deal history unavailable, will retry");
                return Resolution::Retained;
            }
        };

        let summary = match DealSummary::from_deals(ticket, &deals) {
            Ok(summary) => summary,
            Err(e) => {
                warn!(ticket, error = %e, "Cannot summarize deals yet, will retry");
                return Resolution::Retained;
            }
        };

        match self.ledger.close_trade(ticket, summary.to_close()).await {
            Ok(CloseOutcome::Closed(trade)) => {
                info!(
                    ticket,
                    symbol = %trade.symbol,
                    side = %trade.side,
                    close_price = %summary.close_price,
                    pnl = %summary.gross_pnl,
                    pnl_net = %summary.net_pnl,
                    reason = %summary.reason,
                    "Trade closed"
                );
                Resolution::Closed
            }
            Ok(CloseOutcome::AlreadyClosed) => {
                debug!(ticket, "Trade already closed");
                Resolution::AlreadyClosed
            }
            Ok(CloseOutcome::NotFound) => {
                error!(ticket, symbol = %position.symbol, "Closed position has no trade in the ledger");
                Resolution::Orphaned
            }
            Err(e) => {
                error!(ticket, error = %e, "Failed to record close, will retry");
                Resolution::Retained
            }
        }
    }
}

/// Stand-in position for a ledger trade, good enough to look up its deals.
fn position_from_trade(trade: &Trade) -> Position {
    Position {
        ticket: trade.ticket,
        symbol: trade.symbol.clone(),
        side: trade.side,
        volume: trade.order_volume.unwrap_or_default(),
        open_price: trade.entry_price,
        stop_loss: None,
        take_profit: None,
        current_price: trade.entry_price,
        profit: Decimal::ZERO,
        open_time: trade.entry_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::fixtures::{deal, new_trade, position};
    use crate::models::{ClosingReason, DealEntry, DealReason, NewStopMutation, TradeSide};
    use crate::trading::mock::{FailingLedger, MockBroker};
    use rust_decimal_macros::dec;

    async fn ledger_with(tickets: &[u64]) -> Arc<Database> {
        let db = Database::in_memory().await.unwrap();
        for &ticket in tickets {
            let trade = new_trade(ticket, TradeSide::Buy, dec!(1.1));
            let stop = NewStopMutation {
                mutation_time: trade.entry_time,
                mutation_price: dec!(1.1),
                new_sl_price: dec!(1.09),
                new_tp_price: None,
                pnl_at_new_sl: dec!(-50),
                pnl_at_new_tp: None,
            };
            db.create_trade(trade, stop).await.unwrap();
        }
        Arc::new(db)
    }

    fn closing_deals(ticket: u64) -> Vec<crate::models::Deal> {
        let p = position(ticket, TradeSide::Buy, dec!(1.1));
        vec![
            deal(ticket * 10, ticket, p.open_time, DealEntry::In, DealReason::Expert, dec!(1.1), dec!(0)),
            deal(
                ticket * 10 + 1,
                ticket,
                p.open_time + chrono::Duration::hours(1),
                DealEntry::Out,
                DealReason::StopLoss,
                dec!(1.09),
                dec!(-50),
            ),
        ]
    }

    fn engine(broker: Arc<MockBroker>, ledger: Arc<dyn TradeLedger>) -> ReconciliationEngine {
        ReconciliationEngine::new(broker, ledger, Duration::ZERO)
    }

    #[tokio::test]
    async fn test_only_missing_ticket_is_closed() {
        let ledger = ledger_with(&[101, 102]).await;
        let broker = Arc::new(MockBroker::with_positions(vec![
            position(101, TradeSide::Buy, dec!(1.1)),
            position(102, TradeSide::Buy, dec!(1.1)),
        ]));
        broker.deals.lock().unwrap().insert(101, closing_deals(101));
        let engine = engine(broker.clone(), ledger.clone());

        let mut cache = PositionCache::new();
        engine.run_cycle(&mut cache).await.unwrap();
        assert_eq!(cache.tickets(), vec![101, 102]);

        broker.set_positions(vec![position(102, TradeSide::Buy, dec!(1.1))]);
        let report = engine.run_cycle(&mut cache).await.unwrap();

        assert_eq!(report.closed, 1);
        assert_eq!(cache.tickets(), vec![102]);
        assert_eq!(*broker.deal_calls.lock().unwrap(), vec![101]);

        let closed = ledger.get_trade_with_mutations(101).await.unwrap().unwrap().trade;
        let close = closed.close.unwrap();
        assert_eq!(close.reason, ClosingReason::StopLoss);
        assert_eq!(close.pnl, dec!(-50));
        assert!(ledger.get_trade_with_mutations(102).await.unwrap().unwrap().trade.is_open());
    }

    #[tokio::test]
    async fn test_repeat_cycle_is_noop() {
        let ledger = ledger_with(&[101]).await;
        let broker = Arc::new(MockBroker::with_positions(vec![position(
            101,
            TradeSide::Buy,
            dec!(1.1),
        )]));
        broker.deals.lock().unwrap().insert(101, closing_deals(101));
        let engine = engine(broker.clone(), ledger.clone());

        let mut cache = PositionCache::new();
        engine.run_cycle(&mut cache).await.unwrap();
        broker.set_positions(vec![]);

        let first = engine.run_cycle(&mut cache).await.unwrap();
        let second = engine.run_cycle(&mut cache).await.unwrap();

        assert_eq!(first.closed, 1);
        assert_eq!(second, ReconcileReport::default());
        assert_eq!(broker.deal_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_lookup_is_retried() {
        let ledger = ledger_with(&[101]).await;
        let broker = Arc::new(MockBroker::with_positions(vec![position(
            101,
            TradeSide::Buy,
            dec!(1.1),
        )]));
        let engine = engine(broker.clone(), ledger.clone());

        let mut cache = PositionCache::new();
        engine.run_cycle(&mut cache).await.unwrap();

        broker.set_positions(vec![]);
        broker.deal_failures.lock().unwrap().insert(101);
        let report = engine.run_cycle(&mut cache).await.unwrap();
        assert_eq!(report.retained, 1);
        assert!(cache.contains(101));

        // Deals not settled yet: still retained
        broker.deal_failures.lock().unwrap().clear();
        let report = engine.run_cycle(&mut cache).await.unwrap();
        assert_eq!(report.retained, 1);
        assert!(cache.contains(101));

        broker.deals.lock().unwrap().insert(101, closing_deals(101));
        let report = engine.run_cycle(&mut cache).await.unwrap();
        assert_eq!(report.closed, 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_failed_position_fetch_keeps_cache() {
        let ledger = ledger_with(&[101]).await;
        let broker = Arc::new(MockBroker::with_positions(vec![position(
            101,
            TradeSide::Buy,
            dec!(1.1),
        )]));
        let engine = engine(broker.clone(), ledger.clone());

        let mut cache = PositionCache::new();
        engine.run_cycle(&mut cache).await.unwrap();

        broker.fail_positions();
        assert!(engine.run_cycle(&mut cache).await.is_err());
        assert_eq!(cache.tickets(), vec![101]);
        assert!(broker.deal_calls.lock().unwrap().is_empty());
        assert!(ledger.get_trade_with_mutations(101).await.unwrap().unwrap().trade.is_open());
    }

    #[tokio::test]
    async fn test_orphan_evicted_and_ledger_error_retained() {
        let broker = Arc::new(MockBroker::with_positions(vec![position(
            500,
            TradeSide::Sell,
            dec!(1.1),
        )]));
        broker.deals.lock().unwrap().insert(500, closing_deals(500));

        // No trade row for 500
        let ledger = ledger_with(&[]).await;
        let orphan_engine = engine(broker.clone(), ledger);
        let mut cache = PositionCache::new();
        orphan_engine.run_cycle(&mut cache).await.unwrap();
        broker.set_positions(vec![]);
        let report = orphan_engine.run_cycle(&mut cache).await.unwrap();
        assert_eq!(report.orphaned, 1);
        assert!(cache.is_empty());

        // Ledger down: keep the ticket
        broker.set_positions(vec![position(500, TradeSide::Sell, dec!(1.1))]);
        let failing_engine = engine(broker.clone(), Arc::new(FailingLedger));
        let mut cache = PositionCache::new();
        failing_engine.run_cycle(&mut cache).await.unwrap();
        broker.set_positions(vec![]);
        let report = failing_engine.run_cycle(&mut cache).await.unwrap();
        assert_eq!(report.retained, 1);
        assert!(cache.contains(500));
    }

    #[tokio::test]
    async fn test_already_closed_is_evicted() {
        let ledger = ledger_with(&[101]).await;
        let deals = closing_deals(101);
        let summary = DealSummary::from_deals(101, &deals).unwrap();
        ledger.close_trade(101, summary.to_close()).await.unwrap();

        let broker = Arc::new(MockBroker::with_positions(vec![position(
            101,
            TradeSide::Buy,
            dec!(1.1),
        )]));
        broker.deals.lock().unwrap().insert(101, deals);
        let engine = engine(broker.clone(), ledger);

        let mut cache = PositionCache::new();
        engine.run_cycle(&mut cache).await.unwrap();
        broker.set_positions(vec![]);
        let report = engine.run_cycle(&mut cache).await.unwrap();

        assert_eq!(report.already_closed, 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_seeded_cache_closes_trades_missed_while_down() {
        let ledger = ledger_with(&[101, 102]).await;
        let broker = Arc::new(MockBroker::with_positions(vec![position(
            102,
            TradeSide::Buy,
            dec!(1.1),
        )]));
        broker.deals.lock().unwrap().insert(101, closing_deals(101));
        let engine = engine(broker.clone(), ledger.clone());

        let mut cache = PositionCache::new();
        assert_eq!(engine.seed_from_ledger(&mut cache).await.unwrap(), 2);
        assert_eq!(engine.seed_from_ledger(&mut cache).await.unwrap(), 0);

        let report = engine.run_cycle(&mut cache).await.unwrap();
        assert_eq!(report.closed, 1);
        assert_eq!(cache.tickets(), vec![102]);
        assert!(!ledger.get_trade_with_mutations(101).await.unwrap().unwrap().trade.is_open());
    }

    #[tokio::test]
    async fn test_opening_deal_only_keeps_trade_open() {
        let ledger = ledger_with(&[101]).await;
        let broker = Arc::new(MockBroker::with_positions(vec![position(
            101,
            TradeSide::Buy,
            dec!(1.1),
        )]));
        let opening = closing_deals(101).into_iter().take(1).collect();
        broker.deals.lock().unwrap().insert(101, opening);
        let engine = engine(broker.clone(), ledger.clone());

        let mut cache = PositionCache::new();
        engine.run_cycle(&mut cache).await.unwrap();
        broker.set_positions(vec![]);

        for _ in 0..2 {
            let report = engine.run_cycle(&mut cache).await.unwrap();
            assert_eq!(report.closed, 0);
            assert_eq!(report.retained, 1);
            assert!(cache.contains(101));
        }
        assert!(ledger.get_trade_with_mutations(101).await.unwrap().unwrap().trade.is_open());

        // Exit deal settles
        broker.deals.lock().unwrap().insert(101, closing_deals(101));
        let report = engine.run_cycle(&mut cache).await.unwrap();
        assert_eq!(report.closed, 1);
        let close = ledger.get_trade_with_mutations(101).await.unwrap().unwrap().trade.close.unwrap();
        assert_eq!(close.close_price, dec!(1.09));
        assert_eq!(close.reason, ClosingReason::StopLoss);
    }

    #[tokio::test]
    async fn test_settlement_delay_is_paid_once_per_cycle() {
        let tickets: Vec<u64> = (101..121).collect();
        let ledger = ledger_with(&tickets).await;
        let broker = Arc::new(MockBroker::with_positions(
            tickets.iter().map(|&t| position(t, TradeSide::Buy, dec!(1.1))).collect(),
        ));
        for &t in &tickets {
            broker.deals.lock().unwrap().insert(t, closing_deals(t));
        }
        let engine = ReconciliationEngine::new(broker.clone(), ledger, Duration::from_millis(100));

        let mut cache = PositionCache::new();
        engine.run_cycle(&mut cache).await.unwrap();
        broker.set_positions(vec![]);

        // Twenty closures at 100 ms each would take two seconds
        let report = tokio::time::timeout(Duration::from_secs(1), engine.run_cycle(&mut cache))
            .await
            .expect("cycle should finish well within the timeout")
            .unwrap();
        assert_eq!(report.closed, 20);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_timed_out_cycle_keeps_finished_closures() {
        let ledger = ledger_with(&[101, 102]).await;
        let broker = Arc::new(MockBroker::with_positions(vec![
            position(101, TradeSide::Buy, dec!(1.1)),
            position(102, TradeSide::Buy, dec!(1.1)),
        ]));
        broker.deals.lock().unwrap().insert(101, closing_deals(101));
        broker.stalled_deals.lock().unwrap().insert(102);
        let engine = engine(broker.clone(), ledger.clone());

        let mut cache = PositionCache::new();
        engine.run_cycle(&mut cache).await.unwrap();
        broker.set_positions(vec![position(103, TradeSide::Buy, dec!(1.1))]);

        let cut_short =
            tokio::time::timeout(Duration::from_millis(200), engine.run_cycle(&mut cache)).await;
        assert!(cut_short.is_err());

        assert_eq!(cache.tickets(), vec![102, 103]);
        assert!(!ledger.get_trade_with_mutations(101).await.unwrap().unwrap().trade.is_open());

        // Next cycle only looks at the unresolved ticket
        broker.stalled_deals.lock().unwrap().clear();
        broker.deals.lock().unwrap().insert(102, closing_deals(102));
        broker.deal_calls.lock().unwrap().clear();
        let report = engine.run_cycle(&mut cache).await.unwrap();
        assert_eq!(report.closed, 1);
        assert_eq!(*broker.deal_calls.lock().unwrap(), vec![102]);
        assert_eq!(cache.tickets(), vec![103]);
    }
}
