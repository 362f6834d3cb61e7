//! Trailing stop: ratchet stop-losses up a ladder of profit milestones.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::api::{Broker, BrokerError};
use crate::db::TradeLedger;
use crate::models::{NewStopMutation, Position, StopModification};

use super::config::LadderStep;
use super::pricing::PositionTerms;

/// Counts from one trailing cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrailingReport {
    pub evaluated: usize,
    pub ratcheted: usize,
    /// No trade in the ledger, or the trade is already closed
    pub skipped: usize,
    pub failed: usize,
}

/// A ladder step that fired for a position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ratchet {
    pub step: LadderStep,
    pub trigger_pnl: Decimal,
    pub new_sl: Decimal,
}

enum Outcome {
    Unchanged,
    Ratcheted,
    Skipped,
    Failed,
}

pub struct TrailingStopEngine {
    broker: Arc<dyn Broker>,
    ledger: Arc<dyn TradeLedger>,
    ladder: Vec<LadderStep>,
    epsilon: Decimal,
}

impl TrailingStopEngine {
    pub fn new(
        broker: Arc<dyn Broker>,
        ledger: Arc<dyn TradeLedger>,
        ladder: Vec<LadderStep>,
        epsilon: Decimal,
    ) -> Self {
        Self {
            broker,
            ledger,
            ladder,
            epsilon,
        }
    }

    /// First ladder step, in declared order, whose trigger is reached and whose
    /// stop beats the current one by more than epsilon.
    pub fn select_step(
        &self,
        position: &Position,
        terms: &PositionTerms,
        capital: Decimal,
    ) -> Option<Ratchet> {
        for step in &self.ladder {
            let trigger_pnl = capital * step.trigger;
            let new_sl = terms.price_at_pnl(capital * step.new_sl).with_commission;

            if position.profit >= trigger_pnl && position.stop_improves(new_sl, self.epsilon) {
                return Some(Ratchet {
                    step: *step,
                    trigger_pnl,
                    new_sl,
                });
            }

            debug!(
                ticket = position.ticket,
                trigger = %step.trigger,
                trigger_price = %terms.price_at_pnl(trigger_pnl).with_commission,
                profit = %position.profit,
                "Ladder step not taken"
            );
        }
        None
    }

    /// Evaluate every open position once.
    pub async fn run_cycle(&self) -> Result<TrailingReport, BrokerError> {
        let positions = self.broker.open_positions().await?;
        let mut report = TrailingReport::default();

        for position in &positions {
            report.evaluated += 1;
            match self.trail(position).await {
                Outcome::Unchanged => {}
                Outcome::Ratcheted => report.ratcheted += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Failed => report.failed += 1,
            }
        }

        Ok(report)
    }

    async fn trail(&self, position: &Position) -> Outcome {
        let ticket = position.ticket;

        let record = match self.ledger.get_trade_with_mutations(ticket).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                error!(ticket, symbol = %position.symbol, "Open position has no trade in the ledger");
                return Outcome::Skipped;
            }
            Err(e) => {
                error!(ticket, error = %e, "Failed to load trade");
                return Outcome::Failed;
            }
        };
        let trade = &record.trade;

        if !trade.is_open() {
            debug!(ticket, "Trade already closed in the ledger");
            return Outcome::Skipped;
        }
        if trade.side != position.side {
            error!(ticket, ledger = %trade.side, broker = %position.side, "Side mismatch between ledger and broker");
            return Outcome::Skipped;
        }

        let terms = match PositionTerms::new(
            position.open_price,
            trade.position_size,
            trade.leverage,
            trade.side,
            trade.commission,
        ) {
            Ok(terms) => terms,
            Err(e) => {
                error!(ticket, error = %e, "Cannot price position");
                return Outcome::Skipped;
            }
        };

        if let Some(sl) = position.stop_loss {
            debug!(
                ticket,
                stop_loss = %sl,
                pnl_at_stop = %terms.pnl_at_price(sl).net,
                recorded_stop = ?record.last_stop(),
                "Current stop"
            );
        }

        let Some(ratchet) = self.select_step(position, &terms, trade.capital) else {
            return Outcome::Unchanged;
        };

        let request = StopModification {
            ticket,
            symbol: position.symbol.clone(),
            stop_loss: ratchet.new_sl,
            take_profit: position.take_profit,
        };

        if let Err(e) = self.broker.modify_stop(&request).await {
            warn!(ticket, new_sl = %ratchet.new_sl, error = %e, "Stop modification failed");
            return Outcome::Failed;
        }

        info!(
            ticket,
            symbol = %position.symbol,
            side = %position.side,
            trigger = %ratchet.step.trigger,
            old_sl = ?position.stop_loss,
            new_sl = %ratchet.new_sl,
            profit = %position.profit,
            "Stop ratcheted"
        );

        let mutation = NewStopMutation {
            mutation_time: Utc::now(),
            mutation_price: position.current_price,
            new_sl_price: ratchet.new_sl,
            new_tp_price: position.take_profit,
            pnl_at_new_sl: terms.pnl_at_price(ratchet.new_sl).gross,
            pnl_at_new_tp: position.take_profit.map(|tp| terms.pnl_at_price(tp).gross),
        };

        if let Err(e) = self.ledger.append_mutation(trade.id, mutation).await {
            error!(ticket, error = %e, "Stop moved at the broker but not recorded");
        }

        Outcome::Ratcheted
    }
}
