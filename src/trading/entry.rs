//! Entry: turn band-crossing signals into market orders and ledger trades.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::api::{Broker, BrokerError};
use crate::db::TradeLedger;
use crate::models::{
    FillPolicy, InstrumentClass, NewStopMutation, NewTrade, OrderFill, OrderRequest, SymbolInfo,
    Tick, TradeSide,
};

use super::config::StrategyConfig;
use super::pricing::{self, LotSize, PositionTerms, PricingError};
use super::signal::{Signal, SignalSource};

/// Counts from one entry cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryReport {
    pub scanned: usize,
    pub signals: usize,
    pub submitted: usize,
    pub opened: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Fully priced order for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryPlan {
    pub symbol: String,
    pub side: TradeSide,
    pub class: InstrumentClass,

    /// Ask for buys, bid for sells
    pub price: Decimal,

    pub position_size: Decimal,
    pub lots: Decimal,
    pub commission: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
    Ready(EntryPlan),
    BelowMinimum(Decimal),
    /// The stop would trigger immediately
    StopCrossesMarket { stop: Decimal, market: Decimal },
}

enum SymbolOutcome {
    NoSignal,
    Skipped,
    DryRun,
    Opened,
    Failed,
}

/// Price an entry from the current quote. Pure; no broker access.
pub fn plan_entry(
    config: &StrategyConfig,
    symbol: &str,
    side: TradeSide,
    tick: &Tick,
    info: &SymbolInfo,
) -> Result<PlanOutcome, PricingError> {
    let class = InstrumentClass::of(symbol)
        .ok_or_else(|| PricingError::UnknownInstrument(symbol.to_string()))?;

    let price = match side {
        TradeSide::Buy => tick.ask,
        TradeSide::Sell => tick.bid,
    };
    let position_size = pricing::order_size(config.capital_per_trade, config.leverage);

    let lots = match pricing::usd_to_lots(info, tick, position_size, side)? {
        LotSize::Tradeable(lots) => lots,
        LotSize::BelowMinimum(lots) => return Ok(PlanOutcome::BelowMinimum(lots)),
    };

    let commission = pricing::commission(position_size, symbol)?;
    let terms = PositionTerms::new(price, position_size, config.leverage, side, commission)?;

    let stop_loss = pricing::round_price(
        terms
            .price_at_pnl(config.capital_per_trade * config.sl_multiplier)
            .with_commission,
        info.digits,
    );
    let take_profit = config.tp_multiplier.map(|m| {
        pricing::round_price(
            terms.price_at_pnl(config.capital_per_trade * m).with_commission,
            info.digits,
        )
    });

    let crosses = match side {
        TradeSide::Buy => (stop_loss > tick.bid).then_some(tick.bid),
        TradeSide::Sell => (stop_loss < tick.ask).then_some(tick.ask),
    };
    if let Some(market) = crosses {
        return Ok(PlanOutcome::StopCrossesMarket {
            stop: stop_loss,
            market,
        });
    }

    Ok(PlanOutcome::Ready(EntryPlan {
        symbol: symbol.to_string(),
        side,
        class,
        price,
        position_size,
        lots,
        commission,
        stop_loss,
        take_profit,
    }))
}

pub struct EntryEngine {
    broker: Arc<dyn Broker>,
    ledger: Arc<dyn TradeLedger>,
    signal: Arc<dyn SignalSource>,
    config: StrategyConfig,
}

impl EntryEngine {
    pub fn new(
        broker: Arc<dyn Broker>,
        ledger: Arc<dyn TradeLedger>,
        signal: Arc<dyn SignalSource>,
        config: StrategyConfig,
    ) -> Self {
        Self {
            broker,
            ledger,
            signal,
            config,
        }
    }

    /// Scan every configured symbol once. With `dry_run`, orders are priced and logged but not sent.
    pub async fn run_cycle(&self, dry_run: bool) -> Result<EntryReport, BrokerError> {
        let open_symbols: HashSet<String> = self
            .broker
            .open_positions()
            .await?
            .into_iter()
            .map(|p| p.symbol)
            .collect();

        let now = Utc::now();
        let mut report = EntryReport::default();

        for symbol in &self.config.pairs {
            report.scanned += 1;

            if open_symbols.contains(symbol) {
                debug!(symbol = %symbol, "Position already open");
                report.skipped += 1;
                continue;
            }

            let outcome = match self.scan_symbol(symbol, now, dry_run, &mut report).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Entry scan failed");
                    SymbolOutcome::Failed
                }
            };

            match outcome {
                SymbolOutcome::NoSignal | SymbolOutcome::DryRun => {}
                SymbolOutcome::Skipped => report.skipped += 1,
                SymbolOutcome::Opened => report.opened += 1,
                SymbolOutcome::Failed => report.failed += 1,
            }
        }

        Ok(report)
    }

    async fn scan_symbol(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
        dry_run: bool,
        report: &mut EntryReport,
    ) -> Result<SymbolOutcome, BrokerError> {
        let Some(class) = InstrumentClass::of(symbol) else {
            warn!(symbol, "No instrument class, skipping");
            return Ok(SymbolOutcome::Skipped);
        };

        let Some(tick) = self.broker.symbol_tick(symbol).await? else {
            debug!(symbol, "No quote");
            return Ok(SymbolOutcome::Skipped);
        };

        let max_age = Duration::seconds(self.config.max_tick_age_secs);
        if !class.trades_around_the_clock() && !tick.is_fresh(now, max_age) {
            debug!(symbol, last_tick = %tick.time, "Market closed");
            return Ok(SymbolOutcome::Skipped);
        }

        let bars = self
            .broker
            .bars(symbol, self.config.timeframe, self.config.bars)
            .await?;
        let forming = bars
            .last()
            .is_some_and(|b| b.time + self.config.timeframe.duration() > now);
        let closed = if forming { &bars[..bars.len() - 1] } else { &bars[..] };

        let side = match self.signal.evaluate(symbol, closed) {
            Signal::Bottom => TradeSide::Buy,
            Signal::Top => TradeSide::Sell,
            Signal::None => return Ok(SymbolOutcome::NoSignal),
        };
        report.signals += 1;
        info!(symbol, side = %side, signal = self.signal.name(), "Entry signal");

        let Some(info) = self.broker.symbol_info(symbol).await? else {
            warn!(symbol, "No symbol info");
            return Ok(SymbolOutcome::Skipped);
        };

        let plan = match plan_entry(&self.config, symbol, side, &tick, &info) {
            Ok(PlanOutcome::Ready(plan)) => plan,
            Ok(PlanOutcome::BelowMinimum(lots)) => {
                warn!(symbol, lots = %lots, min = %info.volume_min, "Order volume below minimum");
                return Ok(SymbolOutcome::Skipped);
            }
            Ok(PlanOutcome::StopCrossesMarket { stop, market }) => {
                warn!(symbol, side = %side, stop = %stop, market = %market, "Stop already beyond market");
                return Ok(SymbolOutcome::Skipped);
            }
            Err(e) => {
                error!(symbol, error = %e, "Cannot price entry");
                return Ok(SymbolOutcome::Skipped);
            }
        };

        if dry_run {
            info!(
                symbol,
                side = %side,
                price = %plan.price,
                lots = %plan.lots,
                stop_loss = %plan.stop_loss,
                take_profit = ?plan.take_profit,
                "Dry run: order not sent"
            );
            return Ok(SymbolOutcome::DryRun);
        }

        let request = OrderRequest {
            symbol: symbol.to_string(),
            side,
            volume: plan.lots,
            stop_loss: plan.stop_loss,
            take_profit: plan.take_profit,
            deviation: self.config.deviation,
            magic: self.config.magic,
            comment: self.config.order_comment.clone(),
            filling: FillPolicy::FillOrKill,
        };

        report.submitted += 1;
        let fill = match self.broker.submit_order(&request).await {
            Ok(fill) => fill,
            Err(BrokerError::Rejected(reason)) => {
                warn!(symbol, reason = %reason, "Order rejected");
                return Ok(SymbolOutcome::Failed);
            }
            Err(e) => return Err(e),
        };

        info!(
            symbol,
            ticket = fill.order,
            side = %side,
            price = %fill.price,
            volume = %fill.volume,
            "Order filled"
        );

        self.record_fill(&plan, &fill, now).await;
        Ok(SymbolOutcome::Opened)
    }

    async fn record_fill(&self, plan: &EntryPlan, fill: &OrderFill, now: DateTime<Utc>) {
        let terms = match PositionTerms::new(
            fill.price,
            plan.position_size,
            self.config.leverage,
            plan.side,
            plan.commission,
        ) {
            Ok(terms) => terms,
            Err(e) => {
                error!(ticket = fill.order, error = %e, "Fill cannot be priced, trade not recorded");
                return;
            }
        };

        let trade = NewTrade {
            ticket: fill.order,
            symbol: plan.symbol.clone(),
            side: plan.side,
            entry_time: now,
            entry_price: fill.price,
            position_size: plan.position_size,
            capital: self.config.capital_per_trade,
            leverage: self.config.leverage,
            order_volume: Some(fill.volume),
            commission: plan.commission,
            break_even_price: terms.break_even_price(),
            liquidation_price: terms.liquidation_price(),
            strategy: self.config.strategy_name.clone(),
            broker: self.config.broker_name.clone(),
            market_type: plan.class.market_type(),
            timeframe: self.config.timeframe,
        };

        let initial_stop = NewStopMutation {
            mutation_time: now,
            mutation_price: fill.price,
            new_sl_price: plan.stop_loss,
            new_tp_price: plan.take_profit,
            pnl_at_new_sl: terms.pnl_at_price(plan.stop_loss).gross,
            pnl_at_new_tp: plan.take_profit.map(|tp| terms.pnl_at_price(tp).gross),
        };

        if let Err(e) = self.ledger.create_trade(trade, initial_stop).await {
            error!(ticket = fill.order, symbol = %plan.symbol, error = %e, "Order filled but trade not recorded");
        }
    }
}
