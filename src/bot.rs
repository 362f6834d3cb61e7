//! Bot runner: schedules the reconciliation, trailing and entry cycles.
//!
//! Each engine runs on its own interval inside one `select!` loop. A cycle that
//! fails or exceeds the cycle timeout is logged and the loop carries on.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::{Broker, BrokerError};
use crate::db::TradeLedger;
use crate::trading::{
    EntryEngine, EntryReport, MeanReversion, PositionCache, ReconcileReport, ReconciliationEngine,
    SignalSource, StrategyConfig, TrailingReport, TrailingStopEngine,
};

/// Main bot runner.
pub struct Bot {
    config: StrategyConfig,
    dry_run: bool,
    cache: PositionCache,
    reconciler: ReconciliationEngine,
    trailer: TrailingStopEngine,
    entries: EntryEngine,
    stats: BotStats,
}

impl Bot {
    pub fn new(
        broker: Arc<dyn Broker>,
        ledger: Arc<dyn TradeLedger>,
        config: StrategyConfig,
        dry_run: bool,
    ) -> Self {
        let signal: Arc<dyn SignalSource> = Arc::new(MeanReversion::default());
        Self::with_signal(broker, ledger, signal, config, dry_run)
    }

    pub fn with_signal(
        broker: Arc<dyn Broker>,
        ledger: Arc<dyn TradeLedger>,
        signal: Arc<dyn SignalSource>,
        config: StrategyConfig,
        dry_run: bool,
    ) -> Self {
        let reconciler =
            ReconciliationEngine::new(broker.clone(), ledger.clone(), config.settlement_delay());
        let trailer =
            TrailingStopEngine::new(broker.clone(), ledger.clone(), config.ladder.clone(), config.epsilon);
        let entries = EntryEngine::new(broker, ledger, signal, config.clone());

        Self {
            config,
            dry_run,
            cache: PositionCache::new(),
            reconciler,
            trailer,
            entries,
            stats: BotStats::default(),
        }
    }

    /// Main run loop. Returns when Ctrl+C is received.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            pairs = ?self.config.pairs,
            timeframe = %self.config.timeframe,
            dry_run = self.dry_run,
            reconcile_secs = self.config.reconcile_interval_secs,
            trailing_secs = self.config.trailing_interval_secs,
            entry_secs = self.config.entry_interval_secs,
            "Starting bot run loop"
        );

        self.recover().await?;

        let mut reconcile_tick = ticker(self.config.reconcile_interval_secs);
        let mut trailing_tick = ticker(self.config.trailing_interval_secs);
        let mut entry_tick = ticker(self.config.entry_interval_secs);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                res = &mut shutdown => {
                    res.context("Failed to listen for Ctrl+C")?;
                    info!("Shutdown signal received");
                    break;
                }
                _ = reconcile_tick.tick() => {
                    let _ = self.reconcile_once().await;
                }
                _ = trailing_tick.tick() => {
                    let _ = self.trail_once().await;
                }
                _ = entry_tick.tick() => {
                    let _ = self.enter_once().await;
                }
            }
        }

        info!("Bot shutdown complete");
        Ok(())
    }

    /// Seed the position cache from open ledger trades.
    pub async fn recover(&mut self) -> Result<usize> {
        self.reconciler
            .seed_from_ledger(&mut self.cache)
            .await
            .context("Failed to load open trades")
    }

    /// One reconciliation cycle against the bot's position cache.
    pub async fn reconcile_once(&mut self) -> Option<ReconcileReport> {
        let limit = self.config.cycle_timeout();
        let cycle = self.reconciler.run_cycle(&mut self.cache);
        let report = finish_cycle("reconcile", limit, cycle).await;

        match &report {
            Some(r) => {
                self.stats.closed += r.closed;
                debug!(open = r.open, closed = r.closed, retained = r.retained, cached = self.cache.len(), "Reconcile cycle done");
            }
            None => self.stats.failed_cycles += 1,
        }
        report
    }

    pub async fn trail_once(&mut self) -> Option<TrailingReport> {
        let limit = self.config.cycle_timeout();
        let report = finish_cycle("trailing", limit, self.trailer.run_cycle()).await;

        match &report {
            Some(r) => {
                self.stats.ratchets += r.ratcheted;
                debug!(evaluated = r.evaluated, ratcheted = r.ratcheted, "Trailing cycle done");
            }
            None => self.stats.failed_cycles += 1,
        }
        report
    }

    pub async fn enter_once(&mut self) -> Option<EntryReport> {
        let limit = self.config.cycle_timeout();
        let report = finish_cycle("entry", limit, self.entries.run_cycle(self.dry_run)).await;

        match &report {
            Some(r) => {
                self.stats.signals += r.signals;
                self.stats.opened += r.opened;
                debug!(scanned = r.scanned, signals = r.signals, opened = r.opened, "Entry cycle done");
            }
            None => self.stats.failed_cycles += 1,
        }
        report
    }

    pub fn cache(&self) -> &PositionCache {
        &self.cache
    }

    pub fn stats(&self) -> &BotStats {
        &self.stats
    }
}

fn ticker(secs: u64) -> tokio::time::Interval {
    let mut tick = interval(Duration::from_secs(secs.max(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
}

/// Await a cycle under `limit`, logging failures. `None` when the cycle did not complete.
async fn finish_cycle<T, F>(name: &str, limit: Duration, cycle: F) -> Option<T>
where
    F: Future<Output = Result<T, BrokerError>>,
{
    match timeout(limit, cycle).await {
        Ok(Ok(report)) => Some(report),
        Ok(Err(e)) if e.is_transient() => {
            warn!(cycle = name, error = %e, "Broker unavailable, cycle skipped");
            None
        }
        Ok(Err(e)) => {
            error!(cycle = name, error = %e, "Cycle failed");
            None
        }
        Err(_) => {
            warn!(cycle = name, timeout_secs = limit.as_secs(), "Cycle timed out");
            None
        }
    }
}

/// Running totals since start.
#[derive(Debug, Clone, Default)]
pub struct BotStats {
    pub closed: usize,
    pub ratchets: usize,
    pub signals: usize,
    pub opened: usize,
    pub failed_cycles: usize,
}

impl std::fmt::Display for BotStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Bot Statistics ===")?;
        writeln!(f, "Trades Opened:   {}", self.opened)?;
        writeln!(f, "Trades Closed:   {}", self.closed)?;
        writeln!(f, "Stop Ratchets:   {}", self.ratchets)?;
        writeln!(f, "Entry Signals:   {}", self.signals)?;
        writeln!(f, "Failed Cycles:   {}", self.failed_cycles)?;
        Ok(())
    }
}
