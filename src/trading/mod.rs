//! Trading logic: pricing, signals, and the entry / trailing / reconciliation engines.

mod config;
mod entry;
mod pricing;
mod reconcile;
mod signal;
mod trailing;

#[cfg(test)]
pub(crate) mod mock;

pub use config::StrategyConfig;
pub use entry::{plan_entry, EntryEngine, EntryReport, PlanOutcome};
pub use pricing::{liquidation_price, lots_to_usd, pnl_at_price, price_at_pnl, PricingError};
pub use reconcile::{PositionCache, ReconcileReport, ReconciliationEngine};
pub use signal::{MeanReversion, SignalSource};
pub use trailing::{TrailingReport, TrailingStopEngine};
