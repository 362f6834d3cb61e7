//! Data models for trades, positions, deals, orders and market data.

mod deal;
mod instrument;
mod market;
mod mutation;
mod order;
mod position;
mod trade;

pub use deal::{Deal, DealEntry, DealReason, DealSummary, HistoricalOrder};
pub use instrument::{InstrumentClass, MarketType};
pub use market::{Bar, SymbolInfo, Tick, Timeframe};
pub use mutation::{NewStopMutation, StopMutation, TradeWithMutations};
pub use order::{FillPolicy, OrderFill, OrderRequest, StopModification};
pub use position::Position;
pub use trade::{ClosingReason, NewTrade, Trade, TradeClose, TradeSide};
