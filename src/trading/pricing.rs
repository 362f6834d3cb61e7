//! Price and P&L arithmetic shared by the entry, trailing and close paths.
//!
//! Every function is pure. Inputs that would divide by zero are rejected with
//! [`PricingError::InvalidInput`] instead of producing infinities.

use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

use crate::models::{InstrumentClass, SymbolInfo, Tick, TradeSide};

#[derive(Debug, Error, PartialEq)]
pub enum PricingError {
    #[error("invalid side: {0:?} (expected BUY or SELL)")]
    InvalidSide(String),

    #[error("unknown instrument: {0}")]
    UnknownInstrument(String),

    #[error("invalid {field}: {value} (must be positive)")]
    InvalidInput { field: &'static str, value: Decimal },
}

/// Prices at which a target P&L is reached.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceAtPnl {
    /// Price at which the P&L net of commission equals the target
    pub with_commission: Decimal,
    /// Price at which the gross P&L equals the target
    pub without_commission: Decimal,
}

/// P&L of a position at a given price.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PnlAtPrice {
    /// Before commission
    pub gross: Decimal,
    /// After commission
    pub net: Decimal,
}

/// Outcome of converting a quote-currency amount into lots.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LotSize {
    Tradeable(Decimal),
    /// Rounded volume is zero or under the instrument minimum
    BelowMinimum(Decimal),
}

fn require_positive(field: &'static str, value: Decimal) -> Result<Decimal, PricingError> {
    if value > Decimal::ZERO {
        Ok(value)
    } else {
        Err(PricingError::InvalidInput { field, value })
    }
}

/// Validated economic terms of one position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionTerms {
    entry_price: Decimal,
    position_size: Decimal,
    leverage: Decimal,
    side: TradeSide,
    commission: Decimal,
}

impl PositionTerms {
    pub fn new(
        entry_price: Decimal,
        position_size: Decimal,
        leverage: Decimal,
        side: TradeSide,
        commission: Decimal,
    ) -> Result<Self, PricingError> {
        Ok(Self {
            entry_price: require_positive("entry price", entry_price)?,
            position_size: require_positive("position size", position_size)?,
            leverage: require_positive("leverage", leverage)?,
            side,
            commission,
        })
    }

    pub fn price_at_pnl(&self, desired_pnl: Decimal) -> PriceAtPnl {
        let sign = self.side.sign();
        let with = (desired_pnl + self.commission) / self.position_size;
        let without = desired_pnl / self.position_size;

        PriceAtPnl {
            with_commission: self.entry_price * (Decimal::ONE + sign * with),
            without_commission: self.entry_price * (Decimal::ONE + sign * without),
        }
    }

    pub fn pnl_at_price(&self, price: Decimal) -> PnlAtPrice {
        let change = self.side.sign() * (price - self.entry_price) / self.entry_price;
        let gross = self.position_size * change;

        PnlAtPrice {
            gross,
            net: gross - self.commission,
        }
    }

    /// Price at which the margin is exhausted.
    pub fn liquidation_price(&self) -> Decimal {
        let offset = self.side.sign() * Decimal::ONE / self.leverage;
        self.entry_price * (Decimal::ONE - offset)
    }

    /// Price at which the P&L net of commission is zero.
    pub fn break_even_price(&self) -> Decimal {
        self.price_at_pnl(Decimal::ZERO).with_commission
    }
}

pub fn price_at_pnl(
    desired_pnl: Decimal,
    entry_price: Decimal,
    position_size: Decimal,
    leverage: Decimal,
    side: TradeSide,
    commission: Decimal,
) -> Result<PriceAtPnl, PricingError> {
    let terms = PositionTerms::new(entry_price, position_size, leverage, side, commission)?;
    Ok(terms.price_at_pnl(desired_pnl))
}

pub fn pnl_at_price(
    price: Decimal,
    entry_price: Decimal,
    position_size: Decimal,
    leverage: Decimal,
    side: TradeSide,
    commission: Decimal,
) -> Result<PnlAtPrice, PricingError> {
    let terms = PositionTerms::new(entry_price, position_size, leverage, side, commission)?;
    Ok(terms.pnl_at_price(price))
}

pub fn liquidation_price(
    entry_price: Decimal,
    leverage: Decimal,
    side: TradeSide,
) -> Result<Decimal, PricingError> {
    let entry_price = require_positive("entry price", entry_price)?;
    let leverage = require_positive("leverage", leverage)?;
    let offset = side.sign() * Decimal::ONE / leverage;
    Ok(entry_price * (Decimal::ONE - offset))
}

/// Notional exposure of a leveraged position.
pub fn order_size(capital: Decimal, leverage: Decimal) -> Decimal {
    capital * leverage
}

/// Round-trip commission for a position of `position_size` in `symbol`.
pub fn commission(position_size: Decimal, symbol: &str) -> Result<Decimal, PricingError> {
    let class = InstrumentClass::of(symbol)
        .ok_or_else(|| PricingError::UnknownInstrument(symbol.to_string()))?;
    Ok(position_size * class.commission_rate())
}

/// Convert a quote-currency amount into lots at the side's executable price.
///
/// Buys are sized at the ask and sells at the bid. The result is rounded to the
/// volume step (half to even) and is never negative.
pub fn usd_to_lots(
    info: &SymbolInfo,
    tick: &Tick,
    usd_amount: Decimal,
    side: TradeSide,
) -> Result<LotSize, PricingError> {
    let price = match side {
        TradeSide::Buy => require_positive("ask", tick.ask)?,
        TradeSide::Sell => require_positive("bid", tick.bid)?,
    };
    let contract_size = require_positive("contract size", info.contract_size)?;
    let step = require_positive("volume step", info.volume_step)?;

    let raw = usd_amount / (contract_size * price);
    let steps = (raw / step).round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven);
    let lots = (steps * step).max(Decimal::ZERO).normalize();

    if lots.is_zero() || lots < info.volume_min {
        Ok(LotSize::BelowMinimum(lots))
    } else {
        Ok(LotSize::Tradeable(lots))
    }
}

pub fn lots_to_usd(info: &SymbolInfo, lots: Decimal, price: Decimal) -> Decimal {
    lots * info.contract_size * price
}

/// Round a price to the instrument's quoted precision.
pub fn round_price(price: Decimal, digits: u32) -> Decimal {
    price.round_dp_with_strategy(digits, RoundingStrategy::MidpointNearestEven)
}
