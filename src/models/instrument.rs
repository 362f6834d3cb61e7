//! Instrument classes used for commission lookup and market tagging.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

pub const METALS: &[&str] = &["XAUUSD", "XAGUSD", "XAUEUR"];

pub const OILS: &[&str] = &["BRN", "NG", "WTI"];

pub const CRYPTOCURRENCIES: &[&str] = &[
    "BITCOIN", "ETHEREUM", "SOLANA", "DOGECOIN", "LITECOIN", "RIPPLE", "BNB", "UNISWAP",
    "AVALANCH", "CARDANO", "CHAINLINK", "POLKADOT", "POLYGON", "COSMOS", "AXS",
];

pub const CURRENCY_PAIRS: &[&str] = &[
    "USDJPY", "USDCHF", "USDCAD", "EURUSD", "EURGBP", "EURJPY", "EURCHF", "EURCAD", "EURAUD",
    "EURNZD", "GBPUSD", "GBPJPY", "GBPCHF", "GBPCAD", "GBPAUD", "GBPNZD", "CHFJPY", "CADJPY",
    "CADCHF", "AUDUSD", "AUDJPY", "AUDCHF", "AUDCAD", "AUDNZD", "NZDUSD", "NZDJPY", "NZDCHF",
    "NZDCAD",
];

/// Broad instrument class of a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentClass {
    Crypto,
    Metal,
    Oil,
    CurrencyPair,
}

impl InstrumentClass {
    /// Classify a broker symbol. Unknown symbols yield `None`.
    pub fn of(symbol: &str) -> Option<Self> {
        if CRYPTOCURRENCIES.contains(&symbol) {
            Some(Self::Crypto)
        } else if METALS.contains(&symbol) {
            Some(Self::Metal)
        } else if OILS.contains(&symbol) {
            Some(Self::Oil)
        } else if CURRENCY_PAIRS.contains(&symbol) {
            Some(Self::CurrencyPair)
        } else {
            None
        }
    }

    /// Commission rate on notional, covering both the open and the close.
    pub fn commission_rate(&self) -> Decimal {
        match self {
            Self::Crypto => dec!(0.0005),
            Self::Metal | Self::Oil | Self::CurrencyPair => dec!(0.00025),
        }
    }

    /// Crypto markets never close.
    pub fn trades_around_the_clock(&self) -> bool {
        matches!(self, Self::Crypto)
    }

    pub fn market_type(&self) -> MarketType {
        match self {
            Self::Crypto => MarketType::Crypto,
            Self::CurrencyPair => MarketType::Forex,
            Self::Metal | Self::Oil => MarketType::Other,
        }
    }
}

/// Market tag stored with each trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketType {
    Forex,
    Crypto,
    Other,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Forex => "FOREX",
            MarketType::Crypto => "CRYPTO",
            MarketType::Other => "OTHER",
        }
    }
}

impl FromStr for MarketType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FOREX" => Ok(MarketType::Forex),
            "CRYPTO" => Ok(MarketType::Crypto),
            "OTHER" => Ok(MarketType::Other),
            other => anyhow::bail!("Unknown market type: {}", other),
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
