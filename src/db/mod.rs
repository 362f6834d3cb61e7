//! Trade ledger persistence.
//!
//! Two tables:
//! - `trades`: one row per broker position, closed exactly once
//! - `stop_mutations`: append-only history of stop-loss / take-profit changes

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{
    ClosingReason, NewStopMutation, NewTrade, StopMutation, Trade, TradeClose, TradeWithMutations,
};

/// Result of closing a trade by ticket.
#[derive(Debug, Clone)]
pub enum CloseOutcome {
    Closed(Trade),
    /// Close fields were already set; nothing written
    AlreadyClosed,
    /// No trade row for the ticket
    NotFound,
}

/// Persistent record of trades and their stop mutations.
#[async_trait]
pub trait TradeLedger: Send + Sync {
    /// Insert a trade and its initial stop in one transaction.
    async fn create_trade(
        &self,
        trade: NewTrade,
        initial_stop: NewStopMutation,
    ) -> Result<(Trade, StopMutation)>;

    async fn append_mutation(&self, trade_id: i64, mutation: NewStopMutation)
        -> Result<StopMutation>;

    /// Set every close field at once, only if the trade is still open.
    async fn close_trade(&self, ticket: u64, close: TradeClose) -> Result<CloseOutcome>;

    async fn get_trade_with_mutations(&self, ticket: u64) -> Result<Option<TradeWithMutations>>;

    async fn list_trades(&self, open_only: bool) -> Result<Vec<Trade>>;
}

/// SQLite-backed ledger.
pub struct Database {
    pool: SqlitePool,
}

/// Stored trade record.
#[derive(Debug, Clone, sqlx::FromRow)]
struct TradeRow {
    id: i64,
    transaction_broker_id: i64,
    symbol: String,
    side: String,
    entry_time: DateTime<Utc>,
    entry_price: f64,
    position_size: f64,
    capital: f64,
    leverage: f64,
    order_volume: Option<f64>,
    commission: f64,
    break_even_price: f64,
    liquidation_price: f64,
    close_time: Option<DateTime<Utc>>,
    close_price: Option<f64>,
    pnl: Option<f64>,
    pnl_net: Option<f64>,
    closing_reason: Option<String>,
    strategy: String,
    broker: String,
    market_type: String,
    timeframe: String,
}

/// Stored stop mutation record.
#[derive(Debug, Clone, sqlx::FromRow)]
struct StopMutationRow {
    id: i64,
    trade_id: i64,
    mutation_time: DateTime<Utc>,
    mutation_price: f64,
    new_sl_price: f64,
    new_tp_price: Option<f64>,
    pnl_at_new_sl: f64,
    pnl_at_new_tp: Option<f64>,
}

fn dec(value: f64, column: &str) -> Result<Decimal> {
    Decimal::try_from(value).with_context(|| format!("Column {} holds {}", column, value))
}

fn dec_opt(value: Option<f64>, column: &str) -> Result<Option<Decimal>> {
    value.map(|v| dec(v, column)).transpose()
}

fn real(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(f64::NAN)
}

fn ticket_key(ticket: u64) -> Result<i64> {
    i64::try_from(ticket).with_context(|| format!("Ticket {} out of range", ticket))
}

impl TryFrom<TradeRow> for Trade {
    type Error = anyhow::Error;

    fn try_from(row: TradeRow) -> Result<Self> {
        let close = match (
            row.close_time,
            row.close_price,
            row.pnl,
            row.pnl_net,
            row.closing_reason.as_deref(),
        ) {
            (None, None, None, None, None) => None,
            (Some(close_time), Some(price), Some(pnl), Some(pnl_net), Some(reason)) => {
                Some(TradeClose {
                    close_time,
                    close_price: dec(price, "close_price")?,
                    pnl: dec(pnl, "pnl")?,
                    pnl_net: dec(pnl_net, "pnl_net")?,
                    reason: reason.parse::<ClosingReason>()?,
                })
            }
            _ => anyhow::bail!("Trade {} has partially set close fields", row.id),
        };

        Ok(Trade {
            id: row.id,
            ticket: u64::try_from(row.transaction_broker_id)
                .with_context(|| format!("Trade {} has a negative ticket", row.id))?,
            symbol: row.symbol,
            side: row.side.parse()?,
            entry_time: row.entry_time,
            entry_price: dec(row.entry_price, "entry_price")?,
            position_size: dec(row.position_size, "position_size")?,
            capital: dec(row.capital, "capital")?,
            leverage: dec(row.leverage, "leverage")?,
            order_volume: dec_opt(row.order_volume, "order_volume")?,
            commission: dec(row.commission, "commission")?,
            break_even_price: dec(row.break_even_price, "break_even_price")?,
            liquidation_price: dec(row.liquidation_price, "liquidation_price")?,
            close,
            strategy: row.strategy,
            broker: row.broker,
            market_type: row.market_type.parse()?,
            timeframe: row.timeframe.parse()?,
        })
    }
}

impl TryFrom<StopMutationRow> for StopMutation {
    type Error = anyhow::Error;

    fn try_from(row: StopMutationRow) -> Result<Self> {
        Ok(StopMutation {
            id: row.id,
            trade_id: row.trade_id,
            mutation_time: row.mutation_time,
            mutation_price: dec(row.mutation_price, "mutation_price")?,
            new_sl_price: dec(row.new_sl_price, "new_sl_price")?,
            new_tp_price: dec_opt(row.new_tp_price, "new_tp_price")?,
            pnl_at_new_sl: dec(row.pnl_at_new_sl, "pnl_at_new_sl")?,
            pnl_at_new_tp: dec_opt(row.pnl_at_new_tp, "pnl_at_new_tp")?,
        })
    }
}

const INSERT_MUTATION: &str = r#"
    INSERT INTO stop_mutations
        (trade_id, mutation_time, mutation_price, new_sl_price, new_tp_price, pnl_at_new_sl, pnl_at_new_tp)
    VALUES (?, ?, ?, ?, ?, ?, ?)
    RETURNING *
"#;

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database. A single connection keeps every query on the same store.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                transaction_broker_id INTEGER NOT NULL UNIQUE,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL CHECK (side IN ('BUY', 'SELL')),
                entry_time TEXT NOT NULL,
                entry_price REAL NOT NULL,
                position_size REAL NOT NULL,
                capital REAL NOT NULL,
                leverage REAL NOT NULL,
                order_volume REAL,
                commission REAL NOT NULL,
                break_even_price REAL NOT NULL,
                liquidation_price REAL NOT NULL,
                close_time TEXT,
                close_price REAL,
                pnl REAL,
                pnl_net REAL,
                closing_reason TEXT,
                strategy TEXT NOT NULL,
                broker TEXT NOT NULL,
                market_type TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stop_mutations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trade_id INTEGER NOT NULL REFERENCES trades(id),
                mutation_time TEXT NOT NULL,
                mutation_price REAL NOT NULL,
                new_sl_price REAL NOT NULL,
                new_tp_price REAL,
                pnl_at_new_sl REAL NOT NULL,
                pnl_at_new_tp REAL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_open ON trades(close_time)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_mutations_trade ON stop_mutations(trade_id, mutation_time, id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_trade(&self, ticket: u64) -> Result<Option<Trade>> {
        let row = sqlx::query_as::<_, TradeRow>(
            "SELECT * FROM trades WHERE transaction_broker_id = ?",
        )
        .bind(ticket_key(ticket)?)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch trade")?;

        row.map(Trade::try_from).transpose()
    }
}

#[async_trait]
impl TradeLedger for Database {
    async fn create_trade(
        &self,
        trade: NewTrade,
        initial_stop: NewStopMutation,
    ) -> Result<(Trade, StopMutation)> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, TradeRow>(
            r#"
            INSERT INTO trades (
                transaction_broker_id, symbol, side, entry_time, entry_price, position_size,
                capital, leverage, order_volume, commission, break_even_price, liquidation_price,
                strategy, broker, market_type, timeframe
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(ticket_key(trade.ticket)?)
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(trade.entry_time)
        .bind(real(trade.entry_price))
        .bind(real(trade.position_size))
        .bind(real(trade.capital))
        .bind(real(trade.leverage))
        .bind(trade.order_volume.map(real))
        .bind(real(trade.commission))
        .bind(real(trade.break_even_price))
        .bind(real(trade.liquidation_price))
        .bind(&trade.strategy)
        .bind(&trade.broker)
        .bind(trade.market_type.as_str())
        .bind(trade.timeframe.as_ledger_str())
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("Failed to insert trade for ticket {}", trade.ticket))?;

        let mutation_row = sqlx::query_as::<_, StopMutationRow>(INSERT_MUTATION)
            .bind(row.id)
            .bind(initial_stop.mutation_time)
            .bind(real(initial_stop.mutation_price))
            .bind(real(initial_stop.new_sl_price))
            .bind(initial_stop.new_tp_price.map(real))
            .bind(real(initial_stop.pnl_at_new_sl))
            .bind(initial_stop.pnl_at_new_tp.map(real))
            .fetch_one(&mut *tx)
            .await
            .context("Failed to insert initial stop mutation")?;

        tx.commit().await.context("Failed to commit new trade")?;

        Ok((Trade::try_from(row)?, StopMutation::try_from(mutation_row)?))
    }

    async fn append_mutation(
        &self,
        trade_id: i64,
        mutation: NewStopMutation,
    ) -> Result<StopMutation> {
        let row = sqlx::query_as::<_, StopMutationRow>(INSERT_MUTATION)
            .bind(trade_id)
            .bind(mutation.mutation_time)
            .bind(real(mutation.mutation_price))
            .bind(real(mutation.new_sl_price))
            .bind(mutation.new_tp_price.map(real))
            .bind(real(mutation.pnl_at_new_sl))
            .bind(mutation.pnl_at_new_tp.map(real))
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to append stop mutation for trade {}", trade_id))?;

        StopMutation::try_from(row)
    }

    async fn close_trade(&self, ticket: u64, close: TradeClose) -> Result<CloseOutcome> {
        let key = ticket_key(ticket)?;

        let updated = sqlx::query_as::<_, TradeRow>(
            r#"
            UPDATE trades SET
                close_time = ?,
                close_price = ?,
                pnl = ?,
                pnl_net = ?,
                closing_reason = ?
            WHERE transaction_broker_id = ? AND close_time IS NULL
            RETURNING *
            "#,
        )
        .bind(close.close_time)
        .bind(real(close.close_price))
        .bind(real(close.pnl))
        .bind(real(close.pnl_net))
        .bind(close.reason.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to close trade for ticket {}", ticket))?;

        if let Some(row) = updated {
            return Ok(CloseOutcome::Closed(Trade::try_from(row)?));
        }

        let exists: Option<i64> =
            sqlx::query_scalar("SELECT id FROM trades WHERE transaction_broker_id = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(match exists {
            Some(_) => CloseOutcome::AlreadyClosed,
            None => CloseOutcome::NotFound,
        })
    }

    async fn get_trade_with_mutations(&self, ticket: u64) -> Result<Option<TradeWithMutations>> {
        let Some(trade) = self.get_trade(ticket).await? else {
            return Ok(None);
        };

        let mutations = sqlx::query_as::<_, StopMutationRow>(
            "SELECT * FROM stop_mutations WHERE trade_id = ? ORDER BY mutation_time ASC, id ASC",
        )
        .bind(trade.id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch stop mutations")?
        .into_iter()
        .map(StopMutation::try_from)
        .collect::<Result<Vec<_>>>()?;

        Ok(Some(TradeWithMutations { trade, mutations }))
    }

    async fn list_trades(&self, open_only: bool) -> Result<Vec<Trade>> {
        let sql = if open_only {
            "SELECT * FROM trades WHERE close_time IS NULL ORDER BY entry_time ASC, id ASC"
        } else {
            "SELECT * FROM trades ORDER BY entry_time ASC, id ASC"
        };

        sqlx::query_as::<_, TradeRow>(sql)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch trades")?
            .into_iter()
            .map(Trade::try_from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::new_trade;
    use crate::models::TradeSide;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn stop(at: DateTime<Utc>, sl: Decimal) -> NewStopMutation {
        NewStopMutation {
            mutation_time: at,
            mutation_price: dec!(1.1),
            new_sl_price: sl,
            new_tp_price: None,
            pnl_at_new_sl: dec!(-50),
            pnl_at_new_tp: None,
        }
    }

    fn close_at(at: DateTime<Utc>) -> TradeClose {
        TradeClose {
            close_time: at,
            close_price: dec!(1.095),
            pnl: dec!(-52.5),
            pnl_net: dec!(-57.5),
            reason: ClosingReason::StopLoss,
        }
    }

    #[tokio::test]
    async fn test_create_and_fetch() {
        let db = Database::in_memory().await.unwrap();

        let (trade, first) = db
            .create_trade(new_trade(101, TradeSide::Buy, dec!(1.1)), stop(t0(), dec!(1.0975)))
            .await
            .unwrap();

        assert!(trade.is_open());
        assert_eq!(trade.ticket, 101);
        assert_eq!(trade.entry_price, dec!(1.1));
        assert_eq!(first.trade_id, trade.id);

        let loaded = db.get_trade_with_mutations(101).await.unwrap().unwrap();
        assert_eq!(loaded.trade.id, trade.id);
        assert_eq!(loaded.mutations.len(), 1);
        assert_eq!(loaded.last_stop(), Some(dec!(1.0975)));

        assert!(db.get_trade_with_mutations(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_ticket_leaves_no_orphan_mutation() {
        let db = Database::in_memory().await.unwrap();
        db.create_trade(new_trade(101, TradeSide::Buy, dec!(1.1)), stop(t0(), dec!(1.09)))
            .await
            .unwrap();

        let dup = db
            .create_trade(new_trade(101, TradeSide::Sell, dec!(1.2)), stop(t0(), dec!(1.21)))
            .await;
        assert!(dup.is_err());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stop_mutations")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        db.create_trade(new_trade(101, TradeSide::Buy, dec!(1.1)), stop(t0(), dec!(1.09)))
            .await
            .unwrap();

        let later = t0() + Duration::hours(2);
        match db.close_trade(101, close_at(later)).await.unwrap() {
            CloseOutcome::Closed(trade) => {
                let close = trade.close.unwrap();
                assert_eq!(close.close_time, later);
                assert_eq!(close.reason, ClosingReason::StopLoss);
                assert_eq!(close.pnl_net, dec!(-57.5));
            }
            other => panic!("expected Closed, got {:?}", other),
        }

        // A second close with different figures must not overwrite the first
        let mut again = close_at(later + Duration::hours(1));
        again.reason = ClosingReason::Manual;
        assert!(matches!(
            db.close_trade(101, again).await.unwrap(),
            CloseOutcome::AlreadyClosed
        ));

        let stored = db.get_trade_with_mutations(101).await.unwrap().unwrap().trade;
        assert_eq!(stored.close.unwrap().reason, ClosingReason::StopLoss);

        assert!(matches!(
            db.close_trade(404, close_at(later)).await.unwrap(),
            CloseOutcome::NotFound
        ));
    }

    #[tokio::test]
    async fn test_mutations_ordered_by_time_then_id() {
        let db = Database::in_memory().await.unwrap();
        let (trade, _) = db
            .create_trade(new_trade(101, TradeSide::Buy, dec!(1.1)), stop(t0(), dec!(1.09)))
            .await
            .unwrap();

        let later = t0() + Duration::minutes(30);
        db.append_mutation(trade.id, stop(later, dec!(1.102))).await.unwrap();
        db.append_mutation(trade.id, stop(t0() + Duration::minutes(10), dec!(1.101)))
            .await
            .unwrap();
        db.append_mutation(trade.id, stop(later, dec!(1.103))).await.unwrap();

        let stops: Vec<Decimal> = db
            .get_trade_with_mutations(101)
            .await
            .unwrap()
            .unwrap()
            .mutations
            .iter()
            .map(|m| m.new_sl_price)
            .collect();

        assert_eq!(stops, vec![dec!(1.09), dec!(1.101), dec!(1.102), dec!(1.103)]);
    }

    #[tokio::test]
    async fn test_list_open_only() {
        let db = Database::in_memory().await.unwrap();
        for ticket in [1, 2, 3] {
            db.create_trade(new_trade(ticket, TradeSide::Buy, dec!(1.1)), stop(t0(), dec!(1.09)))
                .await
                .unwrap();
        }
        db.close_trade(2, close_at(t0() + Duration::hours(1))).await.unwrap();

        let open: Vec<u64> = db.list_trades(true).await.unwrap().iter().map(|t| t.ticket).collect();
        assert_eq!(open, vec![1, 3]);
        assert_eq!(db.list_trades(false).await.unwrap().len(), 3);
    }
}
