//! Trade and inventory records.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

use tradevault_core::error::{StorageError, StorageResult};

use crate::executor::QueryExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeType {
    Buy,
    Sell,
    Transfer,
}

impl TradeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeType::Buy => "buy",
            TradeType::Sell => "sell",
            TradeType::Transfer => "transfer",
        }
    }
}

impl fmt::Display for TradeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Ok(TradeType::Buy),
            "sell" => Ok(TradeType::Sell),
            "transfer" => Ok(TradeType::Transfer),
            other => Err(StorageError::InvalidInput(format!(
                "unknown trade type '{other}'"
            ))),
        }
    }
}

/// A trade observed by a collaborator, not yet stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTrade {
    pub trader: String,
    pub item: String,
    pub previous_quantity: i64,
    pub current_quantity: i64,
    pub price: f64,
    pub trade_type: TradeType,
}

impl NewTrade {
    fn validate(&self) -> StorageResult<()> {
        if self.trader.trim().is_empty() {
            return Err(StorageError::InvalidInput("trader must not be empty".into()));
        }
        if self.item.trim().is_empty() {
            return Err(StorageError::InvalidInput("item must not be empty".into()));
        }
        if self.previous_quantity < 0 || self.current_quantity < 0 {
            return Err(StorageError::InvalidInput(
                "quantities must not be negative".into(),
            ));
        }
        if !self.price.is_finite() || self.price < 0.0 {
            return Err(StorageError::InvalidInput(format!(
                "invalid price {}",
                self.price
            )));
        }
        Ok(())
    }
}

/// A stored trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub trader: String,
    pub item: String,
    pub previous_quantity: i64,
    pub current_quantity: i64,
    pub quantity_delta: i64,
    pub price: f64,
    pub trade_type: TradeType,
    pub created_at: DateTime<Utc>,
}

pub struct TradeLedger {
    executor: Arc<QueryExecutor>,
}

impl TradeLedger {
    pub fn new(executor: Arc<QueryExecutor>) -> Self {
        Self { executor }
    }

    /// Store a trade and move the item's inventory to `current_quantity`,
    /// atomically. Returns the new trade id.
    pub fn record_trade(&self, trade: &NewTrade) -> StorageResult<i64> {
        trade.validate()?;
        let now = crate::sql::timestamp(Utc::now());
        let delta = trade.current_quantity - trade.previous_quantity;

        let id = self.executor.transaction("record_trade", |tx| {
            tx.execute(
                "INSERT INTO inventory (item_name, quantity, last_price, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(item_name) DO UPDATE SET
                     quantity = excluded.quantity,
                     last_price = excluded.last_price,
                     updated_at = excluded.updated_at",
                params![trade.item, trade.current_quantity, trade.price, now],
            )?;
            tx.execute(
                "INSERT INTO trades (trader, item_name, previous_quantity, current_quantity,
                                     quantity_delta, price, trade_type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    trade.trader,
                    trade.item,
                    trade.previous_quantity,
                    trade.current_quantity,
                    delta,
                    trade.price,
                    trade.trade_type.as_str(),
                    now
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })?;

        tracing::debug!(
            trade_id = id,
            trader = %trade.trader,
            item = %trade.item,
            delta,
            trade_type = %trade.trade_type,
            "Trade recorded"
        );
        Ok(id)
    }

    /// Most recent trades, newest first.
    pub fn recent_trades(&self, limit: usize) -> StorageResult<Vec<Trade>> {
        let rows = self.executor.read("recent_trades", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, trader, item_name, previous_quantity, current_quantity,
                        quantity_delta, price, trade_type, created_at
                 FROM trades ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    Ok((
                        Trade {
                            id: row.get(0)?,
                            trader: row.get(1)?,
                            item: row.get(2)?,
                            previous_quantity: row.get(3)?,
                            current_quantity: row.get(4)?,
                            quantity_delta: row.get(5)?,
                            price: row.get(6)?,
                            trade_type: TradeType::Buy,
                            created_at: DateTime::default(),
                        },
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(mut trade, trade_type, created_at)| -> StorageResult<Trade> {
                trade.trade_type = trade_type.parse()?;
                trade.created_at = DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|e| StorageError::database("decode trade", e))?
                    .with_timezone(&Utc);
                Ok(trade)
            })
            .collect()
    }

    /// Current quantity of `item`, `None` if it was never traded.
    pub fn inventory_quantity(&self, item: &str) -> StorageResult<Option<i64>> {
        self.executor.read("inventory_quantity", |conn| {
            conn.query_row(
                "SELECT quantity FROM inventory WHERE item_name = ?1",
                params![item],
                |row| row.get(0),
            )
            .optional()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::metrics::MetricsRecorder;
    use crate::migration::MigrationEngine;
    use crate::pool::ConnectionPool;
    use tempfile::{TempDir, tempdir};
    use tradevault_core::config::{BreakerConfig, PoolConfig, QueryConfig};

    fn ledger() -> (TempDir, TradeLedger) {
        let dir = tempdir().unwrap();
        let pool = Arc::new(ConnectionPool::open(dir.path().join("trades.db"), PoolConfig::default()).unwrap());
        MigrationEngine::new().migrate(&pool.acquire().unwrap()).unwrap();
        let config = QueryConfig::default();
        let executor = QueryExecutor::new(
            pool,
            Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            Arc::new(MetricsRecorder::new(&config)),
            &config,
        );
        (dir, TradeLedger::new(Arc::new(executor)))
    }

    fn trade(item: &str, prev: i64, cur: i64) -> NewTrade {
        NewTrade {
            trader: "Aria".into(),
            item: item.into(),
            previous_quantity: prev,
            current_quantity: cur,
            price: 12.5,
            trade_type: TradeType::Buy,
        }
    }

    #[test]
    fn test_record_trade_updates_inventory() {
        let (_dir, ledger) = ledger();
        let first = ledger.record_trade(&trade("iron ore", 0, 10)).unwrap();
        let second = ledger.record_trade(&trade("iron ore", 10, 4)).unwrap();
        assert!(second > first);

        assert_eq!(ledger.inventory_quantity("iron ore").unwrap(), Some(4));
        assert_eq!(ledger.inventory_quantity("gold").unwrap(), None);

        let recent = ledger.recent_trades(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, second);
        assert_eq!(recent[0].quantity_delta, -6);
        assert_eq!(recent[0].trade_type, TradeType::Buy);
    }

    #[test]
    fn test_invalid_trades_rejected() {
        let (_dir, ledger) = ledger();
        let mut bad = trade("", 0, 1);
        assert!(matches!(ledger.record_trade(&bad), Err(StorageError::InvalidInput(_))));

        bad = trade("ore", -1, 1);
        assert!(matches!(ledger.record_trade(&bad), Err(StorageError::InvalidInput(_))));

        bad = trade("ore", 0, 1);
        bad.price = f64::NAN;
        assert!(matches!(ledger.record_trade(&bad), Err(StorageError::InvalidInput(_))));

        assert!(ledger.recent_trades(5).unwrap().is_empty());
    }

    #[test]
    fn test_trade_type_parsing() {
        assert_eq!("SELL".parse::<TradeType>().unwrap(), TradeType::Sell);
        assert_eq!(TradeType::Transfer.to_string(), "transfer");
        assert!("gift".parse::<TradeType>().is_err());
    }
}
