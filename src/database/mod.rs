use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;

use crate::types::{Fill, OrderRecord, OrderStatus, OrderTag, OrderType, Side};

/// SQLite persistence for signals, orders, fills and equity snapshots. The
/// schema is created on startup; `alert_id` is unique so a re-submitted
/// signal resolves to its prior row.
pub struct Database {
    pool: SqlitePool,
}

/// A persisted signal row; the stored risk outcome is what a duplicate
/// submission gets back.
#[derive(Debug, Clone)]
pub struct SignalRow {
    pub id: i64,
    pub alert_id: String,
    pub source: String,
    pub asset: String,
    pub side: String,
    pub entry_price: Option<f64>,
    pub stop_loss: f64,
    pub take_profits_json: String,
    pub risk_check_passed: bool,
    pub risk_check_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct EquitySnapshot {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub open_positions: i64,
}

impl Database {
    pub async fn new(db_path: &str) -> Result<Self> {
        info!("initializing SQLite database at {}", db_path);
        let options = SqliteConnectOptions::from_str(db_path)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.create_schema().await?;
        Ok(db)
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                alert_id TEXT NOT NULL UNIQUE,
                source TEXT NOT NULL,
                asset TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price REAL,
                stop_loss REAL NOT NULL,
                take_profits_json TEXT NOT NULL,
                risk_check_passed INTEGER NOT NULL,
                risk_check_reason TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                signal_id TEXT,
                venue_order_id INTEGER,
                coin TEXT NOT NULL,
                side TEXT NOT NULL,
                size REAL NOT NULL,
                price REAL,
                order_type TEXT NOT NULL,
                tag TEXT NOT NULL,
                status TEXT NOT NULL,
                mode TEXT NOT NULL,
                created_at TEXT NOT NULL,
                filled_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fills (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT NOT NULL,
                price REAL NOT NULL,
                size REAL NOT NULL,
                fee REAL NOT NULL,
                timestamp TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS equity_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                equity REAL NOT NULL,
                unrealized_pnl REAL NOT NULL,
                realized_pnl REAL NOT NULL,
                open_positions INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_signals_created ON signals(created_at)",
            "CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status)",
            "CREATE INDEX IF NOT EXISTS idx_orders_coin ON orders(coin)",
            "CREATE INDEX IF NOT EXISTS idx_fills_order ON fills(order_id)",
            "CREATE INDEX IF NOT EXISTS idx_equity_ts ON equity_snapshots(timestamp)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Inserts a signal with its risk outcome. Fails on a duplicate
    /// `alert_id`; check with [`find_signal`] first.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_signal(
        &self,
        alert_id: &str,
        source: &str,
        asset: &str,
        side: &str,
        entry_price: Option<f64>,
        stop_loss: f64,
        take_profits_json: &str,
        risk_check_passed: bool,
        risk_check_reason: Option<&str>,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO signals
                (alert_id, source, asset, side, entry_price, stop_loss,
                 take_profits_json, risk_check_passed, risk_check_reason, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(alert_id)
        .bind(source)
        .bind(asset)
        .bind(side)
        .bind(entry_price)
        .bind(stop_loss)
        .bind(take_profits_json)
        .bind(risk_check_passed)
        .bind(risk_check_reason)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn find_signal(&self, alert_id: &str) -> Result<Option<SignalRow>> {
        let row = sqlx::query("SELECT * FROM signals WHERE alert_id = ?")
            .bind(alert_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::signal_from_row).transpose()
    }

    pub async fn recent_signals(&self, limit: i64) -> Result<Vec<SignalRow>> {
        let rows = sqlx::query("SELECT * FROM signals ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::signal_from_row).collect()
    }

    /// Count of accepted signals since a UTC timestamp; seeds the live
    /// trades-today counter after a restart.
    pub async fn count_accepted_signals_since(&self, since: DateTime<Utc>) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM signals WHERE risk_check_passed = 1 AND created_at >= ?",
        )
        .bind(since.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n"))
    }

    fn signal_from_row(row: sqlx::sqlite::SqliteRow) -> Result<SignalRow> {
        Ok(SignalRow {
            id: row.get("id"),
            alert_id: row.get("alert_id"),
            source: row.get("source"),
            asset: row.get("asset"),
            side: row.get("side"),
            entry_price: row.get("entry_price"),
            stop_loss: row.get("stop_loss"),
            take_profits_json: row.get("take_profits_json"),
            risk_check_passed: row.get("risk_check_passed"),
            risk_check_reason: row.get("risk_check_reason"),
            created_at: parse_ts(row.get("created_at"))?,
        })
    }

    pub async fn insert_order(&self, order: &OrderRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders
                (id, signal_id, venue_order_id, coin, side, size, price,
                 order_type, tag, status, mode, created_at, filled_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&order.id)
        .bind(&order.signal_id)
        .bind(order.venue_order_id.map(|v| v as i64))
        .bind(&order.coin)
        .bind(order.side.as_str())
        .bind(order.size)
        .bind(order.order_type.price())
        .bind(order.order_type.as_str())
        .bind(order.tag.to_label())
        .bind(order.status.as_str())
        .bind(&order.mode)
        .bind(order.created_at.to_rfc3339())
        .bind(order.filled_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        filled_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query("UPDATE orders SET status = ?, filled_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(filled_at.map(|t| t.to_rfc3339()))
            .bind(order_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn pending_orders(&self) -> Result<Vec<OrderRecord>> {
        let rows = sqlx::query("SELECT * FROM orders WHERE status = 'pending'")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::order_from_row).collect()
    }

    pub async fn find_order_by_venue_id(&self, venue_order_id: u64) -> Result<Option<OrderRecord>> {
        let row = sqlx::query("SELECT * FROM orders WHERE venue_order_id = ?")
            .bind(venue_order_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::order_from_row).transpose()
    }

    pub async fn recent_orders(&self, limit: i64) -> Result<Vec<OrderRecord>> {
        let rows = sqlx::query("SELECT * FROM orders ORDER BY created_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::order_from_row).collect()
    }

    fn order_from_row(row: sqlx::sqlite::SqliteRow) -> Result<OrderRecord> {
        let side = match row.get::<String, _>("side").as_str() {
            "buy" => Side::Buy,
            _ => Side::Sell,
        };
        let price: Option<f64> = row.get("price");
        let order_type = match row.get::<String, _>("order_type").as_str() {
            "stop" => OrderType::Stop {
                trigger: price.unwrap_or(0.0),
            },
            "limit" => OrderType::Limit {
                price: price.unwrap_or(0.0),
            },
            _ => OrderType::Market,
        };
        let tag = OrderTag::from_label(&row.get::<String, _>("tag")).unwrap_or(OrderTag::Entry);
        let status = match row.get::<String, _>("status").as_str() {
            "filled" => OrderStatus::Filled,
            "cancelled" => OrderStatus::Cancelled,
            "rejected" => OrderStatus::Rejected,
            _ => OrderStatus::Pending,
        };
        let filled_at: Option<String> = row.get("filled_at");

        Ok(OrderRecord {
            id: row.get("id"),
            signal_id: row.get("signal_id"),
            venue_order_id: row.get::<Option<i64>, _>("venue_order_id").map(|v| v as u64),
            coin: row.get("coin"),
            side,
            size: row.get("size"),
            order_type,
            tag,
            status,
            reduce_only: !matches!(tag, OrderTag::Entry),
            mode: row.get("mode"),
            created_at: parse_ts(row.get("created_at"))?,
            filled_at: filled_at.map(|t| parse_ts(t)).transpose()?,
        })
    }

    pub async fn insert_fill(&self, fill: &Fill) -> Result<()> {
        sqlx::query(
            "INSERT INTO fills (order_id, price, size, fee, timestamp) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&fill.order_id)
        .bind(fill.price)
        .bind(fill.size)
        .bind(fill.fee)
        .bind(fill.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fills_for_order(&self, order_id: &str) -> Result<Vec<Fill>> {
        let rows = sqlx::query("SELECT * FROM fills WHERE order_id = ? ORDER BY id")
            .bind(order_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(Fill {
                    order_id: row.get("order_id"),
                    price: row.get("price"),
                    size: row.get("size"),
                    fee: row.get("fee"),
                    timestamp: parse_ts(row.get("timestamp"))?,
                })
            })
            .collect()
    }

    pub async fn insert_equity_snapshot(&self, snapshot: &EquitySnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO equity_snapshots
                (timestamp, equity, unrealized_pnl, realized_pnl, open_positions)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(snapshot.timestamp.to_rfc3339())
        .bind(snapshot.equity)
        .bind(snapshot.unrealized_pnl)
        .bind(snapshot.realized_pnl)
        .bind(snapshot.open_positions)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_equity(&self, limit: i64) -> Result<Vec<EquitySnapshot>> {
        let rows = sqlx::query("SELECT * FROM equity_snapshots ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(EquitySnapshot {
                    timestamp: parse_ts(row.get("timestamp"))?,
                    equity: row.get("equity"),
                    unrealized_pnl: row.get("unrealized_pnl"),
                    realized_pnl: row.get("realized_pnl"),
                    open_positions: row.get("open_positions"),
                })
            })
            .collect()
    }
}

fn parse_ts(raw: String) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(&raw)?.with_timezone(&Utc))
}
