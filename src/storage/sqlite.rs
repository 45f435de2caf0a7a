//! SQLite-backed persistence via sqlx.
//!
//! Timestamps are stored as Unix milliseconds. Enumerations are stored as
//! their lowercase string form. The schema is created on connect.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use super::Persistence;
use crate::types::{
    ArbError, HoldingPosition, Item, ItemId, Opportunity, PositionStatus, PurchasePlan, Snapshot,
    VerificationResult,
};

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const OPPORTUNITY_COLUMNS: &str = "item_id, name, current_buy_price, current_sell_price, \
     avg_buy_price_7d, avg_sell_price_7d, profit_rate, estimated_profit, trend, risk, \
     buy_order_count, sell_order_count, days_of_data, pop_rank, score, recommended_buy_price, \
     recommended_quantity, analysed_at";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS items (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS snapshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        item_id INTEGER NOT NULL,
        buy_price REAL,
        sell_price REAL,
        buy_count INTEGER,
        sell_count INTEGER,
        pop_rank INTEGER,
        taken_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_snapshots_item_time ON snapshots (item_id, taken_at)",
    "CREATE TABLE IF NOT EXISTS opportunities (
        item_id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        current_buy_price REAL NOT NULL,
        current_sell_price REAL NOT NULL,
        avg_buy_price_7d REAL NOT NULL,
        avg_sell_price_7d REAL NOT NULL,
        profit_rate REAL NOT NULL,
        estimated_profit REAL NOT NULL,
        trend TEXT NOT NULL,
        risk TEXT NOT NULL,
        buy_order_count INTEGER NOT NULL,
        sell_order_count INTEGER NOT NULL,
        days_of_data INTEGER NOT NULL,
        pop_rank INTEGER,
        score REAL NOT NULL,
        recommended_buy_price REAL NOT NULL,
        recommended_quantity INTEGER NOT NULL,
        analysed_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS opportunity_history (
        history_id INTEGER PRIMARY KEY AUTOINCREMENT,
        item_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        current_buy_price REAL NOT NULL,
        current_sell_price REAL NOT NULL,
        avg_buy_price_7d REAL NOT NULL,
        avg_sell_price_7d REAL NOT NULL,
        profit_rate REAL NOT NULL,
        estimated_profit REAL NOT NULL,
        trend TEXT NOT NULL,
        risk TEXT NOT NULL,
        buy_order_count INTEGER NOT NULL,
        sell_order_count INTEGER NOT NULL,
        days_of_data INTEGER NOT NULL,
        pop_rank INTEGER,
        score REAL NOT NULL,
        recommended_buy_price REAL NOT NULL,
        recommended_quantity INTEGER NOT NULL,
        analysed_at INTEGER NOT NULL,
        archived_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS purchase_plans (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ordering TEXT NOT NULL,
        budget REAL NOT NULL,
        total_cost REAL NOT NULL,
        total_profit REAL NOT NULL,
        total_units INTEGER NOT NULL,
        profit_rate REAL NOT NULL,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS purchase_plan_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        plan_id INTEGER NOT NULL,
        item_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        quantity INTEGER NOT NULL,
        unit_price REAL NOT NULL,
        subtotal REAL NOT NULL,
        expected_profit REAL NOT NULL,
        still_valid INTEGER,
        verified_buy REAL,
        verified_sell REAL,
        note TEXT,
        order_id TEXT
    )",
    "CREATE TABLE IF NOT EXISTS holding_positions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        item_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        buy_price REAL NOT NULL,
        buy_quantity INTEGER NOT NULL,
        sold_quantity INTEGER NOT NULL,
        buy_time INTEGER NOT NULL,
        current_price REAL NOT NULL,
        target_profit_rate REAL NOT NULL,
        max_loss_rate REAL NOT NULL,
        status TEXT NOT NULL,
        realized_profit REAL NOT NULL,
        risk TEXT NOT NULL,
        last_sold_price REAL,
        last_sold_at INTEGER,
        updated_at INTEGER NOT NULL
    )",
];

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to `database_url` (e.g. `sqlite://arbiter.db`), creating it if needed.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database url: {database_url}"))?
            .create_if_missing(true);
        Self::connect_with(options).await
    }

    /// Open (or create) a database file at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect_with(options).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| ArbError::Storage(format!("failed to open SQLite database: {e}")))?;
        let store = Self { pool };
        store.migrate().await?;
        info!("SQLite store ready");
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| ArbError::Storage(format!("failed to apply schema: {e}")))?;
        }
        Ok(())
    }

    pub async fn upsert_item(&self, item: &Item) -> Result<()> {
        sqlx::query(
            "INSERT INTO items (id, name) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        )
        .bind(item.id)
        .bind(&item.name)
        .execute(&self.pool)
        .await
        .context("Failed to upsert item")?;
        Ok(())
    }

    pub async fn insert_snapshot(&self, snap: &Snapshot) -> Result<()> {
        sqlx::query(
            "INSERT INTO snapshots (item_id, buy_price, sell_price, buy_count, sell_count, pop_rank, taken_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(snap.item_id)
        .bind(snap.buy_price)
        .bind(snap.sell_price)
        .bind(snap.buy_count.map(i64::from))
        .bind(snap.sell_count.map(i64::from))
        .bind(snap.rank.map(i64::from))
        .bind(snap.taken_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert snapshot")?;
        Ok(())
    }

    /// Live opportunity set, best score first.
    pub async fn load_opportunities(&self) -> Result<Vec<Opportunity>> {
        let sql = format!("SELECT {OPPORTUNITY_COLUMNS} FROM opportunities ORDER BY score DESC");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("Failed to load opportunities")?;
        rows.iter().map(opportunity_from_row).collect()
    }

    pub async fn archived_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM opportunity_history")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| ArbError::Storage(format!("invalid timestamp: {ms}")).into())
}

fn to_u32(v: i64) -> u32 {
    u32::try_from(v.max(0)).unwrap_or(u32::MAX)
}

fn snapshot_from_row(row: &SqliteRow) -> Result<Snapshot> {
    Ok(Snapshot {
        item_id: row.try_get("item_id")?,
        buy_price: row.try_get("buy_price")?,
        sell_price: row.try_get("sell_price")?,
        buy_count: row.try_get::<Option<i64>, _>("buy_count")?.map(to_u32),
        sell_count: row.try_get::<Option<i64>, _>("sell_count")?.map(to_u32),
        rank: row.try_get::<Option<i64>, _>("pop_rank")?.map(to_u32),
        taken_at: from_millis(row.try_get("taken_at")?)?,
    })
}

fn opportunity_from_row(row: &SqliteRow) -> Result<Opportunity> {
    Ok(Opportunity {
        id: row.try_get("item_id")?,
        name: row.try_get("name")?,
        current_buy_price: row.try_get("current_buy_price")?,
        current_sell_price: row.try_get("current_sell_price")?,
        avg_buy_price_7d: row.try_get("avg_buy_price_7d")?,
        avg_sell_price_7d: row.try_get("avg_sell_price_7d")?,
        profit_rate: row.try_get("profit_rate")?,
        estimated_profit: row.try_get("estimated_profit")?,
        trend: row.try_get::<String, _>("trend")?.parse()?,
        risk: row.try_get::<String, _>("risk")?.parse()?,
        buy_order_count: to_u32(row.try_get("buy_order_count")?),
        sell_order_count: to_u32(row.try_get("sell_order_count")?),
        days_of_data: to_u32(row.try_get("days_of_data")?),
        rank: row.try_get::<Option<i64>, _>("pop_rank")?.map(to_u32),
        score: row.try_get("score")?,
        recommended_buy_price: row.try_get("recommended_buy_price")?,
        recommended_quantity: to_u32(row.try_get("recommended_quantity")?),
        analysed_at: from_millis(row.try_get("analysed_at")?)?,
    })
}

fn position_from_row(row: &SqliteRow) -> Result<HoldingPosition> {
    let last_sold_at = row
        .try_get::<Option<i64>, _>("last_sold_at")?
        .map(from_millis)
        .transpose()?;
    Ok(HoldingPosition {
        id: row.try_get("id")?,
        item_id: row.try_get("item_id")?,
        name: row.try_get("name")?,
        buy_price: row.try_get("buy_price")?,
        buy_quantity: to_u32(row.try_get("buy_quantity")?),
        sold_quantity: to_u32(row.try_get("sold_quantity")?),
        buy_time: from_millis(row.try_get("buy_time")?)?,
        current_price: row.try_get("current_price")?,
        target_profit_rate: row.try_get("target_profit_rate")?,
        max_loss_rate: row.try_get("max_loss_rate")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        realized_profit: row.try_get("realized_profit")?,
        risk: row.try_get::<String, _>("risk")?.parse()?,
        last_sold_price: row.try_get("last_sold_price")?,
        last_sold_at,
    })
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[async_trait]
impl Persistence for SqliteStore {
    async fn load_catalog(&self) -> Result<Vec<Item>> {
        let rows = sqlx::query("SELECT id, name FROM items ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to load catalog")?;
        rows.iter()
            .map(|r| -> Result<Item> { Ok(Item::new(r.try_get("id")?, r.try_get::<String, _>("name")?)) })
            .collect()
    }

    async fn load_snapshots(&self, item_id: ItemId, since: DateTime<Utc>) -> Result<Vec<Snapshot>> {
        let rows = sqlx::query(
            "SELECT item_id, buy_price, sell_price, buy_count, sell_count, pop_rank, taken_at
             FROM snapshots WHERE item_id = ? AND taken_at >= ? ORDER BY taken_at DESC",
        )
        .bind(item_id)
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to load snapshots for item {item_id}"))?;
        rows.iter().map(snapshot_from_row).collect()
    }

    async fn save_opportunities(&self, set: &[Opportunity]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        // The archive must land before the live table is cleared; both
        // happen in one transaction so a failed archive rolls back cleanly.
        let archive_sql = format!(
            "INSERT INTO opportunity_history ({OPPORTUNITY_COLUMNS}, archived_at)
             SELECT {OPPORTUNITY_COLUMNS}, ? FROM opportunities"
        );
        let archived = sqlx::query(&archive_sql)
            .bind(Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await
            .context("Failed to archive opportunities")?
            .rows_affected();

        sqlx::query("DELETE FROM opportunities")
            .execute(&mut *tx)
            .await
            .context("Failed to clear opportunities")?;

        let insert_sql = format!(
            "INSERT INTO opportunities ({OPPORTUNITY_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        for o in set {
            sqlx::query(&insert_sql)
                .bind(o.id)
                .bind(&o.name)
                .bind(o.current_buy_price)
                .bind(o.current_sell_price)
                .bind(o.avg_buy_price_7d)
                .bind(o.avg_sell_price_7d)
                .bind(o.profit_rate)
                .bind(o.estimated_profit)
                .bind(o.trend.as_str())
                .bind(o.risk.as_str())
                .bind(i64::from(o.buy_order_count))
                .bind(i64::from(o.sell_order_count))
                .bind(i64::from(o.days_of_data))
                .bind(o.rank.map(i64::from))
                .bind(o.score)
                .bind(o.recommended_buy_price)
                .bind(i64::from(o.recommended_quantity))
                .bind(o.analysed_at.timestamp_millis())
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to insert opportunity {}", o.id))?;
        }

        tx.commit().await.context("Failed to commit opportunities")?;
        debug!(archived, inserted = set.len(), "Opportunities replaced");
        Ok(())
    }

    async fn save_plan(&self, plan: &PurchasePlan, verification: &[VerificationResult]) -> Result<i64> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let plan_id = sqlx::query(
            "INSERT INTO purchase_plans (ordering, budget, total_cost, total_profit, total_units, profit_rate, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)",
        )
        .bind(plan.ordering.label())
        .bind(plan.budget)
        .bind(plan.total_cost)
        .bind(plan.total_profit)
        .bind(i64::from(plan.total_units))
        .bind(plan.profit_rate)
        .bind(plan.created_at.timestamp_millis())
        .execute(&mut *tx)
        .await
        .context("Failed to insert plan")?
        .last_insert_rowid();

        for item in &plan.items {
            let outcome = verification.iter().find(|v| v.id == item.id);
            let note = outcome.and_then(|v| v.reason.clone().or_else(|| v.order_note.clone()));
            sqlx::query(
                "INSERT INTO purchase_plan_items (plan_id, item_id, name, quantity, unit_price, subtotal,
                 expected_profit, still_valid, verified_buy, verified_sell, note, order_id)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(plan_id)
            .bind(item.id)
            .bind(&item.name)
            .bind(i64::from(item.quantity))
            .bind(item.unit_price)
            .bind(item.subtotal)
            .bind(item.expected_profit)
            .bind(outcome.map(|v| v.still_valid))
            .bind(outcome.map(|v| v.verified_buy))
            .bind(outcome.map(|v| v.verified_sell))
            .bind(note)
            .bind(outcome.and_then(|v| v.order.as_ref().map(|o| o.order_id.clone())))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to insert plan item {}", item.id))?;
        }

        tx.commit().await.context("Failed to commit plan")?;
        Ok(plan_id)
    }

    async fn load_positions(&self, statuses: &[PositionStatus]) -> Result<Vec<HoldingPosition>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT * FROM holding_positions WHERE status IN ({placeholders}) ORDER BY id"
        );
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("Failed to load positions")?;
        rows.iter().map(position_from_row).collect()
    }

    async fn save_position(&self, p: &HoldingPosition) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        if p.id == 0 {
            let id = sqlx::query(
                "INSERT INTO holding_positions (item_id, name, buy_price, buy_quantity, sold_quantity, buy_time,
                 current_price, target_profit_rate, max_loss_rate, status, realized_profit, risk,
                 last_sold_price, last_sold_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(p.item_id)
            .bind(&p.name)
            .bind(p.buy_price)
            .bind(i64::from(p.buy_quantity))
            .bind(i64::from(p.sold_quantity))
            .bind(p.buy_time.timestamp_millis())
            .bind(p.current_price)
            .bind(p.target_profit_rate)
            .bind(p.max_loss_rate)
            .bind(p.status.as_str())
            .bind(p.realized_profit)
            .bind(p.risk.as_str())
            .bind(p.last_sold_price)
            .bind(p.last_sold_at.map(|t| t.timestamp_millis()))
            .bind(now)
            .execute(&self.pool)
            .await
            .context("Failed to insert position")?
            .last_insert_rowid();
            return Ok(id);
        }

        sqlx::query(
            "UPDATE holding_positions SET sold_quantity = ?, current_price = ?, status = ?,
             realized_profit = ?, last_sold_price = ?, last_sold_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(i64::from(p.sold_quantity))
        .bind(p.current_price)
        .bind(p.status.as_str())
        .bind(p.realized_profit)
        .bind(p.last_sold_price)
        .bind(p.last_sold_at.map(|t| t.timestamp_millis()))
        .bind(now)
        .bind(p.id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to update position {}", p.id))?;
        Ok(p.id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
