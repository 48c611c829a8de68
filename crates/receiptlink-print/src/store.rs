// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Order store backed by SQLite.
//
// Only what delivery confirmation and the `watch` command need: orders, their
// shop-facing number and the printed flag.  The flag is flipped with a
// conditional UPDATE so two processes marking the same order cannot both
// report success.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, instrument};

use receiptlink_bridge::OrderStore;
use receiptlink_core::error::{ReceiptError, Result};
use receiptlink_core::{Order, OrderId};

const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS orders (
        id INTEGER PRIMARY KEY,
        number TEXT NOT NULL,
        printed INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        printed_at TEXT
    )
"#;

fn db_err(context: &str) -> impl FnOnce(rusqlite::Error) -> ReceiptError + '_ {
    move |e| ReceiptError::Database(format!("{context}: {e}"))
}

/// SQLite-backed [`OrderStore`].
///
/// `rusqlite` is synchronous; every query here is a single-row lookup or
/// update, so calls run inline under the connection mutex.
pub struct SqliteOrderStore {
    conn: Mutex<Connection>,
}

impl SqliteOrderStore {
    /// Open (or create) the order database at `path` in WAL mode.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(db_err("open"))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(db_err("WAL pragma"))?;
        conn.execute_batch(CREATE_TABLE_SQL)
            .map_err(db_err("create table"))?;
        info!("order database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("open in-memory"))?;
        conn.execute_batch(CREATE_TABLE_SQL)
            .map_err(db_err("create table"))?;
        debug!("in-memory order database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace an order.
    #[instrument(skip(self, order), fields(order = %order.id))]
    pub fn insert_order(&self, order: &Order) -> Result<()> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO orders (id, number, printed, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    order.id.0 as i64,
                    order.number,
                    order.printed,
                    order.created_at.to_rfc3339(),
                ],
            )
            .map_err(db_err("insert order"))?;
        debug!("order stored");
        Ok(())
    }

    pub fn order(&self, id: OrderId) -> Result<Option<Order>> {
        self.conn()
            .query_row(
                "SELECT id, number, printed, created_at FROM orders WHERE id = ?1",
                params![id.0 as i64],
                row_to_order,
            )
            .optional()
            .map_err(db_err("get order"))
    }

    /// Orders not yet printed, oldest first.
    pub fn unprinted_orders(&self) -> Result<Vec<Order>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, number, printed, created_at FROM orders
                 WHERE printed = 0 ORDER BY created_at ASC, id ASC",
            )
            .map_err(db_err("prepare unprinted"))?;
        let rows = stmt
            .query_map([], row_to_order)
            .map_err(db_err("query unprinted"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("read unprinted"))
    }

    /// Flip the printed flag. Returns `true` only for the call that flipped it.
    pub fn set_printed(&self, id: OrderId) -> Result<bool> {
        let changed = self
            .conn()
            .execute(
                "UPDATE orders SET printed = 1, printed_at = ?2 WHERE id = ?1 AND printed = 0",
                params![id.0 as i64, Utc::now().to_rfc3339()],
            )
            .map_err(db_err("mark printed"))?;
        Ok(changed == 1)
    }
}

#[async_trait]
impl OrderStore for SqliteOrderStore {
    async fn get_by_id(&self, id: OrderId) -> Result<Option<Order>> {
        self.order(id)
    }

    async fn mark_printed(&self, id: OrderId) -> Result<bool> {
        self.set_printed(id)
    }
}

/// Column order matches the SELECTs above.
fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<Order> {
    let id: i64 = row.get(0)?;
    let created_at: String = row.get(3)?;
    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(Order {
        id: OrderId(id as u64),
        number: row.get(1)?,
        printed: row.get(2)?,
        created_at,
    })
}
