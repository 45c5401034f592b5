//! SQLite persistence for the transition audit trail.
//!
//! Every record the trading core emits lands in `transitions`. On restart
//! the most recent event ids are read back to seed replay protection.

use anyhow::{Context, Result};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::models::TransitionRecord;
use crate::trading::{OPERATOR_EVENT, RECONCILE_EVENT};

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Stored transition row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredTransition {
    pub timestamp: String,
    pub event_id: String,
    pub action: String,
    /// Position snapshot as JSON
    pub position: Option<String>,
    pub error: Option<String>,
    /// Close summary as JSON
    pub close: Option<String>,
}

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

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_id TEXT NOT NULL,
                action TEXT NOT NULL,
                position TEXT,
                error TEXT,
                close TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_transitions_event ON transitions(event_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Append one transition record.
    pub async fn record_transition(&self, record: &TransitionRecord) -> Result<()> {
        let position = record
            .position
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize position")?;
        let close = record
            .close
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize close summary")?;

        sqlx::query(
            r#"
            INSERT INTO transitions (timestamp, event_id, action, position, error, close)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.timestamp.to_rfc3339())
        .bind(&record.event_id)
        .bind(record.action.to_string())
        .bind(position)
        .bind(&record.error)
        .bind(close)
        .execute(&self.pool)
        .await
        .context("Failed to insert transition")?;

        Ok(())
    }

    /// Most recent distinct source post ids, oldest first.
    pub async fn recent_event_ids(&self, limit: i64) -> Result<Vec<String>> {
        let mut ids: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT event_id FROM transitions
            WHERE event_id NOT IN (?, ?)
            GROUP BY event_id
            ORDER BY MAX(id) DESC
            LIMIT ?
            "#,
        )
        .bind(RECONCILE_EVENT)
        .bind(OPERATOR_EVENT)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        ids.reverse();
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// Latest transitions, newest first.
    pub async fn history(&self, limit: i64) -> Result<Vec<StoredTransition>> {
        let rows = sqlx::query_as::<_, StoredTransition>(
            r#"
            SELECT timestamp, event_id, action, position, error, close
            FROM transitions ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

/// Drain records into the database in the background. Write failures are
/// logged and never reach the trading core.
pub fn spawn_record_writer(
    db: Database,
    mut rx: mpsc::UnboundedReceiver<TransitionRecord>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            match db.record_transition(&record).await {
                Ok(()) => debug!(event_id = %record.event_id, action = %record.action, "Transition recorded"),
                Err(e) => warn!(
                    event_id = %record.event_id,
                    action = %record.action,
                    error = %e,
                    "Failed to persist transition"
                ),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    use crate::models::{CloseSummary, Position, RecordAction, Side};

    async fn memory_db() -> Database {
        // one connection, or each would see its own empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let db = Database { pool };
        db.run_migrations().await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_record_and_read_history() {
        let db = memory_db().await;
        let pos = Position::opening(Side::Long, 15, Some("p1".into()));

        db.record_transition(&TransitionRecord::new("p1", RecordAction::OpenLong, Some(pos)))
            .await
            .unwrap();
        db.record_transition(
            &TransitionRecord::new("p2", RecordAction::Abort, None).with_error("rejected"),
        )
        .await
        .unwrap();

        let rows = db.history(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].action, "ABORT");
        assert_eq!(rows[0].error.as_deref(), Some("rejected"));
        let stored: Position = serde_json::from_str(rows[1].position.as_deref().unwrap()).unwrap();
        assert_eq!(stored.side, Side::Long);
    }

    #[tokio::test]
    async fn test_close_summary_is_stored() {
        let db = memory_db().await;
        let mut pos = Position::opening(Side::Short, 10, Some("p1".into()));
        pos.entry_price = dec!(60000);
        pos.quantity = dec!(0.1);
        let close = CloseSummary::settle(&pos, dec!(59000), "opposite signal");

        db.record_transition(
            &TransitionRecord::new("p1", RecordAction::Close, Some(pos)).with_close(Some(close.clone())),
        )
        .await
        .unwrap();

        let rows = db.history(1).await.unwrap();
        let stored: CloseSummary = serde_json::from_str(rows[0].close.as_deref().unwrap()).unwrap();
        assert_eq!(stored, close);
        assert_eq!(stored.pnl_usd, dec!(100));
    }

    #[tokio::test]
    async fn test_recent_event_ids_skip_synthetic() {
        let db = memory_db().await;
        for (id, action) in [
            ("p1", RecordAction::Skip),
            (RECONCILE_EVENT, RecordAction::DriftCorrected),
            ("p2", RecordAction::OpenShort),
            ("p1", RecordAction::Skip),
            (OPERATOR_EVENT, RecordAction::Close),
            ("p3", RecordAction::Skip),
        ] {
            db.record_transition(&TransitionRecord::new(id, action, None))
                .await
                .unwrap();
        }

        let ids = db.recent_event_ids(10).await.unwrap();
        assert_eq!(ids, vec!["p2", "p1", "p3"]);

        let ids = db.recent_event_ids(2).await.unwrap();
        assert_eq!(ids, vec!["p1", "p3"]);
    }

    #[tokio::test]
    async fn test_writer_drains_channel() {
        let db = memory_db().await;
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_record_writer(db.clone(), rx);

        tx.send(TransitionRecord::new("p1", RecordAction::Skip, None)).unwrap();
        tx.send(TransitionRecord::new("p2", RecordAction::Skip, None)).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(db.history(10).await.unwrap().len(), 2);
    }
}
