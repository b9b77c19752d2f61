//! Alert history stores
//!
//! Append-only. The in-memory store is the default; [`PgAlertStore`] keeps
//! history in PostgreSQL when a database URL is configured.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use uuid::Uuid;

use super::types::Alert;
use crate::error::StorageError;

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn append(&self, alert: &Alert) -> Result<(), StorageError>;

    /// Most recent first
    async fn recent(&self, limit: usize) -> Result<Vec<Alert>, StorageError>;

    async fn count(&self) -> Result<u64, StorageError>;
}

// ============================================================================
// IN-MEMORY
// ============================================================================

#[derive(Default)]
pub struct MemoryAlertHistory {
    alerts: RwLock<Vec<Arc<Alert>>>,
}

impl MemoryAlertHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AlertStore for MemoryAlertHistory {
    async fn append(&self, alert: &Alert) -> Result<(), StorageError> {
        self.alerts.write().push(Arc::new(alert.clone()));
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Alert>, StorageError> {
        Ok(self.alerts.read()
            .iter()
            .rev()
            .take(limit)
            .map(|a| a.as_ref().clone())
            .collect())
    }

    async fn count(&self) -> Result<u64, StorageError> {
        Ok(self.alerts.read().len() as u64)
    }
}

// ============================================================================
// POSTGRES
// ============================================================================

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS alerts (
    seq BIGSERIAL PRIMARY KEY,
    id UUID NOT NULL UNIQUE,
    created_at TIMESTAMPTZ NOT NULL,
    severity SMALLINT NOT NULL,
    alert_type VARCHAR(64) NOT NULL,
    description TEXT NOT NULL,
    source JSONB NOT NULL,
    data JSONB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts(created_at);
CREATE INDEX IF NOT EXISTS idx_alerts_severity ON alerts(severity);
"#;

#[derive(FromRow)]
struct AlertRow {
    id: Uuid,
    created_at: DateTime<Utc>,
    severity: i16,
    alert_type: String,
    description: String,
    source: serde_json::Value,
    data: serde_json::Value,
}

impl From<AlertRow> for Alert {
    fn from(row: AlertRow) -> Self {
        Alert {
            id: row.id,
            timestamp: row.created_at,
            severity: row.severity.clamp(0, 10) as u8,
            alert_type: row.alert_type,
            description: row.description,
            source: row.source,
            data: row.data,
        }
    }
}

pub struct PgAlertStore {
    pool: PgPool,
}

impl PgAlertStore {
    /// Connect and make sure the `alerts` table exists
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        // Multiple statements need the simple query protocol
        sqlx::raw_sql(SCHEMA_SQL).execute(&pool).await?;
        tracing::info!("Alert history schema applied");

        Ok(Self { pool })
    }
}

#[async_trait]
impl AlertStore for PgAlertStore {
    async fn append(&self, alert: &Alert) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO alerts (id, created_at, severity, alert_type, description, source, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(alert.id)
        .bind(alert.timestamp)
        .bind(alert.severity as i16)
        .bind(&alert.alert_type)
        .bind(&alert.description)
        .bind(&alert.source)
        .bind(&alert.data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Alert>, StorageError> {
        let rows = sqlx::query_as::<_, AlertRow>(
            r#"
            SELECT id, created_at, severity, alert_type, description, source, data
            FROM alerts
            ORDER BY seq DESC
            LIMIT $1
            "#,
        )
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Alert::from).collect())
    }

    async fn count(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alerts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
