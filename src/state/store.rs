//! PostgreSQL journal for monitoring events and intent outcomes
//!
//! Write-path only for the orchestrator: events flow in through a bus
//! subscriber, and nothing here is ever read back for control flow.

use crate::config::DatabaseConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{EventBus, EventKind, MonitoringEvent};

use ethers::types::H256;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// State store for PostgreSQL persistence
pub struct StateStore {
    pool: PgPool,
}

impl StateStore {
    /// Create a new state store
    pub async fn new(config: &DatabaseConfig) -> OrchestratorResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(OrchestratorError::Database)?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS monitoring_events (
                id BIGSERIAL PRIMARY KEY,
                event_type VARCHAR(50) NOT NULL,
                intent_id VARCHAR(66),
                payload JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_events_intent
            ON monitoring_events (intent_id, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS intent_outcomes (
                intent_id VARCHAR(66) PRIMARY KEY,
                final_state VARCHAR(20) NOT NULL,
                chain_id BIGINT,
                tx_hash VARCHAR(66),
                via_failover BOOLEAN NOT NULL DEFAULT FALSE,
                completed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> OrchestratorResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(OrchestratorError::Database)?;
        Ok(())
    }

    /// Append a monitoring event to the journal
    pub async fn record_event(&self, event: &MonitoringEvent) -> OrchestratorResult<()> {
        let payload = serde_json::to_value(event)
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        let intent_id = event.intent_id().map(|id| format!("{:?}", id));

        sqlx::query(
            r#"
            INSERT INTO monitoring_events (event_type, intent_id, payload, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(event.name())
        .bind(intent_id)
        .bind(payload)
        .bind(event.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Upsert the terminal outcome of an intent
    pub async fn record_outcome(
        &self,
        intent_id: H256,
        final_state: &str,
        chain_id: Option<u64>,
        tx_hash: Option<H256>,
    ) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO intent_outcomes (intent_id, final_state, chain_id, tx_hash, completed_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (intent_id)
            DO UPDATE SET final_state = $2, chain_id = $3, tx_hash = $4, completed_at = NOW()
            "#,
        )
        .bind(format!("{:?}", intent_id))
        .bind(final_state)
        .bind(chain_id.map(|c| c as i64))
        .bind(tx_hash.map(|h| format!("{:?}", h)))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Flag an outcome as recovered through failover
    pub async fn mark_failover_recovery(&self, intent_id: H256) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            UPDATE intent_outcomes
            SET via_failover = TRUE
            WHERE intent_id = $1
            "#,
        )
        .bind(format!("{:?}", intent_id))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Aggregate outcome counts
    pub async fn get_stats(&self) -> OrchestratorResult<OutcomeStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE final_state = 'completed') as completed,
                COUNT(*) FILTER (WHERE final_state = 'failed') as failed,
                COUNT(*) FILTER (WHERE via_failover) as recovered
            FROM intent_outcomes
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(OutcomeStats {
            completed: row.get::<i64, _>("completed") as u64,
            failed: row.get::<i64, _>("failed") as u64,
            recovered: row.get::<i64, _>("recovered") as u64,
        })
    }
}

/// Intent outcome statistics
#[derive(Debug, Clone)]
pub struct OutcomeStats {
    pub completed: u64,
    pub failed: u64,
    pub recovered: u64,
}

/// Subscribe the journal to the bus. Handlers stay synchronous; an unbounded
/// channel feeds a single async writer task.
pub fn spawn_journal(bus: &EventBus, store: Arc<StateStore>) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<MonitoringEvent>();

    for kind in EventKind::ALL {
        let tx = tx.clone();
        bus.on(kind, move |event| {
            let _ = tx.send(event.clone());
        });
    }

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(e) = store.record_event(&event).await {
                warn!("Failed to journal event {}: {}", event.name(), e);
            }

            let outcome = match &event {
                MonitoringEvent::IntentExecuted {
                    intent_id,
                    chain_id,
                    tx_hash,
                    ..
                } => Some((*intent_id, "completed", Some(*chain_id), *tx_hash)),
                MonitoringEvent::IntentFailed { intent_id, .. }
                | MonitoringEvent::FailoverFailed { intent_id, .. }
                | MonitoringEvent::IntentMaxAttempts { intent_id, .. } => {
                    Some((*intent_id, "failed", None, None))
                }
                _ => None,
            };

            if let Some((intent_id, state, chain_id, tx_hash)) = outcome {
                if let Err(e) = store.record_outcome(intent_id, state, chain_id, tx_hash).await {
                    warn!("Failed to record outcome for {:?}: {}", intent_id, e);
                }
            }

            if let MonitoringEvent::FailoverSuccess { intent_id, .. } = &event {
                if let Err(e) = store.mark_failover_recovery(*intent_id).await {
                    warn!("Failed to flag failover recovery for {:?}: {}", intent_id, e);
                }
            }
        }
    })
}
