//! Processor checkpoints and where they are kept.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::instrument;

use crate::error::Result;
use crate::events::{Position, StreamId};

/// Last position a named processor finished with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub stream_id: StreamId,
    pub position: Position,
}

impl Checkpoint {
    pub fn new(id: impl Into<String>, stream_id: StreamId, position: Position) -> Self {
        Self {
            id: id.into(),
            stream_id,
            position,
        }
    }

    /// A checkpoint that has processed nothing yet.
    pub fn initial(id: impl Into<String>, stream_id: StreamId) -> Self {
        Self::new(id, stream_id, Position::START)
    }
}

/// Durable storage for checkpoints, keyed by processor name.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<Checkpoint>>;

    /// Insert or replace.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Remove; missing checkpoints are ignored.
    async fn delete(&self, id: &str) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: DashMap<String, Checkpoint>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.get(id).map(|c| c.value().clone()))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints.insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.checkpoints.remove(id);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PostgreSQL
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoints in the `checkpoints` table.
#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    #[instrument(skip(self))]
    async fn load(&self, id: &str) -> Result<Option<Checkpoint>> {
        let row: Option<(String, String, i64)> =
            sqlx::query_as("SELECT id, stream_id, position FROM checkpoints WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id, stream_id, position)| Checkpoint {
            id,
            stream_id: StreamId::new(stream_id),
            position: Position::new(position),
        }))
    }

    #[instrument(skip(self, checkpoint), fields(id = %checkpoint.id, position = %checkpoint.position))]
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (id, stream_id, position, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (id) DO UPDATE
            SET stream_id = EXCLUDED.stream_id,
                position = EXCLUDED.position,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&checkpoint.id)
        .bind(checkpoint.stream_id.as_str())
        .bind(checkpoint.position.value())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM checkpoints WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
