//! PostgreSQL implementation of the request store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use overseer_core::{BuildRequest, BuildResult, MasterId, RequestId, WorkerId};
use sqlx::PgPool;
use std::collections::HashSet;

use crate::store::{NewBuildRequest, RequestStore};
use crate::{DbError, DbResult};

/// A build request row as stored.
#[derive(Debug, sqlx::FromRow)]
struct RequestRow {
    id: uuid::Uuid,
    builder: String,
    buildset_id: uuid::Uuid,
    priority: i32,
    submitted_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    claimed_by_master: Option<uuid::Uuid>,
    complete_at: Option<DateTime<Utc>>,
    results: Option<String>,
}

impl From<RequestRow> for BuildRequest {
    fn from(row: RequestRow) -> Self {
        BuildRequest {
            id: row.id.into(),
            builder: row.builder,
            buildset_id: row.buildset_id.into(),
            priority: row.priority,
            submitted_at: row.submitted_at,
            claimed_at: row.claimed_at,
            claimed_by_master: row.claimed_by_master.map(Into::into),
            complete_at: row.complete_at,
            results: row.results.as_deref().and_then(BuildResult::parse),
        }
    }
}

const REQUEST_COLUMNS: &str = "id, builder, buildset_id, priority, submitted_at, \
     claimed_at, claimed_by_master, complete_at, results";

/// Request store backed by PostgreSQL.
pub struct PgRequestStore {
    pool: PgPool,
}

impl PgRequestStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RequestStore for PgRequestStore {
    async fn create_request(&self, new: NewBuildRequest) -> DbResult<BuildRequest> {
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            r#"
            INSERT INTO build_requests (id, builder, buildset_id, priority, submitted_at)
            VALUES ($1, $2, $3, $4, NOW())
            RETURNING {REQUEST_COLUMNS}
            "#,
        ))
        .bind(uuid::Uuid::now_v7())
        .bind(&new.builder)
        .bind(new.buildset_id.as_uuid())
        .bind(new.priority)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn get_request(&self, id: RequestId) -> DbResult<Option<BuildRequest>> {
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM build_requests WHERE id = $1",
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn get_pending_requests(&self, builder: &str) -> DbResult<Vec<BuildRequest>> {
        let rows = sqlx::query_as::<_, RequestRow>(&format!(
            r#"
            SELECT {REQUEST_COLUMNS} FROM build_requests
            WHERE builder = $1 AND claimed_at IS NULL AND complete_at IS NULL
            ORDER BY priority DESC, submitted_at ASC, id ASC
            "#,
        ))
        .bind(builder)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// A single conditional UPDATE; the WHERE clause closes the race window.
    async fn try_claim(&self, id: RequestId, master: MasterId) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE build_requests
            SET claimed_at = NOW(), claimed_by_master = $2
            WHERE id = $1 AND claimed_at IS NULL AND complete_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(master.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn unclaim(&self, id: RequestId) -> DbResult<()> {
        sqlx::query(
            "UPDATE build_requests SET claimed_at = NULL, claimed_by_master = NULL WHERE id = $1",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reclaim_orphaned(&self, stale_before: DateTime<Utc>) -> DbResult<Vec<RequestId>> {
        let rows: Vec<(uuid::Uuid,)> = sqlx::query_as(
            r#"
            UPDATE build_requests br
            SET claimed_at = NULL, claimed_by_master = NULL
            FROM masters m
            WHERE br.claimed_by_master = m.id
              AND br.complete_at IS NULL
              AND (m.stopped OR m.last_active < $1)
            RETURNING br.id
            "#,
        )
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id.into()).collect())
    }

    async fn configured_workers(
        &self,
        builder: &str,
        master: MasterId,
    ) -> DbResult<HashSet<WorkerId>> {
        let rows: Vec<(uuid::Uuid,)> = sqlx::query_as(
            "SELECT worker_id FROM builder_workers WHERE builder = $1 AND master_id = $2",
        )
        .bind(builder)
        .bind(master.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id.into()).collect())
    }

    async fn set_configured_workers(
        &self,
        builder: &str,
        master: MasterId,
        workers: &HashSet<WorkerId>,
    ) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM builder_workers WHERE builder = $1 AND master_id = $2")
            .bind(builder)
            .bind(master.as_uuid())
            .execute(&mut *tx)
            .await?;
        for worker in workers {
            sqlx::query(
                "INSERT INTO builder_workers (builder, master_id, worker_id) VALUES ($1, $2, $3)",
            )
            .bind(builder)
            .bind(master.as_uuid())
            .bind(worker.as_uuid())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn record_dispatch(&self, id: RequestId, worker: WorkerId) -> DbResult<()> {
        let result = sqlx::query("UPDATE build_requests SET dispatched_to = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(worker.as_uuid())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("build request {id}")));
        }
        Ok(())
    }

    async fn record_complete(&self, id: RequestId, results: BuildResult) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE build_requests
            SET complete_at = NOW(), results = $2
            WHERE id = $1 AND complete_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(results.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!(
                "build request {id} (missing or already complete)"
            )));
        }
        Ok(())
    }

    async fn heartbeat(&self, master: MasterId) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO masters (id, last_active, stopped)
            VALUES ($1, NOW(), FALSE)
            ON CONFLICT (id) DO UPDATE SET last_active = NOW(), stopped = FALSE
            "#,
        )
        .bind(master.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_stopped(&self, master: MasterId) -> DbResult<()> {
        sqlx::query("UPDATE masters SET stopped = TRUE WHERE id = $1")
            .bind(master.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
