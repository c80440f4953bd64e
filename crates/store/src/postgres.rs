use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    CorrelationId, Result, SagaRecord, ScheduleOp, ScheduleToken, ScheduledMessage, StoreError,
    Version, store::SagaStore,
};

/// PostgreSQL-backed saga store implementation.
///
/// Instance saves use a version-checked `UPDATE`; a zero-row update means a
/// concurrent writer won, which surfaces as a concurrency conflict. Schedule
/// mutations run in the same transaction as the instance save.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_record(row: PgRow) -> Result<(SagaRecord, Version)> {
        let tokens_json: serde_json::Value = row.try_get("scheduled_tokens")?;
        let scheduled_tokens: HashMap<String, ScheduleToken> =
            serde_json::from_value(tokens_json)?;

        let record = SagaRecord {
            correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            saga_type: row.try_get("saga_type")?,
            current_state: row.try_get("current_state")?,
            completed: row.try_get("completed")?,
            scheduled_tokens,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        };
        let version = Version::new(row.try_get("version")?);
        Ok((record, version))
    }

    fn row_to_schedule(row: PgRow) -> Result<ScheduledMessage> {
        Ok(ScheduledMessage {
            correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            schedule_name: row.try_get("schedule_name")?,
            token: ScheduleToken::from_uuid(row.try_get::<Uuid, _>("token")?),
            due_at: row.try_get("due_at")?,
            message_type: row.try_get("message_type")?,
            payload: row.try_get("payload")?,
        })
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn load(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Option<(SagaRecord, Version)>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT correlation_id, saga_type, current_state, completed, scheduled_tokens,
                   version, created_at, updated_at
            FROM saga_instances
            WHERE correlation_id = $1
            "#,
        )
        .bind(correlation_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }

    async fn save(
        &self,
        record: SagaRecord,
        expected_version: Version,
        schedule_ops: Vec<ScheduleOp>,
    ) -> Result<Version> {
        let correlation_id = record.correlation_id;
        let new_version = expected_version.next();
        let tokens_json = serde_json::to_value(&record.scheduled_tokens)?;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        if expected_version == Version::initial() {
            sqlx::query(
                r#"
                INSERT INTO saga_instances
                    (correlation_id, saga_type, current_state, completed, scheduled_tokens,
                     version, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(correlation_id.as_uuid())
            .bind(&record.saga_type)
            .bind(&record.current_state)
            .bind(record.completed)
            .bind(&tokens_json)
            .bind(new_version.as_i64())
            .bind(record.created_at)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                // A primary key violation means another writer created the
                // instance first.
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.is_unique_violation()
                {
                    return StoreError::ConcurrencyConflict {
                        correlation_id,
                        expected: expected_version,
                        actual: Version::first(),
                    };
                }
                StoreError::Database(e)
            })?;
        } else {
            let result = sqlx::query(
                r#"
                UPDATE saga_instances
                SET current_state = $1, completed = $2, scheduled_tokens = $3,
                    version = $4, updated_at = $5
                WHERE correlation_id = $6 AND version = $7
                "#,
            )
            .bind(&record.current_state)
            .bind(record.completed)
            .bind(&tokens_json)
            .bind(new_version.as_i64())
            .bind(now)
            .bind(correlation_id.as_uuid())
            .bind(expected_version.as_i64())
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                let actual: Option<i64> = sqlx::query_scalar(
                    "SELECT version FROM saga_instances WHERE correlation_id = $1",
                )
                .bind(correlation_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;

                return Err(StoreError::ConcurrencyConflict {
                    correlation_id,
                    expected: expected_version,
                    actual: Version::new(actual.unwrap_or(0)),
                });
            }
        }

        for op in &schedule_ops {
            match op {
                ScheduleOp::Insert(schedule) => {
                    sqlx::query(
                        r#"
                        INSERT INTO saga_schedules
                            (correlation_id, schedule_name, token, due_at, message_type, payload)
                        VALUES ($1, $2, $3, $4, $5, $6)
                        ON CONFLICT (correlation_id, schedule_name) DO UPDATE SET
                            token = EXCLUDED.token,
                            due_at = EXCLUDED.due_at,
                            message_type = EXCLUDED.message_type,
                            payload = EXCLUDED.payload
                        "#,
                    )
                    .bind(schedule.correlation_id.as_uuid())
                    .bind(&schedule.schedule_name)
                    .bind(schedule.token.as_uuid())
                    .bind(schedule.due_at)
                    .bind(&schedule.message_type)
                    .bind(&schedule.payload)
                    .execute(&mut *tx)
                    .await?;
                }
                ScheduleOp::Remove {
                    correlation_id,
                    schedule_name,
                } => {
                    sqlx::query(
                        "DELETE FROM saga_schedules WHERE correlation_id = $1 AND schedule_name = $2",
                    )
                    .bind(correlation_id.as_uuid())
                    .bind(schedule_name)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(new_version)
    }

    async fn pending_schedules(&self) -> Result<Vec<ScheduledMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT correlation_id, schedule_name, token, due_at, message_type, payload
            FROM saga_schedules
            ORDER BY due_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_schedule).collect()
    }

    async fn get_schedule(
        &self,
        correlation_id: CorrelationId,
        schedule_name: &str,
    ) -> Result<Option<ScheduledMessage>> {
        let row = sqlx::query(
            r#"
            SELECT correlation_id, schedule_name, token, due_at, message_type, payload
            FROM saga_schedules
            WHERE correlation_id = $1 AND schedule_name = $2
            "#,
        )
        .bind(correlation_id.as_uuid())
        .bind(schedule_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_schedule).transpose()
    }

    async fn remove_schedule(
        &self,
        correlation_id: CorrelationId,
        schedule_name: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM saga_schedules WHERE correlation_id = $1 AND schedule_name = $2",
        )
        .bind(correlation_id.as_uuid())
        .bind(schedule_name)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
