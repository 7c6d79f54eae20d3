use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{migrate::MigrateDatabase, Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::audit::{AuditQuery, AuditRecord, AuditSink};
use crate::config::DatabaseConfig;
use crate::error::{WorkflowError, WorkflowResult};
use crate::store::ExecutionStore;
use crate::workflow::{EntityKey, HistoryEntry, TransitionTrigger, WorkflowExecution};

impl From<sqlx::Error> for WorkflowError {
    fn from(e: sqlx::Error) -> Self {
        WorkflowError::storage(e)
    }
}

fn trigger_to_str(trigger: TransitionTrigger) -> &'static str {
    match trigger {
        TransitionTrigger::User => "USER",
        TransitionTrigger::System => "SYSTEM",
    }
}

fn trigger_from_str(value: &str) -> WorkflowResult<TransitionTrigger> {
    match value {
        "USER" => Ok(TransitionTrigger::User),
        "SYSTEM" => Ok(TransitionTrigger::System),
        other => Err(WorkflowError::storage(format!("unknown trigger '{other}'"))),
    }
}

fn json_column(value: &str) -> WorkflowResult<serde_json::Value> {
    serde_json::from_str(value).map_err(WorkflowError::storage)
}

fn execution_from_row(row: &SqliteRow) -> WorkflowResult<WorkflowExecution> {
    Ok(WorkflowExecution {
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        organization_id: row.try_get("organization_id")?,
        definition_version: row.try_get::<i64, _>("definition_version")? as u32,
        current_state: row.try_get("current_state")?,
        version: row.try_get::<i64, _>("version")? as u64,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn history_from_row(row: &SqliteRow) -> WorkflowResult<HistoryEntry> {
    let id: String = row.try_get("id")?;
    let trigger: String = row.try_get("trigger_kind")?;
    let metadata: String = row.try_get("metadata")?;
    Ok(HistoryEntry {
        id: Uuid::parse_str(&id).map_err(WorkflowError::storage)?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        definition_version: row.try_get::<i64, _>("definition_version")? as u32,
        from_state: row.try_get("from_state")?,
        to_state: row.try_get("to_state")?,
        transition_code: row.try_get("transition_code")?,
        trigger: trigger_from_str(&trigger)?,
        performed_by: row.try_get("performed_by")?,
        comment: row.try_get("comment")?,
        metadata: json_column(&metadata)?,
        performed_at: row.try_get("performed_at")?,
        duration_in_state_secs: row.try_get("duration_in_state_secs")?,
    })
}

fn audit_from_row(row: &SqliteRow) -> WorkflowResult<AuditRecord> {
    let id: String = row.try_get("id")?;
    let action: String = row.try_get("action")?;
    let before: Option<String> = row.try_get("before_json")?;
    let after: Option<String> = row.try_get("after_json")?;
    Ok(AuditRecord {
        id: Uuid::parse_str(&id).map_err(WorkflowError::storage)?,
        actor_id: row.try_get("actor_id")?,
        action: action.parse()?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        before: before.as_deref().map(json_column).transpose()?,
        after: after.as_deref().map(json_column).transpose()?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

/// SQLite-backed execution ledger and audit feed
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// Initialize database with automatic migrations
    pub async fn new(database_url: &str, max_connections: u32, auto_migrate: bool) -> Result<Self> {
        if !database_url.contains(":memory:") && !sqlx::Sqlite::database_exists(database_url).await? {
            info!("Creating database at {}", database_url);
            sqlx::Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        if auto_migrate {
            info!("Running database migrations...");
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("Database migrations completed");
        }

        Ok(Self { pool })
    }

    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        info!("Initializing database at {}", config.url);
        Self::new(&config.url, config.max_connections, config.auto_migrate).await
    }

    /// Get database pool for queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close database connections gracefully
    pub async fn shutdown(&self) {
        info!("Shutting down database connections...");
        self.pool.close().await;
        info!("Database connections closed");
    }
}

const EXECUTION_COLUMNS: &str = "entity_type, entity_id, organization_id, definition_version, current_state, version, created_at, updated_at";

#[async_trait]
impl ExecutionStore for DatabaseManager {
    async fn create_execution(&self, execution: WorkflowExecution) -> WorkflowResult<WorkflowExecution> {
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_executions
                (entity_type, entity_id, organization_id, definition_version, current_state, version, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&execution.entity_type)
        .bind(&execution.entity_id)
        .bind(&execution.organization_id)
        .bind(execution.definition_version as i64)
        .bind(&execution.current_state)
        .bind(execution.version as i64)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(execution),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(WorkflowError::StateConflict {
                entity_type: execution.entity_type,
                entity_id: execution.entity_id,
                expected_version: 0,
                actual_version: execution.version,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_execution(&self, key: &EntityKey) -> WorkflowResult<Option<WorkflowExecution>> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE entity_type = ?1 AND entity_id = ?2"
        ))
        .bind(&key.entity_type)
        .bind(&key.entity_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn list_executions(&self, entity_type: Option<&str>) -> WorkflowResult<Vec<WorkflowExecution>> {
        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions \
             WHERE ?1 IS NULL OR entity_type = ?1 ORDER BY entity_type, entity_id"
        ))
        .bind(entity_type)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(execution_from_row).collect()
    }

    async fn apply_transition(
        &self,
        key: &EntityKey,
        expected_version: u64,
        entry: HistoryEntry,
    ) -> WorkflowResult<WorkflowExecution> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET current_state = ?1, version = version + 1, updated_at = ?2
            WHERE entity_type = ?3 AND entity_id = ?4 AND version = ?5
            "#,
        )
        .bind(&entry.to_state)
        .bind(entry.performed_at)
        .bind(&key.entity_type)
        .bind(&key.entity_id)
        .bind(expected_version as i64)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let actual: Option<i64> = sqlx::query_scalar(
                "SELECT version FROM workflow_executions WHERE entity_type = ?1 AND entity_id = ?2",
            )
            .bind(&key.entity_type)
            .bind(&key.entity_id)
            .fetch_optional(&mut *tx)
            .await?;
            tx.rollback().await?;
            return match actual {
                Some(actual) => Err(WorkflowError::StateConflict {
                    entity_type: key.entity_type.clone(),
                    entity_id: key.entity_id.clone(),
                    expected_version,
                    actual_version: actual as u64,
                }),
                None => Err(WorkflowError::not_found("workflow execution", key.to_string())),
            };
        }

        let metadata = serde_json::to_string(&entry.metadata).map_err(WorkflowError::storage)?;
        sqlx::query(
            r#"
            INSERT INTO workflow_history
                (id, seq, entity_type, entity_id, definition_version, from_state, to_state, transition_code,
                 trigger_kind, performed_by, comment, metadata, performed_at, duration_in_state_secs)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(expected_version as i64)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(entry.definition_version as i64)
        .bind(&entry.from_state)
        .bind(&entry.to_state)
        .bind(&entry.transition_code)
        .bind(trigger_to_str(entry.trigger))
        .bind(&entry.performed_by)
        .bind(&entry.comment)
        .bind(metadata)
        .bind(entry.performed_at)
        .bind(entry.duration_in_state_secs)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE entity_type = ?1 AND entity_id = ?2"
        ))
        .bind(&key.entity_type)
        .bind(&key.entity_id)
        .fetch_one(&mut *tx)
        .await?;
        let execution = execution_from_row(&row)?;

        tx.commit().await?;
        Ok(execution)
    }

    async fn history(&self, key: &EntityKey) -> WorkflowResult<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_history WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY seq ASC",
        )
        .bind(&key.entity_type)
        .bind(&key.entity_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(history_from_row).collect()
    }

    async fn all_history(&self, entity_type: Option<&str>) -> WorkflowResult<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_history WHERE ?1 IS NULL OR entity_type = ?1 ORDER BY performed_at ASC, seq ASC",
        )
        .bind(entity_type)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(history_from_row).collect()
    }
}

#[async_trait]
impl AuditSink for DatabaseManager {
    async fn append(&self, record: AuditRecord) -> WorkflowResult<()> {
        let before = record.before.as_ref().map(|v| v.to_string());
        let after = record.after.as_ref().map(|v| v.to_string());
        sqlx::query(
            r#"
            INSERT INTO audit_log (id, actor_id, action, entity_type, entity_id, before_json, after_json, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.actor_id)
        .bind(record.action.as_str())
        .bind(&record.entity_type)
        .bind(&record.entity_id)
        .bind(before)
        .bind(after)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> WorkflowResult<Vec<AuditRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM audit_log
            WHERE (?1 IS NULL OR entity_type = ?1)
              AND (?2 IS NULL OR entity_id = ?2)
              AND (?3 IS NULL OR action = ?3)
            ORDER BY recorded_at ASC
            "#,
        )
        .bind(&query.entity_type)
        .bind(&query.entity_id)
        .bind(query.action.map(|a| a.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(audit_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditAction;
    use chrono::Utc;

    async fn manager() -> DatabaseManager {
        DatabaseManager::new("sqlite::memory:", 1, true).await.unwrap()
    }

    fn execution(now: chrono::DateTime<Utc>) -> WorkflowExecution {
        WorkflowExecution {
            entity_type: "REVIEW".to_string(),
            entity_id: "rev-1".to_string(),
            organization_id: Some("org-1".to_string()),
            definition_version: 1,
            current_state: "DRAFT".to_string(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    fn entry(now: chrono::DateTime<Utc>) -> HistoryEntry {
        HistoryEntry {
            id: Uuid::new_v4(),
            entity_type: "REVIEW".to_string(),
            entity_id: "rev-1".to_string(),
            definition_version: 1,
            from_state: "DRAFT".to_string(),
            to_state: "SUBMITTED".to_string(),
            transition_code: "submit".to_string(),
            trigger: TransitionTrigger::User,
            performed_by: "u1".to_string(),
            comment: None,
            metadata: serde_json::json!({ "source": "test" }),
            performed_at: now,
            duration_in_state_secs: 0,
        }
    }

    #[tokio::test]
    async fn test_transition_compare_and_swap() {
        let db = manager().await;
        let now = Utc::now();
        db.create_execution(execution(now)).await.unwrap();
        assert!(matches!(
            db.create_execution(execution(now)).await,
            Err(WorkflowError::StateConflict { .. })
        ));

        let key = EntityKey::new("REVIEW", "rev-1");
        let updated = db.apply_transition(&key, 1, entry(now)).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.current_state, "SUBMITTED");

        let stale = db.apply_transition(&key, 1, entry(now)).await.unwrap_err();
        assert!(matches!(stale, WorkflowError::StateConflict { actual_version: 2, .. }));

        let history = db.history(&key).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].metadata["source"], "test");
    }

    #[tokio::test]
    async fn test_audit_round_trip_with_filters() {
        let db = manager().await;
        let record = AuditRecord::new("admin", AuditAction::ClockExtended, "REVIEW", "rev-1", Utc::now())
            .with_change(Some(&1), Some(&2));
        db.append(record.clone()).await.unwrap();

        let found = db
            .query(&AuditQuery {
                action: Some(AuditAction::ClockExtended),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].after, Some(serde_json::json!(2)));
        assert!(db
            .query(&AuditQuery {
                entity_id: Some("rev-2".to_string()),
                ..Default::default()
            })
            .await
            .unwrap()
            .is_empty());
    }
}
