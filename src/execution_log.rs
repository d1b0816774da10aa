//! Execution Log Store (C3, spec §4.3): one row per step invocation, backed
//! by Postgres via sqlx, grounded on the teacher's `Execution`/`Step` row
//! patterns (`#[derive(FromRow)]`, `sqlx::query_as::<_, T>`, parameterized
//! binds) in the now-superseded `models/db.rs`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{EngineError, ErrorRecord, Result};
use crate::models::StepInvocation;

/// The subset of the Execution Log Store the Orchestrator drives directly
/// (spec §4.3 `markStepStarted/Completed/Failed/Skipped`), extracted as a
/// trait so the Orchestrator can be driven against an in-memory fake in
/// tests the same way [`crate::orchestrator::FlowExecutionStore`] is.
#[async_trait]
pub trait ExecutionLogRecorder: Send + Sync {
    async fn mark_step_started(
        &self,
        org: &str,
        user: &str,
        flow: &str,
        execution: &str,
        step_key: &str,
        inputs_snapshot: Value,
    ) -> Result<String>;
    async fn mark_step_completed(&self, id: &str, outputs: Value) -> Result<()>;
    async fn mark_step_failed(&self, id: &str, error: Value) -> Result<()>;
    async fn mark_step_skipped(&self, id: &str, reason: Option<String>) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionStats {
    pub total_executions: i64,
    pub completed_steps: i64,
    pub failed_steps: i64,
    pub skipped_steps: i64,
    pub avg_execution_time_ms: f64,
}

/// Optional `[start, end)` bound for `get_execution_stats` (spec §4.3
/// `timeRange?`).
#[derive(Debug, Clone, Copy)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Postgres-backed Execution Log Store against a `step_invocations` table.
pub struct PgExecutionLogStore {
    pool: PgPool,
}

impl PgExecutionLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn set_terminal(
        &self,
        id: &str,
        status: &str,
        outputs: Option<Value>,
        error: Option<Value>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE step_invocations
                SET status = $2, outputs = $3, error = $4, updated_at = NOW()
              WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(outputs)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::LogUpdateError(e.to_string()))?;
        Ok(())
    }

    /// Ordered by `createdAt` ascending, org-scoped (spec §4.3).
    pub async fn get_execution_logs(
        &self,
        execution_id: &str,
        org: &str,
    ) -> Result<Vec<StepInvocation>> {
        sqlx::query_as::<_, StepInvocation>(
            "SELECT * FROM step_invocations
              WHERE execution_id = $1 AND org_id = $2
              ORDER BY created_at ASC",
        )
        .bind(execution_id)
        .bind(org)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::LogUpdateError(e.to_string()))
    }

    pub async fn get_step_logs(
        &self,
        flow_id: &str,
        execution_id: &str,
        org: &str,
    ) -> Result<Vec<StepInvocation>> {
        sqlx::query_as::<_, StepInvocation>(
            "SELECT * FROM step_invocations
              WHERE flow_id = $1 AND execution_id = $2 AND org_id = $3
              ORDER BY created_at ASC",
        )
        .bind(flow_id)
        .bind(execution_id)
        .bind(org)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::LogUpdateError(e.to_string()))
    }

    /// Aggregates with `GROUP BY`/`COUNT`/`AVG`, the way the teacher
    /// aggregates with `COUNT(*)` in its cooldown/usage-limit checks.
    pub async fn get_execution_stats(
        &self,
        org: &str,
        time_range: Option<TimeRange>,
    ) -> Result<ExecutionStats> {
        let (start, end) = match time_range {
            Some(r) => (r.start, r.end),
            None => (DateTime::<Utc>::MIN_UTC, Utc::now()),
        };

        let row: (i64, i64, i64, i64, Option<f64>) = sqlx::query_as(
            "SELECT
                COUNT(DISTINCT execution_id),
                COUNT(*) FILTER (WHERE status = 'completed'),
                COUNT(*) FILTER (WHERE status = 'failed'),
                COUNT(*) FILTER (WHERE status = 'skipped'),
                AVG(EXTRACT(EPOCH FROM (updated_at - created_at)) * 1000)
                    FILTER (WHERE status IN ('completed', 'failed'))
             FROM step_invocations
             WHERE org_id = $1 AND created_at >= $2 AND created_at < $3",
        )
        .bind(org)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| EngineError::LogUpdateError(e.to_string()))?;

        Ok(ExecutionStats {
            total_executions: row.0,
            completed_steps: row.1,
            failed_steps: row.2,
            skipped_steps: row.3,
            avg_execution_time_ms: row.4.unwrap_or(0.0),
        })
    }
}

#[async_trait]
impl ExecutionLogRecorder for PgExecutionLogStore {
    /// Creates the "started" row. A failure here is fatal: the Orchestrator
    /// must not execute the step (spec §4.3 invariant).
    async fn mark_step_started(
        &self,
        org: &str,
        user: &str,
        flow: &str,
        execution: &str,
        step_key: &str,
        inputs_snapshot: Value,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO step_invocations
                (id, org_id, user_id, flow_id, execution_id, step_id, attempt, status,
                 inputs_snapshot, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6,
                 (SELECT COALESCE(MAX(attempt), 0) + 1 FROM step_invocations
                   WHERE execution_id = $5 AND step_id = $6),
                 'started', $7, NOW(), NOW())",
        )
        .bind(&id)
        .bind(org)
        .bind(user)
        .bind(flow)
        .bind(execution)
        .bind(step_key)
        .bind(&inputs_snapshot)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::LogUpdateError(e.to_string()))?;
        Ok(id)
    }

    async fn mark_step_completed(&self, id: &str, outputs: Value) -> Result<()> {
        self.set_terminal(id, "completed", Some(outputs), None).await
    }

    /// Normalizes `error` into `{message, code, stack?}` before persisting
    /// (spec §4.3: "normalizes arbitrary error values").
    async fn mark_step_failed(&self, id: &str, error: Value) -> Result<()> {
        let record = ErrorRecord::from_value(error);
        let error_value =
            serde_json::to_value(&record).map_err(|e| EngineError::LogUpdateError(e.to_string()))?;
        self.set_terminal(id, "failed", None, Some(error_value)).await
    }

    /// `reason` is stored under `outputs.skipReason` when provided (spec
    /// §4.3).
    async fn mark_step_skipped(&self, id: &str, reason: Option<String>) -> Result<()> {
        let outputs = reason.map(|r| serde_json::json!({ "skipReason": r }));
        self.set_terminal(id, "skipped", outputs, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_step_failed_normalizes_plain_string_error() {
        let record = ErrorRecord::from_value(Value::String("boom".to_string()));
        assert_eq!(record.code, "UNKNOWN_ERROR");
        assert_eq!(record.message, "boom");
    }

    #[test]
    fn mark_step_failed_preserves_extra_keys_on_object_errors() {
        let record = ErrorRecord::from_value(serde_json::json!({
            "message": "bad request",
            "code": "HTTP_ERROR",
            "status": 400
        }));
        assert_eq!(record.code, "HTTP_ERROR");
        assert_eq!(record.extra.get("status"), Some(&serde_json::json!(400)));
    }
}
