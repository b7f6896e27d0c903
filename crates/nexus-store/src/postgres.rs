//! PostgreSQL knowledge-store backend. See the facade in `store.rs` for
//! the contracts; this module is the production realization over sqlx.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, warn};

use nexus_shared::types::{
    Artifact, ArtifactKind, EvidenceKind, JobEnvelope, NewSource, OperationEvidence,
    OperationStatus, Provenance, ResearchTask, Source, Subtask, TaskOperation, TaskStatus,
};
use nexus_shared::validation::clip_title;
use nexus_shared::{NexusError, NexusResult};

use crate::store::PURGE_CONFIRMATION_TOKEN;

/// Process-wide PostgreSQL handle. Cheap to clone; all clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Initialize the connection pool and run migrations. Called once at
    /// process start.
    pub async fn connect(database_url: &str) -> NexusResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| NexusError::Store(format!("pool init failed: {e}")))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| NexusError::Store(format!("migration failed: {e}")))?;

        info!("knowledge store connected");
        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// True when at least one connection can execute a trivial round-trip.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Idempotent create-or-update of a task row.
    pub async fn upsert_task(&self, task: &ResearchTask) -> NexusResult<()> {
        sqlx::query(
            r#"
            INSERT INTO research_tasks
                (task_id, title, description, status, continuous_mode,
                 continuous_interval_hours, created_at, updated_at, completed_at,
                 metadata, results, summary, reasoning)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (task_id) DO UPDATE SET
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                status = EXCLUDED.status,
                continuous_mode = EXCLUDED.continuous_mode,
                continuous_interval_hours = EXCLUDED.continuous_interval_hours,
                updated_at = EXCLUDED.updated_at,
                completed_at = EXCLUDED.completed_at,
                metadata = EXCLUDED.metadata,
                results = EXCLUDED.results,
                summary = EXCLUDED.summary,
                reasoning = EXCLUDED.reasoning
            "#,
        )
        .bind(&task.task_id)
        .bind(clip_title(Some(&task.title)))
        .bind(&task.description)
        .bind(task.status.as_str())
        .bind(task.continuous_mode)
        .bind(task.continuous_interval_hours.map(|h| h as i32))
        .bind(task.created_at)
        .bind(Utc::now())
        .bind(task.completed_at)
        .bind(&task.metadata)
        .bind(&task.results)
        .bind(&task.summary)
        .bind(&task.reasoning)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    /// Create the task row from a queue envelope if it does not exist.
    /// Safe under duplicate delivery of the same task id.
    pub async fn ensure_task_from_envelope(&self, job: &JobEnvelope) -> NexusResult<ResearchTask> {
        if let Some(existing) = self.get_task(&job.task_id).await? {
            return Ok(existing);
        }
        let mut task = ResearchTask::new(job.title.clone(), job.description.clone());
        task.task_id = job.task_id.clone();
        task.continuous_mode = job.continuous_mode;
        task.continuous_interval_hours = job.continuous_interval_hours;
        self.upsert_task(&task).await?;
        debug!(task_id = %task.task_id, "created task row from envelope");
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &str) -> NexusResult<Option<ResearchTask>> {
        let row = sqlx::query("SELECT * FROM research_tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(task_from_row).transpose()
    }

    pub async fn list_tasks(&self, limit: i64) -> NexusResult<Vec<ResearchTask>> {
        let rows = sqlx::query("SELECT * FROM research_tasks ORDER BY created_at DESC LIMIT $1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.into_iter().map(task_from_row).collect()
    }

    /// Transition a task's status. Returns `false` (and writes nothing)
    /// when the task is already in a terminal state.
    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
    ) -> NexusResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE research_tasks
            SET status = $2, updated_at = $3
            WHERE task_id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(task_id)
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        let transitioned = result.rows_affected() > 0;
        if !transitioned {
            warn!(task_id, status = %status, "refused status transition out of terminal state");
        }
        Ok(transitioned)
    }

    /// Terminal success: persist stage outputs and stamp completion.
    pub async fn complete_task(
        &self,
        task_id: &str,
        results: Option<Value>,
        summary: Option<Value>,
        reasoning: Option<Value>,
    ) -> NexusResult<()> {
        sqlx::query(
            r#"
            UPDATE research_tasks
            SET status = 'completed', completed_at = $2, updated_at = $2,
                results = COALESCE($3, results),
                summary = COALESCE($4, summary),
                reasoning = COALESCE($5, reasoning)
            WHERE task_id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(task_id)
        .bind(Utc::now())
        .bind(results)
        .bind(summary)
        .bind(reasoning)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    /// Terminal failure: status `failed` with the error and its category
    /// recorded in task metadata.
    pub async fn fail_task(&self, task_id: &str, error: &str, category: &str) -> NexusResult<()> {
        sqlx::query(
            r#"
            UPDATE research_tasks
            SET status = 'failed', updated_at = $2,
                metadata = COALESCE(NULLIF(metadata, 'null'::jsonb), '{}'::jsonb)
                           || jsonb_build_object('error', $3::text, 'error_category', $4::text)
            WHERE task_id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(task_id)
        .bind(Utc::now())
        .bind(error)
        .bind(category)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    /// Record a non-terminal error in task metadata (retry bookkeeping).
    pub async fn record_task_error(&self, task_id: &str, error: &str) -> NexusResult<()> {
        sqlx::query(
            r#"
            UPDATE research_tasks
            SET updated_at = $2,
                metadata = COALESCE(NULLIF(metadata, 'null'::jsonb), '{}'::jsonb)
                           || jsonb_build_object('last_error', $3::text)
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .bind(Utc::now())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    // =========================================================================
    // Subtasks
    // =========================================================================

    pub async fn upsert_subtask(&self, subtask: &Subtask) -> NexusResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subtasks
                (subtask_id, task_id, parent_id, description, status,
                 assigned_agent, result, children, key_questions, data_sources, depth)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (subtask_id) DO UPDATE SET
                description = EXCLUDED.description,
                status = EXCLUDED.status,
                assigned_agent = EXCLUDED.assigned_agent,
                result = EXCLUDED.result,
                children = EXCLUDED.children,
                key_questions = EXCLUDED.key_questions,
                data_sources = EXCLUDED.data_sources,
                depth = EXCLUDED.depth
            "#,
        )
        .bind(&subtask.subtask_id)
        .bind(&subtask.task_id)
        .bind(&subtask.parent_id)
        .bind(&subtask.description)
        .bind(subtask.status.as_str())
        .bind(&subtask.assigned_agent)
        .bind(&subtask.result)
        .bind(serde_json::to_value(&subtask.children)?)
        .bind(serde_json::to_value(&subtask.key_questions)?)
        .bind(serde_json::to_value(&subtask.data_sources)?)
        .bind(subtask.depth as i32)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    pub async fn subtasks_for_task(&self, task_id: &str) -> NexusResult<Vec<Subtask>> {
        let rows = sqlx::query("SELECT * FROM subtasks WHERE task_id = $1 ORDER BY depth, subtask_id")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.into_iter().map(subtask_from_row).collect()
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Open a `running` operation row for a (task, stage) execution.
    pub async fn open_operation(&self, task_id: &str, stage: &str) -> NexusResult<TaskOperation> {
        let operation = TaskOperation::open(task_id, stage);
        sqlx::query(
            r#"
            INSERT INTO task_operations
                (operation_id, task_id, stage, status, started_at, counts, retry_marker)
            VALUES ($1, $2, $3, $4, $5, $6, 0)
            "#,
        )
        .bind(&operation.operation_id)
        .bind(&operation.task_id)
        .bind(&operation.stage)
        .bind(operation.status.as_str())
        .bind(operation.started_at)
        .bind(serde_json::to_value(&operation.counts)?)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(operation)
    }

    /// Most recent operation row for a (task, stage) pair.
    pub async fn find_operation(
        &self,
        task_id: &str,
        stage: &str,
    ) -> NexusResult<Option<TaskOperation>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM task_operations
            WHERE task_id = $1 AND stage = $2
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(task_id)
        .bind(stage)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(operation_from_row).transpose()
    }

    /// Whether a completed operation row exists for (task, stage) — the
    /// replay-safety check for at-least-once delivery.
    pub async fn stage_already_completed(&self, task_id: &str, stage: &str) -> NexusResult<bool> {
        Ok(self
            .find_operation(task_id, stage)
            .await?
            .map(|op| op.status == OperationStatus::Completed)
            .unwrap_or(false))
    }

    /// Close a running operation. Rejected once the row is final.
    pub async fn close_operation(
        &self,
        operation_id: &str,
        status: OperationStatus,
        error: Option<&str>,
        counts: &HashMap<String, i64>,
    ) -> NexusResult<()> {
        if !status.is_final() {
            return Err(NexusError::Store(
                "close_operation requires a final status".to_string(),
            ));
        }
        let result = sqlx::query(
            r#"
            UPDATE task_operations
            SET status = $2, ended_at = $3, error = $4, counts = $5
            WHERE operation_id = $1 AND status = 'running'
            "#,
        )
        .bind(operation_id)
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(error)
        .bind(serde_json::to_value(counts)?)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            return Err(NexusError::Store(format!(
                "operation {operation_id} is already final"
            )));
        }
        Ok(())
    }

    /// The single post-final write an operation row accepts: an idempotent
    /// retry marker. Repeating the call leaves the row unchanged.
    pub async fn mark_operation_retried(&self, operation_id: &str) -> NexusResult<()> {
        sqlx::query("UPDATE task_operations SET retry_marker = 1 WHERE operation_id = $1")
            .bind(operation_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    // =========================================================================
    // Evidence
    // =========================================================================

    /// Append-only; evidence is never updated or deleted outside purge.
    pub async fn append_evidence(&self, evidence: &OperationEvidence) -> NexusResult<()> {
        sqlx::query(
            r#"
            INSERT INTO operation_evidence
                (evidence_id, operation_id, kind, payload, source_url, provider,
                 retrieved_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&evidence.evidence_id)
        .bind(&evidence.operation_id)
        .bind(evidence.kind.as_str())
        .bind(&evidence.payload)
        .bind(&evidence.provenance.source_url)
        .bind(&evidence.provenance.provider)
        .bind(evidence.provenance.retrieved_at)
        .bind(evidence.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    pub async fn evidence_for_operation(
        &self,
        operation_id: &str,
    ) -> NexusResult<Vec<OperationEvidence>> {
        let rows = sqlx::query(
            "SELECT * FROM operation_evidence WHERE operation_id = $1 ORDER BY created_at",
        )
        .bind(operation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(evidence_from_row).collect()
    }

    // =========================================================================
    // Sources
    // =========================================================================

    /// Upsert by URL. Never inserts a duplicate row: an existing row keeps
    /// its title, gains any fields it was missing, keeps the longest
    /// extracted text, and advances `accessed_at`.
    pub async fn upsert_source(&self, new_source: NewSource) -> NexusResult<Source> {
        let incoming_title = new_source.title.as_deref().map(|t| clip_title(Some(t)));
        let source = new_source.into_source();

        let row = sqlx::query(
            r#"
            INSERT INTO sources
                (source_id, url, title, provider, accessed_at, content_hash, extracted_text)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (url) DO UPDATE SET
                title = CASE
                    WHEN sources.title = 'Untitled' AND $8::text IS NOT NULL THEN $8
                    ELSE sources.title
                END,
                provider = COALESCE(sources.provider, EXCLUDED.provider),
                content_hash = COALESCE(sources.content_hash, EXCLUDED.content_hash),
                extracted_text = CASE
                    WHEN EXCLUDED.extracted_text IS NOT NULL
                         AND (sources.extracted_text IS NULL
                              OR length(EXCLUDED.extracted_text) > length(sources.extracted_text))
                    THEN EXCLUDED.extracted_text
                    ELSE sources.extracted_text
                END,
                accessed_at = GREATEST(sources.accessed_at, EXCLUDED.accessed_at)
            RETURNING *
            "#,
        )
        .bind(&source.source_id)
        .bind(&source.url)
        .bind(&source.title)
        .bind(&source.provider)
        .bind(source.accessed_at)
        .bind(&source.content_hash)
        .bind(&source.extracted_text)
        .bind(incoming_title)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;

        source_from_row(row)
    }

    pub async fn get_source_by_url(&self, url: &str) -> NexusResult<Option<Source>> {
        let row = sqlx::query("SELECT * FROM sources WHERE url = $1")
            .bind(url)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(source_from_row).transpose()
    }

    pub async fn count_sources(&self) -> NexusResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sources")
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        row.try_get("n").map_err(store_err)
    }

    // =========================================================================
    // Artifacts
    // =========================================================================

    pub async fn create_artifact(&self, artifact: &Artifact) -> NexusResult<()> {
        sqlx::query(
            r#"
            INSERT INTO artifacts
                (artifact_id, task_id, title, kind, file_path, content, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (artifact_id) DO NOTHING
            "#,
        )
        .bind(&artifact.artifact_id)
        .bind(&artifact.task_id)
        .bind(&artifact.title)
        .bind(artifact.kind.as_str())
        .bind(&artifact.file_path)
        .bind(&artifact.content)
        .bind(artifact.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    pub async fn artifacts_for_task(&self, task_id: &str) -> NexusResult<Vec<Artifact>> {
        let rows = sqlx::query("SELECT * FROM artifacts WHERE task_id = $1 ORDER BY created_at")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.into_iter().map(artifact_from_row).collect()
    }

    // =========================================================================
    // Admin
    // =========================================================================

    /// Delete every row in every table. Refuses without the literal
    /// confirmation token.
    pub async fn purge_all(&self, confirmation_token: &str) -> NexusResult<()> {
        if confirmation_token != PURGE_CONFIRMATION_TOKEN {
            return Err(NexusError::ConfirmationRequired("store purge".to_string()));
        }
        // Order respects foreign keys
        for table in [
            "operation_evidence",
            "task_operations",
            "artifacts",
            "subtasks",
            "sources",
            "research_tasks",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
        }
        warn!("knowledge store purged");
        Ok(())
    }
}

fn store_err(err: sqlx::Error) -> NexusError {
    NexusError::Store(err.to_string())
}

// =============================================================================
// Row conversion
// =============================================================================

fn parse_task_status(raw: &str) -> NexusResult<TaskStatus> {
    TaskStatus::parse(raw).ok_or_else(|| NexusError::Store(format!("unknown task status {raw:?}")))
}

fn task_from_row(row: PgRow) -> NexusResult<ResearchTask> {
    let status: String = row.try_get("status").map_err(store_err)?;
    Ok(ResearchTask {
        task_id: row.try_get("task_id").map_err(store_err)?,
        title: row.try_get("title").map_err(store_err)?,
        description: row.try_get("description").map_err(store_err)?,
        status: parse_task_status(&status)?,
        continuous_mode: row.try_get("continuous_mode").map_err(store_err)?,
        continuous_interval_hours: row
            .try_get::<Option<i32>, _>("continuous_interval_hours")
            .map_err(store_err)?
            .map(|h| h as u32),
        created_at: row.try_get("created_at").map_err(store_err)?,
        updated_at: row.try_get("updated_at").map_err(store_err)?,
        completed_at: row.try_get("completed_at").map_err(store_err)?,
        metadata: row.try_get("metadata").map_err(store_err)?,
        results: row.try_get("results").map_err(store_err)?,
        summary: row.try_get("summary").map_err(store_err)?,
        reasoning: row.try_get("reasoning").map_err(store_err)?,
    })
}

fn subtask_from_row(row: PgRow) -> NexusResult<Subtask> {
    let status: String = row.try_get("status").map_err(store_err)?;
    let children: Value = row.try_get("children").map_err(store_err)?;
    let key_questions: Value = row.try_get("key_questions").map_err(store_err)?;
    let data_sources: Value = row.try_get("data_sources").map_err(store_err)?;
    Ok(Subtask {
        subtask_id: row.try_get("subtask_id").map_err(store_err)?,
        task_id: row.try_get("task_id").map_err(store_err)?,
        parent_id: row.try_get("parent_id").map_err(store_err)?,
        description: row.try_get("description").map_err(store_err)?,
        status: parse_task_status(&status)?,
        assigned_agent: row.try_get("assigned_agent").map_err(store_err)?,
        result: row.try_get("result").map_err(store_err)?,
        children: serde_json::from_value(children)?,
        key_questions: serde_json::from_value(key_questions)?,
        data_sources: serde_json::from_value(data_sources)?,
        depth: row.try_get::<i32, _>("depth").map_err(store_err)? as u32,
    })
}

fn operation_from_row(row: PgRow) -> NexusResult<TaskOperation> {
    let status: String = row.try_get("status").map_err(store_err)?;
    let counts: Value = row.try_get("counts").map_err(store_err)?;
    Ok(TaskOperation {
        operation_id: row.try_get("operation_id").map_err(store_err)?,
        task_id: row.try_get("task_id").map_err(store_err)?,
        stage: row.try_get("stage").map_err(store_err)?,
        status: OperationStatus::parse(&status)
            .ok_or_else(|| NexusError::Store(format!("unknown operation status {status:?}")))?,
        started_at: row.try_get("started_at").map_err(store_err)?,
        ended_at: row.try_get("ended_at").map_err(store_err)?,
        error: row.try_get("error").map_err(store_err)?,
        counts: serde_json::from_value(counts)?,
        retry_marker: row.try_get("retry_marker").map_err(store_err)?,
    })
}

fn evidence_from_row(row: PgRow) -> NexusResult<OperationEvidence> {
    let kind: String = row.try_get("kind").map_err(store_err)?;
    Ok(OperationEvidence {
        evidence_id: row.try_get("evidence_id").map_err(store_err)?,
        operation_id: row.try_get("operation_id").map_err(store_err)?,
        kind: EvidenceKind::parse(&kind)
            .ok_or_else(|| NexusError::Store(format!("unknown evidence kind {kind:?}")))?,
        payload: row.try_get("payload").map_err(store_err)?,
        provenance: Provenance {
            source_url: row.try_get("source_url").map_err(store_err)?,
            provider: row.try_get("provider").map_err(store_err)?,
            retrieved_at: row
                .try_get::<Option<DateTime<Utc>>, _>("retrieved_at")
                .map_err(store_err)?,
        },
        created_at: row.try_get("created_at").map_err(store_err)?,
    })
}

fn source_from_row(row: PgRow) -> NexusResult<Source> {
    Ok(Source {
        source_id: row.try_get("source_id").map_err(store_err)?,
        url: row.try_get("url").map_err(store_err)?,
        title: row.try_get("title").map_err(store_err)?,
        provider: row.try_get("provider").map_err(store_err)?,
        accessed_at: row.try_get("accessed_at").map_err(store_err)?,
        content_hash: row.try_get("content_hash").map_err(store_err)?,
        extracted_text: row.try_get("extracted_text").map_err(store_err)?,
    })
}

fn artifact_from_row(row: PgRow) -> NexusResult<Artifact> {
    let kind: String = row.try_get("kind").map_err(store_err)?;
    Ok(Artifact {
        artifact_id: row.try_get("artifact_id").map_err(store_err)?,
        task_id: row.try_get("task_id").map_err(store_err)?,
        title: row.try_get("title").map_err(store_err)?,
        kind: ArtifactKind::parse(&kind)
            .ok_or_else(|| NexusError::Store(format!("unknown artifact kind {kind:?}")))?,
        file_path: row.try_get("file_path").map_err(store_err)?,
        content: row.try_get("content").map_err(store_err)?,
        created_at: row.try_get("created_at").map_err(store_err)?,
    })
}
