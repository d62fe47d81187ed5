//! Database store for specs, workers, the delegation log and context entries
//!
//! Every statement is parameterized. Mutations that must not interleave with
//! other writers (spec creation by name, terminal transitions, the orphan
//! sweep) are expressed as a single conditional statement or a transaction so
//! SQLite's write lock is the serialization point.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{
    ContextEntry, DelegationEvent, EntryType, NewWorker, Registration, SmartContext, Spec,
    SpecSummary, Stats, Transition, Worker, WorkerFilter, WorkerResult, WorkerStatus, EXECUTOR_CODEX,
    EXECUTOR_TASK_AGENT,
};

const WORKER_COLUMNS: &str = "worker_id, spec_id, session_id, task_id, task_title, executor, status, \
     started_at, completed_at, result, summary, files_changed, commit_hash, duration_ms";

const SPEC_COLUMNS: &str =
    "spec_id, name, goal, phase, executor, branch, created_at, completed_at";

const CONTEXT_COLUMNS: &str =
    "entry_id, spec_id, worker_id, entry_type, content, tags, created_at";

/// Apply the embedded migrations
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| AppError::Internal(format!("Migration failed: {}", e)))
}

/// Database store
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // Spec operations

    /// Resolve a spec by name, creating it with `seed_id` if no spec has that name yet.
    ///
    /// Safe under concurrent callers: the unique index on `name` decides the
    /// winner and every caller reads back the same id.
    pub async fn upsert_spec(
        &self,
        name: &str,
        seed_id: &str,
        executor: Option<&str>,
    ) -> Result<String> {
        let mut tx = self.pool.begin().await?;
        let spec_id = upsert_spec_on(&mut *tx, name, seed_id, executor).await?;
        tx.commit().await?;
        Ok(spec_id)
    }

    /// Look a spec up by id or by name
    pub async fn get_spec(&self, id_or_name: &str) -> Result<Spec> {
        let row = sqlx::query_as::<_, SpecRow>(&format!(
            "SELECT {} FROM specs WHERE spec_id = ? OR name = ? LIMIT 1",
            SPEC_COLUMNS
        ))
        .bind(id_or_name)
        .bind(id_or_name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Spec {} not found", id_or_name)))?;

        Ok(row.into())
    }

    /// All specs with worker counts, newest first
    pub async fn list_specs(&self) -> Result<Vec<SpecSummary>> {
        let rows = sqlx::query_as::<_, SpecSummaryRow>(
            r#"
            SELECT
                s.spec_id, s.name, s.goal, s.phase, s.executor, s.branch, s.created_at, s.completed_at,
                COUNT(w.worker_id) AS total_workers,
                COUNT(CASE WHEN w.status = 'completed' THEN 1 END) AS completed_workers,
                COUNT(CASE WHEN w.status = 'failed' THEN 1 END) AS failed_workers,
                COUNT(CASE WHEN w.status = 'running' THEN 1 END) AS running_workers
            FROM specs s
            LEFT JOIN workers w ON s.spec_id = w.spec_id
            GROUP BY s.spec_id
            ORDER BY s.created_at DESC, s.rowid DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Stamp a spec's completion time. Completing twice keeps the first timestamp.
    pub async fn complete_spec(&self, id_or_name: &str) -> Result<Spec> {
        let updated = sqlx::query(
            r#"
            UPDATE specs SET completed_at = COALESCE(completed_at, ?)
            WHERE spec_id = ? OR name = ?
            "#,
        )
        .bind(Utc::now())
        .bind(id_or_name)
        .bind(id_or_name)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Spec {} not found", id_or_name)));
        }

        self.get_spec(id_or_name).await
    }

    // Worker operations

    /// Insert a worker in `running` under an existing spec. Returns `None` if the worker id is already known.
    pub async fn insert_worker(&self, spec_id: &str, worker: NewWorker) -> Result<Option<Worker>> {
        let mut conn = self.pool.acquire().await?;
        insert_worker_on(&mut *conn, spec_id, worker).await
    }

    /// Register a worker under the spec named `spec_name`, creating the spec on first use.
    ///
    /// The spec upsert and the worker insert share one transaction. A worker id
    /// that is already known rolls both back, so a repeated start never leaves a
    /// spec behind, and the existing worker is returned instead.
    pub async fn register_worker(
        &self,
        spec_name: &str,
        seed_id: &str,
        worker: NewWorker,
    ) -> Result<Registration> {
        let worker_id = worker.worker_id.clone();
        let mut tx = self.pool.begin().await?;

        let spec_id = upsert_spec_on(&mut *tx, spec_name, seed_id, Some(&worker.executor)).await?;
        match insert_worker_on(&mut *tx, &spec_id, worker).await? {
            Some(created) => {
                tx.commit().await?;
                Ok(Registration::Started(created))
            }
            None => {
                tx.rollback().await?;
                Ok(Registration::Duplicate(self.get_worker(&worker_id).await?))
            }
        }
    }

    pub async fn get_worker(&self, worker_id: &str) -> Result<Worker> {
        self.find_worker(worker_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Worker {} not found", worker_id)))
    }

    async fn find_worker(&self, worker_id: &str) -> Result<Option<Worker>> {
        sqlx::query_as::<_, WorkerRow>(&format!(
            "SELECT {} FROM workers WHERE worker_id = ?",
            WORKER_COLUMNS
        ))
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }

    /// Move a running worker to a terminal status.
    ///
    /// The `status = 'running'` guard makes this the serialization point for
    /// a worker: of two racing terminal writes exactly one applies.
    pub async fn transition_worker(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        fields: WorkerResult,
    ) -> Result<Transition> {
        if !status.is_terminal() {
            return Err(AppError::Validation(format!(
                "Cannot transition worker {} back to {}",
                worker_id,
                status.as_str()
            )));
        }

        let now = Utc::now();
        let files_changed = serde_json::to_string(&fields.files_changed)
            .map_err(|e| AppError::Internal(format!("Invalid files_changed: {}", e)))?;

        let updated = sqlx::query(
            r#"
            UPDATE workers SET
                status = ?,
                completed_at = ?,
                result = ?,
                summary = ?,
                files_changed = ?,
                commit_hash = ?,
                duration_ms = COALESCE(?, CAST((julianday(?) - julianday(started_at)) * 86400000 AS INTEGER))
            WHERE worker_id = ? AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(now)
        .bind(&fields.result)
        .bind(&fields.summary)
        .bind(files_changed)
        .bind(&fields.commit_hash)
        .bind(fields.duration_ms)
        .bind(now)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        let worker = self.find_worker(worker_id).await?;

        Ok(match worker {
            None => Transition::UnknownWorker,
            Some(w) if updated.rows_affected() == 1 => Transition::Applied(w),
            Some(w) => Transition::AlreadyTerminal(w),
        })
    }

    /// Fail every running worker in one statement. Returns the ids that were closed.
    pub async fn sweep_orphans(&self, result: &str) -> Result<Vec<String>> {
        let now = Utc::now();

        let swept: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE workers SET
                status = 'failed',
                completed_at = ?,
                result = ?,
                duration_ms = COALESCE(duration_ms, CAST((julianday(?) - julianday(started_at)) * 86400000 AS INTEGER))
            WHERE status = 'running'
            RETURNING worker_id
            "#,
        )
        .bind(now)
        .bind(result)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(swept)
    }

    /// Workers matching a filter, newest first
    pub async fn list_workers(&self, filter: &WorkerFilter) -> Result<Vec<Worker>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM workers WHERE 1=1", WORKER_COLUMNS));

        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(executor) = &filter.executor {
            qb.push(" AND executor = ").push_bind(executor.clone());
        }
        if let Some(spec_id) = &filter.spec_id {
            qb.push(" AND spec_id = ").push_bind(spec_id.clone());
        }
        qb.push(" ORDER BY started_at DESC, rowid DESC");

        let rows = qb
            .build_query_as::<WorkerRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Workers of a spec (by id or name), oldest first
    pub async fn workers_for_spec(&self, id_or_name: &str) -> Result<Vec<Worker>> {
        let rows = sqlx::query_as::<_, WorkerRow>(
            r#"
            SELECT w.worker_id, w.spec_id, w.session_id, w.task_id, w.task_title, w.executor, w.status,
                   w.started_at, w.completed_at, w.result, w.summary, w.files_changed, w.commit_hash, w.duration_ms
            FROM workers w
            JOIN specs s ON w.spec_id = s.spec_id
            WHERE s.spec_id = ? OR s.name = ?
            ORDER BY w.started_at ASC, w.rowid ASC
            "#,
        )
        .bind(id_or_name)
        .bind(id_or_name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn aggregate_stats(&self) -> Result<Stats> {
        let stats = sqlx::query_as::<_, Stats>(
            r#"
            SELECT
                COUNT(DISTINCT s.spec_id) AS total_specs,
                COUNT(DISTINCT CASE WHEN s.completed_at IS NOT NULL THEN s.spec_id END) AS completed_specs,
                COUNT(w.worker_id) AS total_workers,
                COUNT(CASE WHEN w.status = 'completed' THEN 1 END) AS completed_workers,
                COUNT(CASE WHEN w.status = 'failed' THEN 1 END) AS failed_workers,
                COUNT(CASE WHEN w.status = 'running' THEN 1 END) AS running_workers,
                AVG(w.duration_ms) AS avg_duration_ms,
                COUNT(CASE WHEN w.executor = ? THEN 1 END) AS codex_workers,
                COUNT(CASE WHEN w.executor = ? THEN 1 END) AS task_agent_workers
            FROM specs s
            LEFT JOIN workers w ON s.spec_id = w.spec_id
            "#,
        )
        .bind(EXECUTOR_CODEX)
        .bind(EXECUTOR_TASK_AGENT)
        .fetch_one(&self.pool)
        .await?;

        Ok(stats)
    }

    // Delegation log

    /// Append an audit record. The timestamp is assigned here.
    pub async fn append_event(
        &self,
        event: &str,
        spec_id: Option<&str>,
        worker_id: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<DelegationEvent> {
        let now = Utc::now();
        let data = payload.to_string();

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO delegation_log (spec_id, worker_id, event, data, timestamp)
            VALUES (?, ?, ?, ?, ?)
            RETURNING seq
            "#,
        )
        .bind(spec_id)
        .bind(worker_id)
        .bind(event)
        .bind(&data)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(DelegationEvent {
            id,
            event: event.to_string(),
            spec_id: spec_id.map(String::from),
            worker_id: worker_id.map(String::from),
            payload: payload.clone(),
            timestamp: now,
        })
    }

    /// Most recent events first; ties keep reverse insertion order
    pub async fn list_events(
        &self,
        spec_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<DelegationEvent>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT seq, spec_id, worker_id, event, data, timestamp FROM delegation_log",
        );
        if let Some(spec_id) = spec_id {
            qb.push(" WHERE spec_id = ").push_bind(spec_id.to_string());
        }
        qb.push(" ORDER BY timestamp DESC, seq DESC LIMIT ")
            .push_bind(limit);

        let rows = qb
            .build_query_as::<EventRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    // Context entries

    pub async fn add_context_entry(
        &self,
        spec_id: &str,
        entry_type: EntryType,
        content: &str,
        worker_id: Option<&str>,
        tags: &[String],
    ) -> Result<ContextEntry> {
        let exists: Option<String> = sqlx::query_scalar("SELECT spec_id FROM specs WHERE spec_id = ?")
            .bind(spec_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(AppError::NotFound(format!("Spec {} not found", spec_id)));
        }

        let entry_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let tags_json = serde_json::to_string(tags)
            .map_err(|e| AppError::Internal(format!("Invalid tags: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO context_entries (entry_id, spec_id, worker_id, entry_type, content, tags, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry_id)
        .bind(spec_id)
        .bind(worker_id)
        .bind(entry_type.as_str())
        .bind(content)
        .bind(tags_json)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(ContextEntry {
            entry_id,
            spec_id: spec_id.to_string(),
            worker_id: worker_id.map(String::from),
            entry_type,
            content: content.to_string(),
            tags: tags.to_vec(),
            created_at: now,
        })
    }

    /// All entries for a spec, newest first
    pub async fn context_for_spec(&self, spec_id: &str) -> Result<Vec<ContextEntry>> {
        self.query_context(spec_id, None, None).await
    }

    pub async fn context_by_type(
        &self,
        spec_id: &str,
        entry_type: EntryType,
    ) -> Result<Vec<ContextEntry>> {
        self.query_context(spec_id, Some(entry_type), None).await
    }

    pub async fn recent_decisions(&self, spec_id: &str, limit: i64) -> Result<Vec<ContextEntry>> {
        self.query_context(spec_id, Some(EntryType::Decision), Some(limit))
            .await
    }

    pub async fn blockers(&self, spec_id: &str) -> Result<Vec<ContextEntry>> {
        self.context_by_type(spec_id, EntryType::Blocker).await
    }

    pub async fn smart_context(&self, spec_id: &str) -> Result<SmartContext> {
        let (decisions, blockers, learnings, handoffs) = tokio::try_join!(
            self.context_by_type(spec_id, EntryType::Decision),
            self.context_by_type(spec_id, EntryType::Blocker),
            self.context_by_type(spec_id, EntryType::Learning),
            self.context_by_type(spec_id, EntryType::Handoff),
        )?;

        Ok(SmartContext {
            decisions,
            blockers,
            learnings,
            handoffs,
        })
    }

    async fn query_context(
        &self,
        spec_id: &str,
        entry_type: Option<EntryType>,
        limit: Option<i64>,
    ) -> Result<Vec<ContextEntry>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM context_entries WHERE spec_id = ",
            CONTEXT_COLUMNS
        ));
        qb.push_bind(spec_id.to_string());
        if let Some(entry_type) = entry_type {
            qb.push(" AND entry_type = ").push_bind(entry_type.as_str());
        }
        qb.push(" ORDER BY created_at DESC, rowid DESC");
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(limit);
        }

        let rows = qb
            .build_query_as::<ContextRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

// Statements shared by pool-level calls and transactions

async fn upsert_spec_on(
    conn: &mut SqliteConnection,
    name: &str,
    seed_id: &str,
    executor: Option<&str>,
) -> Result<String> {
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT OR IGNORE INTO specs (spec_id, name, executor, created_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(seed_id)
    .bind(name)
    .bind(executor)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let existing: Option<String> = sqlx::query_scalar("SELECT spec_id FROM specs WHERE name = ?")
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;

    if let Some(id) = existing {
        return Ok(id);
    }

    // The seed id already belongs to a spec with another name
    let id = Uuid::new_v4().to_string();
    tracing::debug!(name, seed_id, %id, "spec id taken, using generated id");
    sqlx::query(
        r#"
        INSERT INTO specs (spec_id, name, executor, created_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(name)
    .bind(executor)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(id)
}

async fn insert_worker_on(
    conn: &mut SqliteConnection,
    spec_id: &str,
    worker: NewWorker,
) -> Result<Option<Worker>> {
    let now = Utc::now();

    let inserted = sqlx::query(
        r#"
        INSERT INTO workers (worker_id, spec_id, session_id, task_id, task_title, executor, status, started_at)
        VALUES (?, ?, ?, ?, ?, ?, 'running', ?)
        ON CONFLICT(worker_id) DO NOTHING
        "#,
    )
    .bind(&worker.worker_id)
    .bind(spec_id)
    .bind(&worker.session_id)
    .bind(&worker.task_id)
    .bind(&worker.task_title)
    .bind(&worker.executor)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    if inserted.rows_affected() == 0 {
        return Ok(None);
    }

    Ok(Some(Worker {
        worker_id: worker.worker_id,
        spec_id: spec_id.to_string(),
        session_id: worker.session_id,
        task_id: worker.task_id,
        task_title: worker.task_title,
        executor: worker.executor,
        status: WorkerStatus::Running,
        started_at: now,
        completed_at: None,
        result: None,
        summary: None,
        files_changed: Vec::new(),
        commit_hash: None,
        duration_ms: None,
    }))
}

// Internal row types for sqlx

#[derive(sqlx::FromRow)]
struct SpecRow {
    spec_id: String,
    name: String,
    goal: Option<String>,
    phase: Option<String>,
    executor: Option<String>,
    branch: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<SpecRow> for Spec {
    fn from(row: SpecRow) -> Self {
        Spec {
            spec_id: row.spec_id,
            name: row.name,
            goal: row.goal,
            phase: row.phase,
            executor: row.executor,
            branch: row.branch,
            created_at: row.created_at,
            completed_at: row.completed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SpecSummaryRow {
    #[sqlx(flatten)]
    spec: SpecRow,
    total_workers: i64,
    completed_workers: i64,
    failed_workers: i64,
    running_workers: i64,
}

impl From<SpecSummaryRow> for SpecSummary {
    fn from(row: SpecSummaryRow) -> Self {
        SpecSummary {
            spec: row.spec.into(),
            total_workers: row.total_workers,
            completed_workers: row.completed_workers,
            failed_workers: row.failed_workers,
            running_workers: row.running_workers,
        }
    }
}

#[derive(sqlx::FromRow)]
struct WorkerRow {
    worker_id: String,
    spec_id: String,
    session_id: Option<String>,
    task_id: String,
    task_title: Option<String>,
    executor: String,
    status: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    result: Option<String>,
    summary: Option<String>,
    files_changed: String,
    commit_hash: Option<String>,
    duration_ms: Option<i64>,
}

impl TryFrom<WorkerRow> for Worker {
    type Error = AppError;

    fn try_from(row: WorkerRow) -> Result<Self> {
        Ok(Worker {
            status: row
                .status
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid status: {}", e)))?,
            files_changed: serde_json::from_str(&row.files_changed)
                .map_err(|e| AppError::Internal(format!("Invalid files_changed: {}", e)))?,
            worker_id: row.worker_id,
            spec_id: row.spec_id,
            session_id: row.session_id,
            task_id: row.task_id,
            task_title: row.task_title,
            executor: row.executor,
            started_at: row.started_at,
            completed_at: row.completed_at,
            result: row.result,
            summary: row.summary,
            commit_hash: row.commit_hash,
            duration_ms: row.duration_ms,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    seq: i64,
    spec_id: Option<String>,
    worker_id: Option<String>,
    event: String,
    data: String,
    timestamp: DateTime<Utc>,
}

impl TryFrom<EventRow> for DelegationEvent {
    type Error = AppError;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(DelegationEvent {
            id: row.seq,
            event: row.event,
            spec_id: row.spec_id,
            worker_id: row.worker_id,
            payload: serde_json::from_str(&row.data)
                .map_err(|e| AppError::Internal(format!("Invalid event data: {}", e)))?,
            timestamp: row.timestamp,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ContextRow {
    entry_id: String,
    spec_id: String,
    worker_id: Option<String>,
    entry_type: String,
    content: String,
    tags: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ContextRow> for ContextEntry {
    type Error = AppError;

    fn try_from(row: ContextRow) -> Result<Self> {
        Ok(ContextEntry {
            entry_type: row
                .entry_type
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid entry type: {}", e)))?,
            tags: serde_json::from_str(&row.tags)
                .map_err(|e| AppError::Internal(format!("Invalid tags: {}", e)))?,
            entry_id: row.entry_id,
            spec_id: row.spec_id,
            worker_id: row.worker_id,
            content: row.content,
            created_at: row.created_at,
        })
    }
}
