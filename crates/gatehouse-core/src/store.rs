//! SQLite store of record.
//!
//! [`Store`] owns the connection. Row-level helpers are free functions taking
//! `&Connection` so they compose inside one [`Store::write`] transaction.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};

use crate::definitions::{CheckpointDefinition, FailureAction};
use crate::types::{
    ArchivedItem, ArchivedItemType, Artifact, ArtifactFormat, CheckpointExecution, Event,
    ExecutionLog, ExecutionStatus, Interaction, InteractionKind, LogLevel, PipelineRun,
    RollbackEvent, RollbackKind, RollbackTrigger, RunStatus,
};
use crate::{GatehouseError, Result};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// Thread-safe handle on the pipeline's SQLite database.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and run pending migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let mut store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let mut store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&mut self) -> Result<()> {
        let conn = self.conn.get_mut();
        embedded::migrations::runner()
            .run(conn)
            .map_err(|e| GatehouseError::Migration(e.to_string()))?;
        Ok(())
    }

    /// Run read-only queries.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside a transaction. Commits on `Ok`, rolls back on `Err`.
    pub fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

// ── Conversions ─────────────────────────────────────────────────────

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

fn dt_str(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn opt_dt_str(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(dt_str)
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn opt_dt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<String>>(idx)?.map(|s| parse_dt(&s)))
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

/// Read a TEXT column holding one of the engine's enum spellings.
fn enum_col<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_error(idx, format!("unknown value '{raw}'")))
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e.to_string()))
}

fn opt_json_col<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| conversion_error(idx, e.to_string())),
        None => Ok(None),
    }
}

// ── Runs ────────────────────────────────────────────────────────────

const RUN_COLUMNS: &str = "id, pipeline_id, run_version, status, current_checkpoint_id,
    current_position, previous_run_id, extends_from_run_version, definition_version,
    checkpoint_order, created_at, started_at, paused_at, last_resumed_at, completed_at, failed_at";

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<PipelineRun> {
    Ok(PipelineRun {
        id: row.get(0)?,
        pipeline_id: row.get(1)?,
        run_version: row.get(2)?,
        status: enum_col(row, 3, RunStatus::parse)?,
        current_checkpoint_id: row.get(4)?,
        current_position: row.get(5)?,
        previous_run_id: row.get(6)?,
        extends_from_run_version: row.get(7)?,
        definition_version: row.get(8)?,
        checkpoint_order: json_col(row, 9)?,
        created_at: parse_dt(&row.get::<_, String>(10)?),
        started_at: opt_dt(row, 11)?,
        paused_at: opt_dt(row, 12)?,
        last_resumed_at: opt_dt(row, 13)?,
        completed_at: opt_dt(row, 14)?,
        failed_at: opt_dt(row, 15)?,
    })
}

pub fn insert_run(conn: &Connection, run: &PipelineRun) -> Result<()> {
    conn.execute(
        "INSERT INTO runs (id, pipeline_id, run_version, status, current_checkpoint_id,
            current_position, previous_run_id, extends_from_run_version, definition_version,
            checkpoint_order, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            run.id,
            run.pipeline_id,
            run.run_version,
            run.status.as_str(),
            run.current_checkpoint_id,
            run.current_position,
            run.previous_run_id,
            run.extends_from_run_version,
            run.definition_version,
            serde_json::to_string(&run.checkpoint_order)?,
            dt_str(&run.created_at),
        ],
    )?;
    Ok(())
}

/// Persist the mutable part of a run row.
pub fn update_run(conn: &Connection, run: &PipelineRun) -> Result<()> {
    let changed = conn.execute(
        "UPDATE runs SET status = ?2, current_checkpoint_id = ?3, current_position = ?4,
            started_at = ?5, paused_at = ?6, last_resumed_at = ?7, completed_at = ?8,
            failed_at = ?9
         WHERE id = ?1",
        params![
            run.id,
            run.status.as_str(),
            run.current_checkpoint_id,
            run.current_position,
            opt_dt_str(&run.started_at),
            opt_dt_str(&run.paused_at),
            opt_dt_str(&run.last_resumed_at),
            opt_dt_str(&run.completed_at),
            opt_dt_str(&run.failed_at),
        ],
    )?;
    if changed == 0 {
        return Err(GatehouseError::not_found("run", &run.id));
    }
    Ok(())
}

pub fn get_run(conn: &Connection, id: &str) -> Result<PipelineRun> {
    conn.query_row(
        &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
        params![id],
        row_to_run,
    )
    .optional()?
    .ok_or_else(|| GatehouseError::not_found("run", id))
}

pub fn find_run_by_version(
    conn: &Connection,
    pipeline_id: &str,
    run_version: i64,
) -> Result<Option<PipelineRun>> {
    Ok(conn
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE pipeline_id = ?1 AND run_version = ?2"),
            params![pipeline_id, run_version],
            row_to_run,
        )
        .optional()?)
}

/// All runs of a pipeline, lowest version first.
pub fn list_runs(conn: &Connection, pipeline_id: &str) -> Result<Vec<PipelineRun>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RUN_COLUMNS} FROM runs WHERE pipeline_id = ?1 ORDER BY run_version"
    ))?;
    let rows = stmt.query_map(params![pipeline_id], row_to_run)?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

pub fn max_run_version(conn: &Connection, pipeline_id: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(run_version), 0) FROM runs WHERE pipeline_id = ?1",
        params![pipeline_id],
        |row| row.get(0),
    )?)
}

/// Highest-version run not recorded as deleted by any rollback.
pub fn latest_valid_run(conn: &Connection, pipeline_id: &str) -> Result<Option<PipelineRun>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {RUN_COLUMNS} FROM runs
                 WHERE pipeline_id = ?1
                   AND id NOT IN (SELECT item_id FROM archived_items WHERE item_type = 'run')
                 ORDER BY run_version DESC LIMIT 1"
            ),
            params![pipeline_id],
            row_to_run,
        )
        .optional()?)
}

pub fn delete_run(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM runs WHERE id = ?1", params![id])?;
    Ok(())
}

// ── Executions ──────────────────────────────────────────────────────

const EXECUTION_COLUMNS: &str = "id, run_id, checkpoint_id, checkpoint_name, checkpoint_position,
    status, attempt_number, revision_iteration, temp_workspace_path, permanent_output_path,
    form_data, last_error, failure_action, created_at, started_at, completed_at, failed_at";

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<CheckpointExecution> {
    Ok(CheckpointExecution {
        id: row.get(0)?,
        run_id: row.get(1)?,
        checkpoint_id: row.get(2)?,
        checkpoint_name: row.get(3)?,
        checkpoint_position: row.get(4)?,
        status: enum_col(row, 5, ExecutionStatus::parse)?,
        attempt_number: row.get(6)?,
        revision_iteration: row.get(7)?,
        temp_workspace_path: PathBuf::from(row.get::<_, String>(8)?),
        permanent_output_path: PathBuf::from(row.get::<_, String>(9)?),
        form_data: opt_json_col(row, 10)?,
        last_error: row.get(11)?,
        failure_action: row
            .get::<_, Option<String>>(12)?
            .and_then(|s| FailureAction::parse(&s)),
        created_at: parse_dt(&row.get::<_, String>(13)?),
        started_at: opt_dt(row, 14)?,
        completed_at: opt_dt(row, 15)?,
        failed_at: opt_dt(row, 16)?,
    })
}

pub fn insert_execution(
    conn: &Connection,
    execution: &CheckpointExecution,
    snapshot: &CheckpointDefinition,
) -> Result<()> {
    conn.execute(
        "INSERT INTO executions (id, run_id, checkpoint_id, checkpoint_name, checkpoint_position,
            checkpoint_snapshot, status, attempt_number, revision_iteration, temp_workspace_path,
            permanent_output_path, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            execution.id,
            execution.run_id,
            execution.checkpoint_id,
            execution.checkpoint_name,
            execution.checkpoint_position,
            serde_json::to_string(snapshot)?,
            execution.status.as_str(),
            execution.attempt_number,
            execution.revision_iteration,
            path_str(&execution.temp_workspace_path),
            path_str(&execution.permanent_output_path),
            dt_str(&execution.created_at),
        ],
    )?;
    Ok(())
}

/// Persist the mutable part of an execution row.
pub fn update_execution(conn: &Connection, execution: &CheckpointExecution) -> Result<()> {
    let form_data = execution
        .form_data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let changed = conn.execute(
        "UPDATE executions SET status = ?2, attempt_number = ?3, revision_iteration = ?4,
            form_data = ?5, last_error = ?6, failure_action = ?7, started_at = ?8,
            completed_at = ?9, failed_at = ?10
         WHERE id = ?1",
        params![
            execution.id,
            execution.status.as_str(),
            execution.attempt_number,
            execution.revision_iteration,
            form_data,
            execution.last_error,
            execution.failure_action.map(|a| a.as_str()),
            opt_dt_str(&execution.started_at),
            opt_dt_str(&execution.completed_at),
            opt_dt_str(&execution.failed_at),
        ],
    )?;
    if changed == 0 {
        return Err(GatehouseError::not_found("execution", &execution.id));
    }
    Ok(())
}

pub fn get_execution(conn: &Connection, id: &str) -> Result<CheckpointExecution> {
    conn.query_row(
        &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
        params![id],
        row_to_execution,
    )
    .optional()?
    .ok_or_else(|| GatehouseError::not_found("execution", id))
}

/// Checkpoint definition captured when the execution was created.
pub fn execution_snapshot(conn: &Connection, id: &str) -> Result<CheckpointDefinition> {
    let raw: String = conn
        .query_row(
            "SELECT checkpoint_snapshot FROM executions WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| GatehouseError::not_found("execution", id))?;
    Ok(serde_json::from_str(&raw)?)
}

pub fn find_execution_at(
    conn: &Connection,
    run_id: &str,
    position: i64,
) -> Result<Option<CheckpointExecution>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {EXECUTION_COLUMNS} FROM executions
                 WHERE run_id = ?1 AND checkpoint_position = ?2"
            ),
            params![run_id, position],
            row_to_execution,
        )
        .optional()?)
}

/// Latest completed execution of a checkpoint within a run.
pub fn find_completed_execution(
    conn: &Connection,
    run_id: &str,
    checkpoint_id: &str,
) -> Result<Option<CheckpointExecution>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {EXECUTION_COLUMNS} FROM executions
                 WHERE run_id = ?1 AND checkpoint_id = ?2 AND status = 'completed'
                 ORDER BY checkpoint_position DESC LIMIT 1"
            ),
            params![run_id, checkpoint_id],
            row_to_execution,
        )
        .optional()?)
}

/// Executions of a run, lowest position first.
pub fn list_executions(conn: &Connection, run_id: &str) -> Result<Vec<CheckpointExecution>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM executions WHERE run_id = ?1 ORDER BY checkpoint_position"
    ))?;
    let rows = stmt.query_map(params![run_id], row_to_execution)?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

/// The execution with the highest position in a run.
pub fn current_execution(conn: &Connection, run_id: &str) -> Result<Option<CheckpointExecution>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {EXECUTION_COLUMNS} FROM executions
                 WHERE run_id = ?1 ORDER BY checkpoint_position DESC LIMIT 1"
            ),
            params![run_id],
            row_to_execution,
        )
        .optional()?)
}

pub fn count_completed(conn: &Connection, run_id: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM executions WHERE run_id = ?1 AND status = 'completed'",
        params![run_id],
        |row| row.get(0),
    )?)
}

pub fn delete_execution(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM executions WHERE id = ?1", params![id])?;
    Ok(())
}

// ── Artifacts ───────────────────────────────────────────────────────

const ARTIFACT_COLUMNS: &str = "id, execution_id, run_id, name, format, size_bytes, checksum,
    staged_path, promoted_path, promoted_at, created_at, updated_at";

fn row_to_artifact(row: &Row<'_>) -> rusqlite::Result<Artifact> {
    Ok(Artifact {
        id: row.get(0)?,
        execution_id: row.get(1)?,
        run_id: row.get(2)?,
        name: row.get(3)?,
        format: enum_col(row, 4, ArtifactFormat::parse)?,
        size_bytes: row.get(5)?,
        checksum: row.get(6)?,
        staged_path: PathBuf::from(row.get::<_, String>(7)?),
        promoted_path: row.get::<_, Option<String>>(8)?.map(PathBuf::from),
        promoted_at: opt_dt(row, 9)?,
        created_at: parse_dt(&row.get::<_, String>(10)?),
        updated_at: parse_dt(&row.get::<_, String>(11)?),
    })
}

/// Insert a staged artifact, or overwrite the staged copy with the same id.
///
/// Overwriting clears any promotion fields, so a re-staged artifact is
/// unpromoted until the next approval.
pub fn upsert_staged_artifact(
    conn: &Connection,
    artifact: &Artifact,
    content: &[u8],
) -> Result<()> {
    conn.execute(
        "INSERT INTO artifacts (id, execution_id, run_id, name, format, size_bytes, checksum,
            content, staged_path, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(execution_id, id) DO UPDATE SET
            name = excluded.name, format = excluded.format, size_bytes = excluded.size_bytes,
            checksum = excluded.checksum, content = excluded.content,
            staged_path = excluded.staged_path, promoted_path = NULL, promoted_at = NULL,
            updated_at = excluded.updated_at",
        params![
            artifact.id,
            artifact.execution_id,
            artifact.run_id,
            artifact.name,
            artifact.format.as_str(),
            artifact.size_bytes,
            artifact.checksum,
            content,
            path_str(&artifact.staged_path),
            dt_str(&artifact.created_at),
            dt_str(&artifact.updated_at),
        ],
    )?;
    Ok(())
}

pub fn mark_promoted(
    conn: &Connection,
    execution_id: &str,
    artifact_id: &str,
    promoted_path: &Path,
    size_bytes: i64,
    checksum: &str,
    at: &DateTime<Utc>,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE artifacts SET promoted_path = ?3, size_bytes = ?4, checksum = ?5,
            promoted_at = ?6, updated_at = ?6
         WHERE execution_id = ?1 AND id = ?2",
        params![
            execution_id,
            artifact_id,
            path_str(promoted_path),
            size_bytes,
            checksum,
            dt_str(at),
        ],
    )?;
    if changed == 0 {
        return Err(GatehouseError::not_found("artifact", artifact_id));
    }
    Ok(())
}

/// Delete a staged artifact that was never promoted.
pub fn delete_staged_artifact(conn: &Connection, execution_id: &str, id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM artifacts
         WHERE execution_id = ?1 AND id = ?2 AND promoted_path IS NULL",
        params![execution_id, id],
    )?;
    Ok(())
}

pub fn list_artifacts(conn: &Connection, execution_id: &str) -> Result<Vec<Artifact>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE execution_id = ?1 ORDER BY id"
    ))?;
    let rows = stmt.query_map(params![execution_id], row_to_artifact)?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

pub fn list_run_artifacts(conn: &Connection, run_id: &str) -> Result<Vec<Artifact>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE run_id = ?1 ORDER BY execution_id, id"
    ))?;
    let rows = stmt.query_map(params![run_id], row_to_artifact)?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

/// Promoted artifacts of the execution at `position` in a run.
pub fn promoted_artifacts_at(
    conn: &Connection,
    run_id: &str,
    position: i64,
) -> Result<Vec<Artifact>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM artifacts a
         JOIN executions e ON e.id = a.execution_id
         WHERE e.run_id = ?1 AND e.checkpoint_position = ?2 AND a.promoted_at IS NOT NULL
         ORDER BY a.id",
        prefixed(ARTIFACT_COLUMNS, "a")
    ))?;
    let rows = stmt.query_map(params![run_id, position], row_to_artifact)?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

pub fn artifact_content(
    conn: &Connection,
    execution_id: &str,
    artifact_id: &str,
) -> Result<Vec<u8>> {
    conn.query_row(
        "SELECT content FROM artifacts WHERE execution_id = ?1 AND id = ?2",
        params![execution_id, artifact_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| GatehouseError::not_found("artifact", artifact_id))
}

/// Qualify a comma-separated column list with a table alias.
fn prefixed(columns: &str, alias: &str) -> String {
    columns
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Audit trail ─────────────────────────────────────────────────────

pub fn insert_interaction(
    conn: &Connection,
    execution_id: &str,
    kind: InteractionKind,
    feedback: Option<&str>,
    payload: Option<&serde_json::Value>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO interactions (id, execution_id, kind, feedback, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            uuid::Uuid::new_v4().to_string(),
            execution_id,
            kind.as_str(),
            feedback,
            payload.map(serde_json::to_string).transpose()?,
            now_str(),
        ],
    )?;
    Ok(())
}

pub fn list_interactions(conn: &Connection, execution_id: &str) -> Result<Vec<Interaction>> {
    let mut stmt = conn.prepare(
        "SELECT id, execution_id, kind, feedback, payload, created_at
         FROM interactions WHERE execution_id = ?1 ORDER BY created_at, rowid",
    )?;
    let rows = stmt.query_map(params![execution_id], |row| {
        Ok(Interaction {
            id: row.get(0)?,
            execution_id: row.get(1)?,
            kind: enum_col(row, 2, InteractionKind::parse)?,
            feedback: row.get(3)?,
            payload: opt_json_col(row, 4)?,
            created_at: parse_dt(&row.get::<_, String>(5)?),
        })
    })?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

pub fn insert_log(
    conn: &Connection,
    execution_id: &str,
    level: LogLevel,
    message: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO execution_logs (execution_id, level, message, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![execution_id, level.as_str(), message, now_str()],
    )?;
    Ok(())
}

pub fn list_logs(conn: &Connection, execution_id: &str) -> Result<Vec<ExecutionLog>> {
    let mut stmt = conn.prepare(
        "SELECT id, execution_id, level, message, created_at
         FROM execution_logs WHERE execution_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![execution_id], |row| {
        Ok(ExecutionLog {
            id: row.get(0)?,
            execution_id: row.get(1)?,
            level: enum_col(row, 2, LogLevel::parse)?,
            message: row.get(3)?,
            created_at: parse_dt(&row.get::<_, String>(4)?),
        })
    })?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

pub fn insert_event(
    conn: &Connection,
    run_id: Option<&str>,
    kind: &str,
    description: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO events (run_id, kind, description, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![run_id, kind, description, now_str()],
    )?;
    Ok(())
}

/// Events for one run, or all events when `run_id` is `None`. Oldest first.
pub fn list_events(conn: &Connection, run_id: Option<&str>) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT id, run_id, kind, description, created_at FROM events
         WHERE ?1 IS NULL OR run_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![run_id], |row| {
        Ok(Event {
            id: row.get(0)?,
            run_id: row.get(1)?,
            kind: row.get(2)?,
            description: row.get(3)?,
            created_at: parse_dt(&row.get::<_, String>(4)?),
        })
    })?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

// ── Rollback records ────────────────────────────────────────────────

pub fn insert_rollback_event(conn: &Connection, event: &RollbackEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO rollback_events (id, kind, source_run_id, source_run_version, target_run_id,
            target_checkpoint_id, target_position, archive_location, triggered_by, reason,
            rolled_back_items, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            event.id,
            event.kind.as_str(),
            event.source_run_id,
            event.source_run_version,
            event.target_run_id,
            event.target_checkpoint_id,
            event.target_position,
            path_str(&event.archive_location),
            event.triggered_by.as_str(),
            event.reason,
            serde_json::to_string(&event.items)?,
            dt_str(&event.created_at),
        ],
    )?;
    Ok(())
}

/// Rollback events, newest first. With `run_id`, only events whose source or
/// target is that run.
pub fn list_rollback_events(conn: &Connection, run_id: Option<&str>) -> Result<Vec<RollbackEvent>> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, source_run_id, source_run_version, target_run_id, target_checkpoint_id,
            target_position, archive_location, triggered_by, reason, rolled_back_items, created_at
         FROM rollback_events
         WHERE ?1 IS NULL OR source_run_id = ?1 OR target_run_id = ?1
         ORDER BY created_at DESC, rowid DESC",
    )?;
    let rows = stmt.query_map(params![run_id], |row| {
        Ok(RollbackEvent {
            id: row.get(0)?,
            kind: enum_col(row, 1, RollbackKind::parse)?,
            source_run_id: row.get(2)?,
            source_run_version: row.get(3)?,
            target_run_id: row.get(4)?,
            target_checkpoint_id: row.get(5)?,
            target_position: row.get(6)?,
            archive_location: PathBuf::from(row.get::<_, String>(7)?),
            triggered_by: enum_col(row, 8, RollbackTrigger::parse)?,
            reason: row.get(9)?,
            items: json_col(row, 10)?,
            created_at: parse_dt(&row.get::<_, String>(11)?),
        })
    })?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

pub fn insert_archived_item(conn: &Connection, item: &ArchivedItem) -> Result<()> {
    conn.execute(
        "INSERT INTO archived_items (rollback_id, item_type, item_id, original_path,
            archived_path, size_bytes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            item.rollback_id,
            item.item_type.as_str(),
            item.item_id,
            path_str(&item.original_path),
            path_str(&item.archived_path),
            item.size_bytes,
            now_str(),
        ],
    )?;
    Ok(())
}

pub fn list_archived_items(conn: &Connection, rollback_id: &str) -> Result<Vec<ArchivedItem>> {
    let mut stmt = conn.prepare(
        "SELECT rollback_id, item_type, item_id, original_path, archived_path, size_bytes
         FROM archived_items WHERE rollback_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![rollback_id], |row| {
        Ok(ArchivedItem {
            rollback_id: row.get(0)?,
            item_type: enum_col(row, 1, ArchivedItemType::parse)?,
            item_id: row.get(2)?,
            original_path: PathBuf::from(row.get::<_, String>(3)?),
            archived_path: PathBuf::from(row.get::<_, String>(4)?),
            size_bytes: row.get(5)?,
        })
    })?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RolledBackItems, RunStatus};

    pub(crate) fn sample_run(id: &str, version: i64) -> PipelineRun {
        PipelineRun {
            id: id.to_string(),
            pipeline_id: "p".into(),
            run_version: version,
            status: RunStatus::NotStarted,
            current_checkpoint_id: None,
            current_position: None,
            previous_run_id: None,
            extends_from_run_version: None,
            definition_version: 1,
            checkpoint_order: vec!["a".into(), "b".into()],
            created_at: Utc::now(),
            started_at: None,
            paused_at: None,
            last_resumed_at: None,
            completed_at: None,
            failed_at: None,
        }
    }

    fn sample_execution(id: &str, run_id: &str, position: i64) -> CheckpointExecution {
        CheckpointExecution {
            id: id.to_string(),
            run_id: run_id.to_string(),
            checkpoint_id: "a".into(),
            checkpoint_name: "a".into(),
            checkpoint_position: position,
            status: ExecutionStatus::Pending,
            attempt_number: 1,
            revision_iteration: 0,
            temp_workspace_path: PathBuf::from(format!(".temp/exec_{id}")),
            permanent_output_path: PathBuf::from("runs/v1/checkpoint_0_a/outputs"),
            form_data: None,
            last_error: None,
            failure_action: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_at: None,
        }
    }

    fn sample_artifact(id: &str, execution_id: &str, content: &[u8]) -> Artifact {
        Artifact {
            id: id.to_string(),
            execution_id: execution_id.to_string(),
            run_id: "r1".into(),
            name: id.to_string(),
            format: ArtifactFormat::Txt,
            size_bytes: content.len() as i64,
            checksum: "abc".into(),
            staged_path: PathBuf::from(format!(
                ".temp/exec_{execution_id}/artifacts_staging/{id}.txt"
            )),
            promoted_path: None,
            promoted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn test_store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn test_run_crud() {
        let store = test_store();
        store
            .write(|tx| insert_run(tx, &sample_run("r1", 1)))
            .unwrap();

        let mut run = store.read(|c| get_run(c, "r1")).unwrap();
        assert_eq!(run.status, RunStatus::NotStarted);
        assert_eq!(run.checkpoint_order, vec!["a", "b"]);

        run.status = RunStatus::InProgress;
        run.started_at = Some(Utc::now());
        store.write(|tx| update_run(tx, &run)).unwrap();

        let loaded = store.read(|c| get_run(c, "r1")).unwrap();
        assert_eq!(loaded.status, RunStatus::InProgress);
        assert!(loaded.started_at.is_some());
        assert_eq!(store.read(|c| max_run_version(c, "p")).unwrap(), 1);
    }

    #[test]
    fn test_get_run_not_found() {
        let store = test_store();
        let err = store.read(|c| get_run(c, "missing")).unwrap_err();
        assert!(matches!(err, GatehouseError::NotFound { entity: "run", .. }));
    }

    #[test]
    fn test_duplicate_version_rejected() {
        let store = test_store();
        store.write(|tx| insert_run(tx, &sample_run("r1", 1))).unwrap();
        let err = store.write(|tx| insert_run(tx, &sample_run("r2", 1)));
        assert!(matches!(err, Err(GatehouseError::Database(_))));
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let store = test_store();
        let result: Result<()> = store.write(|tx| {
            insert_run(tx, &sample_run("r1", 1))?;
            Err(GatehouseError::validation("abort"))
        });
        assert!(result.is_err());
        assert!(store.read(|c| find_run_by_version(c, "p", 1)).unwrap().is_none());
    }

    #[test]
    fn test_upsert_overwrites_same_artifact() {
        let store = test_store();
        let snapshot = CheckpointDefinition::human("a");
        store
            .write(|tx| {
                insert_run(tx, &sample_run("r1", 1))?;
                insert_execution(tx, &sample_execution("e1", "r1", 0), &snapshot)
            })
            .unwrap();

        let first = sample_artifact("form", "e1", b"one");
        store
            .write(|tx| upsert_staged_artifact(tx, &first, b"one"))
            .unwrap();
        let second = sample_artifact("form", "e1", b"two!");
        store
            .write(|tx| upsert_staged_artifact(tx, &second, b"two!"))
            .unwrap();

        let artifacts = store.read(|c| list_artifacts(c, "e1")).unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].size_bytes, 4);
        assert_eq!(store.read(|c| artifact_content(c, "e1", "form")).unwrap(), b"two!");
    }

    #[test]
    fn test_promoted_artifacts_at_position() {
        let store = test_store();
        let snapshot = CheckpointDefinition::human("a");
        store
            .write(|tx| {
                insert_run(tx, &sample_run("r1", 1))?;
                insert_execution(tx, &sample_execution("e1", "r1", 0), &snapshot)?;
                upsert_staged_artifact(tx, &sample_artifact("x", "e1", b"x"), b"x")?;
                upsert_staged_artifact(tx, &sample_artifact("y", "e1", b"y"), b"y")?;
                mark_promoted(tx, "e1", "x", Path::new("runs/v1/x.txt"), 1, "abc", &Utc::now())
            })
            .unwrap();

        let promoted = store.read(|c| promoted_artifacts_at(c, "r1", 0)).unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, "x");
        assert!(store.read(|c| promoted_artifacts_at(c, "r1", 1)).unwrap().is_empty());
    }

    #[test]
    fn test_execution_cascade_and_snapshot() {
        let store = test_store();
        let mut snapshot = CheckpointDefinition::human("a");
        snapshot.description = "captured".into();
        store
            .write(|tx| {
                insert_run(tx, &sample_run("r1", 1))?;
                insert_execution(tx, &sample_execution("e1", "r1", 0), &snapshot)?;
                insert_log(tx, "e1", LogLevel::Error, "boom")?;
                insert_interaction(tx, "e1", InteractionKind::RevisionRequest, Some("again"), None)
            })
            .unwrap();

        let loaded = store.read(|c| execution_snapshot(c, "e1")).unwrap();
        assert_eq!(loaded.description, "captured");
        assert_eq!(store.read(|c| list_logs(c, "e1")).unwrap().len(), 1);

        store.write(|tx| delete_run(tx, "r1")).unwrap();
        assert!(store.read(|c| get_execution(c, "e1")).is_err());
        assert!(store.read(|c| list_interactions(c, "e1")).unwrap().is_empty());
    }

    #[test]
    fn test_latest_valid_run_skips_archived() {
        let store = test_store();
        store
            .write(|tx| {
                insert_run(tx, &sample_run("r1", 1))?;
                insert_run(tx, &sample_run("r2", 2))?;
                insert_rollback_event(
                    tx,
                    &RollbackEvent {
                        id: "rb".into(),
                        kind: RollbackKind::RunLevel,
                        source_run_id: "r2".into(),
                        source_run_version: 2,
                        target_run_id: "r1".into(),
                        target_checkpoint_id: "a".into(),
                        target_position: 0,
                        archive_location: PathBuf::from(".archived/rollback_rb"),
                        triggered_by: RollbackTrigger::UserRequest,
                        reason: None,
                        items: RolledBackItems::default(),
                        created_at: Utc::now(),
                    },
                )?;
                insert_archived_item(
                    tx,
                    &ArchivedItem {
                        rollback_id: "rb".into(),
                        item_type: ArchivedItemType::Run,
                        item_id: "r2".into(),
                        original_path: PathBuf::from("runs/v2"),
                        archived_path: PathBuf::from(".archived/rollback_rb/archived_data/v2"),
                        size_bytes: 0,
                    },
                )
            })
            .unwrap();

        let latest = store.read(|c| latest_valid_run(c, "p")).unwrap().unwrap();
        assert_eq!(latest.id, "r1");
        assert_eq!(store.read(|c| list_rollback_events(c, Some("r1"))).unwrap().len(), 1);
        assert_eq!(store.read(|c| list_archived_items(c, "rb")).unwrap().len(), 1);
    }

    #[test]
    fn test_events_filtered_by_run() {
        let store = test_store();
        store
            .write(|tx| {
                insert_event(tx, Some("r1"), "run_created", "created v1")?;
                insert_event(tx, Some("r2"), "run_created", "created v2")?;
                insert_event(tx, None, "pipeline_opened", "opened")
            })
            .unwrap();
        assert_eq!(store.read(|c| list_events(c, Some("r1"))).unwrap().len(), 1);
        assert_eq!(store.read(|c| list_events(c, None)).unwrap().len(), 3);
    }
}
