//! SQLite-backed repository. Treated by the rest of the daemon as an opaque
//! transactional store with snapshot reads; schema migration and SQL
//! mapping are mechanical and intentionally out of the spec's core scope.

use chrono::{DateTime, TimeZone, Utc};
use orc_core::{
    Artifact, Id, MachineSummary, Pattern, Project, Run, RunError, RunStatus, Step, StepRole,
    TaskType,
};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("project not found: {0}")]
    ProjectNotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// `SQLite` persistence for projects, runs, steps, artifacts, and cached patterns.
#[derive(Debug)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        Ok(Self { pool })
    }

    /// Run the embedded migrations. Tolerates re-application (duplicate
    /// column / already exists) so startup is idempotent.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];
        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");
            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match sqlx::query(trimmed).execute(&self.pool).await {
                    Ok(_) => {}
                    Err(e) => {
                        let msg = e.to_string();
                        if !msg.contains("duplicate column") && !msg.contains("already exists") {
                            return Err(e.into());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // --- Projects ---

    pub async fn upsert_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            "INSERT INTO projects (id, name, task_type, created_at) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, task_type = excluded.task_type",
        )
        .bind(&project.id)
        .bind(&project.name)
        .bind(project.task_type.map(TaskType::as_str))
        .bind(to_millis(project.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT id, name, task_type, created_at FROM projects WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(project_from_row))
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query("SELECT id, name, task_type, created_at FROM projects ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(project_from_row).collect())
    }

    // --- Runs ---

    pub async fn insert_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            "INSERT INTO runs (id, project_id, name, task_type, status, progress, instructions, \
             reference_run_id, source_run_id, system_instructions, had_errors, errors_json, \
             machine_summary_json, upstream_session_id, created_at, started_at, finished_at) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
        )
        .bind(run.id.as_ref())
        .bind(&run.project_id)
        .bind(&run.name)
        .bind(run.task_type.as_str())
        .bind(run.status.as_str())
        .bind(i64::from(run.progress))
        .bind(&run.instructions)
        .bind(run.reference_run_id.as_ref().map(Id::as_ref))
        .bind(run.source_run_id.as_ref().map(Id::as_ref))
        .bind(&run.system_instructions)
        .bind(i64::from(run.had_errors))
        .bind(serde_json::to_string(&run.errors)?)
        .bind(
            run.machine_summary
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&run.upstream_session_id)
        .bind(to_millis(run.created_at))
        .bind(run.started_at.map(to_millis))
        .bind(run.finished_at.map(to_millis))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_run(&self, id: &Id) -> Result<Option<Run>> {
        let row = sqlx::query(RUN_COLUMNS_SELECT)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?;
        row.map(run_from_row).transpose()
    }

    pub async fn require_run(&self, id: &Id) -> Result<Run> {
        self.get_run(id)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(id.to_string()))
    }

    pub async fn list_runs(&self, project_id: Option<&str>) -> Result<Vec<Run>> {
        let query = match project_id {
            Some(_) => format!("{RUN_COLUMNS_SELECT_BARE} WHERE project_id = ?1 ORDER BY created_at"),
            None => format!("{RUN_COLUMNS_SELECT_BARE} ORDER BY created_at"),
        };
        let rows = match project_id {
            Some(p) => sqlx::query(&query).bind(p).fetch_all(&self.pool).await?,
            None => sqlx::query(&query).fetch_all(&self.pool).await?,
        };
        rows.into_iter().map(run_from_row).collect()
    }

    /// Persist the full run row. Used at every lifecycle transition; the
    /// spec's invariants (monotone progress, terminal immutability) are
    /// enforced by the caller, not here — storage is a dumb writer.
    pub async fn update_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            "UPDATE runs SET status=?2, progress=?3, system_instructions=?4, had_errors=?5, \
             errors_json=?6, machine_summary_json=?7, upstream_session_id=?8, started_at=?9, \
             finished_at=?10 WHERE id=?1",
        )
        .bind(run.id.as_ref())
        .bind(run.status.as_str())
        .bind(i64::from(run.progress))
        .bind(&run.system_instructions)
        .bind(i64::from(run.had_errors))
        .bind(serde_json::to_string(&run.errors)?)
        .bind(
            run.machine_summary
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&run.upstream_session_id)
        .bind(run.started_at.map(to_millis))
        .bind(run.finished_at.map(to_millis))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- Steps ---

    pub async fn next_sequence(&self, run_id: &Id) -> Result<u32> {
        let row = sqlx::query("SELECT COALESCE(MAX(sequence), -1) AS max_seq FROM steps WHERE run_id = ?1")
            .bind(run_id.as_ref())
            .fetch_one(&self.pool)
            .await?;
        let max_seq: i64 = row.try_get("max_seq")?;
        Ok((max_seq + 1) as u32)
    }

    pub async fn insert_step(&self, step: &Step) -> Result<()> {
        sqlx::query(
            "INSERT INTO steps (id, run_id, sequence, role, content, touched_files_json, \
             notes_json, outcome_ok, timestamp) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
        )
        .bind(step.id.as_ref())
        .bind(step.run_id.as_ref())
        .bind(i64::from(step.sequence))
        .bind(step.role.as_str())
        .bind(&step.content)
        .bind(serde_json::to_string(&step.touched_files)?)
        .bind(step.notes.as_ref().map(serde_json::to_string).transpose()?)
        .bind(i64::from(step.outcome_ok))
        .bind(to_millis(step.timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_steps(&self, run_id: &Id) -> Result<Vec<Step>> {
        let rows = sqlx::query(
            "SELECT id, run_id, sequence, role, content, touched_files_json, notes_json, \
             outcome_ok, timestamp FROM steps WHERE run_id = ?1 ORDER BY sequence",
        )
        .bind(run_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(step_from_row).collect()
    }

    // --- Artifacts ---

    pub async fn insert_artifact(&self, artifact: &Artifact) -> Result<()> {
        sqlx::query(
            "INSERT INTO artifacts (id, run_id, kind, path, bytes, created_at) \
             VALUES (?1,?2,?3,?4,?5,?6)",
        )
        .bind(artifact.id.as_ref())
        .bind(artifact.run_id.as_ref())
        .bind(&artifact.kind)
        .bind(&artifact.path)
        .bind(artifact.bytes as i64)
        .bind(to_millis(artifact.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_artifacts(&self, run_id: &Id) -> Result<Vec<Artifact>> {
        let rows = sqlx::query(
            "SELECT id, run_id, kind, path, bytes, created_at FROM artifacts \
             WHERE run_id = ?1 ORDER BY created_at",
        )
        .bind(run_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(artifact_from_row).collect())
    }

    pub async fn get_artifact(&self, run_id: &Id, artifact_id: &Id) -> Result<Option<Artifact>> {
        let row = sqlx::query(
            "SELECT id, run_id, kind, path, bytes, created_at FROM artifacts \
             WHERE run_id = ?1 AND id = ?2",
        )
        .bind(run_id.as_ref())
        .bind(artifact_id.as_ref())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(artifact_from_row))
    }

    // --- Patterns ---

    pub async fn upsert_pattern(&self, pattern: &Pattern) -> Result<()> {
        sqlx::query(
            "INSERT INTO patterns (run_id, project_id, name, summary, steps_json, \
             variables_json, rendered_block) VALUES (?1,?2,?3,?4,?5,?6,?7) \
             ON CONFLICT(run_id) DO UPDATE SET rendered_block = excluded.rendered_block",
        )
        .bind(pattern.run_id.as_ref())
        .bind(&pattern.project_id)
        .bind(&pattern.name)
        .bind(&pattern.summary)
        .bind(serde_json::to_string(&pattern.steps)?)
        .bind(serde_json::to_string(&pattern.variables)?)
        .bind(&pattern.rendered_block)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_pattern(&self, run_id: &Id) -> Result<Option<Pattern>> {
        let row = sqlx::query(
            "SELECT run_id, project_id, name, summary, steps_json, variables_json, \
             rendered_block FROM patterns WHERE run_id = ?1",
        )
        .bind(run_id.as_ref())
        .fetch_optional(&self.pool)
        .await?;
        row.map(pattern_from_row).transpose()
    }
}

const RUN_COLUMNS_SELECT_BARE: &str = "SELECT id, project_id, name, task_type, status, progress, \
    instructions, reference_run_id, source_run_id, system_instructions, had_errors, errors_json, \
    machine_summary_json, upstream_session_id, created_at, started_at, finished_at FROM runs";
const RUN_COLUMNS_SELECT: &str = "SELECT id, project_id, name, task_type, status, progress, \
    instructions, reference_run_id, source_run_id, system_instructions, had_errors, errors_json, \
    machine_summary_json, upstream_session_id, created_at, started_at, finished_at FROM runs \
    WHERE id = ?1";

fn project_from_row(row: sqlx::sqlite::SqliteRow) -> Project {
    let task_type: Option<String> = row.try_get("task_type").ok().flatten();
    Project {
        id: row.try_get("id").unwrap_or_default(),
        name: row.try_get("name").unwrap_or_default(),
        task_type: task_type.and_then(|t| t.parse().ok()),
        created_at: from_millis(row.try_get("created_at").unwrap_or_default()),
    }
}

fn run_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Run> {
    let errors_json: String = row.try_get("errors_json")?;
    let errors: Vec<RunError> = serde_json::from_str(&errors_json)?;
    let machine_summary_json: Option<String> = row.try_get("machine_summary_json")?;
    let machine_summary: Option<MachineSummary> = machine_summary_json
        .map(|s| serde_json::from_str(&s))
        .transpose()?;
    let task_type: String = row.try_get("task_type")?;
    let status: String = row.try_get("status")?;
    let reference_run_id: Option<String> = row.try_get("reference_run_id")?;
    let source_run_id: Option<String> = row.try_get("source_run_id")?;
    let started_at: Option<i64> = row.try_get("started_at")?;
    let finished_at: Option<i64> = row.try_get("finished_at")?;
    let had_errors: i64 = row.try_get("had_errors")?;

    Ok(Run {
        id: Id::from_string(row.try_get::<String, _>("id")?),
        project_id: row.try_get("project_id")?,
        name: row.try_get("name")?,
        task_type: task_type.parse().map_err(|_| {
            sqlx::Error::Decode("invalid task_type".into())
        })?,
        status: status_from_str(&status),
        progress: row.try_get::<i64, _>("progress")? as u8,
        instructions: row.try_get("instructions")?,
        reference_run_id: reference_run_id.map(Id::from_string),
        source_run_id: source_run_id.map(Id::from_string),
        system_instructions: row.try_get("system_instructions")?,
        had_errors: had_errors != 0,
        errors,
        machine_summary,
        upstream_session_id: row.try_get("upstream_session_id")?,
        created_at: from_millis(row.try_get("created_at")?),
        started_at: started_at.map(from_millis),
        finished_at: finished_at.map(from_millis),
    })
}

fn status_from_str(s: &str) -> RunStatus {
    match s {
        "RUNNING" => RunStatus::Running,
        "SUCCEEDED" => RunStatus::Succeeded,
        "FAILED" => RunStatus::Failed,
        "CANCELLED" => RunStatus::Cancelled,
        _ => RunStatus::Queued,
    }
}

fn step_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Step> {
    let role: String = row.try_get("role")?;
    let touched_files_json: String = row.try_get("touched_files_json")?;
    let notes_json: Option<String> = row.try_get("notes_json")?;
    let outcome_ok: i64 = row.try_get("outcome_ok")?;
    Ok(Step {
        id: Id::from_string(row.try_get::<String, _>("id")?),
        run_id: Id::from_string(row.try_get::<String, _>("run_id")?),
        sequence: row.try_get::<i64, _>("sequence")? as u32,
        role: role_from_str(&role),
        content: row.try_get("content")?,
        touched_files: serde_json::from_str(&touched_files_json)?,
        notes: notes_json.map(|s| serde_json::from_str(&s)).transpose()?,
        outcome_ok: outcome_ok != 0,
        timestamp: from_millis(row.try_get("timestamp")?),
    })
}

fn role_from_str(s: &str) -> StepRole {
    match s {
        "assistant" => StepRole::Assistant,
        "tool" => StepRole::Tool,
        _ => StepRole::User,
    }
}

fn artifact_from_row(row: sqlx::sqlite::SqliteRow) -> Artifact {
    Artifact {
        id: Id::from_string(row.try_get::<String, _>("id").unwrap_or_default()),
        run_id: Id::from_string(row.try_get::<String, _>("run_id").unwrap_or_default()),
        kind: row.try_get("kind").unwrap_or_default(),
        path: row.try_get("path").unwrap_or_default(),
        bytes: row.try_get::<i64, _>("bytes").unwrap_or_default() as u64,
        created_at: from_millis(row.try_get("created_at").unwrap_or_default()),
    }
}

fn pattern_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Pattern> {
    let steps_json: String = row.try_get("steps_json")?;
    let variables_json: String = row.try_get("variables_json")?;
    Ok(Pattern {
        run_id: Id::from_string(row.try_get::<String, _>("run_id")?),
        project_id: row.try_get("project_id")?,
        name: row.try_get("name")?,
        summary: row.try_get("summary")?,
        steps: serde_json::from_str(&steps_json)?,
        variables: serde_json::from_str(&variables_json)?,
        rendered_block: row.try_get("rendered_block")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use orc_core::types::ErrorCode;

    async fn fresh_storage() -> (Storage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        (storage, dir)
    }

    #[tokio::test]
    async fn project_round_trips() {
        let (storage, _dir) = fresh_storage().await;
        let project = Project {
            id: "demo".into(),
            name: "Demo".into(),
            task_type: Some(TaskType::Code),
            created_at: Utc::now(),
        };
        storage.upsert_project(&project).await.unwrap();
        let fetched = storage.get_project("demo").await.unwrap().unwrap();
        assert_eq!(fetched.name, "Demo");
        assert_eq!(fetched.task_type, Some(TaskType::Code));
    }

    #[tokio::test]
    async fn run_round_trips_and_updates() {
        let (storage, _dir) = fresh_storage().await;
        let mut run = Run::new("demo".into(), "n".into(), "do it".into(), TaskType::Code);
        storage.insert_run(&run).await.unwrap();

        run.status = RunStatus::Running;
        run.progress = 30;
        run.started_at = Some(Utc::now());
        storage.update_run(&run).await.unwrap();

        let fetched = storage.require_run(&run.id).await.unwrap();
        assert_eq!(fetched.status, RunStatus::Running);
        assert_eq!(fetched.progress, 30);
        assert!(fetched.started_at.is_some());
    }

    #[tokio::test]
    async fn steps_keep_monotone_sequence() {
        let (storage, _dir) = fresh_storage().await;
        let run = Run::new("demo".into(), "n".into(), "do it".into(), TaskType::Code);
        storage.insert_run(&run).await.unwrap();

        for i in 0..3u32 {
            let seq = storage.next_sequence(&run.id).await.unwrap();
            assert_eq!(seq, i);
            let step = Step {
                id: Id::new(),
                run_id: run.id.clone(),
                sequence: seq,
                role: StepRole::Assistant,
                content: format!("step {i}"),
                touched_files: vec![],
                notes: None,
                outcome_ok: true,
                timestamp: Utc::now(),
            };
            storage.insert_step(&step).await.unwrap();
        }

        let steps = storage.list_steps(&run.id).await.unwrap();
        let sequences: Vec<u32> = steps.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn run_errors_round_trip() {
        let (storage, _dir) = fresh_storage().await;
        let mut run = Run::new("demo".into(), "n".into(), "do it".into(), TaskType::Code);
        run.had_errors = true;
        run.errors.push(RunError::new(ErrorCode::Timeout, "boom"));
        storage.insert_run(&run).await.unwrap();

        let fetched = storage.require_run(&run.id).await.unwrap();
        assert!(fetched.had_errors);
        assert_eq!(fetched.errors.len(), 1);
        assert_eq!(fetched.errors[0].code, ErrorCode::Timeout);
    }

    #[tokio::test]
    async fn pattern_round_trips() {
        let (storage, _dir) = fresh_storage().await;
        let run = Run::new("demo".into(), "n".into(), "do it".into(), TaskType::Code);
        let pattern = Pattern {
            run_id: run.id.clone(),
            project_id: "demo".into(),
            name: "n".into(),
            summary: "did it".into(),
            steps: vec!["step 1".into()],
            variables: vec![],
            rendered_block: "<reference_workflow/>".into(),
        };
        storage.upsert_pattern(&pattern).await.unwrap();
        let fetched = storage.get_pattern(&run.id).await.unwrap().unwrap();
        assert_eq!(fetched.rendered_block, "<reference_workflow/>");
    }
}
