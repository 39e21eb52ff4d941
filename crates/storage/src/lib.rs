use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{
    ClassId, ProblemId, RevisionId, SectionId, SessionId, SessionStatus, StudentId,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredClass {
    pub class_id: ClassId,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredSection {
    pub section_id: SectionId,
    pub class_id: ClassId,
    pub name: String,
    pub semester: String,
}

#[derive(Debug, Clone)]
pub struct StoredProblem {
    pub problem_id: ProblemId,
    pub title: String,
    pub description: String,
    pub starter_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredSession {
    pub session_id: SessionId,
    pub join_code: String,
    pub problem_id: Option<ProblemId>,
    pub problem_text: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct StoredRevision {
    pub revision_id: RevisionId,
    pub session_id: SessionId,
    pub student_id: StudentId,
    pub student_name: String,
    pub code: String,
    pub created_at: DateTime<Utc>,
}

const SESSION_COLUMNS: &str =
    "id, join_code, problem_id, problem_text, status, created_at, last_activity, ended_at";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every connection to `sqlite::memory:` opens its own empty database.
        let max_connections = if database_url.starts_with("sqlite::memory:") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open sqlite database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run storage migrations")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_class(&self, name: &str, description: &str) -> Result<ClassId> {
        let rec = sqlx::query(
            "INSERT INTO classes (name, description, created_at) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(description)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(ClassId(rec.get::<i64, _>(0)))
    }

    pub async fn list_classes(&self) -> Result<Vec<StoredClass>> {
        let rows = sqlx::query(
            "SELECT id, name, description, created_at FROM classes ORDER BY name, id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(class_from_row).collect()
    }

    pub async fn load_class(&self, class_id: ClassId) -> Result<Option<StoredClass>> {
        let row = sqlx::query("SELECT id, name, description, created_at FROM classes WHERE id = ?")
            .bind(class_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(class_from_row).transpose()
    }

    pub async fn update_class(
        &self,
        class_id: ClassId,
        name: &str,
        description: &str,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE classes SET name = ?, description = ? WHERE id = ?")
            .bind(name)
            .bind(description)
            .bind(class_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_class(&self, class_id: ClassId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM classes WHERE id = ?")
            .bind(class_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn create_section(
        &self,
        class_id: ClassId,
        name: &str,
        semester: &str,
    ) -> Result<SectionId> {
        let rec = sqlx::query(
            "INSERT INTO sections (class_id, name, semester) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(class_id.0)
        .bind(name)
        .bind(semester)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to create section for class {class_id}"))?;
        Ok(SectionId(rec.get::<i64, _>(0)))
    }

    pub async fn list_sections_for_class(&self, class_id: ClassId) -> Result<Vec<StoredSection>> {
        let rows = sqlx::query(
            "SELECT id, class_id, name, semester FROM sections WHERE class_id = ? ORDER BY id",
        )
        .bind(class_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| StoredSection {
                section_id: SectionId(row.get::<i64, _>(0)),
                class_id: ClassId(row.get::<i64, _>(1)),
                name: row.get::<String, _>(2),
                semester: row.get::<String, _>(3),
            })
            .collect())
    }

    pub async fn delete_section(&self, section_id: SectionId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sections WHERE id = ?")
            .bind(section_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn create_problem(
        &self,
        title: &str,
        description: &str,
        starter_code: Option<&str>,
    ) -> Result<ProblemId> {
        let rec = sqlx::query(
            "INSERT INTO problems (title, description, starter_code, created_at)
             VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(title)
        .bind(description)
        .bind(starter_code)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(ProblemId(rec.get::<i64, _>(0)))
    }

    pub async fn list_problems(&self) -> Result<Vec<StoredProblem>> {
        let rows = sqlx::query(
            "SELECT id, title, description, starter_code, created_at FROM problems ORDER BY id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(problem_from_row).collect()
    }

    pub async fn load_problem(&self, problem_id: ProblemId) -> Result<Option<StoredProblem>> {
        let row = sqlx::query(
            "SELECT id, title, description, starter_code, created_at FROM problems WHERE id = ?",
        )
        .bind(problem_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(problem_from_row).transpose()
    }

    pub async fn update_problem(
        &self,
        problem_id: ProblemId,
        title: &str,
        description: &str,
        starter_code: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE problems SET title = ?, description = ?, starter_code = ? WHERE id = ?",
        )
        .bind(title)
        .bind(description)
        .bind(starter_code)
        .bind(problem_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_problem(&self, problem_id: ProblemId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM problems WHERE id = ?")
            .bind(problem_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn create_session(
        &self,
        join_code: &str,
        problem_id: Option<ProblemId>,
        problem_text: &str,
    ) -> Result<StoredSession> {
        self.try_create_session(join_code, problem_id, problem_text)
            .await?
            .ok_or_else(|| anyhow!("join code '{join_code}' is already in use"))
    }

    /// Returns `None` when another stored session, live or ended, holds `join_code`.
    pub async fn try_create_session(
        &self,
        join_code: &str,
        problem_id: Option<ProblemId>,
        problem_text: &str,
    ) -> Result<Option<StoredSession>> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "INSERT INTO sessions (join_code, problem_id, problem_text, status, created_at, last_activity)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(join_code) DO NOTHING
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(join_code)
        .bind(problem_id.map(|id| id.0))
        .bind(problem_text)
        .bind(SessionStatus::Active.as_str())
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to create session with join code '{join_code}'"))?;
        row.as_ref().map(session_from_row).transpose()
    }

    pub async fn load_session(&self, session_id: SessionId) -> Result<Option<StoredSession>> {
        let row = sqlx::query(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"))
            .bind(session_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    pub async fn load_session_by_join_code(
        &self,
        join_code: &str,
    ) -> Result<Option<StoredSession>> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE join_code = ?"
        ))
        .bind(join_code)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    /// Most recently active first.
    pub async fn list_sessions(&self, status: Option<SessionStatus>) -> Result<Vec<StoredSession>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE status = ?
                     ORDER BY last_activity DESC, id DESC"
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY last_activity DESC, id DESC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(session_from_row).collect()
    }

    pub async fn update_session_problem(
        &self,
        session_id: SessionId,
        problem_text: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sessions SET problem_text = ?, last_activity = ? WHERE id = ? AND status = 'active'",
        )
        .bind(problem_text)
        .bind(Utc::now())
        .bind(session_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn touch_session(&self, session_id: SessionId) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_activity = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(session_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Marks the session completed. Returns false when it was not active.
    pub async fn end_session(&self, session_id: SessionId) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE sessions SET status = ?, ended_at = ?, last_activity = ?
             WHERE id = ? AND status = 'active'",
        )
        .bind(SessionStatus::Completed.as_str())
        .bind(now)
        .bind(now)
        .bind(session_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn insert_revision(
        &self,
        session_id: SessionId,
        student_id: StudentId,
        student_name: &str,
        code: &str,
    ) -> Result<RevisionId> {
        let rec = sqlx::query(
            "INSERT INTO code_revisions (session_id, student_id, student_name, code, created_at)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(session_id.0)
        .bind(student_id.0)
        .bind(student_name)
        .bind(code)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(RevisionId(rec.get::<i64, _>(0)))
    }

    /// Highest student id with a stored revision in the session.
    pub async fn max_student_id(&self, session_id: SessionId) -> Result<Option<StudentId>> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(student_id) FROM code_revisions WHERE session_id = ?")
                .bind(session_id.0)
                .fetch_one(&self.pool)
                .await?;
        Ok(max.map(StudentId))
    }

    /// Oldest first, optionally narrowed to one student.
    pub async fn list_revisions(
        &self,
        session_id: SessionId,
        student_id: Option<StudentId>,
    ) -> Result<Vec<StoredRevision>> {
        let rows = sqlx::query(
            "SELECT id, session_id, student_id, student_name, code, created_at
             FROM code_revisions
             WHERE session_id = ? AND (? IS NULL OR student_id = ?)
             ORDER BY id ASC",
        )
        .bind(session_id.0)
        .bind(student_id.map(|id| id.0))
        .bind(student_id.map(|id| id.0))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(StoredRevision {
                    revision_id: RevisionId(row.try_get("id")?),
                    session_id: SessionId(row.try_get("session_id")?),
                    student_id: StudentId(row.try_get("student_id")?),
                    student_name: row.try_get("student_name")?,
                    code: row.try_get("code")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}

fn class_from_row(row: &SqliteRow) -> Result<StoredClass> {
    Ok(StoredClass {
        class_id: ClassId(row.try_get("id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
    })
}

fn problem_from_row(row: &SqliteRow) -> Result<StoredProblem> {
    Ok(StoredProblem {
        problem_id: ProblemId(row.try_get("id")?),
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        starter_code: row.try_get("starter_code")?,
        created_at: row.try_get("created_at")?,
    })
}

fn session_from_row(row: &SqliteRow) -> Result<StoredSession> {
    let raw_status: String = row.try_get("status")?;
    let status = SessionStatus::parse(&raw_status)
        .with_context(|| format!("unknown session status '{raw_status}'"))?;
    Ok(StoredSession {
        session_id: SessionId(row.try_get("id")?),
        join_code: row.try_get("join_code")?,
        problem_id: row.try_get::<Option<i64>, _>("problem_id")?.map(ProblemId),
        problem_text: row.try_get("problem_text")?,
        status,
        created_at: row.try_get("created_at")?,
        last_activity: row.try_get("last_activity")?,
        ended_at: row.try_get("ended_at")?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
