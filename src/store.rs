use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use rusqlite::{Connection, OpenFlags, TransactionBehavior, params};

use crate::models::{Event, Project, Session};

const SCHEMA_VERSION: i32 = 1;

/// Handle to the single-file SQLite database holding projects, sessions,
/// events, and the active-recording singleton row. Statements run on blocking
/// tasks; WAL mode plus a busy timeout serialize the rare concurrent writers.
#[derive(Debug, Clone)]
pub struct Store {
    db_path: PathBuf,
}

#[derive(Debug)]
pub enum InsertProjectError {
    /// `projects.name` carries a UNIQUE constraint.
    DuplicateName(String),
    Other(anyhow::Error),
}

impl std::fmt::Display for InsertProjectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateName(name) => write!(f, "project name `{name}` already exists"),
            Self::Other(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for InsertProjectError {}

impl Store {
    pub fn open(db_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create storage dir {}", parent.display()))?;
            }
        }

        let store = Self { db_path };
        store.init()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init(&self) -> anyhow::Result<()> {
        let conn = open_connection(&self.db_path)?;
        migrate(&conn)
    }

    pub async fn insert_project(&self, project: Project) -> Result<(), InsertProjectError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || insert_project_blocking(&db_path, &project))
            .await
            .map_err(|err| {
                InsertProjectError::Other(anyhow::anyhow!("join insert_project task: {err}"))
            })?
    }

    pub async fn list_projects(&self) -> anyhow::Result<Vec<Project>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || list_projects_blocking(&db_path))
            .await
            .context("join list_projects task")?
    }

    pub async fn get_project(&self, id: &str) -> anyhow::Result<Option<Project>> {
        let db_path = self.db_path.clone();
        let id = id.to_owned();
        tokio::task::spawn_blocking(move || get_project_blocking(&db_path, &id))
            .await
            .context("join get_project task")?
    }

    pub async fn update_project(&self, project: Project) -> anyhow::Result<()> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || update_project_blocking(&db_path, &project))
            .await
            .context("join update_project task")?
    }

    pub async fn delete_project(&self, id: &str) -> anyhow::Result<bool> {
        let db_path = self.db_path.clone();
        let id = id.to_owned();
        tokio::task::spawn_blocking(move || delete_project_blocking(&db_path, &id))
            .await
            .context("join delete_project task")?
    }

    pub async fn insert_session(&self, session: Session) -> anyhow::Result<()> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || insert_session_blocking(&db_path, &session))
            .await
            .context("join insert_session task")?
    }

    pub async fn list_sessions_by_project(
        &self,
        project_id: &str,
    ) -> anyhow::Result<Vec<Session>> {
        let db_path = self.db_path.clone();
        let project_id = project_id.to_owned();
        tokio::task::spawn_blocking(move || list_sessions_blocking(&db_path, &project_id))
            .await
            .context("join list_sessions_by_project task")?
    }

    pub async fn get_session(&self, id: &str) -> anyhow::Result<Option<Session>> {
        let db_path = self.db_path.clone();
        let id = id.to_owned();
        tokio::task::spawn_blocking(move || get_session_blocking(&db_path, &id))
            .await
            .context("join get_session task")?
    }

    pub async fn delete_session(&self, id: &str) -> anyhow::Result<bool> {
        let db_path = self.db_path.clone();
        let id = id.to_owned();
        tokio::task::spawn_blocking(move || delete_session_blocking(&db_path, &id))
            .await
            .context("join delete_session task")?
    }

    /// Inserts a captured event, assigning `seq = MAX(seq) + 1` for the session
    /// inside one immediate transaction so concurrent captures for the same
    /// session still produce a gap-free, strictly increasing sequence. Returns
    /// the assigned sequence number.
    pub async fn insert_event(&self, event: Event) -> anyhow::Result<i64> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || insert_event_blocking(&db_path, event))
            .await
            .context("join insert_event task")?
    }

    pub async fn list_events_by_session(&self, session_id: &str) -> anyhow::Result<Vec<Event>> {
        let db_path = self.db_path.clone();
        let session_id = session_id.to_owned();
        tokio::task::spawn_blocking(move || list_events_blocking(&db_path, &session_id))
            .await
            .context("join list_events_by_session task")?
    }

    pub async fn get_active_recording(&self) -> anyhow::Result<Option<(String, String)>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || get_active_recording_blocking(&db_path))
            .await
            .context("join get_active_recording task")?
    }

    pub async fn set_active_recording(
        &self,
        project_id: &str,
        session_id: &str,
    ) -> anyhow::Result<()> {
        let db_path = self.db_path.clone();
        let project_id = project_id.to_owned();
        let session_id = session_id.to_owned();
        tokio::task::spawn_blocking(move || {
            set_active_recording_blocking(&db_path, &project_id, &session_id)
        })
        .await
        .context("join set_active_recording task")?
    }

    pub async fn clear_active_recording(&self) -> anyhow::Result<()> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || clear_active_recording_blocking(&db_path))
            .await
            .context("join clear_active_recording task")?
    }
}

fn open_connection(path: &Path) -> anyhow::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .with_context(|| format!("open sqlite {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .context("set PRAGMA journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("set PRAGMA synchronous=NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("set PRAGMA foreign_keys=ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("set sqlite busy_timeout")?;

    Ok(conn)
}

fn migrate(conn: &Connection) -> anyhow::Result<()> {
    let user_version: i32 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .context("read PRAGMA user_version")?;

    match user_version {
        0 => {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS projects (
                  id TEXT PRIMARY KEY,
                  name TEXT NOT NULL UNIQUE,
                  config_json TEXT NOT NULL,
                  created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sessions (
                  id TEXT PRIMARY KEY,
                  project_id TEXT NOT NULL,
                  name TEXT NOT NULL,
                  created_at TEXT NOT NULL,
                  sealed INTEGER NOT NULL,
                  FOREIGN KEY(project_id) REFERENCES projects(id) ON DELETE CASCADE
                );

                CREATE TABLE IF NOT EXISTS events (
                  id TEXT PRIMARY KEY,
                  session_id TEXT NOT NULL,
                  seq INTEGER NOT NULL,
                  started_at TEXT NOT NULL,
                  ended_at TEXT NOT NULL,
                  method TEXT NOT NULL,
                  url TEXT NOT NULL,
                  status INTEGER NOT NULL,
                  req_headers TEXT NOT NULL,
                  resp_headers TEXT NOT NULL,
                  req_body BLOB NOT NULL,
                  resp_body BLOB NOT NULL,
                  redaction_applied TEXT NOT NULL,
                  FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE,
                  UNIQUE(session_id, seq)
                );

                CREATE TABLE IF NOT EXISTS active_recording (
                  id INTEGER PRIMARY KEY CHECK (id = 1),
                  project_id TEXT NOT NULL,
                  session_id TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_sessions_project_created
                  ON sessions(project_id, created_at);

                CREATE INDEX IF NOT EXISTS idx_events_session_seq
                  ON events(session_id, seq);
                "#,
            )
            .context("create sqlite schema v1")?;

            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .context("set PRAGMA user_version=1")?;
            Ok(())
        }
        SCHEMA_VERSION => Ok(()),
        _ => anyhow::bail!(
            "unsupported database schema version {user_version} (expected {SCHEMA_VERSION})"
        ),
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn insert_project_blocking(path: &Path, project: &Project) -> Result<(), InsertProjectError> {
    let conn = open_connection(path).map_err(InsertProjectError::Other)?;
    conn.execute(
        "INSERT INTO projects(id, name, config_json, created_at) VALUES(?1, ?2, ?3, ?4)",
        params![
            project.id,
            project.name,
            project.config_json,
            project.created_at
        ],
    )
    .map_err(|err| {
        if is_unique_violation(&err) {
            InsertProjectError::DuplicateName(project.name.clone())
        } else {
            InsertProjectError::Other(anyhow::anyhow!("insert project: {err}"))
        }
    })?;
    Ok(())
}

fn project_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        config_json: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn list_projects_blocking(path: &Path) -> anyhow::Result<Vec<Project>> {
    let conn = open_connection(path)?;
    let mut stmt = conn
        .prepare(
            "SELECT id, name, config_json, created_at FROM projects ORDER BY created_at DESC",
        )
        .context("prepare list projects")?;
    let projects = stmt
        .query_map([], project_from_row)
        .context("query list projects")?
        .collect::<Result<Vec<_>, _>>()
        .context("scan projects")?;
    Ok(projects)
}

fn get_project_blocking(path: &Path, id: &str) -> anyhow::Result<Option<Project>> {
    let conn = open_connection(path)?;
    let mut stmt = conn
        .prepare("SELECT id, name, config_json, created_at FROM projects WHERE id = ?1")
        .context("prepare get project")?;
    let mut rows = stmt
        .query_map(params![id], project_from_row)
        .context("query get project")?;
    rows.next().transpose().context("scan project")
}

fn update_project_blocking(path: &Path, project: &Project) -> anyhow::Result<()> {
    let conn = open_connection(path)?;
    conn.execute(
        "UPDATE projects SET name = ?1, config_json = ?2 WHERE id = ?3",
        params![project.name, project.config_json, project.id],
    )
    .context("update project")?;
    Ok(())
}

fn delete_project_blocking(path: &Path, id: &str) -> anyhow::Result<bool> {
    let conn = open_connection(path)?;
    let deleted = conn
        .execute("DELETE FROM projects WHERE id = ?1", params![id])
        .context("delete project")?;
    Ok(deleted == 1)
}

fn insert_session_blocking(path: &Path, session: &Session) -> anyhow::Result<()> {
    let conn = open_connection(path)?;
    conn.execute(
        "INSERT INTO sessions(id, project_id, name, created_at, sealed) VALUES(?1, ?2, ?3, ?4, ?5)",
        params![
            session.id,
            session.project_id,
            session.name,
            session.created_at,
            i64::from(session.sealed)
        ],
    )
    .context("insert session")?;
    Ok(())
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        created_at: row.get(3)?,
        sealed: row.get::<_, i64>(4)? != 0,
    })
}

fn list_sessions_blocking(path: &Path, project_id: &str) -> anyhow::Result<Vec<Session>> {
    let conn = open_connection(path)?;
    let mut stmt = conn
        .prepare(
            r#"
            SELECT id, project_id, name, created_at, sealed
            FROM sessions
            WHERE project_id = ?1
            ORDER BY created_at DESC
            "#,
        )
        .context("prepare list sessions")?;
    let sessions = stmt
        .query_map(params![project_id], session_from_row)
        .context("query list sessions")?
        .collect::<Result<Vec<_>, _>>()
        .context("scan sessions")?;
    Ok(sessions)
}

fn get_session_blocking(path: &Path, id: &str) -> anyhow::Result<Option<Session>> {
    let conn = open_connection(path)?;
    let mut stmt = conn
        .prepare("SELECT id, project_id, name, created_at, sealed FROM sessions WHERE id = ?1")
        .context("prepare get session")?;
    let mut rows = stmt
        .query_map(params![id], session_from_row)
        .context("query get session")?;
    rows.next().transpose().context("scan session")
}

fn delete_session_blocking(path: &Path, id: &str) -> anyhow::Result<bool> {
    let conn = open_connection(path)?;
    let deleted = conn
        .execute("DELETE FROM sessions WHERE id = ?1", params![id])
        .context("delete session")?;
    Ok(deleted == 1)
}

fn insert_event_blocking(path: &Path, mut event: Event) -> anyhow::Result<i64> {
    let mut conn = open_connection(path)?;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("begin event transaction")?;

    let next_seq: i64 = tx
        .query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE session_id = ?1",
            params![event.session_id],
            |row| row.get(0),
        )
        .context("compute next event seq")?;
    event.seq = next_seq;

    tx.execute(
        r#"
        INSERT INTO events(
          id, session_id, seq, started_at, ended_at, method, url, status,
          req_headers, resp_headers, req_body, resp_body, redaction_applied
        ) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        "#,
        params![
            event.id,
            event.session_id,
            event.seq,
            event.started_at,
            event.ended_at,
            event.method,
            event.url,
            event.status,
            event.req_headers,
            event.resp_headers,
            event.req_body,
            event.resp_body,
            event.redaction_applied,
        ],
    )
    .context("insert event")?;

    tx.commit().context("commit event transaction")?;
    Ok(next_seq)
}

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        session_id: row.get(1)?,
        seq: row.get(2)?,
        started_at: row.get(3)?,
        ended_at: row.get(4)?,
        method: row.get(5)?,
        url: row.get(6)?,
        status: row.get(7)?,
        req_headers: row.get(8)?,
        resp_headers: row.get(9)?,
        req_body: row.get(10)?,
        resp_body: row.get(11)?,
        redaction_applied: row.get(12)?,
    })
}

fn list_events_blocking(path: &Path, session_id: &str) -> anyhow::Result<Vec<Event>> {
    let conn = open_connection(path)?;
    let mut stmt = conn
        .prepare(
            r#"
            SELECT id, session_id, seq, started_at, ended_at, method, url, status,
                   req_headers, resp_headers, req_body, resp_body, redaction_applied
            FROM events
            WHERE session_id = ?1
            ORDER BY seq ASC
            "#,
        )
        .context("prepare list events")?;
    let events = stmt
        .query_map(params![session_id], event_from_row)
        .context("query list events")?
        .collect::<Result<Vec<_>, _>>()
        .context("scan events")?;
    Ok(events)
}

fn get_active_recording_blocking(path: &Path) -> anyhow::Result<Option<(String, String)>> {
    let conn = open_connection(path)?;
    let mut stmt = conn
        .prepare("SELECT project_id, session_id FROM active_recording WHERE id = 1")
        .context("prepare get active recording")?;
    let mut rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .context("query active recording")?;
    rows.next().transpose().context("scan active recording")
}

fn set_active_recording_blocking(
    path: &Path,
    project_id: &str,
    session_id: &str,
) -> anyhow::Result<()> {
    let conn = open_connection(path)?;
    conn.execute(
        r#"
        INSERT INTO active_recording (id, project_id, session_id)
        VALUES (1, ?1, ?2)
        ON CONFLICT(id) DO UPDATE SET
          project_id = excluded.project_id,
          session_id = excluded.session_id
        "#,
        params![project_id, session_id],
    )
    .context("set active recording")?;
    Ok(())
}

fn clear_active_recording_blocking(path: &Path) -> anyhow::Result<()> {
    let conn = open_connection(path)?;
    conn.execute("DELETE FROM active_recording WHERE id = 1", [])
        .context("clear active recording")?;
    Ok(())
}
