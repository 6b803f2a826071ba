//! SQLite-backed session store.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::{Error, Result};

use super::schema::{initialize_schema, is_initialized};
use super::{SessionKind, SessionRecord, SessionStore, SessionSummary};

/// SQLite-backed session store.
#[derive(Clone)]
pub struct SqliteSessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSessionStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::Storage(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| Error::Storage(e.to_string()))?;

        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(|e| Error::Storage(e.to_string()))?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Storage(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::Storage(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        f(&conn).map_err(|e| Error::Storage(e.to_string()))
    }

    /// Number of stored sessions.
    pub fn count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| {
                row.get::<_, i64>(0)
            })
        })
        .map(|n| n as usize)
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    // Fixed width keeps lexical order equal to time order.
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn column_error(
    index: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
}

fn parse_timestamp(row: &rusqlite::Row, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| column_error(index, e))
}

fn parse_kind(row: &rusqlite::Row, index: usize) -> rusqlite::Result<SessionKind> {
    let raw: String = row.get(index)?;
    raw.parse().map_err(|e: Error| column_error(index, e))
}

fn row_to_summary(row: &rusqlite::Row) -> rusqlite::Result<SessionSummary> {
    Ok(SessionSummary {
        id: row.get(0)?,
        kind: parse_kind(row, 1)?,
        title: row.get(2)?,
        created_at: parse_timestamp(row, 3)?,
        updated_at: parse_timestamp(row, 4)?,
    })
}

impl SessionStore for SqliteSessionStore {
    fn load(&self, id: &str) -> Result<Option<SessionRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, kind, title, created_at, updated_at, state_json
                 FROM sessions WHERE id = ?1",
                params![id],
                |row| {
                    let summary = row_to_summary(row)?;
                    Ok(SessionRecord {
                        id: summary.id,
                        kind: summary.kind,
                        title: summary.title,
                        created_at: summary.created_at,
                        updated_at: summary.updated_at,
                        state_json: row.get(5)?,
                    })
                },
            )
            .optional()
        })
    }

    fn save(&self, record: &SessionRecord) -> Result<()> {
        debug!(
            id = %record.id,
            kind = %record.kind,
            bytes = record.state_json.len(),
            "saving session"
        );
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, kind, title, created_at, updated_at, state_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    kind = excluded.kind,
                    title = excluded.title,
                    updated_at = excluded.updated_at,
                    state_json = excluded.state_json",
                params![
                    record.id,
                    record.kind.as_str(),
                    record.title,
                    timestamp(&record.created_at),
                    timestamp(&record.updated_at),
                    record.state_json,
                ],
            )?;
            Ok(())
        })
    }

    fn delete(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
            Ok(rows > 0)
        })
    }

    fn list(&self, limit: usize) -> Result<Vec<SessionSummary>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, kind, title, created_at, updated_at
                 FROM sessions
                 ORDER BY updated_at DESC, id
                 LIMIT ?1",
            )?;
            let summaries = stmt
                .query_map(params![limit as i64], row_to_summary)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(summaries)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{EditAgent, EditState, Orchestrator, OrchestratorState};
    use crate::context::Message;
    use chrono::Duration;

    fn record(id: &str, minutes_ago: i64) -> SessionRecord {
        let at = Utc::now() - Duration::minutes(minutes_ago);
        SessionRecord {
            id: id.to_string(),
            kind: SessionKind::Chat,
            title: format!("session {id}"),
            created_at: at,
            updated_at: at,
            state_json: "{}".to_string(),
        }
    }

    #[test]
    fn test_save_and_load() {
        let store = SqliteSessionStore::in_memory().unwrap();
        let agent = EditAgent::new().unwrap();
        let state = agent.state_for("\\section{Intro}");
        let saved = SessionRecord::capture(SessionKind::Edit, &state).unwrap();

        store.save(&saved).unwrap();
        let loaded = store.load(&saved.id).unwrap().unwrap();

        assert_eq!(loaded.kind, SessionKind::Edit);
        assert_eq!(loaded.title, "Untitled Session");
        assert_eq!(loaded.created_at, saved.created_at);
        let restored: EditState = loaded.restore().unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_load_missing() {
        let store = SqliteSessionStore::in_memory().unwrap();
        assert!(store.load("ses_000000000000").unwrap().is_none());
    }

    #[test]
    fn test_save_upserts_and_keeps_created_at() {
        let store = SqliteSessionStore::in_memory().unwrap();
        let orchestrator = Orchestrator::with_defaults().unwrap();
        let mut state = orchestrator.start();
        let mut record = SessionRecord::capture(SessionKind::Research, &state).unwrap();
        store.save(&record).unwrap();

        state.transcript.push(Message::user("find papers on time"));
        let created = record.created_at;
        record.update(&state).unwrap();
        record.created_at = Utc::now();
        store.save(&record).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        let loaded = store.load(&record.id).unwrap().unwrap();
        assert_eq!(loaded.title, "find papers on time");
        assert_eq!(loaded.created_at, created);
        let restored: OrchestratorState = loaded.restore().unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_list_orders_by_update_and_limits() {
        let store = SqliteSessionStore::in_memory().unwrap();
        store.save(&record("ses_a", 30)).unwrap();
        store.save(&record("ses_b", 5)).unwrap();
        store.save(&record("ses_c", 60)).unwrap();

        let ids: Vec<String> = store.list(10).unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["ses_b", "ses_a", "ses_c"]);
        assert_eq!(store.list(2).unwrap().len(), 2);
    }

    #[test]
    fn test_delete() {
        let store = SqliteSessionStore::in_memory().unwrap();
        store.save(&record("ses_a", 0)).unwrap();

        assert!(store.delete("ses_a").unwrap());
        assert!(!store.delete("ses_a").unwrap());
        assert!(store.load("ses_a").unwrap().is_none());
    }

    #[test]
    fn test_reopen_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        {
            let store = SqliteSessionStore::open(&path).unwrap();
            store.save(&record("ses_keep", 0)).unwrap();
        }
        let store = SqliteSessionStore::open(&path).unwrap();
        assert_eq!(store.list(10).unwrap()[0].id, "ses_keep");
    }
}
