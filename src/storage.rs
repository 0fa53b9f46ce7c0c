use crate::domain::models::{ConversationTurn, Role, SessionSummary};
use crate::domain::ports::ConversationStore;
use crate::error::{GatewayError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// SQLite-backed session and message store.
pub struct Storage {
    db: Mutex<Connection>,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        model_used TEXT,
        created_at TEXT NOT NULL,
        FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_messages_session_id ON messages(session_id);
    CREATE INDEX IF NOT EXISTS idx_sessions_updated_at ON sessions(updated_at DESC);
";

const SESSION_COLUMNS: &str = "
    SELECT s.id, s.name, s.created_at, s.updated_at, COUNT(m.id)
    FROM sessions s
    LEFT JOIN messages m ON s.id = m.session_id
";

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn timestamp(row: &Row<'_>, idx: usize) -> SqliteResult<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn session_from_row(row: &Row<'_>) -> SqliteResult<SessionSummary> {
    Ok(SessionSummary {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: timestamp(row, 2)?,
        updated_at: timestamp(row, 3)?,
        message_count: row.get(4)?,
    })
}

fn turn_from_row(row: &Row<'_>) -> SqliteResult<ConversationTurn> {
    let role: String = row.get(2)?;
    Ok(ConversationTurn {
        id: row.get(0)?,
        session_id: row.get(1)?,
        // Unknown roles can only come from hand-edited databases.
        role: Role::parse(&role).unwrap_or(Role::System),
        content: row.get(3)?,
        model_used: row.get(4)?,
        created_at: timestamp(row, 5)?,
    })
}

impl Storage {
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| GatewayError::Storage(e.to_string()))?;
        }
        debug!(path = %db_path.display(), "Opening session database");
        Self::init(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> Result<Self> {
        db.execute("PRAGMA foreign_keys = ON", [])?;
        db.execute_batch(SCHEMA)?;
        Ok(Storage { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| GatewayError::Storage("database lock poisoned".to_string()))
    }
}

impl ConversationStore for Storage {
    fn create_conversation(&self, name: &str) -> Result<SessionSummary> {
        let db = self.conn()?;
        let ts = now();
        db.execute(
            "INSERT INTO sessions (name, created_at, updated_at) VALUES (?1, ?2, ?2)",
            params![name, ts],
        )?;
        let id = db.last_insert_rowid();
        let session = db.query_row(
            &format!("{} WHERE s.id = ?1 GROUP BY s.id", SESSION_COLUMNS),
            params![id],
            session_from_row,
        )?;
        Ok(session)
    }

    fn get_conversation(&self, id: i64) -> Result<Option<SessionSummary>> {
        let db = self.conn()?;
        let session = db
            .query_row(
                &format!("{} WHERE s.id = ?1 GROUP BY s.id", SESSION_COLUMNS),
                params![id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    fn list_conversations(&self, limit: usize) -> Result<Vec<SessionSummary>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(&format!(
            "{} GROUP BY s.id ORDER BY s.updated_at DESC, s.id DESC LIMIT ?1",
            SESSION_COLUMNS
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sessions = stmt
            .query_map(params![limit], session_from_row)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(sessions)
    }

    fn delete_conversation(&self, id: i64) -> Result<bool> {
        let db = self.conn()?;
        let removed = db.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    fn append_turn(
        &self,
        conversation_id: i64,
        role: Role,
        content: &str,
        model_used: Option<&str>,
    ) -> Result<ConversationTurn> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let ts = now();

        let touched = tx.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            params![ts, conversation_id],
        )?;
        if touched == 0 {
            return Err(GatewayError::NotFound("Session".to_string()));
        }

        tx.execute(
            "INSERT INTO messages (session_id, role, content, model_used, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![conversation_id, role.as_str(), content, model_used, ts],
        )?;
        let id = tx.last_insert_rowid();
        let turn = tx.query_row(
            "SELECT id, session_id, role, content, model_used, created_at FROM messages WHERE id = ?1",
            params![id],
            turn_from_row,
        )?;
        tx.commit()?;
        Ok(turn)
    }

    fn list_turns(&self, conversation_id: i64) -> Result<Vec<ConversationTurn>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT id, session_id, role, content, model_used, created_at
             FROM messages
             WHERE session_id = ?1
             ORDER BY created_at ASC, id ASC",
        )?;
        let turns = stmt
            .query_map(params![conversation_id], turn_from_row)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(turns)
    }
}
