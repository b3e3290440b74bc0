use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use parley_core::entry::{ConversationEntry, EntryContent, Role};
use parley_core::ids::{EntryId, ParticipantId, SessionId, ToolUseId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A conversation entry as stored, with its session-local sequence number.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredEntry {
    pub sequence: i64,
    #[serde(flatten)]
    pub entry: ConversationEntry,
}

/// Audit record for an executed tool invocation. Not part of the replayed
/// conversation; the entry carrying the tool_result block is.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResultRecord {
    pub session_id: SessionId,
    pub tool_use_id: ToolUseId,
    pub content: serde_json::Value,
    pub participant_id: ParticipantId,
    pub created_at: String,
}

/// Per-session append lock for entry linearization.
/// Ensures sequence numbers are assigned without gaps or duplicates.
struct SessionLocks {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl SessionLocks {
    fn new() -> Self {
        Self {
            locks: HashMap::new(),
        }
    }

    fn get(&mut self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// The durable log: append-only conversation entries and tool-result audit
/// rows, keyed by session. Survives session roster churn; only
/// `purge_sessions_older_than` ever deletes.
pub struct ConversationLog {
    db: Database,
    session_locks: Mutex<SessionLocks>,
}

impl ConversationLog {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            session_locks: Mutex::new(SessionLocks::new()),
        }
    }

    /// Create a session record. Idempotent: re-creating an existing session
    /// is a no-op and does not touch its history.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn create_session(&self, session_id: &SessionId) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO sessions (id, created_at, last_active_at) VALUES (?1, ?2, ?2)",
                rusqlite::params![session_id.as_str(), now],
            )?;
            Ok(())
        })
    }

    /// Append an entry to a session's log. Atomically:
    /// 1. Acquires the per-session lock
    /// 2. Assigns the next sequence number
    /// 3. Inserts the entry and bumps the session's last_active_at
    #[instrument(skip(self, entry), fields(session_id = %session_id, role = %entry.role))]
    pub fn append_entry(
        &self,
        session_id: &SessionId,
        entry: &ConversationEntry,
    ) -> Result<StoredEntry, StoreError> {
        let lock = self.session_locks.lock().get(session_id.as_str());
        let _guard = lock.lock();

        self.db.with_conn(|conn| {
            let max_seq: i64 = conn
                .query_row(
                    "SELECT COALESCE((SELECT MAX(sequence) FROM entries WHERE session_id = ?1), -1)
                     FROM sessions WHERE id = ?1",
                    [session_id.as_str()],
                    |row| row.get(0),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        StoreError::NotFound(format!("session {session_id}"))
                    }
                    other => StoreError::from(other),
                })?;

            let sequence = max_seq + 1;
            let now = Utc::now().to_rfc3339();

            conn.execute(
                "INSERT INTO entries (id, session_id, sequence, role, author_name, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    entry.id.as_str(),
                    session_id.as_str(),
                    sequence,
                    entry.role.to_string(),
                    entry.author_name,
                    serde_json::to_string(&entry.content)?,
                    entry.created_at,
                ],
            )?;

            conn.execute(
                "UPDATE sessions SET last_active_at = ?1 WHERE id = ?2",
                rusqlite::params![now, session_id.as_str()],
            )?;

            Ok(StoredEntry {
                sequence,
                entry: entry.clone(),
            })
        })
    }

    /// List a session's entries ordered by sequence.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_entries(&self, session_id: &SessionId) -> Result<Vec<StoredEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sequence, role, author_name, content, created_at
                 FROM entries WHERE session_id = ?1
                 ORDER BY sequence ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_entry(row)?);
            }
            Ok(results)
        })
    }

    /// Persist a tool-result audit record.
    #[instrument(skip(self, content), fields(session_id = %session_id, tool_use_id = %tool_use_id))]
    pub fn append_tool_result(
        &self,
        session_id: &SessionId,
        tool_use_id: &ToolUseId,
        content: &serde_json::Value,
        participant_id: &ParticipantId,
    ) -> Result<ToolResultRecord, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tool_results (session_id, tool_use_id, content, participant_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    session_id.as_str(),
                    tool_use_id.as_str(),
                    serde_json::to_string(content)?,
                    participant_id.as_str(),
                    now,
                ],
            )?;
            Ok(ToolResultRecord {
                session_id: session_id.clone(),
                tool_use_id: tool_use_id.clone(),
                content: content.clone(),
                participant_id: participant_id.clone(),
                created_at: now,
            })
        })
    }

    /// List tool-result audit records for a session, oldest first.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_tool_results(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<ToolResultRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, tool_use_id, content, participant_id, created_at
                 FROM tool_results WHERE session_id = ?1 ORDER BY id ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                let content_raw: String = row_helpers::get(row, 2, "tool_results", "content")?;
                results.push(ToolResultRecord {
                    session_id: SessionId::from_raw(row_helpers::get::<String>(
                        row,
                        0,
                        "tool_results",
                        "session_id",
                    )?),
                    tool_use_id: ToolUseId::from_raw(row_helpers::get::<String>(
                        row,
                        1,
                        "tool_results",
                        "tool_use_id",
                    )?),
                    content: row_helpers::parse_json(&content_raw, "tool_results", "content")?,
                    participant_id: ParticipantId::from_raw(row_helpers::get::<String>(
                        row,
                        3,
                        "tool_results",
                        "participant_id",
                    )?),
                    created_at: row_helpers::get(row, 4, "tool_results", "created_at")?,
                });
            }
            Ok(results)
        })
    }

    /// Count entries for a session.
    pub fn count_entries(&self, session_id: &SessionId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM entries WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }

    /// Delete sessions (and, via cascade, their entries and tool results)
    /// that have been inactive longer than `max_age`. Returns how many
    /// sessions were removed.
    #[instrument(skip(self))]
    pub fn purge_sessions_older_than(&self, max_age: Duration) -> Result<usize, StoreError> {
        // A max_age too large to represent means no session can be old
        // enough, so purge nothing rather than falling back to a zero
        // cutoff that would sweep everything.
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };
        let cutoff = cutoff.to_rfc3339();
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM sessions WHERE last_active_at < ?1",
                [cutoff.as_str()],
            )?;
            if removed > 0 {
                tracing::info!(removed, "purged inactive sessions");
            }
            Ok(removed)
        })
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<StoredEntry, StoreError> {
    let role_raw: String = row_helpers::get(row, 2, "entries", "role")?;
    let content_raw: String = row_helpers::get(row, 4, "entries", "content")?;

    Ok(StoredEntry {
        sequence: row_helpers::get(row, 1, "entries", "sequence")?,
        entry: ConversationEntry {
            id: EntryId::from_raw(row_helpers::get::<String>(row, 0, "entries", "id")?),
            role: row_helpers::parse_enum::<Role>(&role_raw, "entries", "role")?,
            author_name: row_helpers::get_opt(row, 3, "entries", "author_name")?,
            content: row_helpers::parse_json::<EntryContent>(&content_raw, "entries", "content")?,
            created_at: row_helpers::get(row, 5, "entries", "created_at")?,
        },
    })
}
