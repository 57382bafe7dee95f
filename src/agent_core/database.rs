//! SQLite persistence for conversations, confirmation batches, and the audit log.
//!
//! Uses `rusqlite` in synchronous mode. Callers share one handle behind a
//! `std::sync::Mutex` and never hold the lock across an `.await`.

use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use super::conversation::ConversationState;
use super::errors::AgentError;
use super::types::{AuditEntry, AuditStatus, BatchStatus, ConfirmationBatch, ConversationMessage, PendingAction};
use crate::inference::types::{Role, ToolCall};

/// Database handle shared between the conversation and confirmation stores.
pub type SharedDatabase = Arc<Mutex<AgentDatabase>>;

/// Lock a shared handle, mapping poisoning to a database error.
pub(crate) fn lock(db: &SharedDatabase) -> Result<MutexGuard<'_, AgentDatabase>, AgentError> {
    db.lock().map_err(|e| AgentError::DatabaseError {
        reason: format!("database lock poisoned: {e}"),
    })
}

// ─── Database ───────────────────────────────────────────────────────────────

/// SQLite database handle for the agent core.
pub struct AgentDatabase {
    conn: Connection,
}

impl AgentDatabase {
    /// Open (or create) the agent database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, AgentError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self { conn };
        db.create_tables()?;
        Ok(db)
    }

    /// Wrap into a shareable handle.
    pub fn shared(self) -> SharedDatabase {
        Arc::new(Mutex::new(self))
    }

    /// Create all required tables if they don't exist.
    fn create_tables(&self) -> Result<(), AgentError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS conversation_state (
                identity TEXT PRIMARY KEY,
                pending_batch_id TEXT,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS conversation_turns (
                identity TEXT NOT NULL,
                seq INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT,
                tool_calls TEXT,
                tool_call_id TEXT,
                tool_result TEXT,
                PRIMARY KEY (identity, seq),
                FOREIGN KEY (identity) REFERENCES conversation_state(identity) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS confirmation_batches (
                id TEXT PRIMARY KEY,
                identity TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                timeout_minutes INTEGER NOT NULL,
                status TEXT NOT NULL,
                actions TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                identity TEXT NOT NULL,
                timestamp TEXT NOT NULL DEFAULT (datetime('now')),
                tool_name TEXT NOT NULL,
                arguments TEXT,
                result TEXT,
                result_status TEXT NOT NULL,
                user_confirmed INTEGER NOT NULL DEFAULT 0,
                execution_time_ms INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_audit_identity
                ON audit_log(identity);
            ",
        )?;
        Ok(())
    }

    // ─── Conversations ──────────────────────────────────────────────────

    /// Load a conversation. An unknown identity yields an empty state.
    pub fn load_conversation(&self, identity: &str) -> Result<ConversationState, AgentError> {
        let pending: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT pending_batch_id FROM conversation_state WHERE identity = ?1",
                params![identity],
                |row| row.get(0),
            )
            .optional()?;

        let Some(pending_batch) = pending else {
            return Ok(ConversationState::new(identity));
        };

        let mut stmt = self.conn.prepare(
            "SELECT timestamp, role, content, tool_calls, tool_call_id, tool_result
             FROM conversation_turns
             WHERE identity = ?1
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![identity], row_to_message)?;

        let mut turns = Vec::new();
        for row in rows {
            turns.push(row?);
        }

        Ok(ConversationState {
            identity: identity.to_string(),
            turns,
            pending_batch,
        })
    }

    /// Replace the stored conversation in one transaction.
    pub fn save_conversation(&self, state: &ConversationState) -> Result<(), AgentError> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO conversation_state (identity, pending_batch_id, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(identity) DO UPDATE SET
                pending_batch_id = excluded.pending_batch_id,
                updated_at = excluded.updated_at",
            params![state.identity, state.pending_batch],
        )?;
        tx.execute(
            "DELETE FROM conversation_turns WHERE identity = ?1",
            params![state.identity],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO conversation_turns
                 (identity, seq, timestamp, role, content, tool_calls, tool_call_id, tool_result)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for (seq, turn) in state.turns.iter().enumerate() {
                let tool_calls_json = turn
                    .tool_calls
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                let tool_result_json = turn
                    .tool_result
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                insert.execute(params![
                    state.identity,
                    seq as i64,
                    turn.timestamp,
                    turn.role.as_str(),
                    turn.content,
                    tool_calls_json,
                    turn.tool_call_id,
                    tool_result_json,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Remove a conversation entirely.
    pub fn delete_conversation(&self, identity: &str) -> Result<(), AgentError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM conversation_turns WHERE identity = ?1",
            params![identity],
        )?;
        tx.execute(
            "DELETE FROM conversation_state WHERE identity = ?1",
            params![identity],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ─── Confirmation batches ───────────────────────────────────────────

    /// Insert a new batch. Fails if the identity already owns one.
    pub fn insert_batch(&self, batch: &ConfirmationBatch) -> Result<(), AgentError> {
        let actions_json = serde_json::to_string(&batch.actions)?;
        self.conn.execute(
            "INSERT INTO confirmation_batches
             (id, identity, created_at, timeout_minutes, status, actions)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                batch.id,
                batch.identity,
                batch.created_at.to_rfc3339(),
                batch.timeout_minutes,
                batch.status.as_str(),
                actions_json,
            ],
        )?;
        Ok(())
    }

    /// Persist status and per-action changes of an existing batch.
    pub fn update_batch(&self, batch: &ConfirmationBatch) -> Result<(), AgentError> {
        let actions_json = serde_json::to_string(&batch.actions)?;
        self.conn.execute(
            "UPDATE confirmation_batches SET status = ?2, actions = ?3 WHERE id = ?1",
            params![batch.id, batch.status.as_str(), actions_json],
        )?;
        Ok(())
    }

    /// The batch owned by an identity, if any.
    pub fn get_batch_for_identity(
        &self,
        identity: &str,
    ) -> Result<Option<ConfirmationBatch>, AgentError> {
        let result = self
            .conn
            .query_row(
                "SELECT id, identity, created_at, timeout_minutes, status, actions
                 FROM confirmation_batches WHERE identity = ?1",
                params![identity],
                row_to_batch,
            )
            .optional()?;
        Ok(result)
    }

    /// Every stored batch, oldest first.
    pub fn list_batches(&self) -> Result<Vec<ConfirmationBatch>, AgentError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, identity, created_at, timeout_minutes, status, actions
             FROM confirmation_batches ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], row_to_batch)?;
        let mut batches = Vec::new();
        for row in rows {
            batches.push(row?);
        }
        Ok(batches)
    }

    /// Delete a batch by id. Returns whether a row was removed.
    pub fn delete_batch(&self, batch_id: &str) -> Result<bool, AgentError> {
        let removed = self.conn.execute(
            "DELETE FROM confirmation_batches WHERE id = ?1",
            params![batch_id],
        )?;
        Ok(removed > 0)
    }

    // ─── Audit Log ──────────────────────────────────────────────────────

    /// Insert an audit log entry.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_audit_entry(
        &self,
        identity: &str,
        tool_name: &str,
        arguments: &serde_json::Value,
        result: Option<&serde_json::Value>,
        status: AuditStatus,
        user_confirmed: bool,
        execution_time_ms: u64,
    ) -> Result<i64, AgentError> {
        let args_json = serde_json::to_string(arguments)?;
        let result_json = result.map(|r| serde_json::to_string(r).unwrap_or_default());

        self.conn.execute(
            "INSERT INTO audit_log
             (identity, tool_name, arguments, result, result_status,
              user_confirmed, execution_time_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                identity,
                tool_name,
                args_json,
                result_json,
                status.as_str(),
                user_confirmed as i32,
                execution_time_ms as i64,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Get audit log entries for an identity.
    pub fn get_audit_entries(&self, identity: &str) -> Result<Vec<AuditEntry>, AgentError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, identity, timestamp, tool_name, arguments,
                    result, result_status, user_confirmed, execution_time_ms
             FROM audit_log
             WHERE identity = ?1
             ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![identity], |row| {
            Ok(AuditEntry {
                id: row.get(0)?,
                identity: row.get(1)?,
                timestamp: row.get(2)?,
                tool_name: row.get(3)?,
                arguments: parse_json_value(row.get::<_, String>(4)?),
                result: row.get::<_, Option<String>>(5)?.map(parse_json_value),
                result_status: AuditStatus::parse(&row.get::<_, String>(6)?),
                user_confirmed: row.get::<_, i32>(7)? != 0,
                execution_time_ms: row.get::<_, i64>(8)? as u64,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationMessage> {
    Ok(ConversationMessage {
        timestamp: row.get(0)?,
        role: Role::parse(&row.get::<_, String>(1)?),
        content: row.get(2)?,
        tool_calls: row
            .get::<_, Option<String>>(3)?
            .and_then(|s| serde_json::from_str::<Vec<ToolCall>>(&s).ok()),
        tool_call_id: row.get(4)?,
        tool_result: row.get::<_, Option<String>>(5)?.map(parse_json_value),
    })
}

fn row_to_batch(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConfirmationBatch> {
    let created_raw: String = row.get(2)?;
    let created_at = chrono::DateTime::parse_from_rfc3339(&created_raw)
        .map(|d| d.with_timezone(&chrono::Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;
    let actions_raw: String = row.get(5)?;
    let actions: Vec<PendingAction> = serde_json::from_str(&actions_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(ConfirmationBatch {
        id: row.get(0)?,
        identity: row.get(1)?,
        created_at,
        timeout_minutes: row.get(3)?,
        status: BatchStatus::parse(&row.get::<_, String>(4)?),
        actions,
    })
}

/// Parse a JSON string into a serde_json::Value, defaulting to null.
fn parse_json_value(json: String) -> serde_json::Value {
    serde_json::from_str(&json).unwrap_or(serde_json::Value::Null)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::types::{ActionKind, ActionPreview, ActionStatus};
    use chrono::Utc;

    fn test_db() -> AgentDatabase {
        AgentDatabase::open(":memory:").unwrap()
    }

    fn sample_batch(identity: &str) -> ConfirmationBatch {
        ConfirmationBatch {
            id: "b1".to_string(),
            identity: identity.to_string(),
            created_at: Utc::now(),
            timeout_minutes: 5,
            status: BatchStatus::Pending,
            actions: vec![PendingAction {
                id: "1".to_string(),
                tool_call_id: "call_1".to_string(),
                tool_name: "delete_note".to_string(),
                kind: ActionKind::Delete,
                target: "Old.md".to_string(),
                preview: ActionPreview {
                    summary: "Delete note Old.md".to_string(),
                    before: Some("old".to_string()),
                    after: None,
                },
                arguments: serde_json::json!({"path": "Old.md"}),
                base_hash: Some("abc".to_string()),
                status: ActionStatus::Pending,
            }],
        }
    }

    #[test]
    fn test_absent_conversation_is_empty() {
        let db = test_db();
        let state = db.load_conversation("nobody").unwrap();
        assert_eq!(state.identity, "nobody");
        assert!(state.turns.is_empty());
        assert!(state.pending_batch.is_none());
    }

    #[test]
    fn test_conversation_roundtrip() {
        let db = test_db();
        let mut state = ConversationState::new("u1");
        state.push_user("delete Old.md");
        state.push_tool_calls(
            None,
            vec![ToolCall {
                id: "call_1".to_string(),
                name: "delete_note".to_string(),
                arguments: serde_json::json!({"path": "Old.md"}),
            }],
        );
        state.push_tool_result("call_1", serde_json::json!({"status": "ok"}));
        state.push_assistant("Done.");
        state.pending_batch = Some("b1".to_string());

        db.save_conversation(&state).unwrap();
        let loaded = db.load_conversation("u1").unwrap();
        assert_eq!(loaded, state);

        // Saving a shorter history replaces, never appends.
        state.turns.truncate(1);
        state.pending_batch = None;
        db.save_conversation(&state).unwrap();
        let loaded = db.load_conversation("u1").unwrap();
        assert_eq!(loaded.turns.len(), 1);
        assert!(loaded.pending_batch.is_none());

        db.delete_conversation("u1").unwrap();
        assert!(db.load_conversation("u1").unwrap().turns.is_empty());
    }

    #[test]
    fn test_batch_crud() {
        let db = test_db();
        let mut batch = sample_batch("u1");
        db.insert_batch(&batch).unwrap();
        // One batch per identity.
        let mut dup = sample_batch("u1");
        dup.id = "b2".to_string();
        assert!(db.insert_batch(&dup).is_err());

        let loaded = db.get_batch_for_identity("u1").unwrap().unwrap();
        assert_eq!(loaded.actions, batch.actions);
        assert_eq!(loaded.created_at.timestamp(), batch.created_at.timestamp());

        batch.actions[0].status = ActionStatus::Rejected;
        batch.status = BatchStatus::Rejected;
        db.update_batch(&batch).unwrap();
        let loaded = db.get_batch_for_identity("u1").unwrap().unwrap();
        assert_eq!(loaded.status, BatchStatus::Rejected);
        assert_eq!(loaded.actions[0].status, ActionStatus::Rejected);

        assert_eq!(db.list_batches().unwrap().len(), 1);
        assert!(db.delete_batch("b1").unwrap());
        assert!(!db.delete_batch("b1").unwrap());
        assert!(db.get_batch_for_identity("u1").unwrap().is_none());
    }

    #[test]
    fn test_audit_log() {
        let db = test_db();
        db.insert_audit_entry(
            "u1",
            "delete_note",
            &serde_json::json!({"path": "Old.md"}),
            Some(&serde_json::json!({"deleted": true})),
            AuditStatus::Success,
            false,
            12,
        )
        .unwrap();
        db.insert_audit_entry(
            "u1",
            "update_note",
            &serde_json::json!({"path": "A.md"}),
            None,
            AuditStatus::RejectedByUser,
            false,
            0,
        )
        .unwrap();

        let entries = db.get_audit_entries("u1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].result_status, AuditStatus::Success);
        assert_eq!(entries[0].arguments["path"], "Old.md");
        assert_eq!(entries[1].result_status, AuditStatus::RejectedByUser);
        assert!(entries[1].result.is_none());
        assert!(db.get_audit_entries("u2").unwrap().is_empty());
    }
}
