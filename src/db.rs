//! Database module for the broker
//!
//! Provides persistence for conversations, their message chains, feedback,
//! FSM definitions and cached machine checkpoints.

mod schema;

pub use schema::*;

use crate::fsm::{FsmDefinition, State};
use crate::mml::{Message, NewMessage, ValidationError};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Message not found: {0}")]
    MessageNotFound(String),
    #[error("FSM definition not found: {0}")]
    DefinitionNotFound(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ==================== Conversation Operations ====================

    /// Look up a conversation by its platform id, creating it on first use
    pub fn get_or_create_conversation(&self, platform_conversation_id: &str) -> DbResult<Conversation> {
        let conn = self.conn();
        if let Some(existing) = conn
            .query_row(
                "SELECT id, platform_conversation_id, created_at, updated_at
                 FROM conversations WHERE platform_conversation_id = ?1",
                params![platform_conversation_id],
                parse_conversation_row,
            )
            .optional()?
        {
            return Ok(existing);
        }

        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO conversations (id, platform_conversation_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![id, platform_conversation_id, now.to_rfc3339()],
        )?;
        tracing::info!(conv_id = %id, platform_conversation_id, "Created conversation");

        Ok(Conversation {
            id,
            platform_conversation_id: platform_conversation_id.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Look up a conversation by its platform id without creating it
    pub fn find_conversation(&self, platform_conversation_id: &str) -> DbResult<Option<Conversation>> {
        let conv = self
            .conn()
            .query_row(
                "SELECT id, platform_conversation_id, created_at, updated_at
                 FROM conversations WHERE platform_conversation_id = ?1",
                params![platform_conversation_id],
                parse_conversation_row,
            )
            .optional()?;
        Ok(conv)
    }

    /// Get conversation by ID
    #[allow(dead_code)] // Used in tests
    pub fn get_conversation(&self, id: &str) -> DbResult<Conversation> {
        self.conn()
            .query_row(
                "SELECT id, platform_conversation_id, created_at, updated_at
                 FROM conversations WHERE id = ?1",
                params![id],
                parse_conversation_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::ConversationNotFound(id.to_string()),
                other => DbError::Sqlite(other),
            })
    }

    /// Delete a conversation with its messages, feedback and cached machine
    pub fn delete_conversation(&self, id: &str) -> DbResult<()> {
        let conn = self.conn();

        // Dependent rows are deleted by CASCADE
        let deleted = conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;

        if deleted == 0 {
            return Err(DbError::ConversationNotFound(id.to_string()));
        }
        Ok(())
    }

    // ==================== Message Operations ====================

    /// Append a validated turn to its conversation's chain.
    ///
    /// `prev` must be null only for the first turn, must name a message of
    /// the same conversation, and no two turns may share it.
    pub fn add_message(&self, msg: &NewMessage) -> DbResult<Message> {
        msg.validate()?;
        let conn = self.conn();

        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = ?1)",
            params![msg.conversation_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(DbError::ConversationNotFound(msg.conversation_id.clone()));
        }
        check_prev(&conn, msg)?;

        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        // Stored at millisecond precision
        let send_time = DateTime::<Utc>::from_timestamp_millis(msg.send_time.timestamp_millis())
            .unwrap_or(msg.send_time);
        let sequence_id: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sequence_id), 0) + 1 FROM messages WHERE conversation_id = ?1",
            params![msg.conversation_id],
            |row| row.get(0),
        )?;

        conn.execute(
            "INSERT INTO messages (id, conversation_id, sequence_id, sender, stacks, send_time, prev, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                msg.conversation_id,
                sequence_id,
                serde_json::to_string(&msg.sender)?,
                serde_json::to_string(&msg.stacks)?,
                send_time.timestamp_millis(),
                msg.prev,
                now.to_rfc3339(),
            ],
        )?;

        // Update conversation timestamp
        conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), msg.conversation_id],
        )?;

        Ok(Message {
            id,
            conversation_id: msg.conversation_id.clone(),
            sequence_id,
            sender: msg.sender.clone(),
            stacks: msg.stacks.clone(),
            send_time,
            prev: msg.prev.clone(),
            created_at: now,
        })
    }

    /// Get messages for a conversation, oldest first
    pub fn get_messages(&self, conversation_id: &str) -> DbResult<Vec<Message>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, sequence_id, sender, stacks, send_time, prev, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY sequence_id ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id], parse_message_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Most recently created message of a conversation
    pub fn get_last_message(&self, conversation_id: &str) -> DbResult<Option<Message>> {
        self.conn()
            .query_row(
                "SELECT id, conversation_id, sequence_id, sender, stacks, send_time, prev, created_at
                 FROM messages WHERE conversation_id = ?1 ORDER BY sequence_id DESC LIMIT 1",
                params![conversation_id],
                parse_message_row,
            )
            .optional()
            .map_err(DbError::from)
    }

    // ==================== Feedback Operations ====================

    pub fn add_feedback(
        &self,
        conversation_id: &str,
        message_id: &str,
        vote: Vote,
        comment: Option<&str>,
    ) -> DbResult<Feedback> {
        let conn = self.conn();
        let owner: Option<String> = conn
            .query_row(
                "SELECT conversation_id FROM messages WHERE id = ?1",
                params![message_id],
                |row| row.get(0),
            )
            .optional()?;
        if owner.as_deref() != Some(conversation_id) {
            return Err(DbError::MessageNotFound(message_id.to_string()));
        }

        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO feedback (id, conversation_id, message_id, vote, comment, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, conversation_id, message_id, vote.to_string(), comment, now.to_rfc3339()],
        )?;

        Ok(Feedback {
            id,
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
            vote,
            comment: comment.map(String::from),
            created_at: now,
        })
    }

    #[allow(dead_code)] // Used in tests
    pub fn get_feedback(&self, conversation_id: &str) -> DbResult<Vec<Feedback>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, message_id, vote, comment, created_at
             FROM feedback WHERE conversation_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| {
            let vote: String = row.get(3)?;
            Ok(Feedback {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                message_id: row.get(2)?,
                vote: vote
                    .parse()
                    .map_err(|e: String| conversion_error(3, e.into()))?,
                comment: row.get(4)?,
                created_at: parse_datetime(&row.get::<_, String>(5)?),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    // ==================== FSM Definition Operations ====================

    /// Insert or replace the definition with this name. Returns it with its
    /// store id filled in.
    pub fn upsert_fsm_definition(&self, def: &FsmDefinition) -> DbResult<FsmDefinition> {
        let conn = self.conn();
        let now = Utc::now();
        let body = serde_json::to_string(&FsmDefinition {
            id: None,
            ..def.clone()
        })?;

        conn.execute(
            "INSERT INTO fsm_definitions (name, definition, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(name) DO UPDATE SET definition = excluded.definition, updated_at = excluded.updated_at",
            params![def.name, body, now.to_rfc3339()],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM fsm_definitions WHERE name = ?1",
            params![def.name],
            |row| row.get(0),
        )?;

        Ok(FsmDefinition {
            id: Some(id),
            ..def.clone()
        })
    }

    #[allow(dead_code)] // Used in tests
    pub fn get_fsm_definition(&self, id: i64) -> DbResult<FsmDefinition> {
        self.conn()
            .query_row(
                "SELECT id, definition FROM fsm_definitions WHERE id = ?1",
                params![id],
                parse_definition_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::DefinitionNotFound(id.to_string()),
                other => DbError::Sqlite(other),
            })
    }

    pub fn get_fsm_definition_by_name(&self, name: &str) -> DbResult<FsmDefinition> {
        self.conn()
            .query_row(
                "SELECT id, definition FROM fsm_definitions WHERE name = ?1",
                params![name],
                parse_definition_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::DefinitionNotFound(name.to_string()),
                other => DbError::Sqlite(other),
            })
    }

    #[allow(dead_code)] // Used in tests
    pub fn list_fsm_definitions(&self) -> DbResult<Vec<FsmDefinition>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, definition FROM fsm_definitions ORDER BY name ASC")?;
        let rows = stmt.query_map([], parse_definition_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    // ==================== Checkpoint Operations ====================

    /// Create-or-update the cached machine of a conversation. The definition
    /// is resolved by name.
    pub fn save_checkpoint(&self, conversation_id: &str, fsm_name: &str, state: &State) -> DbResult<()> {
        let conn = self.conn();
        let fsm_definition_id: i64 = conn
            .query_row(
                "SELECT id FROM fsm_definitions WHERE name = ?1",
                params![fsm_name],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| DbError::DefinitionNotFound(fsm_name.to_string()))?;

        conn.execute(
            "INSERT INTO cached_machines (conversation_id, fsm_definition_id, current_state, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(conversation_id) DO UPDATE SET
                 fsm_definition_id = excluded.fsm_definition_id,
                 current_state = excluded.current_state,
                 updated_at = excluded.updated_at",
            params![
                conversation_id,
                fsm_definition_id,
                serde_json::to_string(state)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_checkpoint(&self, conversation_id: &str) -> DbResult<Option<Checkpoint>> {
        self.conn()
            .query_row(
                "SELECT c.conversation_id, c.fsm_definition_id, d.name, c.current_state, c.updated_at
                 FROM cached_machines c JOIN fsm_definitions d ON d.id = c.fsm_definition_id
                 WHERE c.conversation_id = ?1",
                params![conversation_id],
                |row| {
                    let state: String = row.get(3)?;
                    Ok(Checkpoint {
                        conversation_id: row.get(0)?,
                        fsm_definition_id: Some(row.get(1)?),
                        fsm_name: row.get(2)?,
                        state: serde_json::from_str(&state)
                            .map_err(|e| conversion_error(3, Box::new(e)))?,
                        updated_at: parse_datetime(&row.get::<_, String>(4)?),
                    })
                },
            )
            .optional()
            .map_err(DbError::from)
    }

    #[cfg(test)]
    fn count_checkpoints(&self, conversation_id: &str) -> DbResult<i64> {
        self.conn()
            .query_row(
                "SELECT COUNT(*) FROM cached_machines WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .map_err(DbError::from)
    }
}

/// Chain linkage rules for a new message. Caller holds the connection lock.
fn check_prev(conn: &Connection, msg: &NewMessage) -> DbResult<()> {
    match &msg.prev {
        None => {
            let has_head: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM messages WHERE conversation_id = ?1 AND prev IS NULL)",
                params![msg.conversation_id],
                |row| row.get(0),
            )?;
            if has_head {
                return Err(ValidationError::DuplicatePrev.into());
            }
        }
        Some(prev) => {
            let owner: Option<String> = conn
                .query_row(
                    "SELECT conversation_id FROM messages WHERE id = ?1",
                    params![prev],
                    |row| row.get(0),
                )
                .optional()?;
            match owner {
                None => return Err(ValidationError::UnknownPrev(prev.clone()).into()),
                Some(owner) if owner != msg.conversation_id => {
                    return Err(ValidationError::ForeignPrev(prev.clone()).into())
                }
                Some(_) => {}
            }
            let taken: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM messages WHERE conversation_id = ?1 AND prev = ?2)",
                params![msg.conversation_id, prev],
                |row| row.get(0),
            )?;
            if taken {
                return Err(ValidationError::DuplicatePrev.into());
            }
        }
    }
    Ok(())
}

fn parse_conversation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        platform_conversation_id: row.get(1)?,
        created_at: parse_datetime(&row.get::<_, String>(2)?),
        updated_at: parse_datetime(&row.get::<_, String>(3)?),
    })
}

/// Parse a message row from the database
fn parse_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let sender: String = row.get(3)?;
    let stacks: String = row.get(4)?;
    let send_time: i64 = row.get(5)?;

    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sequence_id: row.get(2)?,
        sender: serde_json::from_str(&sender).map_err(|e| conversion_error(3, Box::new(e)))?,
        stacks: serde_json::from_str(&stacks).map_err(|e| conversion_error(4, Box::new(e)))?,
        send_time: DateTime::<Utc>::from_timestamp_millis(send_time).unwrap_or_default(),
        prev: row.get(6)?,
        created_at: parse_datetime(&row.get::<_, String>(7)?),
    })
}

fn parse_definition_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FsmDefinition> {
    let id: i64 = row.get(0)?;
    let body: String = row.get(1)?;
    let def: FsmDefinition =
        serde_json::from_str(&body).map_err(|e| conversion_error(1, Box::new(e)))?;
    Ok(FsmDefinition { id: Some(id), ..def })
}

fn conversion_error(
    column: usize,
    err: Box<dyn std::error::Error + Send + Sync + 'static>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, err)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
