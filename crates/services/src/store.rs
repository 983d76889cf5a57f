//! SQLite chat-history database.
//!
//! Stores chats, their messages, message attachments and user preferences.
//! Deleting a chat cascades to its messages and their attachments.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use shared::{Attachment, Chat, ChatStore, Message, PreferenceValue};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Database file name inside the data directory
pub const DATABASE_FILE: &str = "corral.db";

pub struct SqlStore {
    conn: Arc<Mutex<Connection>>,
    db_path: Option<PathBuf>,
}

impl SqlStore {
    /// Open (or create) the chat database inside `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;
        let db_path = data_dir.join(DATABASE_FILE);
        let conn = Connection::open(&db_path)?;
        Self::init_schema(&conn)?;
        tracing::debug!(path = %db_path.display(), "opened chat database");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: Some(db_path),
        })
    }

    /// In-memory database for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                model_name TEXT,
                text TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS attachments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                path TEXT
            );

            CREATE TABLE IF NOT EXISTS preferences (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id);
            CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id);",
        )?;
        Ok(())
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp {raw}"))?
        .with_timezone(&Utc))
}

fn write_message(conn: &Connection, message: &Message, chat_id: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (id, chat_id, role, model_name, text, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            model_name = excluded.model_name,
            text = excluded.text",
        params![
            message.id,
            chat_id,
            message.role.as_str(),
            message.model_name,
            message.text,
            message.timestamp.to_rfc3339(),
        ],
    )?;
    conn.execute(
        "UPDATE chats SET updated_at = ?1 WHERE id = ?2",
        params![Utc::now().to_rfc3339(), chat_id],
    )?;
    Ok(())
}

fn write_attachment(conn: &Connection, message_id: &str, attachment: &Attachment) -> Result<()> {
    conn.execute(
        "INSERT INTO attachments (message_id, name, kind, content, path)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            message_id,
            attachment.name,
            attachment.kind.as_str(),
            attachment.content,
            attachment
                .path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
        ],
    )?;
    Ok(())
}

impl ChatStore for SqlStore {
    fn get_chats(&self) -> Result<Vec<Chat>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, name FROM chats ORDER BY updated_at DESC, rowid")?;
        let chats = stmt
            .query_map([], |row| {
                Ok(Chat {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(chats)
    }

    fn insert_chat(&self, chat: &Chat) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO chats (id, name, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
            params![chat.id, chat.name, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn rename_chat(&self, chat_id: &str, name: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE chats SET name = ?1 WHERE id = ?2",
            params![name, chat_id],
        )?;
        Ok(())
    }

    fn delete_chat(&self, chat_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM chats WHERE id = ?1", params![chat_id])?;
        Ok(())
    }

    fn get_messages(&self, chat_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn.lock();

        let mut attachments: HashMap<String, Vec<Attachment>> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT a.message_id, a.name, a.kind, a.content, a.path
                 FROM attachments a JOIN messages m ON m.id = a.message_id
                 WHERE m.chat_id = ?1 ORDER BY a.id",
            )?;
            let rows = stmt.query_map(params![chat_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?;
            for row in rows {
                let (message_id, name, kind, content, path) = row?;
                attachments.entry(message_id).or_default().push(Attachment {
                    name,
                    kind: kind.parse()?,
                    content,
                    path: path.map(PathBuf::from),
                });
            }
        }

        let mut stmt = conn.prepare(
            "SELECT id, role, model_name, text, timestamp FROM messages
             WHERE chat_id = ?1 ORDER BY timestamp, id",
        )?;
        let rows = stmt.query_map(params![chat_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (id, role, model_name, text, timestamp) = row?;
            let message_attachments = attachments.remove(&id).unwrap_or_default();
            messages.push(Message {
                id,
                timestamp: parse_timestamp(&timestamp)?,
                role: role.parse()?,
                model_name,
                text,
                attachments: message_attachments,
            });
        }
        Ok(messages)
    }

    fn insert_or_update_message(&self, message: &Message, chat_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        write_message(&conn, message, chat_id)
    }

    fn insert_messages(&self, messages: &[&Message], chat_id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for message in messages {
            write_message(&tx, message, chat_id)?;
            for attachment in &message.attachments {
                write_attachment(&tx, &message.id, attachment)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_message(&self, message_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM messages WHERE id = ?1", params![message_id])?;
        Ok(())
    }

    fn get_preference(&self, key: &str) -> Result<Option<PreferenceValue>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM preferences WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|value| {
            serde_json::from_str(&value).with_context(|| format!("bad preference value for {key}"))
        })
        .transpose()
    }

    fn insert_or_update_preferences(&self, values: &[(&str, PreferenceValue)]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for (key, value) in values {
            tx.execute(
                "INSERT INTO preferences (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, serde_json::to_string(value)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}
