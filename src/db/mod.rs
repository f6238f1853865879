use rusqlite::{ffi, Connection, ErrorCode, OptionalExtension, Row};
use std::sync::{Arc, Mutex, MutexGuard};
use crate::error::StoreError;
use tracing::{info, debug};

pub mod schema;

/// Stored in place of empty message content.
pub const NO_CONTENT: &str = "<no content>";

/// Canonical stored form of message content.
pub fn normalize_content(content: &str) -> String {
    if content.is_empty() {
        NO_CONTENT.to_string()
    } else {
        content.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedMessage {
    pub message_id: u64,
    pub guild_id: u64,
    pub channel_id: u64,
    pub author_id: u64,
    pub content: String,
    /// Unix seconds of creation.
    pub timestamp: i64,
}

impl LoggedMessage {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            message_id: row.get::<_, i64>(0)? as u64,
            guild_id: row.get::<_, i64>(1)? as u64,
            channel_id: row.get::<_, i64>(2)? as u64,
            author_id: row.get::<_, i64>(3)? as u64,
            content: row.get(4)?,
            timestamp: row.get(5)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedAttachment {
    pub attachment_id: u64,
    pub message_id: u64,
    pub url: String,
    pub is_image: bool,
}

const MESSAGE_COLUMNS: &str = "message_id, guild_id, channel_id, author_id, content, timestamp";

#[derive(Clone)]
pub struct Database {
    path: String,
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::StorageUnavailable(e.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;

        Ok(Self {
            path: path.to_string(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Worker("database mutex poisoned".to_string()))
    }

    /// Runs a synchronous database call on the blocking pool.
    pub async fn run_blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StoreError::Worker(e.to_string()))?
    }

    pub fn execute_init(&self) -> Result<(), StoreError> {
        info!("Database: Initializing schema...");
        let conn = self.conn()?;
        conn.execute_batch(schema::SCHEMA)?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    /// Cheap liveness check.
    pub fn ping(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    /// Reopens the underlying connection and verifies it answers queries.
    /// In-memory databases are only pinged, reopening would drop their data.
    pub fn reconnect(&self) -> Result<(), StoreError> {
        if self.path == ":memory:" {
            return self.ping();
        }

        let fresh = Connection::open(&self.path)?;
        fresh.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        fresh.execute_batch(schema::SCHEMA)?;

        let mut conn = self.conn()?;
        *conn = fresh;
        info!("Database: Reconnected to {}", self.path);
        Ok(())
    }

    pub fn get_message(&self, message_id: u64) -> Result<Option<LoggedMessage>, StoreError> {
        let conn = self.conn()?;
        let message = conn
            .query_row(
                &format!("SELECT {} FROM logged_messages WHERE message_id = ?1", MESSAGE_COLUMNS),
                [message_id as i64],
                LoggedMessage::from_row,
            )
            .optional()?;
        Ok(message)
    }

    /// Inserts a message together with its attachments in one transaction.
    /// Fails with `DuplicateKey` when the message is already logged, in which
    /// case nothing is written.
    pub fn insert_message(
        &self,
        message: &LoggedMessage,
        attachments: &[LoggedAttachment],
    ) -> Result<(), StoreError> {
        debug!(
            "Database: Logging message {} from user {} in channel {}",
            message.message_id, message.author_id, message.channel_id
        );
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            &format!("INSERT INTO logged_messages ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)", MESSAGE_COLUMNS),
            (
                message.message_id as i64,
                message.guild_id as i64,
                message.channel_id as i64,
                message.author_id as i64,
                normalize_content(&message.content),
                message.timestamp,
            ),
        );
        if let Err(e) = inserted {
            if is_unique_violation(&e) {
                return Err(StoreError::DuplicateKey(message.message_id));
            }
            return Err(e.into());
        }

        for attachment in attachments {
            tx.execute(
                "INSERT OR IGNORE INTO logged_attachments (attachment_id, message_id, url, is_image)
                 VALUES (?1, ?2, ?3, ?4)",
                (
                    attachment.attachment_id as i64,
                    attachment.message_id as i64,
                    &attachment.url,
                    attachment.is_image,
                ),
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Replaces the content of a logged message. The creation timestamp is
    /// left untouched.
    pub fn update_content(&self, message_id: u64, content: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE logged_messages SET content = ?1 WHERE message_id = ?2",
            (normalize_content(content), message_id as i64),
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(message_id));
        }
        Ok(())
    }

    /// Newest `limit` messages of a channel, ordered by id descending.
    pub fn list_by_channel(&self, channel_id: u64, limit: usize) -> Result<Vec<LoggedMessage>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM logged_messages WHERE channel_id = ?1 ORDER BY message_id DESC LIMIT ?2",
            MESSAGE_COLUMNS
        ))?;
        let rows = stmt.query_map((channel_id as i64, limit as i64), LoggedMessage::from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Logged messages among `ids`, ordered by id ascending. Unknown ids are skipped.
    pub fn get_many(&self, ids: &[u64]) -> Result<Vec<LoggedMessage>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM logged_messages WHERE message_id IN ({}) ORDER BY message_id ASC",
            MESSAGE_COLUMNS,
            vec!["?"; ids.len()].join(", ")
        );
        let params: Vec<i64> = ids.iter().map(|id| *id as i64).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), LoggedMessage::from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn attachments_for(&self, message_id: u64) -> Result<Vec<LoggedAttachment>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT attachment_id, message_id, url, is_image FROM logged_attachments
             WHERE message_id = ?1 ORDER BY attachment_id ASC",
        )?;
        let rows = stmt.query_map([message_id as i64], |row| {
            Ok(LoggedAttachment {
                attachment_id: row.get::<_, i64>(0)? as u64,
                message_id: row.get::<_, i64>(1)? as u64,
                url: row.get(2)?,
                is_image: row.get(3)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == ErrorCode::ConstraintViolation
                && matches!(
                    e.extended_code,
                    ffi::SQLITE_CONSTRAINT_PRIMARYKEY | ffi::SQLITE_CONSTRAINT_UNIQUE
                )
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        let db = Database::open(":memory:").unwrap();
        db.execute_init().unwrap();
        db
    }

    fn message(id: u64, channel_id: u64, content: &str) -> LoggedMessage {
        LoggedMessage {
            message_id: id,
            guild_id: 1,
            channel_id,
            author_id: 42,
            content: content.to_string(),
            timestamp: 1_600_000_000 + id as i64,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let db = test_db();
        let attachment = LoggedAttachment {
            attachment_id: 900,
            message_id: 5,
            url: "https://cdn.example/a.png".to_string(),
            is_image: true,
        };
        db.insert_message(&message(5, 10, "hi"), &[attachment.clone()]).unwrap();

        let stored = db.get_message(5).unwrap().unwrap();
        assert_eq!(stored.content, "hi");
        assert_eq!(db.attachments_for(5).unwrap(), vec![attachment]);
        assert!(db.get_message(6).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_insert_is_reported() {
        let db = test_db();
        db.insert_message(&message(5, 10, "first"), &[]).unwrap();

        let err = db.insert_message(&message(5, 10, "second"), &[]).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(5)));
        // The first write wins, nothing was overwritten
        assert_eq!(db.get_message(5).unwrap().unwrap().content, "first");
    }

    #[test]
    fn test_update_preserves_timestamp() {
        let db = test_db();
        let original = message(5, 10, "hi");
        db.insert_message(&original, &[]).unwrap();
        db.update_content(5, "hi edited").unwrap();

        let stored = db.get_message(5).unwrap().unwrap();
        assert_eq!(stored.content, "hi edited");
        assert_eq!(stored.timestamp, original.timestamp);
    }

    #[test]
    fn test_update_missing_is_not_found() {
        let db = test_db();
        let err = db.update_content(77, "x").unwrap_err();
        assert!(matches!(err, StoreError::NotFound(77)));
    }

    #[test]
    fn test_empty_content_is_normalized() {
        let db = test_db();
        db.insert_message(&message(5, 10, ""), &[]).unwrap();
        assert_eq!(db.get_message(5).unwrap().unwrap().content, NO_CONTENT);

        db.update_content(5, "").unwrap();
        assert_eq!(db.get_message(5).unwrap().unwrap().content, NO_CONTENT);
    }

    #[test]
    fn test_list_by_channel_is_newest_first_and_bounded() {
        let db = test_db();
        for id in 1..=10 {
            db.insert_message(&message(id, 10, "m"), &[]).unwrap();
        }
        db.insert_message(&message(11, 20, "other channel"), &[]).unwrap();

        let listed = db.list_by_channel(10, 3).unwrap();
        let ids: Vec<u64> = listed.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![10, 9, 8]);
        assert_eq!(db.list_by_channel(10, 100).unwrap().len(), 10);
    }

    #[test]
    fn test_unique_violation_only_matches_key_constraints() {
        assert!(!is_unique_violation(&rusqlite::Error::QueryReturnedNoRows));
        assert!(!is_unique_violation(&rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_IOERR),
            None
        )));
        assert!(is_unique_violation(&rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_CONSTRAINT_PRIMARYKEY),
            None
        )));
    }

    #[test]
    fn test_get_many_skips_unknown_and_sorts() {
        let db = test_db();
        db.insert_message(&message(3, 10, "c"), &[]).unwrap();
        db.insert_message(&message(1, 10, "a"), &[]).unwrap();

        let found = db.get_many(&[3, 2, 1]).unwrap();
        let ids: Vec<u64> = found.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(db.get_many(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_attachment_may_precede_message() {
        let db = test_db();
        let early = LoggedAttachment {
            attachment_id: 1,
            message_id: 5,
            url: "https://cdn.example/early.txt".to_string(),
            is_image: false,
        };
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO logged_attachments (attachment_id, message_id, url, is_image) VALUES (1, 5, ?1, 0)",
                [&early.url],
            )
            .unwrap();
        }
        // Re-delivering the same attachment with the message is fine
        db.insert_message(&message(5, 10, "late"), &[early.clone()]).unwrap();
        assert_eq!(db.attachments_for(5).unwrap(), vec![early]);
    }

    #[test]
    fn test_reconnect_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("log.db");
        let db = Database::open(path.to_str().unwrap()).unwrap();
        db.execute_init().unwrap();
        db.insert_message(&message(5, 10, "kept"), &[]).unwrap();

        db.reconnect().unwrap();
        assert_eq!(db.get_message(5).unwrap().unwrap().content, "kept");
    }

    #[tokio::test]
    async fn test_run_blocking() {
        let db = test_db();
        db.insert_message(&message(5, 10, "hi"), &[]).unwrap();
        let found = db.run_blocking(|db| db.get_message(5)).await.unwrap();
        assert!(found.is_some());
    }
}
