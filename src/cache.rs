//! Durable Message-Id -> message cache.
//!
//! The cache guarantees each source body is fetched over the wire at
//! most once per Message-Id. It is a single-table SQLite database kept
//! under the `--db` directory; the database is a cache of server state
//! and is safe to delete between runs (a performance regression only).
//!
//! Entries are never evicted. The one exception is a checker observing
//! confirmed absence in the source, which deletes the corresponding
//! entry so the cache stays a subset of what the source has ever held.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};

use crate::types::{MessageData, Result};

pub type CachePool = Pool<SqliteConnectionManager>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    message_id    TEXT PRIMARY KEY,
    internal_date TEXT NOT NULL,
    body          BLOB NOT NULL
);
";

/// Handle to the message cache. Cloning is cheap and clones share the
/// underlying connection pool, so every worker can hold one.
#[derive(Clone)]
pub struct MessageCache {
    pool: CachePool,
}

impl MessageCache {
    /// Open (creating if needed) the cache under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let manager = SqliteConnectionManager::file(dir.join("messages.db"));
        let pool = Pool::builder().max_size(8).build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self { pool })
    }

    /// Look up a message body by Message-Id. `Ok(None)` is the distinct
    /// not-found reply; all other failures surface the store error.
    pub fn get(&self, message_id: &str) -> Result<Option<MessageData>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT internal_date, body FROM messages WHERE message_id = ?1",
                params![message_id],
                |row| {
                    let internal_date: DateTime<Utc> = row.get(0)?;
                    let body: Vec<u8> = row.get(1)?;
                    Ok(MessageData {
                        internal_date,
                        body,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn put(&self, message_id: &str, data: &MessageData) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR REPLACE INTO messages (message_id, internal_date, body)
             VALUES (?1, ?2, ?3)",
            params![message_id, data.internal_date, data.body],
        )?;
        Ok(())
    }

    pub fn delete(&self, message_id: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM messages WHERE message_id = ?1",
            params![message_id],
        )?;
        Ok(())
    }

    /// Number of cached messages. Used by tests and startup logging.
    pub fn len(&self) -> Result<u64> {
        let conn = self.pool.get()?;
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn sample() -> MessageData {
        MessageData {
            internal_date: Utc.with_ymd_and_hms(2024, 3, 9, 14, 30, 5).unwrap()
                + chrono::Duration::nanoseconds(123_456_000),
            body: b"From: a@b\r\nMessage-Id: <m1@b>\r\n\r\nhello\r\n".to_vec(),
        }
    }

    #[test]
    fn round_trips_body_and_date() {
        let dir = TempDir::new().unwrap();
        let cache = MessageCache::open(dir.path()).unwrap();

        let data = sample();
        cache.put("<m1@b>", &data).unwrap();

        let got = cache.get("<m1@b>").unwrap().unwrap();
        assert_eq!(got.body, data.body);
        assert_eq!(got.internal_date, data.internal_date);
    }

    #[test]
    fn missing_entry_is_none() {
        let dir = TempDir::new().unwrap();
        let cache = MessageCache::open(dir.path()).unwrap();
        assert!(cache.get("<nope@b>").unwrap().is_none());
    }

    #[test]
    fn delete_removes_entry() {
        let dir = TempDir::new().unwrap();
        let cache = MessageCache::open(dir.path()).unwrap();

        cache.put("<m1@b>", &sample()).unwrap();
        assert!(!cache.is_empty().unwrap());

        cache.delete("<m1@b>").unwrap();
        assert!(cache.get("<m1@b>").unwrap().is_none());
        assert!(cache.is_empty().unwrap());
    }

    #[test]
    fn put_overwrites_existing_entry() {
        let dir = TempDir::new().unwrap();
        let cache = MessageCache::open(dir.path()).unwrap();

        cache.put("<m1@b>", &sample()).unwrap();
        let mut updated = sample();
        updated.body = b"replaced".to_vec();
        cache.put("<m1@b>", &updated).unwrap();

        let got = cache.get("<m1@b>").unwrap().unwrap();
        assert_eq!(got.body, b"replaced");
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn clones_share_state() {
        let dir = TempDir::new().unwrap();
        let cache = MessageCache::open(dir.path()).unwrap();
        let other = cache.clone();

        cache.put("<m1@b>", &sample()).unwrap();
        assert!(other.get("<m1@b>").unwrap().is_some());
    }
}
