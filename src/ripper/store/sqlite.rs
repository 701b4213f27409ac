//! SQLite-backed store
//!
//! One connection guarded by a mutex; the store trait is synchronous and
//! every statement is short. The schema is versioned through
//! `PRAGMA user_version`.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{error, info};

use super::{Store, StoreError, StoreResult};
use crate::ripper::models::{
    Image, ImageStatus, LogEvent, LogEventKind, LogEventStatus, Post, PostStatus, QueuedGroup,
};

/// Current schema version
const SCHEMA_VERSION: u32 = 2;

const POST_COLUMNS: &str = "id, post_id, thread_id, title, url, thread_title, forum, submitter, \
     total, done, status, download_directory, thanked, hosts, previews, added_at, alt_titles";
const IMAGE_COLUMNS: &str = "id, post_id, url, thumb_url, host, idx, current, total, status";
const QUEUED_COLUMNS: &str = "id, thread_id, link, total";
const LOG_COLUMNS: &str = "id, kind, status, time, message";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database file and bring its schema up to date
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
        info!("Opened database {}", path.display());
        Self::with_connection(conn)
    }

    pub fn in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn get_schema_version(conn: &Connection) -> StoreResult<u32> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn initialize_schema(conn: &Connection) -> StoreResult<()> {
    let version = get_schema_version(conn)?;
    if version > SCHEMA_VERSION {
        error!("Database schema version {} is newer than supported version {}", version, SCHEMA_VERSION);
        return Err(StoreError::Corrupt(format!(
            "schema version {} is newer than supported version {}",
            version, SCHEMA_VERSION
        )));
    }
    if version == SCHEMA_VERSION {
        return Ok(());
    }
    if version == 1 {
        conn.execute_batch(&format!(
            "ALTER TABLE posts ADD COLUMN alt_titles TEXT NOT NULL DEFAULT '[]';
             PRAGMA user_version = {}",
            SCHEMA_VERSION
        ))?;
        info!("Database schema migrated from version {} to {}", version, SCHEMA_VERSION);
        return Ok(());
    }

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS posts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            post_id TEXT NOT NULL UNIQUE,
            thread_id TEXT NOT NULL,
            title TEXT NOT NULL,
            url TEXT NOT NULL,
            thread_title TEXT NOT NULL,
            forum TEXT NOT NULL,
            submitter TEXT NOT NULL,
            total INTEGER NOT NULL,
            done INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            download_directory TEXT,
            thanked INTEGER NOT NULL DEFAULT 0,
            hosts TEXT NOT NULL,
            previews TEXT NOT NULL,
            added_at TEXT NOT NULL,
            alt_titles TEXT NOT NULL DEFAULT '[]'
        );
        CREATE TABLE IF NOT EXISTS images (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            post_id TEXT NOT NULL REFERENCES posts(post_id) ON DELETE CASCADE,
            url TEXT NOT NULL,
            thumb_url TEXT NOT NULL,
            host TEXT NOT NULL,
            idx INTEGER NOT NULL,
            current INTEGER NOT NULL DEFAULT 0,
            total INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_images_post_id ON images(post_id);
        CREATE INDEX IF NOT EXISTS idx_images_status ON images(status);
        CREATE TABLE IF NOT EXISTS queued (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            thread_id TEXT NOT NULL UNIQUE,
            link TEXT NOT NULL,
            total INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS log_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            time TEXT NOT NULL,
            message TEXT NOT NULL
        );",
    )?;
    conn.execute_batch(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))?;
    info!("Database schema initialized to version {}", SCHEMA_VERSION);
    Ok(())
}

fn conversion_error<E>(idx: usize, error: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(error))
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn post_from_row(row: &Row<'_>) -> rusqlite::Result<Post> {
    Ok(Post {
        id: row.get(0)?,
        post_id: row.get(1)?,
        thread_id: row.get(2)?,
        title: row.get(3)?,
        url: row.get(4)?,
        thread_title: row.get(5)?,
        forum: row.get(6)?,
        submitter: row.get(7)?,
        total: row.get(8)?,
        done: row.get(9)?,
        status: parse_column(row, 10)?,
        download_directory: row.get(11)?,
        thanked: row.get(12)?,
        hosts: json_column(row, 13)?,
        previews: json_column(row, 14)?,
        added_at: time_column(row, 15)?,
        alt_titles: json_column(row, 16)?,
    })
}

fn image_from_row(row: &Row<'_>) -> rusqlite::Result<Image> {
    Ok(Image {
        id: row.get(0)?,
        post_id: row.get(1)?,
        url: row.get(2)?,
        thumb_url: row.get(3)?,
        host: row.get(4)?,
        index: row.get(5)?,
        current: row.get::<_, i64>(6)?.max(0) as u64,
        total: row.get::<_, i64>(7)?.max(0) as u64,
        status: parse_column(row, 8)?,
    })
}

fn queued_from_row(row: &Row<'_>) -> rusqlite::Result<QueuedGroup> {
    Ok(QueuedGroup {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        link: row.get(2)?,
        total: row.get(3)?,
    })
}

fn log_event_from_row(row: &Row<'_>) -> rusqlite::Result<LogEvent> {
    Ok(LogEvent {
        id: row.get(0)?,
        kind: parse_column::<LogEventKind>(row, 1)?,
        status: parse_column::<LogEventStatus>(row, 2)?,
        time: time_column(row, 3)?,
        message: row.get(4)?,
    })
}

fn expect_changed(changed: usize, what: impl FnOnce() -> String) -> StoreResult<()> {
    if changed == 0 {
        Err(StoreError::NotFound(what()))
    } else {
        Ok(())
    }
}

impl Store for SqliteStore {
    fn insert_post(&self, post: &Post, images: &[Image]) -> StoreResult<(Post, Vec<Image>)> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let exists: Option<i64> = tx
            .query_row("SELECT id FROM posts WHERE post_id = ?1", [&post.post_id], |row| row.get(0))
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::Duplicate(format!("post {}", post.post_id)));
        }

        tx.execute(
            "INSERT INTO posts (post_id, thread_id, title, url, thread_title, forum, submitter,
                total, done, status, download_directory, thanked, hosts, previews, added_at, alt_titles)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                post.post_id,
                post.thread_id,
                post.title,
                post.url,
                post.thread_title,
                post.forum,
                post.submitter,
                post.total,
                post.done,
                post.status.as_str(),
                post.download_directory,
                post.thanked,
                serde_json::to_string(&post.hosts)?,
                serde_json::to_string(&post.previews)?,
                post.added_at.to_rfc3339(),
                serde_json::to_string(&post.alt_titles)?,
            ],
        )?;
        let mut stored_post = post.clone();
        stored_post.id = tx.last_insert_rowid();

        let mut stored_images = Vec::with_capacity(images.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO images (post_id, url, thumb_url, host, idx, current, total, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for image in images {
                stmt.execute(params![
                    post.post_id,
                    image.url,
                    image.thumb_url,
                    image.host,
                    image.index,
                    image.current as i64,
                    image.total as i64,
                    image.status.as_str(),
                ])?;
                let mut stored = image.clone();
                stored.id = tx.last_insert_rowid();
                stored.post_id = post.post_id.clone();
                stored_images.push(stored);
            }
        }

        tx.commit()?;
        Ok((stored_post, stored_images))
    }

    fn find_post(&self, post_id: &str) -> StoreResult<Option<Post>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM posts WHERE post_id = ?1", POST_COLUMNS);
        Ok(conn.query_row(&sql, [post_id], post_from_row).optional()?)
    }

    fn find_post_by_id(&self, id: i64) -> StoreResult<Option<Post>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM posts WHERE id = ?1", POST_COLUMNS);
        Ok(conn.query_row(&sql, [id], post_from_row).optional()?)
    }

    fn all_posts(&self) -> StoreResult<Vec<Post>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM posts ORDER BY id", POST_COLUMNS))?;
        let posts = stmt.query_map([], post_from_row)?.collect::<Result<Vec<_>, _>>()?;
        Ok(posts)
    }

    fn find_posts_by_status(&self, status: PostStatus) -> StoreResult<Vec<Post>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM posts WHERE status = ?1 ORDER BY id",
            POST_COLUMNS
        ))?;
        let posts = stmt
            .query_map([status.as_str()], post_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(posts)
    }

    fn update_post_status(&self, post_id: &str, status: PostStatus) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE posts SET status = ?1 WHERE post_id = ?2",
            params![status.as_str(), post_id],
        )?;
        expect_changed(changed, || format!("post {}", post_id))
    }

    fn update_post_done(&self, post_id: &str, done: u32) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE posts SET done = MIN(?1, total) WHERE post_id = ?2",
            params![done, post_id],
        )?;
        expect_changed(changed, || format!("post {}", post_id))
    }

    fn increment_post_done(&self, post_id: &str) -> StoreResult<u32> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE posts SET done = MIN(done + 1, total) WHERE post_id = ?1",
            [post_id],
        )?;
        expect_changed(changed, || format!("post {}", post_id))?;
        Ok(conn.query_row("SELECT done FROM posts WHERE post_id = ?1", [post_id], |row| row.get(0))?)
    }

    fn update_post_download_directory(&self, post_id: &str, directory: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE posts SET download_directory = ?1 WHERE post_id = ?2",
            params![directory, post_id],
        )?;
        expect_changed(changed, || format!("post {}", post_id))
    }

    fn update_post_alt_titles(&self, post_id: &str, titles: &[String]) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE posts SET alt_titles = ?1 WHERE post_id = ?2",
            params![serde_json::to_string(titles)?, post_id],
        )?;
        expect_changed(changed, || format!("post {}", post_id))
    }

    fn update_post_thanked(&self, post_id: &str, thanked: bool) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE posts SET thanked = ?1 WHERE post_id = ?2",
            params![thanked, post_id],
        )?;
        expect_changed(changed, || format!("post {}", post_id))
    }

    fn delete_post(&self, post_id: &str) -> StoreResult<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM images WHERE post_id = ?1", [post_id])?;
        let removed = tx.execute("DELETE FROM posts WHERE post_id = ?1", [post_id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn find_image(&self, id: i64) -> StoreResult<Option<Image>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM images WHERE id = ?1", IMAGE_COLUMNS);
        Ok(conn.query_row(&sql, [id], image_from_row).optional()?)
    }

    fn images_of_post(&self, post_id: &str) -> StoreResult<Vec<Image>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM images WHERE post_id = ?1 ORDER BY idx",
            IMAGE_COLUMNS
        ))?;
        let images = stmt
            .query_map([post_id], image_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(images)
    }

    fn count_images_with_status(&self, status: ImageStatus) -> StoreResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM images WHERE status = ?1",
            [status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn update_image_status(&self, id: i64, status: ImageStatus) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE images SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        expect_changed(changed, || format!("image {}", id))
    }

    fn update_image_progress(&self, id: i64, current: u64, total: u64) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE images SET current = ?1, total = ?2 WHERE id = ?3",
            params![current as i64, total as i64, id],
        )?;
        expect_changed(changed, || format!("image {}", id))
    }

    fn insert_queued(&self, queued: &QueuedGroup) -> StoreResult<QueuedGroup> {
        let conn = self.conn.lock();
        let exists: Option<i64> = conn
            .query_row("SELECT id FROM queued WHERE thread_id = ?1", [&queued.thread_id], |row| row.get(0))
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::Duplicate(format!("thread {}", queued.thread_id)));
        }
        conn.execute(
            "INSERT INTO queued (thread_id, link, total) VALUES (?1, ?2, ?3)",
            params![queued.thread_id, queued.link, queued.total],
        )?;
        let mut stored = queued.clone();
        stored.id = conn.last_insert_rowid();
        Ok(stored)
    }

    fn find_queued(&self, thread_id: &str) -> StoreResult<Option<QueuedGroup>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM queued WHERE thread_id = ?1", QUEUED_COLUMNS);
        Ok(conn.query_row(&sql, [thread_id], queued_from_row).optional()?)
    }

    fn find_queued_by_id(&self, id: i64) -> StoreResult<Option<QueuedGroup>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM queued WHERE id = ?1", QUEUED_COLUMNS);
        Ok(conn.query_row(&sql, [id], queued_from_row).optional()?)
    }

    fn all_queued(&self) -> StoreResult<Vec<QueuedGroup>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM queued ORDER BY id", QUEUED_COLUMNS))?;
        let queued = stmt.query_map([], queued_from_row)?.collect::<Result<Vec<_>, _>>()?;
        Ok(queued)
    }

    fn delete_queued(&self, thread_id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM queued WHERE thread_id = ?1", [thread_id])? > 0)
    }

    fn insert_log_event(&self, event: &LogEvent) -> StoreResult<LogEvent> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO log_events (kind, status, time, message) VALUES (?1, ?2, ?3, ?4)",
            params![
                event.kind.as_str(),
                event.status.as_str(),
                event.time.to_rfc3339(),
                event.message
            ],
        )?;
        let mut stored = event.clone();
        stored.id = conn.last_insert_rowid();
        Ok(stored)
    }

    fn update_log_event(&self, event: &LogEvent) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE log_events SET kind = ?1, status = ?2, time = ?3, message = ?4 WHERE id = ?5",
            params![
                event.kind.as_str(),
                event.status.as_str(),
                event.time.to_rfc3339(),
                event.message,
                event.id
            ],
        )?;
        expect_changed(changed, || format!("log event {}", event.id))
    }

    fn find_log_event(&self, id: i64) -> StoreResult<Option<LogEvent>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM log_events WHERE id = ?1", LOG_COLUMNS);
        Ok(conn.query_row(&sql, [id], log_event_from_row).optional()?)
    }

    fn all_log_events(&self) -> StoreResult<Vec<LogEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM log_events ORDER BY id", LOG_COLUMNS))?;
        let events = stmt.query_map([], log_event_from_row)?.collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    fn delete_log_events(&self) -> StoreResult<Vec<i64>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare("SELECT id FROM log_events ORDER BY id")?;
            stmt.query_map([], |row| row.get(0))?.collect::<Result<Vec<i64>, _>>()?
        };
        tx.execute("DELETE FROM log_events", [])?;
        tx.commit()?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ripper::tests::{image, post};
    use tempfile::tempdir;

    #[test]
    fn test_post_and_images_round_trip() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("data/ripper.sqlite")).unwrap();

        let mut original = post("42", 2);
        original.hosts = vec!["imagetwist.com".to_string()];
        original.previews = vec!["https://t/1.jpg".to_string()];
        let (stored, images) = store
            .insert_post(&original, &[image("42", "https://imagetwist.com/a", 1), image("42", "https://imagetwist.com/b", 2)])
            .unwrap();

        let loaded = store.find_post("42").unwrap().unwrap();
        assert_eq!(loaded.id, stored.id);
        assert_eq!(loaded.hosts, original.hosts);
        assert_eq!(loaded.status, original.status);
        assert_eq!(loaded.added_at.timestamp(), original.added_at.timestamp());

        store.update_image_progress(images[1].id, 512, 1024).unwrap();
        store.update_image_status(images[1].id, ImageStatus::Complete).unwrap();
        let reloaded = store.find_image(images[1].id).unwrap().unwrap();
        assert_eq!((reloaded.current, reloaded.total), (512, 1024));
        assert_eq!(store.images_not_completed("42").unwrap().len(), 1);
        assert_eq!(store.count_images_with_status(ImageStatus::Complete).unwrap(), 1);
    }

    #[test]
    fn test_failed_insert_leaves_no_rows() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_post(&post("1", 1), &[image("1", "https://imagetwist.com/a", 1)]).unwrap();

        let err = store
            .insert_post(&post("1", 1), &[image("1", "https://imagetwist.com/b", 1)])
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
        assert_eq!(store.images_of_post("1").unwrap().len(), 1);
    }

    #[test]
    fn test_done_increment_is_capped() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_post(&post("1", 1), &[]).unwrap();
        assert_eq!(store.increment_post_done("1").unwrap(), 1);
        assert_eq!(store.increment_post_done("1").unwrap(), 1);
        assert!(matches!(store.increment_post_done("missing"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_log_events_and_queued() {
        let store = SqliteStore::in_memory().unwrap();
        let mut event = store
            .insert_log_event(&LogEvent::new(LogEventKind::Scan, LogEventStatus::Pending, "scanning"))
            .unwrap();
        event.status = LogEventStatus::Done;
        store.update_log_event(&event).unwrap();
        assert_eq!(store.find_log_event(event.id).unwrap().unwrap().status, LogEventStatus::Done);
        assert_eq!(store.delete_log_events().unwrap(), vec![event.id]);

        let queued = store
            .insert_queued(&QueuedGroup { id: 0, thread_id: "9".into(), link: "l".into(), total: 3 })
            .unwrap();
        assert_eq!(store.find_queued("9").unwrap().unwrap().id, queued.id);
        assert!(store.delete_queued("9").unwrap());
        assert!(store.all_queued().unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ripper.sqlite");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_post(&post("7", 0), &[]).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.exists_post("7").unwrap());
    }

    #[test]
    fn test_alt_titles_are_stored() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_post(&post("3", 0), &[]).unwrap();
        assert!(store.find_post("3").unwrap().unwrap().alt_titles.is_empty());

        let titles = vec!["Beach Day".to_string(), "Sunset".to_string()];
        store.update_post_alt_titles("3", &titles).unwrap();
        assert_eq!(store.find_post("3").unwrap().unwrap().alt_titles, titles);
        assert!(matches!(store.update_post_alt_titles("missing", &titles), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_version_one_database_gains_alt_titles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old.sqlite");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE posts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    post_id TEXT NOT NULL UNIQUE,
                    thread_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    url TEXT NOT NULL,
                    thread_title TEXT NOT NULL,
                    forum TEXT NOT NULL,
                    submitter TEXT NOT NULL,
                    total INTEGER NOT NULL,
                    done INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL,
                    download_directory TEXT,
                    thanked INTEGER NOT NULL DEFAULT 0,
                    hosts TEXT NOT NULL,
                    previews TEXT NOT NULL,
                    added_at TEXT NOT NULL
                );
                INSERT INTO posts (post_id, thread_id, title, url, thread_title, forum, submitter,
                    total, status, hosts, previews, added_at)
                VALUES ('8', '1', 'Old', 'u', 't', 'f', '', 0, 'STOPPED', '[]', '[]', '2024-01-01T00:00:00+00:00');
                PRAGMA user_version = 1;",
            )
            .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.find_post("8").unwrap().unwrap();
        assert_eq!(loaded.title, "Old");
        assert!(loaded.alt_titles.is_empty());
    }
}
