use atw_core::thread_contracts::{Comment, FileThreadMapping, ThreadState, WorktreeIsolation};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const WORKBENCH_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("thread {thread_id} has branch or worktree path without the other")]
    CorruptIsolation { thread_id: String },
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Persistence for thread state, review comments, and the file→thread
/// ownership map. Single connection, callers serialize writes per key.
pub struct WorkbenchStore {
    conn: Connection,
}

impl WorkbenchStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > WORKBENCH_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: WORKBENCH_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_workbench_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn save_thread(&self, thread: &ThreadState) -> Result<(), StorageError> {
        let whitelist_json = serde_json::to_string(&thread.whitelist_patterns)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let (branch, worktree_path) = match thread.isolation.as_ref() {
            Some(isolation) => (
                Some(isolation.branch.as_str()),
                Some(isolation.worktree_path.to_string_lossy().into_owned()),
            ),
            None => (None, None),
        };

        self.conn.execute(
            "
            INSERT INTO threads (
                thread_id,
                name,
                terminal_id,
                working_dir,
                branch,
                worktree_path,
                whitelist_json,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(thread_id) DO UPDATE SET
                name=excluded.name,
                terminal_id=excluded.terminal_id,
                working_dir=excluded.working_dir,
                branch=excluded.branch,
                worktree_path=excluded.worktree_path,
                whitelist_json=excluded.whitelist_json,
                created_at=excluded.created_at
            ",
            params![
                thread.thread_id,
                thread.name,
                thread.terminal_id,
                thread.working_dir.to_string_lossy().into_owned(),
                branch,
                worktree_path,
                whitelist_json,
                thread.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn thread_by_id(&self, thread_id: &str) -> Result<Option<ThreadState>, StorageError> {
        self.conn
            .query_row(
                &format!("{THREAD_SELECT} WHERE thread_id = ?1"),
                params![thread_id],
                thread_from_row,
            )
            .optional()?
            .transpose()
    }

    pub fn thread_by_terminal(
        &self,
        terminal_id: &str,
    ) -> Result<Option<ThreadState>, StorageError> {
        self.conn
            .query_row(
                &format!("{THREAD_SELECT} WHERE terminal_id = ?1"),
                params![terminal_id],
                thread_from_row,
            )
            .optional()?
            .transpose()
    }

    pub fn all_threads(&self) -> Result<Vec<ThreadState>, StorageError> {
        let mut stmt = self
            .conn
            .prepare(&format!("{THREAD_SELECT} ORDER BY created_at, thread_id"))?;
        let rows = stmt.query_map([], thread_from_row)?;
        let mut threads = Vec::new();
        for row in rows {
            threads.push(row??);
        }
        Ok(threads)
    }

    pub fn delete_thread(&self, thread_id: &str) -> Result<bool, StorageError> {
        let changes = self
            .conn
            .execute("DELETE FROM threads WHERE thread_id = ?1", params![thread_id])?;
        Ok(changes > 0)
    }

    pub fn update_whitelist(
        &self,
        thread_id: &str,
        patterns: &[String],
    ) -> Result<bool, StorageError> {
        let whitelist_json = serde_json::to_string(patterns)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let changes = self.conn.execute(
            "UPDATE threads SET whitelist_json = ?2 WHERE thread_id = ?1",
            params![thread_id, whitelist_json],
        )?;
        Ok(changes > 0)
    }

    pub fn insert_comment(&self, comment: &Comment) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO comments (
                comment_id,
                file,
                line,
                end_line,
                text,
                thread_id,
                is_submitted,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(comment_id) DO UPDATE SET
                file=excluded.file,
                line=excluded.line,
                end_line=excluded.end_line,
                text=excluded.text,
                thread_id=excluded.thread_id,
                is_submitted=excluded.is_submitted,
                created_at=excluded.created_at
            ",
            params![
                comment.comment_id,
                comment.file,
                comment.line,
                comment.end_line,
                comment.text,
                comment.thread_id,
                comment.is_submitted as i64,
                comment.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Unsubmitted comments, oldest first.
    pub fn active_comments(&self) -> Result<Vec<Comment>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT comment_id, file, line, end_line, text, thread_id, is_submitted, created_at
            FROM comments
            WHERE is_submitted = 0
            ORDER BY created_at, comment_id
            ",
        )?;
        let rows = stmt.query_map([], comment_from_row)?;
        let mut comments = Vec::new();
        for row in rows {
            comments.push(row??);
        }
        Ok(comments)
    }

    pub fn mark_comments_submitted(&self, comment_ids: &[String]) -> Result<usize, StorageError> {
        let mut updated = 0;
        for comment_id in comment_ids {
            updated += self.conn.execute(
                "UPDATE comments SET is_submitted = 1 WHERE comment_id = ?1",
                params![comment_id],
            )?;
        }
        Ok(updated)
    }

    pub fn delete_comments_by_thread(&self, thread_id: &str) -> Result<usize, StorageError> {
        Ok(self.conn.execute(
            "DELETE FROM comments WHERE thread_id = ?1",
            params![thread_id],
        )?)
    }

    /// Last writer wins: one owner per file path.
    pub fn upsert_file_owner(
        &self,
        file_path: &str,
        thread_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO file_owners (file_path, thread_id, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(file_path) DO UPDATE SET
                thread_id=excluded.thread_id,
                updated_at=excluded.updated_at
            ",
            params![file_path, thread_id, now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn owner_for_file(&self, file_path: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT thread_id FROM file_owners WHERE file_path = ?1",
                params![file_path],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn all_file_owners(&self) -> Result<Vec<FileThreadMapping>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT file_path, thread_id, updated_at FROM file_owners ORDER BY file_path",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut mappings = Vec::new();
        for row in rows {
            let (file_path, thread_id, updated_at) = row?;
            mappings.push(FileThreadMapping {
                file_path,
                thread_id,
                updated_at: parse_ts(&updated_at)?,
            });
        }
        Ok(mappings)
    }
}

const THREAD_SELECT: &str = "
    SELECT thread_id, name, terminal_id, working_dir, branch, worktree_path,
           whitelist_json, created_at
    FROM threads
";

type ThreadRowResult = Result<ThreadState, StorageError>;

fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<ThreadRowResult> {
    let thread_id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let terminal_id: String = row.get(2)?;
    let working_dir: String = row.get(3)?;
    let branch: Option<String> = row.get(4)?;
    let worktree_path: Option<String> = row.get(5)?;
    let whitelist_json: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    Ok(build_thread(
        thread_id,
        name,
        terminal_id,
        working_dir,
        branch,
        worktree_path,
        whitelist_json,
        created_at,
    ))
}

#[allow(clippy::too_many_arguments)]
fn build_thread(
    thread_id: String,
    name: String,
    terminal_id: String,
    working_dir: String,
    branch: Option<String>,
    worktree_path: Option<String>,
    whitelist_json: String,
    created_at: String,
) -> ThreadRowResult {
    let isolation = match (branch, worktree_path) {
        (Some(branch), Some(worktree_path)) => Some(WorktreeIsolation {
            branch,
            worktree_path: PathBuf::from(worktree_path),
        }),
        (None, None) => None,
        _ => return Err(StorageError::CorruptIsolation { thread_id }),
    };
    let whitelist_patterns: Vec<String> = serde_json::from_str(&whitelist_json)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;

    Ok(ThreadState {
        thread_id,
        name,
        terminal_id,
        working_dir: PathBuf::from(working_dir),
        isolation,
        whitelist_patterns,
        created_at: parse_ts(&created_at)?,
    })
}

type CommentRowResult = Result<Comment, StorageError>;

fn comment_from_row(row: &Row<'_>) -> rusqlite::Result<CommentRowResult> {
    let comment_id: String = row.get(0)?;
    let file: String = row.get(1)?;
    let line: u32 = row.get(2)?;
    let end_line: Option<u32> = row.get(3)?;
    let text: String = row.get(4)?;
    let thread_id: Option<String> = row.get(5)?;
    let is_submitted: i64 = row.get(6)?;
    let created_at: String = row.get(7)?;
    Ok(parse_ts(&created_at).map(|created_at| Comment {
        comment_id,
        file,
        line,
        end_line,
        text,
        thread_id,
        is_submitted: is_submitted != 0,
        created_at,
    }))
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(format!("{raw}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    fn ts(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 10, min, 0)
            .single()
            .expect("valid timestamp")
    }

    fn worktree_thread(n: u32) -> ThreadState {
        ThreadState::new(
            format!("thread-{n}"),
            format!("feature-{n}"),
            format!("term-{n}"),
            format!("/work/repo.worktree/feature-{n}"),
            Some(WorktreeIsolation {
                branch: format!("feature-{n}"),
                worktree_path: format!("/work/repo.worktree/feature-{n}").into(),
            }),
            ts(n),
        )
        .expect("valid thread")
    }

    fn comment(id: &str, file: &str, thread_id: Option<&str>, min: u32) -> Comment {
        Comment {
            comment_id: id.to_string(),
            file: file.to_string(),
            line: 10,
            end_line: None,
            text: format!("comment {id}"),
            thread_id: thread_id.map(str::to_string),
            is_submitted: false,
            created_at: ts(min),
        }
    }

    #[test]
    fn thread_round_trips_by_id_and_terminal() {
        let store = WorkbenchStore::open_in_memory().expect("open store");
        let thread = worktree_thread(1)
            .with_whitelist_pattern("src/**/*.rs")
            .expect("valid pattern");
        store.save_thread(&thread).expect("save");

        let by_id = store
            .thread_by_id("thread-1")
            .expect("load")
            .expect("exists");
        assert_eq!(by_id, thread);

        let by_terminal = store
            .thread_by_terminal("term-1")
            .expect("load")
            .expect("exists");
        assert_eq!(by_terminal.thread_id, "thread-1");

        assert!(store.thread_by_id("missing").expect("load").is_none());
    }

    #[test]
    fn save_replaces_existing_thread_state() {
        let store = WorkbenchStore::open_in_memory().expect("open store");
        let thread = worktree_thread(1);
        store.save_thread(&thread).expect("save");

        let renamed = thread.with_name("renamed").expect("valid rename");
        store.save_thread(&renamed).expect("save again");

        let loaded = store
            .thread_by_id("thread-1")
            .expect("load")
            .expect("exists");
        assert_eq!(loaded.name, "renamed");
        assert_eq!(store.all_threads().expect("list").len(), 1);
    }

    #[test]
    fn delete_thread_reports_whether_anything_was_removed() {
        let store = WorkbenchStore::open_in_memory().expect("open store");
        store.save_thread(&worktree_thread(1)).expect("save");
        assert!(store.delete_thread("thread-1").expect("delete"));
        assert!(!store.delete_thread("thread-1").expect("redelete"));
    }

    #[test]
    fn update_whitelist_persists_patterns() {
        let store = WorkbenchStore::open_in_memory().expect("open store");
        store.save_thread(&worktree_thread(1)).expect("save");
        let patterns = vec![".env*".to_string(), "*.local.json".to_string()];
        assert!(store.update_whitelist("thread-1", &patterns).expect("update"));
        let loaded = store
            .thread_by_id("thread-1")
            .expect("load")
            .expect("exists");
        assert_eq!(loaded.whitelist_patterns, patterns);
        assert!(!store.update_whitelist("missing", &patterns).expect("update"));
    }

    #[test]
    fn active_comments_exclude_submitted_and_order_oldest_first() {
        let store = WorkbenchStore::open_in_memory().expect("open store");
        store
            .insert_comment(&comment("c-2", "src/b.rs", None, 2))
            .expect("insert");
        store
            .insert_comment(&comment("c-1", "src/a.rs", None, 1))
            .expect("insert");

        let active = store.active_comments().expect("list");
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].comment_id, "c-1");

        let marked = store
            .mark_comments_submitted(&["c-1".to_string()])
            .expect("mark");
        assert_eq!(marked, 1);
        let active = store.active_comments().expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].comment_id, "c-2");
    }

    #[test]
    fn delete_comments_by_thread_counts_removed_rows() {
        let store = WorkbenchStore::open_in_memory().expect("open store");
        store
            .insert_comment(&comment("c-1", "src/a.rs", Some("thread-1"), 1))
            .expect("insert");
        store
            .insert_comment(&comment("c-2", "src/b.rs", Some("thread-1"), 2))
            .expect("insert");
        store
            .insert_comment(&comment("c-3", "src/c.rs", Some("thread-2"), 3))
            .expect("insert");

        assert_eq!(
            store.delete_comments_by_thread("thread-1").expect("delete"),
            2
        );
        assert_eq!(store.active_comments().expect("list").len(), 1);
    }

    #[test]
    fn file_owner_last_writer_wins() {
        let store = WorkbenchStore::open_in_memory().expect("open store");
        store
            .upsert_file_owner("src/a.rs", "thread-1", ts(1))
            .expect("upsert");
        store
            .upsert_file_owner("src/a.rs", "thread-2", ts(2))
            .expect("upsert");

        assert_eq!(
            store.owner_for_file("src/a.rs").expect("lookup").as_deref(),
            Some("thread-2")
        );
        assert!(store.owner_for_file("src/b.rs").expect("lookup").is_none());

        let mappings = store.all_file_owners().expect("list");
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].updated_at, ts(2));
    }

    #[test]
    fn on_disk_store_survives_reopen() {
        let db_file = NamedTempFile::new().expect("temp db");
        {
            let store = WorkbenchStore::open(db_file.path()).expect("open store");
            store.save_thread(&worktree_thread(1)).expect("save");
        }
        let store = WorkbenchStore::open(db_file.path()).expect("reopen store");
        assert_eq!(store.schema_version().expect("version"), 1);
        assert!(store.thread_by_id("thread-1").expect("load").is_some());
    }
}
