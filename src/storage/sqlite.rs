// SQLite 存储实现：单文件 WAL 库，适合单机部署与本地开发。
use crate::storage::{
    normalize_title, BackendHealth, MessageRecord, MessageRole, StorageBackend, ThreadRecord,
    DEFAULT_THREAD_TITLE, HISTORY_LIMIT, THREAD_LIST_LIMIT,
};
use anyhow::{anyhow, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct SqliteStorage {
    db_path: PathBuf,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
}

impl SqliteStorage {
    pub fn new(db_path: String) -> Self {
        let path = if db_path.trim().is_empty() {
            PathBuf::from("./data/warble.db")
        } else {
            PathBuf::from(db_path)
        };
        Self {
            db_path: path,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
        }
    }

    fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn open(&self) -> Result<Connection> {
        self.ensure_db_dir()?;
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        // 级联删除依赖外键约束，逐连接开启。
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        Ok(conn)
    }

    fn now_ts() -> f64 {
        Utc::now().timestamp_millis() as f64 / 1000.0
    }
}

impl StorageBackend for SqliteStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
              anon_user_id TEXT PRIMARY KEY,
              created_at REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS threads (
              thread_id TEXT PRIMARY KEY,
              anon_user_id TEXT NOT NULL
                REFERENCES users (anon_user_id) ON DELETE CASCADE,
              title TEXT NOT NULL,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_threads_user_updated
              ON threads (anon_user_id, updated_at DESC);
            CREATE TABLE IF NOT EXISTS messages (
              msg_id TEXT PRIMARY KEY,
              thread_id TEXT NOT NULL
                REFERENCES threads (thread_id) ON DELETE CASCADE,
              role TEXT NOT NULL,
              content TEXT,
              created_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_thread_created
              ON messages (thread_id, created_at ASC);
            "#,
        )?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn ensure_user(&self, user_id: &str) -> Result<()> {
        self.ensure_initialized()?;
        let cleaned = user_id.trim();
        if cleaned.is_empty() {
            return Err(anyhow!("user id is empty"));
        }
        let conn = self.open()?;
        conn.execute(
            "INSERT OR IGNORE INTO users (anon_user_id, created_at) VALUES (?, ?)",
            params![cleaned, Self::now_ts()],
        )?;
        Ok(())
    }

    fn create_thread(&self, thread_id: &str, user_id: &str, title: &str) -> Result<()> {
        self.ensure_initialized()?;
        let cleaned_thread = thread_id.trim();
        let cleaned_user = user_id.trim();
        if cleaned_thread.is_empty() || cleaned_user.is_empty() {
            return Err(anyhow!("thread id or user id is empty"));
        }
        let title =
            normalize_title(title).unwrap_or_else(|| DEFAULT_THREAD_TITLE.to_string());
        let now = Self::now_ts();
        let conn = self.open()?;
        conn.execute(
            "INSERT OR IGNORE INTO users (anon_user_id, created_at) VALUES (?, ?)",
            params![cleaned_user, now],
        )?;
        conn.execute(
            "INSERT INTO threads (thread_id, anon_user_id, title, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
            params![cleaned_thread, cleaned_user, title, now, now],
        )?;
        Ok(())
    }

    fn list_threads(&self, user_id: &str) -> Result<Vec<ThreadRecord>> {
        self.ensure_initialized()?;
        let cleaned = user_id.trim();
        if cleaned.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT thread_id, anon_user_id, title, created_at, updated_at \
             FROM threads WHERE anon_user_id = ? ORDER BY updated_at DESC LIMIT ?",
        )?;
        let rows = stmt
            .query_map(params![cleaned, THREAD_LIST_LIMIT], |row| {
                Ok(ThreadRecord {
                    thread_id: row.get(0)?,
                    anon_user_id: row.get(1)?,
                    title: row.get(2)?,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<ThreadRecord>, _>>()?;
        Ok(rows)
    }

    fn thread_owned_by(&self, thread_id: &str, user_id: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let cleaned_thread = thread_id.trim();
        let cleaned_user = user_id.trim();
        if cleaned_thread.is_empty() || cleaned_user.is_empty() {
            return Ok(false);
        }
        let conn = self.open()?;
        let row: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM threads WHERE thread_id = ? AND anon_user_id = ?",
                params![cleaned_thread, cleaned_user],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    fn rename_thread(&self, thread_id: &str, user_id: &str, title: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let cleaned_thread = thread_id.trim();
        let cleaned_user = user_id.trim();
        if cleaned_thread.is_empty() || cleaned_user.is_empty() {
            return Ok(false);
        }
        let Some(title) = normalize_title(title) else {
            return Err(anyhow!("thread title is empty"));
        };
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE threads SET title = ?, updated_at = ? \
             WHERE thread_id = ? AND anon_user_id = ?",
            params![title, Self::now_ts(), cleaned_thread, cleaned_user],
        )?;
        Ok(affected > 0)
    }

    fn insert_message(
        &self,
        msg_id: &str,
        thread_id: &str,
        role: MessageRole,
        content: Option<&str>,
    ) -> Result<()> {
        self.ensure_initialized()?;
        let cleaned_msg = msg_id.trim();
        let cleaned_thread = thread_id.trim();
        if cleaned_msg.is_empty() || cleaned_thread.is_empty() {
            return Err(anyhow!("message id or thread id is empty"));
        }
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO messages (msg_id, thread_id, role, content, created_at) \
             VALUES (?, ?, ?, ?, ?)",
            params![
                cleaned_msg,
                cleaned_thread,
                role.as_str(),
                content,
                Self::now_ts()
            ],
        )?;
        Ok(())
    }

    fn touch_thread(&self, thread_id: &str) -> Result<()> {
        self.ensure_initialized()?;
        let cleaned = thread_id.trim();
        if cleaned.is_empty() {
            return Ok(());
        }
        let conn = self.open()?;
        conn.execute(
            "UPDATE threads SET updated_at = ? WHERE thread_id = ?",
            params![Self::now_ts(), cleaned],
        )?;
        Ok(())
    }

    fn get_history(&self, thread_id: &str) -> Result<Vec<MessageRecord>> {
        self.ensure_initialized()?;
        let cleaned = thread_id.trim();
        if cleaned.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT msg_id, thread_id, role, content, created_at \
             FROM messages WHERE thread_id = ? ORDER BY created_at ASC LIMIT ?",
        )?;
        let rows = stmt
            .query_map(params![cleaned, HISTORY_LIMIT], |row| {
                Ok(MessageRecord {
                    msg_id: row.get(0)?,
                    thread_id: row.get(1)?,
                    role: row.get(2)?,
                    content: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<MessageRecord>, _>>()?;
        Ok(rows)
    }

    fn health_check(&self) -> BackendHealth {
        let reachable = self
            .open()
            .and_then(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                    .map_err(anyhow::Error::from)
            })
            .is_ok();
        BackendHealth {
            backend: "sqlite",
            reachable,
        }
    }
}
