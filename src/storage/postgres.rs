// Postgres 存储实现：deadpool 连接池 + 同步桥接，语义与 SQLite 实现一致。
use crate::storage::{
    normalize_title, BackendHealth, MessageRecord, MessageRole, StorageBackend, ThreadRecord,
    DEFAULT_THREAD_TITLE, HISTORY_LIMIT, THREAD_LIST_LIMIT,
};
use anyhow::{anyhow, Result};
use chrono::Utc;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;

pub struct PostgresStorage {
    pool: Pool,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
    fallback_runtime: tokio::runtime::Runtime,
}

struct PgConn<'a> {
    storage: &'a PostgresStorage,
    client: deadpool_postgres::Client,
}

impl PgConn<'_> {
    fn batch_execute(&mut self, query: &str) -> Result<()> {
        self.storage.block_on(self.client.batch_execute(query))??;
        Ok(())
    }

    fn execute(&mut self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        Ok(self
            .storage
            .block_on(self.client.execute(query, params))??)
    }

    fn query(
        &mut self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<tokio_postgres::Row>> {
        Ok(self.storage.block_on(self.client.query(query, params))??)
    }

    fn query_opt(
        &mut self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<tokio_postgres::Row>> {
        Ok(self
            .storage
            .block_on(self.client.query_opt(query, params))??)
    }
}

impl PostgresStorage {
    pub fn new(dsn: String, connect_timeout_s: u64, pool_size: usize) -> Result<Self> {
        let cleaned = dsn.trim().to_string();
        if cleaned.is_empty() {
            return Err(anyhow!("postgres dsn is empty"));
        }
        let timeout = Duration::from_secs(connect_timeout_s.max(1));
        let mut config = cleaned.parse::<tokio_postgres::Config>()?;
        config.connect_timeout(timeout);
        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let manager = Manager::from_config(config, NoTls, manager_config);
        let pool = Pool::builder(manager)
            .max_size(pool_size.clamp(1, 64))
            .build()?;
        let fallback_runtime = tokio::runtime::Runtime::new()
            .map_err(|err| anyhow!("create tokio runtime for postgres: {err}"))?;
        Ok(Self {
            pool,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
            fallback_runtime,
        })
    }

    fn block_on<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => Ok(tokio::task::block_in_place(|| handle.block_on(fut))),
            Err(_) => Ok(self.fallback_runtime.block_on(fut)),
        }
    }

    fn now_ts() -> f64 {
        Utc::now().timestamp_millis() as f64 / 1000.0
    }

    fn conn(&self) -> Result<PgConn<'_>> {
        let client = self.block_on(self.pool.get())??;
        Ok(PgConn {
            storage: self,
            client,
        })
    }
}

impl StorageBackend for PostgresStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        // 服务可能先于数据库就绪，建表前重试拿连接。
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let mut conn = match self.conn() {
                Ok(conn) => conn,
                Err(err) => {
                    if attempts >= 5 {
                        return Err(err);
                    }
                    std::thread::sleep(Duration::from_secs(1));
                    continue;
                }
            };
            let result = conn.batch_execute(
                r#"
                CREATE TABLE IF NOT EXISTS users (
                  anon_user_id TEXT PRIMARY KEY,
                  created_at DOUBLE PRECISION NOT NULL
                );
                CREATE TABLE IF NOT EXISTS threads (
                  thread_id TEXT PRIMARY KEY,
                  anon_user_id TEXT NOT NULL
                    REFERENCES users (anon_user_id) ON DELETE CASCADE,
                  title TEXT NOT NULL,
                  created_at DOUBLE PRECISION NOT NULL,
                  updated_at DOUBLE PRECISION NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_threads_user_updated
                  ON threads (anon_user_id, updated_at DESC);
                CREATE TABLE IF NOT EXISTS messages (
                  msg_id TEXT PRIMARY KEY,
                  thread_id TEXT NOT NULL
                    REFERENCES threads (thread_id) ON DELETE CASCADE,
                  role TEXT NOT NULL
                    CHECK (role IN ('user', 'assistant', 'system')),
                  content TEXT,
                  created_at DOUBLE PRECISION NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_messages_thread_created
                  ON messages (thread_id, created_at ASC);
                "#,
            );
            match result {
                Ok(()) => break,
                Err(err) => {
                    if attempts >= 5 {
                        return Err(err);
                    }
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn ensure_user(&self, user_id: &str) -> Result<()> {
        self.ensure_initialized()?;
        let cleaned = user_id.trim();
        if cleaned.is_empty() {
            return Err(anyhow!("user id is empty"));
        }
        let now = Self::now_ts();
        let mut conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (anon_user_id, created_at) VALUES ($1, $2) \
             ON CONFLICT (anon_user_id) DO NOTHING",
            &[&cleaned, &now],
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
        let mut conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (anon_user_id, created_at) VALUES ($1, $2) \
             ON CONFLICT (anon_user_id) DO NOTHING",
            &[&cleaned_user, &now],
        )?;
        conn.execute(
            "INSERT INTO threads (thread_id, anon_user_id, title, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5)",
            &[&cleaned_thread, &cleaned_user, &title, &now, &now],
        )?;
        Ok(())
    }

    fn list_threads(&self, user_id: &str) -> Result<Vec<ThreadRecord>> {
        self.ensure_initialized()?;
        let cleaned = user_id.trim();
        if cleaned.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn()?;
        let rows = conn.query(
            "SELECT thread_id, anon_user_id, title, created_at, updated_at \
             FROM threads WHERE anon_user_id = $1 ORDER BY updated_at DESC LIMIT $2",
            &[&cleaned, &THREAD_LIST_LIMIT],
        )?;
        let records = rows
            .iter()
            .map(|row| ThreadRecord {
                thread_id: row.get(0),
                anon_user_id: row.get(1),
                title: row.get(2),
                created_at: row.get(3),
                updated_at: row.get(4),
            })
            .collect();
        Ok(records)
    }

    fn thread_owned_by(&self, thread_id: &str, user_id: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let cleaned_thread = thread_id.trim();
        let cleaned_user = user_id.trim();
        if cleaned_thread.is_empty() || cleaned_user.is_empty() {
            return Ok(false);
        }
        let mut conn = self.conn()?;
        let row = conn.query_opt(
            "SELECT 1 FROM threads WHERE thread_id = $1 AND anon_user_id = $2",
            &[&cleaned_thread, &cleaned_user],
        )?;
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
        let now = Self::now_ts();
        let mut conn = self.conn()?;
        let affected = conn.execute(
            "UPDATE threads SET title = $1, updated_at = $2 \
             WHERE thread_id = $3 AND anon_user_id = $4",
            &[&title, &now, &cleaned_thread, &cleaned_user],
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
        let now = Self::now_ts();
        let role = role.as_str();
        let mut conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (msg_id, thread_id, role, content, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
            &[&cleaned_msg, &cleaned_thread, &role, &content, &now],
        )?;
        Ok(())
    }

    fn touch_thread(&self, thread_id: &str) -> Result<()> {
        self.ensure_initialized()?;
        let cleaned = thread_id.trim();
        if cleaned.is_empty() {
            return Ok(());
        }
        let now = Self::now_ts();
        let mut conn = self.conn()?;
        conn.execute(
            "UPDATE threads SET updated_at = $1 WHERE thread_id = $2",
            &[&now, &cleaned],
        )?;
        Ok(())
    }

    fn get_history(&self, thread_id: &str) -> Result<Vec<MessageRecord>> {
        self.ensure_initialized()?;
        let cleaned = thread_id.trim();
        if cleaned.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn()?;
        let rows = conn.query(
            "SELECT msg_id, thread_id, role, content, created_at \
             FROM messages WHERE thread_id = $1 ORDER BY created_at ASC LIMIT $2",
            &[&cleaned, &HISTORY_LIMIT],
        )?;
        let records = rows
            .iter()
            .map(|row| MessageRecord {
                msg_id: row.get(0),
                thread_id: row.get(1),
                role: row.get(2),
                content: row.get(3),
                created_at: row.get(4),
            })
            .collect();
        Ok(records)
    }

    fn health_check(&self) -> BackendHealth {
        let reachable = self
            .conn()
            .and_then(|mut conn| conn.query_opt("SELECT 1", &[]))
            .is_ok();
        BackendHealth {
            backend: "postgres",
            reachable,
        }
    }
}
