// 存储模块：封装 SQLite/Postgres/内存三种后端，提供统一的线程/消息读写接口。

mod memory;
mod postgres;
mod sqlite;

use crate::config::StorageConfig;
use anyhow::{anyhow, Result};
use std::sync::Arc;

pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;
pub use sqlite::SqliteStorage;

/// 新建线程的默认标题。
pub const DEFAULT_THREAD_TITLE: &str = "New chat";
/// 标题截断长度（按字符计）。
pub const MAX_TITLE_CHARS: usize = 80;
/// 线程列表单次返回上限。
pub const THREAD_LIST_LIMIT: i64 = 100;
/// 历史消息单次返回上限。
pub const HISTORY_LIMIT: i64 = 500;

#[derive(Debug, Clone)]
pub struct ThreadRecord {
    pub thread_id: String,
    pub anon_user_id: String,
    pub title: String,
    pub created_at: f64,
    pub updated_at: f64,
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub msg_id: String,
    pub thread_id: String,
    pub role: String,
    pub content: Option<String>,
    pub created_at: f64,
}

/// 消息角色。后端一律通过本枚举写入，不接受任意字符串。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendHealth {
    pub backend: &'static str,
    pub reachable: bool,
}

/// 归一化线程标题：去除首尾空白并截断到 80 个字符；全空白返回 None。
pub fn normalize_title(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_TITLE_CHARS).collect())
}

/// 存储后端抽象。三种实现共享同一组操作语义：
/// 线程归属校验、按 updated_at 倒序的列表、按 created_at 正序的历史。
pub trait StorageBackend: Send + Sync {
    /// 幂等建表（含索引）；内存后端为空操作。
    fn ensure_initialized(&self) -> Result<()>;

    /// 不存在则插入用户，已存在时无副作用。
    fn ensure_user(&self, user_id: &str) -> Result<()>;

    /// 创建线程，隐式确保其归属用户存在。空标题落为默认标题。
    fn create_thread(&self, thread_id: &str, user_id: &str, title: &str) -> Result<()>;

    /// 按 updated_at 倒序列出用户线程，上限 100 条。
    fn list_threads(&self, user_id: &str) -> Result<Vec<ThreadRecord>>;

    /// 线程是否归属该用户；线程不存在同样返回 false。
    fn thread_owned_by(&self, thread_id: &str, user_id: &str) -> Result<bool>;

    /// 重命名线程并刷新 updated_at。标题按 normalize_title 处理，
    /// 全空白标题报错；线程不存在或归属不符返回 Ok(false)。
    fn rename_thread(&self, thread_id: &str, user_id: &str, title: &str) -> Result<bool>;

    /// 追加一条消息。只增不删，不提供更新。
    fn insert_message(
        &self,
        msg_id: &str,
        thread_id: &str,
        role: MessageRole,
        content: Option<&str>,
    ) -> Result<()>;

    /// 将线程 updated_at 刷新为当前时间。
    fn touch_thread(&self, thread_id: &str) -> Result<()>;

    /// 按 created_at 正序返回线程历史，上限 500 条。
    fn get_history(&self, thread_id: &str) -> Result<Vec<MessageRecord>>;

    /// 后端类型与可达性，仅用于运维诊断，不返回错误。
    fn health_check(&self) -> BackendHealth;
}

/// 构建存储后端，根据 backend 配置选择 SQLite/Postgres/内存实现。
pub fn build_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    let backend = config.backend.trim().to_lowercase();
    let backend = if backend.is_empty() {
        "sqlite".to_string()
    } else {
        backend
    };
    match backend.as_str() {
        "sqlite" | "default" => Ok(Arc::new(SqliteStorage::new(
            config.db_path.trim().to_string(),
        ))),
        "postgres" | "postgresql" | "pg" | "auto" => Ok(Arc::new(PostgresStorage::new(
            config.postgres.dsn.clone(),
            config.postgres.connect_timeout_s,
            config.postgres.pool_size,
        )?)),
        "memory" | "transient" => Ok(Arc::new(MemoryStorage::new())),
        other => Err(anyhow!("unknown storage backend: {other}")),
    }
}
